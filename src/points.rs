use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bma_ts::Timestamp;
use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::locking::Mutex;
use crate::{Error, Result};

/// One of the four Modbus memory areas
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Area {
    /// Coils (read/write bits)
    #[serde(rename = "CO")]
    Coil,
    /// Discrete inputs (read-only bits)
    #[serde(rename = "DI")]
    Discrete,
    /// Input registers (read-only 16-bit words)
    #[serde(rename = "IR")]
    Input,
    /// Holding registers (read/write 16-bit words)
    #[serde(rename = "HR")]
    Holding,
}

impl Area {
    /// All four areas
    pub const ALL: [Area; 4] = [Area::Coil, Area::Discrete, Area::Input, Area::Holding];
    /// True for bit areas (CO, DI)
    pub fn is_bit(self) -> bool {
        matches!(self, Area::Coil | Area::Discrete)
    }
    /// True for areas writable from external paths (HR, CO). Input registers and discrete
    /// inputs accept data from the internal simulation path only.
    pub fn is_writable(self) -> bool {
        matches!(self, Area::Coil | Area::Holding)
    }
    /// The area code used on the wire of the management surface
    pub fn as_str(self) -> &'static str {
        match self {
            Area::Coil => "CO",
            Area::Discrete => "DI",
            Area::Input => "IR",
            Area::Holding => "HR",
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Area {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "co" | "c" | "coil" => Ok(Area::Coil),
            "di" | "d" | "discrete" => Ok(Area::Discrete),
            "ir" | "i" | "input" => Ok(Area::Input),
            "hr" | "h" | "holding" => Ok(Area::Holding),
            _ => Err(Error::invalid_data(format!("invalid area: {}", s))),
        }
    }
}

impl TryFrom<&str> for Area {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

/// Point quality
#[derive(
    Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    /// The value is valid
    Ok,
    /// The value is known to be wrong
    Bad,
    /// The value is outdated
    Stale,
    /// The point has not been written yet
    #[default]
    Unknown,
}

/// A single addressable datum. For register areas the value is a full 16-bit word, for bit
/// areas it is 0/1.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct Point {
    /// The stored value
    pub value: u16,
    /// Point quality, switches to [`Quality::Ok`] on any successful write
    pub quality: Quality,
    /// The instant of the last mutation (UTC)
    pub timestamp: Timestamp,
}

impl Point {
    fn new(value: u16) -> Self {
        Self {
            value,
            quality: Quality::Unknown,
            timestamp: Timestamp::now(),
        }
    }
}

/// Normalizes a raw register value. Values in `[-32768, -1]` are reinterpreted as
/// `value + 65536`, values in `[0, 65535]` are stored as-is, anything else is rejected.
pub fn normalize_word(raw: i32) -> Result<u16> {
    match raw {
        v if (0..=i32::from(u16::MAX)).contains(&v) => Ok(v as u16),
        v if (i32::from(i16::MIN)..0).contains(&v) => Ok((v + 65_536) as u16),
        v => Err(Error::OutOfRange(v.into())),
    }
}

/// Normalizes a raw value for the given area: words per [`normalize_word`], bits to 0/1 (any
/// nonzero input is 1)
pub fn normalize(area: Area, raw: i32) -> Result<u16> {
    if area.is_bit() {
        Ok(u16::from(raw != 0))
    } else {
        normalize_word(raw)
    }
}

#[derive(Default)]
struct AreaTable {
    coils: Vec<Point>,
    discretes: Vec<Point>,
    inputs: Vec<Point>,
    holdings: Vec<Point>,
}

impl AreaTable {
    fn area(&self, area: Area) -> &[Point] {
        match area {
            Area::Coil => &self.coils,
            Area::Discrete => &self.discretes,
            Area::Input => &self.inputs,
            Area::Holding => &self.holdings,
        }
    }
    fn area_mut(&mut self, area: Area) -> &mut Vec<Point> {
        match area {
            Area::Coil => &mut self.coils,
            Area::Discrete => &mut self.discretes,
            Area::Input => &mut self.inputs,
            Area::Holding => &mut self.holdings,
        }
    }
}

/// The authoritative in-memory table of all points.
///
/// Area sizes are fixed at construction, the set of valid addresses never changes during a
/// run. A single mutex covers all four areas; the lock is a leaf - no other lock is ever
/// acquired while it is held.
pub struct PointStore {
    table: Mutex<AreaTable>,
}

impl PointStore {
    /// Creates the store from the memory configuration. Every point starts with the
    /// (normalized) default value, [`Quality::Unknown`] and the construction timestamp.
    pub fn create(memory: &MemoryConfig) -> Result<Self> {
        let word = normalize_word(memory.default_value)?;
        let bit = u16::from(memory.default_value != 0);
        let mut table = AreaTable::default();
        for (area, count) in [
            (Area::Coil, memory.coil_count),
            (Area::Discrete, memory.di_count),
            (Area::Input, memory.ir_count),
            (Area::Holding, memory.hr_count),
        ] {
            let value = if area.is_bit() { bit } else { word };
            *table.area_mut(area) = (0..count).map(|_| Point::new(value)).collect();
        }
        Ok(Self {
            table: Mutex::new(table),
        })
    }
    /// The configured size of the given area
    pub fn len(&self, area: Area) -> u16 {
        self.table.lock().area(area).len() as u16
    }
    /// True if the given area is empty
    pub fn is_empty(&self, area: Area) -> bool {
        self.len(area) == 0
    }
    /// Returns a snapshot copy of a single point
    pub fn read(&self, area: Area, address: u16) -> Result<Point> {
        self.table
            .lock()
            .area(area)
            .get(usize::from(address))
            .copied()
            .ok_or(Error::NotFound)
    }
    /// Writes a raw value into a point of a writable area (HR, CO), normalizing it first.
    /// The value, quality and timestamp are updated atomically.
    pub fn write(&self, area: Area, address: u16, raw: i32) -> Result<()> {
        if !area.is_writable() {
            return Err(Error::AccessDenied);
        }
        self.store(area, address, raw)
    }
    /// The internal simulation write path: same as [`PointStore::write`] but permitted on
    /// any area, including input registers and discrete inputs.
    pub fn simulate(&self, area: Area, address: u16, raw: i32) -> Result<()> {
        self.store(area, address, raw)
    }
    fn store(&self, area: Area, address: u16, raw: i32) -> Result<()> {
        let value = normalize(area, raw)?;
        let mut table = self.table.lock();
        let point = table
            .area_mut(area)
            .get_mut(usize::from(address))
            .ok_or(Error::NotFound)?;
        *point = Point {
            value,
            quality: Quality::Ok,
            timestamp: Timestamp::now(),
        };
        Ok(())
    }
    /// Updates the quality of a point (and its timestamp) without touching the value. A
    /// no-op if the address is not present.
    pub fn set_quality(&self, area: Area, address: u16, quality: Quality) {
        let mut table = self.table.lock();
        if let Some(point) = table.area_mut(area).get_mut(usize::from(address)) {
            point.quality = quality;
            point.timestamp = Timestamp::now();
        }
    }
    /// Returns a deep copy of the whole area, the caller may mutate it freely
    pub fn snapshot(&self, area: Area) -> BTreeMap<u16, Point> {
        self.table
            .lock()
            .area(area)
            .iter()
            .enumerate()
            .map(|(addr, point)| (addr as u16, *point))
            .collect()
    }
    /// Returns all points of the area mutated strictly after the given instant. The strict
    /// comparison lets a polling collector advance its cursor to the newest returned
    /// timestamp without re-reading the same points.
    pub fn changed_since(&self, area: Area, since: Timestamp) -> BTreeMap<u16, Point> {
        self.table
            .lock()
            .area(area)
            .iter()
            .enumerate()
            .filter(|(_, point)| point.timestamp > since)
            .map(|(addr, point)| (addr as u16, *point))
            .collect()
    }
    /// Raw area contents, ordered by address (the engine loads its data blocks from these)
    pub(crate) fn raw_values(&self, area: Area) -> Vec<u16> {
        self.table
            .lock()
            .area(area)
            .iter()
            .map(|point| point.value)
            .collect()
    }
}
