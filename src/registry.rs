use std::collections::BTreeMap;

use bma_ts::Timestamp;
use serde::Serialize;

use crate::locking::Mutex;

/// The synthetic client key used for operations with no TCP peer behind them (management
/// surface writes, internal value feeds)
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Per-client-IP accounting record
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    /// Client IP address (or [`UNKNOWN_CLIENT`])
    pub ip: String,
    /// When the client was first observed
    pub first_seen: Timestamp,
    /// When the client was last observed
    pub last_seen: Timestamp,
    /// Served read operations
    pub reads: u64,
    /// Served write operations
    pub writes: u64,
}

impl ConnectionRecord {
    fn new(ip: &str) -> Self {
        let now = Timestamp::now();
        Self {
            ip: ip.to_owned(),
            first_seen: now,
            last_seen: now,
            reads: 0,
            writes: 0,
        }
    }
}

/// Per-client-IP request accounting. Records are created on first sight and never removed;
/// the registry itself is recreated on every engine start.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: Mutex<BTreeMap<String, ConnectionRecord>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }
    /// Accounts one served operation for the given client
    pub fn tally(&self, ip: &str, is_write: bool) {
        let mut clients = self.clients.lock();
        let record = clients
            .entry(ip.to_owned())
            .or_insert_with(|| ConnectionRecord::new(ip));
        record.last_seen = Timestamp::now();
        if is_write {
            record.writes += 1;
        } else {
            record.reads += 1;
        }
    }
    /// Returns a deep copy of the accounting table for status reports
    pub fn snapshot(&self) -> BTreeMap<String, ConnectionRecord> {
        self.clients.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::ConnectionRegistry;

    #[test]
    fn test_tally() {
        let registry = ConnectionRegistry::new();
        registry.tally("10.0.0.1", false);
        registry.tally("10.0.0.1", false);
        registry.tally("10.0.0.1", true);
        registry.tally("10.0.0.2", true);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        let first = snapshot.get("10.0.0.1").unwrap();
        assert_eq!(first.reads, 2);
        assert_eq!(first.writes, 1);
        assert!(first.last_seen >= first.first_seen);
        let second = snapshot.get("10.0.0.2").unwrap();
        assert_eq!(second.reads, 0);
        assert_eq!(second.writes, 1);
    }
}
