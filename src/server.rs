use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rmodbus::server::context::ModbusContext as _;
use rmodbus::server::storage::ModbusStorage;
use rmodbus::server::{Changes, ModbusFrame};
use rmodbus::{ErrorKind, ModbusFrameBuf, ModbusProto};
use tracing::{debug, error, info, warn};

use crate::config::{Config, DeviceConfig};
use crate::locking::Mutex;
use crate::points::{self, Area, PointStore};
use crate::registry::{ConnectionRegistry, UNKNOWN_CLIENT};
use crate::semaphore::Semaphore;
use crate::{debug_enabled, Error, Result, POLL_STEP};

/// Fixed capacity of each data block area. Configured area counts may not exceed it; the
/// served address range is still bounded by the configured counts.
pub const AREA_CAPACITY: usize = 10_000;

type Storage = ModbusStorage<AREA_CAPACITY, AREA_CAPACITY, AREA_CAPACITY, AREA_CAPACITY>;

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    shutdown: AtomicBool,
    startup_error: Mutex<Option<Error>>,
}

#[derive(Clone, Copy)]
struct AreaSizes {
    coils: u16,
    discretes: u16,
    inputs: u16,
    holdings: u16,
}

impl AreaSizes {
    fn len(&self, area: Area) -> u16 {
        match area {
            Area::Coil => self.coils,
            Area::Discrete => self.discretes,
            Area::Input => self.inputs,
            Area::Holding => self.holdings,
        }
    }
    fn contains(&self, area: Area, reg: u16, count: u16) -> bool {
        u32::from(reg) + u32::from(count) <= u32::from(self.len(area))
    }
}

/// The Modbus TCP server engine.
///
/// The engine serves a single unit id over TCP, one worker thread per client connection
/// (bounded by `max_clients`). Its data blocks are initialized from the point store at
/// construction; every write arriving from the wire is mirrored back into the point store,
/// so side-channel observers see Modbus writes immediately.
///
/// [`ModbusServer::run`] blocks and is normally spawned by the lifecycle manager; the
/// engine is controlled through its [`ServerHandle`].
pub struct ModbusServer {
    addr: String,
    unit: u8,
    timeout: Duration,
    max_clients: usize,
    device: DeviceConfig,
    sizes: AreaSizes,
    storage: Arc<Mutex<Storage>>,
    store: Arc<PointStore>,
    registry: Arc<ConnectionRegistry>,
    shared: Arc<Shared>,
}

impl ModbusServer {
    /// Creates a new engine over the given point store and connection registry. The data
    /// blocks are loaded from the current point store contents.
    pub fn create(
        config: &Config,
        store: Arc<PointStore>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let sizes = AreaSizes {
            coils: store.len(Area::Coil),
            discretes: store.len(Area::Discrete),
            inputs: store.len(Area::Input),
            holdings: store.len(Area::Holding),
        };
        let mut storage = Storage::default();
        for area in Area::ALL {
            for (addr, value) in store.raw_values(area).into_iter().enumerate() {
                let addr = addr as u16;
                match area {
                    Area::Coil => storage.set_coil(addr, value != 0),
                    Area::Discrete => storage.set_discrete(addr, value != 0),
                    Area::Input => storage.set_input(addr, value),
                    Area::Holding => storage.set_holding(addr, value),
                }?;
            }
        }
        Ok(Self {
            addr: config.modbus.listen_addr(),
            unit: config.modbus.unit_id,
            timeout: config.modbus.timeout(),
            max_clients: config.modbus.max_clients,
            device: config.device.clone(),
            sizes,
            storage: Arc::new(Mutex::new(storage)),
            store,
            registry,
            shared: Arc::new(Shared::default()),
        })
    }
    /// Returns a control handle for the engine
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            sizes: self.sizes,
            storage: self.storage.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            shared: self.shared.clone(),
        }
    }
    /// Runs the engine. This function blocks the current thread.
    ///
    /// Binding happens here, on the engine thread: a bind failure is stored in the startup
    /// error slot of the handle and the thread exits. The running flag is raised only after
    /// a successful bind, immediately before the accept loop, and is cleared on exit.
    pub fn run(&mut self) {
        let listener = match self.bind() {
            Ok(v) => v,
            Err(e) => {
                error!(addr = %self.addr, error = %e, "modbus server startup failed");
                self.shared.startup_error.lock().replace(e);
                return;
            }
        };
        info!(addr = %self.addr, unit = self.unit, "modbus server listening");
        info!(
            vendor = %self.device.vendor_name,
            product = %self.device.product_name,
            code = %self.device.product_code,
            url = %self.device.vendor_url,
            revision = %self.device.revision,
            "device identity"
        );
        self.shared.running.store(true, Ordering::Relaxed);
        self.serve(&listener);
        // release the listening socket before reporting the engine down, so an immediate
        // rebind cannot race with a lingering listener
        drop(listener);
        self.shared.running.store(false, Ordering::Relaxed);
        info!(addr = %self.addr, "modbus server stopped");
    }
    fn bind(&self) -> Result<TcpListener> {
        // the standard library enables SO_REUSEADDR on Unix listeners, so restarts do not
        // stall in TIME_WAIT
        let listener = TcpListener::bind(&self.addr).map_err(|e| Error::startup(e))?;
        // non-blocking accept, the loop polls the shutdown flag between attempts
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::startup(e))?;
        Ok(listener)
    }
    fn serve(&self, listener: &TcpListener) {
        let semaphore = Semaphore::new(self.max_clients);
        loop {
            if self.shared.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Some(permission) = semaphore.try_acquire() else {
                thread::sleep(POLL_STEP);
                continue;
            };
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = prepare_tcp_stream(&stream, self.timeout) {
                        error!(%addr, %e, "error preparing tcp stream");
                        continue;
                    }
                    let ctx = SessionCtx {
                        unit: self.unit,
                        sizes: self.sizes,
                        storage: self.storage.clone(),
                        store: self.store.clone(),
                        registry: self.registry.clone(),
                        shared: self.shared.clone(),
                    };
                    thread::spawn(move || {
                        let _permission = permission;
                        let ip = addr.ip().to_string();
                        if let Err(error) = handle_client(stream, &ip, &ctx) {
                            error!(%addr, %error, "error handling Modbus client");
                        }
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_STEP);
                }
                Err(e) => {
                    error!(%e, "accept error");
                    thread::sleep(POLL_STEP);
                }
            }
        }
    }
}

fn prepare_tcp_stream(stream: &TcpStream, timeout: Duration) -> Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    Ok(())
}

struct SessionCtx {
    unit: u8,
    sizes: AreaSizes,
    storage: Arc<Mutex<Storage>>,
    store: Arc<PointStore>,
    registry: Arc<ConnectionRegistry>,
    shared: Arc<Shared>,
}

fn read_area(func: u8) -> Option<Area> {
    match func {
        1 => Some(Area::Coil),
        2 => Some(Area::Discrete),
        3 => Some(Area::Holding),
        4 => Some(Area::Input),
        _ => None,
    }
}

fn handle_client<T: Read + Write>(mut client: T, ip: &str, ctx: &SessionCtx) -> Result<()> {
    let mut buf: ModbusFrameBuf = [0; 256];
    let mut response = Vec::with_capacity(256);
    loop {
        if ctx.shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if client.read(&mut buf).unwrap_or(0) == 0 {
            break;
        }
        response.truncate(0);
        let mut frame = ModbusFrame::new(ctx.unit, &buf, ModbusProto::TcpUdp, &mut response);
        frame.parse().map_err(Error::io)?;
        if frame.processing_required {
            if frame.readonly {
                process_read_request(&mut frame, ip, ctx)?;
            } else {
                process_write_request(&mut frame, ip, ctx)?;
            }
        }
        if frame.response_required {
            frame.finalize_response().map_err(Error::io)?;
            client.write_all(&response).map_err(Error::io)?;
        }
    }
    Ok(())
}

fn process_read_request(
    frame: &mut ModbusFrame<Vec<u8>>,
    ip: &str,
    ctx: &SessionCtx,
) -> Result<()> {
    let (reg, count) = (frame.reg, frame.count);
    if let Some(area) = read_area(frame.func) {
        if !ctx.sizes.contains(area, reg, count) {
            frame.set_modbus_error_if_unset(&ErrorKind::IllegalDataAddress)?;
            return Ok(());
        }
        frame.process_read(&*ctx.storage.lock()).map_err(Error::io)?;
        if debug_enabled() {
            let values = block_values(&ctx.storage, area, reg, count).unwrap_or_default();
            debug!(area = %area, op = "READ", reg, count, ?values);
        }
        ctx.registry.tally(ip, false);
    } else {
        frame.process_read(&*ctx.storage.lock()).map_err(Error::io)?;
    }
    Ok(())
}

fn process_write_request(
    frame: &mut ModbusFrame<Vec<u8>>,
    ip: &str,
    ctx: &SessionCtx,
) -> Result<()> {
    let in_range = match frame.changes() {
        Some(Changes::Coils { reg, count }) => ctx.sizes.contains(Area::Coil, reg, count),
        Some(Changes::Holdings { reg, count }) => ctx.sizes.contains(Area::Holding, reg, count),
        None => true,
    };
    if !in_range {
        frame.set_modbus_error_if_unset(&ErrorKind::IllegalDataAddress)?;
        return Ok(());
    }
    frame
        .process_write(&mut *ctx.storage.lock())
        .map_err(Error::io)?;
    if let Some(changes) = frame.changes() {
        mirror_changes(ctx, changes, ip);
    }
    ctx.registry.tally(ip, true);
    Ok(())
}

/// Pushes a block range just written from the wire into the point store. The point store is
/// the external truth: failures here are logged but never abort the protocol response.
fn mirror_changes(ctx: &SessionCtx, changes: Changes, ip: &str) {
    let (area, reg, count) = match changes {
        Changes::Coils { reg, count } => (Area::Coil, reg, count),
        Changes::Holdings { reg, count } => (Area::Holding, reg, count),
    };
    let values = match block_values(&ctx.storage, area, reg, count) {
        Ok(v) => v,
        Err(e) => {
            warn!(area = %area, reg, count, %e, "unable to read back the written range");
            return;
        }
    };
    for (i, value) in values.iter().enumerate() {
        let address = reg + i as u16;
        if let Err(e) = ctx.store.write(area, address, i32::from(*value)) {
            warn!(area = %area, address, %e, "point store sync failed");
        }
    }
    if debug_enabled() {
        debug!(area = %area, op = "WRITE", reg, count, ?values, client = ip);
    }
}

fn block_values(storage: &Mutex<Storage>, area: Area, reg: u16, count: u16) -> Result<Vec<u16>> {
    let storage = storage.lock();
    let mut values = Vec::with_capacity(usize::from(count));
    for addr in reg..reg.saturating_add(count) {
        let value = match area {
            Area::Coil => u16::from(storage.get_coil(addr)?),
            Area::Discrete => u16::from(storage.get_discrete(addr)?),
            Area::Input => storage.get_input(addr)?,
            Area::Holding => storage.get_holding(addr)?,
        };
        values.push(value);
    }
    Ok(values)
}

/// A cloneable engine control handle: lifecycle flags plus the side-channel point access
/// paths used by the management surface.
#[derive(Clone)]
pub struct ServerHandle {
    sizes: AreaSizes,
    storage: Arc<Mutex<Storage>>,
    store: Arc<PointStore>,
    registry: Arc<ConnectionRegistry>,
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// True between a successful bind and the serve loop exit
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }
    /// True if the engine thread failed before entering the serve loop
    pub fn startup_failed(&self) -> bool {
        self.shared.startup_error.lock().is_some()
    }
    /// Takes the startup error, if any
    pub fn take_startup_error(&self) -> Option<Error> {
        self.shared.startup_error.lock().take()
    }
    /// Requests the serve loop to exit and the listening socket to be closed. Idempotent:
    /// calling it on an already stopped engine is a no-op.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::Relaxed) {
            info!("modbus server shutdown requested");
        }
    }
    /// The point store served by this engine
    pub fn store(&self) -> &PointStore {
        &self.store
    }
    /// A deep copy of the connection accounting table
    pub fn connections(&self) -> BTreeMap<String, crate::registry::ConnectionRecord> {
        self.registry.snapshot()
    }
    /// Writes a point from the management surface. Input registers and discrete inputs are
    /// refused. The point store is updated first (it is the external truth), the engine data
    /// block second; the write is accounted under the synthetic client key.
    pub fn write_point(&self, area: Area, address: u16, value: i32) -> Result<()> {
        if !area.is_writable() {
            return Err(Error::AccessDenied);
        }
        self.store.write(area, address, value)?;
        self.sync_block(area, address, value)
    }
    /// The internal simulation write path: permitted on any area, including input registers
    /// and discrete inputs
    pub fn simulate(&self, area: Area, address: u16, value: i32) -> Result<()> {
        self.store.simulate(area, address, value)?;
        self.sync_block(area, address, value)
    }
    fn sync_block(&self, area: Area, address: u16, raw: i32) -> Result<()> {
        if !self.sizes.contains(area, address, 1) {
            return Err(Error::NotFound);
        }
        let value = points::normalize(area, raw)?;
        {
            let mut storage = self.storage.lock();
            match area {
                Area::Coil => storage.set_coil(address, value != 0),
                Area::Discrete => storage.set_discrete(address, value != 0),
                Area::Input => storage.set_input(address, value),
                Area::Holding => storage.set_holding(address, value),
            }?;
        }
        if debug_enabled() {
            debug!(area = %area, op = "WRITE", address, value, client = UNKNOWN_CLIENT);
        }
        self.registry.tally(UNKNOWN_CLIENT, true);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::ModbusServer;
    use crate::config::Config;
    use crate::points::{Area, PointStore, Quality};
    use crate::registry::ConnectionRegistry;
    use crate::testsup::{wait_for, TestClient};

    fn test_config(port: u16) -> Config {
        let mut config = Config::default();
        config.modbus.host = "127.0.0.1".to_owned();
        config.modbus.port = port;
        config.memory.hr_count = 10;
        config.memory.coil_count = 4;
        config.memory.di_count = 4;
        config.memory.ir_count = 4;
        config
    }

    fn start_engine(config: &Config) -> (super::ServerHandle, thread::JoinHandle<()>) {
        let store = Arc::new(PointStore::create(&config.memory).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let mut server = ModbusServer::create(config, store, registry).unwrap();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run());
        assert!(
            wait_for(|| handle.is_running(), Duration::from_secs(3)),
            "engine did not start"
        );
        (handle, thread)
    }

    #[test]
    fn test_read_write_mirror() {
        let config = test_config(25020);
        let (handle, thread) = start_engine(&config);
        let mut client = TestClient::connect("127.0.0.1:25020", 1);
        client.write_holding(0, 999).unwrap();
        client.write_holding(9, 1234).unwrap();
        assert_eq!(
            client.read_holdings(0, 10).unwrap(),
            vec![999, 0, 0, 0, 0, 0, 0, 0, 0, 1234]
        );
        // the writes are mirrored into the point store
        let point = handle.store().read(Area::Holding, 0).unwrap();
        assert_eq!(point.value, 999);
        assert_eq!(point.quality, Quality::Ok);
        // ...while untouched points keep their initial quality
        let point = handle.store().read(Area::Holding, 1).unwrap();
        assert_eq!(point.quality, Quality::Unknown);
        let connections = handle.connections();
        let record = connections.get("127.0.0.1").unwrap();
        assert!(record.reads >= 1);
        assert!(record.writes >= 2);
        handle.shutdown();
        handle.shutdown(); // idempotent
        thread.join().unwrap();
        assert!(!handle.is_running());
    }

    #[test]
    fn test_bulk_writes_and_coils() {
        let config = test_config(25021);
        let (handle, thread) = start_engine(&config);
        let mut client = TestClient::connect("127.0.0.1:25021", 1);
        client.write_holdings(2, &[7, 8, 9]).unwrap();
        assert_eq!(client.read_holdings(2, 3).unwrap(), vec![7, 8, 9]);
        client.write_coil(1, true).unwrap();
        assert_eq!(client.read_coils(0, 4).unwrap(), vec![0, 1, 0, 0]);
        assert_eq!(handle.store().read(Area::Coil, 1).unwrap().value, 1);
        assert_eq!(handle.store().read(Area::Holding, 3).unwrap().value, 8);
        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_out_of_range_requests() {
        let config = test_config(25022);
        let (handle, thread) = start_engine(&config);
        let mut client = TestClient::connect("127.0.0.1:25022", 1);
        // the configured area is 10 holdings, the block capacity is larger: requests
        // beyond the configured count must be refused with exception 0x02
        // (Illegal Data Address) on the wire
        const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
        assert!(client.read_holdings(8, 3).is_err());
        assert_eq!(client.last_exception(), Some(ILLEGAL_DATA_ADDRESS));
        assert!(client.read_coils(4, 1).is_err());
        assert_eq!(client.last_exception(), Some(ILLEGAL_DATA_ADDRESS));
        assert!(client.write_holding(10, 1).is_err());
        assert_eq!(client.last_exception(), Some(ILLEGAL_DATA_ADDRESS));
        // in-range requests keep working on the same connection
        assert_eq!(client.read_holdings(8, 2).unwrap(), vec![0, 0]);
        assert_eq!(client.last_exception(), None);
        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_simulated_inputs() {
        let config = test_config(25023);
        let (handle, thread) = start_engine(&config);
        handle.simulate(Area::Input, 2, 555).unwrap();
        handle.simulate(Area::Discrete, 0, 1).unwrap();
        let mut client = TestClient::connect("127.0.0.1:25023", 1);
        assert_eq!(client.read_inputs(0, 4).unwrap(), vec![0, 0, 555, 0]);
        assert_eq!(client.read_discretes(0, 4).unwrap(), vec![1, 0, 0, 0]);
        // the management path refuses read-only areas...
        assert!(handle.write_point(Area::Input, 0, 1).is_err());
        // ...and unknown addresses
        assert!(handle.write_point(Area::Holding, 10, 1).is_err());
        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_default_value_preload() {
        let mut config = test_config(25024);
        config.memory.default_value = 17;
        let store = Arc::new(PointStore::create(&config.memory).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let mut server = ModbusServer::create(&config, store, registry).unwrap();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run());
        assert!(wait_for(|| handle.is_running(), Duration::from_secs(3)));
        let mut client = TestClient::connect("127.0.0.1:25024", 1);
        assert_eq!(client.read_holdings(0, 3).unwrap(), vec![17, 17, 17]);
        // bit areas normalize the default to 0/1
        assert_eq!(client.read_coils(0, 2).unwrap(), vec![1, 1]);
        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_startup_error() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:25025").unwrap();
        let config = test_config(25025);
        let store = Arc::new(PointStore::create(&config.memory).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let mut server = ModbusServer::create(&config, store, registry).unwrap();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run());
        assert!(
            wait_for(|| handle.startup_failed(), Duration::from_secs(3)),
            "bind error was not reported"
        );
        assert!(!handle.is_running());
        assert!(handle.take_startup_error().is_some());
        thread.join().unwrap();
        drop(blocker);
    }
}
