use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bma_ts::{Monotonic, Timestamp};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Config, WatchdogConfig};
use crate::locking::Mutex;
use crate::points::{Area, Point, PointStore, Quality};
use crate::registry::{ConnectionRecord, ConnectionRegistry};
use crate::server::{ModbusServer, ServerHandle};
use crate::supervisor::Supervisor;
use crate::tasks::Builder;
use crate::watchdog::Watchdog;
use crate::{debug_enabled, Error, Result, POLL_STEP};

/// Engine readiness deadline for [`Driver::start`]
const START_TIMEOUT: Duration = Duration::from_secs(3);
/// The pause between stop and start in [`Driver::restart`], letting the OS release the
/// listening socket
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Driver lifecycle state
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum State {
    /// The engine is not running
    Stopped,
    /// A start is in progress
    Starting,
    /// The engine is serving
    Running,
    /// A stop is in progress
    Stopping,
    /// The last start attempt failed
    Failed,
}

/// Driver statistics counters
#[derive(Debug, Copy, Clone, Default, Serialize)]
pub struct Stats {
    /// Successful starts
    pub starts: u64,
    /// Operator-initiated stops
    pub stops: u64,
    /// Start failures and other accounted errors
    pub errors: u64,
}

/// A driver status report
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// True if the engine is serving
    pub running: bool,
    /// The lifecycle state
    pub state: State,
    /// Seconds since the last successful start, None when not running
    pub uptime: Option<u64>,
    /// The process-wide tracing flag
    pub debug: bool,
    /// Statistics counters
    pub stats: Stats,
    /// Per-client-IP accounting of the current engine
    pub connections: BTreeMap<String, ConnectionRecord>,
}

pub(crate) struct Runtime {
    pub(crate) config: Config,
    pub(crate) lifecycle: State,
    pub(crate) manual_stop: bool,
    pub(crate) stats: Stats,
    pub(crate) engine: Option<ServerHandle>,
    pub(crate) started_at: Option<Monotonic>,
    pub(crate) retries: u32,
}

impl Runtime {
    pub(crate) fn engine_running(&self) -> bool {
        self.engine.as_ref().map_or(false, ServerHandle::is_running)
    }
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<Runtime>,
    pub(crate) supervisor: Mutex<Supervisor<()>>,
    pub(crate) watchdog_armed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(engine) = self.state.get_mut().engine.take() {
            engine.shutdown();
        }
    }
}

/// The driver lifecycle manager.
///
/// Owns the point store and the engine, provides the operations a control surface adapter
/// needs: start/stop/restart, status, the tracing toggle and side-channel point access.
/// The handle is cheap to clone; all control operations serialize on a single internal
/// lock.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<Inner>,
}

impl Driver {
    /// Creates a new driver with the given resolved configuration. Nothing is started yet.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Runtime {
                    config,
                    lifecycle: State::Stopped,
                    manual_stop: false,
                    stats: Stats::default(),
                    engine: None,
                    started_at: None,
                    retries: 0,
                }),
                supervisor: Mutex::new(Supervisor::new()),
                watchdog_armed: AtomicBool::new(false),
            }),
        }
    }
    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }
    /// Starts the engine.
    ///
    /// Constructs a fresh point store and connection registry from the current
    /// configuration, spawns the engine thread and waits (up to 3 seconds) for it to either
    /// become ready or report a startup error. Arms the watchdog if enabled.
    ///
    /// Returns false if the driver is already running or the start failed; failures
    /// increment the `errors` counter.
    pub fn start(&self) -> bool {
        let mut rt = self.inner.state.lock();
        if rt.engine_running() {
            warn!("the driver is already running");
            return false;
        }
        rt.lifecycle = State::Starting;
        rt.manual_stop = false;
        match self.spawn_engine(&rt.config) {
            Ok(engine) => {
                rt.engine = Some(engine);
                rt.lifecycle = State::Running;
                rt.started_at = Some(Monotonic::now());
                rt.stats.starts += 1;
                let watchdog = rt.config.watchdog.clone();
                info!("modbus driver started");
                drop(rt);
                if watchdog.enabled {
                    self.arm_watchdog(&watchdog);
                }
                true
            }
            Err(e) => {
                error!(error = %e, "unable to start the modbus driver");
                rt.lifecycle = State::Failed;
                rt.stats.errors += 1;
                rt.engine = None;
                rt.started_at = None;
                false
            }
        }
    }
    fn spawn_engine(&self, config: &Config) -> Result<ServerHandle> {
        config.validate()?;
        let store = Arc::new(PointStore::create(&config.memory)?);
        let registry = Arc::new(ConnectionRegistry::new());
        let mut server = ModbusServer::create(config, store, registry)?;
        let handle = server.handle();
        {
            let mut supervisor = self.inner.supervisor.lock();
            supervisor.purge();
            supervisor.spawn(Builder::new().name("modbus-srv").blocking(true), move || {
                server.run();
            })?;
        }
        let start = Monotonic::now();
        loop {
            if let Some(e) = handle.take_startup_error() {
                handle.shutdown();
                return Err(e);
            }
            if handle.is_running() {
                break;
            }
            if start.elapsed() >= START_TIMEOUT {
                handle.shutdown();
                return Err(Error::startup("the engine did not become ready in time"));
            }
            thread::sleep(POLL_STEP);
        }
        Ok(handle)
    }
    /// Stops the engine. Returns false if the driver is not running.
    ///
    /// The stop is recorded as operator-initiated, so the armed watchdog idles instead of
    /// restarting the engine.
    pub fn stop(&self) -> bool {
        let mut rt = self.inner.state.lock();
        if !rt.engine_running() {
            warn!("the driver is not running");
            return false;
        }
        rt.lifecycle = State::Stopping;
        rt.manual_stop = true;
        if let Some(engine) = rt.engine.take() {
            engine.shutdown();
        }
        rt.stats.stops += 1;
        rt.started_at = None;
        rt.lifecycle = State::Stopped;
        info!("modbus driver stopped");
        true
    }
    /// Stops the engine, waits a couple of seconds and starts it again. Returns the start
    /// result.
    pub fn restart(&self) -> bool {
        info!("restarting the modbus driver");
        self.stop();
        thread::sleep(RESTART_DELAY);
        self.inner.state.lock().manual_stop = false;
        self.start()
    }
    /// Returns the current status report
    pub fn status(&self) -> Status {
        let rt = self.inner.state.lock();
        let running = rt.engine_running();
        Status {
            running,
            state: rt.lifecycle,
            uptime: rt
                .started_at
                .filter(|_| running)
                .map(|t| t.elapsed().as_secs()),
            debug: debug_enabled(),
            stats: rt.stats,
            connections: rt
                .engine
                .as_ref()
                .map(ServerHandle::connections)
                .unwrap_or_default(),
        }
    }
    /// Flips the process-wide tracing flag consulted by the engine read/write paths
    pub fn set_debug(&self, enabled: bool) {
        crate::set_debug(enabled);
        info!(enabled, "point tracing switched");
    }
    /// A copy of the current configuration
    pub fn config(&self) -> Config {
        self.inner.state.lock().config.clone()
    }
    /// Replaces the configuration. The new record is applied on the next start or restart.
    pub fn set_config(&self, config: Config) {
        self.inner.state.lock().config = config;
        info!("configuration replaced, applied on the next start");
    }
    fn engine(&self) -> Result<ServerHandle> {
        let rt = self.inner.state.lock();
        match rt.engine {
            Some(ref engine) if engine.is_running() => Ok(engine.clone()),
            _ => Err(Error::Unavailable),
        }
    }
    /// Reads a single point
    pub fn point(&self, area: Area, address: u16) -> Result<Point> {
        self.engine()?.store().read(area, address)
    }
    /// A snapshot copy of the whole area
    pub fn points(&self, area: Area) -> Result<BTreeMap<u16, Point>> {
        Ok(self.engine()?.store().snapshot(area))
    }
    /// All points of the area mutated strictly after the given instant
    pub fn changed_points(&self, area: Area, since: Timestamp) -> Result<BTreeMap<u16, Point>> {
        Ok(self.engine()?.store().changed_since(area, since))
    }
    /// Writes a point from the management surface (read-only areas are refused)
    pub fn write_point(&self, area: Area, address: u16, value: i32) -> Result<()> {
        self.engine()?.write_point(area, address, value)
    }
    /// Writes a simulated field value into any area, including input registers and
    /// discrete inputs
    pub fn simulate(&self, area: Area, address: u16, value: i32) -> Result<()> {
        self.engine()?.simulate(area, address, value)
    }
    /// Overrides the quality of a point without touching its value
    pub fn set_quality(&self, area: Area, address: u16, quality: Quality) -> Result<()> {
        self.engine()?.store().set_quality(area, address, quality);
        Ok(())
    }
    fn arm_watchdog(&self, config: &WatchdogConfig) {
        if self.inner.watchdog_armed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.inner.state.lock().retries = 0;
        let watchdog = Watchdog::create(Arc::downgrade(&self.inner), config);
        let mut supervisor = self.inner.supervisor.lock();
        supervisor.purge();
        match supervisor.spawn(Builder::new().name("watchdog").blocking(true), move || {
            watchdog.run();
        }) {
            Ok(_) => debug!("watchdog armed"),
            Err(e) => {
                self.inner.watchdog_armed.store(false, Ordering::Relaxed);
                error!(error = %e, "unable to start the watchdog");
            }
        }
    }
}
