use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;
use crate::manager::{Driver, Inner};

/// The background supervisor armed by the manager after a successful start. Once per
/// interval it inspects the engine under the manager lock; a dead engine that was not
/// stopped by the operator is restarted, up to the retry ceiling.
pub(crate) struct Watchdog {
    manager: Weak<Inner>,
    interval: Duration,
    max_retries: u32,
}

impl Watchdog {
    pub(crate) fn create(manager: Weak<Inner>, config: &WatchdogConfig) -> Self {
        Self {
            manager,
            interval: config.interval(),
            max_retries: config.max_retries,
        }
    }
    pub(crate) fn run(self) {
        info!("watchdog started");
        loop {
            thread::sleep(self.interval);
            // the back-reference never extends the manager lifetime: once the manager is
            // dropped, the watchdog exits
            let Some(inner) = self.manager.upgrade() else {
                break;
            };
            if !inner.watchdog_armed.load(Ordering::Relaxed) {
                break;
            }
            // inspect under the manager lock, but restart only after releasing it:
            // restart() re-acquires the same lock
            let restart_needed = {
                let mut rt = inner.state.lock();
                if rt.engine_running() {
                    if rt.retries > 0 {
                        info!("watchdog: the engine is back to normal, resetting the retry counter");
                        rt.retries = 0;
                    }
                    false
                } else if rt.manual_stop {
                    debug!("watchdog: manual stop detected, ignoring");
                    false
                } else if self.max_retries > 0 && rt.retries >= self.max_retries {
                    error!(
                        max_retries = self.max_retries,
                        "watchdog retry ceiling reached, monitoring terminated"
                    );
                    inner.watchdog_armed.store(false, Ordering::Relaxed);
                    break;
                } else {
                    rt.retries += 1;
                    warn!(
                        attempt = rt.retries,
                        "watchdog: engine failure detected, restarting the driver"
                    );
                    true
                }
            };
            if restart_needed && !Driver::from_inner(inner).restart() {
                error!("watchdog: the restart attempt failed");
            }
        }
        info!("watchdog stopped");
    }
}
