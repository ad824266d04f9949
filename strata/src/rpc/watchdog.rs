use bedrock::logging::{self, Logger};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

struct WatchdogShared {
    period: Duration,
    last_fed: Mutex<Instant>,
    log: Logger,
}

/// Feed-channel handle for the RPC server watchdog.
///
/// The dispatcher feeds it around every command; long-running commands
/// feed it from their inner loops. A monitor thread flags starvation.
#[derive(Clone)]
pub struct Watchdog {
    shared: Arc<WatchdogShared>,
}

impl Watchdog {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(period: Duration, log: L) -> Watchdog {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "watchdog")),
            _ => logging::discard(),
        };

        Watchdog {
            shared: Arc::new(WatchdogShared {
                period,
                last_fed: Mutex::new(Instant::now()),
                log,
            }),
        }
    }

    #[inline]
    pub fn feed(&self) {
        *self.shared.last_fed.lock().expect("Watchdog lock poisoned") = Instant::now();
    }

    #[inline]
    pub fn starved(&self) -> bool {
        self.shared.last_fed.lock().expect("Watchdog lock poisoned").elapsed() > self.shared.period
    }

    /// Start a monitor thread that warns while the feed channel starves.
    /// The thread exits when the last handle is dropped.
    pub fn spawn_monitor(&self) {
        let weak: Weak<WatchdogShared> = Arc::downgrade(&self.shared);
        let interval = self.shared.period / 2;

        thread::Builder::new()
            .name("watchdog-monitor".into())
            .spawn(move || loop {
                thread::sleep(interval);

                let shared = match weak.upgrade() {
                    Some(shared) => shared,
                    None => return,
                };

                let elapsed = shared.last_fed.lock().expect("Watchdog lock poisoned").elapsed();

                if elapsed > shared.period {
                    logging::warn!(shared.log, "watchdog starving";
                                   "since_fed_ms" => elapsed.as_millis() as u64);
                }
            })
            .expect("Failed to spawn the watchdog monitor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_resets_starvation() {
        let watchdog = Watchdog::new(Duration::from_millis(30), None);

        assert!(!watchdog.starved());

        thread::sleep(Duration::from_millis(45));
        assert!(watchdog.starved());

        watchdog.feed();
        assert!(!watchdog.starved());
    }
}
