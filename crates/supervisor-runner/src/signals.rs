//! Termination signals turn into a stop flag that the loop polls between
//! ticks and while sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(250);

static PROCESS_STOP: OnceLock<StopSignal> = OnceLock::new();

#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short slices. Returns `false` if a stop was
    /// requested before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.should_stop() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Route SIGTERM, SIGINT and SIGHUP into a process-wide stop signal and
/// return a handle to it. Installing twice returns the same handle.
pub fn install_termination_handlers() -> StopSignal {
    let signal = PROCESS_STOP.get_or_init(StopSignal::new).clone();
    install_platform_handlers();
    signal
}

#[cfg(unix)]
fn install_platform_handlers() {
    extern "C" fn handler(sig: libc::c_int) {
        match sig {
            libc::SIGTERM | libc::SIGINT | libc::SIGHUP => {
                if let Some(stop) = PROCESS_STOP.get() {
                    stop.request_stop();
                }
            }
            _ => {}
        }
    }

    // SAFETY: the handler only performs atomic loads and stores.
    unsafe {
        let handler_ptr = handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGTERM, handler_ptr);
        libc::signal(libc::SIGINT, handler_ptr);
        libc::signal(libc::SIGHUP, handler_ptr);
    }
}

#[cfg(not(unix))]
fn install_platform_handlers() {}
