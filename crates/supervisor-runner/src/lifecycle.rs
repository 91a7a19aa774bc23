//! Start, stop and status entry points, and the state machine tying them
//! together:
//!
//! ```text
//! Idle -> Starting -> Running -> Stopped      (start)
//! Idle -> Stopping -> Stopped                 (stop)
//! ```
//!
//! Stop and status never consult the guardrail; a supervisor must stay
//! stoppable whatever its arming or mode configuration says.

use crate::config::RawConfig;
use crate::error::{exit_codes, SupervisorError, SupervisorResult};
use crate::guardrail::{self, Policy, Verdict};
use crate::lock::{self, Holder, InstanceLock};
use crate::metadata::{self, MetadataSnapshot, SupervisorStatus};
use crate::signals::StopSignal;
use crate::supervisor::{self, RunSummary};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Idle, Stopping)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn advance(&mut self, next: LifecycleState) -> SupervisorResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(anyhow::anyhow!(
                "invalid lifecycle transition {:?} -> {:?}",
                self.state,
                next
            )
            .into());
        }
        info!(from = ?self.state, to = ?next, "lifecycle transition");
        self.state = next;
        Ok(())
    }

    /// Validate, claim the instance identity and run the loop.
    ///
    /// With `once` the run is a single synchronous tick. Cleanup of the lock
    /// and liveness record happens on every return path, including errors.
    pub fn start(
        &mut self,
        raw: &RawConfig,
        policy: &Policy,
        stop: &StopSignal,
        once: bool,
    ) -> SupervisorResult<StartOutcome> {
        let cfg = match guardrail::validate(raw, policy)? {
            Verdict::NotArmed => {
                info!("supervisor not armed; nothing to do");
                return Ok(StartOutcome::NotArmed);
            }
            Verdict::Accept(cfg) if once => cfg.into_once(),
            Verdict::Accept(cfg) => cfg,
        };
        self.advance(LifecycleState::Starting)?;

        let lock = match InstanceLock::acquire(&cfg.out_dir) {
            Ok(lock) => lock,
            Err(e) => {
                self.advance(LifecycleState::Stopped)?;
                return Err(e);
            }
        };
        self.advance(LifecycleState::Running)?;

        let result = metadata::publish(&cfg, SupervisorStatus::Running, None, 0)
            .and_then(|_| supervisor::run_loop(&cfg, stop));

        let (last, ticks) = match &result {
            Ok(summary) => (summary.last.clone(), summary.ticks),
            Err(_) => (None, 0),
        };
        if let Err(e) = metadata::publish(&cfg, SupervisorStatus::Stopped, last.as_ref(), ticks) {
            warn!(error = %e, "failed to publish final metadata");
        }
        drop(lock);
        self.advance(LifecycleState::Stopped)?;

        let summary = result?;
        Ok(StartOutcome::Finished {
            out_dir: cfg.out_dir,
            summary,
            once,
        })
    }

    /// Terminate whichever instance holds the identity at `out_dir`.
    /// Stopping something that is not running is not an error.
    pub fn stop(&mut self, out_dir: &Path, timeout: Duration) -> SupervisorResult<StopReport> {
        self.advance(LifecycleState::Stopping)?;
        let holder = lock::read_liveness(out_dir);
        let mut report = StopReport {
            out_dir: out_dir.to_path_buf(),
            pid: None,
            was_running: false,
            forced: false,
        };
        match holder {
            Holder::Live(pid) if pid == std::process::id() => {
                warn!(pid, "liveness record names this process; not signalling self");
            }
            Holder::Live(pid) => {
                report.pid = Some(pid);
                report.was_running = true;
                report.forced = terminate(pid, timeout);
            }
            Holder::Stale(pid) => {
                info!(stale_pid = ?pid, "liveness record is stale");
                report.pid = pid;
            }
            Holder::Absent => info!("no supervisor running"),
        }
        lock::remove_liveness(out_dir);
        self.advance(LifecycleState::Stopped)?;
        Ok(report)
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    NotArmed,
    Finished {
        out_dir: PathBuf,
        summary: RunSummary,
        once: bool,
    },
}

impl StartOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartOutcome::Finished {
                summary,
                once: true,
                ..
            } if !summary.interrupted && !summary.last_passed() => exit_codes::CHECK_FAILED,
            _ => exit_codes::SUCCESS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopReport {
    pub out_dir: PathBuf,
    pub pid: Option<u32>,
    pub was_running: bool,
    /// Graceful termination timed out and SIGKILL was sent.
    pub forced: bool,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub out_dir: PathBuf,
    pub holder: Holder,
    pub meta: Option<MetadataSnapshot>,
}

impl StatusReport {
    pub fn running(&self) -> bool {
        matches!(self.holder, Holder::Live(_))
    }
}

/// Read-only view of the instance at `out_dir`.
pub fn status(out_dir: &Path) -> SupervisorResult<StatusReport> {
    Ok(StatusReport {
        out_dir: out_dir.to_path_buf(),
        holder: lock::read_liveness(out_dir),
        meta: metadata::read(out_dir)?,
    })
}

/// Where stop and status look for an instance. The directory is confined to
/// the artifacts root like a start would be, but no other guardrail applies.
pub fn locate(out_dir: Option<&Path>, policy: &Policy) -> SupervisorResult<PathBuf> {
    let out_dir = out_dir
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| SupervisorError::usage("outDir is required to locate the supervisor"))?;
    guardrail::confine_out_dir(out_dir, policy)
}

/// SIGTERM, wait up to `timeout`, then SIGKILL. Returns whether SIGKILL was
/// needed.
fn terminate(pid: u32, timeout: Duration) -> bool {
    info!(pid, timeout_secs = timeout.as_secs(), "sending graceful termination");
    send_signal(pid, Signal::Terminate);
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !lock::is_pid_alive(pid) {
            info!(pid, "supervisor exited");
            return false;
        }
        std::thread::sleep(STOP_POLL_INTERVAL);
    }
    if !lock::is_pid_alive(pid) {
        return false;
    }
    warn!(pid, "graceful termination timed out; killing");
    send_signal(pid, Signal::Kill);
    true
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return;
    };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: plain kill(2) on a pid read from the liveness record.
    if unsafe { libc::kill(pid_i32, sig) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, ?signal, error = %err, "failed to signal supervisor");
        }
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    warn!(pid, ?signal, "signalling is only supported on unix");
}
