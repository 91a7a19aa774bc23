//! One supervisor tick: fresh tick directory, a blocking gate run with its
//! combined output captured to a per-tick log, and a ledger line.

use crate::config::RunConfig;
use crate::fsutil::{append_json_line, ensure_dir};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const LEDGER_FILE_NAME: &str = "supervisor_ledger.jsonl";
pub const LOGS_DIR_NAME: &str = "logs";
pub const TICK_DIR_PREFIX: &str = "tick_";

/// Exit code recorded when the gate outlived its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code recorded when the gate could not be spawned at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn ledger_path(out_dir: &Path) -> PathBuf {
    out_dir.join(LEDGER_FILE_NAME)
}

pub fn logs_dir(out_dir: &Path) -> PathBuf {
    out_dir.join(LOGS_DIR_NAME)
}

/// Hands out second-granular tick ids, never repeating one within a process.
#[derive(Debug, Default)]
pub struct TickClock {
    last_base: Option<String>,
    repeat: u32,
    last_ts: Option<DateTime<Utc>>,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self) -> (String, DateTime<Utc>) {
        let mut now = Utc::now();
        if let Some(prev) = self.last_ts {
            if now < prev {
                now = prev;
            }
        }
        self.last_ts = Some(now);
        (self.id_for(now), now)
    }

    fn id_for(&mut self, ts: DateTime<Utc>) -> String {
        let base = ts.format("%Y%m%dT%H%M%SZ").to_string();
        if self.last_base.as_deref() == Some(base.as_str()) {
            self.repeat += 1;
            format!("{}-{}", base, self.repeat + 1)
        } else {
            self.last_base = Some(base.clone());
            self.repeat = 0;
            base
        }
    }
}

/// Immutable history entry for one tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickRecord {
    pub tick_id: String,
    pub timestamp: DateTime<Utc>,
    pub tick_dir: PathBuf,
    pub log_path: PathBuf,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl TickRecord {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LedgerLine<'a> {
    tick_id: &'a str,
    timestamp: String,
    mode: &'a str,
    check_mode: &'a str,
    out_dir: &'a Path,
    tick_dir: &'a Path,
    exit_code: i32,
    timed_out: bool,
}

/// Run the gate for one tick and append its ledger line.
///
/// Failures of the gate itself are data in the returned record. Errors are
/// reserved for the supervisor's own bookkeeping.
pub fn execute(cfg: &RunConfig, clock: &mut TickClock) -> Result<TickRecord> {
    let (tick_id, timestamp) = clock.advance();
    let tick_dir = cfg.out_dir.join(format!("{}{}", TICK_DIR_PREFIX, tick_id));
    if tick_dir.exists() {
        fs::remove_dir_all(&tick_dir)
            .with_context(|| format!("failed to clear {}", tick_dir.display()))?;
    }
    ensure_dir(&tick_dir)?;
    let logs = logs_dir(&cfg.out_dir);
    ensure_dir(&logs)?;
    let log_path = logs.join(format!("{}{}.log", TICK_DIR_PREFIX, tick_id));

    let tick_run_id = format!("{}_{}", cfg.run_id, tick_id);
    info!(tick_id = %tick_id, check_mode = %cfg.check_mode, "tick started");
    let started = Instant::now();
    let outcome = run_gate(cfg, &tick_run_id, &tick_dir, &log_path)?;
    let record = TickRecord {
        tick_id,
        timestamp,
        tick_dir,
        log_path,
        exit_code: outcome.exit_code,
        timed_out: outcome.timed_out,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };

    append_ledger(cfg, &record)?;
    if record.passed() {
        info!(tick_id = %record.tick_id, duration_ms = record.duration_ms, "gate passed");
    } else {
        warn!(
            tick_id = %record.tick_id,
            exit_code = record.exit_code,
            timed_out = record.timed_out,
            "gate failed"
        );
    }
    Ok(record)
}

pub fn append_ledger(cfg: &RunConfig, record: &TickRecord) -> Result<()> {
    let line = LedgerLine {
        tick_id: &record.tick_id,
        timestamp: record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        mode: cfg.mode.as_str(),
        check_mode: cfg.check_mode.as_str(),
        out_dir: &cfg.out_dir,
        tick_dir: &record.tick_dir,
        exit_code: record.exit_code,
        timed_out: record.timed_out,
    };
    append_json_line(&ledger_path(&cfg.out_dir), &line).context("failed to append ledger line")
}

struct GateOutcome {
    exit_code: i32,
    timed_out: bool,
}

fn run_gate(
    cfg: &RunConfig,
    tick_run_id: &str,
    tick_dir: &Path,
    log_path: &Path,
) -> Result<GateOutcome> {
    let mut log = fs::File::create(log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let stderr_log = log.try_clone().context("failed to share tick log")?;

    let (program, args) = match cfg.gate_command.split_first() {
        Some(parts) => parts,
        None => anyhow::bail!("empty gate command"),
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.arg("--mode").arg(cfg.mode.as_str());
    cmd.arg("--run-id").arg(tick_run_id);
    cmd.arg("--out-dir").arg(tick_dir);
    cmd.env("READINESS_MODE", cfg.mode.as_str());
    cmd.env("READINESS_RUN_ID", tick_run_id);
    cmd.env("READINESS_OUT_DIR", tick_dir);
    cmd.env("READINESS_CHECK_MODE", cfg.check_mode.as_str());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(log.try_clone().context("failed to share tick log")?));
    cmd.stderr(Stdio::from(stderr_log));

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %program, error = %e, "failed to spawn gate");
            let _ = writeln!(log, "supervisor: failed to spawn {}: {}", program, e);
            return Ok(GateOutcome {
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                timed_out: false,
            });
        }
    };

    match cfg.check_timeout {
        None => {
            let mut child = child;
            let status = child.wait().context("failed to wait for gate")?;
            Ok(GateOutcome {
                exit_code: exit_code_of(status),
                timed_out: false,
            })
        }
        Some(limit) => wait_with_deadline(child, limit, &mut log),
    }
}

fn wait_with_deadline(
    mut child: Child,
    limit: Duration,
    log: &mut fs::File,
) -> Result<GateOutcome> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().context("failed to poll gate")? {
            return Ok(GateOutcome {
                exit_code: exit_code_of(status),
                timed_out: false,
            });
        }
        if Instant::now() >= deadline {
            warn!(
                pid = child.id(),
                limit_secs = limit.as_secs(),
                "gate exceeded deadline"
            );
            let _ = child.kill();
            let _ = child.wait();
            let _ = writeln!(
                log,
                "supervisor: gate killed after {}s deadline",
                limit.as_secs()
            );
            return Ok(GateOutcome {
                exit_code: TIMEOUT_EXIT_CODE,
                timed_out: true,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}
