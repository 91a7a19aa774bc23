//! Run configuration: the unvalidated input as received from flags and
//! environment, and the typed, immutable form the supervisor runs with.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RUN_ID: &str = "readiness_supervisor";
pub const DEFAULT_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_ITERATIONS: u64 = 0;
pub const DEFAULT_CHECK_MODE: &str = "p86";
pub const DEFAULT_MAX_LOG_FILES: usize = 50;
pub const DEFAULT_MAX_TICK_DIRS: usize = 100;
pub const DEFAULT_BACKOFF_SECONDS: u64 = 5;
pub const DEFAULT_STOP_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_P76_COMMAND: &str = "ops/readiness/p76_gate.sh";
pub const DEFAULT_P86_COMMAND: &str = "ops/readiness/p86_gate.sh";

/// Value the arming flag must carry before any work happens.
pub const ARMING_SENTINEL: &str = "ARMED";
/// Value the paper opt-in flag must carry when `mode=paper`.
pub const PAPER_OPT_IN_SENTINEL: &str = "YES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Shadow,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Paper => "paper",
            Mode::Shadow => "shadow",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which external gate a tick invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    P76,
    P86,
}

impl CheckMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "p76" => Some(CheckMode::P76),
            "p86" => Some(CheckMode::P86),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckMode::P76 => "p76",
            CheckMode::P86 => "p86",
        }
    }
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command lines for each gate variant. The first element is the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCommands {
    pub p76: Vec<String>,
    pub p86: Vec<String>,
}

impl GateCommands {
    pub fn for_mode(&self, check_mode: CheckMode) -> &[String] {
        match check_mode {
            CheckMode::P76 => &self.p76,
            CheckMode::P86 => &self.p86,
        }
    }
}

impl Default for GateCommands {
    fn default() -> Self {
        Self {
            p76: split_command(DEFAULT_P76_COMMAND),
            p86: split_command(DEFAULT_P86_COMMAND),
        }
    }
}

pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Configuration exactly as supplied. Nothing here has been checked yet.
#[derive(Debug, Clone)]
pub struct RawConfig {
    pub mode: Option<String>,
    pub out_dir: Option<PathBuf>,
    pub run_id: String,
    pub interval_seconds: u64,
    pub iterations: u64,
    pub check_mode: String,
    pub max_log_files: usize,
    pub max_tick_dirs: usize,
    pub backoff_seconds: u64,
    pub check_timeout_seconds: u64,
    pub armed: Option<String>,
    pub allow_paper: Option<String>,
    pub gate_commands: GateCommands,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            mode: None,
            out_dir: None,
            run_id: DEFAULT_RUN_ID.to_string(),
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            iterations: DEFAULT_ITERATIONS,
            check_mode: DEFAULT_CHECK_MODE.to_string(),
            max_log_files: DEFAULT_MAX_LOG_FILES,
            max_tick_dirs: DEFAULT_MAX_TICK_DIRS,
            backoff_seconds: DEFAULT_BACKOFF_SECONDS,
            check_timeout_seconds: 0,
            armed: None,
            allow_paper: None,
            gate_commands: GateCommands::default(),
        }
    }
}

/// Validated configuration. Built once by the guardrail and never mutated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    pub out_dir: PathBuf,
    pub run_id: String,
    pub interval: Duration,
    pub iterations: u64,
    pub check_mode: CheckMode,
    pub max_log_files: usize,
    pub max_tick_dirs: usize,
    pub backoff: Duration,
    /// `None` leaves the gate unbounded.
    pub check_timeout: Option<Duration>,
    pub gate_command: Vec<String>,
}

impl RunConfig {
    /// Number of ticks this run performs, `None` meaning until stopped.
    ///
    /// A zero interval with unbounded iterations runs a single tick rather
    /// than spinning.
    pub fn tick_budget(&self) -> Option<u64> {
        match (self.iterations, self.interval.is_zero()) {
            (0, true) => Some(1),
            (0, false) => None,
            (n, _) => Some(n),
        }
    }

    /// Restrict the run to a single synchronous tick.
    pub fn into_once(mut self) -> Self {
        self.iterations = 1;
        self.interval = Duration::ZERO;
        self
    }
}
