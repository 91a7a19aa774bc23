use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use supervisor_runner::config::{
    self, DEFAULT_BACKOFF_SECONDS, DEFAULT_CHECK_MODE, DEFAULT_INTERVAL_SECONDS,
    DEFAULT_ITERATIONS, DEFAULT_MAX_LOG_FILES, DEFAULT_MAX_TICK_DIRS, DEFAULT_P76_COMMAND,
    DEFAULT_P86_COMMAND, DEFAULT_RUN_ID, DEFAULT_STOP_TIMEOUT_SECONDS,
};
use supervisor_runner::{
    exit_codes, GateCommands, Holder, Lifecycle, Policy, RawConfig, StartOutcome, StatusReport,
    StopReport, SupervisorError, TickRecord,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "readiness-supervisor",
    version,
    about = "Runs the readiness gate on a fixed cadence and records evidence"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    args: SupervisorArgs,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the supervisor loop (default).
    Start,
    /// Run a single tick; exit 4 if the gate failed.
    Once,
    /// Stop a running supervisor.
    Stop,
    /// Print liveness and last-tick metadata.
    Status,
}

#[derive(Args)]
struct SupervisorArgs {
    #[arg(long, env = "SUPERVISOR_MODE")]
    mode: Option<String>,
    #[arg(long, env = "SUPERVISOR_OUT_DIR")]
    out_dir: Option<PathBuf>,
    #[arg(long, env = "SUPERVISOR_RUN_ID", default_value = DEFAULT_RUN_ID)]
    run_id: String,
    #[arg(long, env = "SUPERVISOR_INTERVAL_SECONDS", default_value_t = DEFAULT_INTERVAL_SECONDS)]
    interval_seconds: u64,
    #[arg(long, env = "SUPERVISOR_ITERATIONS", default_value_t = DEFAULT_ITERATIONS)]
    iterations: u64,
    #[arg(long, env = "SUPERVISOR_CHECK_MODE", default_value = DEFAULT_CHECK_MODE)]
    check_mode: String,
    #[arg(long, env = "SUPERVISOR_MAX_LOG_FILES", default_value_t = DEFAULT_MAX_LOG_FILES)]
    max_log_files: usize,
    #[arg(long, env = "SUPERVISOR_MAX_TICK_DIRS", default_value_t = DEFAULT_MAX_TICK_DIRS)]
    max_tick_dirs: usize,
    #[arg(long, env = "SUPERVISOR_BACKOFF_SECONDS", default_value_t = DEFAULT_BACKOFF_SECONDS)]
    backoff_seconds: u64,
    /// 0 leaves the gate unbounded.
    #[arg(long, env = "SUPERVISOR_CHECK_TIMEOUT_SECONDS", default_value_t = 0)]
    check_timeout_seconds: u64,
    #[arg(long, env = "SUPERVISOR_STOP_TIMEOUT_SECONDS", default_value_t = DEFAULT_STOP_TIMEOUT_SECONDS)]
    stop_timeout_seconds: u64,
    #[arg(long, env = "SUPERVISOR_P76_COMMAND", default_value = DEFAULT_P76_COMMAND)]
    p76_command: String,
    #[arg(long, env = "SUPERVISOR_P86_COMMAND", default_value = DEFAULT_P86_COMMAND)]
    p86_command: String,
    /// Treat this invocation as a stop request.
    #[arg(long, env = "SUPERVISOR_STOP", value_parser = FalseyValueParser::new())]
    stop: bool,
    #[arg(long, env = "SUPERVISOR_ARMED")]
    armed: Option<String>,
    #[arg(long, env = "SUPERVISOR_ALLOW_PAPER")]
    allow_paper: Option<String>,
    #[arg(long, env = "SUPERVISOR_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl SupervisorArgs {
    fn to_raw_config(&self) -> RawConfig {
        RawConfig {
            mode: self.mode.clone(),
            out_dir: self.out_dir.clone(),
            run_id: self.run_id.clone(),
            interval_seconds: self.interval_seconds,
            iterations: self.iterations,
            check_mode: self.check_mode.clone(),
            max_log_files: self.max_log_files,
            max_tick_dirs: self.max_tick_dirs,
            backoff_seconds: self.backoff_seconds,
            check_timeout_seconds: self.check_timeout_seconds,
            armed: self.armed.clone(),
            allow_paper: self.allow_paper.clone(),
            gate_commands: GateCommands {
                p76: config::split_command(&self.p76_command),
                p86: config::split_command(&self.p86_command),
            },
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            emit_json(&json_error("usage_error", err.to_string(), exit_codes::USAGE));
            std::process::exit(exit_codes::USAGE);
        }
    };
    init_logging(&cli.args.log_level);

    let command = match cli.command {
        _ if cli.args.stop => Commands::Stop,
        Some(command) => command,
        None => Commands::Start,
    };
    let (payload, code) = match run_command(command, &cli.args) {
        Ok(done) => done,
        Err(err) => {
            tracing::error!(code = err.code(), error = %err, "supervisor failed");
            let code = err.exit_code();
            (json_error(err.code(), err.to_string(), code), code)
        }
    };
    emit_json(&payload);
    std::process::exit(code);
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn policy() -> Result<Policy, SupervisorError> {
    let cwd = std::env::current_dir().map_err(|e| {
        SupervisorError::from(anyhow::Error::new(e).context("no working directory"))
    })?;
    Ok(Policy::for_working_dir(&cwd))
}

fn run_command(command: Commands, args: &SupervisorArgs) -> Result<(Value, i32), SupervisorError> {
    let policy = policy()?;
    let mut lifecycle = Lifecycle::new();
    match command {
        Commands::Start | Commands::Once => {
            let once = matches!(command, Commands::Once);
            let stop = supervisor_runner::install_termination_handlers();
            let outcome = lifecycle.start(&args.to_raw_config(), &policy, &stop, once)?;
            let code = outcome.exit_code();
            Ok((start_outcome_to_json(&outcome, once), code))
        }
        Commands::Stop => {
            let out_dir = supervisor_runner::lifecycle::locate(args.out_dir.as_deref(), &policy)?;
            let report = lifecycle.stop(
                &out_dir,
                Duration::from_secs(args.stop_timeout_seconds),
            )?;
            Ok((stop_report_to_json(&report), exit_codes::SUCCESS))
        }
        Commands::Status => {
            let out_dir = supervisor_runner::lifecycle::locate(args.out_dir.as_deref(), &policy)?;
            let report = supervisor_runner::lifecycle::status(&out_dir)?;
            Ok((status_report_to_json(&report), exit_codes::SUCCESS))
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"exit_code\":5}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, exit_code: i32) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "exit_code": exit_code
        }
    })
}

fn tick_to_json(record: &TickRecord) -> Value {
    json!({
        "tick_id": record.tick_id,
        "timestamp": record.timestamp.to_rfc3339(),
        "tick_dir": record.tick_dir.display().to_string(),
        "log_path": record.log_path.display().to_string(),
        "exit_code": record.exit_code,
        "timed_out": record.timed_out,
    })
}

fn start_outcome_to_json(outcome: &StartOutcome, once: bool) -> Value {
    let command = if once { "once" } else { "start" };
    match outcome {
        StartOutcome::NotArmed => json!({
            "ok": true,
            "command": command,
            "armed": false,
        }),
        StartOutcome::Finished {
            out_dir, summary, ..
        } => {
            let code = outcome.exit_code();
            let mut payload = json!({
                "ok": code == exit_codes::SUCCESS,
                "command": command,
                "armed": true,
                "out_dir": out_dir.display().to_string(),
                "ticks": summary.ticks,
                "failed_ticks": summary.failed_ticks,
                "interrupted": summary.interrupted,
                "last_tick": summary.last.as_ref().map(tick_to_json),
            });
            if code == exit_codes::CHECK_FAILED {
                payload["error"] = json!({
                    "code": "check_failed",
                    "message": "readiness gate failed",
                    "exit_code": code
                });
            }
            payload
        }
    }
}

fn stop_report_to_json(report: &StopReport) -> Value {
    json!({
        "ok": true,
        "command": "stop",
        "out_dir": report.out_dir.display().to_string(),
        "was_running": report.was_running,
        "pid": report.pid,
        "forced": report.forced,
    })
}

fn status_report_to_json(report: &StatusReport) -> Value {
    let (pid, stale) = match report.holder {
        Holder::Absent => (None, false),
        Holder::Live(pid) => (Some(pid), false),
        Holder::Stale(pid) => (pid, true),
    };
    json!({
        "ok": true,
        "command": "status",
        "out_dir": report.out_dir.display().to_string(),
        "running": report.running(),
        "pid": pid,
        "stale": stale,
        "meta": report.meta,
    })
}
