use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use supervisor_runner::config::{ARMING_SENTINEL, PAPER_OPT_IN_SENTINEL};
use supervisor_runner::lock::{liveness_path, lock_path};
use supervisor_runner::metadata::meta_path;
use supervisor_runner::tick::{ledger_path, logs_dir};
use supervisor_runner::{
    GateCommands, Lifecycle, Policy, RawConfig, StartOutcome, StopSignal, SupervisorStatus,
};

struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "supervisor_it_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(root.join("artifacts")).expect("sandbox root");
        Self { root }
    }

    fn policy(&self) -> Policy {
        Policy::for_working_dir(&self.root)
    }

    fn out_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("supervisor")
    }

    /// Gate scripts are run through `/bin/sh` so they never need to be
    /// executable.
    fn gate(&self, name: &str, body: &str) -> Vec<String> {
        let path = self.root.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write gate script");
        vec!["/bin/sh".to_string(), path.display().to_string()]
    }

    fn config(&self, mode: &str, gate: Vec<String>) -> RawConfig {
        RawConfig {
            mode: Some(mode.to_string()),
            out_dir: Some(PathBuf::from("artifacts/supervisor")),
            run_id: "it_run".to_string(),
            interval_seconds: 0,
            iterations: 3,
            backoff_seconds: 0,
            armed: Some(ARMING_SENTINEL.to_string()),
            gate_commands: GateCommands {
                p76: gate.clone(),
                p86: gate,
            },
            ..RawConfig::default()
        }
    }

    fn start(
        &self,
        raw: &RawConfig,
        once: bool,
    ) -> supervisor_runner::SupervisorResult<StartOutcome> {
        Lifecycle::new().start(raw, &self.policy(), &StopSignal::new(), once)
    }

    fn ledger(&self) -> Vec<Value> {
        let raw = fs::read_to_string(ledger_path(&self.out_dir())).unwrap_or_default();
        raw.lines()
            .map(|l| serde_json::from_str(l).expect("ledger line is json"))
            .collect()
    }

    fn tick_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = fs::read_dir(self.out_dir())
            .expect("list out dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("tick_"))
            .collect();
        dirs.sort();
        dirs
    }

    fn meta(&self) -> Value {
        serde_json::from_str(&fs::read_to_string(meta_path(&self.out_dir())).expect("meta"))
            .expect("meta json")
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn finished(outcome: StartOutcome) -> supervisor_runner::RunSummary {
    match outcome {
        StartOutcome::Finished { summary, .. } => summary,
        StartOutcome::NotArmed => panic!("expected an armed run"),
    }
}

/// Spawn a long sleeper and reap it from a background thread once it dies,
/// so it does not linger as a zombie that still probes alive.
fn spawn_reaped_sleeper() -> (u32, std::thread::JoinHandle<()>) {
    let child: Child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
    let pid = child.id();
    let handle = std::thread::spawn(move || {
        let mut child = child;
        let _ = child.wait();
    });
    (pid, handle)
}

#[test]
fn shadow_run_records_every_tick() {
    let sb = Sandbox::new("shadow");
    let gate = sb.gate(
        "pass.sh",
        "echo \"gate ran with $*\"\necho \"$READINESS_RUN_ID\" > \"$READINESS_OUT_DIR/run_id.txt\"\nexit 0",
    );
    let outcome = sb.start(&sb.config("shadow", gate), false).expect("run succeeds");
    assert_eq!(outcome.exit_code(), 0);
    let summary = finished(outcome);
    assert_eq!(summary.ticks, 3);
    assert_eq!(summary.failed_ticks, 0);
    assert!(!summary.interrupted);

    let ledger = sb.ledger();
    assert_eq!(ledger.len(), 3);
    for line in &ledger {
        assert_eq!(line["mode"], "shadow");
        assert_eq!(line["exitCode"], 0);
    }
    let third = ledger[2]["tickId"].as_str().expect("tick id").to_string();

    let meta = sb.meta();
    assert_eq!(meta["lastTickId"], third.as_str());
    assert_eq!(meta["ticksCompleted"], 3);
    assert_eq!(meta["status"], "stopped");

    let dirs = sb.tick_dirs();
    assert_eq!(dirs.len(), 3);
    let run_id = fs::read_to_string(sb.out_dir().join(format!("tick_{}", third)).join("run_id.txt"))
        .expect("gate wrote into its tick dir");
    assert_eq!(run_id.trim(), format!("it_run_{}", third));

    let log = fs::read_to_string(logs_dir(&sb.out_dir()).join(format!("tick_{}.log", third)))
        .expect("tick log");
    assert!(log.contains("--mode shadow"), "log: {}", log);

    assert!(!liveness_path(&sb.out_dir()).exists(), "liveness record removed");
    assert!(lock_path(&sb.out_dir()).exists(), "lock file kept, only released");
}

#[test]
fn live_mode_is_refused_without_touching_disk() {
    let sb = Sandbox::new("live");
    let gate = sb.gate("pass.sh", "exit 0");
    let err = sb
        .start(&sb.config("live", gate), false)
        .expect_err("live must be refused");
    assert_eq!(err.code(), "not_allowed");
    assert_eq!(err.exit_code(), 3);
    assert!(!sb.out_dir().exists(), "nothing may be written");
}

#[test]
fn paper_without_opt_in_is_refused() {
    let sb = Sandbox::new("paper");
    let gate = sb.gate("pass.sh", "exit 0");
    let mut raw = sb.config("paper", gate);
    let err = sb.start(&raw, false).expect_err("paper needs opt-in");
    assert_eq!(err.code(), "not_allowed");
    assert!(!sb.out_dir().exists());

    raw.allow_paper = Some(PAPER_OPT_IN_SENTINEL.to_string());
    raw.iterations = 1;
    let summary = finished(sb.start(&raw, false).expect("paper with opt-in"));
    assert_eq!(summary.ticks, 1);
    assert_eq!(sb.ledger()[0]["mode"], "paper");
}

#[test]
fn unarmed_start_is_a_silent_noop() {
    let sb = Sandbox::new("unarmed");
    let gate = sb.gate("pass.sh", "exit 0");
    let mut raw = sb.config("shadow", gate);
    raw.armed = None;
    let outcome = sb.start(&raw, false).expect("no-op is success");
    assert!(matches!(outcome, StartOutcome::NotArmed));
    assert_eq!(outcome.exit_code(), 0);
    assert!(!sb.out_dir().exists(), "no files for an unarmed supervisor");
}

#[test]
fn retention_keeps_only_the_newest_ticks() {
    let sb = Sandbox::new("retention");
    let gate = sb.gate("pass.sh", "echo tick");
    let mut raw = sb.config("shadow", gate);
    raw.iterations = 5;
    raw.max_tick_dirs = 2;
    raw.max_log_files = 3;
    finished(sb.start(&raw, false).expect("run"));

    let ledger = sb.ledger();
    assert_eq!(ledger.len(), 5, "ledger is never trimmed");
    let newest: Vec<String> = ledger[3..]
        .iter()
        .map(|l| format!("tick_{}", l["tickId"].as_str().expect("id")))
        .collect();
    let mut kept = sb.tick_dirs();
    kept.sort();
    let mut expected = newest.clone();
    expected.sort();
    assert_eq!(kept, expected);

    let logs = fs::read_dir(logs_dir(&sb.out_dir())).expect("logs").count();
    assert_eq!(logs, 3);
}

#[test]
fn failing_gate_backs_off_and_keeps_going() {
    let sb = Sandbox::new("failing");
    let gate = sb.gate("fail.sh", "echo broken >&2\nexit 3");
    let mut raw = sb.config("shadow", gate);
    raw.iterations = 2;
    raw.backoff_seconds = 1;
    let started = Instant::now();
    let outcome = sb.start(&raw, false).expect("gate failures are not fatal");
    assert_eq!(outcome.exit_code(), 0);
    let summary = finished(outcome);
    assert_eq!(summary.ticks, 2);
    assert_eq!(summary.failed_ticks, 2);
    assert!(started.elapsed() >= Duration::from_secs(1));

    let ledger = sb.ledger();
    assert_eq!(ledger.len(), 2);
    assert!(ledger.iter().all(|l| l["exitCode"] == 3));
    assert_eq!(sb.meta()["lastExitCode"], 3);
    let log = fs::read_to_string(logs_dir(&sb.out_dir()).join(format!(
        "tick_{}.log",
        ledger[0]["tickId"].as_str().expect("id")
    )))
    .expect("log");
    assert!(log.contains("broken"), "stderr captured: {}", log);
}

#[test]
fn once_mode_reports_gate_failure() {
    let sb = Sandbox::new("once");
    let failing = sb.gate("fail.sh", "exit 1");
    let mut raw = sb.config("shadow", failing);
    raw.iterations = 0;
    raw.interval_seconds = 30;
    let outcome = sb.start(&raw, true).expect("once run");
    assert_eq!(outcome.exit_code(), 4);
    assert_eq!(finished(outcome).ticks, 1);

    let passing = sb.gate("pass.sh", "exit 0");
    let raw = sb.config("shadow", passing);
    assert_eq!(sb.start(&raw, true).expect("once run").exit_code(), 0);
    assert_eq!(sb.ledger().len(), 2);
}

#[test]
fn zero_interval_and_unbounded_iterations_runs_once() {
    let sb = Sandbox::new("zero_interval");
    let gate = sb.gate("pass.sh", "exit 0");
    let mut raw = sb.config("shadow", gate);
    raw.iterations = 0;
    let summary = finished(sb.start(&raw, false).expect("run"));
    assert_eq!(summary.ticks, 1);
}

#[test]
fn hung_gate_is_cut_off_by_deadline() {
    let sb = Sandbox::new("deadline");
    let gate = sb.gate("hang.sh", "exec sleep 30");
    let mut raw = sb.config("shadow", gate);
    raw.iterations = 1;
    raw.check_timeout_seconds = 1;
    let started = Instant::now();
    let summary = finished(sb.start(&raw, false).expect("run"));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(summary.failed_ticks, 1);
    let ledger = sb.ledger();
    assert_eq!(ledger[0]["exitCode"], 124);
    assert_eq!(ledger[0]["timedOut"], true);
}

#[test]
fn missing_gate_program_is_recorded_not_fatal() {
    let sb = Sandbox::new("missing_gate");
    let raw = sb.config(
        "shadow",
        vec![sb.root.join("no-such-gate").display().to_string()],
    );
    let summary = finished(sb.start(&raw, false).expect("run"));
    assert_eq!(summary.ticks, 3);
    assert!(sb.ledger().iter().all(|l| l["exitCode"] == 127));
}

#[test]
fn live_holder_blocks_second_instance() {
    let sb = Sandbox::new("duplicate");
    fs::create_dir_all(sb.out_dir()).expect("out dir");
    let (pid, reaper) = spawn_reaped_sleeper();
    fs::write(liveness_path(&sb.out_dir()), format!("{}\n", pid)).expect("seed record");

    let gate = sb.gate("pass.sh", "exit 0");
    let err = sb
        .start(&sb.config("shadow", gate), false)
        .expect_err("duplicate refused");
    assert_eq!(err.code(), "not_allowed");
    assert_eq!(
        fs::read_to_string(liveness_path(&sb.out_dir()))
            .expect("record untouched")
            .trim(),
        pid.to_string()
    );
    assert!(!meta_path(&sb.out_dir()).exists());

    let report = Lifecycle::new()
        .stop(&sb.out_dir(), Duration::from_secs(10))
        .expect("stop");
    assert!(report.was_running);
    assert_eq!(report.pid, Some(pid));
    assert!(!report.forced, "sleep exits on SIGTERM");
    assert!(!liveness_path(&sb.out_dir()).exists());
    reaper.join().expect("reaper");

    let gate = sb.gate("pass.sh", "exit 0");
    let mut raw = sb.config("shadow", gate);
    raw.iterations = 1;
    finished(sb.start(&raw, false).expect("start after stop"));
}

#[test]
fn stale_record_does_not_block_start() {
    let sb = Sandbox::new("stale");
    fs::create_dir_all(sb.out_dir()).expect("out dir");
    let mut child = Command::new("true").spawn().expect("spawn true");
    let dead = child.id();
    child.wait().expect("reap true");
    fs::write(liveness_path(&sb.out_dir()), format!("{}\n", dead)).expect("seed record");

    let gate = sb.gate("pass.sh", "exit 0");
    let mut raw = sb.config("shadow", gate);
    raw.iterations = 1;
    finished(sb.start(&raw, false).expect("stale record discarded"));
    assert!(!liveness_path(&sb.out_dir()).exists());
}

#[test]
fn stop_with_nothing_running_succeeds() {
    let sb = Sandbox::new("stop_idle");
    let report = Lifecycle::new()
        .stop(&sb.out_dir(), Duration::from_secs(1))
        .expect("idempotent stop");
    assert!(!report.was_running);
    assert!(!liveness_path(&sb.out_dir()).exists());
}

#[test]
fn termination_signal_ends_run_and_cleans_up() {
    let sb = Sandbox::new("signalled");
    let gate = sb.gate("pass.sh", "exit 0");
    let mut raw = sb.config("shadow", gate);
    raw.iterations = 0;
    raw.interval_seconds = 60;

    let stop = StopSignal::new();
    let remote = stop.clone();
    let out_dir = sb.out_dir();
    let stopper = std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !ledger_path(&out_dir).exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        remote.request_stop();
    });
    let outcome = Lifecycle::new()
        .start(&raw, &sb.policy(), &stop, false)
        .expect("run");
    stopper.join().expect("stopper");

    let summary = finished(outcome);
    assert!(summary.interrupted);
    assert_eq!(summary.ticks, 1);
    assert!(!liveness_path(&sb.out_dir()).exists());
    assert!(lock_path(&sb.out_dir()).exists());
    let meta: supervisor_runner::MetadataSnapshot =
        serde_json::from_value(sb.meta()).expect("typed meta");
    assert_eq!(meta.status, SupervisorStatus::Stopped);
}

#[test]
fn status_reads_meta_without_writing() {
    let sb = Sandbox::new("status");
    let report = supervisor_runner::lifecycle::status(&sb.out_dir()).expect("status");
    assert!(!report.running());
    assert!(report.meta.is_none());
    assert!(!sb.out_dir().exists());

    let gate = sb.gate("pass.sh", "exit 0");
    let mut raw = sb.config("shadow", gate);
    raw.iterations = 1;
    finished(sb.start(&raw, false).expect("run"));
    let report = supervisor_runner::lifecycle::status(&sb.out_dir()).expect("status");
    assert!(!report.running());
    assert_eq!(report.meta.expect("meta").ticks_completed, 1);
}
