//! The tick loop. One control thread; tick N is fully committed (directory,
//! ledger line, metadata) before tick N+1 starts.

use crate::backoff::Backoff;
use crate::config::RunConfig;
use crate::metadata::{self, SupervisorStatus};
use crate::retention;
use crate::signals::StopSignal;
use crate::tick::{self, TickClock, TickRecord};
use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub last: Option<TickRecord>,
    /// The loop ended because a termination signal arrived.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn last_passed(&self) -> bool {
        self.last.as_ref().is_some_and(TickRecord::passed)
    }
}

pub fn run_loop(cfg: &RunConfig, stop: &StopSignal) -> Result<RunSummary> {
    let budget = cfg.tick_budget();
    let backoff = Backoff::fixed(cfg.backoff);
    let mut clock = TickClock::new();
    let mut summary = RunSummary {
        ticks: 0,
        failed_ticks: 0,
        last: None,
        interrupted: false,
    };
    info!(
        mode = %cfg.mode,
        check_mode = %cfg.check_mode,
        budget = ?budget,
        interval_secs = cfg.interval.as_secs(),
        "supervisor loop started"
    );

    loop {
        if stop.should_stop() {
            summary.interrupted = true;
            break;
        }
        let tick_started = Instant::now();
        let record = tick::execute(cfg, &mut clock)?;
        summary.ticks += 1;
        if !record.passed() {
            summary.failed_ticks += 1;
        }
        metadata::publish(cfg, SupervisorStatus::Running, Some(&record), summary.ticks)?;
        retention::enforce(&cfg.out_dir, cfg.max_tick_dirs, cfg.max_log_files);
        let tick_elapsed = tick_started.elapsed();
        let backoff_completed = backoff.apply(&record, stop);
        summary.last = Some(record);

        if budget.is_some_and(|n| summary.ticks >= n) {
            break;
        }
        if !backoff_completed {
            summary.interrupted = true;
            break;
        }
        let remaining = remaining_interval(cfg.interval, tick_elapsed);
        if !remaining.is_zero() {
            let sleep_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
            debug!(sleep_ms, "waiting for next tick");
            if !stop.sleep(remaining) {
                summary.interrupted = true;
                break;
            }
        }
    }

    info!(
        ticks = summary.ticks,
        failed_ticks = summary.failed_ticks,
        interrupted = summary.interrupted,
        "supervisor loop finished"
    );
    Ok(summary)
}

/// Interval left after the tick itself; backoff time is not counted.
pub fn remaining_interval(interval: Duration, tick_elapsed: Duration) -> Duration {
    interval.saturating_sub(tick_elapsed)
}
