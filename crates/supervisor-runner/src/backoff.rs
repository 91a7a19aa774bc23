use crate::signals::StopSignal;
use crate::tick::TickRecord;
use std::time::Duration;
use tracing::info;

/// Fixed delay after a failed tick. No growth and no jitter, so evidence
/// timelines stay predictable.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay_after(&self, record: &TickRecord) -> Option<Duration> {
        (!record.passed() && !self.delay.is_zero()).then_some(self.delay)
    }

    /// Sleep if the tick failed. Returns `false` when a stop interrupted it.
    pub fn apply(&self, record: &TickRecord, stop: &StopSignal) -> bool {
        match self.delay_after(record) {
            Some(delay) => {
                info!(
                    tick_id = %record.tick_id,
                    backoff_secs = delay.as_secs(),
                    "backing off after failed gate"
                );
                stop.sleep(delay)
            }
            None => true,
        }
    }
}
