//! Readiness supervisor: runs an external readiness gate on a fixed cadence,
//! keeps evidence of every run, and guards which modes it may run in.
//!
//! Flow for a start: [`guardrail`] classifies the request, [`lock`] claims
//! the single-instance identity, then [`supervisor`] ticks through
//! [`tick`] -> [`metadata`] -> [`retention`] -> [`backoff`] until the tick
//! budget is spent or a termination signal arrives. [`lifecycle`] owns the
//! state machine and the stop path.

pub mod backoff;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod guardrail;
pub mod lifecycle;
pub mod lock;
pub mod metadata;
pub mod retention;
pub mod signals;
pub mod supervisor;
pub mod tick;

pub use config::{CheckMode, GateCommands, Mode, RawConfig, RunConfig};
pub use error::{exit_codes, SupervisorError, SupervisorResult};
pub use guardrail::{Policy, Verdict};
pub use lifecycle::{Lifecycle, LifecycleState, StartOutcome, StatusReport, StopReport};
pub use lock::Holder;
pub use metadata::{MetadataSnapshot, SupervisorStatus};
pub use signals::{install_termination_handlers, StopSignal};
pub use supervisor::RunSummary;
pub use tick::TickRecord;
