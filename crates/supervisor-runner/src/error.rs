use thiserror::Error;

/// Fatal outcomes of a supervisor invocation.
///
/// A failing gate is never one of these: it is recorded in the ledger and the
/// loop carries on.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("usage: {0}")]
    Usage(String),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("internal: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::NotAllowed(msg.into())
    }

    /// Stable machine code printed in the outcome line.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Usage(_) => "usage_error",
            Self::NotAllowed(_) => "not_allowed",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => exit_codes::USAGE,
            Self::NotAllowed(_) => exit_codes::NOT_ALLOWED,
            Self::Internal(_) => exit_codes::INTERNAL,
        }
    }
}

pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USAGE: i32 = 2;
    pub const NOT_ALLOWED: i32 = 3;
    /// Gate failed while running a single synchronous tick.
    pub const CHECK_FAILED: i32 = 4;
    pub const INTERNAL: i32 = 5;
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
