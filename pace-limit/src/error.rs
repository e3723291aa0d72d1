/// Errors produced by a [`PacedLimiter`](crate::PacedLimiter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    /// The limiter has been stopped and its permit stream is closed.
    ///
    /// This is permanent. A new limiter must be constructed to resume.
    #[error("Rate limiter has stopped")]
    Stopped,

    /// `count()` was called with no permits remaining in the window.
    ///
    /// The counter is left at zero.
    #[error("Permit counted with none remaining in the window")]
    Overcount,

    /// The limiter was configured with a nonsensical value.
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfig(&'static str),

    /// The limiter was constructed outside of a tokio runtime.
    #[error("Limiter requires a running tokio runtime")]
    NoRuntime,
}

/// Result type for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
