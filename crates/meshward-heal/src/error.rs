//! Error types for the heal client.

/// Errors surfaced by service control, server reporting, and manual runs.
///
/// The automatic heal loop never propagates these: step failures become
/// `StepOutcome::Failed` and probe failures are just unreachable samples.
#[derive(Debug, thiserror::Error)]
pub enum HealError {
    #[error("a remediation is already in progress")]
    RemediationInProgress,

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("request to server failed: {0}")]
    Http(String),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid server response: {0}")]
    Decode(String),

    #[error("cannot determine overlay address: {0}")]
    Address(String),
}

pub type HealResult<T> = Result<T, HealError>;
