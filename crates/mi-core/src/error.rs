//! Error types for instrument protocol interaction.
//!
//! Every failure raised by the state machine, the chunker or the transaction engine
//! is a [`ProtocolError`]. The variants are deliberately few and carry enough context
//! for the driver boundary to choose a recovery strategy without string matching:
//!
//! | Kind                  | Raised when                                   | Recovery      |
//! |-----------------------|-----------------------------------------------|---------------|
//! | `timeout`             | no prompt/frame before the activity deadline  | `Retry`       |
//! | `unhandled_event`     | event not legal in the current state          | `Surface`     |
//! | `malformed_response`  | error tag or invalid echo in a response       | `Surface`     |
//! | `connection_lost`     | byte source closed or failed                  | `Reconnect`   |
//!
//! Retry loops elsewhere in the workspace consult [`ProtocolError::recovery`] and
//! always surface the last concrete error rather than a generic summary.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Deadline elapsed without the expected prompt or frame
    Timeout,
    /// Event dispatched in a state that does not accept it
    UnhandledEvent,
    /// Response recognized but its payload was rejected
    MalformedResponse,
    /// Byte source closed or failed
    ConnectionLost,
    /// Another transaction is already outstanding on the connection
    Busy,
    /// Caller supplied arguments the operation cannot use
    InvalidArgument,
    /// Configuration failed to load or validate
    Configuration,
    /// Low-level I/O failure outside the reader task
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnhandledEvent => "unhandled_event",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::Busy => "busy",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Io => "io",
        };
        f.write_str(label)
    }
}

/// What the caller should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Resend the same request (possibly after a backoff)
    Retry,
    /// Re-establish the connection, then rediscover state
    Reconnect,
    /// Report to the operator; retrying will not help
    Surface,
}

/// Errors raised by the protocol core.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No matching prompt or frame arrived before the activity-extended deadline.
    ///
    /// `lines` holds whatever text was captured during the exchange so the caller
    /// can log or inspect a partial response.
    #[error("Timed out after {timeout:?} waiting for {expected} (observed {observed}, {} lines captured)", .lines.len())]
    Timeout {
        /// Description of the awaited prompt, state or frame
        expected: String,
        /// Receive state at the moment the deadline elapsed
        observed: String,
        /// Inactivity window that elapsed
        timeout: Duration,
        /// Lines captured before giving up
        lines: Vec<String>,
    },

    /// Event is not in the transition table for the current state.
    #[error("Event {event} is not handled in state {state}")]
    UnhandledEvent {
        /// State the machine was in
        state: String,
        /// Rejected event
        event: String,
    },

    /// Response was framed correctly but carries an error marker or invalid payload.
    #[error("Malformed response to '{command}': {reason}")]
    MalformedResponse {
        /// Command that produced the response
        command: String,
        /// Instrument-reported or locally detected reason
        reason: String,
        /// Raw response text
        response: String,
    },

    /// The byte source signalled closure or failure.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A second transaction was started while one was still pending.
    #[error("Transaction already in progress for '{0}'")]
    TransactionInProgress(String),

    /// Arguments did not fit the requested operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O failure on the command path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Timeout { .. } => ErrorKind::Timeout,
            ProtocolError::UnhandledEvent { .. } => ErrorKind::UnhandledEvent,
            ProtocolError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            ProtocolError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            ProtocolError::TransactionInProgress(_) => ErrorKind::Busy,
            ProtocolError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ProtocolError::Configuration(_) => ErrorKind::Configuration,
            ProtocolError::Io(_) => ErrorKind::Io,
        }
    }

    /// Recommended recovery for this error.
    pub fn recovery(&self) -> RecoveryAction {
        match self.kind() {
            ErrorKind::Timeout | ErrorKind::Busy => RecoveryAction::Retry,
            ErrorKind::ConnectionLost | ErrorKind::Io => RecoveryAction::Reconnect,
            ErrorKind::UnhandledEvent
            | ErrorKind::MalformedResponse
            | ErrorKind::InvalidArgument
            | ErrorKind::Configuration => RecoveryAction::Surface,
        }
    }

    /// Lines captured before a timeout, empty for every other kind.
    pub fn captured_lines(&self) -> &[String] {
        match self {
            ProtocolError::Timeout { lines, .. } => lines,
            _ => &[],
        }
    }
}

/// Result alias used throughout the protocol crates.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
