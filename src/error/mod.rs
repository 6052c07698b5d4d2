// error.rs
use std::time::Duration;
use std::{error::Error, fmt};

const ERR_MSG_TRANSPORT_CLOSED: &str = "channel is closed";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_CANCELLED: &str = "operation cancelled";

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by the pipeline and propagated up to the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed or unreadable time-series input. Fatal for the run.
    #[error("format error in {file} at line {line}: {message}")]
    Format {
        file: String,
        line: usize,
        message: String,
    },

    /// The requested execution mode has no registered recipe, or the
    /// configuration is missing what the mode needs.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown channel '{channel}' in bundle '{bundle}'")]
    UnknownChannel { bundle: String, channel: String },

    /// Records gathered for one frame carry different timestamps.
    #[error(
        "misaligned frame at step {step}: channel '{channel}' has t={found}, expected t={expected}"
    )]
    Misaligned {
        step: usize,
        channel: String,
        expected: f64,
        found: f64,
    },

    /// A blocking push or pop waited longer than the configured stall timeout.
    #[error("stalled on {bundle}/{channel} after {waited:?}")]
    Stalled {
        bundle: String,
        channel: String,
        waited: Duration,
    },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("channel {bundle}/{channel} is closed")]
    Closed { bundle: String, channel: String },

    /// A record built with a different number of values than names.
    #[error("record has {values} values for {names} series")]
    RecordWidth { names: usize, values: usize },

    #[error("model error: {0:#}")]
    Model(anyhow::Error),

    #[error("optimizer error: {0:#}")]
    Optimizer(anyhow::Error),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("thread '{0}' panicked")]
    ThreadPanic(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn format(file: impl fmt::Display, line: usize, message: impl Into<String>) -> Self {
        PipelineError::Format {
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }

    /// True for the secondary error every thread reports once the run is cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendFailReason {
    Timeout,
    Cancelled,
    Closed,
}

impl fmt::Display for SendFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailReason::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            SendFailReason::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            SendFailReason::Closed => write!(f, "{ERR_MSG_TRANSPORT_CLOSED}"),
        }
    }
}

/// Failed send; hands the value back to the caller.
#[derive(Debug)]
pub struct SendError<T> {
    pub value: Option<T>,
    pub reason: SendFailReason,
}

impl<T> SendError<T> {
    pub fn closed(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Closed,
        }
    }

    pub fn cancelled(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Cancelled,
        }
    }

    pub fn timeout(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Timeout,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for SendError<T> {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}
