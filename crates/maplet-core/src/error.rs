//! Unified error type for the pool and its gRPC surface.
//!
//! Errors fall into three families:
//!
//! - transport errors on the child pipe (framing, I/O, a dead worker),
//! - dispatch errors (saturated queue, closed pool, timeout, cancellation),
//! - typed replies from a child ([`Error::Reply`]), carrying an
//!   [`ErrorKind`] that maps onto an HTTP-equivalent status.
//!
//! `From<Error> for tonic::Status` performs the gRPC mapping. Internal
//! errors never forward child diagnostics to the caller: the detail is
//! logged server-side and the client receives a generic message.

use serde::{Deserialize, Serialize};
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Error classification shared with the child wire protocol.
///
/// The discriminants travel inside `Reply::End` frames and are stable
/// across daemon and worker versions within the same minor release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed parameters or missing required headers (HTTP 400).
    BadRequest,
    /// Project resolution failed (HTTP 404).
    NotFound,
    /// Resource access rejected by the search-path policy (HTTP 403).
    Forbidden,
    /// No capacity to serve the request (HTTP 503).
    Unavailable,
    /// The per-request timeout fired (HTTP 504).
    DeadlineExceeded,
    /// The caller aborted or an admin drain interrupted the request.
    Cancelled,
    /// Unexpected child death, framing error or engine failure.
    Internal,
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::BadRequest => "bad request",
            Self::NotFound => "not found",
            Self::Forbidden => "forbidden",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// HTTP-equivalent status code reported in reply headers.
    pub const fn http_status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Forbidden => 403,
            Self::Unavailable => 503,
            Self::DeadlineExceeded => 504,
            Self::Cancelled => 499,
            Self::Internal => 500,
        }
    }
}

/// Unified error type for pool operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O failure on the child pipe or a listener socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the configured size limit.
    #[error("frame of {size} bytes exceeds the {limit} bytes limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// The peer closed the stream in the middle of a frame.
    #[error("truncated frame")]
    TruncatedFrame,

    #[error("frame encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("frame decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Received a frame that is not valid at this point of the exchange.
    #[error("unexpected reply frame: {0}")]
    UnexpectedReply(&'static str),

    /// The child process exited or never completed its handshake.
    #[error("worker process is dead")]
    WorkerDead,

    /// The child process could not be spawned or stalled at startup.
    #[error("worker process failed to start")]
    WorkerStartFailure,

    /// The child did not honour a cancellation within the grace period.
    #[error("worker stalled")]
    WorkerStalled,

    /// A command was issued while a previous reply sequence was pending.
    #[error("worker is busy")]
    WorkerBusy,

    /// The waiting queue reached `max_waiting_requests`.
    #[error("maximum number of waiting requests reached")]
    MaxRequestsExceeded,

    /// The pool is shutting down.
    #[error("worker queue is closed")]
    QueueClosed,

    /// The per-request timeout fired.
    #[error("request timed out")]
    DeadlineExceeded,

    /// The caller aborted the request.
    #[error("request cancelled")]
    Cancelled,

    /// Typed failure reported by a child.
    #[error("{kind}: {message}")]
    Reply { kind: ErrorKind, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Typed child failure reply.
    pub fn reply(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Reply {
            kind,
            message: message.into(),
        }
    }

    /// Classification used when reporting this error over the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Reply { kind, .. } => *kind,
            Self::MaxRequestsExceeded | Self::QueueClosed => ErrorKind::Unavailable,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::MaxRequestsExceeded => Self::resource_exhausted(err.to_string()),
            Error::QueueClosed => Self::unavailable(err.to_string()),
            Error::DeadlineExceeded => Self::deadline_exceeded(err.to_string()),
            Error::Cancelled => Self::cancelled(err.to_string()),
            Error::InvalidConfig(msg) => Self::invalid_argument(msg),
            Error::Reply { kind, message } => match kind {
                ErrorKind::BadRequest => Self::invalid_argument(message),
                ErrorKind::NotFound => Self::not_found(message),
                ErrorKind::Forbidden => Self::permission_denied(message),
                ErrorKind::Unavailable => Self::unavailable(message),
                ErrorKind::DeadlineExceeded => Self::deadline_exceeded(message),
                ErrorKind::Cancelled => Self::cancelled(message),
                ErrorKind::Internal => {
                    tracing::error!("worker internal error: {message}");
                    Self::internal("internal server error")
                }
            },
            // Transport level failures: log the detail, return a generic
            // message to the caller.
            err => {
                tracing::error!("internal error: {err}");
                Self::internal("internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_errors_map_to_grpc_codes() {
        let status = Status::from(Error::reply(ErrorKind::NotFound, "no such project"));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "no such project");

        let status = Status::from(Error::MaxRequestsExceeded);
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);

        let status = Status::from(Error::DeadlineExceeded);
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let status = Status::from(Error::reply(ErrorKind::Internal, "engine backtrace"));
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "internal server error");
    }
}
