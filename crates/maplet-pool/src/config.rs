//! Pool configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

use maplet_core::Error;

pub type JsonValue = serde_json::Value;

/// Usize constrained to `MIN..=MAX` at deserialization time.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(try_from = "usize")]
pub(crate) struct BoundedUsize<const MIN: usize, const MAX: usize = { usize::MAX }>(usize);

impl<const MIN: usize, const MAX: usize> fmt::Display for BoundedUsize<MIN, MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<const MIN: usize, const MAX: usize> TryFrom<usize> for BoundedUsize<MIN, MAX> {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        if (MIN..=MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidConfig(format!(
                "{value} out of range {MIN}..{MAX}"
            )))
        }
    }
}

impl<const MIN: usize, const MAX: usize> BoundedUsize<MIN, MAX> {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

const DEFAULT_START_TIMEOUT_SEC: u64 = 5;
const DEFAULT_CANCEL_TIMEOUT_SEC: u64 = 3;
const DEFAULT_MAX_WAITING_REQUESTS: usize = 50;
const DEFAULT_MAX_CHUNK_SIZE: usize = 1024 * 1024;
const DEFAULT_MAX_FAILURE_PRESSURE: f64 = 0.9;

/// Worker pool configuration (the `worker` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Name of the pool instance; children are labelled `{name}_{pid}`.
    pub name: String,
    /// Number of simultaneous rendering children.
    pub(crate) num_processes: BoundedUsize<1>,
    /// Seconds granted to a child to complete its startup handshake.
    pub process_start_timeout: u64,
    /// Grace period granted to a child to honour a cancellation before it
    /// is killed. Keep it small: it is spent *after* the request timeout.
    pub cancel_timeout: u64,
    /// Bound on queued requests. Submissions beyond this fail immediately
    /// with a `service unavailable` error. Zero refuses to queue at all:
    /// requests not served by an idle child are rejected on the spot.
    pub(crate) max_waiting_requests: usize,
    /// Maximum frame size for streamed response chunks.
    pub(crate) max_chunk_size: BoundedUsize<1024>,
    /// Failure pressure above which the pool reports itself unhealthy.
    pub max_failure_pressure: f64,
    /// Engine sub-block, forwarded opaquely to every child.
    pub engine: JsonValue,
    /// Projects pinned into every child at startup.
    pub restore_projects: Vec<String>,
    /// Extra restore-list source: `file:<path>` or `cmd:<command>`
    /// producing newline-delimited uris (`#` starts a comment).
    pub restore_list: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "maplet".to_string(),
            num_processes: BoundedUsize(1),
            process_start_timeout: DEFAULT_START_TIMEOUT_SEC,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT_SEC,
            max_waiting_requests: DEFAULT_MAX_WAITING_REQUESTS,
            max_chunk_size: BoundedUsize(DEFAULT_MAX_CHUNK_SIZE),
            max_failure_pressure: DEFAULT_MAX_FAILURE_PRESSURE,
            engine: serde_json::json!({ "max_chunk_size": DEFAULT_MAX_CHUNK_SIZE }),
            restore_projects: Vec::new(),
            restore_list: None,
        }
    }
}

impl WorkerOptions {
    pub fn num_processes(&self) -> usize {
        self.num_processes.as_usize()
    }

    pub fn max_waiting_requests(&self) -> usize {
        self.max_waiting_requests
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size.as_usize()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.max_failure_pressure) {
            return Err(Error::InvalidConfig(
                "'max_failure_pressure' must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_values_reject_out_of_range() {
        let err = serde_json::from_value::<WorkerOptions>(serde_json::json!({
            "num_processes": 0
        }))
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let opts: WorkerOptions = serde_json::from_value(serde_json::json!({
            "num_processes": 4,
            "max_waiting_requests": 16
        }))
        .unwrap();
        assert_eq!(opts.num_processes(), 4);
        assert_eq!(opts.max_waiting_requests(), 16);
    }
}
