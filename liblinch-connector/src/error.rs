// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The error taxonomy for the connector runtime.
//!
//! Components handle recoverable faults locally (drop, count, log)
//! and surface everything else as a [`ConnectorError`] so callers can
//! match on the kind. Anything crossing the IPC boundary goes through
//! [`ConnectorError::report`], which strips internal detail down to a
//! user-safe summary.

use std::io;

use serde_derive::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Discovery failed or the wait-for-daemon budget expired.
    #[error("daemon is not reachable: {0}")]
    DaemonUnreachable(String),

    /// The handshake reply was missing, malformed, or carried
    /// `authenticated=false`.
    #[error("authentication handshake rejected by daemon")]
    AuthFailed,

    /// Short read/write, broken pipe, or a length prefix we refuse
    /// to honor.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The IPC budget for one round trip was exceeded.
    #[error("ipc request timed out")]
    Timeout,

    /// The peer sent bytes that do not parse as an envelope.
    #[error("malformed reply: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connector config unavailable: {0}")]
    ConfigUnavailable(String),

    /// An `add_path` target that is missing or not a directory.
    #[error("invalid watch path: {0}")]
    InvalidPath(String),

    /// The debouncer or batch queue was full; the event was dropped
    /// and counted.
    #[error("queue full, event dropped")]
    QueueOverflow,

    #[error("chunk reassembly rejected: {0}")]
    ChecksumMismatch(String),

    #[error("could not build a native monitor: {0}")]
    MonitorBuildFailed(String),

    /// A user callback panicked. Caught at the invocation boundary;
    /// the owning loop keeps running.
    #[error("event callback panicked")]
    CallbackPanic,
}

impl ConnectorError {
    /// Classify an io error from the socket. Timeouts get their own
    /// kind because callers are expected to retry them with backoff.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectorError::Timeout,
            _ => ConnectorError::Transport(err.to_string()),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ConnectorError::DaemonUnreachable(_) => "DAEMON_UNREACHABLE",
            ConnectorError::AuthFailed => "AUTH_FAILED",
            ConnectorError::Transport(_) => "TRANSPORT_ERROR",
            ConnectorError::Timeout => "TIMEOUT",
            ConnectorError::Decode(_) => "DECODE_ERROR",
            ConnectorError::ConfigUnavailable(_) => "CONFIG_UNAVAILABLE",
            ConnectorError::InvalidPath(_) => "INVALID_PATH",
            ConnectorError::QueueOverflow => "QUEUE_OVERFLOW",
            ConnectorError::ChecksumMismatch(_) => "CHECKSUM_MISMATCH",
            ConnectorError::MonitorBuildFailed(_) => "MONITOR_BUILD_FAILED",
            ConnectorError::CallbackPanic => "CALLBACK_PANIC",
        }
    }

    pub fn can_retry(&self) -> bool {
        !matches!(
            self,
            ConnectorError::AuthFailed
                | ConnectorError::InvalidPath(_)
                | ConnectorError::Decode(_)
        )
    }

    /// Suggested retry delay in seconds, when retrying makes sense.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ConnectorError::DaemonUnreachable(_) => Some(3),
            ConnectorError::Transport(_) => Some(1),
            ConnectorError::Timeout => Some(1),
            ConnectorError::ConfigUnavailable(_) => Some(5),
            ConnectorError::ChecksumMismatch(_) => Some(1),
            _ => None,
        }
    }

    /// Build the user-safe report for this error. The report is what
    /// gets serialised; the full error stays in the logs.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            error_id: generate_error_id(),
            code: self.category().to_string(),
            message: user_message(self).to_string(),
            can_retry: self.can_retry(),
            retry_after: self.retry_after(),
        }
    }
}

/// The serialisable, user-safe face of a surfaced error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub error_id: String,
    pub code: String,
    pub message: String,
    pub can_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

fn user_message(err: &ConnectorError) -> &'static str {
    match err {
        ConnectorError::DaemonUnreachable(_) => "the daemon is not running or not reachable",
        ConnectorError::AuthFailed => "the daemon rejected this connector",
        ConnectorError::Transport(_) | ConnectorError::Decode(_) => {
            "communication with the daemon failed"
        }
        ConnectorError::Timeout => "the daemon did not answer in time",
        ConnectorError::ConfigUnavailable(_) => "configuration could not be loaded",
        ConnectorError::InvalidPath(_) => "a configured watch path is not usable",
        ConnectorError::QueueOverflow => "events arrived faster than they could be sent",
        ConnectorError::ChecksumMismatch(_) => "a chunked payload failed verification",
        ConnectorError::MonitorBuildFailed(_) => "native file watching is unavailable",
        ConnectorError::CallbackPanic => "an internal event handler failed",
    }
}

fn generate_error_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
    let tag = uuid::Uuid::new_v4().simple().to_string();
    format!("ERR_{}_{}", stamp, &tag[..4])
}
