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

use std::{collections::BTreeMap, fmt};

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The message type tag carried by chunked-transfer envelopes.
pub const CHUNK_MESSAGE_TYPE: &str = "chunk_data";

/// The request method routed by the daemon's IPC dispatcher.
///
/// The daemon models its IPC surface after a tiny slice of HTTP,
/// so methods are spelled the way HTTP spells them on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

/// The envelope a connector transmits for every request.
///
/// Envelopes are always prefixed with a 4 byte big endian unsigned
/// word to indicate length. Requests and replies use the same framing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub method: Method,
    /// Leading-slash route, e.g. `/events/submit`.
    #[serde(default)]
    pub path: String,
    /// Request body. `{}` when the request carries no data.
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// The envelope the daemon transmits in reply to every request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ReplyEnvelope {
    /// HTTP-style status code.
    #[serde(default)]
    pub status_code: u16,
    /// Some daemons flag success explicitly in addition to the
    /// status code, so we accept both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

/// The error blob attached to failed replies.
///
/// Only user-safe detail ever travels here; internal exception
/// detail stays on the side that produced it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ReplyError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// The blob of metadata a connector transmits when it first
/// dials into the daemon, before any other request is accepted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HandshakeRequest {
    pub client_pid: u32,
    #[serde(default)]
    pub client_type: String,
}

/// The unit of information produced by connector monitors.
///
/// Events are immutable once created and move through the pipeline
/// by value; the daemon relies on per-(connector, path) ordering
/// being preserved on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectorEvent {
    #[serde(default)]
    pub connector_id: String,
    /// One of `created | modified | deleted | renamed_old |
    /// renamed_new | changed`.
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub event_data: Value,
    /// Wall-clock instant of creation, unix epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

/// The body of a `POST /events/submit_batch` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BatchEventsRequest {
    #[serde(default)]
    pub batch_events: Vec<ConnectorEvent>,
}

/// The lifecycle state of a connector process as the daemon sees it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunningState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningState::Stopped => write!(f, "stopped"),
            RunningState::Starting => write!(f, "starting"),
            RunningState::Running => write!(f, "running"),
            RunningState::Stopping => write!(f, "stopping"),
            RunningState::Error => write!(f, "error"),
        }
    }
}

/// The full status snapshot a connector reports to
/// `/connectors/{id}/status`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnectorStatus {
    #[serde(default)]
    pub connector_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub running_state: RunningState,
    #[serde(default)]
    pub process_id: u32,
    /// Unix epoch milliseconds of the last accepted heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    #[serde(default)]
    pub data_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// The liveness ping a connector POSTs to `/heartbeat`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatPayload {
    pub connector_id: String,
    pub process_id: u32,
    pub running_state: RunningState,
    pub data_count: i64,
    /// Unix epoch milliseconds at send time.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// A one-shot lifecycle notification (starting/stopping) POSTed to
/// `/connectors/{id}/status`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusNotification {
    pub connector_id: String,
    pub running_state: RunningState,
    pub process_id: u32,
    #[serde(default)]
    pub message: String,
}

/// One slice of a chunked payload.
///
/// Every chunk of a session carries the session-wide metadata so the
/// receiving side can validate the set without out-of-band state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkInfo {
    #[serde(default)]
    pub session_id: String,
    /// Zero-based position of this chunk within the session.
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub total_chunks: u32,
    #[serde(default)]
    pub data: String,
    /// Byte length of the original, unsplit payload.
    #[serde(default)]
    pub original_size: u64,
    /// Stable hash over the full payload, hex encoded. Integrity
    /// only, not tamper-resistant against an adversary.
    #[serde(default)]
    pub checksum: String,
}

/// The IPC message wrapping one chunk, tagged `type=chunk_data`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub original_size: u64,
    pub checksum: String,
    pub data: String,
    /// Unix epoch milliseconds at wrap time.
    #[serde(default)]
    pub timestamp: i64,
}

impl From<ChunkEnvelope> for ChunkInfo {
    fn from(envelope: ChunkEnvelope) -> Self {
        ChunkInfo {
            session_id: envelope.session_id,
            chunk_index: envelope.chunk_index,
            total_chunks: envelope.total_chunks,
            data: envelope.data,
            original_size: envelope.original_size,
            checksum: envelope.checksum,
        }
    }
}
