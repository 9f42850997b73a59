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

//! The IPC transport and request client.
//!
//! Every message on the socket is a frame: a 4 byte big endian
//! unsigned length followed by that many UTF-8 bytes of a JSON
//! envelope. Requests and replies are symmetric. One request is in
//! flight per connection at a time, which the `&mut self` receivers
//! enforce at compile time.

use std::{
    io::{Read, Write},
    time,
};

use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use linch_connector_protocol::{Method, ReplyEnvelope, RequestEnvelope};

use crate::{consts, discovery::DaemonEndpoint, error::ConnectorError};

use std::os::unix::net::UnixStream;

/// The centralized encoding function that should be used for all
/// protocol serialization.
pub fn encode_to<T, W>(d: &T, w: &mut W) -> Result<(), ConnectorError>
where
    T: Serialize,
    W: Write,
{
    let body = serde_json::to_vec(d)?;
    if body.len() > consts::MAX_FRAME_SIZE {
        return Err(ConnectorError::Transport(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            body.len(),
            consts::MAX_FRAME_SIZE
        )));
    }
    w.write_u32::<BigEndian>(body.len() as u32)
        .map_err(ConnectorError::from_io)?;
    w.write_all(&body).map_err(ConnectorError::from_io)?;
    w.flush().map_err(ConnectorError::from_io)?;
    Ok(())
}

/// The centralized decoding function that should be used for all
/// protocol deserialization.
pub fn decode_from<T, R>(r: &mut R) -> Result<T, ConnectorError>
where
    for<'de> T: Deserialize<'de>,
    R: Read,
{
    let len = r.read_u32::<BigEndian>().map_err(ConnectorError::from_io)? as usize;
    if len > consts::MAX_FRAME_SIZE {
        return Err(ConnectorError::Transport(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            len,
            consts::MAX_FRAME_SIZE
        )));
    }
    let mut body = vec![0; len];
    r.read_exact(&mut body).map_err(ConnectorError::from_io)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Methods mixed into the bare protocol reply struct.
pub trait ReplyExt {
    /// Whether the daemon accepted the request. Some daemon builds
    /// flag this explicitly, the rest speak in status codes.
    fn is_success(&self) -> bool;

    /// The payload: `data` when the daemon filled it in, otherwise
    /// nothing.
    fn payload(&self) -> &Value;
}

impl ReplyExt for ReplyEnvelope {
    fn is_success(&self) -> bool {
        match self.success {
            Some(explicit) => explicit,
            None => (200..300).contains(&self.status_code),
        }
    }

    fn payload(&self) -> &Value {
        &self.data
    }
}

/// A connected, authenticated IPC client.
///
/// Not `Sync`: a client shared between threads must be wrapped in a
/// mutex so that requests serialise.
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
    connected: bool,
    headers: std::collections::BTreeMap<String, String>,
}

impl Client {
    /// Dial the daemon and perform the authentication handshake.
    #[instrument(skip_all)]
    pub fn connect(
        endpoint: &DaemonEndpoint,
        timeout: time::Duration,
    ) -> Result<Self, ConnectorError> {
        use crate::discovery::SocketKind;

        if endpoint.kind != SocketKind::Unix {
            return Err(ConnectorError::Transport(String::from(
                "named pipe endpoints are not supported by this build",
            )));
        }

        let stream = UnixStream::connect(&endpoint.path).map_err(|err| {
            ConnectorError::DaemonUnreachable(format!(
                "connecting to {}: {}",
                endpoint.path.display(),
                err
            ))
        })?;
        info!("connected to daemon at {}", endpoint.path.display());

        Self::over_stream(stream, timeout)
    }

    /// Build a client over an already-open stream and authenticate.
    /// This is the seam the tests dial fake daemons through.
    pub fn over_stream(stream: UnixStream, timeout: time::Duration) -> Result<Self, ConnectorError> {
        stream
            .set_read_timeout(Some(timeout))
            .map_err(ConnectorError::from_io)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(ConnectorError::from_io)?;

        let mut client = Client {
            stream,
            connected: true,
            headers: Default::default(),
        };
        client.authenticate()?;
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Stamp a header onto every subsequent request.
    pub fn add_header(&mut self, key: &str, value: &str) {
        self.headers.insert(String::from(key), String::from(value));
    }

    pub fn get(&mut self, path: &str) -> Result<ReplyEnvelope, ConnectorError> {
        self.send_request(self.envelope(Method::Get, path, Value::Object(Default::default())))
    }

    pub fn post(&mut self, path: &str, data: Value) -> Result<ReplyEnvelope, ConnectorError> {
        self.send_request(self.envelope(Method::Post, path, data))
    }

    fn envelope(&self, method: Method, path: &str, data: Value) -> RequestEnvelope {
        RequestEnvelope {
            method,
            path: String::from(path),
            data,
            headers: self.headers.clone(),
            query_params: Default::default(),
        }
    }

    /// Write one request frame and read one reply frame. Never
    /// retries; retrying is the caller's policy.
    pub fn send_request<R>(&mut self, request: RequestEnvelope) -> Result<R, ConnectorError>
    where
        for<'de> R: Deserialize<'de>,
    {
        if !self.connected {
            return Err(ConnectorError::Transport(String::from(
                "client is disconnected",
            )));
        }
        debug!("sending {:?} {}", request.method, request.path);

        let result = encode_to(&request, &mut self.stream)
            .and_then(|_| decode_from::<R, _>(&mut self.stream));

        if let Err(ConnectorError::Transport(_)) = &result {
            // A half-finished exchange leaves the stream in an
            // unknowable framing state.
            self.connected = false;
        }
        result
    }

    /// POST `/auth/handshake` and require an affirmative answer.
    fn authenticate(&mut self) -> Result<(), ConnectorError> {
        let pid = nix::unistd::getpid().as_raw() as u32;
        let request = self.envelope(
            Method::Post,
            "/auth/handshake",
            json!({
                "client_pid": pid,
                "client_type": "connector",
            }),
        );

        // The handshake reply shape varies between daemon builds, so
        // inspect it loosely rather than through the reply struct.
        let reply: Value = self.send_request(request)?;
        if handshake_accepted(&reply) {
            debug!("handshake accepted");
            Ok(())
        } else {
            warn!("handshake rejected: {}", reply);
            Err(ConnectorError::AuthFailed)
        }
    }
}

/// Whether a handshake reply says yes. `authenticated` may live at
/// the top level or under `data`, and may be a bool or a bool-ish
/// string. Anything else is a rejection.
fn handshake_accepted(reply: &Value) -> bool {
    fn flag(v: &Value) -> Option<bool> {
        match v.get("authenticated")? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => Some(s == "true" || s == "True"),
            _ => Some(false),
        }
    }

    if let Some(answer) = flag(reply) {
        return answer;
    }
    if reply.get("success").and_then(Value::as_bool) == Some(false) {
        return false;
    }
    reply.get("data").and_then(flag).unwrap_or(false)
}
