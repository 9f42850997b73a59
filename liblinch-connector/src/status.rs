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

//! Connector status tracking, the lifecycle state machine, and the
//! heartbeat.
//!
//! ```text
//! stopped ──(start requested)──► starting ──(heartbeat or start done)──► running
//! running ──(stop requested)──► stopping ──(process exit)──► stopped
//! any     ──(set_error)───────► error    ──(clear_error)──► stopped
//! ```
//!
//! Transitions are driven only by the base connector; everything
//! here just enforces that the machine never skips an edge.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use tracing::{debug, info, instrument, warn};

use linch_connector_protocol::{
    ConnectorStatus, HeartbeatPayload, RunningState, StatusNotification,
};

use crate::{
    consts,
    protocol::{Client, ReplyExt as _},
};

pub struct StatusManager {
    status: Mutex<ConnectorStatus>,
    last_heartbeat_sent: Mutex<Option<Instant>>,
    heartbeat_interval: Duration,
}

impl StatusManager {
    pub fn new(connector_id: &str, display_name: &str) -> Self {
        Self::with_heartbeat_interval(connector_id, display_name, consts::HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat_interval(
        connector_id: &str,
        display_name: &str,
        heartbeat_interval: Duration,
    ) -> Self {
        StatusManager {
            status: Mutex::new(ConnectorStatus {
                connector_id: String::from(connector_id),
                display_name: String::from(display_name),
                enabled: true,
                running_state: RunningState::Stopped,
                process_id: nix::unistd::getpid().as_raw() as u32,
                ..Default::default()
            }),
            last_heartbeat_sent: Mutex::new(None),
            heartbeat_interval,
        }
    }

    pub fn state(&self) -> RunningState {
        self.status.lock().expect("status lock poisoned").running_state
    }

    pub fn snapshot(&self) -> ConnectorStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Follow one edge of the state machine. Anything not in the
    /// diagram is a bug in the caller and gets rejected.
    pub fn transition(&self, to: RunningState) -> anyhow::Result<()> {
        let mut status = self.status.lock().expect("status lock poisoned");
        let from = status.running_state;

        let allowed = from == to
            || matches!(
                (from, to),
                (RunningState::Stopped, RunningState::Starting)
                    | (RunningState::Starting, RunningState::Running)
                    | (RunningState::Running, RunningState::Stopping)
                    | (RunningState::Stopping, RunningState::Stopped)
                    | (_, RunningState::Error)
                    | (RunningState::Error, RunningState::Stopped)
            );
        if !allowed {
            return Err(anyhow!("illegal state transition {} -> {}", from, to));
        }

        debug!("state {} -> {}", from, to);
        status.running_state = to;
        if to != RunningState::Error {
            status.error_message = None;
            status.error_code = None;
        }
        Ok(())
    }

    pub fn set_error(&self, message: &str, code: &str) {
        let mut status = self.status.lock().expect("status lock poisoned");
        status.running_state = RunningState::Error;
        status.error_message = Some(String::from(message));
        status.error_code = if code.is_empty() {
            None
        } else {
            Some(String::from(code))
        };
    }

    pub fn clear_error(&self) {
        let mut status = self.status.lock().expect("status lock poisoned");
        if status.running_state == RunningState::Error {
            status.running_state = RunningState::Stopped;
        }
        status.error_message = None;
        status.error_code = None;
    }

    pub fn add_data_count(&self, delta: i64) {
        let mut status = self.status.lock().expect("status lock poisoned");
        status.data_count += delta;
    }

    pub fn set_last_activity(&self, activity: &str) {
        let mut status = self.status.lock().expect("status lock poisoned");
        status.last_activity = Some(String::from(activity));
    }

    /// POST a heartbeat if one is due. Returns whether anything was
    /// sent; callers may tick much faster than the heartbeat period.
    ///
    /// The first successful heartbeat promotes `starting` to
    /// `running`.
    #[instrument(skip_all)]
    pub fn send_heartbeat(&self, client: &mut Client) -> anyhow::Result<bool> {
        {
            let last = self.last_heartbeat_sent.lock().expect("heartbeat lock poisoned");
            if let Some(sent_at) = *last {
                if sent_at.elapsed() < self.heartbeat_interval {
                    return Ok(false);
                }
            }
        }

        let payload = {
            let status = self.status.lock().expect("status lock poisoned");
            HeartbeatPayload {
                connector_id: status.connector_id.clone(),
                process_id: status.process_id,
                running_state: status.running_state,
                data_count: status.data_count,
                timestamp: chrono::Utc::now().timestamp_millis(),
                error_message: status.error_message.clone(),
                error_code: status.error_code.clone(),
            }
        };

        let reply = client
            .post("/heartbeat", serde_json::to_value(&payload)?)
            .context("posting heartbeat")?;
        if !reply.is_success() {
            // Missed heartbeats are not retried locally; the daemon
            // notices the gap on its own.
            warn!("daemon refused heartbeat with status {}", reply.status_code);
            return Ok(false);
        }

        *self.last_heartbeat_sent.lock().expect("heartbeat lock poisoned") =
            Some(Instant::now());
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            status.last_heartbeat = Some(payload.timestamp);
            if status.running_state == RunningState::Starting {
                info!("first heartbeat accepted, promoting to running");
                status.running_state = RunningState::Running;
            }
        }
        Ok(true)
    }

    /// POST the full status snapshot to `/connectors/{id}/status`.
    pub fn send_status_update(&self, client: &mut Client) -> anyhow::Result<()> {
        let snapshot = self.snapshot();
        let path = format!("/connectors/{}/status", snapshot.connector_id);
        let reply = client
            .post(&path, serde_json::to_value(&snapshot)?)
            .context("posting status update")?;
        if !reply.is_success() {
            anyhow::bail!("daemon refused status update with status {}", reply.status_code);
        }
        Ok(())
    }

    /// One-shot `starting` notification.
    pub fn notify_starting(&self, client: &mut Client) -> anyhow::Result<()> {
        self.transition(RunningState::Starting)?;
        self.notify(client, "Connector is starting")
    }

    /// One-shot `stopping` notification.
    pub fn notify_stopping(&self, client: &mut Client) -> anyhow::Result<()> {
        self.transition(RunningState::Stopping)?;
        self.notify(client, "Connector is stopping")
    }

    fn notify(&self, client: &mut Client, message: &str) -> anyhow::Result<()> {
        let status = self.snapshot();
        let notification = StatusNotification {
            connector_id: status.connector_id.clone(),
            running_state: status.running_state,
            process_id: status.process_id,
            message: String::from(message),
        };
        let path = format!("/connectors/{}/status", status.connector_id);
        let reply = client
            .post(&path, serde_json::to_value(&notification)?)
            .context("posting lifecycle notification")?;
        if !reply.is_success() {
            warn!(
                "daemon refused {} notification with status {}",
                status.running_state, reply.status_code
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{decode_from, encode_to};
    use linch_connector_protocol::RequestEnvelope;
    use ntest::timeout;
    use serde_json::{json, Value};
    use std::{os::unix::net::UnixStream, thread};

    fn manager() -> StatusManager {
        StatusManager::with_heartbeat_interval("files", "Files", Duration::from_millis(50))
    }

    // An agreeable fake daemon that answers every request with
    // success and records the paths it saw.
    fn agreeable_daemon() -> (Client, thread::JoinHandle<Vec<(String, Value)>>) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        let handle = thread::spawn(move || {
            let mut theirs = theirs;
            let mut seen = Vec::new();
            while let Ok(request) = decode_from::<RequestEnvelope, _>(&mut theirs) {
                seen.push((request.path.clone(), request.data));
                let reply = json!({"status_code": 200, "success": true,
                                   "data": {"authenticated": true}});
                if encode_to(&reply, &mut theirs).is_err() {
                    break;
                }
            }
            seen
        });
        let client =
            Client::over_stream(ours, Duration::from_secs(5)).expect("client to connect");
        (client, handle)
    }

    #[test]
    fn legal_transitions() {
        let status = manager();
        status.transition(RunningState::Starting).unwrap();
        status.transition(RunningState::Running).unwrap();
        status.transition(RunningState::Stopping).unwrap();
        status.transition(RunningState::Stopped).unwrap();
    }

    #[test]
    fn illegal_transitions_rejected() {
        let status = manager();
        // no skipping straight to running
        assert!(status.transition(RunningState::Running).is_err());
        status.transition(RunningState::Starting).unwrap();
        assert!(status.transition(RunningState::Stopped).is_err());
    }

    #[test]
    fn error_state_round_trip() {
        let status = manager();
        status.transition(RunningState::Starting).unwrap();
        status.set_error("daemon went away", "TRANSPORT_ERROR");
        assert_eq!(status.state(), RunningState::Error);
        assert_eq!(
            status.snapshot().error_message.as_deref(),
            Some("daemon went away")
        );

        status.clear_error();
        assert_eq!(status.state(), RunningState::Stopped);
        assert!(status.snapshot().error_message.is_none());
    }

    #[test]
    #[timeout(30000)]
    fn heartbeat_rate_limit_and_promotion() {
        let status = manager();
        status.transition(RunningState::Starting).unwrap();

        let (mut client, daemon) = agreeable_daemon();

        assert!(status.send_heartbeat(&mut client).unwrap());
        // the first accepted heartbeat promotes starting -> running
        assert_eq!(status.state(), RunningState::Running);

        // immediately after, the rate limit suppresses the next one
        assert!(!status.send_heartbeat(&mut client).unwrap());

        thread::sleep(Duration::from_millis(60));
        assert!(status.send_heartbeat(&mut client).unwrap());

        drop(client);
        let seen = daemon.join().unwrap();
        let heartbeats: Vec<_> = seen.iter().filter(|(p, _)| p == "/heartbeat").collect();
        assert_eq!(heartbeats.len(), 2);
        assert_eq!(heartbeats[0].1.get("connector_id"), Some(&json!("files")));
        assert!(heartbeats[0].1.get("timestamp").is_some());
    }

    #[test]
    #[timeout(30000)]
    fn lifecycle_notifications() {
        let status = manager();
        let (mut client, daemon) = agreeable_daemon();

        status.notify_starting(&mut client).unwrap();
        status.transition(RunningState::Running).unwrap();
        status.notify_stopping(&mut client).unwrap();

        drop(client);
        let seen = daemon.join().unwrap();
        let notifications: Vec<_> = seen
            .iter()
            .filter(|(p, _)| p == "/connectors/files/status")
            .collect();
        assert_eq!(notifications.len(), 2);
        assert_eq!(
            notifications[0].1.get("running_state"),
            Some(&json!("starting"))
        );
        assert_eq!(
            notifications[1].1.get("running_state"),
            Some(&json!("stopping"))
        );
    }
}
