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

//! A fake daemon for integration tests.
//!
//! Speaks the wire protocol from first principles (length prefix +
//! JSON, built with byteorder rather than the library's own codec)
//! so the tests double as a check that the frame format is what the
//! daemon side would actually implement.

use std::{
    io::{Read, Write},
    os::unix::net::UnixListener,
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_json::{json, Value};

use liblinch_connector::discovery::{DaemonEndpoint, SocketKind};

pub struct FakeDaemon {
    socket_path: PathBuf,
    seen: Arc<Mutex<Vec<(String, Value)>>>,
    _tmp: tempfile::TempDir,
}

impl FakeDaemon {
    /// Start a daemon that authenticates everyone and serves
    /// `config` as every connector's configuration.
    pub fn spawn(config: Value) -> FakeDaemon {
        let tmp = tempfile::tempdir().expect("tempdir");
        let socket_path = tmp.path().join("daemon.socket");
        let listener = UnixListener::bind(&socket_path).expect("bind fake daemon socket");
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Default::default();

        let log = Arc::clone(&seen);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let log = Arc::clone(&log);
                let config = config.clone();
                thread::spawn(move || serve_connection(stream, log, config));
            }
        });

        FakeDaemon {
            socket_path,
            seen,
            _tmp: tmp,
        }
    }

    pub fn endpoint(&self) -> DaemonEndpoint {
        DaemonEndpoint {
            kind: SocketKind::Unix,
            path: self.socket_path.clone(),
            environment: String::from("development"),
            reachable: true,
        }
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.seen.lock().expect("request log lock").clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|(p, _)| p == path)
            .map(|(_, data)| data)
            .collect()
    }

    /// Block until the daemon has seen a request for any of `paths`.
    pub fn wait_for_any(&self, paths: &[&str], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let seen = self.requests();
            if seen.iter().any(|(p, _)| paths.contains(&p.as_str())) {
                return true;
            }
            thread::sleep(Duration::from_millis(25));
        }
        false
    }
}

fn serve_connection(
    mut stream: std::os::unix::net::UnixStream,
    log: Arc<Mutex<Vec<(String, Value)>>>,
    config: Value,
) {
    while let Some(request) = read_frame(&mut stream) {
        let path = request
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = request.get("data").cloned().unwrap_or(Value::Null);
        log.lock().expect("request log lock").push((path, data));

        let reply = json!({
            "status_code": 200,
            "success": true,
            "data": {
                "authenticated": true,
                "config": config,
            },
        });
        if write_frame(&mut stream, &reply).is_none() {
            break;
        }
    }
}

fn read_frame(stream: &mut impl Read) -> Option<Value> {
    let len = stream.read_u32::<BigEndian>().ok()? as usize;
    let mut body = vec![0; len];
    stream.read_exact(&mut body).ok()?;
    serde_json::from_slice(&body).ok()
}

fn write_frame(stream: &mut impl Write, body: &Value) -> Option<()> {
    let bytes = serde_json::to_vec(body).ok()?;
    stream.write_u32::<BigEndian>(bytes.len() as u32).ok()?;
    stream.write_all(&bytes).ok()?;
    stream.flush().ok()
}
