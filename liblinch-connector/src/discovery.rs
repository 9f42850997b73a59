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

//! Daemon discovery.
//!
//! The daemon parks its socket at a deterministic per-environment
//! path under the user's home directory; connectors never configure
//! the endpoint directly, they derive it.

use std::{
    env,
    path::{Path, PathBuf},
    thread, time,
};

use anyhow::{anyhow, Context};
use tracing::{debug, info, instrument};

use crate::{consts, error::ConnectorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Unix,
    Pipe,
}

/// Where the daemon can be dialed, plus whether a probe got through.
#[derive(Debug, Clone)]
pub struct DaemonEndpoint {
    pub kind: SocketKind,
    pub path: PathBuf,
    pub environment: String,
    pub reachable: bool,
}

/// The environment name used to pick the endpoint subdirectory.
pub fn environment() -> String {
    env::var(consts::ENVIRONMENT_VAR)
        .unwrap_or_else(|_| String::from(consts::DEFAULT_ENVIRONMENT))
}

fn home_dir() -> anyhow::Result<PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    let home = env::var(var).with_context(|| format!("no {} in environment", var))?;
    if home.is_empty() {
        return Err(anyhow!("{} is empty", var));
    }
    Ok(PathBuf::from(home))
}

/// Derive the endpoint for a given home directory and environment
/// name. Split out from [`endpoint`] so it stays a pure function.
fn endpoint_for(home: &Path, environment: &str) -> DaemonEndpoint {
    if cfg!(windows) {
        DaemonEndpoint {
            kind: SocketKind::Pipe,
            path: home
                .join(consts::RUNTIME_DIR_NAME)
                .join(environment)
                .join("daemon.pipe"),
            environment: String::from(environment),
            reachable: false,
        }
    } else {
        DaemonEndpoint {
            kind: SocketKind::Unix,
            path: home
                .join(consts::RUNTIME_DIR_NAME)
                .join(environment)
                .join("data")
                .join("daemon.socket"),
            environment: String::from(environment),
            reachable: false,
        }
    }
}

/// The endpoint the current process should dial, reachability unknown.
pub fn endpoint() -> anyhow::Result<DaemonEndpoint> {
    let home = home_dir().context("resolving home directory")?;
    Ok(endpoint_for(&home, &environment()))
}

/// Check reachability by opening a client socket and immediately
/// dropping it.
pub fn probe(endpoint: &DaemonEndpoint) -> bool {
    match endpoint.kind {
        SocketKind::Unix => {
            #[cfg(unix)]
            {
                std::os::unix::net::UnixStream::connect(&endpoint.path).is_ok()
            }
            #[cfg(not(unix))]
            {
                false
            }
        }
        // Named pipe probing is handled by the windows transport,
        // which this build does not carry.
        SocketKind::Pipe => false,
    }
}

/// Derive the endpoint and probe it once.
#[instrument(skip_all)]
pub fn discover() -> anyhow::Result<DaemonEndpoint> {
    let mut endpoint = endpoint()?;
    endpoint.reachable = probe(&endpoint);
    debug!(
        "daemon endpoint {} reachable={}",
        endpoint.path.display(),
        endpoint.reachable
    );
    Ok(endpoint)
}

/// Retry discovery at a fixed interval until the daemon answers or
/// the budget expires.
#[instrument(skip_all)]
pub fn wait_for_daemon(timeout: time::Duration) -> Result<DaemonEndpoint, ConnectorError> {
    let deadline = time::Instant::now() + timeout;
    loop {
        match discover() {
            Ok(endpoint) if endpoint.reachable => {
                info!("daemon reachable at {}", endpoint.path.display());
                return Ok(endpoint);
            }
            Ok(_) => {}
            Err(err) => {
                return Err(ConnectorError::DaemonUnreachable(format!("{:#}", err)));
            }
        }

        let now = time::Instant::now();
        if now >= deadline {
            return Err(ConnectorError::DaemonUnreachable(format!(
                "no daemon after waiting {:?}",
                timeout
            )));
        }
        thread::sleep(
            consts::DISCOVERY_POLL_DURATION.min(deadline.saturating_duration_since(now)),
        );
    }
}
