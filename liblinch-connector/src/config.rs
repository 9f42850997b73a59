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

//! Connector configuration, fetched from the daemon.
//!
//! The daemon hands each connector a JSON object. One level of
//! nesting is flattened into dot-joined keys and every scalar is
//! stringified, so the cache is a flat string map; typed accessors
//! with defaults sit on top. The dot-keyed map exists only at this
//! boundary; connectors convert it into their own typed config
//! structs.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    thread, time,
};

use anyhow::Context;
use crossbeam_channel::{bounded, Sender};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::{
    consts,
    discovery,
    protocol::{Client, ReplyExt as _},
};

/// A flattened snapshot of a connector's configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectorConfig {
    values: HashMap<String, String>,
}

impl ConnectorConfig {
    /// Flatten a JSON config object. Nested objects contribute
    /// dot-joined keys one level deep; arrays are kept as their JSON
    /// text so list accessors can parse them back.
    pub fn from_value(config: &Value) -> Self {
        let mut values = HashMap::new();
        if let Value::Object(map) = config {
            for (key, value) in map {
                match value {
                    Value::Object(nested) => {
                        for (nested_key, nested_value) in nested {
                            if let Some(s) = stringify_scalar(nested_value) {
                                values.insert(format!("{}.{}", key, nested_key), s);
                            }
                        }
                    }
                    Value::Array(_) => {
                        values.insert(key.clone(), value.to_string());
                    }
                    other => {
                        if let Some(s) = stringify_scalar(other) {
                            values.insert(key.clone(), s);
                        }
                    }
                }
            }
        }
        ConnectorConfig { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            // daemons stringify numbers as floats at times
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v as u64)
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => v == "true" || v == "1",
            None => default,
        }
    }

    /// A list option: a JSON-array string when the daemon sent an
    /// array, a comma-separated string otherwise.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        let raw = match self.get(key) {
            Some(raw) => raw.trim(),
            None => return Vec::new(),
        };

        if raw.starts_with('[') {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
                return items
                    .iter()
                    .filter_map(|item| item.as_str().map(String::from))
                    .collect();
            }
        }
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect()
    }

    /// A list option interpreted as directories: `~/` expands to the
    /// home directory and entries that do not exist on disk are
    /// dropped with a warning.
    pub fn get_paths(&self, key: &str) -> Vec<PathBuf> {
        let home = env::var(if cfg!(windows) { "USERPROFILE" } else { "HOME" })
            .map(PathBuf::from)
            .unwrap_or_default();
        self.paths_from(key, &home)
    }

    fn paths_from(&self, key: &str, home: &Path) -> Vec<PathBuf> {
        self.get_list(key)
            .iter()
            .map(|raw| expand_user(raw, home))
            .filter(|path| {
                if path.is_dir() {
                    true
                } else {
                    warn!("dropping configured path that does not exist: {}", path.display());
                    false
                }
            })
            .collect()
    }

    // Recognised options with their documented defaults.

    /// Polling period for monitors without native eventing.
    pub fn check_interval(&self) -> time::Duration {
        time::Duration::from_secs_f64(self.get_f64("check_interval", 1.0).max(0.01))
    }

    pub fn min_content_length(&self) -> usize {
        self.get_u64("min_content_length", 5) as usize
    }

    pub fn max_content_length(&self) -> usize {
        self.get_u64("max_content_length", 50_000) as usize
    }

    pub fn filter_urls(&self) -> bool {
        self.get_bool("content_filters.filter_urls", true)
    }

    pub fn filter_sensitive(&self) -> bool {
        self.get_bool("content_filters.filter_sensitive", true)
    }
}

fn stringify_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        _ => None,
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_user(raw: &str, home: &Path) -> PathBuf {
    if raw == "~" {
        return home.to_path_buf();
    }
    match raw.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(raw),
    }
}

/// Pull the config object out of a reply body: some daemon builds
/// wrap it under `config`, others send it bare.
fn extract_config(body: &Value) -> Value {
    match body.get("config") {
        Some(config) => config.clone(),
        None => body.clone(),
    }
}

fn is_empty_config(config: &Value) -> bool {
    match config {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Owns the config cache for one connector and keeps it fresh.
pub struct ConfigManager {
    connector_id: String,
    cache: std::sync::Arc<std::sync::RwLock<ConnectorConfig>>,
    refresher: Option<(Sender<()>, thread::JoinHandle<()>)>,
}

impl ConfigManager {
    pub fn new(connector_id: &str) -> Self {
        ConfigManager {
            connector_id: String::from(connector_id),
            cache: Default::default(),
            refresher: None,
        }
    }

    /// The current snapshot. Cheap to clone; refreshes replace the
    /// cache atomically behind the lock.
    pub fn snapshot(&self) -> ConnectorConfig {
        self.cache.read().expect("config cache lock poisoned").clone()
    }

    /// Fetch configuration over an existing client connection. When
    /// the stored config is empty, fall back to the daemon's
    /// defaults and ask it to persist them.
    #[instrument(skip_all, fields(connector_id = %self.connector_id))]
    pub fn load_from_daemon(&self, client: &mut Client) -> anyhow::Result<usize> {
        let config = fetch_config(&self.connector_id, client)?;
        let flattened = ConnectorConfig::from_value(&config);
        let loaded = flattened.len();

        *self.cache.write().expect("config cache lock poisoned") = flattened;
        info!("configuration loaded from daemon: {} items", loaded);
        Ok(loaded)
    }

    /// Re-fetch the config on a fixed period until stopped. The
    /// refresh loop dials its own connection so it never contends
    /// with the request path.
    pub fn start_monitoring(&mut self, interval: time::Duration) -> anyhow::Result<()> {
        if self.refresher.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let connector_id = self.connector_id.clone();
        let cache = std::sync::Arc::clone(&self.cache);

        let handle = thread::Builder::new()
            .name(String::from("config-refresh"))
            .spawn(move || {
                let mut client: Option<Client> = None;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(_) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    }

                    if client.is_none() {
                        client = connect_own_client();
                    }
                    let Some(open) = client.as_mut() else {
                        continue;
                    };

                    match fetch_config(&connector_id, open) {
                        Ok(config) => {
                            let flattened = ConnectorConfig::from_value(&config);
                            debug!("config refresh: {} items", flattened.len());
                            *cache.write().expect("config cache lock poisoned") = flattened;
                        }
                        Err(err) => {
                            warn!("config refresh failed: {:#}", err);
                            // reconnect on the next tick
                            client = None;
                        }
                    }
                }
                debug!("config refresh loop stopped");
            })
            .context("spawning config refresh thread")?;

        self.refresher = Some((stop_tx, handle));
        Ok(())
    }

    /// Stop the refresh loop. Safe to call more than once.
    pub fn stop_monitoring(&mut self) {
        if let Some((stop_tx, handle)) = self.refresher.take() {
            let _ = stop_tx.send(());
            if let Err(err) = handle.join() {
                warn!("config refresh thread panicked: {:?}", err);
            }
        }
    }
}

impl Drop for ConfigManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

fn connect_own_client() -> Option<Client> {
    let endpoint = match discovery::discover() {
        Ok(endpoint) if endpoint.reachable => endpoint,
        _ => return None,
    };
    match Client::connect(&endpoint, consts::IPC_TIMEOUT) {
        Ok(client) => Some(client),
        Err(err) => {
            warn!("config refresh could not connect: {}", err);
            None
        }
    }
}

fn fetch_config(connector_id: &str, client: &mut Client) -> anyhow::Result<Value> {
    let reply = client
        .get(&format!("/connector-config/current/{}", connector_id))
        .context("fetching current config")?;
    if !reply.is_success() {
        anyhow::bail!(
            "daemon refused config fetch with status {}",
            reply.status_code
        );
    }

    let mut config = extract_config(reply.payload());
    if !is_empty_config(&config) {
        return Ok(config);
    }

    debug!("current config is empty, asking for defaults");
    match client.get(&format!("/connector-config/defaults/{}", connector_id)) {
        Ok(reply) if reply.is_success() => {
            if let Some(defaults) = reply.payload().get("default_config") {
                config = defaults.clone();
                // best effort: ask the daemon to persist the defaults
                match client.post(
                    "/connector-config/apply-defaults",
                    serde_json::json!({ "connector_id": connector_id }),
                ) {
                    Ok(reply) if reply.is_success() => {
                        debug!("default config applied on daemon side")
                    }
                    _ => warn!("could not persist default config"),
                }
            }
        }
        _ => warn!("no default config available, continuing with empty config"),
    }
    Ok(config)
}
