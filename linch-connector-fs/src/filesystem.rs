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

//! The connector-specific glue: pull watch rules out of the daemon
//! config and build the filesystem monitor from them.

use std::{env, path::PathBuf, time::Duration};

use tracing::{info, warn};

use liblinch_connector::{
    config::ConnectorConfig,
    monitor::{filter::WatchConfig, fs::FsMonitor, ConnectorMonitor},
    Connector,
};

pub struct FilesystemConnector {
    watch_roots: Vec<PathBuf>,
    include_extensions: Vec<String>,
    exclude_patterns: Vec<String>,
    max_file_size: u64,
    check_interval: Duration,
}

impl FilesystemConnector {
    pub fn new() -> Self {
        FilesystemConnector {
            watch_roots: Vec::new(),
            include_extensions: Vec::new(),
            exclude_patterns: Vec::new(),
            max_file_size: 50 * 1024 * 1024,
            check_interval: Duration::from_secs(1),
        }
    }

    fn apply_config(&mut self, config: &ConnectorConfig) {
        let mut roots = config.get_paths("watch_directories");
        if roots.is_empty() {
            roots = default_watch_roots();
            if !roots.is_empty() {
                info!("no watch_directories configured, using the conventional user dirs");
            }
        }
        self.watch_roots = roots;
        self.include_extensions = config.get_list("include_extensions");
        self.exclude_patterns = config.get_list("exclude_patterns");
        self.max_file_size = config.get_u64("max_file_size_mb", 50) * 1024 * 1024;
        self.check_interval = config.check_interval();
    }
}

impl Default for FilesystemConnector {
    fn default() -> Self {
        FilesystemConnector::new()
    }
}

impl Connector for FilesystemConnector {
    fn connector_id(&self) -> &str {
        "filesystem"
    }

    fn display_name(&self) -> &str {
        "Filesystem Monitor"
    }

    fn load_connector_config(&mut self, config: &ConnectorConfig) -> anyhow::Result<()> {
        self.apply_config(config);
        if self.watch_roots.is_empty() {
            warn!("no usable watch directories, the monitor will idle");
        } else {
            info!(
                "watching {} directories: {:?}",
                self.watch_roots.len(),
                self.watch_roots
            );
        }
        Ok(())
    }

    fn create_monitor(
        &mut self,
        _config: &ConnectorConfig,
    ) -> anyhow::Result<Box<dyn ConnectorMonitor>> {
        let mut monitor = FsMonitor::new(self.connector_id());
        monitor.set_check_interval(self.check_interval);

        for root in &self.watch_roots {
            let mut watch = WatchConfig::new(root.clone());
            watch.set_include_extensions(&self.include_extensions);
            watch.exclude_patterns = self.exclude_patterns.iter().cloned().collect();
            watch.max_file_size = self.max_file_size;

            if let Err(err) = monitor.add_path(watch) {
                // one bad root should not stop the rest
                warn!("skipping {}: {}", root.display(), err);
            }
        }
        Ok(Box::new(monitor))
    }
}

/// `~/Downloads` and `~/Documents`, when they exist.
fn default_watch_roots() -> Vec<PathBuf> {
    let Ok(home) = env::var(if cfg!(windows) { "USERPROFILE" } else { "HOME" }) else {
        return Vec::new();
    };
    let home = PathBuf::from(home);
    ["Downloads", "Documents"]
        .iter()
        .map(|dir| home.join(dir))
        .filter(|path| path.is_dir())
        .collect()
}
