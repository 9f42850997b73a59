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

//! The monitor contract and the shared event types.
//!
//! A monitor is an event producer: `start(callback)` then `stop()`.
//! The filesystem monitor in [`fs`] is the big one; connectors that
//! only schedule work use [`NullMonitor`].

pub mod debounce;
pub mod filter;
pub mod fs;
mod source;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::json;

use linch_connector_protocol::ConnectorEvent;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    RenamedOld,
    RenamedNew,
    Unknown,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Created => "created",
            FileEventKind::Modified => "modified",
            FileEventKind::Deleted => "deleted",
            FileEventKind::RenamedOld => "renamed_old",
            FileEventKind::RenamedNew => "renamed_new",
            FileEventKind::Unknown => "unknown",
        }
    }
}

/// A filesystem change, before translation into a [`ConnectorEvent`].
///
/// `old_path` is set exactly when `kind` is one of the rename kinds.
/// `coalesced` is stamped by the debouncer when this event absorbed
/// earlier ones in its window.
#[derive(Debug, Clone)]
pub struct FsEvent {
    pub path: PathBuf,
    pub old_path: Option<PathBuf>,
    pub kind: FileEventKind,
    pub is_directory: bool,
    pub file_size: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub coalesced: bool,
}

impl FsEvent {
    pub fn new(path: PathBuf, kind: FileEventKind) -> Self {
        debug_assert!(!matches!(
            kind,
            FileEventKind::RenamedOld | FileEventKind::RenamedNew
        ));
        FsEvent {
            path,
            old_path: None,
            kind,
            is_directory: false,
            file_size: None,
            timestamp: Utc::now(),
            coalesced: false,
        }
    }

    /// The two-sided events for a paired rename.
    pub fn rename_pair(from: PathBuf, to: PathBuf) -> (Self, Self) {
        let old = FsEvent {
            path: from.clone(),
            old_path: Some(from.clone()),
            kind: FileEventKind::RenamedOld,
            is_directory: false,
            file_size: None,
            timestamp: Utc::now(),
            coalesced: false,
        };
        let new = FsEvent {
            path: to,
            old_path: Some(from),
            kind: FileEventKind::RenamedNew,
            is_directory: false,
            file_size: None,
            timestamp: Utc::now(),
            coalesced: false,
        };
        (old, new)
    }

    /// Fill in size and directory-ness from the disk. Deferred to
    /// emit time so a kernel event storm does not cost one stat per
    /// event; deleted paths simply stay unenriched.
    pub fn enrich(&mut self) {
        if let Ok(meta) = std::fs::metadata(&self.path) {
            self.is_directory = meta.is_dir();
            if meta.is_file() {
                self.file_size = Some(meta.len());
            }
        }
    }

    pub fn into_connector_event(self, connector_id: &str) -> ConnectorEvent {
        let mut event_data = json!({
            "path": self.path.to_string_lossy(),
            "is_directory": self.is_directory,
        });
        if let Some(old_path) = &self.old_path {
            event_data["old_path"] = json!(old_path.to_string_lossy());
        }
        if let Some(file_size) = self.file_size {
            event_data["file_size"] = json!(file_size);
        }

        ConnectorEvent {
            connector_id: String::from(connector_id),
            event_type: String::from(self.kind.as_str()),
            event_data,
            timestamp: self.timestamp.timestamp_millis(),
            metadata: json!({}),
        }
    }
}

/// Per-monitor counters.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub events_processed: u64,
    pub events_filtered: u64,
    pub paths_monitored: usize,
    pub platform_info: String,
    pub start_time: Option<DateTime<Utc>>,
    pub is_running: bool,
}

pub type EventCallback = Box<dyn FnMut(ConnectorEvent) + Send>;

/// The uniform surface the base connector drives.
pub trait ConnectorMonitor: Send {
    fn start(&mut self, callback: EventCallback) -> anyhow::Result<()>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn statistics(&self) -> Statistics;
}

/// A monitor that produces nothing, for connectors whose work is
/// entirely scheduled elsewhere.
#[derive(Default)]
pub struct NullMonitor {
    running: bool,
}

impl NullMonitor {
    pub fn new() -> Self {
        NullMonitor::default()
    }
}

impl ConnectorMonitor for NullMonitor {
    fn start(&mut self, _callback: EventCallback) -> anyhow::Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn statistics(&self) -> Statistics {
        Statistics {
            platform_info: String::from("null monitor (no active monitoring)"),
            is_running: self.running,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connector_event_translation() {
        let mut event = FsEvent::new(PathBuf::from("/w/notes.md"), FileEventKind::Modified);
        event.file_size = Some(12);
        let translated = event.into_connector_event("filesystem");

        assert_eq!(translated.connector_id, "filesystem");
        assert_eq!(translated.event_type, "modified");
        assert_eq!(
            translated.event_data.get("path").and_then(|v| v.as_str()),
            Some("/w/notes.md")
        );
        assert_eq!(
            translated.event_data.get("file_size").and_then(|v| v.as_u64()),
            Some(12)
        );
        assert!(translated.event_data.get("old_path").is_none());
        assert!(translated.timestamp > 0);
    }

    #[test]
    fn rename_pair_carries_old_path() {
        let (old, new) = FsEvent::rename_pair(PathBuf::from("/w/a"), PathBuf::from("/w/b"));
        assert_eq!(old.kind, FileEventKind::RenamedOld);
        assert_eq!(new.kind, FileEventKind::RenamedNew);
        assert_eq!(old.old_path.as_deref(), Some(std::path::Path::new("/w/a")));
        assert_eq!(new.old_path.as_deref(), Some(std::path::Path::new("/w/a")));
        assert_eq!(new.path, PathBuf::from("/w/b"));
    }

    #[test]
    fn null_monitor_lifecycle() {
        let mut monitor = NullMonitor::new();
        assert!(!monitor.is_running());
        monitor.start(Box::new(|_| {})).unwrap();
        assert!(monitor.is_running());
        assert!(monitor.statistics().is_running);
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
