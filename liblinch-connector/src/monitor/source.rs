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

//! The native event source behind the filesystem monitor.
//!
//! One watcher per monitor: the platform recommended backend
//! (FSEvents on macOS, inotify on Linux, ReadDirectoryChangesW on
//! Windows), or a polling scanner when the native source cannot be
//! built. Events land on a channel; the monitor's reader thread owns
//! all downstream work, so nothing user-visible ever runs on the
//! native callback thread.

use std::{path::Path, time::Duration};

use crossbeam_channel::Sender;
use notify::{
    event::{ModifyKind, RenameMode},
    recommended_watcher, Config as NotifyConfig, Event, EventKind, PollWatcher,
    RecommendedWatcher, RecursiveMode,
};
use tracing::{debug, warn};

use crate::error::ConnectorError;

use super::{FileEventKind, FsEvent};

pub enum EventSource {
    Native(RecommendedWatcher),
    Polling(PollWatcher),
}

impl EventSource {
    /// Build the platform watcher, falling back to a polling scanner
    /// at `poll_interval` when the native source cannot be created.
    pub fn new(
        tx: Sender<notify::Result<Event>>,
        poll_interval: Duration,
    ) -> Result<(Self, String), ConnectorError> {
        match recommended_watcher(tx.clone()) {
            Ok(watcher) => Ok((EventSource::Native(watcher), native_platform_info())),
            Err(err) => {
                warn!(
                    "native watcher unavailable ({}), falling back to polling",
                    err
                );
                let config = NotifyConfig::default().with_poll_interval(poll_interval);
                let watcher = PollWatcher::new(tx, config).map_err(|err| {
                    ConnectorError::MonitorBuildFailed(format!(
                        "neither native nor polling watcher could be built: {}",
                        err
                    ))
                })?;
                let info = format!("polling fallback ({:?} interval)", poll_interval);
                Ok((EventSource::Polling(watcher), info))
            }
        }
    }

    pub fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), ConnectorError> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debug!("watching {} (recursive={})", path.display(), recursive);
        self.watcher()
            .watch(path, mode)
            .map_err(|err| ConnectorError::MonitorBuildFailed(err.to_string()))
    }

    fn watcher(&mut self) -> &mut dyn notify::Watcher {
        match self {
            EventSource::Native(watcher) => watcher,
            EventSource::Polling(watcher) => watcher,
        }
    }
}

fn native_platform_info() -> String {
    let backend = if cfg!(target_os = "macos") {
        "macOS (FSEvents)"
    } else if cfg!(target_os = "linux") {
        "Linux (inotify)"
    } else if cfg!(windows) {
        "Windows (ReadDirectoryChangesW)"
    } else {
        "unknown platform"
    };
    String::from(backend)
}

/// Translate one backend event into our event model.
///
/// Renames only become a `renamed_old`/`renamed_new` pair when the
/// backend paired both sides; a one-sided rename degrades to
/// `modified`, and consumers must not assume pairing.
pub fn translate(event: Event) -> Vec<FsEvent> {
    match event.kind {
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .map(|path| FsEvent::new(path, FileEventKind::Created))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|path| FsEvent::new(path, FileEventKind::Deleted))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            let mut paths = event.paths.into_iter();
            let from = paths.next().unwrap_or_default();
            let to = paths.next().unwrap_or_default();
            let (old, new) = FsEvent::rename_pair(from, to);
            vec![old, new]
        }
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .map(|path| FsEvent::new(path, FileEventKind::Modified))
            .collect(),
        // access and catch-all kinds carry no content change
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
