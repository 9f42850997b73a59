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

//! The filesystem monitor.
//!
//! One native event source feeds a reader thread, which filters
//! kernel events (quick blocklist first, then the per-watch config)
//! and parks survivors in the debouncer. The debouncer's worker
//! thread owns every user-visible callback invocation. Reconfiguring
//! a running monitor tears the pipeline down and rebuilds it, so the
//! native stream is always recreated atomically.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use tracing::{debug, info, instrument, warn};

use crate::consts;
use crate::error::ConnectorError;

use super::{
    debounce::{DebounceConfig, EventDebouncer, Sink, Submit},
    filter::{quick_ignore, WatchConfig},
    source::{self, EventSource},
    ConnectorMonitor, EventCallback, FsEvent, Statistics,
};

type RawCallback = Arc<Mutex<Box<dyn FnMut(FsEvent) + Send>>>;
type BatchCallback = Arc<Mutex<Box<dyn FnMut(Vec<FsEvent>) + Send>>>;

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
}

pub struct FsMonitor {
    connector_id: String,
    configs: Arc<Mutex<Vec<WatchConfig>>>,
    debounce: DebounceConfig,
    check_interval: Duration,

    callback: Option<RawCallback>,
    batch: Option<(BatchCallback, Duration)>,

    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    platform_info: String,
    start_time: Option<DateTime<Utc>>,
    reader: Option<thread::JoinHandle<()>>,
}

impl FsMonitor {
    pub fn new(connector_id: &str) -> Self {
        FsMonitor {
            connector_id: String::from(connector_id),
            configs: Arc::new(Mutex::new(Vec::new())),
            debounce: DebounceConfig::default(),
            check_interval: consts::DEFAULT_CHECK_INTERVAL,
            callback: None,
            batch: None,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            platform_info: String::new(),
            start_time: None,
            reader: None,
        }
    }

    pub fn set_debounce(&mut self, config: DebounceConfig) {
        self.debounce = config;
    }

    /// Poll period used when the monitor has to fall back to
    /// scanning instead of native events.
    pub fn set_check_interval(&mut self, interval: Duration) {
        self.check_interval = interval;
    }

    /// Deliver grouped batches every `interval` instead of one event
    /// per callback. Takes precedence over the per-event callback.
    pub fn set_batch_callback(
        &mut self,
        callback: Box<dyn FnMut(Vec<FsEvent>) + Send>,
        interval: Duration,
    ) -> anyhow::Result<()> {
        self.batch = Some((Arc::new(Mutex::new(callback)), interval));
        if self.is_running() {
            self.restart()?;
        }
        Ok(())
    }

    /// Install watch rules for a root. Re-adding a root replaces its
    /// rules; on a running monitor the pipeline is rebuilt so the
    /// native stream picks the change up atomically.
    pub fn add_path(&mut self, config: WatchConfig) -> Result<(), ConnectorError> {
        config.validate()?;

        {
            let mut configs = self.configs.lock().expect("watch config lock poisoned");
            match configs.iter_mut().find(|existing| existing.path == config.path) {
                Some(existing) => {
                    info!("replacing watch rules for {}", config.path.display());
                    *existing = config;
                }
                None => {
                    info!("watching {}", config.path.display());
                    configs.push(config);
                }
            }
        }

        if self.is_running() {
            self.restart()
                .map_err(|err| ConnectorError::MonitorBuildFailed(format!("{:#}", err)))?;
        }
        Ok(())
    }

    /// Drop a watch root. Returns whether anything was removed.
    pub fn remove_path(&mut self, path: &Path) -> Result<bool, ConnectorError> {
        let removed = {
            let mut configs = self.configs.lock().expect("watch config lock poisoned");
            let before = configs.len();
            configs.retain(|config| config.path != path);
            configs.len() != before
        };

        if removed && self.is_running() {
            self.restart()
                .map_err(|err| ConnectorError::MonitorBuildFailed(format!("{:#}", err)))?;
        }
        Ok(removed)
    }

    pub fn monitored_paths(&self) -> Vec<PathBuf> {
        self.configs
            .lock()
            .expect("watch config lock poisoned")
            .iter()
            .map(|config| config.path.clone())
            .collect()
    }

    /// Start with an [`FsEvent`]-level callback.
    #[instrument(skip_all)]
    pub fn start_raw(&mut self, callback: Box<dyn FnMut(FsEvent) + Send>) -> anyhow::Result<()> {
        self.callback = Some(Arc::new(Mutex::new(callback)));
        self.start_pipeline()
    }

    /// Stop the pipeline: the reader joins, the debouncer flushes,
    /// and the native handles drop with the reader. Idempotent.
    pub fn stop_pipeline(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("filesystem reader thread panicked");
            }
        }
        info!("filesystem monitor stopped");
    }

    pub fn stats(&self) -> Statistics {
        Statistics {
            events_processed: self.counters.processed.load(Ordering::Relaxed),
            events_filtered: self.counters.filtered.load(Ordering::Relaxed),
            paths_monitored: self
                .configs
                .lock()
                .expect("watch config lock poisoned")
                .len(),
            platform_info: self.platform_info.clone(),
            start_time: self.start_time,
            is_running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Events dropped because the debouncer's pending set was full.
    pub fn dropped_events(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    fn restart(&mut self) -> anyhow::Result<()> {
        debug!("rebuilding filesystem pipeline");
        self.stop_pipeline();
        self.start_pipeline()
    }

    fn start_pipeline(&mut self) -> anyhow::Result<()> {
        if self.running.load(Ordering::SeqCst) {
            anyhow::bail!("filesystem monitor is already running");
        }

        let sink = self.build_sink()?;

        let (tx, rx) = unbounded();
        let (mut event_source, platform_info) = EventSource::new(tx, self.check_interval)?;
        self.platform_info = platform_info;

        {
            let configs = self.configs.lock().expect("watch config lock poisoned");
            for config in configs.iter() {
                if let Err(err) = event_source.watch(&config.path, config.recursive) {
                    // a root that vanished since add_path should not
                    // take the whole monitor down
                    warn!("could not watch {}: {}", config.path.display(), err);
                }
            }
        }

        let mut debouncer = EventDebouncer::new(self.debounce);
        debouncer.start(sink).context("starting debouncer")?;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let configs = Arc::clone(&self.configs);
        let counters = Arc::clone(&self.counters);

        let reader = thread::Builder::new()
            .name(String::from("fs-events"))
            .spawn(move || {
                loop {
                    match rx.recv_timeout(consts::JOIN_POLL_DURATION) {
                        Ok(Ok(event)) => {
                            for fs_event in source::translate(event) {
                                process_event(fs_event, &configs, &counters, &debouncer);
                            }
                        }
                        Ok(Err(err)) => warn!("native watch error: {}", err),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                // the reader owns the pipeline ends: flush the
                // debouncer, then release the native handles
                debouncer.stop();
                drop(event_source);
            })
            .context("spawning filesystem reader thread")?;

        self.reader = Some(reader);
        self.start_time = Some(Utc::now());
        info!("filesystem monitor running ({})", self.platform_info);
        Ok(())
    }

    fn build_sink(&self) -> anyhow::Result<Sink> {
        let counters = Arc::clone(&self.counters);
        if let Some((batch_callback, interval)) = &self.batch {
            let batch_callback = Arc::clone(batch_callback);
            return Ok(Sink::Batched(
                Box::new(move |mut events: Vec<FsEvent>| {
                    for event in events.iter_mut() {
                        event.enrich();
                    }
                    counters
                        .processed
                        .fetch_add(events.len() as u64, Ordering::Relaxed);
                    let mut deliver = batch_callback.lock().expect("batch callback lock poisoned");
                    (*deliver)(events);
                }),
                *interval,
            ));
        }

        let callback = self
            .callback
            .as_ref()
            .map(Arc::clone)
            .context("no event callback registered")?;
        Ok(Sink::Each(Box::new(move |mut event: FsEvent| {
            event.enrich();
            counters.processed.fetch_add(1, Ordering::Relaxed);
            let mut deliver = callback.lock().expect("event callback lock poisoned");
            (*deliver)(event);
        })))
    }
}

/// Filter one translated event and park it in the debouncer.
fn process_event(
    event: FsEvent,
    configs: &Arc<Mutex<Vec<WatchConfig>>>,
    counters: &Arc<Counters>,
    debouncer: &EventDebouncer,
) {
    let path_str = event.path.to_string_lossy().into_owned();
    if quick_ignore(&path_str) {
        counters.filtered.fetch_add(1, Ordering::Relaxed);
        return;
    }

    {
        let configs = configs.lock().expect("watch config lock poisoned");
        let Some(config) = configs.iter().find(|config| config.applies_to(&event.path)) else {
            counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if config.should_ignore(&event.path) {
            counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let is_dir = event.path.is_dir();
        if (is_dir && !config.watch_directories) || (!is_dir && !config.watch_files) {
            counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    if debouncer.submit(event) == Submit::Dropped {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl ConnectorMonitor for FsMonitor {
    fn start(&mut self, mut callback: EventCallback) -> anyhow::Result<()> {
        let connector_id = self.connector_id.clone();
        self.start_raw(Box::new(move |event: FsEvent| {
            callback(event.into_connector_event(&connector_id));
        }))
    }

    fn stop(&mut self) {
        self.stop_pipeline();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn statistics(&self) -> Statistics {
        self.stats()
    }
}

impl Drop for FsMonitor {
    fn drop(&mut self) {
        self.stop_pipeline();
    }
}
