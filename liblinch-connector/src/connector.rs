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

//! The reusable connector skeleton.
//!
//! A concrete connector supplies its monitor, its config loading,
//! and a few lifecycle hooks; the runtime composes discovery, the
//! IPC client, the config cache, the status machine, the outbound
//! batch queue, and the heartbeat around them.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use lazy_static::lazy_static;
use signal_hook::{consts::TERM_SIGNALS, flag};
use tracing::{debug, error, info, instrument, warn};

use linch_connector_protocol::{BatchEventsRequest, ConnectorEvent, RunningState};

use crate::{
    config::{ConfigManager, ConnectorConfig},
    consts,
    discovery::{self, DaemonEndpoint},
    error::ConnectorError,
    monitor::{ConnectorMonitor, Statistics},
    protocol::{Client, ReplyExt as _},
    status::StatusManager,
};

lazy_static! {
    // The one process-global: the stop flag signal handlers touch.
    static ref STOP: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

/// Route SIGINT/SIGTERM into the stop flag. A second signal while
/// the flag is already set exits immediately with code 1, so a
/// mashed ^C never hangs on a stuck shutdown.
pub fn register_signal_handlers() -> anyhow::Result<()> {
    for sig in TERM_SIGNALS {
        // Order matters: the conditional shutdown is armed by the
        // flag the plain registration sets, so the first signal only
        // sets the flag and the second one terminates.
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&STOP))
            .context("registering conditional shutdown")?;
        flag::register(*sig, Arc::clone(&STOP)).context("registering stop flag")?;
    }
    Ok(())
}

/// What a concrete connector plugs into the runtime.
pub trait Connector: Send {
    fn connector_id(&self) -> &str;
    fn display_name(&self) -> &str;

    /// Pull typed options out of the daemon-supplied config.
    fn load_connector_config(&mut self, config: &ConnectorConfig) -> anyhow::Result<()> {
        let _ = config;
        Ok(())
    }

    /// Build the event producer. Connectors that only schedule work
    /// return a [`crate::monitor::NullMonitor`].
    fn create_monitor(
        &mut self,
        config: &ConnectorConfig,
    ) -> anyhow::Result<Box<dyn ConnectorMonitor>>;

    fn on_initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stop(&mut self) {}
}

/// Counters the runtime keeps on top of the monitor's.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub monitor: Statistics,
    pub events_sent: u64,
    pub send_failures: u64,
    pub events_dropped: u64,
}

pub struct Runtime {
    connector: Box<dyn Connector>,
    status: Arc<StatusManager>,
    config: ConfigManager,

    client: Option<Arc<Mutex<Client>>>,
    monitor: Option<Box<dyn ConnectorMonitor>>,

    batch_interval: Duration,
    max_batch_size: usize,

    threads_running: Arc<AtomicBool>,
    batch_thread: Option<thread::JoinHandle<()>>,
    heartbeat_thread: Option<thread::JoinHandle<()>>,

    events_sent: Arc<AtomicU64>,
    send_failures: Arc<AtomicU64>,
    events_dropped: Arc<AtomicU64>,

    initialized: bool,
    running: bool,
}

impl Runtime {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        let status = Arc::new(StatusManager::new(
            connector.connector_id(),
            connector.display_name(),
        ));
        let config = ConfigManager::new(connector.connector_id());
        Runtime {
            connector,
            status,
            config,
            client: None,
            monitor: None,
            batch_interval: consts::BATCH_INTERVAL,
            max_batch_size: consts::MAX_BATCH_SIZE,
            threads_running: Arc::new(AtomicBool::new(false)),
            batch_thread: None,
            heartbeat_thread: None,
            events_sent: Arc::new(AtomicU64::new(0)),
            send_failures: Arc::new(AtomicU64::new(0)),
            events_dropped: Arc::new(AtomicU64::new(0)),
            initialized: false,
            running: false,
        }
    }

    pub fn set_batch_config(&mut self, interval: Duration, max_batch_size: usize) {
        self.batch_interval = interval;
        self.max_batch_size = max_batch_size.max(1);
    }

    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            monitor: self
                .monitor
                .as_ref()
                .map(|monitor| monitor.statistics())
                .unwrap_or_default(),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }

    /// Discover the daemon and bring the connector up to `starting`.
    #[instrument(skip_all)]
    pub fn initialize(&mut self, daemon_timeout: Duration) -> anyhow::Result<()> {
        let endpoint = match discovery::wait_for_daemon(daemon_timeout) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                let report = err.report();
                error!("daemon discovery failed [{}]: {}", report.error_id, err);
                self.status.set_error(&report.message, &report.code);
                return Err(err).context("discovering daemon");
            }
        };
        self.initialize_with_endpoint(&endpoint)
    }

    /// Initialization against a known endpoint. Split out so tests
    /// and embedders can dial a daemon that discovery would miss.
    pub fn initialize_with_endpoint(&mut self, endpoint: &DaemonEndpoint) -> anyhow::Result<()> {
        if self.initialized {
            return Ok(());
        }
        info!("initializing {} connector", self.connector.display_name());

        let client = match Client::connect(endpoint, consts::IPC_TIMEOUT) {
            Ok(client) => Arc::new(Mutex::new(client)),
            Err(err) => {
                let report = err.report();
                error!("daemon connection failed [{}]: {}", report.error_id, err);
                self.status.set_error(&report.message, &report.code);
                return Err(err).context("connecting to daemon");
            }
        };

        // Config trouble is never fatal; the accessors fall back to
        // their defaults.
        {
            let mut open = client.lock().expect("client lock poisoned");
            if let Err(err) = self.config.load_from_daemon(&mut open) {
                warn!("could not load config, continuing with defaults: {:#}", err);
            }
        }

        let snapshot = self.config.snapshot();
        if let Err(err) = self.connector.load_connector_config(&snapshot) {
            self.status
                .set_error("failed to load connector configuration", "CONFIG_UNAVAILABLE");
            return Err(err).context("loading connector config");
        }

        let monitor = match self.connector.create_monitor(&snapshot) {
            Ok(monitor) => monitor,
            Err(err) => {
                self.status
                    .set_error("failed to create monitor", "MONITOR_BUILD_FAILED");
                return Err(err).context("creating monitor");
            }
        };

        if let Err(err) = self.connector.on_initialize() {
            self.status
                .set_error("connector-specific initialization failed", "");
            return Err(err).context("connector on_initialize hook");
        }

        {
            let mut open = client.lock().expect("client lock poisoned");
            if let Err(err) = self.status.notify_starting(&mut open) {
                warn!("could not notify daemon of startup: {:#}", err);
            }
        }

        self.client = Some(client);
        self.monitor = Some(monitor);
        self.initialized = true;
        info!("{} connector initialized", self.connector.display_name());
        Ok(())
    }

    /// Start the monitor, the batch sender, and the heartbeat.
    #[instrument(skip_all)]
    pub fn start(&mut self) -> anyhow::Result<()> {
        if !self.initialized {
            anyhow::bail!("connector is not initialized");
        }
        if self.running {
            return Ok(());
        }
        info!("starting {} connector", self.connector.display_name());

        let (queue_tx, queue_rx) = bounded::<ConnectorEvent>(consts::EVENT_QUEUE_CAPACITY);

        {
            let monitor = self.monitor.as_mut().expect("initialized without monitor");
            let dropped = Arc::clone(&self.events_dropped);
            monitor
                .start(Box::new(move |event| {
                    match queue_tx.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            // a storm outran the sender; shed load
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => {}
                    }
                }))
                .context("starting monitor")?;
        }

        self.threads_running.store(true, Ordering::SeqCst);
        self.spawn_batch_thread(queue_rx)?;
        self.spawn_heartbeat_thread()?;

        if let Err(err) = self.connector.on_start() {
            self.shutdown_pipeline();
            self.status.set_error("connector-specific start failed", "");
            return Err(err).context("connector on_start hook");
        }

        self.status
            .transition(RunningState::Running)
            .context("entering running state")?;
        if let Some(client) = &self.client {
            let mut open = client.lock().expect("client lock poisoned");
            if let Err(err) = self.status.send_status_update(&mut open) {
                warn!("could not report running state: {:#}", err);
            }
        }

        self.running = true;
        info!("{} connector started", self.connector.display_name());
        Ok(())
    }

    /// Graceful shutdown: notify, stop the monitor (which flushes
    /// the debouncer), run the hook, then drain and send whatever is
    /// still queued.
    #[instrument(skip_all)]
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("stopping {} connector", self.connector.display_name());

        if let Some(client) = &self.client {
            let mut open = client.lock().expect("client lock poisoned");
            if let Err(err) = self.status.notify_stopping(&mut open) {
                warn!("could not notify daemon of shutdown: {:#}", err);
            }
        }

        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
        self.connector.on_stop();
        self.shutdown_pipeline();

        if let Err(err) = self.status.transition(RunningState::Stopped) {
            warn!("shutdown state bookkeeping failed: {:#}", err);
        }
        self.running = false;

        let stats = self.stats();
        info!(
            "{} connector stopped ({} events sent, {} failures, {} dropped)",
            self.connector.display_name(),
            stats.events_sent,
            stats.send_failures,
            stats.events_dropped
        );
    }

    /// Initialize, start, then sleep until the stop flag is raised.
    pub fn run(&mut self, daemon_timeout: Duration) -> anyhow::Result<()> {
        self.initialize(daemon_timeout)?;
        self.start()?;

        while !stop_requested() {
            thread::sleep(consts::JOIN_POLL_DURATION);
        }
        info!("stop requested, shutting down");
        self.stop();
        self.config.stop_monitoring();
        Ok(())
    }

    fn spawn_batch_thread(&mut self, queue_rx: Receiver<ConnectorEvent>) -> anyhow::Result<()> {
        let client = Arc::clone(self.client.as_ref().expect("initialized without client"));
        let status = Arc::clone(&self.status);
        let running = Arc::clone(&self.threads_running);
        let sent = Arc::clone(&self.events_sent);
        let failures = Arc::clone(&self.send_failures);
        let batch_interval = self.batch_interval;
        let max_batch_size = self.max_batch_size;

        let handle = thread::Builder::new()
            .name(String::from("event-batch"))
            .spawn(move || {
                loop {
                    // wait out one batch interval, leaving quickly
                    // once shutdown starts
                    let first = match queue_rx.recv_timeout(batch_interval) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };

                    let mut batch = Vec::new();
                    if let Some(event) = first {
                        batch.push(event);
                        while batch.len() < max_batch_size {
                            match queue_rx.try_recv() {
                                Ok(event) => batch.push(event),
                                Err(_) => break,
                            }
                        }
                    }
                    if !batch.is_empty() {
                        send_events(&client, &status, &sent, &failures, batch);
                    }

                    if !running.load(Ordering::SeqCst) {
                        // drain whatever the monitor flushed on stop
                        loop {
                            let mut residual = Vec::new();
                            while residual.len() < max_batch_size {
                                match queue_rx.try_recv() {
                                    Ok(event) => residual.push(event),
                                    Err(_) => break,
                                }
                            }
                            if residual.is_empty() {
                                break;
                            }
                            send_events(&client, &status, &sent, &failures, residual);
                        }
                        break;
                    }
                }
                debug!("batch thread stopped");
            })
            .context("spawning batch thread")?;
        self.batch_thread = Some(handle);
        Ok(())
    }

    fn spawn_heartbeat_thread(&mut self) -> anyhow::Result<()> {
        let client = Arc::clone(self.client.as_ref().expect("initialized without client"));
        let status = Arc::clone(&self.status);
        let running = Arc::clone(&self.threads_running);

        let handle = thread::Builder::new()
            .name(String::from("heartbeat"))
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    {
                        let mut open = client.lock().expect("client lock poisoned");
                        if let Err(err) = status.send_heartbeat(&mut open) {
                            warn!("heartbeat failed: {:#}", err);
                        }
                    }
                    thread::sleep(consts::JOIN_POLL_DURATION);
                }
                debug!("heartbeat thread stopped");
            })
            .context("spawning heartbeat thread")?;
        self.heartbeat_thread = Some(handle);
        Ok(())
    }

    fn shutdown_pipeline(&mut self) {
        self.threads_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.batch_thread.take() {
            if handle.join().is_err() {
                error!("batch thread panicked");
            }
        }
        if let Some(handle) = self.heartbeat_thread.take() {
            if handle.join().is_err() {
                error!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Ship a drained batch: one event goes to `/events/submit`, more
/// go to `/events/submit_batch` with per-event fallback on failure.
fn send_events(
    client: &Arc<Mutex<Client>>,
    status: &Arc<StatusManager>,
    sent: &Arc<AtomicU64>,
    failures: &Arc<AtomicU64>,
    batch: Vec<ConnectorEvent>,
) {
    if batch.len() == 1 {
        let event = batch.into_iter().next().expect("len checked above");
        send_one(client, status, sent, failures, event);
        return;
    }

    let request = BatchEventsRequest {
        batch_events: batch,
    };
    let posted = {
        let mut open = client.lock().expect("client lock poisoned");
        serde_json::to_value(&request)
            .map_err(ConnectorError::from)
            .and_then(|body| open.post("/events/submit_batch", body))
    };

    match posted {
        Ok(reply) if reply.is_success() => {
            let count = request.batch_events.len() as u64;
            sent.fetch_add(count, Ordering::Relaxed);
            status.add_data_count(count as i64);
            debug!("sent batch of {} events", count);
        }
        outcome => {
            match outcome {
                Ok(reply) => warn!(
                    "batch submit refused with status {}, retrying per event",
                    reply.status_code
                ),
                Err(err) => warn!("batch submit failed ({}), retrying per event", err),
            }
            for event in request.batch_events {
                send_one(client, status, sent, failures, event);
            }
        }
    }
}

fn send_one(
    client: &Arc<Mutex<Client>>,
    status: &Arc<StatusManager>,
    sent: &Arc<AtomicU64>,
    failures: &Arc<AtomicU64>,
    event: ConnectorEvent,
) {
    let posted = {
        let mut open = client.lock().expect("client lock poisoned");
        serde_json::to_value(&event)
            .map_err(ConnectorError::from)
            .and_then(|body| open.post("/events/submit", body))
    };
    match posted {
        Ok(reply) if reply.is_success() => {
            sent.fetch_add(1, Ordering::Relaxed);
            status.add_data_count(1);
        }
        Ok(reply) => {
            warn!("event submit refused with status {}", reply.status_code);
            failures.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            warn!("event submit failed: {}", err);
            failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::discovery::SocketKind;
    use crate::monitor::{EventCallback, NullMonitor};
    use crate::protocol::{decode_from, encode_to};
    use linch_connector_protocol::RequestEnvelope;
    use ntest::timeout;
    use serde_json::{json, Value};
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;

    // A fake daemon accepting any number of connections, answering
    // success to everything, and recording what it saw.
    struct FakeDaemon {
        endpoint: DaemonEndpoint,
        seen: Arc<Mutex<Vec<(String, Value)>>>,
        _tmp: tempfile::TempDir,
    }

    impl FakeDaemon {
        fn spawn() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let sock = tmp.path().join("daemon.socket");
            let listener = UnixListener::bind(&sock).unwrap();
            let seen: Arc<Mutex<Vec<(String, Value)>>> = Default::default();

            let log = Arc::clone(&seen);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let log = Arc::clone(&log);
                    thread::spawn(move || {
                        while let Ok(request) = decode_from::<RequestEnvelope, _>(&mut stream) {
                            log.lock()
                                .unwrap()
                                .push((request.path.clone(), request.data));
                            let reply = json!({
                                "status_code": 200,
                                "success": true,
                                "data": {"authenticated": true, "config": {"check_interval": 2}},
                            });
                            if encode_to(&reply, &mut stream).is_err() {
                                break;
                            }
                        }
                    });
                }
            });

            FakeDaemon {
                endpoint: DaemonEndpoint {
                    kind: SocketKind::Unix,
                    path: sock,
                    environment: String::from("development"),
                    reachable: true,
                },
                seen,
                _tmp: tmp,
            }
        }

        fn paths_seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
        }
    }

    // A monitor whose event stream the test drives by hand.
    struct ScriptedMonitor {
        callback: Arc<Mutex<Option<EventCallback>>>,
        running: bool,
    }

    impl ScriptedMonitor {
        fn new() -> (Self, Arc<Mutex<Option<EventCallback>>>) {
            let slot: Arc<Mutex<Option<EventCallback>>> = Default::default();
            (
                ScriptedMonitor {
                    callback: Arc::clone(&slot),
                    running: false,
                },
                slot,
            )
        }
    }

    impl ConnectorMonitor for ScriptedMonitor {
        fn start(&mut self, callback: EventCallback) -> anyhow::Result<()> {
            *self.callback.lock().unwrap() = Some(callback);
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
            Statistics::default()
        }
    }

    struct TestConnector {
        monitor_slot: Option<Box<dyn ConnectorMonitor>>,
        saw_config: Arc<AtomicBool>,
    }

    impl Connector for TestConnector {
        fn connector_id(&self) -> &str {
            "testconn"
        }

        fn display_name(&self) -> &str {
            "Test Connector"
        }

        fn load_connector_config(&mut self, config: &ConnectorConfig) -> anyhow::Result<()> {
            // the fake daemon serves check_interval=2
            if config.check_interval() == Duration::from_secs(2) {
                self.saw_config.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn create_monitor(
            &mut self,
            _config: &ConnectorConfig,
        ) -> anyhow::Result<Box<dyn ConnectorMonitor>> {
            Ok(self
                .monitor_slot
                .take()
                .unwrap_or_else(|| Box::new(NullMonitor::new())))
        }
    }

    fn event(n: u64) -> ConnectorEvent {
        ConnectorEvent {
            connector_id: String::from("testconn"),
            event_type: String::from("changed"),
            event_data: json!({"n": n}),
            timestamp: 1,
            metadata: json!({}),
        }
    }

    #[test]
    #[timeout(60000)]
    fn full_lifecycle_against_fake_daemon() {
        let daemon = FakeDaemon::spawn();
        let (monitor, callback_slot) = ScriptedMonitor::new();
        let saw_config = Arc::new(AtomicBool::new(false));

        let mut runtime = Runtime::new(Box::new(TestConnector {
            monitor_slot: Some(Box::new(monitor)),
            saw_config: Arc::clone(&saw_config),
        }));
        runtime.set_batch_config(Duration::from_millis(50), 10);

        runtime
            .initialize_with_endpoint(&daemon.endpoint)
            .expect("initialize");
        assert!(saw_config.load(Ordering::SeqCst));
        assert_eq!(runtime.status().state(), RunningState::Starting);

        runtime.start().expect("start");
        assert_eq!(runtime.status().state(), RunningState::Running);

        // drive three events through the queue
        {
            let mut slot = callback_slot.lock().unwrap();
            let callback = slot.as_mut().expect("monitor callback registered");
            for n in 0..3 {
                callback(event(n));
            }
        }
        thread::sleep(Duration::from_millis(300));

        runtime.stop();
        assert_eq!(runtime.status().state(), RunningState::Stopped);
        assert_eq!(runtime.stats().events_sent, 3);
        assert_eq!(runtime.stats().send_failures, 0);

        let paths = daemon.paths_seen();
        assert!(paths.contains(&String::from("/auth/handshake")));
        assert!(paths.contains(&String::from("/connector-config/current/testconn")));
        assert!(paths.contains(&String::from("/connectors/testconn/status")));
        // three events in one interval go out as a batch
        assert!(
            paths.contains(&String::from("/events/submit_batch"))
                || paths.iter().filter(|p| *p == "/events/submit").count() == 3
        );
    }

    #[test]
    #[timeout(60000)]
    fn single_event_uses_submit() {
        let daemon = FakeDaemon::spawn();
        let (monitor, callback_slot) = ScriptedMonitor::new();

        let mut runtime = Runtime::new(Box::new(TestConnector {
            monitor_slot: Some(Box::new(monitor)),
            saw_config: Default::default(),
        }));
        runtime.set_batch_config(Duration::from_millis(50), 10);
        runtime
            .initialize_with_endpoint(&daemon.endpoint)
            .expect("initialize");
        runtime.start().expect("start");

        {
            let mut slot = callback_slot.lock().unwrap();
            (slot.as_mut().unwrap())(event(7));
        }
        thread::sleep(Duration::from_millis(300));
        runtime.stop();

        let paths = daemon.paths_seen();
        assert!(paths.contains(&String::from("/events/submit")));
        assert!(!paths.contains(&String::from("/events/submit_batch")));
    }

    #[test]
    fn stop_flag_round_trip() {
        assert!(!stop_requested());
        request_stop();
        assert!(stop_requested());
    }

    #[test]
    fn start_requires_initialize() {
        let mut runtime = Runtime::new(Box::new(TestConnector {
            monitor_slot: None,
            saw_config: Default::default(),
        }));
        assert!(runtime.start().is_err());
    }

    #[test]
    #[timeout(60000)]
    fn unreachable_daemon_sets_error_state() {
        let mut runtime = Runtime::new(Box::new(TestConnector {
            monitor_slot: None,
            saw_config: Default::default(),
        }));

        let endpoint = DaemonEndpoint {
            kind: SocketKind::Unix,
            path: PathBuf::from("/no/such/daemon.socket"),
            environment: String::from("development"),
            reachable: false,
        };
        assert!(runtime.initialize_with_endpoint(&endpoint).is_err());
        assert_eq!(runtime.status().state(), RunningState::Error);
    }
}
