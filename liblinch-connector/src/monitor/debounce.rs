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

//! Per-path event coalescing.
//!
//! Events are not handled immediately; each one is parked for a
//! short window, and newer events for the same path replace it and
//! reset the timer. A save that fires a storm of kernel events thus
//! collapses into one stable event per path. The one exception to
//! last-writer-wins is deletion: once a window holds a `deleted`, no
//! later event downgrades it.

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, error};

use crate::consts;

use super::{FileEventKind, FsEvent};

#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    pub delay: Duration,
    pub max_pending: usize,
    pub coalesce: bool,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        DebounceConfig {
            delay: consts::DEBOUNCE_DELAY,
            max_pending: consts::MAX_PENDING_EVENTS,
            coalesce: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DebounceStats {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_coalesced: u64,
    pub events_dropped: u64,
    /// Current size of the pending set.
    pub pending: usize,
}

/// What `submit` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Accepted,
    Coalesced,
    Dropped,
}

/// Where drained events go: one at a time, or grouped per interval.
pub enum Sink {
    Each(Box<dyn FnMut(FsEvent) + Send>),
    Batched(Box<dyn FnMut(Vec<FsEvent>) + Send>, Duration),
}

struct Pending {
    event: FsEvent,
    scheduled: Instant,
    coalesced: bool,
}

struct Shared {
    pending: HashMap<PathBuf, Pending>,
    running: bool,
    stats: DebounceStats,
}

pub struct EventDebouncer {
    config: DebounceConfig,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    worker: Option<thread::JoinHandle<()>>,
}

impl EventDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        EventDebouncer {
            config,
            shared: Arc::new((
                Mutex::new(Shared {
                    pending: HashMap::new(),
                    running: false,
                    stats: DebounceStats::default(),
                }),
                Condvar::new(),
            )),
            worker: None,
        }
    }

    pub fn start(&mut self, sink: Sink) -> anyhow::Result<()> {
        if self.worker.is_some() {
            anyhow::bail!("debouncer is already running");
        }

        self.shared.0.lock().expect("debounce lock poisoned").running = true;

        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name(String::from("event-debounce"))
            .spawn(move || run_loop(shared, sink))
            .context("spawning debounce thread")?;
        self.worker = Some(worker);

        debug!("event debouncer started (delay {:?})", self.config.delay);
        Ok(())
    }

    /// Park an event for its path. Returns what happened; `Dropped`
    /// means the pending set was full (or the debouncer stopped) and
    /// the event went nowhere.
    pub fn submit(&self, event: FsEvent) -> Submit {
        let (lock, cvar) = &*self.shared;
        let mut guard = lock.lock().expect("debounce lock poisoned");
        let shared = &mut *guard;
        if !shared.running {
            return Submit::Dropped;
        }

        let key = event.path.clone();
        if !shared.pending.contains_key(&key) && shared.pending.len() >= self.config.max_pending {
            shared.stats.events_dropped += 1;
            return Submit::Dropped;
        }

        shared.stats.events_received += 1;
        let scheduled = Instant::now() + self.config.delay;

        let outcome = match shared.pending.get_mut(&key) {
            Some(slot) => {
                // never downgrade a pending deletion
                if slot.event.kind != FileEventKind::Deleted
                    || event.kind == FileEventKind::Deleted
                {
                    slot.event = event;
                }
                slot.scheduled = scheduled;
                if self.config.coalesce {
                    slot.coalesced = true;
                    shared.stats.events_coalesced += 1;
                    Submit::Coalesced
                } else {
                    Submit::Accepted
                }
            }
            None => {
                shared.pending.insert(
                    key,
                    Pending {
                        event,
                        scheduled,
                        coalesced: false,
                    },
                );
                Submit::Accepted
            }
        };
        shared.stats.pending = shared.pending.len();

        cvar.notify_one();
        outcome
    }

    pub fn stats(&self) -> DebounceStats {
        self.shared.0.lock().expect("debounce lock poisoned").stats
    }

    /// Stop the worker, flushing every still-pending event to the
    /// sink first. Idempotent.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        {
            let (lock, cvar) = &*self.shared;
            lock.lock().expect("debounce lock poisoned").running = false;
            cvar.notify_all();
        }
        if worker.join().is_err() {
            error!("debounce thread panicked");
        }
        debug!("event debouncer stopped");
    }
}

impl Drop for EventDebouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: Arc<(Mutex<Shared>, Condvar)>, mut sink: Sink) {
    let (lock, cvar) = &*shared;
    let mut batch_buf: Vec<FsEvent> = Vec::new();
    let mut last_batch_flush = Instant::now();

    loop {
        let (due, running) = {
            let guard = lock.lock().expect("debounce lock poisoned");
            let (mut guard, _) = cvar
                .wait_timeout(guard, consts::DEBOUNCE_TICK)
                .expect("debounce lock poisoned");

            let running = guard.running;
            let now = Instant::now();
            let due_keys: Vec<PathBuf> = guard
                .pending
                .iter()
                .filter(|(_, pending)| !running || pending.scheduled <= now)
                .map(|(key, _)| key.clone())
                .collect();

            let due: Vec<FsEvent> = due_keys
                .iter()
                .filter_map(|key| guard.pending.remove(key))
                .map(|pending| {
                    let mut event = pending.event;
                    event.coalesced = pending.coalesced;
                    event
                })
                .collect();

            guard.stats.events_processed += due.len() as u64;
            guard.stats.pending = guard.pending.len();
            (due, running)
        };

        // the lock is released before any handler runs
        match &mut sink {
            Sink::Each(handler) => {
                for event in due {
                    invoke(&mut **handler, event);
                }
            }
            Sink::Batched(handler, interval) => {
                batch_buf.extend(due);
                let flush_due = last_batch_flush.elapsed() >= *interval;
                if !batch_buf.is_empty() && (flush_due || !running) {
                    let batch = std::mem::take(&mut batch_buf);
                    if panic::catch_unwind(AssertUnwindSafe(|| handler(batch))).is_err() {
                        error!("batch callback panicked, continuing");
                    }
                    last_batch_flush = Instant::now();
                }
            }
        }

        if !running {
            break;
        }
    }
}

fn invoke(handler: &mut (dyn FnMut(FsEvent) + Send), event: FsEvent) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        error!("event callback panicked, continuing");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use ntest::timeout;

    fn quick_config() -> DebounceConfig {
        DebounceConfig {
            delay: Duration::from_millis(100),
            max_pending: 1000,
            coalesce: true,
        }
    }

    fn started(config: DebounceConfig) -> (EventDebouncer, Receiver<FsEvent>) {
        let (tx, rx) = unbounded();
        let mut debouncer = EventDebouncer::new(config);
        debouncer
            .start(Sink::Each(Box::new(move |event| {
                tx.send(event).unwrap();
            })))
            .expect("debouncer to start");
        (debouncer, rx)
    }

    fn modified(path: &str) -> FsEvent {
        FsEvent::new(PathBuf::from(path), FileEventKind::Modified)
    }

    #[test]
    #[timeout(30000)]
    fn storm_coalesces_to_one_delivery() {
        let (debouncer, rx) = started(quick_config());

        for _ in 0..2 {
            assert_ne!(debouncer.submit(modified("/a")), Submit::Dropped);
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(debouncer.submit(modified("/a")), Submit::Coalesced);

        let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivered.path, PathBuf::from("/a"));
        assert_eq!(delivered.kind, FileEventKind::Modified);
        assert!(delivered.coalesced);

        // nothing else comes out of the window
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(debouncer.stats().events_coalesced, 2);
        assert_eq!(debouncer.stats().events_processed, 1);
    }

    #[test]
    #[timeout(30000)]
    fn deletion_is_never_downgraded() {
        let (debouncer, rx) = started(quick_config());

        debouncer.submit(modified("/a"));
        thread::sleep(Duration::from_millis(50));
        debouncer.submit(FsEvent::new(PathBuf::from("/a"), FileEventKind::Deleted));
        // a trailing modified must not resurrect the file
        debouncer.submit(modified("/a"));

        let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivered.kind, FileEventKind::Deleted);
        assert!(delivered.coalesced);
    }

    #[test]
    #[timeout(30000)]
    fn later_event_wins_within_window() {
        let (debouncer, rx) = started(quick_config());

        debouncer.submit(FsEvent::new(PathBuf::from("/a"), FileEventKind::Created));
        debouncer.submit(modified("/a"));

        let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivered.kind, FileEventKind::Modified);
    }

    #[test]
    #[timeout(30000)]
    fn separate_windows_deliver_separately() {
        let (debouncer, rx) = started(quick_config());

        debouncer.submit(modified("/a"));
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!first.coalesced);

        debouncer.submit(modified("/a"));
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!second.coalesced);
    }

    #[test]
    #[timeout(30000)]
    fn full_pending_set_drops() {
        let (debouncer, _rx) = started(DebounceConfig {
            delay: Duration::from_secs(5),
            max_pending: 2,
            coalesce: true,
        });

        assert_eq!(debouncer.submit(modified("/a")), Submit::Accepted);
        assert_eq!(debouncer.submit(modified("/b")), Submit::Accepted);
        assert_eq!(debouncer.submit(modified("/c")), Submit::Dropped);
        // an already-pending path still coalesces when the set is full
        assert_eq!(debouncer.submit(modified("/a")), Submit::Coalesced);

        assert_eq!(debouncer.stats().events_dropped, 1);
    }

    #[test]
    #[timeout(30000)]
    fn stop_flushes_pending_events() {
        let (mut debouncer, rx) = started(DebounceConfig {
            delay: Duration::from_secs(60),
            ..quick_config()
        });

        debouncer.submit(modified("/a"));
        debouncer.submit(modified("/b"));
        debouncer.stop();

        let mut flushed: Vec<FsEvent> = rx.try_iter().collect();
        flushed.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].path, PathBuf::from("/a"));
        assert_eq!(flushed[1].path, PathBuf::from("/b"));
    }

    #[test]
    #[timeout(30000)]
    fn batched_sink_groups_events() {
        let (tx, rx) = unbounded();
        let mut debouncer = EventDebouncer::new(quick_config());
        debouncer
            .start(Sink::Batched(
                Box::new(move |batch: Vec<FsEvent>| {
                    tx.send(batch).unwrap();
                }),
                Duration::from_millis(150),
            ))
            .unwrap();

        debouncer.submit(modified("/a"));
        debouncer.submit(modified("/b"));

        let batch = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    #[timeout(30000)]
    fn panicking_callback_does_not_kill_the_loop() {
        let (tx, rx) = unbounded();
        let mut debouncer = EventDebouncer::new(quick_config());
        let mut first = true;
        debouncer
            .start(Sink::Each(Box::new(move |event| {
                if first {
                    first = false;
                    panic!("boom");
                }
                tx.send(event).unwrap();
            })))
            .unwrap();

        debouncer.submit(modified("/a"));
        thread::sleep(Duration::from_millis(250));
        debouncer.submit(modified("/b"));

        let survivor = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(survivor.path, PathBuf::from("/b"));
    }
}
