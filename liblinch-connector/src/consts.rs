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

use std::time;

// The env var selecting which daemon environment to dial, and the
// value assumed when it is unset.
pub const ENVIRONMENT_VAR: &str = "LINCH_MIND_ENVIRONMENT";
pub const DEFAULT_ENVIRONMENT: &str = "development";

// Per-user runtime directory the daemon parks its socket under.
pub const RUNTIME_DIR_NAME: &str = ".linch-mind";

pub const JOIN_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

// How long to sleep between reachability probes in wait_for_daemon.
pub const DISCOVERY_POLL_DURATION: time::Duration = time::Duration::from_secs(1);

// Default budget for a single IPC round trip.
pub const IPC_TIMEOUT: time::Duration = time::Duration::from_secs(30);

// Frames larger than this are treated as protocol corruption rather
// than read into memory.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(30);

pub const BATCH_INTERVAL: time::Duration = time::Duration::from_millis(300);
pub const MAX_BATCH_SIZE: usize = 50;

// Capacity of the in-memory queue between the monitor callback and
// the batch sender. Overflow drops events and bumps a counter.
pub const EVENT_QUEUE_CAPACITY: usize = 10_000;

pub const DEBOUNCE_DELAY: time::Duration = time::Duration::from_millis(100);
pub const DEBOUNCE_TICK: time::Duration = time::Duration::from_millis(50);
pub const MAX_PENDING_EVENTS: usize = 1000;

pub const MAX_CHUNK_SIZE: usize = 32 * 1024;
pub const MIN_CHUNK_SIZE: usize = 1024;
pub const CHUNK_SHRINK_FACTOR: f64 = 0.8;

// Poll period for the filesystem monitor's scan fallback when no
// native event source can be built.
pub const DEFAULT_CHECK_INTERVAL: time::Duration = time::Duration::from_secs(1);
