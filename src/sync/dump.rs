// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dump signals from `icinga:dump`.
//!
//! The producer announces `state=wip` when it starts republishing its object
//! graph and `state=done` per key once a key is complete (`key=*` once
//! everything is). Each type's full sync waits for its own key; runtime
//! updates wait for the all-done signal.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::{CacheClient, StreamEntry};

pub const DUMP_STREAM: &str = "icinga:dump";

struct State {
    done: HashMap<String, CancellationToken>,
    all_done: CancellationToken,
}

/// Single-fire `done` signals per key, reset by every `wip`.
#[derive(Clone)]
pub struct DumpSignals {
    state: Arc<Mutex<State>>,
    generation: Arc<watch::Sender<u64>>,
}

impl Default for DumpSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpSignals {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State {
                done: HashMap::new(),
                all_done: CancellationToken::new(),
            })),
            generation: Arc::new(generation),
        }
    }

    /// Fires once `key` has been dumped completely, or once every key has.
    pub fn done(&self, key: &str) -> CancellationToken {
        let mut guard = self.state.lock();
        let all_done = guard.all_done.is_cancelled();
        let token = guard.done.entry(key.to_string()).or_default();
        if all_done {
            token.cancel();
        }
        token.clone()
    }

    /// Fires once every key has been dumped.
    pub fn all_done(&self) -> CancellationToken {
        self.state.lock().all_done.clone()
    }

    /// Bumped whenever a new dump begins.
    pub fn in_progress(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Apply one `(key, state)` signal.
    pub fn handle(&self, key: &str, state: &str) {
        let mut guard = self.state.lock();
        match state {
            "wip" => {
                let fired = guard.all_done.is_cancelled() || guard.done.values().any(|t| t.is_cancelled());
                guard.done.retain(|_, token| !token.is_cancelled());
                if guard.all_done.is_cancelled() {
                    guard.all_done = CancellationToken::new();
                }
                drop(guard);
                if fired {
                    info!(key, "Dump in progress, resetting signals");
                }
                self.generation.send_modify(|g| *g += 1);
            }
            "done" if key == "*" => {
                guard.all_done.cancel();
                guard.done.values().for_each(CancellationToken::cancel);
                debug!("Dump complete");
            }
            "done" => {
                guard.done.entry(key.to_string()).or_default().cancel();
                debug!(key, "Dump of key complete");
            }
            other => warn!(key, state = other, "Unknown dump state"),
        }
    }

    fn handle_entry(&self, entry: &StreamEntry) {
        match (entry.fields.get("key"), entry.fields.get("state")) {
            (Some(key), Some(state)) => self.handle(key, state),
            _ => warn!(stream_id = %entry.id, "Malformed dump signal, skipping"),
        }
    }

    /// Follow `icinga:dump` from the beginning until cancelled.
    pub async fn listen(&self, cache: &CacheClient, cancel: &CancellationToken) -> Result<()> {
        let mut reader = cache.stream_reader().await?;
        let mut position = vec![(DUMP_STREAM.to_string(), "0-0".to_string())];
        loop {
            for (_, entries) in reader.read_until_result(cancel, &position).await? {
                for entry in &entries {
                    self.handle_entry(entry);
                }
                if let Some(last) = entries.last() {
                    position[0].1 = last.id.clone();
                }
            }
        }
    }
}
