// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Set difference between the desired (cache) and actual (database) rows of
//! one entity type.
//!
//! Both sides arrive as unordered streams and are consumed concurrently.
//! Each arrival probes the opposite side; matched ids are compared by
//! checksum and leave both maps. Whatever remains when both streams close is
//! created (desired only) or deleted (actual only).

use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::types::Binary;

/// The identity of a row as far as the diff is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdChecksum {
    pub id: Binary,
    pub checksum: Option<Binary>,
}

impl IdChecksum {
    pub fn new(id: Binary, checksum: Option<Binary>) -> Self {
        Self { id, checksum }
    }
}

#[derive(Debug)]
pub struct Delta<V> {
    pub create: HashMap<String, V>,
    pub update: HashMap<String, V>,
    pub delete: HashMap<String, IdChecksum>,
    /// Ids seen more than once on either side.
    pub duplicates: usize,
}

impl<V> Default for Delta<V> {
    fn default() -> Self {
        Self {
            create: HashMap::new(),
            update: HashMap::new(),
            delete: HashMap::new(),
            duplicates: 0,
        }
    }
}

impl<V> Delta<V> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// A missing checksum on either side counts as a difference.
fn differs(actual: &Option<Binary>, desired: &Option<Binary>) -> bool {
    match (actual, desired) {
        (Some(a), Some(d)) => a != d,
        _ => true,
    }
}

struct State<V> {
    checksummed: bool,
    delta: Delta<V>,
    /// Unmatched desired rows with their checksum.
    desired: HashMap<String, (Option<Binary>, V)>,
    /// Unmatched actual rows.
    actual: HashMap<String, IdChecksum>,
    /// Actual checksum of ids matched on both sides.
    matched: HashMap<String, Option<Binary>>,
    seen_desired: HashSet<String>,
    seen_actual: HashSet<String>,
}

impl<V> State<V> {
    fn on_desired(&mut self, key: IdChecksum, value: V) {
        let hex = key.id.to_hex();
        if !self.seen_desired.insert(hex.clone()) {
            self.delta.duplicates += 1;
            // Last value wins, wherever the first one ended up.
            if let Some(actual) = self.matched.get(&hex) {
                if self.checksummed && differs(actual, &key.checksum) {
                    self.delta.update.insert(hex, value);
                } else {
                    self.delta.update.remove(&hex);
                }
                return;
            }
            self.desired.insert(hex, (key.checksum, value));
            return;
        }

        match self.actual.remove(&hex) {
            Some(actual) => {
                if self.checksummed && differs(&actual.checksum, &key.checksum) {
                    self.delta.update.insert(hex.clone(), value);
                }
                self.matched.insert(hex, actual.checksum);
            }
            None => {
                self.desired.insert(hex, (key.checksum, value));
            }
        }
    }

    fn on_actual(&mut self, row: IdChecksum) {
        let hex = row.id.to_hex();
        if !self.seen_actual.insert(hex.clone()) {
            self.delta.duplicates += 1;
            if !self.matched.contains_key(&hex) {
                self.actual.insert(hex, row);
            }
            return;
        }

        match self.desired.remove(&hex) {
            Some((checksum, value)) => {
                if self.checksummed && differs(&row.checksum, &checksum) {
                    self.delta.update.insert(hex.clone(), value);
                }
                self.matched.insert(hex, row.checksum);
            }
            None => {
                self.actual.insert(hex, row);
            }
        }
    }

    fn finish(mut self) -> Delta<V> {
        self.delta.create = self.desired.into_iter().map(|(k, (_, v))| (k, v)).collect();
        self.delta.delete = self.actual;
        self.delta
    }
}

/// Compute the delta between `actual` and `desired`. Non-checksummed types
/// never produce updates.
pub async fn compute<V, F>(
    cancel: &CancellationToken,
    checksummed: bool,
    mut actual: mpsc::Receiver<IdChecksum>,
    mut desired: mpsc::Receiver<V>,
    key: F,
) -> Result<Delta<V>>
where
    F: Fn(&V) -> IdChecksum,
{
    let mut state = State {
        checksummed,
        delta: Delta::default(),
        desired: HashMap::new(),
        actual: HashMap::new(),
        matched: HashMap::new(),
        seen_desired: HashSet::new(),
        seen_actual: HashSet::new(),
    };
    let (mut actual_open, mut desired_open) = (true, true);

    while actual_open || desired_open {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            row = actual.recv(), if actual_open => match row {
                Some(row) => state.on_actual(row),
                None => actual_open = false,
            },
            value = desired.recv(), if desired_open => match value {
                Some(value) => {
                    let k = key(&value);
                    state.on_desired(k, value);
                }
                None => desired_open = false,
            },
        }
    }

    let delta = state.finish();
    if delta.duplicates > 0 {
        warn!(duplicates = delta.duplicates, "Duplicate ids while computing delta");
    }
    Ok(delta)
}
