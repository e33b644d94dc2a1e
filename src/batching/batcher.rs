// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel-fed batching for bulk writes.
//!
//! The [`Batcher`] pulls items from a channel and yields batches based on
//! two thresholds: item count and time since the first buffered item. A
//! closed channel flushes whatever is left.
//!
//! The buffer lives in the struct, so [`Batcher::next_batch`] is
//! cancel-safe inside `tokio::select!`.
//!
//! # Example
//!
//! ```
//! use icingadb_sync::batching::{BatchConfig, Batcher};
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (tx, rx) = mpsc::channel(8);
//! let mut batcher = Batcher::new(rx, BatchConfig { flush_count: 2, flush_interval: Duration::from_millis(250) });
//!
//! tx.send(1).await.unwrap();
//! tx.send(2).await.unwrap();
//! tx.send(3).await.unwrap();
//! drop(tx);
//!
//! assert_eq!(batcher.next_batch().await.unwrap().items, vec![1, 2]);
//! assert_eq!(batcher.next_batch().await.unwrap().items, vec![3]);
//! assert!(batcher.next_batch().await.is_none());
//! # }
//! ```

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Item count threshold reached
    Count,
    /// Time threshold reached
    Time,
    /// Source channel closed
    Closed,
}

/// Configuration for batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush after this many items
    pub flush_count: usize,
    /// Flush this long after the first buffered item
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_count: 1000,
            flush_interval: Duration::from_millis(250),
        }
    }
}

/// A batch of items ready for flush
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub reason: FlushReason,
}

pub struct Batcher<T> {
    rx: mpsc::Receiver<T>,
    config: BatchConfig,
    items: Vec<T>,
    deadline: Option<Instant>,
    closed: bool,
}

impl<T> Batcher<T> {
    pub fn new(rx: mpsc::Receiver<T>, config: BatchConfig) -> Self {
        let config = BatchConfig {
            flush_count: config.flush_count.max(1),
            ..config
        };
        Self {
            rx,
            items: Vec::with_capacity(config.flush_count.min(1024)),
            config,
            deadline: None,
            closed: false,
        }
    }

    /// Number of items buffered but not yet flushed.
    pub fn pending(&self) -> usize {
        self.items.len()
    }

    fn take(&mut self, reason: FlushReason) -> FlushBatch<T> {
        self.deadline = None;
        let items = std::mem::take(&mut self.items);
        trace!(count = items.len(), ?reason, "Flushing batch");
        FlushBatch { items, reason }
    }

    /// Wait for the next batch. Returns `None` once the source is closed and
    /// everything has been flushed.
    pub async fn next_batch(&mut self) -> Option<FlushBatch<T>> {
        loop {
            if self.items.len() >= self.config.flush_count {
                return Some(self.take(FlushReason::Count));
            }
            if self.closed {
                if self.items.is_empty() {
                    return None;
                }
                return Some(self.take(FlushReason::Closed));
            }

            match self.deadline {
                None => match self.rx.recv().await {
                    Some(item) => {
                        self.deadline = Some(Instant::now() + self.config.flush_interval);
                        self.items.push(item);
                    }
                    None => self.closed = true,
                },
                Some(deadline) => {
                    tokio::select! {
                        item = self.rx.recv() => match item {
                            Some(item) => self.items.push(item),
                            None => self.closed = true,
                        },
                        _ = sleep_until(deadline) => {
                            return Some(self.take(FlushReason::Time));
                        }
                    }
                }
            }
        }
    }
}

/// Split a batch so no sub-batch contains the same key twice.
///
/// Order is preserved: a repeated key starts a new sub-batch, so executing
/// the sub-batches in sequence lets the later value win.
pub fn split_duplicates<T, K, F>(items: Vec<T>, key: F) -> Vec<Vec<T>>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut seen = HashSet::new();

    for item in items {
        if !seen.insert(key(&item)) {
            batches.push(std::mem::take(&mut current));
            seen.clear();
            seen.insert(key(&item));
        }
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(count: usize, ms: u64) -> BatchConfig {
        BatchConfig {
            flush_count: count,
            flush_interval: Duration::from_millis(ms),
        }
    }

    #[tokio::test]
    async fn test_flush_on_count() {
        let (tx, rx) = mpsc::channel(16);
        let mut batcher = Batcher::new(rx, config(3, 10_000));
        for i in 0..3 {
            tx.send(i).await.unwrap();
        }

        let batch = batcher.next_batch().await.unwrap();
        assert_eq!(batch.items, vec![0, 1, 2]);
        assert_eq!(batch.reason, FlushReason::Count);
    }

    #[tokio::test]
    async fn test_flush_on_time() {
        let (tx, rx) = mpsc::channel(16);
        let mut batcher = Batcher::new(rx, config(100, 20));
        tx.send("a").await.unwrap();

        let batch = batcher.next_batch().await.unwrap();
        assert_eq!(batch.items, vec!["a"]);
        assert_eq!(batch.reason, FlushReason::Time);
        drop(tx);
        assert!(batcher.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_flush_on_close() {
        let (tx, rx) = mpsc::channel(16);
        let mut batcher = Batcher::new(rx, config(100, 10_000));
        tx.send(1).await.unwrap();
        drop(tx);

        let batch = batcher.next_batch().await.unwrap();
        assert_eq!(batch.reason, FlushReason::Closed);
        assert!(batcher.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_buffer_survives_cancellation() {
        let (tx, rx) = mpsc::channel(16);
        let mut batcher = Batcher::new(rx, config(10, 10_000));
        tx.send(1).await.unwrap();

        // Interrupt the wait; the buffered item must not be lost.
        let _ = tokio::time::timeout(Duration::from_millis(10), batcher.next_batch()).await;
        assert_eq!(batcher.pending(), 1);

        drop(tx);
        assert_eq!(batcher.next_batch().await.unwrap().items, vec![1]);
    }

    #[test]
    fn test_split_duplicates_keeps_order() {
        let items = vec![("a", 1), ("b", 1), ("a", 2), ("c", 1), ("a", 3)];
        let batches = split_duplicates(items, |(k, _)| *k);
        assert_eq!(
            batches,
            vec![
                vec![("a", 1), ("b", 1)],
                vec![("a", 2), ("c", 1)],
                vec![("a", 3)],
            ]
        );
    }

    #[test]
    fn test_split_without_duplicates_is_single_batch() {
        let batches = split_duplicates(vec![1, 2, 3], |i| *i);
        assert_eq!(batches, vec![vec![1, 2, 3]]);
    }
}
