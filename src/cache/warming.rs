//! Cache warming: proactively refresh entries from registered loaders.
//!
//! Items are queued FIFO and drained in fixed-size batches. Loaders in a batch
//! run concurrently on their own tasks, so a failing or panicking loader does
//! not affect its siblings. At most one batch is in flight at a time.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::cache::options::CacheOptions;

/// Zero-argument producer of a fresh value.
pub type Loader = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`Loader`].
pub fn loader<F, Fut>(f: F) -> Loader
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as BoxFuture<'static, anyhow::Result<Value>>)
}

pub struct WarmingItem {
    pub key: String,
    pub loader: Loader,
    pub options: CacheOptions,
}

/// Outcome of one warming batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmingReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// FIFO queue plus the in-flight flag.
pub struct WarmingQueue {
    items: Mutex<VecDeque<WarmingItem>>,
    batch_size: usize,
    warming: AtomicBool,
}

impl WarmingQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
            warming: AtomicBool::new(false),
        }
    }

    pub fn push(&self, item: WarmingItem) {
        self.items.lock().push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Claim the in-flight slot and pop the next batch. Returns None if a
    /// batch is already running.
    pub fn begin_batch(&self) -> Option<BatchGuard<'_>> {
        if self.warming.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut items = self.items.lock();
        let n = self.batch_size.min(items.len());
        let batch = items.drain(..n).collect();
        Some(BatchGuard { queue: self, batch })
    }
}

/// Holds the in-flight slot until dropped.
pub struct BatchGuard<'a> {
    queue: &'a WarmingQueue,
    pub batch: Vec<WarmingItem>,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.queue.warming.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str) -> WarmingItem {
        WarmingItem {
            key: key.to_string(),
            loader: loader(|| async { Ok(Value::Null) }),
            options: CacheOptions::default(),
        }
    }

    #[test]
    fn test_fifo_batches() {
        let queue = WarmingQueue::new(2);
        for key in ["a", "b", "c"] {
            queue.push(item(key));
        }

        let guard = queue.begin_batch().unwrap();
        let keys: Vec<_> = guard.batch.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        drop(guard);

        let guard = queue.begin_batch().unwrap();
        assert_eq!(guard.batch.len(), 1);
        assert_eq!(guard.batch[0].key, "c");
    }

    #[test]
    fn test_single_batch_in_flight() {
        let queue = WarmingQueue::new(2);
        queue.push(item("a"));

        let first = queue.begin_batch().unwrap();
        assert!(queue.begin_batch().is_none());
        drop(first);
        assert!(queue.begin_batch().is_some());
    }
}
