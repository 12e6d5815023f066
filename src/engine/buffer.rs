use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use crate::error::{Error, Result};
use crate::observability::metrics::{BUFFER_DEPTH, BUFFER_DROPPED};
use crate::types::BufferItem;

/// Bounded result buffer between the fetch path and the normalization layer.
///
/// Fetches push into an mpsc queue without ever waiting. The queue processor is
/// the single consumer: it moves items in batches into the ready list that
/// `take` drains. Both stages hold at most `capacity` items.
pub struct ResultBuffer {
    tx: mpsc::Sender<BufferItem>,
    rx: tokio::sync::Mutex<mpsc::Receiver<BufferItem>>,
    ready: Mutex<VecDeque<BufferItem>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl ResultBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        ResultBuffer {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            ready: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues without waiting; a full queue drops the item.
    pub fn push(&self, item: BufferItem) -> Result<()> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.update_depth();
                Ok(())
            }
            Err(TrySendError::Full(item)) | Err(TrySendError::Closed(item)) => {
                self.record_drop();
                tracing::warn!(
                    source = %item.source,
                    capacity = self.capacity,
                    "Result queue full, dropping item"
                );
                Err(Error::BufferFull(item.source))
            }
        }
    }

    /// Waits up to `linger` for the first queued item, then moves it and
    /// whatever else is already queued, up to `batch_size`, to the ready list.
    pub async fn process_batch(&self, batch_size: usize, linger: Duration) -> usize {
        let mut rx = self.rx.lock().await;

        let first = match tokio::time::timeout(linger, rx.recv()).await {
            Ok(Some(item)) => item,
            Ok(None) | Err(_) => return 0,
        };

        let mut batch = Vec::with_capacity(batch_size.clamp(1, 1024));
        batch.push(first);
        while batch.len() < batch_size.max(1) {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        drop(rx);

        let moved = batch.len();
        self.make_ready(batch);
        moved
    }

    /// Moves everything still queued to the ready list.
    pub async fn drain_queue(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut batch = Vec::new();
        while let Ok(item) = rx.try_recv() {
            batch.push(item);
        }
        drop(rx);

        let moved = batch.len();
        self.make_ready(batch);
        moved
    }

    fn make_ready(&self, batch: Vec<BufferItem>) {
        let mut evicted: u64 = 0;
        {
            let mut ready = self.ready.lock().expect("result buffer lock poisoned");
            for item in batch {
                if ready.len() == self.capacity {
                    ready.pop_front();
                    evicted += 1;
                }
                ready.push_back(item);
            }
        }

        if evicted > 0 {
            self.dropped.fetch_add(evicted, Ordering::Relaxed);
            BUFFER_DROPPED.inc_by(evicted);
            tracing::warn!(evicted, "Ready buffer full, evicted oldest items");
        }
        self.update_depth();
    }

    /// Removes up to `max_items` ready items, oldest first.
    pub fn take(&self, max_items: usize) -> Vec<BufferItem> {
        let items: Vec<BufferItem> = {
            let mut ready = self.ready.lock().expect("result buffer lock poisoned");
            let n = max_items.min(ready.len());
            ready.drain(..n).collect()
        };
        self.update_depth();
        items
    }

    pub fn queued_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().expect("result buffer lock poisoned").len()
    }

    pub fn len(&self) -> usize {
        self.queued_len() + self.ready_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        BUFFER_DROPPED.inc();
    }

    fn update_depth(&self) {
        BUFFER_DEPTH.set(self.len() as i64);
    }
}
