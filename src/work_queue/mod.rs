//! Bounded work queue with a fixed worker pool
//!
//! ## Responsibilities
//!
//! - Non-blocking, capacity-bounded enqueue (load shedding, not fault)
//! - N parallel workers running a user-supplied handler
//! - Panic firewall: a handler fault becomes a failure result, the worker
//!   survives
//! - Drain on shutdown: queued items receive a cancellation result
//!
//! A separately usable [`PriorityQueue`] ranks items upstream of the pool;
//! higher priority value wins, ties keep FIFO order.

use crate::error::{Error, Result};
use crate::models::{AnalysisResult, FrameRequest};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Handler invoked by workers for each dequeued item
pub type Handler =
    Arc<dyn Fn(FrameRequest) -> BoxFuture<'static, Result<AnalysisResult>> + Send + Sync>;

/// One unit of work. The oneshot sink guarantees at most one result; a send
/// on an abandoned sink is discarded.
pub struct QueueItem {
    pub request: FrameRequest,
    pub sink: oneshot::Sender<Result<AnalysisResult>>,
    pub enqueued_at: Instant,
    pub priority: i32,
}

/// Queue statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub workers: usize,
    pub running: bool,
    pub utilization_percent: f64,
}

/// Fixed-capacity FIFO queue with N worker tasks
pub struct ProcessingQueue {
    tx: mpsc::Sender<QueueItem>,
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    size: Arc<AtomicUsize>,
    capacity: usize,
    workers: usize,
    accepting: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessingQueue {
    /// Create the queue and start its workers.
    pub fn new(capacity: usize, workers: usize, handler: Handler) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let size = Arc::new(AtomicUsize::new(0));
        let accepting = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = rx.clone();
            let size = size.clone();
            let handler = handler.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            handles.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        item = Self::next_item(&rx) => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };
                    size.fetch_sub(1, Ordering::SeqCst);
                    Self::run_item(&handler, item).await;
                }
                tracing::debug!(worker_id = worker_id, "Queue worker stopped");
            }));
        }

        Self {
            tx,
            rx,
            size,
            capacity,
            workers,
            accepting,
            shutdown_tx,
            handles: std::sync::Mutex::new(handles),
        }
    }

    async fn next_item(rx: &Arc<Mutex<mpsc::Receiver<QueueItem>>>) -> Option<QueueItem> {
        rx.lock().await.recv().await
    }

    /// Run one handler inside the panic firewall and deliver exactly one
    /// result to the item's sink.
    async fn run_item(handler: &Handler, item: QueueItem) {
        let QueueItem { request, sink, .. } = item;

        let result = match AssertUnwindSafe(handler(request)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "Worker handler panicked");
                Err(Error::Internal(format!("processing failed: {}", message)))
            }
        };

        if sink.send(result).is_err() {
            tracing::debug!("Result sink abandoned before completion");
        }
    }

    /// Offer an item. Returns false when the queue is full or shutting down.
    /// Never suspends.
    pub fn enqueue(&self, item: QueueItem) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        // Counted before the send so a fast worker's decrement cannot race
        // the counter below zero.
        self.size.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(_) => {
                self.size.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stop intake, wait for workers to drain in-flight items, then close the
    /// channel and cancel whatever is still queued. Idempotent; a second call
    /// is a no-op.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("worker handle lock poisoned");
            guard.drain(..).collect()
        };
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        let timed_out = tokio::time::timeout(timeout, join_all).await.is_err();

        // Close intake and cancel pending items.
        {
            let mut rx = self.rx.lock().await;
            rx.close();
            while let Ok(item) = rx.try_recv() {
                self.size.fetch_sub(1, Ordering::SeqCst);
                let _ = item.sink.send(Err(Error::Internal(
                    "processing cancelled - queue shutting down".to_string(),
                )));
            }
        }

        if timed_out {
            Err(Error::Timeout("queue shutdown timeout exceeded".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        let size = self.size();
        QueueStats {
            size,
            capacity: self.capacity,
            workers: self.workers,
            running: self.is_running(),
            utilization_percent: if self.capacity > 0 {
                size as f64 / self.capacity as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Priority-ordered queue. Items are inserted before the first strictly
/// lower-priority item, so equal priorities keep arrival order.
pub struct PriorityQueue {
    items: std::sync::Mutex<Vec<QueueItem>>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            items: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: QueueItem) {
        let mut items = self.items.lock().expect("priority queue lock poisoned");
        let position = items
            .iter()
            .position(|existing| item.priority > existing.priority)
            .unwrap_or(items.len());
        items.insert(position, item);
    }

    pub fn pop(&self) -> Option<QueueItem> {
        let mut items = self.items.lock().expect("priority queue lock poisoned");
        if items.is_empty() {
            None
        } else {
            Some(items.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("priority queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items
            .lock()
            .expect("priority queue lock poisoned")
            .clear();
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
