//! Worker pool servicing the request queue and channel callbacks.
//!
//! Work arrives as a [`WorkItem`]; a fixed number of worker tasks share
//! one queue. Requests go through the start hook and then the cleanup
//! hook, which alone decides whether a request is torn down.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::event::{ChannelEvent, EventCallback};
use crate::http::queue::{QueuedRequest, RequestQueue};
use crate::http::request::RequestId;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_ROUNDS: u32 = 100;

/// One unit of work for the pool.
pub enum WorkItem {
    NewConnection(QueuedRequest),
    CancelRequest { id: RequestId, forced: bool },
    ChannelEvent { callback: EventCallback, event: ChannelEvent },
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItem::NewConnection(request) => f.debug_tuple("NewConnection").field(&request.id).finish(),
            WorkItem::CancelRequest { id, forced } => f
                .debug_struct("CancelRequest")
                .field("id", id)
                .field("forced", forced)
                .finish(),
            WorkItem::ChannelEvent { event, .. } => f.debug_tuple("ChannelEvent").field(event).finish(),
        }
    }
}

/// Hooks the pool drives for request work.
pub trait WorkHandler: Send + Sync {
    /// Run one request to the point where its response is out.
    fn start_request(&self, request: QueuedRequest) -> BoxFuture<'static, ()>;
    /// Decide the fate of a request after a unit of work. Returns true if
    /// the request stays associated with the pool.
    fn cleanup_request(&self, id: RequestId, stay: bool, forced: bool) -> bool;
}

/// Anything that accepts work items. False means the item was refused.
pub trait WorkSubmitter: Send + Sync {
    fn submit_work(&self, item: WorkItem) -> bool;
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStatus {
    pub workers: usize,
    pub running: bool,
    pub submitted: u64,
    pub completed: u64,
    pub in_flight: usize,
}

pub struct ThreadPool {
    workers: usize,
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ThreadPool {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            workers: workers.max(1),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            workers: self.workers,
            running: self.is_running(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Spawn the workers. Returns false if already running.
    pub fn start(&self, handler: Weak<dyn WorkHandler>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Ok(mut tasks) = self.tasks.lock() else {
            self.running.store(false, Ordering::SeqCst);
            return false;
        };
        for worker in 0..self.workers {
            tasks.push(tokio::spawn(run_worker(
                worker,
                Arc::clone(&self.rx),
                handler.clone(),
                Arc::clone(&self.counters),
            )));
        }
        tracing::info!(workers = self.workers, "Thread pool started");
        true
    }

    /// Feed every request the queue hands out into the pool.
    pub fn associate(&self, queue: &Arc<RequestQueue>) {
        let queue = Arc::clone(queue);
        let tx = self.tx.clone();
        let counters = Arc::clone(&self.counters);
        let task = tokio::spawn(async move {
            while let Some(request) = queue.read_next().await {
                counters.in_flight.fetch_add(1, Ordering::SeqCst);
                if tx.send(WorkItem::NewConnection(request)).is_err() {
                    counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
            }
            tracing::debug!(queue = %queue.name(), "Queue reader finished");
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Stop taking work, wait a bounded time for in-flight work, then
    /// abort the workers.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for _ in 0..STOP_POLL_ROUNDS {
            if self.counters.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in &tasks {
            task.abort();
        }
        let remaining = self.counters.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            tracing::warn!(remaining, "Thread pool stopped with work in flight");
        }
        tracing::info!("Thread pool stopped");
    }
}

impl WorkSubmitter for ThreadPool {
    fn submit_work(&self, item: WorkItem) -> bool {
        if !self.is_running() {
            return false;
        }
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        true
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    handler: Weak<dyn WorkHandler>,
    counters: Arc<PoolCounters>,
) {
    tracing::trace!(worker, "Worker started");
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            break;
        };
        match item {
            WorkItem::NewConnection(request) => {
                if let Some(handler) = handler.upgrade() {
                    let id = request.id;
                    handler.start_request(request).await;
                    handler.cleanup_request(id, false, false);
                }
            }
            WorkItem::CancelRequest { id, forced } => {
                if let Some(handler) = handler.upgrade() {
                    handler.cleanup_request(id, false, forced);
                }
            }
            WorkItem::ChannelEvent { callback, event } => {
                let channel = event.channel.clone();
                let event_type = event.event_type;
                if let Err(e) = callback(event) {
                    tracing::error!(
                        channel = %channel,
                        event = %event_type,
                        error = %e,
                        "Application failed on channel event"
                    );
                }
            }
        }
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }
    tracing::trace!(worker, "Worker finished");
}
