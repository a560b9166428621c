//! In-flight request bookkeeping.
//!
//! # Responsibilities
//! - Generate unique request IDs
//! - Track every outstanding request in one table
//! - Decide, in `cleanup`, whether a request stays or is torn down
//!
//! # Design Decisions
//! - `RequestTable::cleanup` is the only place a request leaves the table
//! - A forced abort always wins over "still active"

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::watch;

/// Relaxed ordering is enough; IDs only need to be unique.
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one HTTP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        Self(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// One outstanding request.
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    prefix: String,
    active: AtomicBool,
    upgraded: AtomicBool,
    exchanges: AtomicU32,
    abort: watch::Sender<bool>,
    started: Instant,
}

impl Request {
    pub fn new(id: RequestId, prefix: &str) -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            id,
            prefix: prefix.to_string(),
            active: AtomicBool::new(true),
            upgraded: AtomicBool::new(false),
            exchanges: AtomicU32::new(1),
            abort,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// URL prefix of the site that received the request.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// The connection now carries a WebSocket or event stream.
    pub fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::SeqCst);
        self.set_active(true);
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::SeqCst)
    }

    /// Re-arm a request that stays in the pool for another exchange.
    pub fn restart(&self) {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        self.set_active(true);
    }

    pub fn exchanges(&self) -> u32 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Ask whoever serves the request to stop.
    pub fn abort(&self) {
        self.abort.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolve once `abort` has been called.
    pub async fn aborted(&self) {
        let mut rx = self.abort.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    pub fn age(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

/// Every outstanding request, keyed by ID.
#[derive(Debug, Default)]
pub struct RequestTable {
    requests: DashMap<RequestId, Arc<Request>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RequestId, prefix: &str) -> Arc<Request> {
        let request = Arc::new(Request::new(id, prefix));
        self.requests.insert(id, Arc::clone(&request));
        request
    }

    pub fn get(&self, id: RequestId) -> Option<Arc<Request>> {
        self.requests.get(&id).map(|r| Arc::clone(r.value()))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|r| *r.key()).collect()
    }

    /// Decide what happens to a request after one unit of work.
    ///
    /// Returns true when the request stays associated with the pool.
    /// `forced` tears the request down regardless of its state.
    pub fn cleanup(&self, id: RequestId, stay: bool, forced: bool) -> bool {
        let Some(request) = self.get(id) else {
            return false;
        };
        if forced {
            request.abort();
            self.requests.remove(&id);
            tracing::debug!(request_id = %id, "Request aborted");
            return false;
        }
        if request.is_active() {
            return true;
        }
        if stay {
            request.restart();
            return true;
        }
        self.requests.remove(&id);
        tracing::trace!(request_id = %id, elapsed_ms = request.age().as_millis() as u64, "Request finished");
        false
    }

    /// Abort and drop every request.
    pub fn abort_all(&self) -> usize {
        let ids = self.ids();
        ids.iter().filter(|&&id| !self.cleanup(id, false, true)).count()
    }
}
