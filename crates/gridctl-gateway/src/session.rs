//! Streaming client sessions: per-session bounded notification queues
//! (drop-oldest, never block the publisher), TTL idle eviction, a global
//! cap with oldest-first eviction, and graceful shutdown broadcast.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

pub const LIST_CHANGED_METHOD: &str = "notifications/tools/list_changed";
pub const SHUTDOWN_METHOD: &str = "notifications/shutdown";

/// One streaming session. The transport holds a writer task that drains
/// the queue; everything else only enqueues.
#[derive(Debug)]
pub struct Session {
    id: String,
    identity: Option<String>,
    created_at: Instant,
    opened_at: DateTime<Utc>,
    queue: Mutex<VecDeque<Value>>,
    queue_capacity: usize,
    notify: Notify,
    closed: CancellationToken,
    last_activity: Mutex<Instant>,
}

impl Session {
    fn new(identity: Option<String>, queue_capacity: usize) -> Self {
        Self {
            id: Ulid::new().to_string(),
            identity,
            created_at: Instant::now(),
            opened_at: Utc::now(),
            queue: Mutex::new(VecDeque::new()),
            queue_capacity: queue_capacity.max(1),
            notify: Notify::new(),
            closed: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Enqueue one outbound notification, dropping the oldest entry on
    /// overflow. Delivery order is enqueue order.
    pub fn enqueue(&self, message: Value) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() == self.queue_capacity {
                queue.pop_front();
                tracing::warn!(session = %self.id, "session queue overflow, dropping oldest notification");
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Value> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait for the next outbound message; `None` once the session is
    /// closed and the queue is fully drained.
    pub async fn next_message(&self) -> Option<Value> {
        loop {
            if let Some(message) = self.pop() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            tokio::select! {
                _ = self.closed.cancelled() => {
                    // Drain anything enqueued just before the close.
                    return self.pop();
                }
                _ = self.notify.notified() => {}
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
        self.notify.notify_one();
    }
}

#[derive(Debug)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    cap: usize,
    ttl: Duration,
    queue_capacity: usize,
    accepting: AtomicBool,
}

impl SessionManager {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            cap: cap.max(1),
            ttl,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            accepting: AtomicBool::new(true),
        }
    }

    /// Open a session. Exceeding the cap evicts the oldest session first;
    /// the live total never passes the cap.
    pub fn open(&self, identity: Option<String>) -> Option<Arc<Session>> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }

        let session = Arc::new(Session::new(identity, self.queue_capacity));
        let evicted = {
            let mut sessions = self.lock();
            let mut evicted = Vec::new();
            while sessions.len() >= self.cap {
                let Some(oldest_id) = sessions
                    .values()
                    .min_by_key(|s| s.created_at)
                    .map(|s| s.id().to_string())
                else {
                    break;
                };
                if let Some(old) = sessions.remove(&oldest_id) {
                    evicted.push(old);
                }
            }
            sessions.insert(session.id().to_string(), Arc::clone(&session));
            evicted
        };
        for old in evicted {
            tracing::warn!(session = %old.id(), "evicting oldest session over cap");
            old.close();
        }
        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    pub fn close(&self, id: &str) {
        if let Some(session) = self.lock().remove(id) {
            session.close();
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Enqueue to every live session, in no cross-session order.
    pub fn broadcast(&self, message: Value) {
        let sessions: Vec<Arc<Session>> = self.lock().values().cloned().collect();
        for session in sessions {
            session.enqueue(message.clone());
        }
    }

    pub fn broadcast_list_changed(&self) {
        self.broadcast(json!({
            "jsonrpc": "2.0",
            "method": LIST_CHANGED_METHOD,
        }));
    }

    /// Drop sessions idle past the TTL.
    pub fn evict_idle(&self) {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.idle_for() >= self.ttl)
                .map(|s| s.id().to_string())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in expired {
            tracing::info!(session = %session.id(), "evicting idle session");
            session.close();
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Graceful shutdown: stop accepting, broadcast a shutdown
    /// notification, give writers up to `grace` to drain, then close.
    pub async fn shutdown_all(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);
        self.broadcast(json!({
            "jsonrpc": "2.0",
            "method": SHUTDOWN_METHOD,
        }));

        let deadline = Instant::now() + grace;
        loop {
            let drained = self.lock().values().all(|s| s.queued() == 0);
            if drained || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let sessions: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    /// Background sweeper: idle eviction on a fixed cadence until
    /// cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => manager.evict_idle(),
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifications_deliver_in_enqueue_order() {
        let manager = SessionManager::new(8, Duration::from_secs(60));
        let session = manager.open(Some("alpha".to_string())).unwrap();

        session.enqueue(json!({"seq": 1}));
        session.enqueue(json!({"seq": 2}));

        assert_eq!(session.next_message().await.unwrap()["seq"], 1);
        assert_eq!(session.next_message().await.unwrap()["seq"], 2);
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest() {
        let manager = SessionManager::new(8, Duration::from_secs(60));
        let session = manager.open(None).unwrap();

        for seq in 0..(DEFAULT_QUEUE_CAPACITY + 3) {
            session.enqueue(json!({"seq": seq}));
        }

        // The three oldest were dropped.
        assert_eq!(session.next_message().await.unwrap()["seq"], 3);
    }

    #[tokio::test]
    async fn cap_evicts_oldest_session_first() {
        let manager = SessionManager::new(2, Duration::from_secs(60));
        let first = manager.open(None).unwrap();
        let second = manager.open(None).unwrap();
        let _third = manager.open(None).unwrap();

        assert_eq!(manager.count(), 2);
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session() {
        let manager = SessionManager::new(8, Duration::from_secs(60));
        let a = manager.open(None).unwrap();
        let b = manager.open(None).unwrap();

        manager.broadcast_list_changed();

        for session in [&a, &b] {
            let message = session.next_message().await.unwrap();
            assert_eq!(message["method"], LIST_CHANGED_METHOD);
        }
    }

    #[tokio::test]
    async fn shutdown_broadcasts_then_closes() {
        let manager = SessionManager::new(8, Duration::from_secs(60));
        let a = manager.open(None).unwrap();
        let b = manager.open(None).unwrap();

        manager.shutdown_all(Duration::from_millis(200)).await;

        assert!(!manager.is_accepting());
        assert_eq!(manager.count(), 0);
        assert!(manager.open(None).is_none());

        for session in [&a, &b] {
            let message = session.next_message().await.unwrap();
            assert_eq!(message["method"], SHUTDOWN_METHOD);
            assert!(session.next_message().await.is_none());
        }
    }

    #[tokio::test]
    async fn idle_sessions_expire_after_ttl() {
        let manager = SessionManager::new(8, Duration::from_millis(50));
        let stale = manager.open(None).unwrap();
        let fresh = manager.open(None).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        fresh.touch();
        manager.evict_idle();

        assert!(stale.is_closed());
        assert!(!fresh.is_closed());
        assert_eq!(manager.count(), 1);
    }
}
