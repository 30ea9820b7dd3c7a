//! Per-session concurrency control (C11).
//!
//! Two concurrent `/api/chat` calls for the same session would otherwise
//! interleave context construction and transcript appends. `with_lock`
//! queues callers FIFO behind a `tokio::sync::Semaphore(1)` — which is
//! itself fair/FIFO — awaits any predecessor (its outcome doesn't matter;
//! the permit releases on drop regardless of success or panic), runs the
//! closure, and drops the map entry once the queue drains so idle sessions
//! don't leak memory.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

struct LockEntry {
    sem: Arc<Semaphore>,
    waiters: AtomicUsize,
}

/// Manages per-session FIFO run locks.
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<LockEntry>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` with exclusive access to `session_id`, queueing behind any
    /// in-flight or already-queued call for the same session.
    pub async fn with_lock<F, Fut, T>(&self, session_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let entry = {
            let mut locks = self.locks.lock();
            let entry = locks
                .entry(session_id.to_owned())
                .or_insert_with(|| {
                    Arc::new(LockEntry {
                        sem: Arc::new(Semaphore::new(1)),
                        waiters: AtomicUsize::new(0),
                    })
                })
                .clone();
            entry.waiters.fetch_add(1, Ordering::SeqCst);
            entry
        };

        let permit = entry
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("session lock semaphore is never closed");

        let result = f().await;
        drop(permit);

        let remaining = entry.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let mut locks = self.locks.lock();
            if let Some(current) = locks.get(session_id) {
                if Arc::ptr_eq(current, &entry) && entry.waiters.load(Ordering::SeqCst) == 0 {
                    locks.remove(session_id);
                }
            }
        }

        result
    }

    /// Number of sessions with a live or queued lock (for monitoring).
    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_access() {
        let map = SessionLockMap::new();
        map.with_lock("s1", || async { 1 }).await;
        map.with_lock("s1", || async { 2 }).await;
        assert_eq!(map.session_count(), 0);
    }

    #[tokio::test]
    async fn different_sessions_run_concurrently() {
        let map = Arc::new(SessionLockMap::new());
        let m1 = map.clone();
        let m2 = map.clone();

        let h1 = tokio::spawn(async move {
            m1.with_lock("s1", || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
            })
            .await;
        });
        let h2 = tokio::spawn(async move {
            m2.with_lock("s2", || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(map.session_count(), 2);

        h1.await.unwrap();
        h2.await.unwrap();
        assert_eq!(map.session_count(), 0);
    }

    #[tokio::test]
    async fn same_session_serializes_in_order() {
        let map = Arc::new(SessionLockMap::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let map = map.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                map.with_lock("s1", || async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    order.lock().push(i);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(map.session_count(), 0);
    }

    #[tokio::test]
    async fn predecessor_panic_does_not_wedge_the_queue() {
        let map = Arc::new(SessionLockMap::new());
        let counter = Arc::new(AtomicU32::new(0));

        let m1 = map.clone();
        let h1 = tokio::spawn(async move {
            m1.with_lock("s1", || async { panic!("boom") }).await;
        });
        let _ = h1.await; // JoinError — the panic is caught here, not propagated.

        let m2 = map.clone();
        let counter2 = counter.clone();
        m2.with_lock("s1", || {
            let counter2 = counter2.clone();
            async move {
                counter2.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
