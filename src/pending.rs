//! Request/response correlation over the streaming channel.
//!
//! An outgoing request that expects a reply registers a [`PendingRequest`]
//! with a match predicate and a deadline. Inbound frames are offered to the
//! registry before subscription fan-out; the first predicate hit records the
//! frame and signals the waiter. Every entry is signalled exactly once: by a
//! matching frame, by deadline expiry, or by the connection-closed sweep.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::codec::ParsedFrame;

pub(crate) type PendingPredicate = Box<dyn Fn(&ParsedFrame) -> bool + Send + Sync>;

/// A one-shot correlation entry awaiting a frame that satisfies its predicate.
pub(crate) struct PendingRequest {
    predicate: PendingPredicate,
    state: Mutex<PendingState>,
    done: Notify,
}

#[derive(Default)]
struct PendingState {
    completed: bool,
    result: Option<ParsedFrame>,
    deadline: Option<JoinHandle<()>>,
}

impl PendingRequest {
    pub(crate) fn accepts(&self, frame: &ParsedFrame) -> bool {
        (self.predicate)(frame)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Records the result and signals the waiter. Returns false when the
    /// entry was already completed by another path.
    pub(crate) fn complete(&self, result: Option<ParsedFrame>) -> bool {
        let deadline = {
            let mut state = self.state.lock();
            if state.completed {
                return false;
            }
            state.completed = true;
            state.result = result;
            state.deadline.take()
        };
        if let Some(timer) = deadline {
            timer.abort();
        }
        self.done.notify_waiters();
        true
    }

    /// Suspends until the entry is signalled; `None` means the deadline
    /// expired or the connection closed before a match arrived.
    pub(crate) async fn wait(&self) -> Option<ParsedFrame> {
        loop {
            let notified = self.done.notified();
            {
                let mut state = self.state.lock();
                if state.completed {
                    return state.result.take();
                }
            }
            notified.await;
        }
    }
}

/// Ordered set of in-flight request/response correlations.
#[derive(Default)]
pub(crate) struct PendingRegistry {
    entries: Mutex<Vec<Arc<PendingRequest>>>,
}

impl PendingRegistry {
    /// Inserts an entry and arms its deadline.
    pub(crate) fn register(
        &self,
        predicate: PendingPredicate,
        timeout: Duration,
    ) -> Arc<PendingRequest> {
        let request = Arc::new(PendingRequest {
            predicate,
            state: Mutex::new(PendingState::default()),
            done: Notify::new(),
        });

        let timer = {
            let request = Arc::clone(&request);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                request.complete(None);
            })
        };
        request.state.lock().deadline = Some(timer);

        self.entries.lock().push(Arc::clone(&request));
        request
    }

    /// Offers a frame to the registry. Entries that already completed
    /// (deadline expiry) are dropped from the live list first, then the
    /// predicates run in insertion order over a snapshot; the first match
    /// consumes the frame and removes itself.
    pub(crate) fn check_and_sweep(&self, frame: &ParsedFrame) -> bool {
        let snapshot: Vec<Arc<PendingRequest>> = {
            let mut entries = self.entries.lock();
            entries.retain(|entry| !entry.is_completed());
            entries.clone()
        };

        for entry in snapshot {
            if !entry.accepts(frame) {
                continue;
            }
            let won = entry.complete(Some(frame.clone()));
            self.entries
                .lock()
                .retain(|candidate| !Arc::ptr_eq(candidate, &entry));
            if won {
                return true;
            }
            // lost a race with the deadline; keep scanning
        }
        false
    }

    /// Signals every entry with no result. Invoked on transport close.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<Arc<PendingRequest>> = std::mem::take(&mut *self.entries.lock());
        for entry in drained {
            entry.complete(None);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    fn frame(data: serde_json::Value) -> ParsedFrame {
        ParsedFrame {
            data,
            original: None,
            received_at: Instant::now(),
            connection_id: 1,
        }
    }

    #[tokio::test]
    async fn test_match_signals_waiter_with_frame() {
        let registry = PendingRegistry::default();
        let request = registry.register(
            Box::new(|f| f.data["id"] == 7),
            Duration::from_secs(5),
        );

        assert!(!registry.check_and_sweep(&frame(json!({"id": 3}))));
        assert!(registry.check_and_sweep(&frame(json!({"id": 7, "ok": true}))));

        let result = request.wait().await.expect("expected a matched frame");
        assert_eq!(result.data["ok"], true);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_deadline_signals_no_result() {
        let registry = PendingRegistry::default();
        let request = registry.register(Box::new(|_| false), Duration::from_millis(50));

        let started = Instant::now();
        assert!(request.wait().await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept_on_next_frame() {
        let registry = PendingRegistry::default();
        let _request = registry.register(Box::new(|_| false), Duration::from_millis(10));
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.check_and_sweep(&frame(json!({"noise": true})));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_signals_every_waiter_once() {
        let registry = PendingRegistry::default();
        let first = registry.register(Box::new(|_| true), Duration::from_secs(5));
        let second = registry.register(Box::new(|_| true), Duration::from_secs(5));

        registry.fail_all();
        assert!(first.wait().await.is_none());
        assert!(second.wait().await.is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_first_match_wins_in_insertion_order() {
        let registry = PendingRegistry::default();
        let first = registry.register(Box::new(|f| f.data["id"] == 1), Duration::from_secs(5));
        let second = registry.register(Box::new(|f| f.data["id"] == 1), Duration::from_secs(5));

        assert!(registry.check_and_sweep(&frame(json!({"id": 1}))));
        assert!(first.wait().await.is_some());
        assert!(!second.is_completed());
        assert_eq!(registry.len(), 1);
    }
}
