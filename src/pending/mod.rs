use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;

pub const CONNECTION_LOST: &str = "Connection lost";

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Success(Option<Value>),
    /// The server answered with an error.
    Failed(String),
    /// The slot was force-resolved because its connection went away.
    Cancelled(String),
}

struct Slot {
    waiter: oneshot::Sender<InvocationOutcome>,
    created_at: Instant,
}

/// Outstanding invocations keyed by invocation id. Each slot resolves at most once
/// and leaves the table when it does.
#[derive(Default)]
pub struct PendingInvocations {
    slots: Mutex<HashMap<String, Slot>>,
}

impl PendingInvocations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, invocation_id: impl Into<String>) -> oneshot::Receiver<InvocationOutcome> {
        let (waiter, rx) = oneshot::channel();
        let slot = Slot {
            waiter,
            created_at: Instant::now(),
        };
        self.lock().insert(invocation_id.into(), slot);
        rx
    }

    /// Returns `false` when no slot was waiting under `invocation_id`.
    pub fn resolve(&self, invocation_id: &str, outcome: InvocationOutcome) -> bool {
        let Some(slot) = self.lock().remove(invocation_id) else {
            return false;
        };
        if slot.waiter.send(outcome).is_err() {
            tracing::debug!(invocation_id, "invocation waiter already gone");
        }
        true
    }

    pub fn remove(&self, invocation_id: &str) -> bool {
        self.lock().remove(invocation_id).is_some()
    }

    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, Slot)> = self.lock().drain().collect();
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), reason, "cancelling pending invocations");
        }
        let count = drained.len();
        for (invocation_id, slot) in drained {
            tracing::debug!(
                invocation_id = %invocation_id,
                age_ms = slot.created_at.elapsed().as_millis() as u64,
                "invocation cancelled"
            );
            let _ = slot.waiter.send(InvocationOutcome::Cancelled(reason.to_string()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Monotonic invocation ids, rendered as decimal strings.
#[derive(Debug, Default)]
pub struct InvocationIds {
    counter: AtomicU64,
}

impl InvocationIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        (self.counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_once_and_removes_slot() {
        let pending = PendingInvocations::new();
        let rx = pending.register("1");
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve("1", InvocationOutcome::Success(Some(json!({"ok": true})))));
        assert!(pending.is_empty());
        assert!(!pending.resolve("1", InvocationOutcome::Failed("late".into())));

        let outcome = rx.await.unwrap();
        assert_eq!(outcome, InvocationOutcome::Success(Some(json!({"ok": true}))));
    }

    #[tokio::test]
    async fn unknown_id_is_a_noop() {
        let pending = PendingInvocations::new();
        let _rx = pending.register("5");
        assert!(!pending.resolve("6", InvocationOutcome::Success(None)));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_resolves_every_waiter_with_reason() {
        let pending = PendingInvocations::new();
        let waiters: Vec<_> = (1..=3).map(|i| pending.register(i.to_string())).collect();

        assert_eq!(pending.cancel_all(CONNECTION_LOST), 3);
        assert!(pending.is_empty());

        for rx in waiters {
            assert_eq!(
                rx.await.unwrap(),
                InvocationOutcome::Cancelled(CONNECTION_LOST.to_string())
            );
        }
        assert_eq!(pending.cancel_all(CONNECTION_LOST), 0);
    }

    #[test]
    fn resolve_after_waiter_dropped_still_clears_slot() {
        let pending = PendingInvocations::new();
        drop(pending.register("9"));
        assert!(pending.resolve("9", InvocationOutcome::Success(None)));
        assert!(pending.is_empty());
    }

    #[test]
    fn invocation_ids_increase_monotonically() {
        let ids = InvocationIds::new();
        assert_eq!(ids.next(), "1");
        assert_eq!(ids.next(), "2");
        assert_eq!(ids.next(), "3");
    }
}
