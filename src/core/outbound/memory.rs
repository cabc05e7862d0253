use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::{
    AcquireOutcome, CapacityFn, OutboundSlot, ReleaseOutcome, SlotResult, SlotSnapshot, SlotStore,
    epoch_millis, queue_key, slots_key,
};

#[derive(Debug, Clone)]
struct Lease {
    slot: OutboundSlot,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    /// Keyed by `slots:{businessId}`, then job id.
    slots: HashMap<String, HashMap<String, Lease>>,
    /// Keyed by `queue:{businessId}`.
    queues: HashMap<String, VecDeque<String>>,
}

impl Inner {
    fn promote_next(&mut self, business_id: &str, lease: Duration) -> Option<OutboundSlot> {
        let job_id = self.queues.get_mut(&queue_key(business_id))?.pop_front()?;
        let slot = OutboundSlot {
            business_id: business_id.to_string(),
            job_id: job_id.clone(),
            acquired_at: epoch_millis(),
        };
        self.slots.entry(slots_key(business_id)).or_default().insert(
            job_id,
            Lease {
                slot: slot.clone(),
                expires_at: Instant::now() + lease,
            },
        );
        Some(slot)
    }

    fn active_len(&self, business_id: &str) -> usize {
        self.slots.get(&slots_key(business_id)).map_or(0, HashMap::len)
    }

    fn queued_len(&self, business_id: &str) -> usize {
        self.queues.get(&queue_key(business_id)).map_or(0, VecDeque::len)
    }
}

/// Single-process slot store. Every operation runs under one lock, which
/// gives the same atomicity a shared store provides with transactions.
#[derive(Default)]
pub struct MemorySlotStore {
    inner: Mutex<Inner>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn acquire(
        &self,
        business_id: &str,
        job_id: &str,
        capacity: usize,
        lease: Duration,
    ) -> SlotResult<AcquireOutcome> {
        let mut inner = self.inner.lock();

        let slots = inner.slots.entry(slots_key(business_id)).or_default();
        if let Some(held) = slots.get_mut(job_id) {
            held.expires_at = Instant::now() + lease;
            return Ok(AcquireOutcome::AlreadyActive {
                slot: held.slot.clone(),
            });
        }

        let queue = inner.queues.entry(queue_key(business_id)).or_default();
        if let Some(index) = queue.iter().position(|queued| queued == job_id) {
            return Ok(AcquireOutcome::Queued { position: index + 1 });
        }

        // Queued jobs keep priority over newcomers.
        if inner.active_len(business_id) < capacity && inner.queued_len(business_id) == 0 {
            let slot = OutboundSlot {
                business_id: business_id.to_string(),
                job_id: job_id.to_string(),
                acquired_at: epoch_millis(),
            };
            inner.slots.entry(slots_key(business_id)).or_default().insert(
                job_id.to_string(),
                Lease {
                    slot: slot.clone(),
                    expires_at: Instant::now() + lease,
                },
            );
            return Ok(AcquireOutcome::Acquired { slot });
        }

        let queue = inner.queues.entry(queue_key(business_id)).or_default();
        queue.push_back(job_id.to_string());
        Ok(AcquireOutcome::Queued {
            position: queue.len(),
        })
    }

    async fn release(
        &self,
        business_id: &str,
        job_id: &str,
        lease: Duration,
    ) -> SlotResult<ReleaseOutcome> {
        let mut inner = self.inner.lock();

        let released = inner
            .slots
            .get_mut(&slots_key(business_id))
            .and_then(|slots| slots.remove(job_id))
            .is_some();

        let promoted = if released {
            inner.promote_next(business_id, lease)
        } else {
            if let Some(queue) = inner.queues.get_mut(&queue_key(business_id)) {
                queue.retain(|queued| queued != job_id);
            }
            None
        };

        Ok(ReleaseOutcome {
            released,
            promoted,
            active_after: inner.active_len(business_id),
            queued_after: inner.queued_len(business_id),
        })
    }

    async fn heartbeat(&self, business_id: &str, job_id: &str, lease: Duration) -> SlotResult<bool> {
        let mut inner = self.inner.lock();
        let Some(held) = inner
            .slots
            .get_mut(&slots_key(business_id))
            .and_then(|slots| slots.get_mut(job_id))
        else {
            return Ok(false);
        };
        held.expires_at = Instant::now() + lease;
        Ok(true)
    }

    async fn reap_expired(
        &self,
        capacity: CapacityFn<'_>,
        lease: Duration,
    ) -> SlotResult<Vec<OutboundSlot>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let mut businesses = Vec::new();
        for slots in inner.slots.values_mut() {
            let before = slots.len();
            let mut business_id = None;
            slots.retain(|_, held| {
                let live = held.expires_at > now;
                if !live {
                    tracing::warn!(business_id = %held.slot.business_id, job_id = %held.slot.job_id, "reclaiming expired outbound slot");
                    business_id = Some(held.slot.business_id.clone());
                }
                live
            });
            if slots.len() < before
                && let Some(business_id) = business_id
            {
                businesses.push(business_id);
            }
        }

        let mut promoted = Vec::new();
        for business_id in businesses {
            let limit = capacity(&business_id);
            while inner.active_len(&business_id) < limit {
                match inner.promote_next(&business_id, lease) {
                    Some(slot) => promoted.push(slot),
                    None => break,
                }
            }
        }
        Ok(promoted)
    }

    async fn snapshot(&self, business_id: &str) -> SlotResult<SlotSnapshot> {
        let inner = self.inner.lock();
        let mut active: Vec<String> = inner
            .slots
            .get(&slots_key(business_id))
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default();
        active.sort();
        let queued = inner
            .queues
            .get(&queue_key(business_id))
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default();
        Ok(SlotSnapshot { active, queued })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_until_capacity_then_queue() {
        let store = MemorySlotStore::new();
        for job in ["a", "b"] {
            let outcome = store.acquire("biz", job, 2, LEASE).await.unwrap();
            assert!(matches!(outcome, AcquireOutcome::Acquired { .. }));
        }
        assert_eq!(
            store.acquire("biz", "c", 2, LEASE).await.unwrap(),
            AcquireOutcome::Queued { position: 1 }
        );
        assert_eq!(
            store.acquire("biz", "d", 2, LEASE).await.unwrap(),
            AcquireOutcome::Queued { position: 2 }
        );
        // Asking again reports the same position.
        assert_eq!(
            store.acquire("biz", "c", 2, LEASE).await.unwrap(),
            AcquireOutcome::Queued { position: 1 }
        );
    }

    #[tokio::test]
    async fn test_reacquire_is_idempotent() {
        let store = MemorySlotStore::new();
        store.acquire("biz", "a", 1, LEASE).await.unwrap();
        let again = store.acquire("biz", "a", 1, LEASE).await.unwrap();
        assert!(matches!(again, AcquireOutcome::AlreadyActive { .. }));
        assert_eq!(store.snapshot("biz").await.unwrap().active, vec!["a"]);
    }

    #[tokio::test]
    async fn test_release_promotes_in_fifo_order() {
        let store = MemorySlotStore::new();
        store.acquire("biz", "a", 1, LEASE).await.unwrap();
        store.acquire("biz", "b", 1, LEASE).await.unwrap();
        store.acquire("biz", "c", 1, LEASE).await.unwrap();

        let outcome = store.release("biz", "a", LEASE).await.unwrap();
        assert!(outcome.released);
        assert_eq!(outcome.promoted.unwrap().job_id, "b");
        assert_eq!(outcome.active_after, 1);
        assert_eq!(outcome.queued_after, 1);

        let snapshot = store.snapshot("biz").await.unwrap();
        assert_eq!(snapshot.active, vec!["b"]);
        assert_eq!(snapshot.queued, vec!["c"]);
    }

    #[tokio::test]
    async fn test_release_twice_is_harmless() {
        let store = MemorySlotStore::new();
        store.acquire("biz", "a", 1, LEASE).await.unwrap();
        store.acquire("biz", "b", 1, LEASE).await.unwrap();
        store.release("biz", "a", LEASE).await.unwrap();

        let second = store.release("biz", "a", LEASE).await.unwrap();
        assert!(!second.released);
        assert!(second.promoted.is_none());
        assert_eq!(second.active_after, 1);
    }

    #[tokio::test]
    async fn test_release_of_queued_job_leaves_queue() {
        let store = MemorySlotStore::new();
        store.acquire("biz", "a", 1, LEASE).await.unwrap();
        store.acquire("biz", "b", 1, LEASE).await.unwrap();

        let outcome = store.release("biz", "b", LEASE).await.unwrap();
        assert!(!outcome.released);
        assert_eq!(outcome.queued_after, 0);
        assert_eq!(store.snapshot("biz").await.unwrap().active, vec!["a"]);
    }

    #[tokio::test]
    async fn test_businesses_are_isolated() {
        let store = MemorySlotStore::new();
        store.acquire("one", "a", 1, LEASE).await.unwrap();
        let other = store.acquire("two", "a", 1, LEASE).await.unwrap();
        assert!(matches!(other, AcquireOutcome::Acquired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_reclaims_expired_leases() {
        let store = MemorySlotStore::new();
        let lease = Duration::from_secs(5);
        store.acquire("biz", "a", 2, lease).await.unwrap();
        store.acquire("biz", "b", 2, lease).await.unwrap();
        store.acquire("biz", "c", 2, lease).await.unwrap();
        store.acquire("biz", "d", 2, lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.heartbeat("biz", "a", lease).await.unwrap());
        tokio::time::advance(Duration::from_secs(3)).await;

        let capacity = |_: &str| 2usize;
        let promoted = store.reap_expired(&capacity, lease).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].job_id, "c");

        let snapshot = store.snapshot("biz").await.unwrap();
        assert_eq!(snapshot.active, vec!["a", "c"]);
        assert_eq!(snapshot.queued, vec!["d"]);
        assert!(!store.heartbeat("biz", "b", lease).await.unwrap());
    }
}
