//! Priority arbitration over shared physical resources (spec §4.G
//! "Priority arbitration"): each resource key gets a binary semaphore, and
//! a `PriorityPolicy`'s `max_wait_ms` bounds how long an instruction waits
//! before the caller must fall back.
//!
//! On top of the semaphore, each resource tracks its current holder's
//! `PriorityLevel` and `preemptible` flag. An incoming acquire at a
//! strictly higher priority (lower `level`) than a *preemptible* holder
//! signals that holder's `Notify` — a non-preemptible holder is never
//! signalled and always runs to completion. The signal is advisory: the
//! holder observes it by racing `PriorityPermit::preempted` against its own
//! work and yielding early if it can, which is exactly how the teacher's
//! resource permits are meant to be used by callers doing interruptible
//! I/O (e.g. the physical-action cancellation window).

use anyhow::{anyhow, Result};
use llmir_core::PriorityPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock, Semaphore};

#[derive(Debug, Clone, Copy)]
struct HolderInfo {
    level: u8,
    preemptible: bool,
}

struct ResourceSlot {
    sem: Arc<Semaphore>,
    holder: StdMutex<Option<HolderInfo>>,
    preempt: Notify,
}

impl ResourceSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self { sem: Arc::new(Semaphore::new(1)), holder: StdMutex::new(None), preempt: Notify::new() })
    }
}

pub struct PriorityArbiter {
    resources: RwLock<HashMap<String, Arc<ResourceSlot>>>,
}

impl Default for PriorityArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityArbiter {
    pub fn new() -> Self {
        Self { resources: RwLock::new(HashMap::new()) }
    }

    async fn slot_for(&self, resource_key: &str) -> Arc<ResourceSlot> {
        let read = self.resources.read().await;
        if let Some(s) = read.get(resource_key) {
            return Arc::clone(s);
        }
        drop(read);
        let mut write = self.resources.write().await;
        Arc::clone(write.entry(resource_key.to_owned()).or_insert_with(ResourceSlot::new))
    }

    /// Acquire the permit for `resource_key`, waiting up to `policy.max_wait_ms`.
    /// `max_wait_ms == 0` means non-blocking: a short grace period only. If the
    /// current holder is preemptible and `policy.level` outranks it, the
    /// holder's `Notify` is signalled before we start waiting.
    pub async fn acquire(&self, resource_key: &str, policy: &PriorityPolicy) -> Result<PriorityPermit> {
        let slot = self.slot_for(resource_key).await;

        if let Some(holder) = *slot.holder.lock().unwrap() {
            if holder.preemptible && policy.level < holder.level {
                slot.preempt.notify_one();
            }
        }

        let deadline = if policy.max_wait_ms == 0 { Duration::from_millis(50) } else { Duration::from_millis(policy.max_wait_ms as u64) };

        let permit = tokio::time::timeout(deadline, Arc::clone(&slot.sem).acquire_owned())
            .await
            .map_err(|_| anyhow!("resource \"{resource_key}\" busy — max_wait_ms={} exceeded", policy.max_wait_ms))?
            .map_err(|e| anyhow!("semaphore closed: {e}"))?;

        *slot.holder.lock().unwrap() = Some(HolderInfo { level: policy.level, preemptible: policy.preemptible });

        Ok(PriorityPermit { _permit: permit, slot })
    }
}

/// A held resource permit. Dropping it clears the resource's holder record
/// and releases the underlying semaphore slot to the next waiter.
pub struct PriorityPermit {
    _permit: OwnedSemaphorePermit,
    slot: Arc<ResourceSlot>,
}

impl PriorityPermit {
    /// Resolves once a higher-priority acquire has signalled this permit
    /// for preemption. Callers doing interruptible work (e.g. a physical
    /// action's cancellation window) should race this against their own
    /// progress and yield the resource early when it resolves.
    pub async fn preempted(&self) {
        self.slot.preempt.notified().await
    }
}

impl Drop for PriorityPermit {
    fn drop(&mut self) {
        *self.slot.holder.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(level: u8, max_wait_ms: u32) -> PriorityPolicy {
        PriorityPolicy { level, preemptible: true, max_wait_ms }
    }

    fn non_preemptible(level: u8, max_wait_ms: u32) -> PriorityPolicy {
        PriorityPolicy { level, preemptible: false, max_wait_ms }
    }

    #[tokio::test]
    async fn second_acquire_on_same_resource_waits_then_times_out() {
        let arbiter = PriorityArbiter::new();
        let _held = arbiter.acquire("modbus-gateway", &policy(128, 1000)).await.unwrap();
        let result = arbiter.acquire("modbus-gateway", &policy(128, 50)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn distinct_resources_do_not_contend() {
        let arbiter = PriorityArbiter::new();
        let _a = arbiter.acquire("gateway-a", &policy(128, 50)).await.unwrap();
        let b = arbiter.acquire("gateway-b", &policy(128, 50)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn releasing_a_permit_unblocks_the_next_waiter() {
        let arbiter = PriorityArbiter::new();
        let held = arbiter.acquire("gateway", &policy(128, 500)).await.unwrap();
        drop(held);
        let result = arbiter.acquire("gateway", &policy(128, 500)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn higher_priority_acquire_signals_a_preemptible_holder() {
        let arbiter = PriorityArbiter::new();
        let held = arbiter.acquire("gateway", &policy(192, 500)).await.unwrap();

        let preempted = tokio::time::timeout(Duration::from_millis(200), held.preempted());
        let acquire_critical = arbiter.acquire("gateway", &non_preemptible(0, 50));

        // Start the higher-priority acquire first so it has a chance to
        // observe the holder and signal it before the holder's timeout races.
        tokio::pin!(acquire_critical);
        tokio::select! {
            biased;
            _ = &mut acquire_critical => {}
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert!(preempted.await.is_ok(), "preemptible holder should have been signalled");
    }

    #[tokio::test]
    async fn non_preemptible_holder_is_never_signalled() {
        let arbiter = PriorityArbiter::new();
        let held = arbiter.acquire("gateway", &non_preemptible(128, 500)).await.unwrap();

        let _ = arbiter.acquire("gateway", &non_preemptible(0, 50)).await;

        let result = tokio::time::timeout(Duration::from_millis(50), held.preempted()).await;
        assert!(result.is_err(), "non-preemptible holder must not be signalled");
    }
}
