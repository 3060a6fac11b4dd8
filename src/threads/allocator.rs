//! Proportional thread-budget arbiter.
//!
//! Each consumer declares a wanted amount and a minimum demand. An
//! allocation request computes the consumer's ideal share
//! (`min(wanted, max(min_demand, ceil(wanted / total_wanted * budget)))`),
//! grants what is free, and suspends the consumer when the free budget
//! cannot cover its minimum. Releases wake all waiters so they can
//! re-negotiate. Grants shrink only by being dropped, never from outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

struct ConsumerState {
    wanted: usize,
    min_demand: usize,
    granted: usize,
}

#[derive(Default)]
struct BudgetState {
    consumers: HashMap<u64, ConsumerState>,
    granted_total: usize,
}

struct Shared {
    /// 0 = unlimited.
    max_threads: usize,
    state: Mutex<BudgetState>,
    freed: Notify,
    next_id: AtomicU64,
}

/// Process-wide thread budget, shared across engine instances.
#[derive(Clone)]
pub struct ThreadBudgetAllocator {
    shared: Arc<Shared>,
}

impl ThreadBudgetAllocator {
    pub fn new(max_threads: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_threads,
                state: Mutex::new(BudgetState::default()),
                freed: Notify::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a consumer. Its demand participates in share computation
    /// until the handle is dropped. `min_demand` is clamped to `wanted`.
    pub fn create_consumer(&self, wanted: usize, min_demand: usize) -> ThreadConsumer {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state.lock().unwrap();
        state.consumers.insert(
            id,
            ConsumerState {
                wanted,
                min_demand: min_demand.min(wanted),
                granted: 0,
            },
        );
        ThreadConsumer {
            shared: self.shared.clone(),
            id,
        }
    }

    /// Threads currently granted across all consumers.
    pub fn granted_total(&self) -> usize {
        self.shared.state.lock().unwrap().granted_total
    }
}

/// One registered demand on the budget. Dropping it withdraws the demand
/// and frees any outstanding reservation.
pub struct ThreadConsumer {
    shared: Arc<Shared>,
    id: u64,
}

impl ThreadConsumer {
    /// Acquire a thread allocation, suspending while the free budget
    /// cannot cover this consumer's minimum demand.
    pub async fn acquire(&self) -> ThreadGrant {
        loop {
            // Arm the wakeup before checking, so a release between the
            // check and the await is not missed.
            let notified = self.shared.freed.notified();
            if let Some(grant) = self.try_acquire() {
                return grant;
            }
            notified.await;
        }
    }

    fn try_acquire(&self) -> Option<ThreadGrant> {
        let mut state = self.shared.state.lock().unwrap();
        let consumer = state.consumers.get(&self.id)?;
        let (wanted, min_demand) = (consumer.wanted, consumer.min_demand);

        if self.shared.max_threads == 0 {
            // Unlimited budget: everyone gets what they want.
            return Some(self.grant(&mut state, wanted));
        }
        if wanted == 0 {
            return Some(self.grant(&mut state, 0));
        }

        let total_wanted: usize = state.consumers.values().map(|c| c.wanted).sum();
        let ideal = (wanted * self.shared.max_threads).div_ceil(total_wanted.max(1));
        let ideal = ideal.max(min_demand).min(wanted);

        let free = self.shared.max_threads - state.granted_total;
        let granted = ideal.min(free);
        if granted < min_demand.max(1) {
            debug!(
                consumer = self.id,
                ideal, free, min_demand, "thread budget exhausted, waiting"
            );
            return None;
        }
        Some(self.grant(&mut state, granted))
    }

    fn grant(&self, state: &mut BudgetState, threads: usize) -> ThreadGrant {
        state.granted_total += threads;
        if let Some(c) = state.consumers.get_mut(&self.id) {
            c.granted += threads;
        }
        ThreadGrant {
            shared: self.shared.clone(),
            consumer_id: self.id,
            threads,
        }
    }
}

impl Drop for ThreadConsumer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(c) = state.consumers.remove(&self.id) {
            state.granted_total -= c.granted;
        }
        drop(state);
        self.shared.freed.notify_waiters();
    }
}

/// An outstanding allocation. Dropping it returns the threads and wakes
/// blocked consumers.
pub struct ThreadGrant {
    shared: Arc<Shared>,
    consumer_id: u64,
    threads: usize,
}

impl ThreadGrant {
    /// Number of threads granted. May be zero when the consumer wanted
    /// none (or the budget is unlimited and it asked for zero).
    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Drop for ThreadGrant {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.granted_total -= self.threads;
        if let Some(c) = state.consumers.get_mut(&self.consumer_id) {
            c.granted -= self.threads.min(c.granted);
        }
        drop(state);
        self.shared.freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_budget_grants_wanted() {
        let allocator = ThreadBudgetAllocator::new(0);
        let consumer = allocator.create_consumer(8, 2);
        let grant = consumer.acquire().await;
        assert_eq!(grant.threads(), 8);
    }

    #[tokio::test]
    async fn test_single_consumer_gets_full_budget() {
        let allocator = ThreadBudgetAllocator::new(4);
        let consumer = allocator.create_consumer(8, 1);
        let grant = consumer.acquire().await;
        assert_eq!(grant.threads(), 4);
        assert_eq!(allocator.granted_total(), 4);
    }

    #[tokio::test]
    async fn test_two_consumers_split_proportionally() {
        let allocator = ThreadBudgetAllocator::new(8);
        let a = allocator.create_consumer(4, 1);
        let b = allocator.create_consumer(4, 1);

        let grant_a = a.acquire().await;
        let grant_b = b.acquire().await;
        assert_eq!(grant_a.threads(), 4);
        assert_eq!(grant_b.threads(), 4);
        assert!(allocator.granted_total() <= 8);
    }

    #[tokio::test]
    async fn test_blocked_consumer_wakes_on_release() {
        let allocator = ThreadBudgetAllocator::new(4);
        let a = allocator.create_consumer(8, 3);
        let b = allocator.create_consumer(8, 3);

        let grant_a = a.acquire().await;
        assert!(grant_a.threads() >= 3);

        // b's minimum cannot be met while a holds its grant.
        let waiter = tokio::spawn(async move {
            let grant = b.acquire().await;
            grant.threads()
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(grant_a);
        let granted = waiter.await.unwrap();
        assert!(granted >= 3);
        assert!(allocator.granted_total() <= 4);
    }

    #[tokio::test]
    async fn test_grant_sum_never_exceeds_budget() {
        let allocator = ThreadBudgetAllocator::new(6);
        let consumers: Vec<_> = (0..3).map(|_| allocator.create_consumer(3, 1)).collect();

        let mut grants = Vec::new();
        for consumer in &consumers {
            grants.push(consumer.acquire().await);
            assert!(allocator.granted_total() <= 6);
        }
    }
}
