//! Prioritization strategies for batch packing.
//!
//! A strategy sees a snapshot of pending work and divides the batch
//! capacity among the entries. The default spreads capacity evenly across
//! sequences, weighted by evaluation priority.

/// Summary of one pending queue entry, as shown to a strategy.
#[derive(Debug, Clone)]
pub struct PendingWork {
    pub sequence_id: u32,

    /// Unconsumed tokens remaining in the entry.
    pub token_count: usize,

    pub evaluation_priority: u8,

    /// Monotonic enqueue order, for FIFO tie-breaks.
    pub arrival: u64,
}

/// How many tokens of entry `index` the next round should evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allotment {
    pub index: usize,
    pub tokens: usize,
}

/// Divides batch capacity among pending entries.
pub trait ScheduleStrategy: Send + Sync {
    /// Plan one dispatch round over `pending`. The returned allotments must
    /// not exceed an entry's `token_count`; their sum must stay within
    /// `capacity`. A violation rejects the implicated entries, not the
    /// whole queue.
    fn plan(&self, pending: &[PendingWork], capacity: usize) -> anyhow::Result<Vec<Allotment>>;
}

/// Default "maximum parallelism" strategy.
///
/// Every sequence with pending work gets a share of the batch, weighted by
/// its evaluation priority; leftover capacity goes to higher-priority
/// entries first, FIFO within a priority.
pub struct MaxParallelism;

impl ScheduleStrategy for MaxParallelism {
    fn plan(&self, pending: &[PendingWork], capacity: usize) -> anyhow::Result<Vec<Allotment>> {
        if pending.is_empty() || capacity == 0 {
            return Ok(Vec::new());
        }

        // Visit order: priority desc, then arrival asc.
        let mut order: Vec<usize> = (0..pending.len()).collect();
        order.sort_by(|&a, &b| {
            pending[b]
                .evaluation_priority
                .cmp(&pending[a].evaluation_priority)
                .then(pending[a].arrival.cmp(&pending[b].arrival))
        });

        let total_weight: usize = pending
            .iter()
            .map(|w| w.evaluation_priority.max(1) as usize)
            .sum();

        let mut allotted = vec![0usize; pending.len()];
        let mut used = 0;

        // Pass 1: weighted even spread, at least one token per entry while
        // capacity lasts.
        for &idx in &order {
            let work = &pending[idx];
            let weight = work.evaluation_priority.max(1) as usize;
            let share = (capacity * weight / total_weight).max(1);
            let take = share.min(work.token_count).min(capacity - used);
            allotted[idx] = take;
            used += take;
            if used == capacity {
                break;
            }
        }

        // Pass 2: hand leftover capacity to entries with remaining tokens,
        // in the same order.
        for &idx in &order {
            if used == capacity {
                break;
            }
            let extra = (pending[idx].token_count - allotted[idx]).min(capacity - used);
            allotted[idx] += extra;
            used += extra;
        }

        Ok(order
            .into_iter()
            .filter(|&idx| allotted[idx] > 0)
            .map(|idx| Allotment {
                index: idx,
                tokens: allotted[idx],
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(sequence_id: u32, token_count: usize, priority: u8, arrival: u64) -> PendingWork {
        PendingWork {
            sequence_id,
            token_count,
            evaluation_priority: priority,
            arrival,
        }
    }

    fn total(plan: &[Allotment]) -> usize {
        plan.iter().map(|a| a.tokens).sum()
    }

    #[test]
    fn test_even_split_within_capacity() {
        let pending = vec![work(0, 50, 1, 0), work(1, 50, 1, 1)];
        let plan = MaxParallelism.plan(&pending, 60).unwrap();

        assert_eq!(plan.len(), 2);
        assert!(total(&plan) <= 60);
        // Both sequences make progress in the round.
        assert!(plan.iter().all(|a| a.tokens > 0));
    }

    #[test]
    fn test_priority_weighting() {
        let pending = vec![work(0, 100, 3, 0), work(1, 100, 1, 1)];
        let plan = MaxParallelism.plan(&pending, 40).unwrap();

        let by_index: Vec<usize> = {
            let mut v = vec![0; 2];
            for a in &plan {
                v[a.index] = a.tokens;
            }
            v
        };
        assert!(by_index[0] > by_index[1]);
        assert!(total(&plan) <= 40);
    }

    #[test]
    fn test_fifo_tiebreak_on_equal_priority() {
        let pending = vec![work(0, 10, 2, 5), work(1, 10, 2, 1)];
        let plan = MaxParallelism.plan(&pending, 4).unwrap();
        // Entry 1 arrived first; it leads the round.
        assert_eq!(plan[0].index, 1);
    }

    #[test]
    fn test_small_entries_release_capacity() {
        let pending = vec![work(0, 2, 1, 0), work(1, 100, 1, 1)];
        let plan = MaxParallelism.plan(&pending, 50).unwrap();

        let mut by_index = vec![0; 2];
        for a in &plan {
            by_index[a.index] = a.tokens;
        }
        assert_eq!(by_index[0], 2);
        assert_eq!(by_index[1], 48);
    }

    #[test]
    fn test_empty_pending() {
        assert!(MaxParallelism.plan(&[], 64).unwrap().is_empty());
    }
}
