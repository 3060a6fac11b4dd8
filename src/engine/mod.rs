//! Engine instances and sequence slots.
//!
//! An `EngineInstance` owns one model runtime handle, one batch scheduler,
//! and a fixed pool of sequence slots. Slots are acquired and released
//! explicitly; ids are reused. Two instance-scoped critical sections exist:
//! the scheduler's "evaluate" lock (one dispatch pass at a time) and the
//! narrower "context" lock (structural ledger edits).

pub mod sequence;
pub mod shift;

pub use sequence::{EvictionRange, Sequence, SequenceLedger, TokenMeter};
pub use shift::{
    apply_ranges_to_spans, ContextShiftPlanner, ContextShiftPolicy, HistorySpan,
    OldestOutputPolicy, SpanKind,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::batch::{BatchScheduler, MaxParallelism, ScheduleStrategy};
use crate::config::{EngineConfig, SamplerOptions};
use crate::error::{EngineError, Result};
use crate::runtime::ModelRuntime;
use crate::threads::ThreadBudgetAllocator;

/// Free-list of sequence slot ids.
struct SlotArena {
    free: Vec<u32>,
}

impl SlotArena {
    fn new(total: usize) -> Self {
        // Lowest id handed out first.
        Self {
            free: (0..total as u32).rev().collect(),
        }
    }
}

pub(crate) struct EngineShared {
    pub(crate) runtime: Arc<dyn ModelRuntime>,
    pub(crate) config: EngineConfig,
    pub(crate) scheduler: BatchScheduler,
    pub(crate) shift_planner: ContextShiftPlanner,
    pub(crate) sampler_defaults: SamplerOptions,

    /// Serializes structural ledger edits (eviction, rebuild) against each
    /// other, so an in-flight decode and an eviction cannot interleave.
    pub(crate) context_lock: tokio::sync::Mutex<()>,

    slots: Mutex<SlotArena>,
    disposed: AtomicBool,
}

impl EngineShared {
    pub(crate) fn check_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::UseAfterDispose("engine instance"));
        }
        Ok(())
    }

    pub(crate) fn release_slot(&self, id: u32) {
        self.slots.lock().unwrap().free.push(id);
    }

    /// Slots currently handed out.
    pub(crate) fn acquired_slots(&self) -> usize {
        self.config.sequence_slots - self.slots.lock().unwrap().free.len()
    }
}

/// Builder-style options for [`EngineInstance::new`].
pub struct EngineOptions {
    pub config: EngineConfig,
    pub sampler_defaults: SamplerOptions,
    pub strategy: Arc<dyn ScheduleStrategy>,
    pub shift_policy: Arc<dyn ContextShiftPolicy>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            sampler_defaults: SamplerOptions::default(),
            strategy: Arc::new(MaxParallelism),
            shift_policy: Arc::new(OldestOutputPolicy),
        }
    }
}

/// One long-lived inference engine instance.
pub struct EngineInstance {
    shared: Arc<EngineShared>,
}

impl EngineInstance {
    pub fn new(
        runtime: Arc<dyn ModelRuntime>,
        options: EngineOptions,
        threads: &ThreadBudgetAllocator,
    ) -> Result<Self> {
        options.config.validate()?;

        let consumer =
            threads.create_consumer(options.config.wanted_threads, options.config.min_threads);
        let scheduler = BatchScheduler::new(
            runtime.clone(),
            options.strategy,
            options.config.batch_capacity,
            consumer,
        );
        let shift_planner = ContextShiftPlanner::new(
            options.shift_policy,
            options.config.shift_free_fraction,
        );

        info!(
            context_size = options.config.context_size,
            batch_capacity = options.config.batch_capacity,
            sequence_slots = options.config.sequence_slots,
            "engine instance created"
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                runtime,
                slots: Mutex::new(SlotArena::new(options.config.sequence_slots)),
                scheduler,
                shift_planner,
                sampler_defaults: options.sampler_defaults,
                context_lock: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
                config: options.config,
            }),
        })
    }

    /// Convenience constructor with default strategy and shift policy.
    pub fn with_config(
        runtime: Arc<dyn ModelRuntime>,
        config: EngineConfig,
        threads: &ThreadBudgetAllocator,
    ) -> Result<Self> {
        Self::new(
            runtime,
            EngineOptions {
                config,
                ..Default::default()
            },
            threads,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Acquire a free sequence slot. Fails with `CapacityExceeded` when
    /// every slot is in use; release one first.
    pub async fn acquire_sequence(&self) -> Result<Sequence> {
        self.shared.check_live()?;

        let id = {
            let _context = self.shared.context_lock.lock().await;
            let mut slots = self.shared.slots.lock().unwrap();
            slots
                .free
                .pop()
                .ok_or(EngineError::CapacityExceeded(self.shared.config.sequence_slots))?
        };

        // Slot ids are reused; drop whatever a previous owner left behind.
        self.shared.runtime.clear_cells(id).await?;
        Ok(Sequence::new(self.shared.clone(), id))
    }

    /// Dispose the instance. Idempotent; subsequent operations fail with
    /// `UseAfterDispose`.
    pub fn dispose(&self) {
        if !self.shared.disposed.swap(true, Ordering::SeqCst) {
            info!("engine instance disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Drive any queued decode work now instead of waiting for the next
    /// scheduled tick.
    pub async fn dispatch_pending(&self) {
        self.shared.scheduler.dispatch_pending().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ScriptedRuntime;

    fn engine(slots: usize) -> EngineInstance {
        let runtime = Arc::new(ScriptedRuntime::new(&["a", "b"]));
        let allocator = ThreadBudgetAllocator::new(0);
        EngineInstance::with_config(
            runtime,
            EngineConfig {
                sequence_slots: slots,
                ..Default::default()
            },
            &allocator,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_slot_exhaustion_and_reuse() {
        let engine = engine(2);

        let a = engine.acquire_sequence().await.unwrap();
        let _b = engine.acquire_sequence().await.unwrap();
        let err = engine.acquire_sequence().await.err().unwrap();
        assert!(matches!(err, EngineError::CapacityExceeded(2)));

        let freed_id = a.id();
        drop(a);
        let c = engine.acquire_sequence().await.unwrap();
        assert_eq!(c.id(), freed_id);
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let engine = engine(1);
        let mut seq = engine.acquire_sequence().await.unwrap();
        seq.release();
        seq.release();
        drop(seq);
        assert!(engine.acquire_sequence().await.is_ok());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_blocks_acquisition() {
        let engine = engine(1);
        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        let err = engine.acquire_sequence().await.err().unwrap();
        assert!(matches!(err, EngineError::UseAfterDispose(_)));
    }
}
