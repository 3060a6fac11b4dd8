//! Batch scheduling.
//!
//! One engine instance owns one fixed-capacity batch. Pending per-sequence
//! decode requests are collected here, ordered by a pluggable
//! prioritization strategy, packed up to the batch capacity, and dispatched
//! to the model runtime as a single call per round.

pub mod queue;
pub mod scheduler;
pub mod strategy;

pub use queue::{DecodeRequest, DecodeTicket};
pub use scheduler::BatchScheduler;
pub use strategy::{Allotment, MaxParallelism, PendingWork, ScheduleStrategy};
