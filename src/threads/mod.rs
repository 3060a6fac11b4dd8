//! Shared CPU-thread budget.
//!
//! One process-wide allocator divides a bounded number of threads among
//! concurrently evaluating engine instances, proportionally to their
//! declared demand.

pub mod allocator;

pub use allocator::{ThreadBudgetAllocator, ThreadConsumer, ThreadGrant};
