//! Token-stream regulation.
//!
//! Freshly generated tokens may still belong to an in-progress stop
//! sequence, a function-call marker, or an incomplete UTF-8 character.
//! This module buffers such tokens and releases (or discards) them once
//! every watcher has resolved, so callers never observe text that a later
//! match invalidates.

pub mod regulator;
pub mod stop;

pub use regulator::{ChunkId, LockId, ReleasedChunk, TokenStreamRegulator};
pub use stop::{StopPattern, StopSequenceDetector, TriggeredStop};
