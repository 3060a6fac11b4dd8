//! Sequences and their token ledgers.
//!
//! The ledger is the canonical record of which tokens occupy the engine's
//! memory for one conversation, at which positions. Positions are
//! contiguous from 0; range eviction re-indexes everything after the hole.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::batch::DecodeRequest;
use crate::engine::EngineShared;
use crate::error::{EngineError, Result};
use crate::runtime::{LogitHandle, TokenId};

/// Half-open range over ledger positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionRange {
    pub start: usize,
    pub end: usize,
}

impl EvictionRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Clip to `[0, bound)`, drop empties, sort, and merge
    /// overlapping/adjacent ranges.
    pub fn normalize(ranges: &[EvictionRange], bound: usize) -> Vec<EvictionRange> {
        let mut clipped: Vec<EvictionRange> = ranges
            .iter()
            .map(|r| EvictionRange::new(r.start.min(bound), r.end.min(bound)))
            .filter(|r| !r.is_empty())
            .collect();
        clipped.sort_by_key(|r| r.start);

        let mut merged: Vec<EvictionRange> = Vec::with_capacity(clipped.len());
        for range in clipped {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        merged
    }
}

/// Input/output token accounting for one sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenMeter {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenMeter {
    pub fn record_input(&mut self, count: usize) {
        self.input_tokens += count;
    }

    pub fn record_output(&mut self, count: usize) {
        self.output_tokens += count;
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// In-memory mirror of a sequence's engine-resident tokens.
#[derive(Debug, Default)]
pub struct SequenceLedger {
    tokens: Vec<TokenId>,
}

impl SequenceLedger {
    /// Position the next appended token will occupy. Always equals the
    /// ledger length.
    pub fn next_index(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn append(&mut self, tokens: &[TokenId]) {
        self.tokens.extend_from_slice(tokens);
    }

    /// First index at which `candidate` diverges from the resident tokens.
    /// Equals the shorter length when one is a prefix of the other; used to
    /// reuse an already-resident prompt prefix.
    pub fn compare_tokens(&self, candidate: &[TokenId]) -> usize {
        self.tokens
            .iter()
            .zip(candidate)
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Splice merged ranges out, shifting later positions left. Returns
    /// the number of tokens removed.
    fn splice(&mut self, merged: &[EvictionRange]) -> usize {
        let mut removed = 0;
        for range in merged.iter().rev() {
            self.tokens.drain(range.start..range.end);
            removed += range.len();
        }
        removed
    }
}

/// One conversation's resident state on an engine instance.
///
/// Acquired from a slot pool; releasing (or dropping) returns the slot.
pub struct Sequence {
    engine: Arc<EngineShared>,
    id: u32,
    ledger: SequenceLedger,
    meter: TokenMeter,
    released: bool,
}

impl Sequence {
    pub(crate) fn new(engine: Arc<EngineShared>, id: u32) -> Self {
        Self {
            engine,
            id,
            ledger: SequenceLedger::default(),
            meter: TokenMeter::default(),
            released: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ledger(&self) -> &SequenceLedger {
        &self.ledger
    }

    pub fn meter(&self) -> TokenMeter {
        self.meter
    }

    pub(crate) fn meter_mut(&mut self) -> &mut TokenMeter {
        &mut self.meter
    }

    pub(crate) fn engine(&self) -> &Arc<EngineShared> {
        &self.engine
    }

    /// Context window size this sequence must stay within.
    pub fn context_size(&self) -> usize {
        self.engine.config.context_size
    }

    fn check_live(&self) -> Result<()> {
        if self.released {
            return Err(EngineError::UseAfterDispose("sequence"));
        }
        self.engine.check_live()
    }

    /// Evaluate `tokens` at the end of the ledger through the batch
    /// scheduler. Appends to the ledger once the decode resolves.
    pub async fn decode(
        &mut self,
        tokens: Vec<TokenId>,
        wants_logits: bool,
        evaluation_priority: u8,
    ) -> Result<Option<LogitHandle>> {
        self.check_live()?;
        if tokens.is_empty() {
            return Ok(None);
        }

        let ticket = self.engine.scheduler.enqueue(DecodeRequest {
            sequence_id: self.id,
            first_position: self.ledger.next_index(),
            tokens: tokens.clone(),
            evaluation_priority,
            wants_logits,
        });
        // Once every acquired slot has work queued, waiting for the next
        // tick cannot make the batch any fuller.
        if self.engine.scheduler.pending_entries() >= self.engine.acquired_slots() {
            self.engine.scheduler.dispatch_pending().await;
        }
        let handle = ticket
            .await
            .map_err(|_| EngineError::BatchDispatch("scheduler dropped the request".into()))??;

        self.ledger.append(&tokens);
        Ok(handle)
    }

    /// Evict ledger ranges, keeping engine-side cells in sync. Recovers
    /// from an engine-reported removal failure by rebuilding the whole
    /// sequence from the surviving ledger tokens. Returns tokens removed.
    pub async fn erase_ranges(&mut self, ranges: &[EvictionRange]) -> Result<usize> {
        self.check_live()?;
        let merged = EvictionRange::normalize(ranges, self.ledger.next_index());
        if merged.is_empty() {
            return Ok(0);
        }

        // Structural edit: serialize against other evictions and slot
        // reclamation on this instance. The guard borrows a local clone so
        // the rebuild path below can still take `&mut self`.
        let engine = self.engine.clone();
        let _context = engine.context_lock.lock().await;

        let ledger_len = self.ledger.next_index();
        let mut shifted = 0usize;
        for range in &merged {
            let start = range.start - shifted;
            let end = range.end - shifted;
            let ok = engine.runtime.remove_cells(self.id, start, end).await?;
            if !ok {
                warn!(
                    sequence = self.id,
                    start, end, "cell removal refused, rebuilding sequence"
                );
                return self.rebuild_after_failed_removal(&merged).await;
            }
            engine
                .runtime
                .shift_cells(self.id, end, ledger_len - shifted, -((end - start) as isize))
                .await?;
            shifted += end - start;
        }

        let removed = self.ledger.splice(&merged);
        debug!(sequence = self.id, removed, "evicted ledger ranges");
        Ok(removed)
    }

    /// Fallback: drop the engine-side sequence entirely and re-evaluate
    /// every surviving ledger token from scratch.
    async fn rebuild_after_failed_removal(
        &mut self,
        merged: &[EvictionRange],
    ) -> Result<usize> {
        self.engine.runtime.clear_cells(self.id).await?;
        let removed = self.ledger.splice(merged);

        let survivors = self.ledger.tokens().to_vec();
        if !survivors.is_empty() {
            let ticket = self.engine.scheduler.enqueue(DecodeRequest {
                sequence_id: self.id,
                first_position: 0,
                tokens: survivors,
                evaluation_priority: u8::MAX,
                wants_logits: false,
            });
            ticket
                .await
                .map_err(|_| EngineError::Eviction(self.id))??;
        }
        debug!(sequence = self.id, removed, "sequence rebuilt after eviction failure");
        Ok(removed)
    }

    /// Return the slot to the pool. Idempotent; absorbed by `Drop` as
    /// well, so reclamation stays deterministic.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.engine.release_slot(self.id);
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_merges_overlapping_and_adjacent() {
        let ranges = [
            EvictionRange::new(5, 8),
            EvictionRange::new(0, 3),
            EvictionRange::new(3, 5),
            EvictionRange::new(7, 9),
        ];
        let merged = EvictionRange::normalize(&ranges, 100);
        assert_eq!(merged, vec![EvictionRange::new(0, 9)]);
    }

    #[test]
    fn test_normalize_clips_and_drops_empty() {
        let ranges = [
            EvictionRange::new(10, 10),
            EvictionRange::new(95, 200),
            EvictionRange::new(120, 130),
        ];
        let merged = EvictionRange::normalize(&ranges, 100);
        assert_eq!(merged, vec![EvictionRange::new(95, 100)]);
    }

    #[test]
    fn test_ledger_positions_stay_contiguous() {
        let mut ledger = SequenceLedger::default();
        ledger.append(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ledger.next_index(), 8);

        let merged = EvictionRange::normalize(
            &[EvictionRange::new(1, 3), EvictionRange::new(5, 6)],
            ledger.next_index(),
        );
        let removed = ledger.splice(&merged);
        assert_eq!(removed, 3);
        assert_eq!(ledger.tokens(), &[1, 4, 5, 7, 8]);
        assert_eq!(ledger.next_index(), 5);
    }

    #[test]
    fn test_compare_tokens_finds_divergence() {
        let mut ledger = SequenceLedger::default();
        ledger.append(&[1, 2, 3, 4]);

        assert_eq!(ledger.compare_tokens(&[1, 2, 9, 9]), 2);
        assert_eq!(ledger.compare_tokens(&[1, 2, 3, 4]), 4);
        assert_eq!(ledger.compare_tokens(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(ledger.compare_tokens(&[9]), 0);
    }

    #[test]
    fn test_meter_totals() {
        let mut meter = TokenMeter::default();
        meter.record_input(10);
        meter.record_output(3);
        assert_eq!(meter.total(), 13);
    }
}
