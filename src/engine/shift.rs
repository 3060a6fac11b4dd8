//! Context-shift planning.
//!
//! When a sequence has no free room for new tokens, the planner decides
//! which ledger ranges to evict. The default policy erases the earliest
//! model output first while preserving the leading system prompt; a custom
//! policy may be supplied, with the default as validated fallback.

use std::sync::Arc;

use tracing::debug;

use crate::engine::sequence::EvictionRange;
use crate::error::{EngineError, Result};

/// What a run of history tokens represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    SystemPrompt,
    UserInput,
    ModelOutput,
}

/// One contiguous run of ledger tokens with a common origin. Spans are
/// ordered and cover the ledger front to back.
#[derive(Debug, Clone, Copy)]
pub struct HistorySpan {
    pub kind: SpanKind,
    pub len: usize,
}

impl HistorySpan {
    pub fn new(kind: SpanKind, len: usize) -> Self {
        Self { kind, len }
    }
}

/// Chooses which ranges to evict to free at least `target` tokens.
pub trait ContextShiftPolicy: Send + Sync {
    fn plan(
        &self,
        spans: &[HistorySpan],
        ledger_len: usize,
        target: usize,
    ) -> Vec<EvictionRange>;
}

/// Default policy: protect the leading system-prompt spans and the
/// trailing in-progress span, then evict the earliest model outputs,
/// falling back to the earliest remaining spans.
pub struct OldestOutputPolicy;

impl ContextShiftPolicy for OldestOutputPolicy {
    fn plan(
        &self,
        spans: &[HistorySpan],
        ledger_len: usize,
        target: usize,
    ) -> Vec<EvictionRange> {
        // Offsets per span, in ledger positions.
        let mut offsets = Vec::with_capacity(spans.len());
        let mut pos = 0;
        for span in spans {
            offsets.push(pos);
            pos += span.len;
        }

        let protected_prefix = spans
            .iter()
            .take_while(|s| s.kind == SpanKind::SystemPrompt)
            .map(|s| s.len)
            .sum::<usize>();
        let last = spans.len().saturating_sub(1);

        let mut ranges = Vec::new();
        let mut freed = 0;
        for pass_kind in [Some(SpanKind::ModelOutput), None] {
            for (idx, span) in spans.iter().enumerate() {
                if freed >= target {
                    break;
                }
                if offsets[idx] < protected_prefix || idx == last || span.len == 0 {
                    continue;
                }
                if let Some(kind) = pass_kind {
                    if span.kind != kind {
                        continue;
                    }
                }
                let range = EvictionRange::new(
                    offsets[idx],
                    (offsets[idx] + span.len).min(ledger_len),
                );
                if ranges.contains(&range) {
                    continue;
                }
                freed += range.len();
                ranges.push(range);
            }
        }
        ranges
    }
}

/// Plans and validates context shifts for one engine instance.
pub struct ContextShiftPlanner {
    policy: Arc<dyn ContextShiftPolicy>,
    free_fraction: f64,
}

impl ContextShiftPlanner {
    pub fn new(policy: Arc<dyn ContextShiftPolicy>, free_fraction: f64) -> Self {
        Self {
            policy,
            free_fraction,
        }
    }

    pub fn with_default_policy(free_fraction: f64) -> Self {
        Self::new(Arc::new(OldestOutputPolicy), free_fraction)
    }

    /// Compute the ranges to evict so that at least `needed` positions
    /// become free. The target is padded to the configured fraction of the
    /// context window so one shift covers a whole generation burst.
    pub fn plan_shift(
        &self,
        spans: &[HistorySpan],
        ledger_len: usize,
        context_size: usize,
        needed: usize,
    ) -> Result<Vec<EvictionRange>> {
        let target = needed.max((context_size as f64 * self.free_fraction) as usize);

        let ranges = self.policy.plan(spans, ledger_len, target);
        let merged = EvictionRange::normalize(&ranges, ledger_len);
        let freed: usize = merged.iter().map(|r| r.len()).sum();
        if freed >= needed {
            debug!(freed, needed, target, "context shift planned");
            return Ok(merged);
        }

        // Custom policy came up short: re-validate against the default.
        let fallback = OldestOutputPolicy.plan(spans, ledger_len, target);
        let merged = EvictionRange::normalize(&fallback, ledger_len);
        let freed: usize = merged.iter().map(|r| r.len()).sum();
        if freed >= needed {
            debug!(freed, needed, "context shift planned via default fallback");
            return Ok(merged);
        }

        Err(EngineError::ContextTooSmall {
            reason: format!(
                "no eviction policy frees {needed} of {context_size} context tokens \
                 ({ledger_len} resident); the protected system prompt may be too large"
            ),
        })
    }
}

/// Shrink span metadata after `merged` ranges were evicted, so the next
/// shift sees accurate history.
pub fn apply_ranges_to_spans(
    spans: &[HistorySpan],
    merged: &[EvictionRange],
) -> Vec<HistorySpan> {
    let mut out = Vec::with_capacity(spans.len());
    let mut pos = 0;
    for span in spans {
        let (start, end) = (pos, pos + span.len);
        let evicted: usize = merged
            .iter()
            .map(|r| r.end.min(end).saturating_sub(r.start.max(start)))
            .sum();
        let kept = span.len - evicted.min(span.len);
        if kept > 0 {
            out.push(HistorySpan::new(span.kind, kept));
        }
        pos = end;
    }
    out
}
