//! The opaque model-runtime interface.
//!
//! Mirrors the llama.cpp surface the core actually needs: tokenize,
//! detokenize with lookback, batched decode, sampling against an optional
//! grammar mask, and KV-cell maintenance. All numerics stay behind this
//! trait.

use async_trait::async_trait;

use crate::config::SamplerOptions;

/// Token ID type.
pub type TokenId = i32;

/// Opaque handle to the logits produced for one batch item. Valid until the
/// next decode call for the same sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogitHandle(pub u64);

/// One sequence's share of a decode batch.
#[derive(Debug, Clone)]
pub struct DecodeItem {
    /// Engine-side sequence slot.
    pub sequence_id: u32,

    /// Ledger position of `tokens[0]`.
    pub first_position: usize,

    /// Tokens to evaluate, in ledger order.
    pub tokens: Vec<TokenId>,

    /// Whether logits for the final token are needed (sampling follows).
    pub wants_logits: bool,
}

/// Incremental grammar constraint over the token stream. Compiled
/// elsewhere; the core only steps it.
pub trait GrammarEvaluator: Send {
    /// Whether the grammar permits `token` in the current state.
    fn can_accept(&self, token: TokenId) -> bool;

    /// Advance the state past `token`.
    fn accept(&mut self, token: TokenId);

    /// Whether the constrained section may legally end here.
    fn is_complete(&self) -> bool;
}

/// The inference engine the core schedules work onto.
///
/// `decode_batch` may internally use a worker pool sized by `n_threads`;
/// callers suspend rather than block while it runs.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Tokenize text into model vocabulary IDs.
    fn tokenize(&self, text: &str) -> anyhow::Result<Vec<TokenId>>;

    /// Detokenize `tokens`, using `lookback` (a bounded window of the
    /// immediately preceding tokens) to resolve merges that span token
    /// boundaries. Incomplete trailing byte sequences surface as U+FFFD.
    fn detokenize(&self, tokens: &[TokenId], lookback: &[TokenId]) -> String;

    /// Evaluate one packed batch. Returns, per item, the logit handle for
    /// its final token (`None` when the item didn't request logits).
    async fn decode_batch(
        &self,
        items: &[DecodeItem],
        n_threads: usize,
    ) -> anyhow::Result<Vec<Option<LogitHandle>>>;

    /// Sample the next token from `logits`, optionally masked by `grammar`.
    fn sample_token(
        &self,
        logits: LogitHandle,
        sampler: &SamplerOptions,
        grammar: Option<&dyn GrammarEvaluator>,
    ) -> anyhow::Result<TokenId>;

    /// Remove KV cells `[start, end)` for a sequence. `Ok(false)` reports an
    /// engine-side refusal; the caller falls back to a full rebuild.
    async fn remove_cells(
        &self,
        sequence_id: u32,
        start: usize,
        end: usize,
    ) -> anyhow::Result<bool>;

    /// Shift KV cells `[start, end)` by `delta` positions after a removal.
    async fn shift_cells(
        &self,
        sequence_id: u32,
        start: usize,
        end: usize,
        delta: isize,
    ) -> anyhow::Result<()>;

    /// Drop every KV cell of a sequence.
    async fn clear_cells(&self, sequence_id: u32) -> anyhow::Result<()>;

    /// Whether `token` terminates generation (EOS/EOT).
    fn is_end_of_generation(&self, token: TokenId) -> bool;
}
