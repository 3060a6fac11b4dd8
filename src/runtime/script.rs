//! Scripted model runtime.
//!
//! Simulates the native engine for integration testing without any tensor
//! library: a byte-piece vocabulary (so multi-byte UTF-8 sequences can be
//! split across tokens), a scripted queue of sampled tokens, a log of every
//! decode round for batch assertions, and per-sequence cell mirrors that
//! verify the core keeps positions contiguous.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::SamplerOptions;
use crate::runtime::model::{DecodeItem, GrammarEvaluator, LogitHandle, ModelRuntime, TokenId};

/// One recorded decode round.
#[derive(Debug, Clone)]
pub struct RoundLog {
    /// `(sequence_id, first_position, token_count)` per packed item.
    pub items: Vec<(u32, usize, usize)>,
    pub total_tokens: usize,
    pub n_threads: usize,
}

#[derive(Default)]
struct ScriptState {
    /// Tokens the next `sample_token` calls will return, in order.
    script: Vec<TokenId>,
    cursor: usize,

    /// Engine-side cell count per sequence; decode asserts contiguity
    /// against it.
    cells: HashMap<u32, usize>,

    rounds: Vec<RoundLog>,
}

/// Deterministic [`ModelRuntime`] for tests.
pub struct ScriptedRuntime {
    pieces: Vec<Vec<u8>>,
    eog_token: TokenId,
    state: Mutex<ScriptState>,
    next_handle: AtomicU64,

    /// Remaining `remove_cells` calls that report engine-side failure.
    fail_removals: AtomicUsize,

    /// Remaining `decode_batch` calls that fail outright.
    fail_decodes: AtomicUsize,
}

impl ScriptedRuntime {
    /// Build a runtime whose vocabulary is `pieces`, indexed by token ID.
    /// The end-of-generation token is appended after the last piece.
    pub fn new(pieces: &[&str]) -> Self {
        let pieces: Vec<Vec<u8>> = pieces.iter().map(|p| p.as_bytes().to_vec()).collect();
        let eog_token = pieces.len() as TokenId;
        Self {
            pieces,
            eog_token,
            state: Mutex::new(ScriptState::default()),
            next_handle: AtomicU64::new(1),
            fail_removals: AtomicUsize::new(0),
            fail_decodes: AtomicUsize::new(0),
        }
    }

    /// Append a raw byte piece (may be an incomplete UTF-8 fragment) and
    /// return its token ID.
    pub fn add_piece_bytes(&mut self, bytes: &[u8]) -> TokenId {
        // Keep the EOG token past the vocabulary end.
        self.pieces.push(bytes.to_vec());
        self.eog_token = self.pieces.len() as TokenId;
        (self.pieces.len() - 1) as TokenId
    }

    /// The end-of-generation token ID.
    pub fn eog_token(&self) -> TokenId {
        self.eog_token
    }

    /// Queue tokens for subsequent `sample_token` calls.
    pub fn script_tokens(&self, tokens: &[TokenId]) {
        let mut state = self.state.lock().unwrap();
        state.script.extend_from_slice(tokens);
    }

    /// Queue the piece tokens for `text`, followed by end-of-generation.
    pub fn script_text(&self, text: &str) -> anyhow::Result<()> {
        let mut tokens = self.tokenize(text)?;
        tokens.push(self.eog_token);
        self.script_tokens(&tokens);
        Ok(())
    }

    /// Make the next `n` cell removals report engine-side failure.
    pub fn fail_next_removals(&self, n: usize) {
        self.fail_removals.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` decode calls fail outright.
    pub fn fail_next_decodes(&self, n: usize) {
        self.fail_decodes.store(n, Ordering::SeqCst);
    }

    /// All decode rounds recorded so far.
    pub fn rounds(&self) -> Vec<RoundLog> {
        self.state.lock().unwrap().rounds.clone()
    }

    /// Engine-side cell count for a sequence.
    pub fn cell_count(&self, sequence_id: u32) -> usize {
        *self
            .state
            .lock()
            .unwrap()
            .cells
            .get(&sequence_id)
            .unwrap_or(&0)
    }

    fn bytes_of(&self, tokens: &[TokenId]) -> Vec<u8> {
        let mut out = Vec::new();
        for &t in tokens {
            if let Some(piece) = self.pieces.get(t as usize) {
                out.extend_from_slice(piece);
            }
        }
        out
    }
}

#[async_trait]
impl ModelRuntime for ScriptedRuntime {
    fn tokenize(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
        // Greedy longest-piece match.
        let bytes = text.as_bytes();
        let mut tokens = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let mut best: Option<(usize, TokenId)> = None;
            for (id, piece) in self.pieces.iter().enumerate() {
                if !piece.is_empty()
                    && bytes[pos..].starts_with(piece)
                    && best.map(|(len, _)| piece.len() > len).unwrap_or(true)
                {
                    best = Some((piece.len(), id as TokenId));
                }
            }
            match best {
                Some((len, id)) => {
                    tokens.push(id);
                    pos += len;
                }
                None => anyhow::bail!("no vocabulary piece matches text at byte {pos}"),
            }
        }
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[TokenId], lookback: &[TokenId]) -> String {
        let tok_bytes = self.bytes_of(tokens);
        if lookback.is_empty() {
            return String::from_utf8_lossy(&tok_bytes).into_owned();
        }

        // Trailing incomplete bytes in the lookback merge into the first
        // emitted character.
        let lb_bytes = self.bytes_of(lookback);
        let mut full = lb_bytes.clone();
        full.extend_from_slice(&tok_bytes);
        let full_text = String::from_utf8_lossy(&full).into_owned();
        let lb_text = String::from_utf8_lossy(&lb_bytes).into_owned();
        let lb_complete = lb_text.trim_end_matches('\u{FFFD}');
        match full_text.strip_prefix(lb_complete) {
            Some(rest) => rest.to_string(),
            None => String::from_utf8_lossy(&tok_bytes).into_owned(),
        }
    }

    async fn decode_batch(
        &self,
        items: &[DecodeItem],
        n_threads: usize,
    ) -> anyhow::Result<Vec<Option<LogitHandle>>> {
        if self.fail_decodes.load(Ordering::SeqCst) > 0 {
            self.fail_decodes.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("scripted decode failure");
        }

        let mut state = self.state.lock().unwrap();
        let mut log = RoundLog {
            items: Vec::with_capacity(items.len()),
            total_tokens: 0,
            n_threads,
        };
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let next = state.cells.entry(item.sequence_id).or_insert(0);
            if item.first_position != *next {
                anyhow::bail!(
                    "sequence {}: decode at position {} but {} cells resident",
                    item.sequence_id,
                    item.first_position,
                    next
                );
            }
            *next += item.tokens.len();

            log.items
                .push((item.sequence_id, item.first_position, item.tokens.len()));
            log.total_tokens += item.tokens.len();

            handles.push(if item.wants_logits {
                Some(LogitHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
            } else {
                None
            });
        }

        state.rounds.push(log);
        Ok(handles)
    }

    fn sample_token(
        &self,
        _logits: LogitHandle,
        _sampler: &SamplerOptions,
        grammar: Option<&dyn GrammarEvaluator>,
    ) -> anyhow::Result<TokenId> {
        let mut state = self.state.lock().unwrap();
        let token = match state.script.get(state.cursor) {
            Some(&t) => t,
            None => anyhow::bail!("sample script exhausted"),
        };
        state.cursor += 1;

        if let Some(grammar) = grammar {
            if !grammar.can_accept(token) {
                anyhow::bail!("scripted token {token} rejected by grammar mask");
            }
        }
        Ok(token)
    }

    async fn remove_cells(
        &self,
        sequence_id: u32,
        start: usize,
        end: usize,
    ) -> anyhow::Result<bool> {
        if self.fail_removals.load(Ordering::SeqCst) > 0 {
            self.fail_removals.fetch_sub(1, Ordering::SeqCst);
            return Ok(false);
        }
        let mut state = self.state.lock().unwrap();
        let cells = state.cells.entry(sequence_id).or_insert(0);
        let removed = end.min(*cells).saturating_sub(start.min(*cells));
        *cells -= removed;
        Ok(true)
    }

    async fn shift_cells(
        &self,
        _sequence_id: u32,
        _start: usize,
        _end: usize,
        _delta: isize,
    ) -> anyhow::Result<()> {
        // Cell positions are implicit in the mirror; removal already
        // compacts them.
        Ok(())
    }

    async fn clear_cells(&self, sequence_id: u32) -> anyhow::Result<()> {
        self.state.lock().unwrap().cells.insert(sequence_id, 0);
        Ok(())
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == self.eog_token
    }
}
