//! The per-request generation state machine.
//!
//! One call to [`generate`] drives a full model turn on one sequence:
//! reuse the resident prompt prefix, evaluate the remainder, then loop
//! sampling one token at a time. Each sampled token runs through the
//! stop-sequence detectors and the stream regulator before anything is
//! committed to the caller, so a stop or function-call match can still
//! retract it. When the context window fills mid-turn, the machine plans
//! a single shift sized for the whole remaining generation and continues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{resolve_sampler, SamplerOptions, SamplerOverrides};
use crate::engine::{
    apply_ranges_to_spans, EngineShared, EvictionRange, HistorySpan, Sequence, SpanKind,
};
use crate::error::{EngineError, Result};
use crate::generate::functions::{ChatFunctions, FunctionCall};
use crate::generate::response::{FinishReason, GenerationOutput, ResponseEvent};
use crate::runtime::{GrammarEvaluator, TokenId};
use crate::stream::{
    ChunkId, LockId, StopPattern, StopSequenceDetector, TokenStreamRegulator, TriggeredStop,
};

/// Tokens of preceding context handed to `detokenize` so byte merges
/// across token boundaries resolve.
const DETOKENIZE_LOOKBACK: usize = 8;

const DEFAULT_EVALUATION_PRIORITY: u8 = 8;

/// Where the machine currently is in the output syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    /// Ordinary text streaming.
    Normal,

    /// The call prefix matched, but the format allows it to begin plain
    /// text too; output is held until the next tokens disambiguate.
    FunctionPrefixOrDisengage,

    /// Inside the function name, usually grammar-constrained.
    FunctionName,

    /// Inside the parameters, up to the call suffix.
    FunctionParams,

    /// After a completed call, expecting a separator for the next call or
    /// the end of the call section.
    FunctionSectionSuffixOrBetween,
}

/// One generation turn's inputs.
pub struct GenerationRequest {
    pub prompt_tokens: Vec<TokenId>,

    /// Span metadata for the prompt, consulted by the context-shift
    /// policy. When absent (or not covering the prompt) the whole prompt
    /// counts as user input.
    pub history_spans: Vec<HistorySpan>,

    pub stop_patterns: Vec<StopPattern>,
    pub max_tokens: Option<usize>,
    pub sampler: SamplerOverrides,
    pub evaluation_priority: u8,
    pub functions: Option<ChatFunctions>,

    /// Checked cooperatively at step boundaries.
    pub abort: Option<Arc<AtomicBool>>,

    /// On abort, return the partial output instead of `Err(Aborted)`.
    pub stop_on_abort: bool,

    /// Invoked for every recorded call, before generation continues.
    pub on_function_call: Option<Arc<dyn Fn(&FunctionCall) + Send + Sync>>,
}

impl GenerationRequest {
    pub fn new(prompt_tokens: Vec<TokenId>) -> Self {
        Self {
            prompt_tokens,
            history_spans: Vec::new(),
            stop_patterns: Vec::new(),
            max_tokens: None,
            sampler: SamplerOverrides::default(),
            evaluation_priority: DEFAULT_EVALUATION_PRIORITY,
            functions: None,
            abort: None,
            stop_on_abort: true,
            on_function_call: None,
        }
    }
}

/// Run one generation turn on `seq`, optionally streaming events to
/// `sink`. The sequence keeps its resident state afterwards, so the next
/// turn can reuse it as a prefix.
///
/// A mid-turn failure returns the bare error; text chunks already sent to
/// `sink` are the caller's record of how much valid output was produced
/// before it. Callers that need partial output on failure should pass a
/// sink.
pub async fn generate(
    seq: &mut Sequence,
    request: GenerationRequest,
    sink: Option<mpsc::Sender<ResponseEvent>>,
) -> Result<GenerationOutput> {
    let engine = seq.engine().clone();
    engine.check_live()?;

    let prompt = request.prompt_tokens;
    if prompt.is_empty() {
        return Err(EngineError::Runtime(anyhow::anyhow!(
            "prompt must contain at least one token"
        )));
    }
    if prompt.len() >= engine.config.context_size {
        return Err(EngineError::ContextTooSmall {
            reason: format!(
                "prompt of {} tokens leaves no room to generate in a context of {}",
                prompt.len(),
                engine.config.context_size
            ),
        });
    }

    // Prefix reuse: keep the resident tokens the prompt agrees with, erase
    // the divergent tail.
    let resident = seq.ledger().next_index();
    let shared = seq.ledger().compare_tokens(&prompt);
    if shared < resident {
        seq.erase_ranges(&[EvictionRange::new(shared, resident)]).await?;
    }
    let mut pending: Vec<TokenId> = prompt[shared..].to_vec();
    if pending.is_empty() {
        // Whole prompt resident; re-evaluate the final token to get logits.
        seq.erase_ranges(&[EvictionRange::new(prompt.len() - 1, prompt.len())])
            .await?;
        pending = vec![prompt[prompt.len() - 1]];
    }
    seq.meter_mut().record_input(pending.len());
    debug!(
        sequence = seq.id(),
        prompt = prompt.len(),
        reused = prompt.len() - pending.len(),
        "generation turn started"
    );

    let spans_cover_prompt = !request.history_spans.is_empty()
        && request.history_spans.iter().map(|s| s.len).sum::<usize>() == prompt.len();
    let spans = if spans_cover_prompt {
        request.history_spans
    } else {
        vec![HistorySpan::new(SpanKind::UserInput, prompt.len())]
    };

    let prefix_detector = request.functions.as_ref().map(|f| {
        StopSequenceDetector::new(&[StopPattern::Text(f.syntax.call_prefix.clone())])
    });

    let machine = Machine {
        sampler: resolve_sampler(&engine.sampler_defaults, &request.sampler),
        seq,
        engine,
        priority: request.evaluation_priority,
        max_tokens: request.max_tokens,
        abort: request.abort,
        stop_on_abort: request.stop_on_abort,
        functions: request.functions,
        on_function_call: request.on_function_call,
        sink,
        spans,
        phase: GenerationPhase::Normal,
        regulator: TokenStreamRegulator::new(),
        stop_detector: StopSequenceDetector::new(&request.stop_patterns),
        prefix_detector,
        phase_detector: None,
        phase_buf: String::new(),
        current_name: None,
        grammar: None,
        queued: VecDeque::new(),
        held: Vec::new(),
        ws_hold: None,
        partial: None,
        stream_chars: 0,
        stream_tokens: 0,
        committed_text: String::new(),
        function_calls: Vec::new(),
        produced: 0,
        engage_cut: None,
        disengage_buf: String::new(),
        prefix_offset: 0,
    };
    machine.run(pending).await
}

/// Bookkeeping for one queued chunk, in the detector's offset spaces.
#[derive(Debug, Clone, Copy)]
struct ChunkMeta {
    id: ChunkId,
    start_char: usize,
    char_len: usize,
    start_token: usize,
    token_len: usize,
}

/// A chunk whose text still ends in an incomplete character; subsequent
/// tokens merge into it until the bytes resolve.
struct PartialHold {
    chunk: ChunkId,
    lock: LockId,
    tokens: Vec<TokenId>,
}

enum PhaseFeed {
    Consumed,
    Trigger {
        pattern_index: usize,
        /// Chars of the phase buffer preceding the match.
        prefix_chars: usize,
        /// Chars of the fed text following the match.
        leftover: String,
    },
}

struct Machine<'a> {
    seq: &'a mut Sequence,
    engine: Arc<EngineShared>,
    sampler: SamplerOptions,
    priority: u8,
    max_tokens: Option<usize>,
    abort: Option<Arc<AtomicBool>>,
    stop_on_abort: bool,
    functions: Option<ChatFunctions>,
    on_function_call: Option<Arc<dyn Fn(&FunctionCall) + Send + Sync>>,
    sink: Option<mpsc::Sender<ResponseEvent>>,

    spans: Vec<HistorySpan>,
    phase: GenerationPhase,

    regulator: TokenStreamRegulator,
    stop_detector: StopSequenceDetector,
    /// Watches for the function-call prefix while in `Normal`.
    prefix_detector: Option<StopSequenceDetector>,
    /// Phase-local detector for the current function sub-phase.
    phase_detector: Option<StopSequenceDetector>,
    phase_buf: String,
    current_name: Option<String>,
    grammar: Option<Box<dyn GrammarEvaluator>>,

    queued: VecDeque<ChunkMeta>,
    held: Vec<LockId>,
    ws_hold: Option<LockId>,
    partial: Option<PartialHold>,
    stream_chars: usize,
    stream_tokens: usize,

    committed_text: String,
    function_calls: Vec<FunctionCall>,
    produced: usize,

    /// Stream char offset where a maybe-call prefix started.
    engage_cut: Option<usize>,
    disengage_buf: String,
    /// Stream chars already seen when the prefix detector was (re)built;
    /// converts its local offsets to stream offsets.
    prefix_offset: usize,
}

impl Machine<'_> {
    async fn run(mut self, mut pending: Vec<TokenId>) -> Result<GenerationOutput> {
        let mut feeding_prompt = true;
        loop {
            if self.abort_requested() {
                if self.stop_on_abort && self.produced > 0 {
                    return self.finalize(FinishReason::Abort).await;
                }
                return Err(EngineError::Aborted);
            }

            self.ensure_capacity(pending.len()).await?;

            let handle = self
                .seq
                .decode(pending.clone(), true, self.priority)
                .await?
                .ok_or_else(|| {
                    EngineError::BatchDispatch("decode produced no logits".into())
                })?;
            if feeding_prompt {
                feeding_prompt = false;
            } else {
                self.note_output_tokens(pending.len());
            }

            let token =
                self.engine
                    .runtime
                    .sample_token(handle, &self.sampler, self.grammar.as_deref())?;
            if self.engine.runtime.is_end_of_generation(token) {
                return self.finish_on_eog().await;
            }
            if let Some(grammar) = self.grammar.as_mut() {
                grammar.accept(token);
            }
            self.produced += 1;
            self.seq.meter_mut().record_output(1);

            if let Some(reason) = self.step_token(token).await? {
                return self.finalize(reason).await;
            }
            if let Some(max) = self.max_tokens {
                if self.produced >= max {
                    return self.finalize(FinishReason::MaxTokens).await;
                }
            }
            pending = vec![token];
        }
    }

    fn abort_requested(&self) -> bool {
        self.abort
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Grow the trailing model-output span to mirror the ledger.
    fn note_output_tokens(&mut self, count: usize) {
        match self.spans.last_mut() {
            Some(span) if span.kind == SpanKind::ModelOutput => span.len += count,
            _ => self.spans.push(HistorySpan::new(SpanKind::ModelOutput, count)),
        }
    }

    /// Make room for `incoming` tokens, shifting the context if the window
    /// is full. The shift target covers the whole remaining generation so
    /// one shift suffices for the turn.
    async fn ensure_capacity(&mut self, incoming: usize) -> Result<()> {
        let context_size = self.seq.context_size();
        let resident = self.seq.ledger().next_index();
        if resident + incoming <= context_size {
            return Ok(());
        }
        if !matches!(
            self.phase,
            GenerationPhase::Normal | GenerationPhase::FunctionSectionSuffixOrBetween
        ) {
            return Err(EngineError::ContextTooSmall {
                reason: "context window exhausted inside an unfinished function call".into(),
            });
        }

        let overflow = resident + incoming - context_size;
        let remaining = self
            .max_tokens
            .map(|max| max.saturating_sub(self.produced))
            .unwrap_or(0);
        let needed = overflow + remaining;

        let ranges =
            self.engine
                .shift_planner
                .plan_shift(&self.spans, resident, context_size, needed)?;
        let removed = self.seq.erase_ranges(&ranges).await?;
        self.spans = apply_ranges_to_spans(&self.spans, &ranges);
        info!(
            sequence = self.seq.id(),
            removed, needed, "context shifted mid-generation"
        );
        Ok(())
    }

    async fn step_token(&mut self, token: TokenId) -> Result<Option<FinishReason>> {
        match self.phase {
            GenerationPhase::Normal | GenerationPhase::FunctionPrefixOrDisengage => {
                self.step_stream(token).await
            }
            _ => {
                let text = self.detok(&[token], 0);
                self.process_function_text(&text).await
            }
        }
    }

    /// Detokenize `tokens` against the ledger tail, skipping the last
    /// `exclude_tail` resident tokens (those already part of the text being
    /// re-derived).
    fn detok(&self, tokens: &[TokenId], exclude_tail: usize) -> String {
        let ledger = self.seq.ledger().tokens();
        let end = ledger.len().saturating_sub(exclude_tail);
        let lookback = &ledger[end.saturating_sub(DETOKENIZE_LOOKBACK)..end];
        self.engine.runtime.detokenize(tokens, lookback)
    }

    /// One token through the streaming pipeline: chunk it, feed the
    /// detectors, manage locks, flush what resolved.
    async fn step_stream(&mut self, token: TokenId) -> Result<Option<FinishReason>> {
        // A whitespace-only chunk is held exactly one extra step.
        if let Some(lock) = self.ws_hold.take() {
            self.regulator.release(lock);
        }

        let (chunk_id, text, chunk_tokens) = match self.partial.take() {
            Some(mut partial) => {
                // Merge into the unresolved chunk; its tokens are the
                // ledger tail, the new one is not resident yet.
                let joint = {
                    let mut all = partial.tokens.clone();
                    all.push(token);
                    self.detok(&all, partial.tokens.len())
                };
                self.regulator.extend_chunk(partial.chunk, token, joint.clone());
                partial.tokens.push(token);
                if joint.ends_with('\u{FFFD}') {
                    self.partial = Some(partial);
                    return Ok(None);
                }
                self.regulator.release(partial.lock);
                (partial.chunk, joint, partial.tokens)
            }
            None => {
                let text = self.detok(&[token], 0);
                let chunk = self.regulator.add_chunk(vec![token], text.clone());
                if text.ends_with('\u{FFFD}') {
                    let lock = self.must_hold(chunk)?;
                    self.partial = Some(PartialHold {
                        chunk,
                        lock,
                        tokens: vec![token],
                    });
                    return Ok(None);
                }
                (chunk, text, vec![token])
            }
        };

        let push_start = self.stream_chars;
        let char_len = text.chars().count();
        self.queued.push_back(ChunkMeta {
            id: chunk_id,
            start_char: push_start,
            char_len,
            start_token: self.stream_tokens,
            token_len: chunk_tokens.len(),
        });
        self.stream_chars += char_len;
        self.stream_tokens += chunk_tokens.len();

        // Feed the detectors. Merged chunks advance the token matchers
        // once per token, then the resolved text in one pass.
        if chunk_tokens.len() == 1 {
            self.stop_detector.push_token(chunk_tokens[0], &text);
        } else {
            for &t in &chunk_tokens {
                self.stop_detector.push_token(t, "");
            }
            self.stop_detector.push_text(&text);
        }
        if self.phase == GenerationPhase::Normal {
            if let Some(detector) = self.prefix_detector.as_mut() {
                detector.push_text(&text);
            }
        }

        if let Some(trigger) = self.stop_detector.triggered().cloned() {
            match trigger {
                TriggeredStop::Text { start_char, .. } => self.cut_stream_chars(start_char),
                TriggeredStop::Tokens { start_token, .. } => {
                    self.cut_stream_tokens(start_token)
                }
            }
            return Ok(Some(FinishReason::StopTrigger));
        }

        if self.phase == GenerationPhase::FunctionPrefixOrDisengage {
            if let Some(reason) = self.step_disengage_text(&text).await? {
                return Ok(Some(reason));
            }
        } else if let Some(trigger) = self
            .prefix_detector
            .as_ref()
            .and_then(|d| d.triggered())
            .cloned()
        {
            if let TriggeredStop::Text {
                start_char,
                end_char,
                ..
            } = trigger
            {
                // The prefix detector only sees normal-phase text, so its
                // offsets are rebased onto the stream.
                let start_char = self.prefix_offset + start_char;
                let consumed = self.prefix_offset + end_char - push_start;
                let leftover: String = text.chars().skip(consumed).collect();
                let allows_disengage = self
                    .functions
                    .as_ref()
                    .map(|f| f.syntax.allows_disengage)
                    .unwrap_or(false);
                if allows_disengage {
                    // Keep everything held until the next tokens prove or
                    // disprove a real call.
                    self.phase = GenerationPhase::FunctionPrefixOrDisengage;
                    self.engage_cut = Some(start_char);
                    self.disengage_buf.clear();
                    let params_prefix = self
                        .functions
                        .as_ref()
                        .map(|f| f.syntax.params_prefix.clone())
                        .unwrap_or_default();
                    self.phase_detector = Some(StopSequenceDetector::new(&[
                        StopPattern::Text(params_prefix),
                    ]));
                    if let Some(lock) = self.regulator.hold(chunk_id) {
                        self.held.push(lock);
                    }
                    if let Some(reason) = self.step_disengage_text(&leftover).await? {
                        return Ok(Some(reason));
                    }
                    return Ok(None);
                }
                self.cut_stream_chars(start_char);
                self.release_held();
                self.flush_ready().await;
                self.begin_name_phase();
                return self.process_function_text(&leftover).await;
            }
        }

        // Hold while any watcher might still invalidate this text; once
        // every candidate is ruled out, everything held flows.
        let watching = self.stop_detector.has_in_progress()
            || self.phase == GenerationPhase::FunctionPrefixOrDisengage
            || self
                .prefix_detector
                .as_ref()
                .map(|d| d.has_in_progress())
                .unwrap_or(false);
        if watching {
            if let Some(lock) = self.regulator.hold(chunk_id) {
                self.held.push(lock);
            }
        } else {
            self.release_held();
        }

        if !text.is_empty() && text.chars().all(char::is_whitespace) {
            self.ws_hold = self.regulator.hold(chunk_id);
        }

        self.flush_ready().await;
        Ok(None)
    }

    /// In the maybe-call window: engage once the params prefix appears
    /// after a known name, disengage once no function name can match.
    async fn step_disengage_text(&mut self, text: &str) -> Result<Option<FinishReason>> {
        let trigger = match self.phase_detector.as_mut() {
            Some(detector) => {
                let before = detector.chars_seen();
                detector.push_text(text);
                detector.triggered().cloned().map(|t| (t, before))
            }
            None => None,
        };

        if let Some((
            TriggeredStop::Text {
                start_char,
                end_char,
                ..
            },
            before,
        )) = trigger
        {
            let consumed = end_char - before;
            let taken: String = text.chars().take(consumed).collect();
            self.disengage_buf.push_str(&taken);
            let name: String = self.disengage_buf.chars().take(start_char).collect();

            let known = self
                .functions
                .as_ref()
                .map(|f| f.spec_for(&name).is_some())
                .unwrap_or(false);
            if known {
                let leftover: String = text.chars().skip(consumed).collect();
                let cut = self.engage_cut.take().unwrap_or(0);
                self.cut_stream_chars(cut);
                self.release_held();
                self.flush_ready().await;
                self.begin_params_phase(&name)?;
                return self.process_function_text(&leftover).await;
            }
            // A params prefix after an unknown name: this was never a call.
            self.do_disengage();
            return Ok(None);
        }

        self.disengage_buf.push_str(text);
        if !self.disengage_viable() {
            self.do_disengage();
        }
        Ok(None)
    }

    /// Whether the accumulated maybe-call text can still become a call to
    /// a known function.
    fn disengage_viable(&self) -> bool {
        let buf = &self.disengage_buf;
        let Some(funcs) = self.functions.as_ref() else {
            return false;
        };
        if funcs.name_viable(buf) {
            return true;
        }
        // Past a full name, only the start of the params prefix may
        // follow; anything else rules the call out.
        funcs.specs.iter().any(|s| {
            buf.strip_prefix(s.name.as_str())
                .is_some_and(|rest| funcs.syntax.params_prefix.starts_with(rest))
        })
    }

    fn do_disengage(&mut self) {
        debug!("maybe-call prefix ruled out, resuming text stream");
        self.release_held();
        self.phase = GenerationPhase::Normal;
        self.phase_detector = None;
        self.disengage_buf.clear();
        self.engage_cut = None;
        // A fresh detector, rebased at the current stream position.
        if let Some(funcs) = self.functions.as_ref() {
            self.prefix_detector = Some(StopSequenceDetector::new(&[StopPattern::Text(
                funcs.syntax.call_prefix.clone(),
            )]));
            self.prefix_offset = self.stream_chars;
        }
    }

    fn begin_name_phase(&mut self) {
        let (grammar, patterns) = match &self.functions {
            Some(funcs) => (
                funcs.name_grammar.as_ref().map(|f| f()),
                vec![
                    StopPattern::Text(funcs.syntax.params_prefix.clone()),
                    StopPattern::Text(funcs.syntax.call_suffix.clone()),
                ],
            ),
            None => return,
        };
        self.grammar = grammar;
        self.phase_detector = Some(StopSequenceDetector::new(&patterns));
        self.phase_buf.clear();
        self.phase = GenerationPhase::FunctionName;
    }

    fn begin_params_phase(&mut self, name: &str) -> Result<()> {
        let (grammar, suffix) = match &self.functions {
            Some(funcs) => {
                let spec = funcs.spec_for(name).ok_or_else(|| {
                    EngineError::GrammarViolation {
                        what: "function name".into(),
                        detail: format!("model called unknown function {name:?}"),
                    }
                })?;
                (
                    funcs.params_grammar.as_ref().and_then(|f| f(spec)),
                    funcs.syntax.call_suffix.clone(),
                )
            }
            None => return Ok(()),
        };
        self.grammar = grammar;
        self.phase_detector = Some(StopSequenceDetector::new(&[StopPattern::Text(suffix)]));
        self.phase_buf.clear();
        self.current_name = Some(name.to_string());
        self.phase = GenerationPhase::FunctionParams;
        Ok(())
    }

    /// After a recorded call: loop for the next one or close the section.
    fn after_call(&mut self) -> Option<FinishReason> {
        self.grammar = None;
        self.current_name = None;
        let patterns = match &self.functions {
            Some(funcs) => match &funcs.syntax.between_calls {
                Some(between) => {
                    let mut patterns = vec![StopPattern::Text(between.clone())];
                    if let Some(suffix) = &funcs.syntax.section_suffix {
                        patterns.push(StopPattern::Text(suffix.clone()));
                    }
                    patterns
                }
                None => return Some(FinishReason::FunctionCalls),
            },
            None => return Some(FinishReason::FunctionCalls),
        };
        self.phase_detector = Some(StopSequenceDetector::new(&patterns));
        self.phase_buf.clear();
        self.phase = GenerationPhase::FunctionSectionSuffixOrBetween;
        None
    }

    /// Feed text through the function sub-phases, following transitions
    /// until it is consumed or the section resolves.
    async fn process_function_text(&mut self, text: &str) -> Result<Option<FinishReason>> {
        let mut rest = text.to_string();
        loop {
            match (self.phase, self.feed_phase(&rest)) {
                (GenerationPhase::FunctionSectionSuffixOrBetween, PhaseFeed::Consumed) => {
                    let in_progress = self
                        .phase_detector
                        .as_ref()
                        .map(|d| d.has_in_progress())
                        .unwrap_or(false);
                    if !in_progress && !self.phase_buf.trim().is_empty() {
                        debug!("text after the call section, finishing");
                        return Ok(Some(FinishReason::FunctionCalls));
                    }
                    return Ok(None);
                }
                (_, PhaseFeed::Consumed) => return Ok(None),
                (
                    GenerationPhase::FunctionName,
                    PhaseFeed::Trigger {
                        pattern_index,
                        prefix_chars,
                        leftover,
                    },
                ) => {
                    let name: String = self.phase_buf.chars().take(prefix_chars).collect();
                    if pattern_index == 0 {
                        self.begin_params_phase(&name)?;
                    } else {
                        // Call suffix right after the name: no parameters.
                        self.record_call(&name, "").await?;
                        if let Some(reason) = self.after_call() {
                            return Ok(Some(reason));
                        }
                    }
                    rest = leftover;
                }
                (
                    GenerationPhase::FunctionParams,
                    PhaseFeed::Trigger {
                        prefix_chars,
                        leftover,
                        ..
                    },
                ) => {
                    let raw: String = self.phase_buf.chars().take(prefix_chars).collect();
                    let name = self.current_name.clone().unwrap_or_default();
                    self.record_call(&name, &raw).await?;
                    if let Some(reason) = self.after_call() {
                        return Ok(Some(reason));
                    }
                    rest = leftover;
                }
                (
                    GenerationPhase::FunctionSectionSuffixOrBetween,
                    PhaseFeed::Trigger {
                        pattern_index,
                        leftover,
                        ..
                    },
                ) => {
                    if pattern_index == 0 {
                        self.begin_name_phase();
                        rest = leftover;
                    } else {
                        return Ok(Some(FinishReason::FunctionCalls));
                    }
                }
                _ => return Ok(None),
            }
        }
    }

    fn feed_phase(&mut self, text: &str) -> PhaseFeed {
        let detector = match self.phase_detector.as_mut() {
            Some(d) => d,
            None => return PhaseFeed::Consumed,
        };
        let before = detector.chars_seen();
        detector.push_text(text);
        match detector.triggered().cloned() {
            Some(TriggeredStop::Text {
                pattern_index,
                start_char,
                end_char,
            }) => {
                let consumed = end_char - before;
                let taken: String = text.chars().take(consumed).collect();
                self.phase_buf.push_str(&taken);
                PhaseFeed::Trigger {
                    pattern_index,
                    prefix_chars: start_char,
                    leftover: text.chars().skip(consumed).collect(),
                }
            }
            _ => {
                self.phase_buf.push_str(text);
                PhaseFeed::Consumed
            }
        }
    }

    async fn record_call(&mut self, name: &str, raw_params: &str) -> Result<()> {
        let call = match &self.functions {
            Some(funcs) => funcs.parse_call(name, raw_params)?,
            None => return Ok(()),
        };
        debug!(function = name, "function call recorded");
        if let Some(callback) = self.on_function_call.clone() {
            callback(&call);
        }
        self.emit(ResponseEvent::FunctionCall(call.clone())).await;
        self.function_calls.push(call);
        Ok(())
    }

    async fn finish_on_eog(&mut self) -> Result<GenerationOutput> {
        match self.phase {
            GenerationPhase::Normal | GenerationPhase::FunctionPrefixOrDisengage => {
                self.finalize(FinishReason::EndOfGeneration).await
            }
            GenerationPhase::FunctionSectionSuffixOrBetween => {
                self.finalize(FinishReason::FunctionCalls).await
            }
            GenerationPhase::FunctionName | GenerationPhase::FunctionParams => {
                Err(EngineError::GrammarViolation {
                    what: "function call".into(),
                    detail: "generation ended inside an unfinished call".into(),
                })
            }
        }
    }

    /// Cut the queued stream at a char offset: the containing chunk keeps
    /// its pre-match chars (its tokens are dropped with the match), later
    /// chunks are discarded.
    fn cut_stream_chars(&mut self, at: usize) {
        let Some(pos) = self
            .queued
            .iter()
            .position(|m| at < m.start_char + m.char_len)
        else {
            return;
        };
        let meta = self.queued[pos];
        self.regulator
            .truncate_chunk(meta.id, at.saturating_sub(meta.start_char));
        if let Some(next) = self.queued.get(pos + 1) {
            self.regulator.discard_from(next.id);
        }
        self.queued.truncate(pos + 1);
    }

    fn cut_stream_tokens(&mut self, at: usize) {
        let Some(pos) = self
            .queued
            .iter()
            .position(|m| at < m.start_token + m.token_len)
        else {
            return;
        };
        let meta = self.queued[pos];
        self.regulator.truncate_chunk(meta.id, 0);
        if let Some(next) = self.queued.get(pos + 1) {
            self.regulator.discard_from(next.id);
        }
        self.queued.truncate(pos + 1);
    }

    fn release_held(&mut self) {
        for lock in self.held.drain(..) {
            self.regulator.release(lock);
        }
    }

    fn must_hold(&mut self, chunk: ChunkId) -> Result<LockId> {
        self.regulator.hold(chunk).ok_or_else(|| {
            EngineError::Runtime(anyhow::anyhow!("chunk left the queue while being built"))
        })
    }

    async fn flush_ready(&mut self) {
        for chunk in self.regulator.pop_free_chunks() {
            self.committed_text.push_str(&chunk.text);
            self.emit(ResponseEvent::Text {
                text: chunk.text,
                tokens: chunk.tokens,
            })
            .await;
        }
        while self.queued.len() > self.regulator.len() {
            self.queued.pop_front();
        }
    }

    async fn emit(&self, event: ResponseEvent) {
        if let Some(sink) = &self.sink {
            // A dropped receiver just stops streaming; the turn still
            // completes and returns its output.
            let _ = sink.send(event).await;
        }
    }

    async fn finalize(&mut self, reason: FinishReason) -> Result<GenerationOutput> {
        self.partial = None;
        self.ws_hold = None;
        self.held.clear();
        for chunk in self.regulator.flush_all() {
            self.committed_text.push_str(&chunk.text);
            self.emit(ResponseEvent::Text {
                text: chunk.text,
                tokens: chunk.tokens,
            })
            .await;
        }

        let usage = self.seq.meter();
        self.emit(ResponseEvent::Done {
            finish_reason: reason,
            usage,
        })
        .await;
        info!(
            sequence = self.seq.id(),
            ?reason,
            produced = self.produced,
            "generation finished"
        );
        Ok(GenerationOutput {
            text: std::mem::take(&mut self.committed_text),
            function_calls: std::mem::take(&mut self.function_calls),
            finish_reason: reason,
            usage,
            context_snapshot: self.seq.ledger().tokens().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{EngineInstance, SpanKind};
    use crate::runtime::ScriptedRuntime;
    use crate::threads::ThreadBudgetAllocator;

    fn engine_with(runtime: Arc<ScriptedRuntime>, config: EngineConfig) -> EngineInstance {
        let allocator = ThreadBudgetAllocator::new(0);
        EngineInstance::with_config(runtime, config, &allocator).unwrap()
    }

    #[tokio::test]
    async fn test_stop_string_spanning_tokens_yields_clean_text() {
        let runtime = Arc::new(ScriptedRuntime::new(&["Hel", "lo", "</", "s>", "Hi"]));
        let engine = engine_with(runtime.clone(), EngineConfig::default());
        let mut seq = engine.acquire_sequence().await.unwrap();

        runtime.script_tokens(&[0, 1, 2, 3]); // "Hel" "lo" "</" "s>"
        let prompt = vec![4]; // "Hi"
        let mut request = GenerationRequest::new(prompt);
        request.stop_patterns = vec![StopPattern::text("</s>")];

        let output = generate(&mut seq, request, None).await.unwrap();
        assert_eq!(output.text, "Hello");
        assert_eq!(output.finish_reason, FinishReason::StopTrigger);
    }

    #[tokio::test]
    async fn test_end_of_generation_finishes_with_full_text() {
        let runtime = Arc::new(ScriptedRuntime::new(&["Hi", "the", "re"]));
        let engine = engine_with(runtime.clone(), EngineConfig::default());
        let mut seq = engine.acquire_sequence().await.unwrap();

        runtime.script_tokens(&[1, 2, runtime.eog_token()]);
        let output = generate(&mut seq, GenerationRequest::new(vec![0]), None)
            .await
            .unwrap();
        assert_eq!(output.text, "there");
        assert_eq!(output.finish_reason, FinishReason::EndOfGeneration);
        assert_eq!(output.usage.input_tokens, 1);
        assert_eq!(output.usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn test_max_tokens_cuts_generation() {
        let runtime = Arc::new(ScriptedRuntime::new(&["a", "b"]));
        let engine = engine_with(runtime.clone(), EngineConfig::default());
        let mut seq = engine.acquire_sequence().await.unwrap();

        runtime.script_tokens(&[1, 1, 1, 1, 1, 1]);
        let mut request = GenerationRequest::new(vec![0]);
        request.max_tokens = Some(3);
        let output = generate(&mut seq, request, None).await.unwrap();
        assert_eq!(output.text, "bbb");
        assert_eq!(output.finish_reason, FinishReason::MaxTokens);
    }

    #[tokio::test]
    async fn test_prompt_prefix_reuse_reevaluates_last_token() {
        let runtime = Arc::new(ScriptedRuntime::new(&["a", "b", "c"]));
        let engine = engine_with(runtime.clone(), EngineConfig::default());
        let mut seq = engine.acquire_sequence().await.unwrap();

        runtime.script_tokens(&[2, runtime.eog_token()]);
        let first = generate(&mut seq, GenerationRequest::new(vec![0, 1]), None)
            .await
            .unwrap();
        assert_eq!(first.text, "c");

        // Same context plus the previous output as prompt: everything is
        // resident, only the final token is re-evaluated.
        runtime.script_tokens(&[2, runtime.eog_token()]);
        let prompt = first.context_snapshot.clone();
        let second = generate(&mut seq, GenerationRequest::new(prompt), None)
            .await
            .unwrap();
        assert_eq!(second.text, "c");
        assert_eq!(second.usage.input_tokens, 2 + 1); // first turn + re-eval
    }

    #[tokio::test]
    async fn test_abort_returns_partial_output() {
        let runtime = Arc::new(ScriptedRuntime::new(&["x", "y"]));
        let engine = engine_with(runtime.clone(), EngineConfig::default());
        let mut seq = engine.acquire_sequence().await.unwrap();

        let flag = Arc::new(AtomicBool::new(true));
        runtime.script_tokens(&[1, 1, 1, 1]);
        let mut request = GenerationRequest::new(vec![0]);
        request.abort = Some(flag.clone());
        request.max_tokens = Some(10);

        // stop_on_abort but nothing produced yet: hard error.
        let err = generate(&mut seq, request, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Aborted));
    }

    #[tokio::test]
    async fn test_history_spans_default_to_user_input() {
        let runtime = Arc::new(ScriptedRuntime::new(&["a"]));
        let engine = engine_with(runtime.clone(), EngineConfig::default());
        let mut seq = engine.acquire_sequence().await.unwrap();

        runtime.script_tokens(&[runtime.eog_token()]);
        let mut request = GenerationRequest::new(vec![0]);
        request.history_spans = vec![HistorySpan::new(SpanKind::SystemPrompt, 99)]; // wrong cover
        let output = generate(&mut seq, request, None).await.unwrap();
        assert_eq!(output.finish_reason, FinishReason::EndOfGeneration);
    }
}
