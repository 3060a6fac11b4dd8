//! Engine and sampler configuration.
//!
//! Configuration is layered: callers may set per-request sampler options,
//! engines carry defaults, and built-ins fill the rest. The layers are
//! immutable structs merged by [`resolve_sampler`] with documented
//! precedence (request > engine defaults > built-ins).

use serde::{Deserialize, Serialize};

/// Fixed sizing for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Context window size in tokens, per sequence.
    pub context_size: usize,

    /// Maximum tokens submitted to the model runtime in one decode call.
    pub batch_capacity: usize,

    /// Number of independent sequence slots this instance exposes.
    pub sequence_slots: usize,

    /// Threads this instance wants while evaluating.
    pub wanted_threads: usize,

    /// Minimum threads this instance will evaluate with. Below this it
    /// waits for the budget to free up instead of running under-resourced.
    pub min_threads: usize,

    /// Fraction of the context window a default context shift frees,
    /// on top of whatever the pending generation still needs.
    pub shift_free_fraction: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            batch_capacity: 512,
            sequence_slots: 1,
            wanted_threads: 4,
            min_threads: 1,
            shift_free_fraction: 0.10,
        }
    }
}

/// Per-request sampling options. `None` fields fall through to the next
/// layer in [`resolve_sampler`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplerOverrides {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub repeat_penalty: Option<RepeatPenaltyOptions>,
}

/// Fully resolved sampling options handed to the model runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerOptions {
    /// 0.0 = greedy.
    pub temperature: f64,

    /// Nucleus sampling threshold.
    pub top_p: f64,

    pub repeat_penalty: RepeatPenaltyOptions,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            repeat_penalty: RepeatPenaltyOptions::default(),
        }
    }
}

/// Repeat-penalty tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatPenaltyOptions {
    /// Multiplicative penalty applied to recently seen tokens (1.0 = off).
    pub penalty: f64,

    /// How many recent tokens the penalty considers.
    pub last_tokens: usize,
}

impl Default for RepeatPenaltyOptions {
    fn default() -> Self {
        Self {
            penalty: 1.1,
            last_tokens: 64,
        }
    }
}

/// Merge sampler layers. Precedence: `request` over `engine_defaults` over
/// the built-in [`SamplerOptions::default`].
pub fn resolve_sampler(
    engine_defaults: &SamplerOptions,
    request: &SamplerOverrides,
) -> SamplerOptions {
    SamplerOptions {
        temperature: request.temperature.unwrap_or(engine_defaults.temperature),
        top_p: request.top_p.unwrap_or(engine_defaults.top_p),
        repeat_penalty: request
            .repeat_penalty
            .clone()
            .unwrap_or_else(|| engine_defaults.repeat_penalty.clone()),
    }
}

impl EngineConfig {
    /// Validate sizing invariants once, at engine construction.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.context_size == 0 {
            anyhow::bail!("context_size must be non-zero");
        }
        if self.batch_capacity == 0 {
            anyhow::bail!("batch_capacity must be non-zero");
        }
        if self.sequence_slots == 0 {
            anyhow::bail!("sequence_slots must be non-zero");
        }
        if self.min_threads > self.wanted_threads {
            anyhow::bail!(
                "min_threads ({}) exceeds wanted_threads ({})",
                self.min_threads,
                self.wanted_threads
            );
        }
        if !(0.0..=1.0).contains(&self.shift_free_fraction) {
            anyhow::bail!("shift_free_fraction must be within [0, 1]");
        }
        Ok(())
    }
}
