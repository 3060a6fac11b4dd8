//! chat-sequencer: batched conversational decoding core for LLM inference.
//!
//! Multiple conversations share one model engine: decode requests from all
//! sequences are packed into shared batches under a token budget, engine
//! threads are split across concurrently evaluating instances, and each
//! sequence keeps a position ledger so context-window shifts evict old
//! history without restarting the conversation. Generated tokens stream
//! through a regulator that withholds anything a stop sequence or
//! function-call marker could still retract.
//!
//! The model itself stays behind the [`runtime::ModelRuntime`] trait; a
//! scripted implementation backs the test suite.

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod generate;
pub mod runtime;
pub mod stream;
pub mod threads;

pub use config::{EngineConfig, SamplerOptions, SamplerOverrides};
pub use engine::{EngineInstance, EngineOptions, Sequence};
pub use error::{EngineError, Result};
pub use generate::{generate, FinishReason, GenerationOutput, GenerationRequest, ResponseEvent};
pub use runtime::{ModelRuntime, TokenId};
pub use stream::StopPattern;
pub use threads::ThreadBudgetAllocator;
