//! The streaming generation state machine.
//!
//! Drives the evaluate→detect→emit loop on one sequence: prompt prefix
//! reuse, incremental stop detection, whitespace/partial-character
//! buffering, grammar-constrained function-call sub-phases, and
//! mid-generation context shifts.

pub mod functions;
pub mod machine;
pub mod response;

pub use functions::{CallSyntax, ChatFunctions, FunctionCall, FunctionSpec, TokenRunGrammar};
pub use machine::{generate, GenerationPhase, GenerationRequest};
pub use response::{response_stream, FinishReason, GenerationOutput, ResponseEvent};
