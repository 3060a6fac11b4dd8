//! Model runtime boundary.
//!
//! The native tensor-compute engine (matrix multiply, sampling numerics,
//! tokenizer internals) is an external collaborator. This module defines
//! the opaque interface the decoding core drives, plus a deterministic
//! scripted implementation used by the test suite.

pub mod model;
pub mod script;

pub use model::{DecodeItem, GrammarEvaluator, LogitHandle, ModelRuntime, TokenId};
pub use script::ScriptedRuntime;
