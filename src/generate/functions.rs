//! Function-call syntax and grammar plumbing.
//!
//! A chat wrapper describes its call syntax as literal text fragments
//! (prefix, params prefix, suffix, separators) plus per-function specs.
//! The state machine matches the fragments with the stop-sequence
//! detector and constrains name/params decoding through the grammar
//! factories supplied here.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::runtime::{GrammarEvaluator, TokenId};

/// Literal text fragments delimiting function calls in the output stream.
#[derive(Debug, Clone)]
pub struct CallSyntax {
    /// Marks the start of a call (and of the call section).
    pub call_prefix: String,

    /// Separates the function name from its parameters.
    pub params_prefix: String,

    /// Closes one call.
    pub call_suffix: String,

    /// Separator between consecutive calls. `Some` means the format
    /// supports multiple calls per turn.
    pub between_calls: Option<String>,

    /// Closes the whole call section, where the format has one.
    pub section_suffix: Option<String>,

    /// Whether `call_prefix` may also begin ordinary text, so a matched
    /// prefix must be held until the following tokens disambiguate.
    pub allows_disengage: bool,
}

impl Default for CallSyntax {
    fn default() -> Self {
        Self {
            call_prefix: "[[call: ".into(),
            params_prefix: "(".into(),
            call_suffix: ")]]".into(),
            between_calls: Some("\n".into()),
            section_suffix: None,
            allows_disengage: false,
        }
    }
}

/// One callable function as the chat wrapper advertises it.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,

    /// JSON schema of the parameters. `None` means the function takes no
    /// parameters and its call carries none.
    pub params_schema: Option<serde_json::Value>,
}

/// A parsed call extracted from the output stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCall {
    pub name: String,

    /// Raw text between the params prefix and the call suffix.
    pub raw_params: String,

    /// Parsed parameters; `Null` for parameterless functions.
    pub params: serde_json::Value,
}

type NameGrammarFactory = dyn Fn() -> Box<dyn GrammarEvaluator> + Send + Sync;
type ParamsGrammarFactory =
    dyn Fn(&FunctionSpec) -> Option<Box<dyn GrammarEvaluator>> + Send + Sync;

/// Everything the state machine needs to detect, constrain, and parse
/// function calls for one request.
#[derive(Clone)]
pub struct ChatFunctions {
    pub syntax: CallSyntax,
    pub specs: Vec<FunctionSpec>,

    /// Builds the token grammar constraining the name portion of a call.
    /// `None` leaves name decoding unconstrained; unknown names still fail
    /// at parse time.
    pub name_grammar: Option<Arc<NameGrammarFactory>>,

    /// Builds the token grammar constraining one function's parameters.
    pub params_grammar: Option<Arc<ParamsGrammarFactory>>,
}

impl ChatFunctions {
    pub fn new(syntax: CallSyntax, specs: Vec<FunctionSpec>) -> Self {
        Self {
            syntax,
            specs,
            name_grammar: None,
            params_grammar: None,
        }
    }

    pub fn spec_for(&self, name: &str) -> Option<&FunctionSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Whether `partial` could still grow into a known function name.
    pub fn name_viable(&self, partial: &str) -> bool {
        self.specs.iter().any(|s| s.name.starts_with(partial))
    }

    /// Parse the raw params text of a completed call.
    pub fn parse_call(&self, name: &str, raw_params: &str) -> Result<FunctionCall> {
        let spec = self
            .spec_for(name)
            .ok_or_else(|| EngineError::GrammarViolation {
                what: "function name".into(),
                detail: format!("model called unknown function {name:?}"),
            })?;

        let params = match &spec.params_schema {
            None => {
                if !raw_params.trim().is_empty() {
                    return Err(EngineError::GrammarViolation {
                        what: "function params".into(),
                        detail: format!("{name} takes no parameters, got {raw_params:?}"),
                    });
                }
                serde_json::Value::Null
            }
            Some(_) => serde_json::from_str(raw_params).map_err(|e| {
                EngineError::GrammarViolation {
                    what: "function params".into(),
                    detail: format!("{name} params are not valid JSON: {e}"),
                }
            })?,
        };

        Ok(FunctionCall {
            name: name.to_string(),
            raw_params: raw_params.to_string(),
            params,
        })
    }
}

/// Grammar accepting exactly one of a fixed set of token runs.
///
/// Chat wrappers compile function names (or other literal alternatives) to
/// token runs with the runtime's tokenizer and constrain decoding with
/// this.
pub struct TokenRunGrammar {
    alternatives: Vec<Vec<TokenId>>,
    /// `(alternative, tokens_consumed)` per still-viable alternative.
    active: Vec<(usize, usize)>,
}

impl TokenRunGrammar {
    pub fn new(alternatives: Vec<Vec<TokenId>>) -> Self {
        let active = alternatives
            .iter()
            .enumerate()
            .filter(|(_, run)| !run.is_empty())
            .map(|(i, _)| (i, 0))
            .collect();
        Self {
            alternatives,
            active,
        }
    }
}

impl GrammarEvaluator for TokenRunGrammar {
    fn can_accept(&self, token: TokenId) -> bool {
        self.active
            .iter()
            .any(|&(alt, len)| self.alternatives[alt].get(len) == Some(&token))
    }

    fn accept(&mut self, token: TokenId) {
        let alternatives = &self.alternatives;
        // Fully consumed alternatives cannot extend; they drop here and
        // `is_complete` goes back to reflecting the survivors.
        self.active.retain_mut(|(alt, len)| {
            if alternatives[*alt].get(*len) == Some(&token) {
                *len += 1;
                true
            } else {
                false
            }
        });
    }

    fn is_complete(&self) -> bool {
        self.active
            .iter()
            .any(|&(alt, len)| len == self.alternatives[alt].len())
    }
}
