//! Queued decode requests.
//!
//! A `QueuedDecode` lives in the scheduler queue from enqueue until it is
//! fully consumed or errors; its result travels back to the awaiting
//! session over a oneshot channel.

use tokio::sync::oneshot;

use crate::error::{EngineError, Result};
use crate::runtime::{LogitHandle, TokenId};

/// Caller-facing request to evaluate tokens for one sequence.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub sequence_id: u32,

    /// Tokens to evaluate, in ledger order.
    pub tokens: Vec<TokenId>,

    /// Ledger position of `tokens[0]`.
    pub first_position: usize,

    /// Higher values receive batch capacity first.
    pub evaluation_priority: u8,

    /// Whether the final token's logits are needed.
    pub wants_logits: bool,
}

/// Receives the decode outcome: the logit handle when requested, `None`
/// otherwise.
pub type DecodeTicket = oneshot::Receiver<Result<Option<LogitHandle>>>;

/// A queue entry. `cursor` tracks how many of its tokens earlier dispatch
/// rounds already consumed.
pub(crate) struct QueuedDecode {
    pub sequence_id: u32,
    pub tokens: Vec<TokenId>,
    pub cursor: usize,
    pub first_position: usize,
    pub evaluation_priority: u8,
    pub wants_logits: bool,
    pub arrival: u64,
    pub responder: oneshot::Sender<Result<Option<LogitHandle>>>,
}

impl QueuedDecode {
    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.cursor
    }

    /// Ledger position of the next unconsumed token.
    pub fn next_position(&self) -> usize {
        self.first_position + self.cursor
    }

    pub fn reject(self, err: EngineError) {
        // The session may have been dropped already; nothing to do then.
        let _ = self.responder.send(Err(err));
    }

    pub fn resolve(self, handle: Option<LogitHandle>) {
        let _ = self.responder.send(Ok(handle));
    }
}
