//! Generation results and the streaming event surface.

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::TokenMeter;
use crate::generate::functions::FunctionCall;
use crate::runtime::TokenId;

/// Why a generation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinishReason {
    /// A stop trigger matched; the matched text is not part of the output.
    StopTrigger,

    /// The model emitted its end-of-generation token.
    EndOfGeneration,

    /// `max_tokens` was reached.
    MaxTokens,

    /// The caller aborted and asked for the partial result.
    Abort,

    /// The turn resolved to function calls instead of text.
    FunctionCalls,
}

/// One event on the streaming sink. Text events carry only confirmed
/// output: anything a later stop or function match would invalidate is
/// withheld until resolved.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    Text { text: String, tokens: Vec<TokenId> },
    FunctionCall(FunctionCall),
    Done { finish_reason: FinishReason, usage: TokenMeter },
}

/// The final result of one [`generate`](crate::generate::generate) run.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Confirmed output text (stop/function markers excluded).
    pub text: String,

    pub function_calls: Vec<FunctionCall>,
    pub finish_reason: FinishReason,
    pub usage: TokenMeter,

    /// The sequence's resident tokens at completion. Feeding this back as
    /// the next turn's prompt prefix skips re-tokenizing the history.
    pub context_snapshot: Vec<TokenId>,
}

/// Build a sink plus the `Stream` view of it for callers that consume
/// events with stream combinators rather than a raw channel.
pub fn response_stream(capacity: usize) -> (mpsc::Sender<ResponseEvent>, impl Stream<Item = ResponseEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, ReceiverStream::new(rx))
}
