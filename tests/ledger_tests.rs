//! Integration tests for ledger eviction and engine-cell consistency.

use std::sync::Arc;

use chat_sequencer::config::EngineConfig;
use chat_sequencer::engine::{EngineInstance, EvictionRange};
use chat_sequencer::generate::{generate, FinishReason, GenerationRequest};
use chat_sequencer::runtime::{ModelRuntime, ScriptedRuntime};
use chat_sequencer::threads::ThreadBudgetAllocator;

fn engine_with(runtime: Arc<ScriptedRuntime>, config: EngineConfig) -> EngineInstance {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_sequencer=debug".into()),
        )
        .with_test_writer()
        .try_init();
    let allocator = ThreadBudgetAllocator::new(0);
    EngineInstance::with_config(runtime, config, &allocator).unwrap()
}

#[tokio::test]
async fn test_overlapping_ranges_erase_each_position_once() {
    let runtime = Arc::new(ScriptedRuntime::new(&["a"]));
    let engine = engine_with(runtime.clone(), EngineConfig::default());
    let mut seq = engine.acquire_sequence().await.unwrap();

    seq.decode(vec![0; 10], false, 5).await.unwrap();

    let removed = seq
        .erase_ranges(&[
            EvictionRange::new(2, 5),
            EvictionRange::new(4, 7),
            EvictionRange::new(7, 8),
        ])
        .await
        .unwrap();
    // [2,5) ∪ [4,7) ∪ [7,8) merges to [2,8): six positions, each once.
    assert_eq!(removed, 6);
    assert_eq!(seq.ledger().next_index(), 4);
    assert_eq!(runtime.cell_count(seq.id()), 4);

    // Positions stayed contiguous: the next decode lands cleanly.
    seq.decode(vec![0; 3], false, 5).await.unwrap();
    assert_eq!(runtime.cell_count(seq.id()), 7);
}

#[tokio::test]
async fn test_refused_removal_rebuilds_the_sequence() {
    let runtime = Arc::new(ScriptedRuntime::new(&["a"]));
    let engine = engine_with(runtime.clone(), EngineConfig::default());
    let mut seq = engine.acquire_sequence().await.unwrap();

    seq.decode(vec![0; 8], false, 5).await.unwrap();

    runtime.fail_next_removals(1);
    let removed = seq
        .erase_ranges(&[EvictionRange::new(1, 4)])
        .await
        .unwrap();
    assert_eq!(removed, 3);
    assert_eq!(seq.ledger().next_index(), 5);
    // The rebuild re-evaluated the survivors from position zero.
    assert_eq!(runtime.cell_count(seq.id()), 5);

    seq.decode(vec![0; 2], false, 5).await.unwrap();
    assert_eq!(runtime.cell_count(seq.id()), 7);
}

#[tokio::test]
async fn test_tokenized_round_trip_through_generation() {
    let runtime = Arc::new(ScriptedRuntime::new(&[
        "What", " is", " your", " name", "?", "My", " name", " is", " Iris", ".",
    ]));
    let engine = engine_with(runtime.clone(), EngineConfig::default());
    let mut seq = engine.acquire_sequence().await.unwrap();

    let prompt = runtime.tokenize("What is your name?").unwrap();
    runtime.script_text("My name is Iris.").unwrap();

    let output = generate(&mut seq, GenerationRequest::new(prompt.clone()), None)
        .await
        .unwrap();
    assert_eq!(output.text, "My name is Iris.");
    assert_eq!(output.finish_reason, FinishReason::EndOfGeneration);

    // The snapshot is the resident prompt plus the produced tokens.
    let expected: Vec<_> = prompt
        .iter()
        .copied()
        .chain(runtime.tokenize("My name is Iris.").unwrap())
        .collect();
    assert_eq!(output.context_snapshot, expected);
}

#[tokio::test]
async fn test_released_sequence_rejects_further_use() {
    let runtime = Arc::new(ScriptedRuntime::new(&["a"]));
    let engine = engine_with(runtime.clone(), EngineConfig::default());
    let mut seq = engine.acquire_sequence().await.unwrap();

    seq.release();
    let err = seq.decode(vec![0], false, 5).await.unwrap_err();
    assert!(matches!(
        err,
        chat_sequencer::EngineError::UseAfterDispose(_)
    ));
}
