//! Benchmarks for batch planning and stream detection.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chat_sequencer::batch::{MaxParallelism, PendingWork, ScheduleStrategy};
use chat_sequencer::stream::{StopPattern, StopSequenceDetector};

fn bench_batch_planning(c: &mut Criterion) {
    let strategy = MaxParallelism;

    // 256 queued sequences with mixed sizes and priorities.
    let pending: Vec<PendingWork> = (0..256)
        .map(|i| PendingWork {
            sequence_id: i as u32,
            token_count: 16 + (i * 7) % 512,
            evaluation_priority: (i % 10) as u8,
            arrival: i as u64,
        })
        .collect();

    c.bench_function("plan_256_sequences_into_2k_batch", |b| {
        b.iter(|| {
            let plan = strategy.plan(black_box(&pending), 2048).unwrap();
            black_box(plan);
        })
    });
}

fn bench_stop_detection(c: &mut Criterion) {
    let patterns = vec![
        StopPattern::text("</s>"),
        StopPattern::text("\n\nUser:"),
        StopPattern::text("<|endoftext|>"),
        StopPattern::Tokens(vec![1, 2, 3]),
    ];

    // A realistic stream: mostly misses with scattered near-matches.
    let stream: Vec<(i32, &str)> = (0..10_000)
        .map(|i| match i % 37 {
            0 => (4, "</"),
            1 => (5, "s"),
            17 => (6, "\n\nUs"),
            _ => (7, "word "),
        })
        .collect();

    c.bench_function("stop_detection_10k_tokens", |b| {
        b.iter(|| {
            let mut detector = StopSequenceDetector::new(black_box(&patterns));
            for (token, text) in &stream {
                detector.push_token(*token, text);
            }
            black_box(detector.triggered().is_none());
        })
    });
}

criterion_group!(benches, bench_batch_planning, bench_stop_detection);
criterion_main!(benches);
