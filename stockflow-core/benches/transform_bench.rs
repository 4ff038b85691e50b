//! Criterion benchmarks for the transform hot path.
//!
//! Benchmarks:
//! 1. normalize (frame build, filter, sort, dedupe, record extraction)
//! 2. CSV encode of formatted records
//! 3. Full Transformer::transform against the in-memory store

use std::sync::Arc;

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use stockflow_core::domain::{LogicalRun, PayloadMeta, RawPayload, RawSample};
use stockflow_core::storage::{KeyLayout, MemoryObjectStore, RawStore};
use stockflow_core::transform::{codec, normalize, Transformer};

// ── Helpers ──────────────────────────────────────────────────────────

/// `n` daily samples in reverse order with every 50th row incomplete and
/// every 20th row duplicated.
fn make_samples(n: usize) -> Vec<RawSample> {
    let base = 1_577_923_200_i64; // 2020-01-02T00:00:00Z
    let mut samples: Vec<RawSample> = (0..n)
        .rev()
        .map(|i| {
            let close = 100.0 + (i as f64 * 0.1).sin() * 10.0;
            RawSample {
                timestamp: Some(base + i as i64 * 86_400),
                open: if i % 50 == 0 { None } else { Some(close - 0.3) },
                high: Some(close + 1.5),
                low: Some(close - 1.5),
                close: Some(close),
                volume: Some(1_000_000.0 + (i % 500_000) as f64),
            }
        })
        .collect();
    let dupes: Vec<RawSample> = samples.iter().step_by(20).cloned().collect();
    samples.extend(dupes);
    samples
}

// ── 1. normalize ─────────────────────────────────────────────────────

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    for &count in &[252, 1260, 2520] {
        let samples = make_samples(count);
        group.bench_with_input(BenchmarkId::new("daily_samples", count), &count, |b, _| {
            b.iter(|| normalize(black_box("NVDA"), black_box(&samples)))
        });
    }

    group.finish();
}

// ── 2. CSV encode ────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("csv_encode");

    for &count in &[252, 2520] {
        let Ok((records, _)) = normalize("NVDA", &make_samples(count)) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::new("records", count), &count, |b, _| {
            b.iter(|| codec::encode(black_box(&records)))
        });
    }

    group.finish();
}

// ── 3. Full transform ────────────────────────────────────────────────

fn bench_transform(c: &mut Criterion) {
    let store = Arc::new(MemoryObjectStore::new());
    let raw = RawStore::new(store.clone(), KeyLayout::default());
    let run = LogicalRun::new("NVDA", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()).unwrap();
    let payload = RawPayload {
        meta: PayloadMeta {
            symbol: "NVDA".into(),
            currency: Some("USD".into()),
            exchange_timezone: Some("America/New_York".into()),
            instrument_type: Some("EQUITY".into()),
            regular_market_price: None,
        },
        samples: make_samples(1260),
    };
    let raw_key = raw.put_raw(&run, &payload).unwrap();
    let transformer = Transformer::new(store);

    c.bench_function("transform_1260_samples", |b| {
        b.iter(|| transformer.transform(black_box(&raw_key)))
    });
}

criterion_group!(benches, bench_normalize, bench_encode, bench_transform);
criterion_main!(benches);
