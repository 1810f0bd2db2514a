use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use flowcore::item::Item;
use flowcore::processor::logic::LogicProcessor;
use flowcore::testing::TestSupport;
use flowcore::window::sliding_window::SlidingWindowP;
use flowcore::window::Counting;
use flowcore::window::WindowDefinition;
use serde_json::json;
use std::sync::Arc;

fn events(count: i64) -> Vec<Item> {
    let mut input = Vec::with_capacity(count as usize * 2);
    for ts in 0..count {
        input.push(Item::Data(json!([ts, ts % 16])));
        if ts % 100 == 0 {
            input.push(Item::wm(ts));
        }
    }
    input
}

fn window_support(input: Vec<Item>) -> TestSupport {
    let definition = match WindowDefinition::sliding(1000, 100) {
        Ok(definition) => definition,
        Err(err) => panic!("{err}"),
    };
    TestSupport::verify_processor(move |_| {
        LogicProcessor::boxed(SlidingWindowP::windows(
            definition,
            |item| item[1].clone(),
            |item| item[0].as_i64(),
            Arc::new(Counting),
        ))
    })
    .input(input)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("sliding_window");
    for count in [1_000, 10_000] {
        let support = window_support(events(count));
        group.bench_function(BenchmarkId::new("plain", count), |b| {
            b.iter(|| support.run(false));
        });
    }
    // Snapshot and restore after every item.
    let support = window_support(events(1_000));
    group.bench_function(BenchmarkId::new("restore_every_item", 1_000), |b| {
        b.iter(|| support.run(true));
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
