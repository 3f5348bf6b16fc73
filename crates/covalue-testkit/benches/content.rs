//! Benchmarks for producing content diffs from a log.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use covalue::core::KnownState;
use covalue_testkit::generators::{log_from_params, LogParams};

fn bench_new_content_since(c: &mut Criterion) {
    let mut group = c.benchmark_group("new_content_since");
    for size in [10usize, 100, 1000] {
        let params = LogParams::sequential(3, size);
        let log = log_from_params(&params);

        let mut half = KnownState::empty(*log.id());
        half.header = true;
        for (session, count) in &log.known_state().sessions {
            half.raise(*session, count / 2);
        }

        group.bench_with_input(BenchmarkId::new("from_empty", size), &log, |b, log| {
            b.iter(|| black_box(log.new_content_since(None)))
        });
        group.bench_with_input(BenchmarkId::new("from_half", size), &log, |b, log| {
            b.iter(|| black_box(log.new_content_since(Some(&half))))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_new_content_since);
criterion_main!(benches);
