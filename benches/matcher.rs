//! Benchmarks for the domain matcher hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relaybox::filter::DomainMatcher;

fn build_matcher(patterns: usize) -> DomainMatcher {
    let mut matcher = DomainMatcher::new();
    for i in 0..patterns {
        if i % 4 == 0 {
            matcher.insert(&format!("*.ads{i}.example.com"));
        } else {
            matcher.insert(&format!("tracker{i}.example.net"));
        }
    }
    matcher
}

fn bench_check(c: &mut Criterion) {
    let matcher = build_matcher(10_000);

    c.bench_function("matcher_miss", |b| {
        b.iter(|| black_box(matcher.check(black_box("safe.example.org"))))
    });

    c.bench_function("matcher_exact_hit", |b| {
        b.iter(|| black_box(matcher.check(black_box("tracker1234.example.net"))))
    });

    c.bench_function("matcher_wildcard_hit", |b| {
        b.iter(|| black_box(matcher.check(black_box("banner.sub.ads4.example.com"))))
    });
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("matcher_build_10k", |b| {
        b.iter(|| black_box(build_matcher(10_000)))
    });
}

criterion_group!(benches, bench_check, bench_insert);
criterion_main!(benches);
