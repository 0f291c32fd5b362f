//! Crash derivation and multiplier clock throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use crash_wager::fair::clock::MultiplierClock;
use crash_wager::fair::crash::{derive, CrashConfig};

fn bench_derive(c: &mut Criterion) {
    let seed = [7u8; 32];
    let config = CrashConfig::default();
    let mut nonce = 0u64;

    c.bench_function("derive", |b| {
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            derive(black_box(&seed), black_box("public-client-seed"), nonce, &config)
        })
    });
}

fn bench_clock(c: &mut Criterion) {
    let clock = MultiplierClock::default();

    c.bench_function("multiplier_at", |b| b.iter(|| clock.multiplier_at(black_box(9_850))));
    c.bench_function("crash_elapsed_ms", |b| b.iter(|| clock.crash_elapsed_ms(black_box(235))));
}

criterion_group!(benches, bench_derive, bench_clock);
criterion_main!(benches);
