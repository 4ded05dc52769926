//! Benchmarks for the baseband post-processing stages
//!
//! Run with: cargo bench -p dabtx-core --bench dsp_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dabtx_core::gain_control::{GainControl, GainMode};
use dabtx_core::memless_poly::CoefSet;
use dabtx_core::types::{Complexf, Frame};

fn test_samples(n: usize) -> Vec<Complexf> {
    (0..n)
        .map(|i| {
            let phase = i as f32 * 0.001;
            Complexf::new(0.7 * phase.cos(), 0.7 * phase.sin())
        })
        .collect()
}

fn bench_gain_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("gain_control");

    // One mode-1 transmission frame at 2.048 MS/s
    let samples = test_samples(196_608);
    group.throughput(Throughput::Elements(samples.len() as u64));

    for (name, mode) in [
        ("fix", GainMode::Fix),
        ("max", GainMode::Max),
        ("var", GainMode::Var),
    ] {
        let gain = GainControl::new(mode, 1.0, 1.0, 4.0).unwrap();
        group.bench_with_input(BenchmarkId::new("process", name), &samples, |b, s| {
            b.iter(|| gain.process(black_box(Frame::from_samples(s.clone()))))
        });
    }

    group.finish();
}

fn bench_predistortion(c: &mut Criterion) {
    let mut group = c.benchmark_group("memless_poly");

    let samples = test_samples(196_608);
    group.throughput(Throughput::Elements(samples.len() as u64));

    let poly = CoefSet::parse("1 5  1.05 -0.12 0.03 -0.004 0.0002  0.01 -0.002 0 0 0")
        .unwrap()
        .unwrap();
    group.bench_function("odd_poly", |b| {
        b.iter(|| {
            let mut buf = samples.clone();
            poly.apply(black_box(&mut buf));
            buf
        })
    });

    let mut lut_text = String::from("2 4e9\n");
    for i in 0..32 {
        lut_text.push_str(&format!("{} ", 1.0 + i as f32 * 1e-3));
    }
    let lut = CoefSet::parse(&lut_text).unwrap().unwrap();
    group.bench_function("lut", |b| {
        b.iter(|| {
            let mut buf = samples.clone();
            lut.apply(black_box(&mut buf));
            buf
        })
    });

    group.finish();
}

criterion_group!(benches, bench_gain_modes, bench_predistortion);
criterion_main!(benches);
