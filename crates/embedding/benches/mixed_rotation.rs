//! Throughput of the mixed rotation table computation.
//!
//! The table is rebuilt on every forward call of the attention module, so
//! its cost sits on the hot path. Sizes mirror typical video grids.

use candle_core::Device;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use embedding::positional::{compute_mixed_rotation, create_position_matrix};

fn bench_compute_mixed_rotation(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("compute_mixed_rotation");

    for &(t, ph, pw, heads, half_dim) in &[
        (2usize, 30usize, 53usize, 24usize, 64usize),
        (8, 30, 53, 24, 64),
        (2, 16, 16, 8, 32),
    ] {
        let n_tokens = t * ph * pw;
        let pos = create_position_matrix(t, ph, pw, &device).expect("position matrix");
        let freqs = candle_core::Tensor::randn(0f32, 1f32, (3, heads, half_dim), &device)
            .expect("frequency basis");

        group.throughput(Throughput::Elements((n_tokens * heads * half_dim) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{n_tokens}tok_{heads}h_{half_dim}f")),
            &(freqs, pos),
            |b, (freqs, pos)| {
                b.iter(|| compute_mixed_rotation(freqs, pos).expect("rotation tables"))
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_compute_mixed_rotation);
criterion_main!(benches);
