//! Benchmarks for the GLBGCN backbone.
//!
//! Inputs are deterministic trigonometric sequences so numbers are
//! reproducible across runs.
//!
//! Run with:
//!
//! ```bash
//! cargo bench -p glbgcn
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glbgcn::config::{BackboneConfig, GraphConfig, Layout, Strategy};
use glbgcn::graph::Graph;
use glbgcn::ops::{self, TemporalConvSpec};
use glbgcn::Glbgcn;
use ndarray::{Array4, Array5};

fn skeleton_input(n: usize, t: usize, v: usize, m: usize) -> Array5<f32> {
    Array5::from_shape_fn((n, 35, t, v, m), |(n, c, t, v, m)| {
        ((n * 13 + c * 5 + t * 7 + v * 3 + m) as f32 * 0.01).sin()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Full forward pass
// ─────────────────────────────────────────────────────────────────────────────

/// Inference forward pass on the 25-joint NTU layout for growing clip
/// lengths.
fn bench_forward_ntu(c: &mut Criterion) {
    let cfg = BackboneConfig {
        graph: GraphConfig::new(Layout::NtuRgbD, Strategy::Spatial),
        ..BackboneConfig::default()
    };
    let mut model = match Glbgcn::new(&cfg) {
        Ok(m) => m,
        Err(e) => panic!("backbone construction failed: {e}"),
    };
    if let Err(e) = model.init_weights() {
        panic!("init failed: {e}");
    }

    let mut group = c.benchmark_group("forward_ntu");
    group.sample_size(10);
    for frames in [30_usize, 64, 100] {
        let x = skeleton_input(2, frames, 25, 2);
        group.bench_with_input(BenchmarkId::from_parameter(frames), &x, |b, x| {
            b.iter(|| black_box(model.forward(black_box(x))))
        });
    }
    group.finish();
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernels
// ─────────────────────────────────────────────────────────────────────────────

/// The two kernels that dominate a block: the 9-tap temporal convolution at
/// 256 channels and the graph contraction.
fn bench_kernels(c: &mut Criterion) {
    let graph = Graph::new(&GraphConfig::new(Layout::Coco, Strategy::Spatial));
    let v = graph.num_node();
    let x = Array4::<f32>::from_shape_fn((4, 256, 16, v), |(n, c, t, v)| {
        ((n + c + t + v) as f32 * 0.003).cos()
    });
    let w = Array4::<f32>::from_elem((256, 256, 9, 1), 0.001);
    let spec = TemporalConvSpec { kernel: 9, stride: 1, padding: 4, dilation: 1 };

    c.bench_function("temporal_conv_256x256_k9", |b| {
        b.iter(|| black_box(ops::temporal_conv(black_box(&x), &w, None, spec)))
    });

    let stacked = Array4::<f32>::from_shape_fn((4, 3 * 256, 16, v), |(n, c, t, v)| {
        ((n * 3 + c + t + v) as f32 * 0.002).sin()
    });
    let a = graph.adjacency().view();
    c.bench_function("graph_contract_k3_256", |b| {
        b.iter(|| black_box(ops::graph_contract(black_box(&stacked), a)))
    });
}

criterion_group!(benches, bench_forward_ntu, bench_kernels);
criterion_main!(benches);
