//! Pooling throughput on the im2col CPU path and the host-simulated device path

use std::sync::Arc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use poolnet::builders::PoolingLayerBuilder;
use poolnet::gpu::{DeviceBackend, HostDeviceBackend};
use poolnet::layers::{Layer, NeighborInfo, PoolMode, PoolingLayer};

const MINI_BATCH: usize = 16;
const PREV_DIMS: [usize; 3] = [8, 32, 32];

fn build(mode: PoolMode, backend: Option<Arc<dyn DeviceBackend>>) -> PoolingLayer {
    let builder = PoolingLayerBuilder::new()
        .uniform(2, 3, 1, 2)
        .mode(mode)
        .mini_batch_size(MINI_BATCH);
    let builder = match backend {
        Some(backend) => builder.accelerated(backend),
        None => builder,
    };
    let mut layer = builder.build().unwrap();
    layer.setup(&NeighborInfo::host(&PREV_DIMS), None).unwrap();
    layer
}

fn bench_paths(c: &mut Criterion) {
    let input_len: usize = PREV_DIMS.iter().product();
    let x = Array2::random((MINI_BATCH, input_len), Uniform::new(-1.0f32, 1.0));

    let mut group = c.benchmark_group("pooling");
    for mode in [PoolMode::Max, PoolMode::Average] {
        let host: Arc<dyn DeviceBackend> = Arc::new(HostDeviceBackend::new(2));
        for (path, backend) in [("cpu", None), ("host_device", Some(host))] {
            let mut layer = build(mode, backend);
            let dy = Array2::random((MINI_BATCH, layer.num_neurons()), Uniform::new(-1.0f32, 1.0));

            group.bench_with_input(BenchmarkId::new(format!("forward_{}", path), mode), &x, |b, x| {
                b.iter(|| {
                    layer.forward(black_box(x.view())).unwrap();
                })
            });
            group.bench_with_input(BenchmarkId::new(format!("backward_{}", path), mode), &dy, |b, dy| {
                b.iter(|| {
                    layer.forward(x.view()).unwrap();
                    layer.backward(x.view(), black_box(dy.view())).unwrap();
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_paths);
criterion_main!(benches);
