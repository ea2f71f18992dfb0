use std::sync::Arc;
use ndarray::{array, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use poolnet::{
    builders::PoolingLayerBuilder,
    comm::StaticComm,
    config::DeviceMode,
    gpu::{DeviceBackend, DeviceBoundary, HostDeviceBackend},
    layers::{Layer, LayerState, NeighborInfo, PoolMode, PoolingLayer},
    PoolError,
};

fn host_backend(num_devices: usize) -> (Arc<HostDeviceBackend>, Arc<dyn DeviceBackend>) {
    let host = Arc::new(HostDeviceBackend::new(num_devices));
    let backend: Arc<dyn DeviceBackend> = host.clone();
    (host, backend)
}

fn layer(
    mode: PoolMode,
    window: (usize, usize, usize),
    spatial_dims: usize,
    mini_batch: usize,
    backend: Option<Arc<dyn DeviceBackend>>,
) -> PoolingLayer {
    let (dim, pad, stride) = window;
    let builder = PoolingLayerBuilder::new()
        .uniform(spatial_dims, dim, pad, stride)
        .mode(mode)
        .mini_batch_size(mini_batch);
    let builder = match backend {
        Some(backend) => builder.accelerated(backend),
        None => builder,
    };
    builder.build().unwrap()
}

fn seeded_rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

fn assert_close(a: &Array2<f32>, b: &Array2<f32>, tolerance: f32) {
    assert_eq!(a.dim(), b.dim());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tolerance, "{} vs {}", x, y);
    }
}

#[test]
fn test_end_to_end_4x4_on_both_paths() {
    let x = Array2::from_shape_fn((1, 16), |(_, i)| (i + 1) as f32);
    let dy = Array2::ones((1, 4));
    let mut expected_dx = Array2::<f32>::zeros((1, 16));
    for i in [5, 7, 13, 15] {
        expected_dx[[0, i]] = 1.0;
    }

    let (_host, backend) = host_backend(1);
    for backend in [None, Some(backend)] {
        let mut pooling = layer(PoolMode::Max, (2, 0, 2), 2, 1, backend);
        pooling.setup(&NeighborInfo::host(&[1, 4, 4]), None).unwrap();

        let y = pooling.forward(x.view()).unwrap().to_owned();
        assert_eq!(y, array![[6.0, 8.0, 14.0, 16.0]]);

        let dx = pooling.backward(x.view(), dy.view()).unwrap().to_owned();
        assert_eq!(dx, expected_dx);
    }
}

#[test]
fn test_cpu_and_device_paths_agree() {
    // 2 channels of 5x6, overlapping padded windows, 5 samples over 3 devices
    let prev_dims = [2, 5, 6];
    let mut rng = seeded_rng();
    let x = Array2::random_using((5, 60), Uniform::new(0.1f32, 1.0), &mut rng);

    for mode in [PoolMode::Max, PoolMode::Average] {
        let (_host, backend) = host_backend(3);
        let mut cpu = layer(mode, (3, 1, 2), 2, 5, None);
        let mut device = layer(mode, (3, 1, 2), 2, 5, Some(backend));
        cpu.setup(&NeighborInfo::host(&prev_dims), None).unwrap();
        device.setup(&NeighborInfo::host(&prev_dims), None).unwrap();
        assert_eq!(cpu.neuron_dims(), &[2, 3, 3]);
        assert_eq!(device.neuron_dims(), cpu.neuron_dims());

        let y_cpu = cpu.forward(x.view()).unwrap().to_owned();
        let y_device = device.forward(x.view()).unwrap().to_owned();
        assert_close(&y_cpu, &y_device, 1e-5);

        let dy = Array2::random_using((5, 18), Uniform::new(-1.0f32, 1.0), &mut rng);
        let dx_cpu = cpu.backward(x.view(), dy.view()).unwrap().to_owned();
        let dx_device = device.backward(x.view(), dy.view()).unwrap().to_owned();
        assert_close(&dx_cpu, &dx_device, 1e-5);
    }
}

#[test]
fn test_padded_max_differs_between_paths() {
    // All-negative input: CPU windows see padding as 0, the device primitive skips it
    let x = array![[-3.0, -1.0, -2.0]];
    let (_host, backend) = host_backend(1);
    let mut cpu = layer(PoolMode::Max, (2, 1, 2), 1, 1, None);
    let mut device = layer(PoolMode::Max, (2, 1, 2), 1, 1, Some(backend));
    cpu.setup(&NeighborInfo::host(&[1, 3]), None).unwrap();
    device.setup(&NeighborInfo::host(&[1, 3]), None).unwrap();

    let y_cpu = cpu.forward(x.view()).unwrap().to_owned();
    let y_device = device.forward(x.view()).unwrap().to_owned();
    assert_eq!(y_cpu, array![[0.0, -1.0]]);
    assert_eq!(y_device, array![[-3.0, -1.0]]);
}

#[test]
fn test_border_average_differs_between_cpu_and_no_pad() {
    // Windows [pad, 4] and [2, 6]: the CPU divides by the full window, no_pad by the in-bounds count
    let x = array![[4.0, 2.0, 6.0]];
    let (_host, backend) = host_backend(1);
    let mut cpu = layer(PoolMode::Average, (2, 1, 2), 1, 1, None);
    let mut device = layer(PoolMode::Average, (2, 1, 2), 1, 1, Some(Arc::clone(&backend)));
    let mut no_pad = layer(PoolMode::AverageNoPad, (2, 1, 2), 1, 1, Some(backend));
    for pooling in [&mut cpu, &mut device, &mut no_pad] {
        pooling.setup(&NeighborInfo::host(&[1, 3]), None).unwrap();
    }

    assert_eq!(cpu.forward(x.view()).unwrap().to_owned(), array![[2.0, 4.0]]);
    assert_eq!(device.forward(x.view()).unwrap().to_owned(), array![[2.0, 4.0]]);
    assert_eq!(no_pad.forward(x.view()).unwrap().to_owned(), array![[4.0, 4.0]]);
}

#[test]
fn test_average_no_pad_matches_average_without_padding() {
    let x = Array2::random_using((4, 32), Uniform::new(-1.0f32, 1.0), &mut seeded_rng());
    let (_host, backend) = host_backend(2);
    let mut with_pad = layer(PoolMode::Average, (2, 0, 2), 1, 4, Some(Arc::clone(&backend)));
    let mut without_pad = layer(PoolMode::AverageNoPad, (2, 0, 2), 1, 4, Some(backend));
    with_pad.setup(&NeighborInfo::host(&[4, 8]), None).unwrap();
    without_pad.setup(&NeighborInfo::host(&[4, 8]), None).unwrap();

    let a = with_pad.forward(x.view()).unwrap().to_owned();
    let b = without_pad.forward(x.view()).unwrap().to_owned();
    assert_close(&a, &b, 1e-6);
}

#[test]
fn test_multi_process_sharding() {
    let (host, backend) = host_backend(2);
    let mut pooling = PoolingLayerBuilder::new()
        .uniform(1, 2, 0, 2)
        .mini_batch_size(5)
        .communicator(Arc::new(StaticComm::new(2, 0).unwrap()))
        .accelerated(backend)
        .build()
        .unwrap();
    assert_eq!(pooling.shard_plan().local_mini_batch_size, 3);
    assert_eq!(pooling.shard_plan().per_device, 2);

    pooling.setup(&NeighborInfo::host(&[1, 4]), None).unwrap();
    // x, y, dy and dx on each of the two devices
    assert_eq!(host.live_buffers(), 8);

    let x = array![[1.0, 2.0, 3.0, 4.0], [8.0, 7.0, 6.0, 5.0], [0.0, -1.0, 9.0, 9.0]];
    let y = pooling.forward(x.view()).unwrap().to_owned();
    assert_eq!(y, array![[2.0, 4.0], [8.0, 6.0], [0.0, 9.0]]);

    let too_many = Array2::zeros((4, 4));
    assert!(matches!(
        pooling.forward(too_many.view()),
        Err(PoolError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_adjacent_device_layers_share_buffers() {
    let (host, backend) = host_backend(2);
    let mut first = layer(PoolMode::Max, (2, 0, 2), 2, 4, Some(Arc::clone(&backend)));
    let mut second = layer(PoolMode::Max, (2, 0, 2), 2, 4, Some(backend));

    let next = NeighborInfo::on_device(&[1, 2, 2], DeviceBoundary::default());
    first.setup(&NeighborInfo::host(&[1, 8, 8]), Some(&next)).unwrap();
    let live_after_first = host.live_buffers();
    second.setup(&first.boundary_for_next(), None).unwrap();

    // The second layer borrows its input and its outgoing error signal
    let buffers = second.device_pooling().unwrap().buffers().unwrap();
    assert!(!buffers.prev_activations.is_owned());
    assert!(!buffers.error_signal.is_owned());
    assert_eq!(host.live_buffers(), live_after_first + 2 * 2);

    // Same pipeline on the CPU path
    let mut cpu_first = layer(PoolMode::Max, (2, 0, 2), 2, 4, None);
    let mut cpu_second = layer(PoolMode::Max, (2, 0, 2), 2, 4, None);
    cpu_first.setup(&NeighborInfo::host(&[1, 8, 8]), None).unwrap();
    cpu_second.setup(&cpu_first.boundary_for_next(), None).unwrap();

    let mut rng = seeded_rng();
    let x = Array2::random_using((4, 64), Uniform::new(0.0f32, 1.0), &mut rng);
    let hidden = cpu_first.forward(x.view()).unwrap().to_owned();
    let expected_y = cpu_second.forward(hidden.view()).unwrap().to_owned();

    first.forward(x.view()).unwrap();
    // Host view only carries the batch width; the device copy is read directly
    let placeholder = Array2::zeros((4, 16));
    let y = second.forward(placeholder.view()).unwrap().to_owned();
    assert_eq!(y, expected_y);

    let dy = Array2::random_using((4, 4), Uniform::new(-1.0f32, 1.0), &mut rng);
    let expected_hidden_grad = cpu_second.backward(hidden.view(), dy.view()).unwrap().to_owned();
    let expected_dx = cpu_first.backward(x.view(), expected_hidden_grad.view()).unwrap().to_owned();

    second.backward(placeholder.view(), dy.view()).unwrap();
    let dx = first.backward(x.view(), placeholder.view()).unwrap().to_owned();
    assert_close(&dx, &expected_dx, 1e-6);
}

#[test]
fn test_state_machine_and_teardown() {
    let (host, backend) = host_backend(2);
    let mut pooling = layer(PoolMode::Average, (2, 0, 1), 1, 2, Some(backend));
    assert_eq!(pooling.state(), LayerState::Unconfigured);
    assert_eq!(pooling.device_mode(), DeviceMode::Accelerated);

    let x = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
    assert!(matches!(pooling.forward(x.view()), Err(PoolError::InvalidState { .. })));

    pooling.configure(&[1, 3]).unwrap();
    assert_eq!(pooling.state(), LayerState::Configured);
    assert_eq!(host.live_descriptors(), 3);
    assert_eq!(host.live_buffers(), 0);
    assert!(pooling.configure(&[1, 3]).is_err());

    pooling.allocate(&DeviceBoundary::host(), &DeviceBoundary::host()).unwrap();
    assert_eq!(pooling.state(), LayerState::Ready);

    let y = pooling.forward(x.view()).unwrap().to_owned();
    assert_eq!(y, array![[1.5, 2.5], [4.5, 5.5]]);
    assert_eq!(pooling.state(), LayerState::Forward);

    let dx = pooling.backward(x.view(), Array2::ones((2, 2)).view()).unwrap().to_owned();
    assert_eq!(dx, array![[0.5, 1.0, 0.5], [0.5, 1.0, 0.5]]);
    assert_eq!(pooling.state(), LayerState::Backward);

    pooling.teardown();
    assert_eq!(pooling.state(), LayerState::TornDown);
    assert_eq!(host.live_buffers(), 0);
    assert_eq!(host.live_descriptors(), 0);
    assert!(matches!(pooling.forward(x.view()), Err(PoolError::InvalidState { .. })));
}

#[test]
fn test_mismatched_shared_buffer_is_rejected() {
    let (_host, backend) = host_backend(1);
    let mut upstream = layer(PoolMode::Max, (2, 0, 2), 1, 2, Some(Arc::clone(&backend)));
    upstream.setup(&NeighborInfo::host(&[1, 8]), None).unwrap();

    // Upstream produces 1x4 but this layer claims a 1x6 input
    let mut downstream = layer(PoolMode::Max, (2, 0, 2), 1, 2, Some(backend));
    let mut info = upstream.boundary_for_next();
    info.neuron_dims = vec![1, 6];
    let err = downstream.setup(&info, None).unwrap_err();
    assert!(err.is_configuration());
}
