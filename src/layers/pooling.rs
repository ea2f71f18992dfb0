//! Pooling layer with a CPU (im2col) and an accelerated compute path
//!
//! The CPU path builds one column matrix per sample and reduces each
//! window segment in parallel. It implements max and padding-inclusive
//! average pooling; padding takes part in both reductions as zeros. The
//! accelerated path hands descriptors and buffers to a [`DeviceBackend`]
//! and supports all three [`PoolMode`]s.

use std::fmt;
use std::sync::Arc;
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, ShapeBuilder, Zip};
use crate::comm::{Communicator, ShardPlan};
use crate::config::{DataLayout, DeviceMode, PoolingConfig};
use crate::error::{PoolError, Result};
use crate::gpu::backend::DeviceBackend;
use crate::gpu::pooling::{DeviceBoundary, DevicePooling};
use crate::im2col::{col2im_into, im2col_into};
use crate::tensor::{pooled_dims, product, PoolWindow, SpatialGeometry};
use super::pool_mode::{argmax_first, CpuReduction, PoolMode};
use super::traits::{Layer, LayerType, NeighborInfo};

pub const LAYER_NAME: &str = "pooling_layer";

/// Lifecycle of a pooling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Unconfigured,
    /// Dimensions computed, descriptors created
    Configured,
    /// Buffers allocated
    Ready,
    Forward,
    Backward,
    TornDown,
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerState::Unconfigured => "unconfigured",
            LayerState::Configured => "configured",
            LayerState::Ready => "ready",
            LayerState::Forward => "in forward",
            LayerState::Backward => "in backward",
            LayerState::TornDown => "torn down",
        };
        f.write_str(name)
    }
}

fn check_shape(name: &str, actual: (usize, usize), expected: (usize, usize)) -> Result<()> {
    if actual != expected {
        return Err(PoolError::dimension_mismatch(
            format!("{} of shape {:?}", name, expected),
            format!("{} of shape {:?}", name, actual),
        ));
    }
    Ok(())
}

/// CPU forward pass: one row per sample, `(channels, spatial...)` flattened.
///
/// Modes without a CPU implementation fail before any buffer is touched.
pub fn fp_compute_im2col(
    mode: PoolMode,
    geometry: &SpatialGeometry,
    prev_activations: ArrayView2<f32>,
    mut activations: ArrayViewMut2<f32>,
) -> Result<()> {
    let reduction = mode.cpu_reduction()?;
    let samples = prev_activations.nrows();
    check_shape("prev_activations", prev_activations.dim(), (samples, geometry.input_len()))?;
    check_shape("activations", activations.dim(), (samples, geometry.output_len()))?;

    let channels = geometry.channels();
    let window_size = geometry.window_size();
    let mut columns = Array2::zeros(geometry.column_shape().f());
    let mut pooled = Array2::<f32>::zeros((channels, geometry.output_size()));

    for (input, mut output) in prev_activations.outer_iter().zip(activations.outer_iter_mut()) {
        im2col_into(input, columns.view_mut(), geometry)?;
        Zip::from(pooled.columns_mut())
            .and(columns.columns())
            .par_for_each(|mut reduced, column| {
                for c in 0..channels {
                    let segment = column.slice(s![c * window_size..(c + 1) * window_size]);
                    reduced[c] = reduction.reduce(segment, window_size);
                }
            });
        output.assign(&pooled.view().into_shape(geometry.output_len())?);
    }
    Ok(())
}

/// CPU backward pass.
///
/// Max windows are recomputed from `prev_activations`; the gradient goes to
/// the first maximal entry of each window. Average windows spread it evenly
/// over the full window. Overlapping windows accumulate in `col2im`.
pub fn bp_compute_im2col(
    mode: PoolMode,
    geometry: &SpatialGeometry,
    prev_activations: ArrayView2<f32>,
    prev_error_signal: ArrayView2<f32>,
    mut error_signal: ArrayViewMut2<f32>,
) -> Result<()> {
    let reduction = mode.cpu_reduction()?;
    let samples = prev_activations.nrows();
    check_shape("prev_activations", prev_activations.dim(), (samples, geometry.input_len()))?;
    check_shape("prev_error_signal", prev_error_signal.dim(), (samples, geometry.output_len()))?;
    check_shape("error_signal", error_signal.dim(), (samples, geometry.input_len()))?;

    let channels = geometry.channels();
    let window_size = geometry.window_size();
    let output_size = geometry.output_size();
    let mut columns = Array2::zeros(geometry.column_shape().f());

    for ((input, incoming), output) in prev_activations
        .outer_iter()
        .zip(prev_error_signal.outer_iter())
        .zip(error_signal.outer_iter_mut())
    {
        match reduction {
            CpuReduction::Max => {
                im2col_into(input, columns.view_mut(), geometry)?;
                Zip::indexed(columns.columns_mut()).par_for_each(|j, mut column| {
                    for c in 0..channels {
                        let mut segment = column.slice_mut(s![c * window_size..(c + 1) * window_size]);
                        let max_index = argmax_first(segment.iter());
                        segment.fill(0.0);
                        segment[max_index] = incoming[c * output_size + j];
                    }
                });
            }
            CpuReduction::Average => {
                Zip::indexed(columns.columns_mut()).par_for_each(|j, mut column| {
                    for c in 0..channels {
                        let share = incoming[c * output_size + j] / window_size as f32;
                        column
                            .slice_mut(s![c * window_size..(c + 1) * window_size])
                            .fill(share);
                    }
                });
            }
        }
        col2im_into(columns.view(), output, geometry)?;
    }
    Ok(())
}

/// Pooling layer
pub struct PoolingLayer {
    index: usize,
    config: PoolingConfig,
    window: PoolWindow,
    plan: ShardPlan,
    backend: Option<Arc<dyn DeviceBackend>>,
    state: LayerState,
    prev_neuron_dims: Vec<usize>,
    neuron_dims: Vec<usize>,
    geometry: Option<SpatialGeometry>,
    device: Option<DevicePooling>,
    activations: Array2<f32>,
    error_signal: Array2<f32>,
    width: usize,
}

impl PoolingLayer {
    /// Create an unconfigured layer.
    ///
    /// Accelerated layers need a backend; its device count fixes the shard plan.
    pub fn new(
        index: usize,
        config: PoolingConfig,
        mini_batch_size: usize,
        comm: &dyn Communicator,
        backend: Option<Arc<dyn DeviceBackend>>,
    ) -> Result<Self> {
        config.validate()?;
        let window = config.window()?;

        let (plan, backend) = match config.device_mode {
            DeviceMode::Accelerated => {
                let backend = backend.ok_or_else(|| {
                    PoolError::BackendUnavailable(format!(
                        "layer {} requests accelerated pooling but no device backend was supplied",
                        index
                    ))
                })?;
                let plan = ShardPlan::new(mini_batch_size, comm.procs_per_model(), backend.num_devices())?;
                (plan, Some(backend))
            }
            DeviceMode::Cpu => {
                if backend.is_some() {
                    log::debug!("layer {}: CPU pooling, device backend not used", index);
                }
                (ShardPlan::host(mini_batch_size, comm)?, None)
            }
        };
        log::debug!(
            "layer {}: rank {} of {} in model, local mini-batch {}",
            index,
            comm.rank_in_model(),
            comm.procs_per_model(),
            plan.local_mini_batch_size
        );

        Ok(PoolingLayer {
            index,
            config,
            window,
            plan,
            backend,
            state: LayerState::Unconfigured,
            prev_neuron_dims: Vec::new(),
            neuron_dims: Vec::new(),
            geometry: None,
            device: None,
            activations: Array2::zeros((0, 0)),
            error_signal: Array2::zeros((0, 0)),
            width: 0,
        })
    }

    pub fn config(&self) -> &PoolingConfig {
        &self.config
    }

    pub fn mode(&self) -> PoolMode {
        self.config.mode
    }

    pub fn device_mode(&self) -> DeviceMode {
        self.config.device_mode
    }

    pub fn window(&self) -> &PoolWindow {
        &self.window
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn shard_plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn prev_neuron_dims(&self) -> &[usize] {
        &self.prev_neuron_dims
    }

    pub fn geometry(&self) -> Option<&SpatialGeometry> {
        self.geometry.as_ref()
    }

    /// Accelerated path state, present once configured in accelerated mode
    pub fn device_pooling(&self) -> Option<&DevicePooling> {
        self.device.as_ref()
    }

    /// What the next layer sees of this one: `y` and `dy` on the devices
    pub fn boundary_for_next(&self) -> NeighborInfo {
        let boundary = match self.device.as_ref().and_then(|d| d.buffers()) {
            Some(buffers) => DeviceBoundary::device(
                Some(Arc::clone(buffers.activations.matrix())),
                Some(Arc::clone(buffers.prev_error_signal.matrix())),
            ),
            None if self.device.is_some() => DeviceBoundary::device(None, None),
            None => DeviceBoundary::host(),
        };
        NeighborInfo { neuron_dims: self.neuron_dims.clone(), boundary }
    }

    /// What the previous layer sees of this one: `x` and `dx` on the devices
    pub fn boundary_for_prev(&self) -> NeighborInfo {
        let boundary = match self.device.as_ref().and_then(|d| d.buffers()) {
            Some(buffers) => DeviceBoundary::device(
                Some(Arc::clone(buffers.prev_activations.matrix())),
                Some(Arc::clone(buffers.error_signal.matrix())),
            ),
            None if self.device.is_some() => DeviceBoundary::device(None, None),
            None => DeviceBoundary::host(),
        };
        NeighborInfo { neuron_dims: self.neuron_dims.clone(), boundary }
    }

    /// Compute output dims from the previous layer's `(channels, spatial...)`
    /// dims and create device descriptors when accelerated
    pub fn configure(&mut self, prev_neuron_dims: &[usize]) -> Result<()> {
        self.ensure_state("configure", &[LayerState::Unconfigured])?;

        let neuron_dims = pooled_dims(prev_neuron_dims, &self.window)?;
        let geometry = SpatialGeometry::new(prev_neuron_dims[0], &prev_neuron_dims[1..], &self.window)?;

        self.device = match &self.backend {
            Some(backend) => Some(DevicePooling::configure(
                backend,
                self.config.mode,
                &self.window,
                prev_neuron_dims,
                &neuron_dims,
                self.plan,
            )?),
            None => {
                self.config.mode.ensure_cpu_supported()?;
                None
            }
        };

        log::info!(
            "{} {}: {} pooling {:?} -> {:?}, window {:?}, pads {:?}, strides {:?}, {:?} path",
            LAYER_NAME,
            self.index,
            self.config.mode,
            prev_neuron_dims,
            neuron_dims,
            self.window.dims,
            self.window.pads,
            self.window.strides,
            self.config.device_mode
        );
        log::debug!(
            "{} {}: mini-batch {}, local {}, {} per device on {} device(s)",
            LAYER_NAME,
            self.index,
            self.plan.mini_batch_size,
            self.plan.local_mini_batch_size,
            self.plan.per_device,
            self.plan.num_devices
        );

        self.prev_neuron_dims = prev_neuron_dims.to_vec();
        self.neuron_dims = neuron_dims;
        self.geometry = Some(geometry);
        self.state = LayerState::Configured;
        Ok(())
    }

    /// Allocate host matrices and bind device buffers.
    ///
    /// Device matrices the neighbours already hold are borrowed; the CPU
    /// path ignores them.
    pub fn allocate(&mut self, prev: &DeviceBoundary, next: &DeviceBoundary) -> Result<()> {
        self.ensure_state("allocate", &[LayerState::Configured])?;

        let local = self.plan.local_mini_batch_size;
        self.activations = Array2::zeros((local, product(&self.neuron_dims)));
        self.error_signal = Array2::zeros((local, product(&self.prev_neuron_dims)));

        match self.device.as_mut() {
            Some(device) => device.allocate(prev, next)?,
            None if prev.on_device || next.on_device => {
                log::debug!("{} {}: CPU path ignores neighbour device buffers", LAYER_NAME, self.index);
            }
            None => {}
        }

        self.state = LayerState::Ready;
        Ok(())
    }

    /// Release device buffers and descriptors; the layer cannot be used afterwards
    pub fn teardown(&mut self) {
        if self.state == LayerState::TornDown {
            return;
        }
        if let Some(mut device) = self.device.take() {
            device.release_buffers();
        }
        self.activations = Array2::zeros((0, 0));
        self.error_signal = Array2::zeros((0, 0));
        self.state = LayerState::TornDown;
        log::debug!("{} {} torn down", LAYER_NAME, self.index);
    }

    fn ensure_state(&self, operation: &str, allowed: &[LayerState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PoolError::invalid_state(operation, self.state))
        }
    }

    fn check_width(&self, name: &str, matrix: &ArrayView2<f32>, width: usize, height: usize) -> Result<()> {
        check_shape(name, matrix.dim(), (width, height))
    }
}

impl Layer for PoolingLayer {
    fn name(&self) -> &str {
        LAYER_NAME
    }

    fn index(&self) -> usize {
        self.index
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Pooling
    }

    fn data_layout(&self) -> DataLayout {
        self.config.layout
    }

    fn using_gpus(&self) -> bool {
        self.config.device_mode == DeviceMode::Accelerated
    }

    fn neuron_dims(&self) -> &[usize] {
        &self.neuron_dims
    }

    fn setup(&mut self, prev: &NeighborInfo, next: Option<&NeighborInfo>) -> Result<()> {
        self.configure(&prev.neuron_dims)?;
        let next = next.map(|n| n.boundary.clone()).unwrap_or_default();
        self.allocate(&prev.boundary, &next)
    }

    fn forward(&mut self, prev_activations: ArrayView2<f32>) -> Result<ArrayView2<'_, f32>> {
        self.ensure_state(
            "forward",
            &[LayerState::Ready, LayerState::Forward, LayerState::Backward],
        )?;
        let width = prev_activations.nrows();
        if width == 0 || width > self.plan.local_mini_batch_size {
            return Err(PoolError::dimension_mismatch(
                format!("1 to {} samples", self.plan.local_mini_batch_size),
                format!("{} samples", width),
            ));
        }
        self.check_width("prev_activations", &prev_activations, width, product(&self.prev_neuron_dims))?;

        log::trace!("{} {}: forward over {} samples", LAYER_NAME, self.index, width);
        let output = self.activations.slice_mut(s![..width, ..]);
        match &self.device {
            Some(device) => device.forward(prev_activations, output)?,
            None => {
                let geometry = self
                    .geometry
                    .as_ref()
                    .ok_or_else(|| PoolError::invalid_state("forward", self.state))?;
                fp_compute_im2col(self.config.mode, geometry, prev_activations, output)?;
            }
        }

        self.width = width;
        self.state = LayerState::Forward;
        Ok(self.activations.slice(s![..width, ..]))
    }

    fn backward(
        &mut self,
        prev_activations: ArrayView2<f32>,
        prev_error_signal: ArrayView2<f32>,
    ) -> Result<ArrayView2<'_, f32>> {
        self.ensure_state("backward", &[LayerState::Forward])?;
        let width = self.width;
        self.check_width("prev_activations", &prev_activations, width, product(&self.prev_neuron_dims))?;
        self.check_width("prev_error_signal", &prev_error_signal, width, product(&self.neuron_dims))?;

        log::trace!("{} {}: backward over {} samples", LAYER_NAME, self.index, width);
        let output = self.error_signal.slice_mut(s![..width, ..]);
        match (&self.device, &self.geometry) {
            (Some(device), _) => device.backward(prev_error_signal, output)?,
            (None, Some(geometry)) => {
                bp_compute_im2col(self.config.mode, geometry, prev_activations, prev_error_signal, output)?
            }
            (None, None) => return Err(PoolError::invalid_state("backward", self.state)),
        }

        self.state = LayerState::Backward;
        Ok(self.error_signal.slice(s![..width, ..]))
    }
}

impl fmt::Debug for PoolingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolingLayer")
            .field("index", &self.index)
            .field("mode", &self.config.mode)
            .field("device_mode", &self.config.device_mode)
            .field("state", &self.state)
            .field("prev_neuron_dims", &self.prev_neuron_dims)
            .field("neuron_dims", &self.neuron_dims)
            .finish()
    }
}
