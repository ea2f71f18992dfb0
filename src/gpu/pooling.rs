//! Accelerated pooling path
//!
//! Descriptors are created once when the layer is configured; device
//! buffers are bound when it becomes ready. Each pass issues one pooling
//! call per device, in parallel, then waits for every device before host
//! data is touched again.

use std::sync::Arc;
use ndarray::{ArrayView2, ArrayViewMut2};
use ndarray::parallel::prelude::*;
use crate::comm::ShardPlan;
use crate::error::{PoolError, Result};
use crate::layers::PoolMode;
use crate::tensor::{product, PoolWindow};
use super::backend::{DeviceBackend, PoolingBackward, PoolingForward};
use super::descriptor::{PoolingDescriptor, TensorDescriptor};
use super::memory::{BufferBinding, DeviceMatrix};

/// Device side of one layer boundary.
///
/// Adjacent layers share the matrices that cross their boundary: the
/// activations flowing forward and the error signal flowing back. A matrix
/// is present when the neighbour already allocated it.
#[derive(Debug, Clone, Default)]
pub struct DeviceBoundary {
    /// The neighbour computes on the same devices and reads/writes them directly
    pub on_device: bool,
    pub activations: Option<Arc<DeviceMatrix>>,
    pub error_signal: Option<Arc<DeviceMatrix>>,
}

impl DeviceBoundary {
    /// Neighbour that only exchanges host memory
    pub fn host() -> Self {
        DeviceBoundary::default()
    }

    /// Neighbour on the same devices, with whatever matrices it already holds
    pub fn device(activations: Option<Arc<DeviceMatrix>>, error_signal: Option<Arc<DeviceMatrix>>) -> Self {
        DeviceBoundary {
            on_device: true,
            activations,
            error_signal,
        }
    }
}

/// Device matrices used by one pooling layer
#[derive(Debug)]
pub struct DeviceBuffers {
    /// Input activations (x)
    pub prev_activations: BufferBinding,
    /// Output activations (y)
    pub activations: BufferBinding,
    /// Incoming error signal (dy)
    pub prev_error_signal: BufferBinding,
    /// Outgoing error signal (dx)
    pub error_signal: BufferBinding,
    /// Host data must be staged in and out on the previous-layer side
    pub stage_prev: bool,
    /// Host data must be staged in and out on the next-layer side
    pub stage_next: bool,
}

/// Descriptors and buffers driving the device pooling primitive
pub struct DevicePooling {
    backend: Arc<dyn DeviceBackend>,
    plan: ShardPlan,
    num_prev_neurons: usize,
    num_neurons: usize,
    pooling_desc: PoolingDescriptor,
    input_desc: TensorDescriptor,
    output_desc: TensorDescriptor,
    buffers: Option<DeviceBuffers>,
}

impl DevicePooling {
    /// Create descriptors for `(channels, spatial...)` inputs pooled to `output_dims`
    pub fn configure(
        backend: &Arc<dyn DeviceBackend>,
        mode: PoolMode,
        window: &PoolWindow,
        input_dims: &[usize],
        output_dims: &[usize],
        plan: ShardPlan,
    ) -> Result<Self> {
        if plan.num_devices != backend.num_devices() {
            return Err(PoolError::configuration(format!(
                "shard plan covers {} device(s), backend drives {}",
                plan.num_devices,
                backend.num_devices()
            )));
        }

        let mut x_dims = vec![plan.per_device];
        x_dims.extend_from_slice(input_dims);
        let input_desc = TensorDescriptor::packed(backend, &x_dims)?;
        let pooling_desc = PoolingDescriptor::new(backend, mode, window)?;

        let mut y_dims = vec![plan.per_device];
        y_dims.extend_from_slice(output_dims);
        if cfg!(debug_assertions) {
            let reported = pooling_desc.output_dims(&input_desc)?;
            if reported != y_dims {
                return Err(PoolError::configuration(format!(
                    "device reports pooled dims {:?}, expected {:?}",
                    reported, y_dims
                )));
            }
        }
        let output_desc = TensorDescriptor::packed(backend, &y_dims)?;

        log::debug!(
            "device pooling configured: {} on {} device(s), x {:?} -> y {:?}",
            mode,
            backend.num_devices(),
            x_dims,
            y_dims
        );

        Ok(DevicePooling {
            backend: Arc::clone(backend),
            plan,
            num_prev_neurons: product(input_dims),
            num_neurons: product(output_dims),
            pooling_desc,
            input_desc,
            output_desc,
            buffers: None,
        })
    }

    /// Bind device matrices, borrowing whatever the neighbours already hold
    pub fn allocate(&mut self, prev: &DeviceBoundary, next: &DeviceBoundary) -> Result<()> {
        let width = self.plan.per_device;
        let (backend, inputs, outputs) = (&self.backend, self.num_prev_neurons, self.num_neurons);
        let buffers = DeviceBuffers {
            prev_activations: BufferBinding::resolve(prev.activations.as_ref(), backend, inputs, width)?,
            activations: BufferBinding::resolve(next.activations.as_ref(), backend, outputs, width)?,
            prev_error_signal: BufferBinding::resolve(next.error_signal.as_ref(), backend, outputs, width)?,
            error_signal: BufferBinding::resolve(prev.error_signal.as_ref(), backend, inputs, width)?,
            stage_prev: !prev.on_device,
            stage_next: !next.on_device,
        };
        log::debug!(
            "device buffers bound: x {}, y {}, dy {}, dx {}; staging prev {}, next {}",
            ownership(&buffers.prev_activations),
            ownership(&buffers.activations),
            ownership(&buffers.prev_error_signal),
            ownership(&buffers.error_signal),
            buffers.stage_prev,
            buffers.stage_next
        );
        self.buffers = Some(buffers);
        Ok(())
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn buffers(&self) -> Option<&DeviceBuffers> {
        self.buffers.as_ref()
    }

    pub fn input_dims(&self) -> &[usize] {
        self.input_desc.dims()
    }

    pub fn output_dims(&self) -> &[usize] {
        self.output_desc.dims()
    }

    /// y = pool(x) on every device.
    ///
    /// Host input is uploaded only when the previous layer is not on the
    /// devices; host output is refreshed only when the next layer is not.
    pub fn forward(&self, prev_activations: ArrayView2<f32>, activations: ArrayViewMut2<f32>) -> Result<()> {
        let buffers = self.bound_buffers()?;
        if buffers.stage_prev {
            buffers.prev_activations.matrix().upload(prev_activations, &self.plan)?;
        }

        let x = buffers.prev_activations.matrix();
        let y = buffers.activations.matrix();
        (0..self.backend.num_devices()).into_par_iter().try_for_each(|device| {
            let args = PoolingForward {
                pooling: self.pooling_desc.id(),
                x_desc: self.input_desc.id(),
                x: x.buffer(device).id(),
                y_desc: self.output_desc.id(),
                y: y.buffer(device).id(),
            };
            self.backend.pooling_forward(device, &args)
        })?;
        self.synchronize()?;

        if buffers.stage_next {
            y.download(activations, &self.plan)?;
        }
        Ok(())
    }

    /// dx = pool'(x) * dy on every device
    pub fn backward(&self, prev_error_signal: ArrayView2<f32>, error_signal: ArrayViewMut2<f32>) -> Result<()> {
        let buffers = self.bound_buffers()?;
        if buffers.stage_next {
            buffers.prev_error_signal.matrix().upload(prev_error_signal, &self.plan)?;
        }

        let x = buffers.prev_activations.matrix();
        let y = buffers.activations.matrix();
        let dy = buffers.prev_error_signal.matrix();
        let dx = buffers.error_signal.matrix();
        (0..self.backend.num_devices()).into_par_iter().try_for_each(|device| {
            let args = PoolingBackward {
                pooling: self.pooling_desc.id(),
                y_desc: self.output_desc.id(),
                y: y.buffer(device).id(),
                dy_desc: self.output_desc.id(),
                dy: dy.buffer(device).id(),
                x_desc: self.input_desc.id(),
                x: x.buffer(device).id(),
                dx_desc: self.input_desc.id(),
                dx: dx.buffer(device).id(),
            };
            self.backend.pooling_backward(device, &args)
        })?;
        self.synchronize()?;

        if buffers.stage_prev {
            dx.download(error_signal, &self.plan)?;
        }
        Ok(())
    }

    /// Release device buffers; descriptors go when `self` is dropped
    pub fn release_buffers(&mut self) {
        if self.buffers.take().is_some() {
            log::debug!("device buffers released");
        }
    }

    fn synchronize(&self) -> Result<()> {
        (0..self.backend.num_devices()).try_for_each(|device| self.backend.synchronize(device))
    }

    fn bound_buffers(&self) -> Result<&DeviceBuffers> {
        self.buffers
            .as_ref()
            .ok_or_else(|| PoolError::invalid_state("run device pooling", "missing device buffers"))
    }
}

fn ownership(binding: &BufferBinding) -> &'static str {
    if binding.is_owned() {
        "owned"
    } else {
        "borrowed"
    }
}
