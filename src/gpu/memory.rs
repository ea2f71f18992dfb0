//! Device-resident buffers with scoped ownership
//!
//! A [`DeviceMatrix`] holds one buffer per device, each sized for that
//! device's shard of the mini-batch. Layers share matrices through
//! [`BufferBinding`], which records once at setup whether the layer
//! allocated the matrix or borrowed it from a neighbour.

use std::fmt;
use std::sync::Arc;
use ndarray::{ArrayView2, ArrayViewMut2};
use crate::comm::ShardPlan;
use crate::error::{PoolError, Result};
use super::backend::{BufferId, DeviceBackend};

/// One allocation on one device, released on drop
pub struct DeviceBuffer {
    backend: Arc<dyn DeviceBackend>,
    device: usize,
    id: BufferId,
    len: usize,
}

impl DeviceBuffer {
    pub fn allocate(backend: &Arc<dyn DeviceBackend>, device: usize, len: usize) -> Result<Self> {
        let id = backend.allocate(device, len)?;
        Ok(DeviceBuffer {
            backend: Arc::clone(backend),
            device,
            id,
            len,
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&self, data: &[f32]) -> Result<()> {
        self.backend.write(self.device, self.id, data)
    }

    pub fn read(&self, out: &mut [f32]) -> Result<()> {
        self.backend.read(self.device, self.id, out)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.backend.deallocate(self.device, self.id);
    }
}

/// A `height x width_per_device` matrix replicated in shape on every device.
///
/// Each device buffer is sample-major: `width_per_device` samples of
/// `height` contiguous values.
pub struct DeviceMatrix {
    buffers: Vec<DeviceBuffer>,
    height: usize,
    width_per_device: usize,
}

impl DeviceMatrix {
    /// Allocate on every device of `backend`
    pub fn allocate(backend: &Arc<dyn DeviceBackend>, height: usize, width_per_device: usize) -> Result<Self> {
        let buffers = (0..backend.num_devices())
            .map(|device| DeviceBuffer::allocate(backend, device, height * width_per_device))
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "allocated {}x{} on {} device(s)",
            height,
            width_per_device,
            buffers.len()
        );
        Ok(DeviceMatrix {
            buffers,
            height,
            width_per_device,
        })
    }

    pub fn num_devices(&self) -> usize {
        self.buffers.len()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width_per_device(&self) -> usize {
        self.width_per_device
    }

    pub fn buffer(&self, device: usize) -> &DeviceBuffer {
        &self.buffers[device]
    }

    /// Scatter host rows (one sample per row) to their devices.
    ///
    /// Shards shorter than `width_per_device` are zero-padded.
    pub fn upload(&self, host: ArrayView2<f32>, plan: &ShardPlan) -> Result<()> {
        self.check_host_shape(host.ncols(), host.nrows(), plan)?;
        let mut staging = vec![0.0f32; self.height * self.width_per_device];
        for (device, buffer) in self.buffers.iter().enumerate() {
            staging.fill(0.0);
            let (start, end) = plan.device_rows(device, host.nrows());
            for (k, sample) in host.rows().into_iter().skip(start).take(end - start).enumerate() {
                let dst = &mut staging[k * self.height..(k + 1) * self.height];
                for (d, &s) in dst.iter_mut().zip(sample.iter()) {
                    *d = s;
                }
            }
            buffer.write(&staging)?;
        }
        Ok(())
    }

    /// Gather each device's valid rows back into host rows
    pub fn download(&self, mut host: ArrayViewMut2<f32>, plan: &ShardPlan) -> Result<()> {
        self.check_host_shape(host.ncols(), host.nrows(), plan)?;
        let mut staging = vec![0.0f32; self.height * self.width_per_device];
        let width = host.nrows();
        for (device, buffer) in self.buffers.iter().enumerate() {
            let (start, end) = plan.device_rows(device, width);
            if start == end {
                continue;
            }
            buffer.read(&mut staging)?;
            for (k, mut sample) in host.rows_mut().into_iter().skip(start).take(end - start).enumerate() {
                for (d, &s) in sample.iter_mut().zip(&staging[k * self.height..(k + 1) * self.height]) {
                    *d = s;
                }
            }
        }
        Ok(())
    }

    fn check_host_shape(&self, height: usize, width: usize, plan: &ShardPlan) -> Result<()> {
        if height != self.height {
            return Err(PoolError::dimension_mismatch(
                format!("{} values per sample", self.height),
                format!("{} values per sample", height),
            ));
        }
        if plan.per_device != self.width_per_device || width > self.width_per_device * self.num_devices() {
            return Err(PoolError::dimension_mismatch(
                format!("at most {} samples", self.width_per_device * self.num_devices()),
                format!("{} samples", width),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMatrix")
            .field("height", &self.height)
            .field("width_per_device", &self.width_per_device)
            .field("num_devices", &self.buffers.len())
            .finish()
    }
}

/// Whether a layer allocated a device matrix or uses its neighbour's
#[derive(Debug, Clone)]
pub enum BufferBinding {
    /// Allocated by this layer; host data is staged through it
    Owned(Arc<DeviceMatrix>),
    /// Supplied by an adjacent layer on the same devices
    Borrowed(Arc<DeviceMatrix>),
}

impl BufferBinding {
    /// Borrow `shared` when present, otherwise allocate a fresh matrix
    pub fn resolve(
        shared: Option<&Arc<DeviceMatrix>>,
        backend: &Arc<dyn DeviceBackend>,
        height: usize,
        width_per_device: usize,
    ) -> Result<Self> {
        match shared {
            Some(matrix) => {
                if matrix.height() != height
                    || matrix.width_per_device() != width_per_device
                    || matrix.num_devices() != backend.num_devices()
                {
                    return Err(PoolError::configuration(format!(
                        "shared device buffer is {}x{} on {} device(s), layer needs {}x{} on {}",
                        matrix.height(),
                        matrix.width_per_device(),
                        matrix.num_devices(),
                        height,
                        width_per_device,
                        backend.num_devices()
                    )));
                }
                Ok(BufferBinding::Borrowed(Arc::clone(matrix)))
            }
            None => Ok(BufferBinding::Owned(Arc::new(DeviceMatrix::allocate(
                backend,
                height,
                width_per_device,
            )?))),
        }
    }

    pub fn matrix(&self) -> &Arc<DeviceMatrix> {
        match self {
            BufferBinding::Owned(matrix) | BufferBinding::Borrowed(matrix) => matrix,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, BufferBinding::Owned(_))
    }
}
