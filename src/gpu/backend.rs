//! Device backend interface consumed by the accelerated pooling path
//!
//! A backend plays the role of the device manager and the vendor pooling
//! primitive at once: it reports devices, owns device memory, creates
//! descriptors and runs pooling forward/backward on one device at a time.
//! Handles are plain ids; [`crate::gpu::descriptor`] and
//! [`crate::gpu::memory`] wrap them in owners that release on drop.

use std::fmt;
use crate::error::{PoolError, Result};
use crate::layers::PoolMode;
use crate::tensor::{packed_strides, PoolWindow, SpatialGeometry};

/// Supported device types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Devices simulated in host memory
    Host,
    IntelGpu,
    NvidiaGpu,
    AmdGpu,
    /// GPU from any other vendor
    OtherGpu,
    /// OpenCL runtime exposing a CPU device
    OpenClCpu,
}

/// Element type tag carried by tensor descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DataType {
    Float32,
}

/// Device memory handle, unique within its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Descriptor handle, unique within its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(pub u64);

/// What a tensor descriptor describes: `(batch, channels, spatial...)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLayout {
    pub data_type: DataType,
    pub dims: Vec<usize>,
    pub strides: Vec<usize>,
}

impl TensorLayout {
    /// Fully packed layout over `dims`
    pub fn packed(data_type: DataType, dims: &[usize]) -> Self {
        TensorLayout {
            data_type,
            dims: dims.to_vec(),
            strides: packed_strides(dims),
        }
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a pooling descriptor describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolingOp {
    pub mode: PoolMode,
    pub window: PoolWindow,
    /// A NaN inside a max window wins the reduction
    pub propagate_nan: bool,
}

/// Arguments of one pooling forward call
#[derive(Debug, Clone, Copy)]
pub struct PoolingForward {
    pub pooling: DescriptorId,
    pub x_desc: DescriptorId,
    pub x: BufferId,
    pub y_desc: DescriptorId,
    pub y: BufferId,
}

/// Arguments of one pooling backward call
#[derive(Debug, Clone, Copy)]
pub struct PoolingBackward {
    pub pooling: DescriptorId,
    pub y_desc: DescriptorId,
    pub y: BufferId,
    pub dy_desc: DescriptorId,
    pub dy: BufferId,
    pub x_desc: DescriptorId,
    pub x: BufferId,
    pub dx_desc: DescriptorId,
    pub dx: BufferId,
}

/// Device manager plus pooling primitive
pub trait DeviceBackend: Send + Sync {
    /// Get device type
    fn device_type(&self) -> DeviceType;

    /// Number of devices this process drives
    fn num_devices(&self) -> usize;

    /// Element type used for descriptors
    fn data_type(&self) -> DataType {
        DataType::Float32
    }

    /// Human readable description of one device
    fn device_info(&self, device: usize) -> Result<String>;

    /// Allocate `len` zeroed elements on `device`
    fn allocate(&self, device: usize, len: usize) -> Result<BufferId>;

    /// Release a buffer; unknown ids are ignored
    fn deallocate(&self, device: usize, buffer: BufferId);

    /// Copy host data into a device buffer of exactly the same length
    fn write(&self, device: usize, buffer: BufferId, data: &[f32]) -> Result<()>;

    /// Copy a device buffer of exactly `out.len()` elements to host memory
    fn read(&self, device: usize, buffer: BufferId, out: &mut [f32]) -> Result<()>;

    fn create_tensor_descriptor(&self, layout: &TensorLayout) -> Result<DescriptorId>;

    fn create_pooling_descriptor(&self, op: &PoolingOp) -> Result<DescriptorId>;

    /// Release a descriptor; unknown ids are ignored
    fn destroy_descriptor(&self, descriptor: DescriptorId);

    /// Output dims `(batch, channels, spatial...)` the primitive will produce for `input`
    fn pooling_output_dims(&self, pooling: DescriptorId, input: DescriptorId) -> Result<Vec<usize>>;

    /// Enqueue pooling forward on `device`: y = pool(x)
    fn pooling_forward(&self, device: usize, args: &PoolingForward) -> Result<()>;

    /// Enqueue pooling backward on `device`: dx = d pool(x) / dx applied to dy
    fn pooling_backward(&self, device: usize, args: &PoolingBackward) -> Result<()>;

    /// Wait for everything enqueued on `device`
    fn synchronize(&self, device: usize) -> Result<()>;
}

impl fmt::Debug for dyn DeviceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBackend")
            .field("device_type", &self.device_type())
            .field("num_devices", &self.num_devices())
            .finish()
    }
}

/// Output dims a pooling primitive produces for a `(batch, channels, spatial...)` input
pub fn forward_output_dims(op: &PoolingOp, input: &TensorLayout) -> Result<Vec<usize>> {
    let ndims = op.window.num_spatial_dims();
    if input.dims.len() != ndims + 2 {
        return Err(PoolError::device_failure(
            "pooling_output_dims",
            format!(
                "input descriptor has {} dims, pooling descriptor expects {}",
                input.dims.len(),
                ndims + 2
            ),
        ));
    }
    let mut dims = input.dims[..2].to_vec();
    for axis in 0..ndims {
        let extent = op
            .window
            .output_extent(axis, input.dims[axis + 2])
            .map_err(|e| PoolError::device_failure("pooling_output_dims", e))?;
        dims.push(extent);
    }
    Ok(dims)
}

/// A validated pooling call, shared by backend implementations
#[derive(Debug, Clone)]
pub struct PoolingProblem {
    pub batch: usize,
    pub mode: PoolMode,
    pub propagate_nan: bool,
    pub geometry: SpatialGeometry,
}

impl PoolingProblem {
    /// Check that `x` and `y` agree with `op` and are packed
    pub fn resolve(op: &PoolingOp, x: &TensorLayout, y: &TensorLayout) -> Result<Self> {
        for (name, layout) in [("x", x), ("y", y)] {
            if layout.data_type != DataType::Float32 {
                return Err(PoolError::device_failure(
                    "pooling",
                    format!("unsupported data type {:?} for {}", layout.data_type, name),
                ));
            }
            if layout.strides != packed_strides(&layout.dims) {
                return Err(PoolError::device_failure(
                    "pooling",
                    format!("{} descriptor is not fully packed", name),
                ));
            }
        }
        let expected = forward_output_dims(op, x)?;
        if expected != y.dims {
            return Err(PoolError::device_failure(
                "pooling",
                format!("output descriptor {:?} does not match {:?}", y.dims, expected),
            ));
        }
        let geometry = SpatialGeometry::new(x.dims[1], &x.dims[2..], &op.window)
            .map_err(|e| PoolError::device_failure("pooling", e))?;
        Ok(PoolingProblem {
            batch: x.dims[0],
            mode: op.mode,
            propagate_nan: op.propagate_nan,
            geometry,
        })
    }

    /// Elements of one full input tensor
    pub fn input_len(&self) -> usize {
        self.batch * self.geometry.input_len()
    }

    /// Elements of one full output tensor
    pub fn output_len(&self) -> usize {
        self.batch * self.geometry.output_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_op(window: PoolWindow) -> PoolingOp {
        PoolingOp { mode: PoolMode::Max, window, propagate_nan: true }
    }

    #[test]
    fn test_forward_output_dims() {
        let op = max_op(PoolWindow::uniform(2, 3, 1, 2).unwrap());
        let input = TensorLayout::packed(DataType::Float32, &[8, 4, 7, 6]);
        assert_eq!(forward_output_dims(&op, &input).unwrap(), vec![8, 4, 4, 3]);
    }

    #[test]
    fn test_resolve_rejects_mismatched_output() {
        let op = max_op(PoolWindow::uniform(1, 2, 0, 2).unwrap());
        let x = TensorLayout::packed(DataType::Float32, &[2, 3, 8]);
        let y = TensorLayout::packed(DataType::Float32, &[2, 3, 5]);
        assert!(matches!(
            PoolingProblem::resolve(&op, &x, &y),
            Err(PoolError::DeviceFailure { .. })
        ));

        let y = TensorLayout::packed(DataType::Float32, &[2, 3, 4]);
        let problem = PoolingProblem::resolve(&op, &x, &y).unwrap();
        assert_eq!(problem.input_len(), 48);
        assert_eq!(problem.output_len(), 24);
    }

    #[test]
    fn test_resolve_rejects_strided_layout() {
        let op = max_op(PoolWindow::uniform(1, 2, 0, 2).unwrap());
        let mut x = TensorLayout::packed(DataType::Float32, &[2, 3, 8]);
        x.strides = vec![48, 16, 2];
        let y = TensorLayout::packed(DataType::Float32, &[2, 3, 4]);
        assert!(PoolingProblem::resolve(&op, &x, &y).is_err());
    }
}
