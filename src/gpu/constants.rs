//! Constants for device backends

/// Devices simulated by `HostDeviceBackend::default()`
pub const DEFAULT_HOST_DEVICES: usize = 1;

/// Spatial axes supported by the OpenCL pooling kernels
pub const MAX_SPATIAL_DIMS: usize = 3;

/// Geometry words passed to the OpenCL kernels:
/// ndims, then input dims, output dims, window dims, pads, strides (MAX_SPATIAL_DIMS each)
pub const KERNEL_GEOMETRY_LEN: usize = 1 + 5 * MAX_SPATIAL_DIMS;

/// Kernel mode codes shared with `kernels/pooling.cl`
pub const KERNEL_MODE_MAX: i32 = 0;
pub const KERNEL_MODE_AVERAGE: i32 = 1;
pub const KERNEL_MODE_AVERAGE_NO_PAD: i32 = 2;
