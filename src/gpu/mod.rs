//! Device acceleration for pooling
//!
//! The accelerated path talks to a [`DeviceBackend`]. Two implementations
//! exist: [`HostDeviceBackend`] simulates devices in host memory and is
//! always available; [`OpenClBackend`] runs on OpenCL devices when the crate
//! is built with the `gpu` feature.

pub mod backend;
pub mod constants;
pub mod descriptor;
pub mod host_backend;
pub mod memory;
pub mod pooling;

#[cfg(feature = "gpu")]
pub mod opencl;

pub use backend::{DeviceBackend, DeviceType};
pub use descriptor::{PoolingDescriptor, TensorDescriptor};
pub use host_backend::HostDeviceBackend;
pub use memory::{BufferBinding, DeviceBuffer, DeviceMatrix};
pub use pooling::{DeviceBoundary, DevicePooling};

#[cfg(feature = "gpu")]
pub use opencl::OpenClBackend;

#[cfg(not(feature = "gpu"))]
pub struct OpenClBackend;

#[cfg(not(feature = "gpu"))]
impl OpenClBackend {
    pub fn new() -> crate::error::Result<Self> {
        Err(crate::error::PoolError::BackendUnavailable(
            "OpenCL support not compiled. Enable with --features gpu".to_string(),
        ))
    }

    pub fn with_max_devices(_max_devices: usize) -> crate::error::Result<Self> {
        Self::new()
    }
}
