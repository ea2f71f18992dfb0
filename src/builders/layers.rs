use std::sync::Arc;
use crate::comm::{Communicator, LocalComm};
use crate::config::{DataLayout, DeviceMode, PoolingConfig};
use crate::error::{PoolError, Result};
use crate::gpu::backend::DeviceBackend;
use crate::layers::{PoolMode, PoolingLayer};

/// Builder for PoolingLayer
pub struct PoolingLayerBuilder {
    index: usize,
    mini_batch_size: Option<usize>,
    window_dims: Option<Vec<usize>>,
    pads: Option<Vec<usize>>,
    strides: Option<Vec<usize>>,
    mode: PoolMode,
    layout: DataLayout,
    device_mode: DeviceMode,
    backend: Option<Arc<dyn DeviceBackend>>,
    comm: Arc<dyn Communicator>,
}

impl PoolingLayerBuilder {
    /// Create a new pooling layer builder
    pub fn new() -> Self {
        PoolingLayerBuilder {
            index: 0,
            mini_batch_size: None,
            window_dims: None,
            pads: None,
            strides: None,
            mode: PoolMode::Max,
            layout: DataLayout::DataParallel,
            device_mode: DeviceMode::Cpu,
            backend: None,
            comm: Arc::new(LocalComm),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: &PoolingConfig) -> Self {
        PoolingLayerBuilder {
            window_dims: Some(config.window_dims.clone()),
            pads: Some(config.pads.clone()),
            strides: Some(config.strides.clone()),
            mode: config.mode,
            layout: config.layout,
            device_mode: config.device_mode,
            ..Self::new()
        }
    }

    /// Set the layer's position in its model
    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Set the global mini-batch size
    pub fn mini_batch_size(mut self, size: usize) -> Self {
        self.mini_batch_size = Some(size);
        self
    }

    /// Set per-axis window dims
    pub fn window(mut self, dims: &[usize]) -> Self {
        self.window_dims = Some(dims.to_vec());
        self
    }

    /// Set per-axis padding (defaults to zero)
    pub fn pads(mut self, pads: &[usize]) -> Self {
        self.pads = Some(pads.to_vec());
        self
    }

    /// Set per-axis strides (defaults to the window dims)
    pub fn strides(mut self, strides: &[usize]) -> Self {
        self.strides = Some(strides.to_vec());
        self
    }

    /// Same window, padding and stride on every spatial axis
    pub fn uniform(mut self, num_spatial_dims: usize, dim: usize, pad: usize, stride: usize) -> Self {
        self.window_dims = Some(vec![dim; num_spatial_dims]);
        self.pads = Some(vec![pad; num_spatial_dims]);
        self.strides = Some(vec![stride; num_spatial_dims]);
        self
    }

    /// Set pooling mode
    pub fn mode(mut self, mode: PoolMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Run on the device backend instead of the CPU
    pub fn accelerated(mut self, backend: Arc<dyn DeviceBackend>) -> Self {
        self.device_mode = DeviceMode::Accelerated;
        self.backend = Some(backend);
        self
    }

    /// Set device mode without supplying a backend
    pub fn device_mode(mut self, device_mode: DeviceMode) -> Self {
        self.device_mode = device_mode;
        self
    }

    pub fn communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.comm = comm;
        self
    }

    /// Assemble and validate the configuration
    pub fn build_config(&self) -> Result<PoolingConfig> {
        let window_dims = self.window_dims.clone().ok_or_else(|| PoolError::InvalidParameter {
            name: "window_dims".to_string(),
            reason: "Window dims not specified".to_string(),
        })?;
        let pads = self.pads.clone().unwrap_or_else(|| vec![0; window_dims.len()]);
        let strides = self.strides.clone().unwrap_or_else(|| window_dims.clone());

        let config = PoolingConfig {
            window_dims,
            pads,
            strides,
            mode: self.mode,
            layout: self.layout,
            device_mode: self.device_mode,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the pooling layer
    pub fn build(self) -> Result<PoolingLayer> {
        let mini_batch_size = self.mini_batch_size.ok_or_else(|| PoolError::InvalidParameter {
            name: "mini_batch_size".to_string(),
            reason: "Mini-batch size not specified".to_string(),
        })?;
        let config = self.build_config()?;
        PoolingLayer::new(self.index, config, mini_batch_size, self.comm.as_ref(), self.backend)
    }
}

impl Default for PoolingLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
