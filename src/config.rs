//! In-process pooling configuration
//!
//! A [`PoolingConfig`] carries everything fixed at construction: window
//! geometry, reduction mode, data layout and the compute path. It can be
//! read from and written to JSON.

use serde::{Serialize, Deserialize};
use crate::error::{PoolError, Result};
use crate::layers::PoolMode;
use crate::tensor::PoolWindow;

/// Compute path, fixed for the lifetime of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    /// im2col on host cores
    #[default]
    Cpu,
    /// Device pooling primitive through a [`crate::gpu::DeviceBackend`]
    Accelerated,
}

/// How activations are distributed across processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLayout {
    /// Every process holds whole samples of its mini-batch shard
    #[default]
    DataParallel,
    /// Neurons are split across processes
    ModelParallel,
}

/// Construction parameters of a pooling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolingConfig {
    pub window_dims: Vec<usize>,
    pub pads: Vec<usize>,
    pub strides: Vec<usize>,
    pub mode: PoolMode,
    #[serde(default)]
    pub layout: DataLayout,
    #[serde(default)]
    pub device_mode: DeviceMode,
}

impl PoolingConfig {
    /// Data-parallel CPU configuration for `window`
    pub fn new(window: &PoolWindow, mode: PoolMode) -> Self {
        PoolingConfig {
            window_dims: window.dims.clone(),
            pads: window.pads.clone(),
            strides: window.strides.clone(),
            mode,
            layout: DataLayout::default(),
            device_mode: DeviceMode::default(),
        }
    }

    pub fn with_device_mode(mut self, device_mode: DeviceMode) -> Self {
        self.device_mode = device_mode;
        self
    }

    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Validated window descriptor
    pub fn window(&self) -> Result<PoolWindow> {
        PoolWindow::new(self.window_dims.clone(), self.pads.clone(), self.strides.clone())
    }

    pub fn num_spatial_dims(&self) -> usize {
        self.window_dims.len()
    }

    /// Reject configurations no pooling layer can run
    pub fn validate(&self) -> Result<()> {
        self.window()?;
        if self.layout != DataLayout::DataParallel {
            return Err(PoolError::configuration(format!(
                "pooling supports the data-parallel layout only, got {:?}",
                self.layout
            )));
        }
        if self.device_mode == DeviceMode::Cpu {
            self.mode.ensure_cpu_supported()?;
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PoolingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &str) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}
