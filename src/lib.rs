//! # poolnet - N-dimensional pooling for distributed training
//!
//! A pooling layer that runs either on host cores, through an explicit
//! image-to-column transform, or on accelerator devices through a pooling
//! primitive. The compute path is chosen once at construction and never
//! changes afterwards.
//!
//! ## Key Features
//!
//! - **Any number of spatial axes**: per-axis window, padding and stride
//! - **Pooling modes**: max, average (padding counted) and average excluding
//!   padding (accelerated path only)
//! - **Multi-device**: mini-batches are sharded over processes and then devices
//! - **Buffer sharing**: device buffers are borrowed from neighbouring layers
//!   when they already live on the same devices
//! - **Scoped device resources**: descriptors and buffers release on drop
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::Array2;
//! use poolnet::builders::PoolingLayerBuilder;
//! use poolnet::layers::{Layer, NeighborInfo, PoolMode};
//!
//! let mut layer = PoolingLayerBuilder::new()
//!     .uniform(2, 2, 0, 2)
//!     .mode(PoolMode::Max)
//!     .mini_batch_size(1)
//!     .build()
//!     .unwrap();
//! layer.setup(&NeighborInfo::host(&[1, 4, 4]), None).unwrap();
//!
//! let input = Array2::from_shape_fn((1, 16), |(_, i)| (i + 1) as f32);
//! let output = layer.forward(input.view()).unwrap();
//! assert_eq!(output.row(0).to_vec(), vec![6.0, 8.0, 14.0, 16.0]);
//! ```
//!
//! ## Module Organization
//!
//! - [`builders`] - Builder for pooling layers
//! - [`comm`] - Communicator interface and mini-batch shard planning
//! - [`config`] - Layer configuration, JSON loading and saving
//! - [`error`] - Error types and result handling
//! - [`gpu`] - Device backends, descriptors, device memory and the accelerated path
//! - [`im2col`] - Image-to-column transforms
//! - [`layers`] - Pooling modes, CPU compute and the layer itself
//! - [`tensor`] - Window descriptors and dimension bookkeeping

pub mod builders;
pub mod comm;
pub mod config;
pub mod error;
pub mod gpu;
pub mod im2col;
pub mod layers;
pub mod tensor;

pub use error::{PoolError, Result};
pub use config::{DataLayout, DeviceMode, PoolingConfig};
pub use layers::{Layer, PoolMode, PoolingLayer};
pub use tensor::PoolWindow;
