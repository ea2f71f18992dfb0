pub mod pool_mode;
pub mod pooling;
pub mod traits;

pub use pool_mode::{argmax_first, CpuReduction, PoolMode};
pub use pooling::{bp_compute_im2col, fp_compute_im2col, LayerState, PoolingLayer, LAYER_NAME};
pub use traits::{Layer, LayerType, NeighborInfo};
