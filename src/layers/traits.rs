use ndarray::ArrayView2;
use crate::config::DataLayout;
use crate::error::Result;
use crate::gpu::pooling::DeviceBoundary;

/// Layer kinds known to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LayerType {
    Pooling,
}

/// What a neighbouring layer exposes at setup time
#[derive(Debug, Clone)]
pub struct NeighborInfo {
    /// Neuron dims `(channels, spatial...)` of the neighbour
    pub neuron_dims: Vec<usize>,
    /// Device residency of the shared boundary
    pub boundary: DeviceBoundary,
}

impl NeighborInfo {
    /// Neighbour whose data lives in host memory only
    pub fn host(neuron_dims: &[usize]) -> Self {
        NeighborInfo {
            neuron_dims: neuron_dims.to_vec(),
            boundary: DeviceBoundary::host(),
        }
    }

    /// Neighbour computing on the same device backend
    pub fn on_device(neuron_dims: &[usize], boundary: DeviceBoundary) -> Self {
        NeighborInfo {
            neuron_dims: neuron_dims.to_vec(),
            boundary: DeviceBoundary { on_device: true, ..boundary },
        }
    }

    pub fn using_gpus(&self) -> bool {
        self.boundary.on_device
    }
}

/// Interface a layer presents to the training pipeline.
///
/// Host matrices hold one sample per row. Views returned by `forward` and
/// `backward` cover exactly the rows of the input mini-batch.
pub trait Layer: Send + Sync {
    /// Get the layer name
    fn name(&self) -> &str;

    /// Position of the layer in its model
    fn index(&self) -> usize;

    fn layer_type(&self) -> LayerType;

    fn data_layout(&self) -> DataLayout;

    /// Whether this layer computes on a device backend
    fn using_gpus(&self) -> bool;

    /// Output neuron dims `(channels, spatial...)`, empty before setup
    fn neuron_dims(&self) -> &[usize];

    /// Number of output neurons per sample
    fn num_neurons(&self) -> usize {
        self.neuron_dims().iter().product()
    }

    /// Compute dimensions, create descriptors and bind buffers
    fn setup(&mut self, prev: &NeighborInfo, next: Option<&NeighborInfo>) -> Result<()>;

    /// Forward pass over one mini-batch
    fn forward(&mut self, prev_activations: ArrayView2<f32>) -> Result<ArrayView2<'_, f32>>;

    /// Backward pass; `prev_activations` is the input of the matching forward pass
    fn backward(
        &mut self,
        prev_activations: ArrayView2<f32>,
        prev_error_signal: ArrayView2<f32>,
    ) -> Result<ArrayView2<'_, f32>>;
}
