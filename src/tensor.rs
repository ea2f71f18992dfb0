//! Tensor dimension bookkeeping for pooling windows
//!
//! Activations are laid out per sample as `(channels, spatial...)` in
//! row-major order. This module owns the output-size formula and the
//! geometry tables shared by the CPU transforms and the device descriptors.

use serde::{Serialize, Deserialize};
use crate::error::{PoolError, Result};

/// Pooling window descriptor: one entry per spatial axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolWindow {
    /// Window extent along each spatial axis
    pub dims: Vec<usize>,

    /// Zero padding added on both sides of each spatial axis
    pub pads: Vec<usize>,

    /// Step between consecutive windows along each spatial axis
    pub strides: Vec<usize>,
}

impl PoolWindow {
    /// Create a validated window descriptor
    pub fn new(dims: Vec<usize>, pads: Vec<usize>, strides: Vec<usize>) -> Result<Self> {
        let window = PoolWindow { dims, pads, strides };
        window.validate()?;
        Ok(window)
    }

    /// Same window, padding and stride along every spatial axis
    pub fn uniform(num_spatial_dims: usize, dim: usize, pad: usize, stride: usize) -> Result<Self> {
        Self::new(
            vec![dim; num_spatial_dims],
            vec![pad; num_spatial_dims],
            vec![stride; num_spatial_dims],
        )
    }

    /// Check that all three vectors agree in length and dims/strides are positive
    pub fn validate(&self) -> Result<()> {
        if self.dims.is_empty() {
            return Err(PoolError::invalid_parameter(
                "pool_dims",
                "pooling window needs at least one spatial axis",
            ));
        }
        if self.pads.len() != self.dims.len() || self.strides.len() != self.dims.len() {
            return Err(PoolError::invalid_parameter(
                "pool_window".to_string(),
                format!(
                    "dims, pads and strides must have equal length (got {}, {}, {})",
                    self.dims.len(),
                    self.pads.len(),
                    self.strides.len()
                ),
            ));
        }
        if self.dims.iter().any(|&d| d == 0) {
            return Err(PoolError::invalid_parameter("pool_dims", "window dims must be >= 1"));
        }
        if self.strides.iter().any(|&s| s == 0) {
            return Err(PoolError::invalid_parameter("pool_strides", "strides must be >= 1"));
        }
        Ok(())
    }

    pub fn num_spatial_dims(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements covered by one window
    pub fn size(&self) -> usize {
        product(&self.dims)
    }

    /// Output extent along `axis`: floor((input + 2*pad - window) / stride) + 1
    ///
    /// Trailing partial windows are discarded.
    pub fn output_extent(&self, axis: usize, input: usize) -> Result<usize> {
        let padded = input + 2 * self.pads[axis];
        if padded < self.dims[axis] {
            return Err(PoolError::configuration(format!(
                "window of extent {} does not fit input of extent {} with padding {} on axis {}",
                self.dims[axis], input, self.pads[axis], axis
            )));
        }
        Ok((padded - self.dims[axis]) / self.strides[axis] + 1)
    }
}

/// Output neuron dims for input dims `(channels, spatial...)`; channels are preserved
pub fn pooled_dims(input_dims: &[usize], window: &PoolWindow) -> Result<Vec<usize>> {
    if input_dims.len() != window.num_spatial_dims() + 1 {
        return Err(PoolError::dimension_mismatch(
            format!("{} input dims (channels + {} spatial)", window.num_spatial_dims() + 1, window.num_spatial_dims()),
            format!("{} input dims {:?}", input_dims.len(), input_dims),
        ));
    }
    let mut output = Vec::with_capacity(input_dims.len());
    output.push(input_dims[0]);
    for (axis, &extent) in input_dims[1..].iter().enumerate() {
        output.push(window.output_extent(axis, extent)?);
    }
    Ok(output)
}

/// Fully packed row-major strides (last axis has stride 1)
pub fn packed_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

pub fn product(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Per-sample geometry of a pooling window sliding over a `(channels, spatial...)` tensor
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialGeometry {
    channels: usize,
    input_dims: Vec<usize>,
    output_dims: Vec<usize>,
    input_strides: Vec<usize>,
    window: PoolWindow,
    // window_size x ndims, row-major enumeration of window offsets
    window_offsets: Vec<usize>,
}

impl SpatialGeometry {
    /// Geometry for `channels` planes of spatial extent `input_dims`
    pub fn new(channels: usize, input_dims: &[usize], window: &PoolWindow) -> Result<Self> {
        window.validate()?;
        if input_dims.len() != window.num_spatial_dims() {
            return Err(PoolError::dimension_mismatch(
                format!("{} spatial dims", window.num_spatial_dims()),
                format!("{} spatial dims", input_dims.len()),
            ));
        }
        if channels == 0 {
            return Err(PoolError::invalid_parameter("channels", "channel count must be >= 1"));
        }

        let output_dims = input_dims
            .iter()
            .enumerate()
            .map(|(axis, &extent)| window.output_extent(axis, extent))
            .collect::<Result<Vec<_>>>()?;

        let ndims = window.num_spatial_dims();
        let window_size = window.size();
        let mut window_offsets = Vec::with_capacity(window_size * ndims);
        let mut offset = vec![0usize; ndims];
        for _ in 0..window_size {
            window_offsets.extend_from_slice(&offset);
            // Odometer increment, last axis fastest
            for axis in (0..ndims).rev() {
                offset[axis] += 1;
                if offset[axis] < window.dims[axis] {
                    break;
                }
                offset[axis] = 0;
            }
        }

        Ok(SpatialGeometry {
            channels,
            input_dims: input_dims.to_vec(),
            output_dims,
            input_strides: packed_strides(input_dims),
            window: window.clone(),
            window_offsets,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn input_dims(&self) -> &[usize] {
        &self.input_dims
    }

    pub fn output_dims(&self) -> &[usize] {
        &self.output_dims
    }

    pub fn window(&self) -> &PoolWindow {
        &self.window
    }

    pub fn window_size(&self) -> usize {
        self.window.size()
    }

    /// Spatial elements per input channel
    pub fn input_size(&self) -> usize {
        product(&self.input_dims)
    }

    /// Output positions per channel
    pub fn output_size(&self) -> usize {
        product(&self.output_dims)
    }

    /// Length of one flattened input sample
    pub fn input_len(&self) -> usize {
        self.channels * self.input_size()
    }

    /// Length of one flattened output sample
    pub fn output_len(&self) -> usize {
        self.channels * self.output_size()
    }

    /// Shape of the per-sample column matrix: (window_size * channels, output positions)
    pub fn column_shape(&self) -> (usize, usize) {
        (self.window_size() * self.channels, self.output_size())
    }

    /// Visit every window element at output `position` in window order.
    ///
    /// The callback receives the window offset index and the spatial input
    /// index, or `None` when the element lies in the padding border.
    pub fn for_each_window_element<F>(&self, position: usize, mut f: F)
    where
        F: FnMut(usize, Option<usize>),
    {
        let ndims = self.input_dims.len();
        let mut origin = vec![0isize; ndims];
        let mut rem = position;
        for axis in (0..ndims).rev() {
            let coord = rem % self.output_dims[axis];
            rem /= self.output_dims[axis];
            origin[axis] = (coord * self.window.strides[axis]) as isize - self.window.pads[axis] as isize;
        }

        for (i, offset) in self.window_offsets.chunks_exact(ndims).enumerate() {
            let mut index = 0usize;
            let mut inside = true;
            for axis in 0..ndims {
                let x = origin[axis] + offset[axis] as isize;
                if x < 0 || x >= self.input_dims[axis] as isize {
                    inside = false;
                    break;
                }
                index += x as usize * self.input_strides[axis];
            }
            f(i, if inside { Some(index) } else { None });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_extent_formula() {
        let window = PoolWindow::uniform(1, 3, 0, 2).unwrap();
        assert_eq!(window.output_extent(0, 5).unwrap(), 2);

        // Trailing partial window is dropped
        let window = PoolWindow::uniform(1, 2, 0, 2).unwrap();
        assert_eq!(window.output_extent(0, 5).unwrap(), 2);

        let window = PoolWindow::uniform(1, 3, 1, 2).unwrap();
        assert_eq!(window.output_extent(0, 4).unwrap(), 2);

        let window = PoolWindow::uniform(1, 3, 1, 1).unwrap();
        assert_eq!(window.output_extent(0, 4).unwrap(), 4);
    }

    #[test]
    fn test_window_larger_than_padded_input() {
        let window = PoolWindow::uniform(1, 5, 0, 1).unwrap();
        let err = window.output_extent(0, 3).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_pooled_dims_preserves_channels() {
        let window = PoolWindow::new(vec![2, 3], vec![0, 1], vec![2, 1]).unwrap();
        let dims = pooled_dims(&[7, 6, 5], &window).unwrap();
        assert_eq!(dims, vec![7, 3, 5]);
    }

    #[test]
    fn test_pooled_dims_rank_mismatch() {
        let window = PoolWindow::uniform(2, 2, 0, 2).unwrap();
        assert!(matches!(
            pooled_dims(&[1, 4], &window),
            Err(PoolError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_windows() {
        assert!(PoolWindow::new(vec![0], vec![0], vec![1]).is_err());
        assert!(PoolWindow::new(vec![2], vec![0], vec![0]).is_err());
        assert!(PoolWindow::new(vec![2, 2], vec![0], vec![1, 1]).is_err());
        assert!(PoolWindow::new(vec![], vec![], vec![]).is_err());
    }

    #[test]
    fn test_packed_strides() {
        assert_eq!(packed_strides(&[4, 3, 5, 2]), vec![30, 10, 2, 1]);
        assert_eq!(packed_strides(&[7]), vec![1]);
        assert!(packed_strides(&[]).is_empty());
    }

    #[test]
    fn test_window_elements_with_padding() {
        // 3x3 input, 2x2 window, pad 1, stride 2 -> 2x2 outputs
        let window = PoolWindow::uniform(2, 2, 1, 2).unwrap();
        let geometry = SpatialGeometry::new(1, &[3, 3], &window).unwrap();
        assert_eq!(geometry.output_dims(), &[2, 2]);
        assert_eq!(geometry.column_shape(), (4, 4));

        let mut seen = Vec::new();
        geometry.for_each_window_element(0, |i, index| seen.push((i, index)));
        assert_eq!(seen, vec![(0, None), (1, None), (2, None), (3, Some(0))]);

        let mut seen = Vec::new();
        geometry.for_each_window_element(3, |i, index| seen.push((i, index)));
        assert_eq!(seen, vec![(0, Some(4)), (1, Some(5)), (2, Some(7)), (3, Some(8))]);
    }
}
