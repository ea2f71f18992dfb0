//! Image-to-column transforms for windowed N-dimensional tensors
//!
//! `im2col` lays out every receptive window of one sample as a column of a
//! `(window_size * channels, output_positions)` matrix. Rows are grouped by
//! channel, so the entries of channel `c` at output position `j` occupy
//! rows `c * window_size .. (c + 1) * window_size` of column `j`, enumerated
//! with the last spatial axis fastest. Window elements that fall in the
//! padding border are zero.
//!
//! `col2im` is the adjoint: it sums every column entry back into the input
//! element it was read from and drops entries that came from padding.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, ShapeBuilder, Zip};
use crate::error::{PoolError, Result};
use crate::tensor::SpatialGeometry;

/// Build the column matrix for one flattened `(channels, spatial...)` sample
pub fn im2col(input: ArrayView1<f32>, geometry: &SpatialGeometry) -> Result<Array2<f32>> {
    // Column-major so each window column is contiguous
    let mut columns = Array2::zeros(geometry.column_shape().f());
    im2col_into(input, columns.view_mut(), geometry)?;
    Ok(columns)
}

/// Fill a preallocated column matrix, overwriting every entry
pub fn im2col_into(
    input: ArrayView1<f32>,
    mut columns: ArrayViewMut2<f32>,
    geometry: &SpatialGeometry,
) -> Result<()> {
    if input.len() != geometry.input_len() {
        return Err(PoolError::dimension_mismatch(
            format!("input of length {}", geometry.input_len()),
            format!("input of length {}", input.len()),
        ));
    }
    check_column_shape(columns.dim(), geometry)?;

    let channels = geometry.channels();
    let window_size = geometry.window_size();
    let input_size = geometry.input_size();

    Zip::indexed(columns.axis_iter_mut(Axis(1))).par_for_each(|position, mut column| {
        geometry.for_each_window_element(position, |i, index| {
            for c in 0..channels {
                column[c * window_size + i] = match index {
                    Some(s) => input[c * input_size + s],
                    None => 0.0,
                };
            }
        });
    });

    Ok(())
}

/// Accumulate a column matrix back into a freshly zeroed input-shaped sample
pub fn col2im(columns: ArrayView2<f32>, geometry: &SpatialGeometry) -> Result<Array1<f32>> {
    let mut output = Array1::zeros(geometry.input_len());
    col2im_into(columns, output.view_mut(), geometry)?;
    Ok(output)
}

/// Overwrite `output` with the sum of all column entries mapped onto it
pub fn col2im_into(
    columns: ArrayView2<f32>,
    mut output: ArrayViewMut1<f32>,
    geometry: &SpatialGeometry,
) -> Result<()> {
    if output.len() != geometry.input_len() {
        return Err(PoolError::dimension_mismatch(
            format!("output of length {}", geometry.input_len()),
            format!("output of length {}", output.len()),
        ));
    }
    check_column_shape(columns.dim(), geometry)?;

    let window_size = geometry.window_size();
    let output_size = geometry.output_size();

    output.fill(0.0);
    if geometry.input_size() == 0 {
        // Zero-extent input: every window lies in the padding
        return Ok(());
    }

    // Channels own disjoint planes of the output, positions are summed in order
    Zip::indexed(output.exact_chunks_mut(geometry.input_size())).par_for_each(|c, mut plane| {
        for position in 0..output_size {
            let column = columns.column(position);
            geometry.for_each_window_element(position, |i, index| {
                if let Some(s) = index {
                    plane[s] += column[c * window_size + i];
                }
            });
        }
    });

    Ok(())
}

fn check_column_shape(shape: (usize, usize), geometry: &SpatialGeometry) -> Result<()> {
    let expected = geometry.column_shape();
    if shape != expected {
        return Err(PoolError::dimension_mismatch(
            format!("column matrix {:?}", expected),
            format!("column matrix {:?}", shape),
        ));
    }
    Ok(())
}
