//! Masked FFT correlation of a single block.
//!
//! For a block `B` extracted with a `cutoff`-wide halo, the lag-`k`
//! contribution is `sum_x origin(x) * lagged(x + k)` over the core cells `x`
//! only. Masking the origin operand is what keeps neighbouring windows from
//! counting the same origin twice.

use ndarray::{ArrayD, ArrayViewD, IxDyn, Slice};

use crate::error::{CorrelationError, Result};
use crate::spectrum::{multiply_conjugate, FieldFft};

pub fn core_mask(block_shape: &[usize], core: &[usize], cutoff: usize) -> ArrayD<f64> {
    let mut mask = ArrayD::<f64>::zeros(IxDyn(block_shape));
    mask.slice_each_axis_mut(|desc| Slice::from(cutoff..cutoff + core[desc.axis.index()]))
        .fill(1.0);
    mask
}

pub fn center_shift(field: ArrayViewD<'_, f64>) -> ArrayD<f64> {
    let shape = field.shape().to_vec();
    let mut source = vec![0usize; shape.len()];
    ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
        for (axis, slot) in source.iter_mut().enumerate() {
            let len = shape[axis];
            *slot = (idx[axis] + len - len / 2) % len;
        }
        field[source.as_slice()]
    })
}

pub fn crop_lags(shifted: ArrayViewD<'_, f64>, cutoff: usize) -> Result<ArrayD<f64>> {
    check_span(shifted.shape(), cutoff)?;
    Ok(shifted
        .slice_each_axis(|desc| {
            let mid = desc.len / 2;
            Slice::from(mid - cutoff..mid + cutoff + 1)
        })
        .to_owned())
}

fn check_span(shape: &[usize], cutoff: usize) -> Result<()> {
    let required = 2 * cutoff + 1;
    match shape.iter().enumerate().find(|&(_, &len)| len < required) {
        Some((axis, &length)) => Err(CorrelationError::BlockTooSmall {
            axis,
            length,
            required,
        }),
        None => Ok(()),
    }
}

fn check_block(lagged: &ArrayViewD<'_, f64>, origin: &ArrayViewD<'_, f64>, cutoff: usize) -> Result<()> {
    let ndim = lagged.ndim();
    if !(2..=3).contains(&ndim) {
        return Err(CorrelationError::Dimensionality { ndim });
    }
    if lagged.shape() != origin.shape() {
        return Err(CorrelationError::ShapeMismatch {
            first: lagged.shape().to_vec(),
            second: origin.shape().to_vec(),
        });
    }
    check_span(lagged.shape(), cutoff)
}

pub fn correlate_block(
    fft: &FieldFft,
    lagged: ArrayViewD<'_, f64>,
    origin: ArrayViewD<'_, f64>,
    mask: Option<&ArrayD<f64>>,
    cutoff: usize,
) -> Result<ArrayD<f64>> {
    check_block(&lagged, &origin, cutoff)?;

    let mut product = fft.forward(lagged)?;
    let origin_spectrum = match mask {
        Some(mask) => {
            let masked = &origin * mask;
            fft.forward(masked.view())?
        }
        None => fft.forward(origin)?,
    };
    multiply_conjugate(&mut product, &origin_spectrum);

    let correlation = fft.inverse(product)?;
    let shifted = center_shift(correlation.view());
    crop_lags(shifted.view(), cutoff)
}
