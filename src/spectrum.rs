use std::collections::HashMap;
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};

use crate::error::{CorrelationError, Result};

const PARALLEL_PRODUCT_THRESHOLD: usize = 256 * 1024;

/// Planned N-dimensional DFT of a real field of fixed shape.
///
/// The last axis goes through a real-to-complex transform (half spectrum of
/// `n / 2 + 1` bins); every other axis through a complex transform.
pub struct FieldFft {
    shape: Vec<usize>,
    forward_r2c: Arc<dyn RealToComplex<f64>>,
    inverse_c2r: Arc<dyn ComplexToReal<f64>>,
    forward_c2c: Vec<Arc<dyn Fft<f64>>>,
    inverse_c2c: Vec<Arc<dyn Fft<f64>>>,
}

impl FieldFft {
    pub fn new(shape: &[usize]) -> Result<Self> {
        let mut planner_c2c = FftPlanner::new();
        let mut planner_r2c = RealFftPlanner::new();
        Self::with_planners(shape, &mut planner_c2c, &mut planner_r2c)
    }

    fn with_planners(
        shape: &[usize],
        planner_c2c: &mut FftPlanner<f64>,
        planner_r2c: &mut RealFftPlanner<f64>,
    ) -> Result<Self> {
        if !(2..=3).contains(&shape.len()) {
            return Err(CorrelationError::Dimensionality { ndim: shape.len() });
        }
        let (&last_len, leading) = shape
            .split_last()
            .ok_or(CorrelationError::Dimensionality { ndim: 0 })?;

        let forward_r2c = planner_r2c.plan_fft_forward(last_len);
        let inverse_c2r = planner_r2c.plan_fft_inverse(last_len);
        let forward_c2c = leading
            .iter()
            .map(|&len| planner_c2c.plan_fft_forward(len))
            .collect();
        let inverse_c2c = leading
            .iter()
            .map(|&len| planner_c2c.plan_fft_inverse(len))
            .collect();

        Ok(Self {
            shape: shape.to_vec(),
            forward_r2c,
            inverse_c2r,
            forward_c2c,
            inverse_c2c,
        })
    }

    pub fn spectrum_shape(&self) -> Vec<usize> {
        let mut shape = self.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = *last / 2 + 1;
        }
        shape
    }

    fn last_axis(&self) -> Axis {
        Axis(self.shape.len() - 1)
    }

    fn check_shape(&self, shape: &[usize]) -> Result<()> {
        if shape != self.shape.as_slice() {
            return Err(CorrelationError::ShapeMismatch {
                first: self.shape.clone(),
                second: shape.to_vec(),
            });
        }
        Ok(())
    }

    pub fn forward(&self, field: ArrayViewD<'_, f64>) -> Result<ArrayD<Complex<f64>>> {
        self.check_shape(field.shape())?;
        let last = self.last_axis();
        let mut spectrum = ArrayD::<Complex<f64>>::zeros(IxDyn(&self.spectrum_shape()));

        let mut input = self.forward_r2c.make_input_vec();
        let mut output = self.forward_r2c.make_output_vec();
        for (src, mut dst) in field
            .lanes(last)
            .into_iter()
            .zip(spectrum.lanes_mut(last))
        {
            for (slot, &value) in input.iter_mut().zip(src.iter()) {
                *slot = value;
            }
            self.forward_r2c.process(&mut input, &mut output)?;
            for (slot, &bin) in dst.iter_mut().zip(output.iter()) {
                *slot = bin;
            }
        }

        for (axis, fft) in self.forward_c2c.iter().enumerate() {
            transform_lanes(&mut spectrum, Axis(axis), fft.as_ref());
        }
        Ok(spectrum)
    }

    /// Inverse transform, scaled by `1 / N` so that `inverse(forward(x)) == x`.
    pub fn inverse(&self, mut spectrum: ArrayD<Complex<f64>>) -> Result<ArrayD<f64>> {
        self.check_shape_spectrum(spectrum.shape())?;
        for (axis, fft) in self.inverse_c2c.iter().enumerate() {
            transform_lanes(&mut spectrum, Axis(axis), fft.as_ref());
        }

        let last = self.last_axis();
        let last_len = self.shape[last.index()];
        let scale = 1.0 / self.shape.iter().product::<usize>() as f64;
        let mut field = ArrayD::<f64>::zeros(IxDyn(&self.shape));

        let mut input = self.inverse_c2r.make_input_vec();
        let mut output = self.inverse_c2r.make_output_vec();
        for (src, mut dst) in spectrum.lanes(last).into_iter().zip(field.lanes_mut(last)) {
            for (slot, &bin) in input.iter_mut().zip(src.iter()) {
                *slot = bin;
            }
            // DC and (for even lengths) Nyquist bins must be purely real for C2R.
            input[0].im = 0.0;
            if last_len % 2 == 0 {
                if let Some(nyquist) = input.last_mut() {
                    nyquist.im = 0.0;
                }
            }
            self.inverse_c2r.process(&mut input, &mut output)?;
            for (slot, &value) in dst.iter_mut().zip(output.iter()) {
                *slot = value * scale;
            }
        }
        Ok(field)
    }

    fn check_shape_spectrum(&self, shape: &[usize]) -> Result<()> {
        let expected = self.spectrum_shape();
        if shape != expected.as_slice() {
            return Err(CorrelationError::ShapeMismatch {
                first: expected,
                second: shape.to_vec(),
            });
        }
        Ok(())
    }
}

fn transform_lanes(spectrum: &mut ArrayD<Complex<f64>>, axis: Axis, fft: &dyn Fft<f64>) {
    let len = spectrum.len_of(axis);
    let mut buffer = vec![Complex::new(0.0, 0.0); len];
    let mut scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
    for mut lane in spectrum.lanes_mut(axis) {
        for (slot, &bin) in buffer.iter_mut().zip(lane.iter()) {
            *slot = bin;
        }
        fft.process_with_scratch(&mut buffer, &mut scratch);
        for (slot, &bin) in lane.iter_mut().zip(buffer.iter()) {
            *slot = bin;
        }
    }
}

pub fn multiply_conjugate(lhs: &mut ArrayD<Complex<f64>>, rhs: &ArrayD<Complex<f64>>) {
    debug_assert_eq!(lhs.shape(), rhs.shape());
    let zip = Zip::from(lhs).and(rhs);
    if rhs.len() >= PARALLEL_PRODUCT_THRESHOLD && rayon::current_thread_index().is_none() {
        zip.par_for_each(|a, b| *a *= b.conj());
    } else {
        zip.for_each(|a, b| *a *= b.conj());
    }
}

pub struct FieldFftPlanner {
    planner_c2c: FftPlanner<f64>,
    planner_r2c: RealFftPlanner<f64>,
    plans: HashMap<Vec<usize>, Arc<FieldFft>>,
}

impl FieldFftPlanner {
    pub fn new() -> Self {
        Self {
            planner_c2c: FftPlanner::new(),
            planner_r2c: RealFftPlanner::new(),
            plans: HashMap::new(),
        }
    }

    pub fn plan(&mut self, shape: &[usize]) -> Result<Arc<FieldFft>> {
        if let Some(plan) = self.plans.get(shape) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(FieldFft::with_planners(
            shape,
            &mut self.planner_c2c,
            &mut self.planner_r2c,
        )?);
        self.plans.insert(shape.to_vec(), Arc::clone(&plan));
        Ok(plan)
    }

    pub fn cached_shapes(&self) -> usize {
        self.plans.len()
    }
}

impl Default for FieldFftPlanner {
    fn default() -> Self {
        Self::new()
    }
}
