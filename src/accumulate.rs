use ndarray::{ArrayD, IxDyn};

use crate::error::{CorrelationError, Result};

#[derive(Clone, Debug)]
pub struct LagCounts {
    counts: ArrayD<f64>,
    contributions: usize,
}

impl LagCounts {
    pub fn new(ndim: usize, cutoff: usize) -> Self {
        let span = 2 * cutoff + 1;
        Self {
            counts: ArrayD::zeros(IxDyn(&vec![span; ndim])),
            contributions: 0,
        }
    }

    pub fn contributions(&self) -> usize {
        self.contributions
    }

    pub fn counts(&self) -> &ArrayD<f64> {
        &self.counts
    }

    pub fn accumulate(&mut self, contribution: &ArrayD<f64>) -> Result<()> {
        self.add_counts(contribution)?;
        self.contributions += 1;
        Ok(())
    }

    pub fn merge(&mut self, other: LagCounts) -> Result<()> {
        self.add_counts(&other.counts)?;
        self.contributions += other.contributions;
        Ok(())
    }

    fn add_counts(&mut self, contribution: &ArrayD<f64>) -> Result<()> {
        if contribution.shape() != self.counts.shape() {
            return Err(CorrelationError::ShapeMismatch {
                first: self.counts.shape().to_vec(),
                second: contribution.shape().to_vec(),
            });
        }
        self.counts += contribution;
        Ok(())
    }

    pub fn into_array(self) -> ArrayD<f64> {
        self.counts
    }
}
