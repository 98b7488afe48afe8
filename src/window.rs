use std::ops::Range;

use crate::error::{CorrelationError, Result};

/// Splits `core_length` into windows of nominal extent `winmulti * (cutoff + 1)`.
///
/// Every window receives an equal share of the division remainder and the
/// last window absorbs whatever is left over, so the sizes always sum to
/// `core_length`.
pub fn plan_axis(
    axis: usize,
    core_length: usize,
    cutoff: usize,
    winmulti: usize,
) -> Result<Vec<usize>> {
    if winmulti == 0 {
        return Err(CorrelationError::InvalidMultiplier);
    }
    let nominal = winmulti * (cutoff + 1);
    let count = core_length / nominal;
    if count < 1 {
        return Err(CorrelationError::DegenerateAxis {
            axis,
            core_length,
            nominal,
            count,
        });
    }

    let remainder = core_length % nominal;
    let buffer = remainder / count;
    let leftover = remainder - buffer * count;

    let mut sizes = vec![nominal + buffer; count];
    if let Some(last) = sizes.last_mut() {
        *last += leftover;
    }
    Ok(sizes)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowPlan {
    axis: usize,
    cutoff: usize,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
}

impl WindowPlan {
    pub fn new(axis: usize, logical_length: usize, cutoff: usize, winmulti: usize) -> Result<Self> {
        let core_length = logical_length.saturating_sub(2 * cutoff);
        let sizes = plan_axis(axis, core_length, cutoff, winmulti)?;
        let offsets = sizes
            .iter()
            .scan(0usize, |acc, &size| {
                let start = *acc;
                *acc += size;
                Some(start)
            })
            .collect();
        Ok(Self {
            axis,
            cutoff,
            sizes,
            offsets,
        })
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn core_length(&self) -> usize {
        self.sizes.iter().sum()
    }

    pub fn logical_length(&self) -> usize {
        self.core_length() + 2 * self.cutoff
    }

    /// Half-open logical range of the block for window `index`, halo included.
    ///
    /// The 1-based inclusive form `[start + 1, end]` is the same range.
    pub fn block_range(&self, index: usize) -> Range<usize> {
        let start = self.offsets[index];
        start..start + self.sizes[index] + 2 * self.cutoff
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Window {
    pub index: Vec<usize>,
    pub core: Vec<usize>,
    pub ranges: Vec<Range<usize>>,
}

impl Window {
    pub fn block_shape(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.end - r.start).collect()
    }
}

#[derive(Clone, Debug)]
pub struct WindowGrid<'a> {
    plans: &'a [WindowPlan],
    position: usize,
    total: usize,
}

impl<'a> WindowGrid<'a> {
    pub fn new(plans: &'a [WindowPlan]) -> Self {
        let total = if plans.is_empty() {
            0
        } else {
            plans.iter().map(WindowPlan::len).product()
        };
        Self {
            plans,
            position: 0,
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn window_at(&self, mut position: usize) -> Window {
        let ndim = self.plans.len();
        let mut index = vec![0usize; ndim];
        for (axis, plan) in self.plans.iter().enumerate().rev() {
            index[axis] = position % plan.len();
            position /= plan.len();
        }
        let core = index
            .iter()
            .zip(self.plans)
            .map(|(&i, plan)| plan.sizes()[i])
            .collect();
        let ranges = index
            .iter()
            .zip(self.plans)
            .map(|(&i, plan)| plan.block_range(i))
            .collect();
        Window {
            index,
            core,
            ranges,
        }
    }
}

impl Iterator for WindowGrid<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.position >= self.total {
            return None;
        }
        let window = self.window_at(self.position);
        self.position += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WindowGrid<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_sums_to_core_length_and_stays_positive() {
        for core_length in 1..120 {
            for cutoff in 0..5 {
                for winmulti in 1..5 {
                    match plan_axis(0, core_length, cutoff, winmulti) {
                        Ok(sizes) => {
                            assert!(!sizes.is_empty());
                            assert!(sizes.iter().all(|&s| s >= 1));
                            assert_eq!(sizes.iter().sum::<usize>(), core_length);
                            let nominal = winmulti * (cutoff + 1);
                            let head = sizes[0];
                            assert!(head >= nominal);
                            assert!(sizes[..sizes.len() - 1].iter().all(|&s| s == head));
                        }
                        Err(CorrelationError::DegenerateAxis { count, .. }) => {
                            assert_eq!(count, 0);
                            assert!(core_length < winmulti * (cutoff + 1));
                        }
                        Err(other) => panic!("unexpected error {other}"),
                    }
                }
            }
        }
    }

    #[test]
    fn plan_exact_division_has_no_buffer() {
        assert_eq!(plan_axis(0, 12, 1, 2).unwrap(), vec![4, 4, 4]);
    }

    #[test]
    fn plan_small_remainder_goes_to_last_window() {
        // nominal 4, count 5, remainder 3, buffer 0
        assert_eq!(plan_axis(0, 23, 1, 2).unwrap(), vec![4, 4, 4, 4, 7]);
    }

    #[test]
    fn plan_distributes_buffer_before_leftover() {
        // nominal 5, count 2, remainder 3, buffer 1, leftover 1
        assert_eq!(plan_axis(0, 13, 4, 1).unwrap(), vec![6, 7]);
        // nominal 5, count 2, remainder 4, buffer 2, leftover 0
        assert_eq!(plan_axis(0, 14, 4, 1).unwrap(), vec![7, 7]);
    }

    #[test]
    fn plan_rejects_short_axis() {
        let err = plan_axis(2, 10, 1, 6).unwrap_err();
        match err {
            CorrelationError::DegenerateAxis {
                axis,
                core_length,
                nominal,
                count,
            } => {
                assert_eq!((axis, core_length, nominal, count), (2, 10, 12, 0));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn plan_rejects_zero_multiplier() {
        assert!(matches!(
            plan_axis(0, 10, 1, 0),
            Err(CorrelationError::InvalidMultiplier)
        ));
    }

    #[test]
    fn block_ranges_tile_the_core_with_halo() {
        let plan = WindowPlan::new(0, 25, 1, 2).unwrap();
        assert_eq!(plan.sizes(), &[4, 4, 4, 4, 7]);
        assert_eq!(plan.block_range(0), 0..6);
        assert_eq!(plan.block_range(1), 4..10);
        assert_eq!(plan.block_range(4), 16..25);
        assert_eq!(plan.logical_length(), 25);
        for i in 1..plan.len() {
            // core of window i starts where core of window i-1 ends
            let prev = plan.block_range(i - 1);
            let cur = plan.block_range(i);
            assert_eq!(prev.end - 2, cur.start);
        }
    }

    #[test]
    fn grid_enumerates_cartesian_product_row_major() {
        let plans = vec![
            WindowPlan::new(0, 8, 1, 2).unwrap(),
            WindowPlan::new(1, 14, 1, 2).unwrap(),
        ];
        assert_eq!(plans[0].len(), 1);
        assert_eq!(plans[1].len(), 3);
        let grid = WindowGrid::new(&plans);
        assert_eq!(grid.len(), 3);
        let indices: Vec<Vec<usize>> = grid.clone().map(|w| w.index).collect();
        assert_eq!(indices, vec![vec![0, 0], vec![0, 1], vec![0, 2]]);

        let last = WindowGrid::new(&plans).last().unwrap();
        assert_eq!(last.core, vec![6, 4]);
        assert_eq!(last.ranges, vec![0..8, 8..14]);
        assert_eq!(last.block_shape(), vec![8, 6]);
    }

    #[test]
    fn grid_restarts_from_a_fresh_instance() {
        let plans = vec![
            WindowPlan::new(0, 10, 1, 1).unwrap(),
            WindowPlan::new(1, 10, 1, 1).unwrap(),
            WindowPlan::new(2, 6, 1, 1).unwrap(),
        ];
        let first: Vec<Window> = WindowGrid::new(&plans).collect();
        let second: Vec<Window> = WindowGrid::new(&plans).collect();
        assert_eq!(first.len(), 4 * 4 * 2);
        assert_eq!(first, second);
    }
}
