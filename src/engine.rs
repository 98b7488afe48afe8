use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use ndarray::{ArrayD, ArrayViewD};

use crate::accumulate::LagCounts;
use crate::container::ContainerStore;
use crate::error::{CorrelationError, Result};
use crate::kernel::{core_mask, correlate_block};
use crate::spectrum::{FieldFft, FieldFftPlanner};
use crate::store::{FieldRef, FieldStore, HaloPolicy};
use crate::window::{WindowGrid, WindowPlan};

pub trait ProgressObserver {
    /// `first_window_secs` is the wall time of the first window, for ETA estimates.
    fn window_done(&mut self, completed: usize, total: usize, first_window_secs: f64);
}

impl<F> ProgressObserver for F
where
    F: FnMut(usize, usize, f64),
{
    fn window_done(&mut self, completed: usize, total: usize, first_window_secs: f64) {
        self(completed, total, first_window_secs)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CorrelationOptions {
    pub halo: HaloPolicy,
    pub cancel: Option<CancelToken>,
}

fn check_ndim(shape: &[usize]) -> Result<()> {
    let ndim = shape.len();
    if !(2..=3).contains(&ndim) {
        return Err(CorrelationError::Dimensionality { ndim });
    }
    Ok(())
}

fn check_same_shape(first: &[usize], second: &[usize]) -> Result<()> {
    if first != second {
        return Err(CorrelationError::ShapeMismatch {
            first: first.to_vec(),
            second: second.to_vec(),
        });
    }
    Ok(())
}

pub fn full_auto(field: ArrayViewD<'_, f64>, cutoff: usize, halo: HaloPolicy) -> Result<ArrayD<f64>> {
    check_ndim(field.shape())?;
    let logical = halo.materialize(field, cutoff);
    let fft = FieldFft::new(logical.shape())?;
    info!("full auto-correlation over {:?}", logical.shape());
    correlate_block(&fft, logical.view(), logical.view(), None, cutoff)
}

pub fn full_cross(
    field1: ArrayViewD<'_, f64>,
    field2: ArrayViewD<'_, f64>,
    cutoff: usize,
    halo: HaloPolicy,
) -> Result<ArrayD<f64>> {
    check_ndim(field1.shape())?;
    check_same_shape(field1.shape(), field2.shape())?;
    let lagged = halo.materialize(field1, cutoff);
    let origin = halo.materialize(field2, cutoff);
    let fft = FieldFft::new(lagged.shape())?;
    info!("full cross-correlation over {:?}", lagged.shape());
    correlate_block(&fft, lagged.view(), origin.view(), None, cutoff)
}

pub struct PatchedCorrelator<'o> {
    cutoff: usize,
    winmulti: usize,
    halo: HaloPolicy,
    cancel: Option<CancelToken>,
    observer: Option<&'o mut dyn ProgressObserver>,
}

impl<'o> PatchedCorrelator<'o> {
    pub fn new(cutoff: usize, winmulti: usize) -> Self {
        Self {
            cutoff,
            winmulti,
            halo: HaloPolicy::default(),
            cancel: None,
            observer: None,
        }
    }

    pub fn with_halo(mut self, halo: HaloPolicy) -> Self {
        self.halo = halo;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_observer(mut self, observer: &'o mut dyn ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn plan(&self, stored_shape: &[usize]) -> Result<Vec<WindowPlan>> {
        check_ndim(stored_shape)?;
        self.halo
            .logical_shape(stored_shape, self.cutoff)
            .into_iter()
            .enumerate()
            .map(|(axis, len)| WindowPlan::new(axis, len, self.cutoff, self.winmulti))
            .collect()
    }

    pub fn auto(&mut self, store: &mut dyn FieldStore) -> Result<ArrayD<f64>> {
        self.run(store, None)
    }

    /// `lagged` plays the role of field 1, `origin` of field 2.
    pub fn cross(
        &mut self,
        lagged: &mut dyn FieldStore,
        origin: &mut dyn FieldStore,
    ) -> Result<ArrayD<f64>> {
        check_same_shape(lagged.shape(), origin.shape())?;
        self.run(lagged, Some(origin))
    }

    fn run(
        &mut self,
        lagged: &mut dyn FieldStore,
        mut origin: Option<&mut dyn FieldStore>,
    ) -> Result<ArrayD<f64>> {
        let cutoff = self.cutoff;
        let plans = self.plan(lagged.shape())?;
        let grid = WindowGrid::new(&plans);
        let total = grid.total();
        info!(
            "{} windows over '{}' {:?} (cutoff {cutoff}, multiplier {})",
            total,
            lagged.name(),
            lagged.shape(),
            self.winmulti
        );
        if let Some(store) = origin.as_deref() {
            debug!("origin operand '{}'", store.name());
        }
        for plan in &plans {
            debug!("axis {} window cores {:?}", plan.axis(), plan.sizes());
        }

        let mut planner = FieldFftPlanner::new();
        let mut counts = LagCounts::new(plans.len(), cutoff);
        let started = Instant::now();
        let mut first_window_secs = 0.0;

        for (completed, window) in grid.enumerate() {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                info!("cancelled after {completed} of {total} windows");
                return Err(CorrelationError::Cancelled { completed, total });
            }
            debug!("window {:?} block {:?}", window.index, window.ranges);

            let lagged_block = self.halo.read_block(lagged, &window.ranges, cutoff)?;
            let origin_block = match origin.as_deref_mut() {
                Some(store) => Some(self.halo.read_block(store, &window.ranges, cutoff)?),
                None => None,
            };

            let shape = window.block_shape();
            let fft = planner.plan(&shape)?;
            let mask = core_mask(&shape, &window.core, cutoff);
            let origin_view = origin_block.as_ref().unwrap_or(&lagged_block).view();
            let contribution =
                correlate_block(&fft, lagged_block.view(), origin_view, Some(&mask), cutoff)?;
            counts.accumulate(&contribution)?;

            if completed == 0 {
                first_window_secs = started.elapsed().as_secs_f64();
            }
            if let Some(observer) = self.observer.as_deref_mut() {
                observer.window_done(completed + 1, total, first_window_secs);
            }
        }

        debug!(
            "{} windows in {:.3}s using {} FFT plans",
            counts.contributions(),
            started.elapsed().as_secs_f64(),
            planner.cached_shapes()
        );
        Ok(counts.into_array())
    }
}

#[derive(Clone, Debug)]
pub enum CorrelationRequest<'a> {
    FullAuto {
        field: ArrayViewD<'a, f64>,
    },
    FullCross {
        field1: ArrayViewD<'a, f64>,
        field2: ArrayViewD<'a, f64>,
    },
    PatchedAuto {
        field: FieldRef,
        winmulti: usize,
    },
    PatchedCross {
        field1: FieldRef,
        winmulti: usize,
        field2: FieldRef,
    },
}

pub fn compute_correlation(
    request: CorrelationRequest<'_>,
    cutoff: usize,
    options: &CorrelationOptions,
    observer: Option<&mut dyn ProgressObserver>,
) -> Result<ArrayD<f64>> {
    let cancelled = || options.cancel.as_ref().is_some_and(CancelToken::is_cancelled);
    match request {
        CorrelationRequest::FullAuto { field } => {
            if cancelled() {
                return Err(CorrelationError::Cancelled { completed: 0, total: 1 });
            }
            full_auto(field, cutoff, options.halo)
        }
        CorrelationRequest::FullCross { field1, field2 } => {
            if cancelled() {
                return Err(CorrelationError::Cancelled { completed: 0, total: 1 });
            }
            full_cross(field1, field2, cutoff, options.halo)
        }
        CorrelationRequest::PatchedAuto { field, winmulti } => {
            let mut store = ContainerStore::open(&field)?;
            patched(cutoff, winmulti, options, observer).auto(&mut store)
        }
        CorrelationRequest::PatchedCross {
            field1,
            winmulti,
            field2,
        } => {
            let mut lagged = ContainerStore::open(&field1)?;
            let mut origin = ContainerStore::open(&field2)?;
            patched(cutoff, winmulti, options, observer).cross(&mut lagged, &mut origin)
        }
    }
}

fn patched<'o>(
    cutoff: usize,
    winmulti: usize,
    options: &CorrelationOptions,
    observer: Option<&'o mut dyn ProgressObserver>,
) -> PatchedCorrelator<'o> {
    let mut correlator = PatchedCorrelator::new(cutoff, winmulti).with_halo(options.halo);
    if let Some(token) = &options.cancel {
        correlator = correlator.with_cancel(token.clone());
    }
    if let Some(observer) = observer {
        correlator = correlator.with_observer(observer);
    }
    correlator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::write_container;
    use crate::store::MemoryStore;
    use ndarray::{Dimension, IxDyn, Slice};

    fn pseudo_random(shape: &[usize], seed: usize) -> ArrayD<f64> {
        ArrayD::from_shape_fn(IxDyn(shape), |idx| {
            let flat = idx
                .slice()
                .iter()
                .fold(seed, |acc, &i| acc.wrapping_mul(37).wrapping_add(i + 3));
            ((flat.wrapping_mul(2_654_435_761) >> 9) % 89) as f64 / 11.0 - 4.0
        })
    }

    fn assert_close(got: &ArrayD<f64>, expected: &ArrayD<f64>) {
        assert_eq!(got.shape(), expected.shape());
        for (g, e) in got.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-8 * (1.0 + e.abs()), "{g} vs {e}");
        }
    }

    fn patched_auto(field: &ArrayD<f64>, cutoff: usize, winmulti: usize) -> Result<ArrayD<f64>> {
        let mut store = MemoryStore::new("field", field.clone());
        PatchedCorrelator::new(cutoff, winmulti).auto(&mut store)
    }

    #[test]
    fn full_auto_counts_pairs_of_a_constant_field() {
        let field = ArrayD::<f64>::ones(IxDyn(&[10, 10]));
        let counts = full_auto(field.view(), 1, HaloPolicy::ZeroPad).unwrap();
        assert_eq!(counts.shape(), &[3, 3]);
        assert!((counts[[1, 1]] - 100.0).abs() < 1e-9);
        for idx in [[0, 1], [1, 0], [1, 2], [2, 1]] {
            assert!((counts[idx] - 90.0).abs() < 1e-9);
        }
        for idx in [[0, 0], [0, 2], [2, 0], [2, 2]] {
            assert!((counts[idx] - 81.0).abs() < 1e-9);
        }
    }

    #[test]
    fn patched_matches_full_for_a_constant_field() {
        let field = ArrayD::<f64>::ones(IxDyn(&[10, 10]));
        let full = full_auto(field.view(), 1, HaloPolicy::ZeroPad).unwrap();
        for winmulti in [1, 2] {
            assert_close(&patched_auto(&field, 1, winmulti).unwrap(), &full);
        }
    }

    #[test]
    fn cross_correlation_follows_the_lag_convention() {
        let cutoff = 2usize;
        let field1 = pseudo_random(&[12, 12], 1);
        let field2 = pseudo_random(&[12, 12], 2);
        let full = full_cross(field1.view(), field2.view(), cutoff, HaloPolicy::ZeroPad).unwrap();

        // GG[c + k] = sum_x field2(x) * field1(x + k), zero outside the field
        let c = cutoff as isize;
        for k0 in -c..=c {
            for k1 in -c..=c {
                let mut sum = 0.0;
                for x0 in 0..12isize {
                    for x1 in 0..12isize {
                        let (y0, y1) = (x0 + k0, x1 + k1);
                        if (0..12).contains(&y0) && (0..12).contains(&y1) {
                            sum += field2[[x0 as usize, x1 as usize]]
                                * field1[[y0 as usize, y1 as usize]];
                        }
                    }
                }
                let got = full[[(k0 + c) as usize, (k1 + c) as usize]];
                assert!((got - sum).abs() < 1e-8, "lag ({k0},{k1}): {got} vs {sum}");
            }
        }

        let mut lagged = MemoryStore::new("field1", field1);
        let mut origin = MemoryStore::new("field2", field2);
        let patched = PatchedCorrelator::new(cutoff, 1)
            .cross(&mut lagged, &mut origin)
            .unwrap();
        assert_close(&patched, &full);
    }

    #[test]
    fn degenerate_axis_fails_before_any_window() {
        let field = ArrayD::<f64>::ones(IxDyn(&[10, 10]));
        let mut calls = 0usize;
        let mut observer = |_: usize, _: usize, _: f64| calls += 1;
        let mut store = MemoryStore::new("field", field);
        let err = PatchedCorrelator::new(1, 6)
            .with_observer(&mut observer)
            .auto(&mut store)
            .unwrap_err();
        assert!(matches!(
            err,
            CorrelationError::DegenerateAxis {
                axis: 0,
                core_length: 10,
                nominal: 12,
                count: 0
            }
        ));
        assert_eq!(calls, 0);
    }

    #[test]
    fn mismatched_cross_shapes_are_rejected() {
        let a = ArrayD::<f64>::ones(IxDyn(&[10, 10]));
        let b = ArrayD::<f64>::ones(IxDyn(&[10, 12]));
        assert!(matches!(
            full_cross(a.view(), b.view(), 1, HaloPolicy::ZeroPad),
            Err(CorrelationError::ShapeMismatch { .. })
        ));

        let mut lagged = MemoryStore::new("a", a);
        let mut origin = MemoryStore::new("b", b);
        assert!(matches!(
            PatchedCorrelator::new(1, 1).cross(&mut lagged, &mut origin),
            Err(CorrelationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn one_and_four_dimensional_fields_are_rejected() {
        let line = ArrayD::<f64>::ones(IxDyn(&[16]));
        assert!(matches!(
            full_auto(line.view(), 1, HaloPolicy::ZeroPad),
            Err(CorrelationError::Dimensionality { ndim: 1 })
        ));
        let hyper = ArrayD::<f64>::ones(IxDyn(&[4, 4, 4, 4]));
        assert!(matches!(
            patched_auto(&hyper, 1, 1),
            Err(CorrelationError::Dimensionality { ndim: 4 })
        ));
    }

    #[test]
    fn auto_correlation_is_point_symmetric() {
        let cutoff = 2usize;
        let field = pseudo_random(&[9, 11], 7);
        let counts = patched_auto(&field, cutoff, 1).unwrap();
        let span = 2 * cutoff;
        for i in 0..=span {
            for j in 0..=span {
                let a = counts[[i, j]];
                let b = counts[[span - i, span - j]];
                assert!((a - b).abs() < 1e-8, "({i},{j}): {a} vs {b}");
            }
        }
    }

    #[test]
    fn multiplier_does_not_change_2d_counts() {
        let field = pseudo_random(&[17, 13], 3);
        let full = full_auto(field.view(), 2, HaloPolicy::ZeroPad).unwrap();
        for winmulti in 1..=3 {
            assert_close(&patched_auto(&field, 2, winmulti).unwrap(), &full);
        }
    }

    #[test]
    fn multiplier_does_not_change_3d_counts() {
        let field = pseudo_random(&[7, 8, 9], 5);
        let full = full_auto(field.view(), 1, HaloPolicy::ZeroPad).unwrap();
        for winmulti in 1..=3 {
            assert_close(&patched_auto(&field, 1, winmulti).unwrap(), &full);
        }
    }

    #[test]
    fn multiplier_does_not_change_3d_cross_counts() {
        let field1 = pseudo_random(&[8, 7, 9], 31);
        let field2 = pseudo_random(&[8, 7, 9], 32);
        let full = full_cross(field1.view(), field2.view(), 1, HaloPolicy::ZeroPad).unwrap();
        for winmulti in 1..=3 {
            let mut lagged = MemoryStore::new("field1", field1.clone());
            let mut origin = MemoryStore::new("field2", field2.clone());
            let patched = PatchedCorrelator::new(1, winmulti)
                .cross(&mut lagged, &mut origin)
                .unwrap();
            assert_close(&patched, &full);
        }
    }

    #[test]
    fn zero_cutoff_is_the_field_dot_product() {
        let field1 = pseudo_random(&[7, 6], 41);
        let field2 = pseudo_random(&[7, 6], 42);
        let dot: f64 = field1.iter().zip(field2.iter()).map(|(a, b)| a * b).sum();

        let full = full_cross(field1.view(), field2.view(), 0, HaloPolicy::ZeroPad).unwrap();
        assert_eq!(full.shape(), &[1, 1]);
        assert!((full[[0, 0]] - dot).abs() < 1e-8);

        for winmulti in [1, 3] {
            let mut lagged = MemoryStore::new("field1", field1.clone());
            let mut origin = MemoryStore::new("field2", field2.clone());
            let patched = PatchedCorrelator::new(0, winmulti)
                .cross(&mut lagged, &mut origin)
                .unwrap();
            assert_close(&patched, &full);
        }

        let auto = patched_auto(&field1, 0, 2).unwrap();
        let power: f64 = field1.iter().map(|v| v * v).sum();
        assert!((auto[[0, 0]] - power).abs() < 1e-8);
    }

    #[test]
    fn full_embedded_rejects_fields_shorter_than_the_lag_span() {
        let field = ArrayD::<f64>::ones(IxDyn(&[6, 10]));
        assert!(matches!(
            full_auto(field.view(), 3, HaloPolicy::Embedded),
            Err(CorrelationError::BlockTooSmall {
                axis: 0,
                length: 6,
                required: 7
            })
        ));
    }

    #[test]
    fn embedded_halo_matches_zero_padded_interior() {
        let cutoff = 1usize;
        let interior = pseudo_random(&[8, 10], 9);
        let embedded = HaloPolicy::ZeroPad.materialize(interior.view(), cutoff).to_owned();
        assert_eq!(embedded.shape(), &[10, 12]);

        let expected = full_auto(interior.view(), cutoff, HaloPolicy::ZeroPad).unwrap();
        let full = full_auto(embedded.view(), cutoff, HaloPolicy::Embedded).unwrap();
        assert_close(&full, &expected);

        let mut store = MemoryStore::new("embedded", embedded);
        let patched = PatchedCorrelator::new(cutoff, 2)
            .with_halo(HaloPolicy::Embedded)
            .auto(&mut store)
            .unwrap();
        assert_close(&patched, &expected);
    }

    #[test]
    fn embedded_halo_only_counts_core_origins() {
        // nonzero halo values act as lag partners but never as origins
        let cutoff = 1usize;
        let field = pseudo_random(&[6, 7], 13);
        let core = field
            .slice_each_axis(|desc| Slice::from(cutoff..desc.len - cutoff))
            .to_owned();
        let mut store = MemoryStore::new("field", field.clone());
        let got = PatchedCorrelator::new(cutoff, 1)
            .with_halo(HaloPolicy::Embedded)
            .auto(&mut store)
            .unwrap();

        let c = cutoff as isize;
        for k0 in -c..=c {
            for k1 in -c..=c {
                let mut sum = 0.0;
                for x0 in 0..core.shape()[0] {
                    for x1 in 0..core.shape()[1] {
                        let y0 = (x0 as isize + c + k0) as usize;
                        let y1 = (x1 as isize + c + k1) as usize;
                        sum += core[[x0, x1]] * field[[y0, y1]];
                    }
                }
                let value = got[[(k0 + c) as usize, (k1 + c) as usize]];
                assert!((value - sum).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn observer_sees_every_window_in_order() {
        let field = ArrayD::<f64>::ones(IxDyn(&[10, 10]));
        let mut seen = Vec::new();
        let mut observer = |done: usize, total: usize, first: f64| {
            assert!(first >= 0.0);
            seen.push((done, total));
        };
        let mut store = MemoryStore::new("field", field);
        PatchedCorrelator::new(1, 1)
            .with_observer(&mut observer)
            .auto(&mut store)
            .unwrap();
        // 5 windows of core 2 per axis
        assert_eq!(seen.len(), 25);
        assert!(seen.iter().enumerate().all(|(i, &(d, t))| d == i + 1 && t == 25));
    }

    #[test]
    fn cancellation_stops_between_windows() {
        let field = ArrayD::<f64>::ones(IxDyn(&[10, 10]));
        let token = CancelToken::new();
        let trigger = token.clone();
        let mut observer = move |done: usize, _: usize, _: f64| {
            if done == 3 {
                trigger.cancel();
            }
        };
        let mut store = MemoryStore::new("field", field);
        let err = PatchedCorrelator::new(1, 1)
            .with_cancel(token.clone())
            .with_observer(&mut observer)
            .auto(&mut store)
            .unwrap_err();
        assert!(token.is_cancelled());
        assert!(matches!(
            err,
            CorrelationError::Cancelled {
                completed: 3,
                total: 25
            }
        ));
    }

    #[test]
    fn compute_correlation_reads_containers() {
        let path = std::env::temp_dir().join(format!("fieldcorr-engine-{}.fld", std::process::id()));
        let field1 = pseudo_random(&[9, 8], 21);
        let field2 = pseudo_random(&[9, 8], 22);
        write_container(&path, &[("H1", field1.view()), ("H2", field2.view())]).unwrap();

        let options = CorrelationOptions::default();
        let reference = |array: &str| FieldRef::new(&path, array);

        let auto = compute_correlation(
            CorrelationRequest::PatchedAuto {
                field: reference("H1"),
                winmulti: 2,
            },
            1,
            &options,
            None,
        )
        .unwrap();
        let expected = compute_correlation(
            CorrelationRequest::FullAuto {
                field: field1.view(),
            },
            1,
            &options,
            None,
        )
        .unwrap();
        assert_close(&auto, &expected);

        let mut windows = 0usize;
        let mut observer = |_: usize, _: usize, _: f64| windows += 1;
        let cross = compute_correlation(
            CorrelationRequest::PatchedCross {
                field1: reference("H1"),
                winmulti: 1,
                field2: reference("H2"),
            },
            1,
            &options,
            Some(&mut observer),
        )
        .unwrap();
        let expected = full_cross(field1.view(), field2.view(), 1, HaloPolicy::ZeroPad).unwrap();
        assert_close(&cross, &expected);
        assert!(windows > 0);

        let missing = compute_correlation(
            CorrelationRequest::PatchedAuto {
                field: reference("Missing"),
                winmulti: 1,
            },
            1,
            &options,
            None,
        );
        assert!(matches!(missing, Err(CorrelationError::StoreAccess { .. })));
        std::fs::remove_file(&path).ok();
    }
}
