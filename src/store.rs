use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;

use ndarray::{ArrayD, ArrayViewD, CowArray, IxDyn, Slice};

use crate::error::{CorrelationError, Result};

pub const DEFAULT_ARRAY: &str = "H1";
pub const CONTAINER_MARKERS: &[&str] = &[".fld"];

pub trait FieldStore {
    fn name(&self) -> &str;

    fn shape(&self) -> &[usize];

    fn read_block(&mut self, ranges: &[Range<usize>]) -> Result<ArrayD<f64>>;
}

pub(crate) fn check_ranges(shape: &[usize], ranges: &[Range<usize>]) -> Result<()> {
    if ranges.len() != shape.len() {
        return Err(CorrelationError::Dimensionality { ndim: ranges.len() });
    }
    for (axis, (range, &extent)) in ranges.iter().zip(shape).enumerate() {
        if range.start > range.end || range.end > extent {
            return Err(CorrelationError::OutOfRange {
                axis,
                start: range.start,
                end: range.end,
                extent,
            });
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct MemoryStore {
    name: String,
    data: ArrayD<f64>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, data: ArrayD<f64>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

impl FieldStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    fn read_block(&mut self, ranges: &[Range<usize>]) -> Result<ArrayD<f64>> {
        check_ranges(self.data.shape(), ranges)?;
        Ok(self
            .data
            .slice_each_axis(|desc| Slice::from(ranges[desc.axis.index()].clone()))
            .to_owned())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HaloPolicy {
    /// The stored field is the core; the halo is implicit zeros.
    #[default]
    ZeroPad,
    /// The stored field already carries its halo.
    Embedded,
}

impl HaloPolicy {
    pub fn logical_shape(self, stored: &[usize], cutoff: usize) -> Vec<usize> {
        match self {
            HaloPolicy::ZeroPad => stored.iter().map(|&n| n + 2 * cutoff).collect(),
            HaloPolicy::Embedded => stored.to_vec(),
        }
    }

    pub fn materialize(self, field: ArrayViewD<'_, f64>, cutoff: usize) -> CowArray<'_, f64, IxDyn> {
        match self {
            HaloPolicy::Embedded => CowArray::from(field),
            HaloPolicy::ZeroPad => {
                let shape = self.logical_shape(field.shape(), cutoff);
                let mut padded = ArrayD::<f64>::zeros(IxDyn(&shape));
                padded
                    .slice_each_axis_mut(|desc| {
                        Slice::from(cutoff..cutoff + field.len_of(desc.axis))
                    })
                    .assign(&field);
                CowArray::from(padded)
            }
        }
    }

    pub fn read_block(
        self,
        store: &mut dyn FieldStore,
        ranges: &[Range<usize>],
        cutoff: usize,
    ) -> Result<ArrayD<f64>> {
        let stored = store.shape().to_vec();
        check_ranges(&self.logical_shape(&stored, cutoff), ranges)?;
        if self == HaloPolicy::Embedded {
            return store.read_block(ranges);
        }

        let shape: Vec<usize> = ranges.iter().map(|r| r.end - r.start).collect();
        let mut block = ArrayD::<f64>::zeros(IxDyn(&shape));
        let mut stored_ranges = Vec::with_capacity(ranges.len());
        let mut placement = Vec::with_capacity(ranges.len());
        for (range, &extent) in ranges.iter().zip(&stored) {
            let lo = range.start.max(cutoff);
            let hi = range.end.min(cutoff + extent);
            if lo >= hi {
                return Ok(block);
            }
            stored_ranges.push(lo - cutoff..hi - cutoff);
            placement.push(lo - range.start..hi - range.start);
        }

        let inner = store.read_block(&stored_ranges)?;
        block
            .slice_each_axis_mut(|desc| Slice::from(placement[desc.axis.index()].clone()))
            .assign(&inner);
        Ok(block)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    pub container: PathBuf,
    pub array: String,
}

impl FieldRef {
    pub fn new(container: impl Into<PathBuf>, array: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            array: array.into(),
        }
    }

    /// Splits `"<path>.fld<array>"`; without a marker the whole string is the path.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.trim().is_empty() {
            return Err(CorrelationError::InvalidReference(reference.to_string()));
        }
        for marker in CONTAINER_MARKERS {
            if let Some(pos) = reference.find(marker) {
                let split = pos + marker.len();
                let suffix = reference[split..].trim_start_matches('/');
                let array = if suffix.is_empty() {
                    DEFAULT_ARRAY
                } else {
                    suffix
                };
                return Ok(Self::new(&reference[..split], array));
            }
        }
        Ok(Self::new(reference, DEFAULT_ARRAY))
    }
}

impl FromStr for FieldRef {
    type Err = CorrelationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container.display(), self.array)
    }
}
