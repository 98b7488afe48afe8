use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("Incorrect Number of Dimensions! expected 2 or 3 axes, found {ndim}")]
    Dimensionality { ndim: usize },

    #[error("field shapes differ: {first:?} vs {second:?}")]
    ShapeMismatch {
        first: Vec<usize>,
        second: Vec<usize>,
    },

    #[error(
        "axis {axis} yields {count} windows: core length {core_length} is shorter than the window extent {nominal}"
    )]
    DegenerateAxis {
        axis: usize,
        core_length: usize,
        nominal: usize,
        count: usize,
    },

    #[error("axis {axis} has length {length}; at least 2*cutoff+1 = {required} cells are needed")]
    BlockTooSmall {
        axis: usize,
        length: usize,
        required: usize,
    },

    #[error("extraction range {start}..{end} on axis {axis} exceeds extent {extent}")]
    OutOfRange {
        axis: usize,
        start: usize,
        end: usize,
        extent: usize,
    },

    #[error("failed to read array '{array}' over {range}: {source}")]
    StoreAccess {
        array: String,
        range: String,
        #[source]
        source: io::Error,
    },

    #[error("window multiplier must be at least 1")]
    InvalidMultiplier,

    #[error("invalid field reference '{0}'")]
    InvalidReference(String),

    #[error("container '{path}' is malformed: {reason}")]
    MalformedContainer { path: PathBuf, reason: String },

    #[error("run cancelled after {completed} of {total} windows")]
    Cancelled { completed: usize, total: usize },

    #[error(transparent)]
    Fft(#[from] realfft::FftError),
}

pub type Result<T> = std::result::Result<T, CorrelationError>;

impl CorrelationError {
    pub(crate) fn store(array: &str, range: impl Into<String>, source: io::Error) -> Self {
        Self::StoreAccess {
            array: array.to_string(),
            range: range.into(),
            source,
        }
    }
}

pub(crate) fn format_ranges(ranges: &[std::ops::Range<usize>]) -> String {
    let parts: Vec<String> = ranges
        .iter()
        .map(|r| format!("{}..{}", r.start, r.end))
        .collect();
    format!("[{}]", parts.join(", "))
}
