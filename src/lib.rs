//! Memory-bounded FFT two-point correlation of 2D and 3D fields.
//!
//! A field is either transformed in one piece ([`engine::full_auto`],
//! [`engine::full_cross`]) or streamed through the
//! [`engine::PatchedCorrelator`], which partitions every axis into windows
//! and only ever holds one halo-padded block per operand in memory. Both
//! paths return lag counts of shape `(2 * cutoff + 1)` per axis.

pub mod accumulate;
pub mod container;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod report;
pub mod spectrum;
pub mod store;
pub mod window;

pub use engine::{
    compute_correlation, CancelToken, CorrelationOptions, CorrelationRequest, PatchedCorrelator,
    ProgressObserver,
};
pub use error::{CorrelationError, Result};
pub use store::{FieldRef, FieldStore, HaloPolicy, MemoryStore};
