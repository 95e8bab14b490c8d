//! Waveform analysis: automatic measurements and cross-channel correlation.

pub mod correlation;
pub mod measurements;

pub use correlation::{cross_correlate, pearson, Alignment};
pub use measurements::{measure, MeasurementKind};
