//! Count cleaning and validation.
//!
//! This module turns raw lane-level count rows into one validated total per
//! site, timestamp and direction: threshold checks, missing-day detection,
//! a validity verdict, statistical outlier warnings and a status label.

pub mod aggregate;
pub mod engine;
pub mod normalize;
pub mod types;
pub mod utility;

pub use engine::CleaningEngine;
pub use types::{CleanedDataset, CleanedObservation, RawObservation, Status};
