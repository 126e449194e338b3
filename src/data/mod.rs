//! Measurement datasets and their persistence.

pub mod buffer;
pub mod writer;

pub use buffer::{Array3, ResultDataset, SweepResultBuffer};
pub use writer::{JsonResultWriter, ResultWriter};
