//! Dataset module: folder discovery, imbalance tables and burn batching

pub mod burn_dataset;
pub mod imbalance;
pub mod loader;

pub use burn_dataset::{make_batches, GradeBatch, GradeBatcher, GradeImageDataset, GradeItem};
pub use imbalance::{classify, ClassCounts, ImbalanceTable, Majority};
pub use loader::{GroupImageFolder, ImageSample};
