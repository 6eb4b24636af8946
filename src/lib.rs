//! # Joint Grading
//!
//! Two-stage ordinal classifier for severely imbalanced joint-damage grades,
//! built on the Burn framework.
//!
//! ## Features
//!
//! - **Two-stage decomposition**: a binary "majority grade or not" model and a
//!   minor model over the remaining grades
//! - **Ordinal loss**: cross-entropy weighted by the distance between the
//!   predicted and the true grade
//! - **Partial fine-tuning**: head-only training with a frozen backbone, then
//!   every parameter from a fixed epoch
//! - **Test-time augmentation**: rotations and flips summed at both stages
//!
//! ## Modules
//!
//! - `dataset`: Folder discovery, imbalance tables and Burn batching
//! - `model`: CNN classifier and pipeline configuration
//! - `training`: Label remapping, ordinal loss, stage trainer, orchestrator
//! - `inference`: TTA and the two-stage predictor
//! - `utils`: Errors, logging and metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use joint_grading::backend::{default_device, TrainingBackend};
//! use joint_grading::{Orchestrator, PipelineConfig};
//!
//! let config = PipelineConfig::load("pipeline.json".as_ref())?;
//! let report = Orchestrator::<TrainingBackend>::new(config, default_device()).run()?;
//! println!("{} groups trained", report.trained());
//! ```

pub mod backend;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use dataset::{ClassCounts, GradeBatch, GradeBatcher, GradeImageDataset, ImbalanceTable, Majority};
pub use inference::{EvaluationReport, TtaEnsembler, TwoStagePredictor};
pub use model::{GradeClassifier, GradeModel, ModelConfig, PipelineConfig, TrainingConfig};
pub use training::{Orchestrator, OrdinalLoss, RunReport, Stage, StageRemap, StageTrainer};
pub use utils::error::{GradingError, Result};
pub use utils::metrics::{ConfusionMatrix, Metrics};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
