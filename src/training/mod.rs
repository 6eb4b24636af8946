//! Training module: label remapping, ordinal loss, the stage trainer and the
//! per-group orchestrator

pub mod loss;
pub mod pipeline;
pub mod remap;
pub mod trainer;

pub use loss::{ordinal_distance, OrdinalLoss, OrdinalLossOutput};
pub use pipeline::{artifact_name, GroupOutcome, GroupReport, Orchestrator, RunReport};
pub use remap::{compose_prediction, remap, remap_label, unmap_minor, Stage, StageRemap};
pub use trainer::{EpochRecord, StageTrainer, TrainedStage, TrainerState};
