//! Inference module: test-time augmentation and the two-stage predictor
//!
//! Both run on the inference backend; models handed to them are expected to
//! come out of `AutodiffModule::valid` or `GradeClassifier::load`.

pub mod predictor;
pub mod tta;

pub use predictor::{EvaluationReport, TwoStagePredictor};
pub use tta::{hflip, rotate, rotation_map, Augmentation, TtaEnsembler, TTA_AUGMENTATIONS};
