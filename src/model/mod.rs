//! Model module: the grade classifier and pipeline configuration
//!
//! Both stage models share one architecture: a convolutional feature
//! backbone and a linear head sized to the stage's output space.

pub mod cnn;
pub mod config;

pub use cnn::{GradeClassifier, GradeClassifierConfig, GradeModel};
pub use config::{DataConfig, ModelConfig, PipelineConfig, TrainingConfig};
