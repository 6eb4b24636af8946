//! Pipeline Configuration
//!
//! Serde configuration for the model, the stage trainer, the data layout and
//! the output directory. Stored as JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::cnn::GradeClassifierConfig;
use crate::utils::error::{GradingError, Result};

/// Epoch at which the backbone becomes trainable
pub const DEFAULT_UNFREEZE_EPOCH: usize = 20;

/// Backbone / head configuration shared by both stage models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input image size (width and height, assumed square)
    pub image_size: usize,

    /// Number of input channels (3 for RGB)
    pub in_channels: usize,

    /// Base number of convolutional filters
    pub base_filters: usize,

    /// Width of the backbone feature vector
    pub feature_dim: usize,

    /// Dropout rate for regularization (0.0 to 1.0)
    pub dropout_rate: f64,

    /// Pretrained backbone weights (burn compact record)
    pub pretrained_backbone: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            in_channels: 3,
            base_filters: 32,
            feature_dim: 256,
            dropout_rate: 0.3,
            pretrained_backbone: None,
        }
    }
}

impl ModelConfig {
    /// Classifier config with a head of `num_outputs` logits
    pub fn classifier(&self, num_outputs: usize) -> GradeClassifierConfig {
        GradeClassifierConfig::new()
            .with_num_outputs(num_outputs)
            .with_in_channels(self.in_channels)
            .with_base_filters(self.base_filters)
            .with_feature_dim(self.feature_dim)
            .with_dropout_rate(self.dropout_rate)
    }

    pub fn validate(&self) -> Result<()> {
        // four 2x2 max-pools
        if self.image_size < 16 || self.image_size % 16 != 0 {
            return Err(GradingError::Config(
                "image_size must be a positive multiple of 16".to_string(),
            ));
        }
        if self.dropout_rate < 0.0 || self.dropout_rate >= 1.0 {
            return Err(GradingError::Config(
                "dropout_rate must be in range [0.0, 1.0)".to_string(),
            ));
        }
        if self.base_filters == 0 || self.feature_dim == 0 {
            return Err(GradingError::Config(
                "base_filters and feature_dim must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stage trainer hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs per stage
    pub num_epochs: usize,

    /// Epoch at which every parameter becomes trainable
    pub unfreeze_epoch: usize,

    /// Batch size for training and validation
    pub batch_size: usize,

    /// Adam learning rate
    pub learning_rate: f64,

    /// Weight decay (L2 regularization)
    pub weight_decay: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 30,
            unfreeze_epoch: DEFAULT_UNFREEZE_EPOCH,
            batch_size: 16,
            learning_rate: 1e-4,
            weight_decay: 1e-4,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(GradingError::Config("num_epochs must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(GradingError::Config("batch_size must be at least 1".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(GradingError::Config("learning_rate must be positive".to_string()));
        }
        Ok(())
    }
}

/// On-disk layout of the grading data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root holding one directory per label group
    pub data_root: PathBuf,

    /// CSV tables (`group,class,count`) used for majority detection
    pub imbalance_tables: Vec<PathBuf>,

    /// Suffix of the majority-excluded sibling directory of each group
    pub minor_suffix: String,

    /// Name of the training split directory
    pub train_split: String,

    /// Name of the validation split directory
    pub val_split: String,

    /// Restrict the run to these groups (empty = every group in the tables)
    pub groups: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/joints"),
            imbalance_tables: vec![
                PathBuf::from("data/narrowing_counts.csv"),
                PathBuf::from("data/erosion_counts.csv"),
            ],
            minor_suffix: "_minor".to_string(),
            train_split: "train".to_string(),
            val_split: "val".to_string(),
            groups: Vec::new(),
        }
    }
}

/// Top-level configuration of a grading run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
    /// Where artifacts and the run report are written
    pub output_dir: PathBuf,
    /// Seed for shuffling the training set
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            data: DataConfig::default(),
            output_dir: PathBuf::from("output/models"),
            seed: 42,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        if self.data.imbalance_tables.is_empty() {
            return Err(GradingError::Config(
                "at least one imbalance table is required".to_string(),
            ));
        }
        if self.data.minor_suffix.is_empty() {
            return Err(GradingError::Config("minor_suffix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GradingError::PathNotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.training.unfreeze_epoch, 20);
        assert_eq!(config.data.minor_suffix, "_minor");
    }

    #[test]
    fn test_model_config_validation() {
        let mut config = ModelConfig::default();
        config.image_size = 100;
        assert!(config.validate().is_err());

        config = ModelConfig::default();
        config.dropout_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_training_config_validation() {
        let mut config = TrainingConfig::default();
        config.num_epochs = 0;
        assert!(config.validate().is_err());

        config = TrainingConfig::default();
        config.learning_rate = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_classifier_config_carries_head_width() {
        let model = ModelConfig::default();
        let classifier = model.classifier(3);
        assert_eq!(classifier.num_outputs, 3);
        assert_eq!(classifier.feature_dim, model.feature_dim);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");

        let mut config = PipelineConfig::default();
        config.training.num_epochs = 7;
        config.data.groups = vec!["RH_mcp3_narrowing".to_string()];
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.training.num_epochs, 7);
        assert_eq!(loaded.data.groups, config.data.groups);
    }

    #[test]
    fn test_load_missing_file() {
        let result = PipelineConfig::load(Path::new("/nonexistent/pipeline.json"));
        assert!(matches!(result, Err(GradingError::PathNotFound(_))));
    }
}
