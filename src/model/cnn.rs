//! CNN grade classifier
//!
//! A convolutional feature backbone followed by a single linear head. The
//! head is the only part sized to a stage's output space, so the same
//! backbone (optionally loaded from pretrained weights) serves both the
//! binary and the minor model.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};

use crate::utils::error::GradingError;

/// Anything that maps an image batch `[B, C, H, W]` to logits `[B, classes]`
///
/// The TTA ensembler and the two-stage predictor only need this much of a model.
pub trait GradeModel<B: Backend> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Configuration for [`GradeClassifier`]
#[derive(Config, Debug)]
pub struct GradeClassifierConfig {
    /// Width of the classifier head (2 for binary, N-1 for minor)
    #[config(default = "2")]
    pub num_outputs: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Base number of convolutional filters
    #[config(default = "32")]
    pub base_filters: usize,

    /// Width of the feature vector fed to the head
    #[config(default = "256")]
    pub feature_dim: usize,

    /// Dropout rate applied to the feature vector
    #[config(default = "0.3")]
    pub dropout_rate: f64,
}

/// Conv2d, BatchNorm, ReLU, MaxPool(2x2)
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Feature extractor: four conv blocks, global average pooling and a
/// projection to `feature_dim`
#[derive(Module, Debug)]
pub struct FeatureBackbone<B: Backend> {
    pub conv1: ConvBlock<B>,
    pub conv2: ConvBlock<B>,
    pub conv3: ConvBlock<B>,
    pub conv4: ConvBlock<B>,
    pub global_pool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
    pub dropout: Dropout,
}

impl<B: Backend> FeatureBackbone<B> {
    pub fn new(config: &GradeClassifierConfig, device: &B::Device) -> Self {
        let base = config.base_filters;

        Self {
            conv1: ConvBlock::new(config.in_channels, base, device),
            conv2: ConvBlock::new(base, base * 2, device),
            conv3: ConvBlock::new(base * 2, base * 4, device),
            conv4: ConvBlock::new(base * 4, base * 8, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(base * 8, config.feature_dim).init(device),
            dropout: DropoutConfig::new(config.dropout_rate).init(),
        }
    }

    /// `[B, C, H, W]` -> `[B, feature_dim]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(x);
        let x = self.conv2.forward(x);
        let x = self.conv3.forward(x);
        let x = self.conv4.forward(x);

        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.fc.forward(x);
        let x = Relu::new().forward(x);
        self.dropout.forward(x)
    }
}

/// Backbone plus replaceable linear head
#[derive(Module, Debug)]
pub struct GradeClassifier<B: Backend> {
    pub backbone: FeatureBackbone<B>,
    pub head: Linear<B>,
    num_outputs: usize,
    feature_dim: usize,
}

impl<B: Backend> GradeClassifier<B> {
    pub fn new(config: &GradeClassifierConfig, device: &B::Device) -> Self {
        Self {
            backbone: FeatureBackbone::new(config, device),
            head: LinearConfig::new(config.feature_dim, config.num_outputs).init(device),
            num_outputs: config.num_outputs,
            feature_dim: config.feature_dim,
        }
    }

    /// Full forward pass, gradients reach every parameter
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(x))
    }

    /// Forward pass with the backbone cut out of the autodiff graph
    pub fn forward_head_only(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(x).detach();
        self.head.forward(features)
    }

    /// Swap in a freshly initialised head of a different width
    pub fn with_head(mut self, num_outputs: usize, device: &B::Device) -> Self {
        self.head = LinearConfig::new(self.feature_dim, num_outputs).init(device);
        self.num_outputs = num_outputs;
        self
    }

    /// Replace the backbone weights with a pretrained record (`.mpk` file)
    pub fn load_backbone(
        mut self,
        path: &Path,
        device: &B::Device,
    ) -> crate::utils::error::Result<Self> {
        if !path.exists() {
            return Err(GradingError::PathNotFound(path.to_path_buf()));
        }
        self.backbone = self
            .backbone
            .load_file(path, &CompactRecorder::new(), device)
            .map_err(|e| GradingError::Model(format!("failed to load backbone {:?}: {:?}", path, e)))?;
        Ok(self)
    }

    /// Persist the whole classifier with burn's compact recorder
    pub fn save(&self, path: &Path) -> crate::utils::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.clone()
            .save_file(path, &CompactRecorder::new())
            .map_err(|e| GradingError::Model(format!("failed to save model {:?}: {:?}", path, e)))
    }

    /// Load a classifier saved by [`GradeClassifier::save`]
    pub fn load(
        config: &GradeClassifierConfig,
        path: &Path,
        device: &B::Device,
    ) -> crate::utils::error::Result<Self> {
        Self::new(config, device)
            .load_file(path, &CompactRecorder::new(), device)
            .map_err(|e| GradingError::Model(format!("failed to load model {:?}: {:?}", path, e)))
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }
}

impl<B: Backend> GradeModel<B> for GradeClassifier<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny_config(num_outputs: usize) -> GradeClassifierConfig {
        GradeClassifierConfig::new()
            .with_num_outputs(num_outputs)
            .with_base_filters(2)
            .with_feature_dim(8)
    }

    #[test]
    fn test_output_width_matches_head() {
        let device = Default::default();
        let model = GradeClassifier::<TestBackend>::new(&tiny_config(3), &device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 3]);
        assert_eq!(model.num_outputs(), 3);
    }

    #[test]
    fn test_with_head_resizes_output() {
        let device = Default::default();
        let model = GradeClassifier::<TestBackend>::new(&tiny_config(2), &device).with_head(4, &device);

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        assert_eq!(model.forward(input).dims(), [1, 4]);
        assert_eq!(model.num_outputs(), 4);
    }

    #[test]
    fn test_head_only_forward_blocks_backbone_gradients() {
        type AD = Autodiff<TestBackend>;
        let device = Default::default();
        let model = GradeClassifier::<AD>::new(&tiny_config(2), &device);

        let input = Tensor::<AD, 4>::random([2, 3, 16, 16], Distribution::Default, &device);
        let grads = model.forward_head_only(input).sum().backward();

        assert!(model.head.weight.val().grad(&grads).is_some());
        assert!(model.backbone.conv1.conv.weight.val().grad(&grads).is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let device = Default::default();
        let config = tiny_config(2);
        let model = GradeClassifier::<TestBackend>::new(&config, &device);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary_test.mpk");
        model.save(&path).unwrap();

        let loaded = GradeClassifier::<TestBackend>::load(&config, &path, &device).unwrap();
        let before: Vec<f32> = model.head.weight.val().into_data().iter::<f32>().collect();
        let after: Vec<f32> = loaded.head.weight.val().into_data().iter::<f32>().collect();
        // compact recorder stores half precision
        for (b, a) in before.iter().zip(after.iter()) {
            assert!((b - a).abs() < 1e-2);
        }
    }

    #[test]
    fn test_load_backbone_missing_file() {
        let device = Default::default();
        let model = GradeClassifier::<TestBackend>::new(&tiny_config(2), &device);
        let result = model.load_backbone(Path::new("/nonexistent/backbone"), &device);
        assert!(matches!(result, Err(GradingError::PathNotFound(_))));
    }
}
