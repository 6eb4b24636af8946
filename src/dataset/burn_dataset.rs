//! Burn Dataset / Batcher integration for graded joint images
//!
//! Items carry the raw class index of their folder; stage remapping happens
//! later, inside the trainer and predictor.

use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::imageops::FilterType;
use image::ImageReader;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::utils::error::{GradingError, Result};

/// ImageNet normalization mean values (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet normalization std values (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One decoded image with its raw grade
#[derive(Clone, Debug)]
pub struct GradeItem {
    /// CHW float image in [0, 1], length `3 * H * W`
    pub image: Vec<f32>,
    /// Raw class index
    pub label: usize,
    pub path: String,
}

impl GradeItem {
    /// Decode, resize and convert an image file to CHW floats
    pub fn from_path(path: &Path, label: usize, image_size: usize) -> Result<Self> {
        let img = ImageReader::open(path)
            .map_err(|e| GradingError::ImageLoad(path.to_path_buf(), e.to_string()))?
            .decode()
            .map_err(|e| GradingError::ImageLoad(path.to_path_buf(), e.to_string()))?
            .resize_exact(image_size as u32, image_size as u32, FilterType::Triangle)
            .to_rgb8();

        let plane = image_size * image_size;
        let mut image = vec![0.0f32; 3 * plane];
        for (i, pixel) in img.pixels().enumerate() {
            image[i] = pixel[0] as f32 / 255.0;
            image[plane + i] = pixel[1] as f32 / 255.0;
            image[2 * plane + i] = pixel[2] as f32 / 255.0;
        }

        Ok(Self {
            image,
            label,
            path: path.to_string_lossy().to_string(),
        })
    }

    pub fn from_data(image: Vec<f32>, label: usize, path: String) -> Self {
        Self { image, label, path }
    }
}

/// In-memory dataset of decoded grade images
#[derive(Debug, Clone)]
pub struct GradeImageDataset {
    items: Vec<GradeItem>,
}

impl GradeImageDataset {
    /// Decode every sample up front (in parallel); unreadable files are skipped with a warning
    pub fn new_cached(samples: &[(PathBuf, usize)], image_size: usize) -> Self {
        let pb = ProgressBar::new(samples.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                .map(|style| style.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let items: Vec<GradeItem> = samples
            .par_iter()
            .filter_map(|(path, label)| {
                let item = GradeItem::from_path(path, *label, image_size);
                pb.inc(1);
                match item {
                    Ok(item) => Some(item),
                    Err(e) => {
                        warn!("skipping {}", e);
                        None
                    }
                }
            })
            .collect();

        pb.finish_and_clear();
        info!("Loaded {}/{} images", items.len(), samples.len());

        Self { items }
    }

    pub fn from_items(items: Vec<GradeItem>) -> Self {
        Self { items }
    }

    /// Number of items per raw class index
    pub fn class_distribution(&self) -> Vec<usize> {
        let num_classes = self.items.iter().map(|i| i.label + 1).max().unwrap_or(0);
        let mut counts = vec![0usize; num_classes];
        for item in &self.items {
            counts[item.label] += 1;
        }
        counts
    }
}

impl Dataset<GradeItem> for GradeImageDataset {
    fn get(&self, index: usize) -> Option<GradeItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A batch of images with raw grade targets
#[derive(Clone, Debug)]
pub struct GradeBatch<B: Backend> {
    /// `[batch_size, 3, height, width]`, ImageNet-normalized
    pub images: Tensor<B, 4>,
    /// `[batch_size]` raw class indices
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> GradeBatch<B> {
    /// Raw labels copied to the host
    pub fn labels(&self) -> Vec<usize> {
        tensor_to_indices(self.targets.clone())
    }

    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copy an integer tensor of class indices to the host
pub fn tensor_to_indices<B: Backend>(tensor: Tensor<B, 1, Int>) -> Vec<usize> {
    tensor
        .into_data()
        .iter::<i64>()
        .map(|v| v as usize)
        .collect()
}

/// Build an integer target tensor from host labels
pub fn indices_to_tensor<B: Backend>(labels: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(data, [labels.len()]), device)
}

/// Batcher producing [`GradeBatch`]es on a fixed device
#[derive(Clone, Debug)]
pub struct GradeBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> GradeBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<GradeItem, GradeBatch<B>> for GradeBatcher<B> {
    fn batch(&self, items: Vec<GradeItem>) -> GradeBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, size, size]),
            &self.device,
        );

        let mean = Tensor::<B, 4>::from_floats(
            TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]),
            &self.device,
        );
        let std = Tensor::<B, 4>::from_floats(
            TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]),
            &self.device,
        );
        let images = (images - mean) / std;

        let labels: Vec<usize> = items.iter().map(|item| item.label).collect();
        let targets = indices_to_tensor::<B>(&labels, &self.device);

        GradeBatch { images, targets }
    }
}

/// Materialize a dataset into batches, optionally shuffling the sample order first
pub fn make_batches<B: Backend>(
    dataset: &GradeImageDataset,
    batcher: &GradeBatcher<B>,
    batch_size: usize,
    rng: Option<&mut ChaCha8Rng>,
) -> Vec<GradeBatch<B>> {
    let mut indices: Vec<usize> = (0..dataset.len()).collect();
    if let Some(rng) = rng {
        indices.shuffle(rng);
    }

    indices
        .chunks(batch_size.max(1))
        .map(|chunk| {
            let items: Vec<GradeItem> = chunk.iter().filter_map(|&i| dataset.get(i)).collect();
            batcher.batch(items)
        })
        .filter(|batch| !batch.is_empty())
        .collect()
}
