//! Two-stage predictor
//!
//! The binary model decides "majority or not". Images it routes away from
//! the majority class go through the minor model, whose arg-max is mapped
//! back to a raw grade.

use std::marker::PhantomData;
use std::path::Path;

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::burn_dataset::{tensor_to_indices, GradeBatch};
use crate::inference::tta::TtaEnsembler;
use crate::model::cnn::{GradeClassifier, GradeModel};
use crate::model::config::ModelConfig;
use crate::training::remap::{compose_prediction, Stage, MAJORITY_INDEX};
use crate::utils::error::Result;
use crate::utils::metrics::{batch_accuracy, micro_f1, Metrics, RunningAverage};

/// Validation results of a two-stage model pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Mean of per-batch exact-match rates
    pub accuracy: f64,
    pub accuracy_tta: f64,
    /// Micro F1 over every prediction of the set
    pub f1: f64,
    pub f1_tta: f64,
    pub samples: usize,
    /// Per-class breakdown of the TTA predictions
    pub metrics_tta: Metrics,
}

/// Binary and minor model of one label group
pub struct TwoStagePredictor<B: Backend, M: GradeModel<B>> {
    binary: M,
    minor: M,
    majority_class: usize,
    tta: TtaEnsembler,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: GradeModel<B>> TwoStagePredictor<B, M> {
    pub fn new(binary: M, minor: M, majority_class: usize) -> Self {
        Self {
            binary,
            minor,
            majority_class,
            tta: TtaEnsembler::new(),
            _backend: PhantomData,
        }
    }

    pub fn majority_class(&self) -> usize {
        self.majority_class
    }

    pub fn binary(&self) -> &M {
        &self.binary
    }

    pub fn minor(&self) -> &M {
        &self.minor
    }

    /// Raw grade per image, single forward pass per stage
    pub fn predict(&self, images: Tensor<B, 4>) -> Result<Vec<usize>> {
        let binary_logits = self.binary.logits(images.clone());
        self.route(binary_logits, images, false)
    }

    /// Raw grade per image with a TTA ensemble at both stages
    pub fn predict_tta(&self, images: Tensor<B, 4>) -> Result<Vec<usize>> {
        let base = self.binary.logits(images.clone());
        let binary_logits = self.tta.augment_predict(base, images.clone(), &self.binary);
        self.route(binary_logits, images, true)
    }

    fn route(&self, binary_logits: Tensor<B, 2>, images: Tensor<B, 4>, tta: bool) -> Result<Vec<usize>> {
        let binary = tensor_to_indices(binary_logits.argmax(1).squeeze::<1>(1));

        let routed: Vec<usize> = binary
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != MAJORITY_INDEX)
            .map(|(i, _)| i)
            .collect();

        let mut minor: Vec<Option<usize>> = vec![None; binary.len()];
        if !routed.is_empty() {
            let device = images.device();
            let index = Tensor::<B, 1, Int>::from_data(
                TensorData::new(routed.iter().map(|&i| i as i64).collect::<Vec<_>>(), [routed.len()]),
                &device,
            );
            let minor_images = images.select(0, index);
            let base = self.minor.logits(minor_images.clone());
            let minor_logits = if tta {
                self.tta.augment_predict(base, minor_images, &self.minor)
            } else {
                base
            };
            let predictions = tensor_to_indices(minor_logits.argmax(1).squeeze::<1>(1));
            for (&slot, prediction) in routed.iter().zip(predictions) {
                minor[slot] = Some(prediction);
            }
        }

        binary
            .iter()
            .zip(minor)
            .map(|(&b, m)| compose_prediction(b, m, self.majority_class))
            .collect()
    }

    /// Score both prediction modes over labelled batches of raw grades
    pub fn evaluate(&self, batches: &[GradeBatch<B>]) -> Result<EvaluationReport> {
        let mut accuracy = RunningAverage::new();
        let mut accuracy_tta = RunningAverage::new();
        let mut truth = Vec::new();
        let mut predictions = Vec::new();
        let mut predictions_tta = Vec::new();

        for (i, batch) in batches.iter().enumerate() {
            let labels = batch.labels();
            let plain = self.predict(batch.images.clone())?;
            let augmented = self.predict_tta(batch.images.clone())?;

            accuracy.add(batch_accuracy(&plain, &labels));
            accuracy_tta.add(batch_accuracy(&augmented, &labels));
            debug!("batch {}: {} samples", i, labels.len());

            truth.extend(labels);
            predictions.extend(plain);
            predictions_tta.extend(augmented);
        }

        let num_classes = truth
            .iter()
            .chain(predictions_tta.iter())
            .map(|&c| c + 1)
            .max()
            .unwrap_or(0);

        let report = EvaluationReport {
            accuracy: accuracy.average(),
            accuracy_tta: accuracy_tta.average(),
            f1: micro_f1(&predictions, &truth),
            f1_tta: micro_f1(&predictions_tta, &truth),
            samples: truth.len(),
            metrics_tta: Metrics::from_predictions(&predictions_tta, &truth, num_classes),
        };

        info!(
            "Two-stage accuracy {:.4} (TTA {:.4}) | F1 {:.4} (TTA {:.4}) over {} images",
            report.accuracy, report.accuracy_tta, report.f1, report.f1_tta, report.samples
        );
        debug!("TTA breakdown: {}", report.metrics_tta.summary());
        debug!("TTA confusion matrix:\n{}", report.metrics_tta.confusion_matrix);

        Ok(report)
    }
}

impl<B: Backend> TwoStagePredictor<B, GradeClassifier<B>> {
    /// Load a saved binary/minor artifact pair of a group with `num_classes` grades
    pub fn load(
        model: &ModelConfig,
        binary_path: &Path,
        minor_path: &Path,
        majority_class: usize,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let binary_config = model.classifier(Stage::Binary.output_width(num_classes));
        let minor_config = model.classifier(Stage::Minor.output_width(num_classes));
        let binary = GradeClassifier::load(&binary_config, binary_path, device)?;
        let minor = GradeClassifier::load(&minor_config, minor_path, device)?;
        Ok(Self::new(binary, minor, majority_class))
    }
}
