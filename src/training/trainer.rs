//! Stage Trainer
//!
//! Epoch loop for one stage model: head-only training while the backbone is
//! frozen, a one-time unfreeze, ordinal-weighted loss, and selection of the
//! snapshot with the lowest validation loss.

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::burn_dataset::{
    indices_to_tensor, make_batches, tensor_to_indices, GradeBatch, GradeBatcher, GradeImageDataset,
    GradeItem,
};
use crate::model::cnn::GradeClassifier;
use crate::model::config::TrainingConfig;
use crate::training::loss::OrdinalLoss;
use crate::training::remap::StageRemap;
use crate::utils::error::{GradingError, Result};
use crate::utils::logging::EpochLogger;
use crate::utils::metrics::{batch_accuracy, micro_f1, RunningAverage};

/// Mutable bookkeeping of one training run
///
/// `frozen` only ever goes from `true` to `false`. The snapshot is replaced
/// only on a strictly lower, finite validation loss.
#[derive(Debug, Clone)]
pub struct TrainerState<M> {
    pub epoch: usize,
    pub best_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub best_snapshot: Option<M>,
    pub frozen: bool,
    pub unfrozen_at: Option<usize>,
}

impl<M: Clone> Default for TrainerState<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone> TrainerState<M> {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            best_loss: None,
            best_epoch: None,
            best_snapshot: None,
            frozen: true,
            unfrozen_at: None,
        }
    }

    /// Enter `epoch`; returns true when this call performed the unfreeze
    pub fn begin_epoch(&mut self, epoch: usize, unfreeze_epoch: usize) -> bool {
        self.epoch = epoch;
        if self.frozen && epoch >= unfreeze_epoch {
            self.frozen = false;
            self.unfrozen_at = Some(epoch);
            return true;
        }
        false
    }

    /// Offer the current model; returns true if it became the new best
    pub fn observe(&mut self, val_loss: f64, model: &M) -> bool {
        if !val_loss.is_finite() {
            return false;
        }
        let improved = match self.best_loss {
            None => true,
            Some(best) => val_loss < best,
        };
        if improved {
            self.best_loss = Some(val_loss);
            self.best_epoch = Some(self.epoch);
            self.best_snapshot = Some(model.clone());
        }
        improved
    }

    /// Best snapshot with its loss and epoch
    pub fn into_best(self, epochs: usize) -> Result<(M, f64, usize)> {
        match (self.best_snapshot, self.best_loss, self.best_epoch) {
            (Some(model), Some(loss), Some(epoch)) => Ok((model, loss, epoch)),
            _ => Err(GradingError::UnassignedBestModel { epochs }),
        }
    }
}

/// Metrics of one epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub val_f1: f64,
    pub improved: bool,
    pub frozen: bool,
}

/// Output of [`StageTrainer::train`]
#[derive(Debug, Clone)]
pub struct TrainedStage<B: Backend> {
    /// Best-by-validation-loss snapshot
    pub model: GradeClassifier<B>,
    pub best_loss: f64,
    pub best_epoch: usize,
    pub unfrozen_at: Option<usize>,
    pub history: Vec<EpochRecord>,
}

#[derive(Debug, Clone, Copy)]
struct Validation {
    loss: f64,
    accuracy: f64,
    f1: f64,
}

/// Trains one stage model on a device of the autodiff backend `B`
pub struct StageTrainer<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    image_size: usize,
    seed: u64,
    label: String,
    loss: OrdinalLoss,
}

impl<B: AutodiffBackend> StageTrainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device, image_size: usize) -> Self {
        Self {
            config,
            device,
            image_size,
            seed: 42,
            label: "stage".to_string(),
            loss: OrdinalLoss::new(),
        }
    }

    /// Seed for the per-epoch shuffle
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Prefix used in epoch logs
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    /// Run every epoch and return the best snapshot
    ///
    /// Raw labels of both datasets are mapped through `remap` when given.
    pub fn train<O>(
        &self,
        mut model: GradeClassifier<B>,
        train: &GradeImageDataset,
        val: &GradeImageDataset,
        optimizer: &mut O,
        remap: Option<StageRemap>,
    ) -> Result<TrainedStage<B::InnerBackend>>
    where
        O: Optimizer<GradeClassifier<B>, B>,
    {
        let epochs = self.config.num_epochs;
        let batch_size = self.config.batch_size.max(1);
        let train_batcher = GradeBatcher::<B>::new(self.device.clone(), self.image_size);
        let val_batcher = GradeBatcher::<B::InnerBackend>::new(self.device.clone(), self.image_size);
        let val_batches = make_batches(val, &val_batcher, batch_size, None);

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut state: TrainerState<GradeClassifier<B>> = TrainerState::new();
        let mut history = Vec::with_capacity(epochs);
        let mut logger = EpochLogger::new(&self.label, epochs);

        for epoch in 0..epochs {
            if state.begin_epoch(epoch, self.config.unfreeze_epoch) {
                logger.log_unfreeze(epoch);
            }
            logger.start_epoch(epoch, state.frozen);

            let mut indices: Vec<usize> = (0..train.len()).collect();
            indices.shuffle(&mut rng);

            let mut train_loss = RunningAverage::new();
            for chunk in indices.chunks(batch_size) {
                let items: Vec<GradeItem> = chunk.iter().filter_map(|&i| train.get(i)).collect();
                if items.is_empty() {
                    continue;
                }
                let batch = train_batcher.batch(items);
                let labels = stage_labels(&batch.labels(), remap, model.num_outputs(), &self.label)?;
                let targets = indices_to_tensor::<B>(&labels, &batch.images.device());

                let logits = if state.frozen {
                    model.forward_head_only(batch.images)
                } else {
                    model.forward(batch.images)
                };
                let loss = self.loss.forward(logits, targets).loss;
                train_loss.add(loss.clone().into_scalar().elem::<f64>());

                let grads = loss.backward();
                let grads = if state.frozen {
                    GradientsParams::from_grads(grads, &model.head)
                } else {
                    GradientsParams::from_grads(grads, &model)
                };
                model = optimizer.step(self.config.learning_rate, model, grads);
            }

            let validation = self.validate(&model.valid(), &val_batches, remap)?;
            let improved = state.observe(validation.loss, &model);
            if !validation.loss.is_finite() {
                warn!("[{}] epoch {} produced a non-finite validation loss", self.label, epoch + 1);
            }

            logger.end_epoch(train_loss.average(), validation.loss, validation.accuracy, improved);
            debug!("[{}] val micro-F1 {:.4}", self.label, validation.f1);

            history.push(EpochRecord {
                epoch,
                train_loss: train_loss.average(),
                val_loss: validation.loss,
                val_accuracy: validation.accuracy,
                val_f1: validation.f1,
                improved,
                frozen: state.frozen,
            });
        }

        let unfrozen_at = state.unfrozen_at;
        let (best, best_loss, best_epoch) = state.into_best(epochs)?;
        logger.log_complete(best_epoch, best_loss);

        Ok(TrainedStage {
            model: best.valid(),
            best_loss,
            best_epoch,
            unfrozen_at,
            history,
        })
    }

    fn validate(
        &self,
        model: &GradeClassifier<B::InnerBackend>,
        batches: &[GradeBatch<B::InnerBackend>],
        remap: Option<StageRemap>,
    ) -> Result<Validation> {
        if batches.is_empty() {
            return Ok(Validation {
                loss: f64::NAN,
                accuracy: 0.0,
                f1: 0.0,
            });
        }

        let mut loss = RunningAverage::new();
        let mut predictions = Vec::new();
        let mut truth = Vec::new();

        for batch in batches {
            let labels = stage_labels(&batch.labels(), remap, model.num_outputs(), &self.label)?;
            let targets = indices_to_tensor::<B::InnerBackend>(&labels, &batch.images.device());

            let logits = model.forward(batch.images.clone());
            let output = self.loss.forward(logits.clone(), targets);
            loss.add(output.loss.into_scalar().elem::<f64>());

            predictions.extend(tensor_to_indices(logits.argmax(1).squeeze::<1>(1)));
            truth.extend(labels);
        }

        Ok(Validation {
            loss: loss.average(),
            accuracy: batch_accuracy(&predictions, &truth),
            f1: micro_f1(&predictions, &truth),
        })
    }
}

/// Labels as the head sees them; every label must index into a head of `width` outputs
fn stage_labels(
    labels: &[usize],
    remap: Option<StageRemap>,
    width: usize,
    context: &str,
) -> Result<Vec<usize>> {
    let labels = match remap {
        Some(remap) => remap.apply(labels)?,
        None => labels.to_vec(),
    };
    if let Some(&label) = labels.iter().find(|&&label| label >= width) {
        return Err(GradingError::Dataset(format!(
            "[{}] label {} is out of range for a head with {} outputs",
            context, label, width
        )));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cnn::GradeClassifierConfig;
    use crate::training::remap::Stage;
    use burn::backend::Autodiff;
    use burn::optim::AdamConfig;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    const SIZE: usize = 16;

    fn dataset(labels: &[usize]) -> GradeImageDataset {
        GradeImageDataset::from_items(
            labels
                .iter()
                .enumerate()
                .map(|(i, &label)| {
                    let value = 0.1 + 0.2 * label as f32 + 0.01 * i as f32;
                    GradeItem::from_data(vec![value; 3 * SIZE * SIZE], label, format!("img{}", i))
                })
                .collect(),
        )
    }

    fn tiny_model(num_outputs: usize) -> GradeClassifier<TestBackend> {
        let config = GradeClassifierConfig::new()
            .with_num_outputs(num_outputs)
            .with_base_filters(2)
            .with_feature_dim(8)
            .with_dropout_rate(0.0);
        GradeClassifier::new(&config, &Default::default())
    }

    fn config(num_epochs: usize) -> TrainingConfig {
        TrainingConfig {
            num_epochs,
            batch_size: 4,
            learning_rate: 1e-2,
            ..TrainingConfig::default()
        }
    }

    fn host<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    #[test]
    fn test_state_unfreezes_once() {
        let mut state: TrainerState<u8> = TrainerState::new();
        for epoch in 0..20 {
            assert!(!state.begin_epoch(epoch, 20));
            assert!(state.frozen);
        }
        assert!(state.begin_epoch(20, 20));
        for epoch in 21..30 {
            assert!(!state.begin_epoch(epoch, 20));
            assert!(!state.frozen);
        }
        assert_eq!(state.unfrozen_at, Some(20));
    }

    #[test]
    fn test_state_selects_strict_improvements_only() {
        let mut state: TrainerState<u8> = TrainerState::new();

        state.begin_epoch(0, 20);
        assert!(state.observe(0.9, &0));
        state.begin_epoch(1, 20);
        assert!(!state.observe(0.9, &1));
        state.begin_epoch(2, 20);
        assert!(!state.observe(f64::NAN, &2));
        state.begin_epoch(3, 20);
        assert!(state.observe(0.4, &3));
        state.begin_epoch(4, 20);
        assert!(!state.observe(f64::NEG_INFINITY, &4));

        assert_eq!(state.into_best(5).unwrap(), (3, 0.4, 3));
    }

    #[test]
    fn test_state_without_finite_loss_is_unassigned() {
        let mut state: TrainerState<u8> = TrainerState::new();
        state.begin_epoch(0, 20);
        state.observe(f64::NAN, &0);
        assert!(matches!(
            state.into_best(1),
            Err(GradingError::UnassignedBestModel { epochs: 1 })
        ));
    }

    #[test]
    fn test_short_run_keeps_backbone_frozen() {
        let device = Default::default();
        let model = tiny_model(2);
        let backbone_before = host(model.backbone.conv1.conv.weight.val());
        let head_before = host(model.head.weight.val());

        let trainer = StageTrainer::<TestBackend>::new(config(5), device, SIZE);
        let mut optimizer = AdamConfig::new().init();
        let data = dataset(&[0, 1, 0, 1, 0, 1]);

        let trained = trainer
            .train(model, &data, &data, &mut optimizer, None)
            .unwrap();

        assert_eq!(trained.history.len(), 5);
        assert!(trained.history.iter().all(|r| r.frozen));
        assert_eq!(trained.unfrozen_at, None);
        assert!(trained.history[0].improved);

        let backbone_after = host(trained.model.backbone.conv1.conv.weight.val());
        assert_eq!(backbone_before, backbone_after);
        assert_ne!(head_before, host(trained.model.head.weight.val()));
    }

    #[test]
    fn test_long_run_unfreezes_at_epoch_twenty() {
        let device = Default::default();
        let model = tiny_model(2);
        let backbone_before = host(model.backbone.conv1.conv.weight.val());
        let trainer = StageTrainer::<TestBackend>::new(config(25), device, SIZE).with_label("binary");
        let mut optimizer = AdamConfig::new().init();
        let data = dataset(&[0, 0, 0, 1, 2, 0]);

        let trained = trainer
            .train(
                model,
                &data,
                &data,
                &mut optimizer,
                Some(StageRemap::new(Stage::Binary, 0)),
            )
            .unwrap();

        assert_eq!(trained.unfrozen_at, Some(20));
        // the returned model is the best snapshot, so the backbone moved only if it came after the unfreeze
        let backbone_after = host(trained.model.backbone.conv1.conv.weight.val());
        if trained.best_epoch >= 20 {
            assert_ne!(backbone_before, backbone_after);
        } else {
            assert_eq!(backbone_before, backbone_after);
        }
        assert!(trained.history[..20].iter().all(|r| r.frozen));
        assert!(trained.history[20..].iter().all(|r| !r.frozen));
        let best = &trained.history[trained.best_epoch];
        assert!(best.improved);
        assert!(trained
            .history
            .iter()
            .all(|r| !r.val_loss.is_finite() || r.val_loss >= trained.best_loss));
    }

    #[test]
    fn test_unfrozen_backbone_reaches_optimizer() {
        let device = Default::default();
        let model = tiny_model(2);
        let backbone_before = host(model.backbone.conv1.conv.weight.val());

        let config = TrainingConfig {
            unfreeze_epoch: 0,
            ..config(2)
        };
        let trainer = StageTrainer::<TestBackend>::new(config, device, SIZE);
        let mut optimizer = AdamConfig::new().init();
        let data = dataset(&[0, 1, 0, 1, 0, 1]);

        let trained = trainer
            .train(model, &data, &data, &mut optimizer, None)
            .unwrap();

        assert_eq!(trained.unfrozen_at, Some(0));
        assert!(trained.history.iter().all(|r| !r.frozen));
        assert_ne!(backbone_before, host(trained.model.backbone.conv1.conv.weight.val()));
    }

    #[test]
    fn test_minor_stage_rejects_majority_samples() {
        let device = Default::default();
        let trainer = StageTrainer::<TestBackend>::new(config(1), device, SIZE);
        let mut optimizer = AdamConfig::new().init();
        let data = dataset(&[1, 2, 0]);

        let result = trainer.train(
            tiny_model(2),
            &data,
            &data,
            &mut optimizer,
            Some(StageRemap::new(Stage::Minor, 0)),
        );
        assert!(matches!(result, Err(GradingError::MajorityInMinorStage { .. })));
    }

    #[test]
    fn test_label_outside_head_width_is_an_error() {
        let device = Default::default();
        let trainer = StageTrainer::<TestBackend>::new(config(1), device, SIZE)
            .with_label("LH_mcp2_narrowing/minor");
        let mut optimizer = AdamConfig::new().init();
        // grade 3 has a folder but the head only covers grades 1 and 2
        let data = dataset(&[1, 2, 3]);

        let result = trainer.train(
            tiny_model(2),
            &data,
            &data,
            &mut optimizer,
            Some(StageRemap::new(Stage::Minor, 0)),
        );
        match result {
            Err(GradingError::Dataset(message)) => {
                assert!(message.contains("LH_mcp2_narrowing"));
                assert!(message.contains("label 2"));
            }
            other => panic!("expected a dataset error, got {:?}", other.map(|t| t.best_epoch)),
        }
    }

    #[test]
    fn test_stage_labels_checks_width() {
        assert_eq!(stage_labels(&[0, 1, 1], None, 2, "g").unwrap(), vec![0, 1, 1]);
        assert!(stage_labels(&[0, 2], None, 2, "g").is_err());
        assert_eq!(
            stage_labels(&[1, 3], Some(StageRemap::new(Stage::Minor, 2)), 3, "g").unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_zero_epochs_leave_best_unassigned() {
        let device = Default::default();
        let trainer = StageTrainer::<TestBackend>::new(config(0), device, SIZE);
        let mut optimizer = AdamConfig::new().init();
        let data = dataset(&[0, 1]);

        let result = trainer.train(tiny_model(2), &data, &data, &mut optimizer, None);
        assert!(matches!(result, Err(GradingError::UnassignedBestModel { epochs: 0 })));
    }
}
