//! Per-group orchestration
//!
//! For every label group: decide the majority class from the imbalance
//! tables, train the binary and the minor model, evaluate the pair and save
//! both artifacts. A failing group is reported and the run moves on.

use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::dataset::burn_dataset::{make_batches, GradeBatcher, GradeImageDataset};
use crate::dataset::imbalance::{ClassCounts, ImbalanceTable, Majority};
use crate::dataset::loader::{as_pairs, GroupImageFolder};
use crate::inference::predictor::{EvaluationReport, TwoStagePredictor};
use crate::model::cnn::GradeClassifier;
use crate::model::config::PipelineConfig;
use crate::training::remap::{Stage, StageRemap};
use crate::training::trainer::{StageTrainer, TrainedStage};
use crate::utils::error::{GradingError, Result};

/// File name of a saved stage model
pub fn artifact_name(stage: Stage, group: &str, accuracy: f64, accuracy_tta: f64) -> String {
    format!("{}_{}_{:.3}_{:.3}.mpk", stage, group, accuracy, accuracy_tta)
}

/// Reject groups that cannot be split into a binary and a minor problem
pub fn check_group(group: &str, counts: &ClassCounts, majority_class: usize) -> Result<()> {
    if counts.represented() < 2 {
        return Err(GradingError::DegenerateGroup {
            group: group.to_string(),
            reason: format!("only {} class(es) have samples", counts.represented()),
        });
    }
    if counts.count_excluding(majority_class) == 0 {
        return Err(GradingError::DegenerateGroup {
            group: group.to_string(),
            reason: "no minority samples".to_string(),
        });
    }
    Ok(())
}

/// Summary of one stage run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub output_width: usize,
    pub best_epoch: usize,
    pub best_loss: f64,
    pub unfrozen_at: Option<usize>,
    pub artifact: PathBuf,
}

/// What happened to a label group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupOutcome {
    SkippedBalanced,
    Failed {
        error: String,
    },
    Trained {
        majority_class: usize,
        num_classes: usize,
        binary: StageSummary,
        minor: StageSummary,
        evaluation: EvaluationReport,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub group: String,
    pub counts: ClassCounts,
    pub outcome: GroupOutcome,
}

/// Everything a run produced, saved as `run_report.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backend: String,
    pub config: PipelineConfig,
    pub groups: Vec<GroupReport>,
}

impl RunReport {
    pub fn trained(&self) -> usize {
        self.count(|o| matches!(o, GroupOutcome::Trained { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, GroupOutcome::SkippedBalanced))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, GroupOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&GroupOutcome) -> bool) -> usize {
        self.groups.iter().filter(|g| pred(&g.outcome)).count()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GradingError::PathNotFound(path.to_path_buf()));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Drives both stage trainings and the evaluation for every group
pub struct Orchestrator<B: AutodiffBackend> {
    config: PipelineConfig,
    device: B::Device,
    backend: String,
}

impl<B: AutodiffBackend> Orchestrator<B> {
    pub fn new(config: PipelineConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            backend: std::any::type_name::<B>().to_string(),
        }
    }

    /// Name recorded in the run report
    pub fn with_backend_name(mut self, name: &str) -> Self {
        self.backend = name.to_string();
        self
    }

    /// Process every configured group and write the run report
    pub fn run(&self) -> Result<RunReport> {
        self.config.validate()?;
        let started_at = Utc::now();

        let table = ImbalanceTable::load_all(&self.config.data.imbalance_tables)?;
        let groups: Vec<String> = if self.config.data.groups.is_empty() {
            table.groups().map(str::to_string).collect()
        } else {
            self.config.data.groups.clone()
        };
        info!("Processing {} label groups", groups.len());

        let pb = ProgressBar::new(groups.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .map(|style| style.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut reports = Vec::with_capacity(groups.len());
        for group in &groups {
            pb.set_message(group.clone());
            let counts = table.counts(group).unwrap_or_default();

            let outcome = match self.run_group(group, &counts) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("[{}] group failed: {}", group, e);
                    GroupOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };

            reports.push(GroupReport {
                group: group.clone(),
                counts,
                outcome,
            });
            pb.inc(1);
        }
        pb.finish_and_clear();

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            backend: self.backend.clone(),
            config: self.config.clone(),
            groups: reports,
        };
        let path = self.config.output_dir.join("run_report.json");
        report.save(&path)?;
        info!(
            "Run finished: {} trained, {} balanced, {} failed; report at {:?}",
            report.trained(),
            report.skipped(),
            report.failed(),
            path
        );

        Ok(report)
    }

    /// Train, evaluate and persist one group
    pub fn run_group(&self, group: &str, counts: &ClassCounts) -> Result<GroupOutcome> {
        if counts.total() == 0 {
            return Err(GradingError::Dataset(format!("no class counts for group {}", group)));
        }
        let majority_class = match counts.majority() {
            Majority::Balanced => {
                info!("[{}] balanced, skipping", group);
                return Ok(GroupOutcome::SkippedBalanced);
            }
            Majority::Class(c) => c,
        };
        check_group(group, counts, majority_class)?;

        let num_classes = counts.num_classes();
        info!(
            "[{}] majority class {} of {} ({} / {} samples)",
            group,
            majority_class,
            num_classes,
            counts.total() - counts.count_excluding(majority_class),
            counts.total()
        );

        let data = &self.config.data;
        let folder = GroupImageFolder::new(&data.data_root, &data.minor_suffix);
        let size = self.config.model.image_size;
        let load = |stage: Stage, split: &str| -> Result<GradeImageDataset> {
            let samples = folder.load_split(group, stage, split)?;
            let dataset = GradeImageDataset::new_cached(&as_pairs(&samples), size);
            debug!(
                "[{}] {} {} split: {} images, per class {:?}",
                group,
                stage,
                split,
                dataset.len(),
                dataset.class_distribution()
            );
            Ok(dataset)
        };

        let binary_train = load(Stage::Binary, &data.train_split)?;
        let binary_val = load(Stage::Binary, &data.val_split)?;
        let minor_train = load(Stage::Minor, &data.train_split)?;
        let minor_val = load(Stage::Minor, &data.val_split)?;
        if minor_train.is_empty() {
            return Err(GradingError::DegenerateGroup {
                group: group.to_string(),
                reason: "minor training split has no images".to_string(),
            });
        }

        let binary = self.train_stage(group, Stage::Binary, majority_class, num_classes, &binary_train, &binary_val)?;
        let minor = self.train_stage(group, Stage::Minor, majority_class, num_classes, &minor_train, &minor_val)?;

        let (binary_best_epoch, binary_best_loss, binary_unfrozen_at) =
            (binary.best_epoch, binary.best_loss, binary.unfrozen_at);
        let (minor_best_epoch, minor_best_loss, minor_unfrozen_at) =
            (minor.best_epoch, minor.best_loss, minor.unfrozen_at);

        let predictor = TwoStagePredictor::new(binary.model, minor.model, majority_class);
        let val_batcher = GradeBatcher::<B::InnerBackend>::new(self.device.clone(), size);
        let val_batches = make_batches(&binary_val, &val_batcher, self.config.training.batch_size, None);
        let evaluation = predictor.evaluate(&val_batches)?;

        let output_dir = &self.config.output_dir;
        let binary_artifact = output_dir.join(artifact_name(
            Stage::Binary,
            group,
            evaluation.accuracy,
            evaluation.accuracy_tta,
        ));
        let minor_artifact = output_dir.join(artifact_name(
            Stage::Minor,
            group,
            evaluation.accuracy,
            evaluation.accuracy_tta,
        ));
        predictor.binary().save(&binary_artifact)?;
        predictor.minor().save(&minor_artifact)?;
        info!("[{}] saved {:?} and {:?}", group, binary_artifact, minor_artifact);

        Ok(GroupOutcome::Trained {
            majority_class,
            num_classes,
            binary: StageSummary {
                output_width: Stage::Binary.output_width(num_classes),
                best_epoch: binary_best_epoch,
                best_loss: binary_best_loss,
                unfrozen_at: binary_unfrozen_at,
                artifact: binary_artifact,
            },
            minor: StageSummary {
                output_width: Stage::Minor.output_width(num_classes),
                best_epoch: minor_best_epoch,
                best_loss: minor_best_loss,
                unfrozen_at: minor_unfrozen_at,
                artifact: minor_artifact,
            },
            evaluation,
        })
    }

    fn train_stage(
        &self,
        group: &str,
        stage: Stage,
        majority_class: usize,
        num_classes: usize,
        train: &GradeImageDataset,
        val: &GradeImageDataset,
    ) -> Result<TrainedStage<B::InnerBackend>> {
        let width = stage.output_width(num_classes);
        let mut model = GradeClassifier::<B>::new(&self.config.model.classifier(width), &self.device);
        if let Some(path) = &self.config.model.pretrained_backbone {
            model = model.load_backbone(path, &self.device)?;
        } else {
            warn!("[{}] no pretrained backbone configured, training from random weights", group);
        }

        let training = &self.config.training;
        let mut optimizer = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(training.weight_decay as f32)))
            .init();

        info!(
            "[{}] {} stage: {} outputs, {} train / {} val images",
            group,
            stage,
            width,
            train.len(),
            val.len()
        );

        StageTrainer::<B>::new(training.clone(), self.device.clone(), self.config.model.image_size)
            .with_seed(self.config.seed)
            .with_label(&format!("{}/{}", group, stage))
            .train(model, train, val, &mut optimizer, Some(StageRemap::new(stage, majority_class)))
    }
}
