//! Joint Grading CLI
//!
//! Trains the two-stage grade classifiers for every imbalanced label group,
//! inspects imbalance tables and runs saved model pairs on new images.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use burn::data::dataloader::batcher::Batcher;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use joint_grading::backend::{backend_name, default_device, InferenceBackend, TrainingBackend};
use joint_grading::dataset::burn_dataset::{GradeBatcher, GradeItem};
use joint_grading::dataset::loader::list_images;
use joint_grading::training::pipeline::GroupOutcome;
use joint_grading::utils::format_duration;
use joint_grading::utils::logging::{init_logging, LogConfig, LogLevel};
use joint_grading::{GradeClassifier, ImbalanceTable, Majority, Orchestrator, PipelineConfig, Stage, TwoStagePredictor};

/// Two-stage ordinal grading for imbalanced joint-damage scores
#[derive(Parser, Debug)]
#[command(name = "joint_grading")]
#[command(version)]
#[command(about = "Two-stage ordinal grade classification with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides --verbose
    #[arg(long)]
    log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train binary and minor models for every majority-dominated group
    Train {
        /// Pipeline configuration (JSON); defaults are used when omitted
        #[arg(short, long)]
        config: Option<String>,

        /// Root directory holding one folder per label group
        #[arg(short, long)]
        data_root: Option<String>,

        /// Imbalance tables (CSV: group,class,count)
        #[arg(short, long)]
        tables: Vec<String>,

        /// Only train these groups
        #[arg(short, long)]
        group: Vec<String>,

        /// Number of training epochs per stage
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Epoch at which the backbone becomes trainable
        #[arg(long)]
        unfreeze_epoch: Option<usize>,

        /// Batch size for training
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Pretrained backbone weights (.mpk)
        #[arg(long)]
        backbone: Option<String>,

        /// Output directory for artifacts and the run report
        #[arg(short, long)]
        output_dir: Option<String>,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show class counts and the majority decision per group
    Imbalance {
        /// Imbalance tables (CSV: group,class,count)
        #[arg(short, long, required = true)]
        tables: Vec<String>,
    },

    /// Grade every image of a directory with a saved model pair
    Predict {
        /// Directory of images
        #[arg(short, long)]
        input: String,

        /// Binary-stage artifact
        #[arg(long)]
        binary: String,

        /// Minor-stage artifact
        #[arg(long)]
        minor: String,

        /// Label group of the artifacts (majority class is read from the tables)
        #[arg(short, long)]
        group: String,

        /// Imbalance tables (CSV: group,class,count)
        #[arg(short, long, required = true)]
        tables: Vec<String>,

        /// Pipeline configuration the models were trained with
        #[arg(short, long)]
        config: Option<String>,

        /// Sum predictions over rotated and flipped views
        #[arg(long, default_value = "false")]
        tta: bool,
    },

    /// Write the default pipeline configuration
    InitConfig {
        /// Output JSON file
        #[arg(short, long, default_value = "pipeline.json")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    if let Some(level) = &cli.log_level {
        log_config.level = LogLevel::parse(level);
    }

    let _ = init_logging(&log_config);

    match cli.command {
        Commands::Train {
            config,
            data_root,
            tables,
            group,
            epochs,
            unfreeze_epoch,
            batch_size,
            learning_rate,
            backbone,
            output_dir,
            seed,
        } => {
            let mut pipeline = load_config(config.as_deref())?;
            if let Some(root) = data_root {
                pipeline.data.data_root = PathBuf::from(root);
            }
            if !tables.is_empty() {
                pipeline.data.imbalance_tables = tables.into_iter().map(PathBuf::from).collect();
            }
            if !group.is_empty() {
                pipeline.data.groups = group;
            }
            if let Some(epochs) = epochs {
                pipeline.training.num_epochs = epochs;
            }
            if let Some(epoch) = unfreeze_epoch {
                pipeline.training.unfreeze_epoch = epoch;
            }
            if let Some(batch_size) = batch_size {
                pipeline.training.batch_size = batch_size;
            }
            if let Some(lr) = learning_rate {
                pipeline.training.learning_rate = lr;
            }
            if let Some(path) = backbone {
                pipeline.model.pretrained_backbone = Some(PathBuf::from(path));
            }
            if let Some(dir) = output_dir {
                pipeline.output_dir = PathBuf::from(dir);
            }
            if let Some(seed) = seed {
                pipeline.seed = seed;
            }
            cmd_train(pipeline)?;
        }

        Commands::Imbalance { tables } => {
            cmd_imbalance(&tables)?;
        }

        Commands::Predict {
            input,
            binary,
            minor,
            group,
            tables,
            config,
            tta,
        } => {
            let pipeline = load_config(config.as_deref())?;
            cmd_predict(&pipeline, &input, &binary, &minor, &group, &tables, tta)?;
        }

        Commands::InitConfig { output } => {
            PipelineConfig::default()
                .save(Path::new(&output))
                .with_context(|| format!("Failed to write {}", output))?;
            println!("{} {}", "Wrote default configuration to".green(), output);
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(Path::new(path))
            .with_context(|| format!("Failed to load configuration {}", path)),
        None => Ok(PipelineConfig::default()),
    }
}

fn cmd_train(pipeline: PipelineConfig) -> Result<()> {
    pipeline.validate()?;

    println!();
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Data root:       {:?}", pipeline.data.data_root);
    println!("  Tables:          {:?}", pipeline.data.imbalance_tables);
    println!("  Epochs:          {}", pipeline.training.num_epochs);
    println!("  Unfreeze epoch:  {}", pipeline.training.unfreeze_epoch);
    println!("  Batch size:      {}", pipeline.training.batch_size);
    println!("  Learning rate:   {}", pipeline.training.learning_rate);
    println!("  Backend:         {}", backend_name());
    println!();

    std::fs::create_dir_all(&pipeline.output_dir)?;
    pipeline.save(&pipeline.output_dir.join("pipeline.json"))?;

    let start = Instant::now();
    let report = Orchestrator::<TrainingBackend>::new(pipeline, default_device())
        .with_backend_name(backend_name())
        .run()?;

    println!();
    println!("{}", "Results:".cyan().bold());
    for group in &report.groups {
        match &group.outcome {
            GroupOutcome::Trained {
                majority_class,
                evaluation,
                ..
            } => println!(
                "  {} {:<28} majority {} | acc {:.3} (TTA {:.3}) | F1 {:.3} (TTA {:.3})",
                "✓".green(),
                group.group,
                majority_class,
                evaluation.accuracy,
                evaluation.accuracy_tta,
                evaluation.f1,
                evaluation.f1_tta
            ),
            GroupOutcome::SkippedBalanced => {
                println!("  {} {:<28} balanced, skipped", "-".yellow(), group.group)
            }
            GroupOutcome::Failed { error } => {
                println!("  {} {:<28} {}", "✗".red(), group.group, error)
            }
        }
    }
    println!();
    println!(
        "{} {} trained, {} skipped, {} failed in {}",
        "Done:".green().bold(),
        report.trained(),
        report.skipped(),
        report.failed(),
        format_duration(start.elapsed().as_secs_f64())
    );

    Ok(())
}

fn cmd_imbalance(tables: &[String]) -> Result<()> {
    let table = ImbalanceTable::load_all(tables)?;
    info!("Loaded counts for {} groups", table.len());

    println!("{}", "Class counts:".cyan().bold());
    for group in table.groups() {
        let Some(counts) = table.counts(group) else {
            continue;
        };
        let listing: Vec<String> = counts
            .as_slice()
            .iter()
            .map(|(class, n)| format!("{}:{}", class, n))
            .collect();
        let decision = match counts.majority() {
            Majority::Class(c) => format!("majority {}", c).green(),
            Majority::Balanced => "balanced".yellow(),
        };
        println!("  {:<28} {:<32} {}", group, listing.join(" "), decision);
    }

    Ok(())
}

fn cmd_predict(
    pipeline: &PipelineConfig,
    input: &str,
    binary: &str,
    minor: &str,
    group: &str,
    tables: &[String],
    tta: bool,
) -> Result<()> {
    let table = ImbalanceTable::load_all(tables)?;
    let counts = table
        .counts(group)
        .with_context(|| format!("Group {} is not in the imbalance tables", group))?;
    let Majority::Class(majority) = counts.majority() else {
        bail!("Group {} is balanced and has no two-stage models", group);
    };
    let num_classes = counts.num_classes();

    let device = default_device();
    let predictor = TwoStagePredictor::<InferenceBackend, GradeClassifier<InferenceBackend>>::load(
        &pipeline.model,
        Path::new(binary),
        Path::new(minor),
        majority,
        num_classes,
        &device,
    )?;
    info!(
        "Loaded {} model ({} outputs) and {} model ({} outputs)",
        Stage::Binary,
        Stage::Binary.output_width(num_classes),
        Stage::Minor,
        Stage::Minor.output_width(num_classes)
    );

    let images = list_images(Path::new(input));
    if images.is_empty() {
        bail!("No images found in {}", input);
    }

    let size = pipeline.model.image_size;
    let batcher = GradeBatcher::<InferenceBackend>::new(device, size);
    let batch_size = pipeline.training.batch_size.max(1);

    println!("{}", "Predictions:".cyan().bold());
    for chunk in images.chunks(batch_size) {
        let items = chunk
            .iter()
            .map(|path| GradeItem::from_path(path, 0, size))
            .collect::<joint_grading::Result<Vec<_>>>()?;
        let batch = batcher.batch(items);
        let grades = if tta {
            predictor.predict_tta(batch.images)?
        } else {
            predictor.predict(batch.images)?
        };
        for (path, grade) in chunk.iter().zip(grades) {
            println!("  {}  {}", path.display(), grade.to_string().bold());
        }
    }

    Ok(())
}
