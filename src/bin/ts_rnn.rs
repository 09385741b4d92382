//! Command-line front end: train the classifier, predict with a checkpoint,
//! or generate a synthetic dataset.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use birnn_classifier::model::{Dataset, RnnClassifier, RnnConfig};
use birnn_classifier::nn::{LossKind, Module};
use birnn_classifier::train::Trainer;

#[derive(Parser)]
#[command(name = "ts_rnn")]
#[command(about = "Bidirectional LSTM time-series classifier", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and write checkpoints under its parent folder
    Train {
        /// JSON configuration file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Dataset file with {"x": [[[..]]], "y": [[..]]}
        #[arg(short, long, conflicts_with = "synthetic")]
        data: Option<PathBuf>,

        /// Train on this many synthetic sine samples instead of a file
        #[arg(long)]
        synthetic: Option<usize>,

        /// Override the configured loss function
        #[arg(short, long)]
        loss: Option<LossKind>,

        /// Fraction of the samples held out for validation
        #[arg(long, default_value = "0.2")]
        valid_fraction: f64,
    },

    /// Print the predicted class of every sample
    Predict {
        /// Configuration the model was trained with
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint directory (defaults to the model's infer_best)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        #[arg(short, long)]
        data: PathBuf,
    },

    /// Write a synthetic sine-wave dataset to a JSON file
    Generate {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, default_value = "256")]
        samples: usize,

        #[arg(short, long, default_value = "128")]
        timesteps: usize,

        #[arg(long, default_value = "2")]
        classes: usize,

        /// Amplitude of the uniform noise
        #[arg(long, default_value = "0.1")]
        noise: f32,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("birnn_classifier=info".parse()?)
                .add_directive("ts_rnn=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            data,
            synthetic,
            loss,
            valid_fraction,
        } => train(config, data, synthetic, loss, valid_fraction),
        Commands::Predict {
            config,
            checkpoint,
            data,
        } => predict(&config, checkpoint, &data),
        Commands::Generate {
            output,
            samples,
            timesteps,
            classes,
            noise,
            seed,
        } => {
            let mut rng = StdRng::seed_from_u64(seed);
            let dataset = Dataset::synthetic_sine(samples, timesteps, classes, noise, &mut rng);
            dataset.save_json(&output)?;
            tracing::info!(path = %output.display(), samples, timesteps, classes, "wrote dataset");
            Ok(())
        }
    }
}

fn train(
    config_path: Option<PathBuf>,
    data: Option<PathBuf>,
    synthetic: Option<usize>,
    loss: Option<LossKind>,
    valid_fraction: f64,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => RnnConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RnnConfig::default(),
    };
    if let Some(loss) = loss {
        config.loss_function = loss;
        config.resolve();
    }

    let dataset = match (data, synthetic) {
        (Some(path), _) => Dataset::load_json(&path)
            .with_context(|| format!("loading dataset {}", path.display()))?,
        (None, Some(n)) => {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            Dataset::synthetic_sine(n, config.n_timesteps, config.n_classes, 0.1, &mut rng)
        }
        (None, None) => bail!("either --data or --synthetic is required"),
    };
    if dataset.n_features() != config.n_features || dataset.n_classes() != config.n_classes {
        bail!(
            "dataset has {} features and {} classes but the config expects {} and {}",
            dataset.n_features(),
            dataset.n_classes(),
            config.n_features,
            config.n_classes
        );
    }

    let (train_set, valid_set) = dataset.split(valid_fraction)?;
    if valid_set.is_empty() {
        bail!("validation split is empty; raise --valid-fraction or add samples");
    }

    let mut trainer = Trainer::new(config)?;
    let report = trainer.fit(&train_set, &valid_set)?;
    match (report.best_epoch, report.best_valid_loss) {
        (Some(epoch), Some(loss)) => tracing::info!(
            best_epoch = epoch,
            best_valid_loss = loss,
            epochs = report.epochs.len(),
            stopped_early = report.stopped_early,
            history = %trainer.history_path().display(),
            "training finished"
        ),
        _ => tracing::warn!("no epoch was run"),
    }
    Ok(())
}

fn predict(config_path: &Path, checkpoint: Option<PathBuf>, data: &Path) -> Result<()> {
    let config = RnnConfig::load(config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let checkpoint = checkpoint.unwrap_or_else(|| config.model_paths().infer_best);
    let model = RnnClassifier::new(config)?;
    model
        .restore_checkpoint(&checkpoint)
        .with_context(|| format!("restoring {}", checkpoint.display()))?;
    model.eval();

    let dataset = Dataset::load_json(data)?;
    let classes = model.predict_classes(&dataset.x)?;
    let correct = dataset
        .y
        .outer_iter()
        .zip(&classes)
        .filter(|(row, &class)| row.get(class).copied() == Some(1.0))
        .count();
    for (i, class) in classes.iter().enumerate() {
        println!("{}\t{}", i, class);
    }
    tracing::info!(
        samples = classes.len(),
        accuracy = correct as f64 / classes.len().max(1) as f64,
        "prediction finished"
    );
    Ok(())
}
