//! Fine-tune a BIO tagger or run a hyperparameter search from a JSON run file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tagtune_core::{pipeline, HfSubwordTokenizer, RunConfig};
use tagtune_trainer::{run_training, DistilBertFactory, SearchController, RESULTS_FILE};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "tagtune-train")]
#[command(about = "Fine-tune a BIO token tagger and search its hyperparameters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run configuration (JSON)
    #[arg(short, long, global = true, default_value = "tagtune.json")]
    config: PathBuf,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Train one configuration
    Train(Overrides),
    /// Search hyperparameters with the `search` section of the run file
    Search {
        #[command(flatten)]
        overrides: Overrides,

        /// Number of trials
        #[arg(long)]
        samples: Option<usize>,

        /// Trials running at the same time
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

/// Values that take precedence over the run file.
#[derive(Args)]
struct Overrides {
    /// Pretrained model directory
    #[arg(long)]
    model: Option<String>,

    /// Output directory for checkpoints and results
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(model) = &self.model {
            config.training.model_name = model.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(epochs) = self.epochs {
            config.training.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.training.learning_rate = learning_rate;
        }
        if let Some(workers) = self.workers {
            config.training.num_workers = workers;
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = RunConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match &cli.command {
        Commands::Train(overrides) => overrides.apply(&mut config),
        Commands::Search {
            overrides,
            samples,
            concurrency,
        } => {
            overrides.apply(&mut config);
            let Some(search) = config.search.as_mut() else {
                bail!("{} has no `search` section", cli.config.display());
            };
            if let Some(samples) = samples {
                search.controller.num_samples = *samples;
            }
            if let Some(concurrency) = concurrency {
                search.controller.max_concurrent_trials = *concurrency;
            }
        }
    }
    config.validate().context("invalid run configuration")?;

    let tokenizer = HfSubwordTokenizer::from_file(config.tokenizer_path())
        .context("failed to load tokenizer")?;
    let data = pipeline::prepare(&config, tokenizer).context("failed to prepare corpus")?;
    let factory = Arc::new(DistilBertFactory::new());

    match cli.command {
        Commands::Train(_) => {
            let outcome =
                run_training(config.training.clone(), &data, factory, &config.output_dir).await?;
            info!(
                epochs = outcome.reports.len(),
                best_val_accuracy = ?outcome.best_val_accuracy(),
                checkpoint = ?outcome.final_checkpoint.as_ref().map(|c| &c.path),
                "training finished"
            );
        }
        Commands::Search { .. } => {
            let Some(search) = config.search.clone() else {
                bail!("{} has no `search` section", cli.config.display());
            };
            let controller = SearchController::new(
                search.controller,
                search.space,
                config.training.clone(),
                Arc::new(data),
                factory,
                &config.output_dir,
            )?;
            let outcome = controller.run().await?;
            info!(
                trial = outcome.best.trial_id,
                best_val_accuracy = outcome.best.best_val_accuracy,
                results = %config.output_dir.join(RESULTS_FILE).display(),
                "best configuration"
            );
        }
    }

    Ok(())
}
