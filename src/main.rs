//! Semixup CLI
//!
//! `split` prepares the persisted cross-validation folds, `train` runs one
//! fold end to end.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use semixup::backend::{backend_name, resolve_device, TrainingBackend};
use semixup::config::{Overrides, RunConfig};
use semixup::training::pipeline::{load_population, prepare_split, run_fold};
use semixup::training::LossTerm;
use semixup::utils::logging::{init_logging, LogConfig};

/// Semi-supervised ordinal grading with mixup consistency
#[derive(Parser, Debug)]
#[command(name = "semixup")]
#[command(version)]
#[command(about = "Semi-supervised grading with mixup consistency, built on Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate (or load) the persisted fold split and print per-fold statistics
    Split {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Labeled training samples per grade
        #[arg(long)]
        n_labels: Option<usize>,

        /// Unlabeled training samples per group (0 disables unlabeled data)
        #[arg(long)]
        n_unlabels: Option<usize>,
    },

    /// Train one fold
    Train {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// 0-based fold index
        #[arg(long)]
        fold_index: Option<usize>,

        /// Labeled training samples per grade
        #[arg(long)]
        n_labels: Option<usize>,

        /// Unlabeled training samples per group (0 disables unlabeled data)
        #[arg(long)]
        n_unlabels: Option<usize>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Loss terms to exclude (cls, cons, mixup, cons_mixup, cons_aug_mixup); repeatable
        #[arg(long = "remove-loss")]
        remove_loss: Vec<LossTerm>,

        /// Pretrained parameters (snapshot or checkpoint)
        #[arg(long)]
        pretrained: Option<PathBuf>,

        /// Suffix for the run directory name
        #[arg(long)]
        comment: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config)?;

    match cli.command {
        Commands::Split {
            config,
            n_labels,
            n_unlabels,
        } => {
            let mut config = load_config(&config)?;
            config.apply_overrides(&Overrides {
                n_labels,
                n_unlabels,
                ..Overrides::default()
            });
            config.validate()?;
            cmd_split(&config)?;
        }

        Commands::Train {
            config,
            fold_index,
            n_labels,
            n_unlabels,
            epochs,
            remove_loss,
            pretrained,
            comment,
        } => {
            let mut config = load_config(&config)?;
            config.apply_overrides(&Overrides {
                fold_index,
                n_labels,
                n_unlabels,
                n_epochs: epochs,
                remove_loss,
                pretrained,
                comment,
            });
            config.validate()?;
            cmd_train(&config)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RunConfig> {
    semixup::config::load_toml_config(path).with_context(|| format!("loading {}", path.display()))
}

fn cmd_split(config: &RunConfig) -> Result<()> {
    let population = load_population(&config.data)?;
    let split = prepare_split(config, &population)?;

    println!("{}", "Fold split".cyan().bold());
    println!("  file: {}", config.data.split_file.display());
    for index in 0..split.len() {
        println!("  {}", split.stats(index, &population)?);
    }
    Ok(())
}

fn cmd_train(config: &RunConfig) -> Result<()> {
    println!(
        "{} fold {} on {}",
        "Semixup".green().bold(),
        config.training.fold_index,
        backend_name()
    );

    let device = resolve_device(config.device)?;
    let run = run_fold::<TrainingBackend>(config, device)?;

    info!("Run finished: {} epochs", run.history.len());
    println!("{} {}", "Results:".green().bold(), run.run_dir.display());
    if let Some(last) = run.history.latest() {
        for (name, value) in last.metrics.iter().filter(|(name, _)| name.starts_with("eval/")) {
            println!("  {:<20} {:.4}", name, value);
        }
    }
    Ok(())
}
