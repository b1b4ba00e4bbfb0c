//! One cross-validation fold, end to end
//!
//! population -> persisted split -> fold streams -> model/optimizer ->
//! strategy run, with every artifact under a fresh run directory.

use std::path::PathBuf;
use std::sync::Arc;

use burn::optim::decay::WeightDecayConfig;
use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use super::callbacks::CallbackSet;
use super::checkpoint::Direction;
use super::loss::LossEngine;
use super::strategy::{MetricHistory, StrategyConfig, TrainingStrategy};
use crate::config::{DataConfig, OutputConfig, RunConfig};
use crate::dataset::augmentation::{Augmenter, Normalization};
use crate::dataset::loader::{Population, SampleId};
use crate::dataset::provider::{DataProvider, StreamSpec};
use crate::dataset::sampling::SamplingConfig;
use crate::dataset::source::{DiskSource, SampleSource};
use crate::dataset::split::{Fold, FoldSplit};
use crate::model::{load_pretrained, GradingCnnConfig};
use crate::utils::error::{Result, SemixupError};

/// Outcome of [`run_fold`]
#[derive(Debug, Clone)]
pub struct FoldRun {
    pub run_dir: PathBuf,
    pub history: MetricHistory,
}

pub fn load_population(data: &DataConfig) -> Result<Population> {
    let population = match &data.manifest {
        Some(manifest) => Population::from_manifest(manifest, data.class_names.clone())?,
        None => Population::from_directory(&data.root)?,
    };
    info!(
        "Population: {} samples over {} grades {:?}",
        population.len(),
        population.num_classes(),
        population.class_counts()
    );
    Ok(population)
}

/// Load the persisted split, generating it on first use
pub fn prepare_split(config: &RunConfig, population: &Population) -> Result<FoldSplit> {
    FoldSplit::load_or_generate(&config.data.split_file, population, &config.split)
}

/// The named streams of one fold.
///
/// With `unlabeled_includes_labeled` the labeled training samples are also
/// served, without labels, on the unlabeled stream. An empty unlabeled
/// partition stays empty.
pub fn fold_streams(fold: &Fold, unlabeled_includes_labeled: bool) -> Vec<(&'static str, StreamSpec)> {
    let mut unlabeled: Vec<SampleId> = fold.train_unlabeled().iter().copied().collect();
    if unlabeled_includes_labeled && !unlabeled.is_empty() {
        unlabeled.extend(fold.train_labeled().iter().copied());
    }

    vec![
        ("labeled", StreamSpec::labeled(fold.train_labeled().iter().copied())),
        ("unlabeled", StreamSpec::unlabeled(unlabeled)),
        ("val_labeled", StreamSpec::validation(fold.val_labeled().iter().copied())),
        ("val_unlabeled", StreamSpec::validation(fold.val_unlabeled().iter().copied())),
    ]
}

/// `<log_dir>/<timestamp>_fold<k>[_<comment>]`
pub fn run_directory(output: &OutputConfig, fold_index: usize) -> PathBuf {
    let mut name = format!("{}_fold{}", chrono::Local::now().format("%Y_%m_%d_%H_%M_%S"), fold_index);
    if let Some(comment) = output.comment.as_deref().filter(|c| !c.is_empty()) {
        name.push('_');
        name.push_str(comment);
    }
    output.log_dir.join(name)
}

fn image_source(config: &RunConfig, population: &Population) -> Result<Arc<dyn SampleSource>> {
    if !config.data.preload {
        return Ok(Arc::new(DiskSource::new()));
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.training.num_threads)
        .build()
        .map_err(|e| SemixupError::Config(format!("failed to build preload pool: {e}")))?;
    Ok(Arc::new(DiskSource::preloaded(population.records(), &pool)?))
}

/// Train the configured fold on `device`
pub fn run_fold<B: AutodiffBackend>(config: &RunConfig, device: B::Device) -> Result<FoldRun> {
    config.validate()?;
    let population = Arc::new(load_population(&config.data)?);
    let split = prepare_split(config, &population)?;

    let fold_index = config.training.fold_index;
    let fold = split.fold(fold_index)?;
    info!("{}", split.stats(fold_index, &population)?);

    let run_dir = run_directory(&config.output, fold_index);
    std::fs::create_dir_all(&run_dir)?;
    config.save(run_dir.join("config.toml"))?;
    info!("Run directory: {:?}", run_dir);

    let transform = Arc::new(Augmenter::new(
        config.data.augmentation.clone(),
        Normalization::default(),
        config.data.image_size as u32,
    ));
    let mut provider = DataProvider::new(
        Arc::clone(&population),
        image_source(config, &population)?,
        transform,
        config.training.batch_size,
        config.training.num_threads,
        config.split.seed,
    )?
    .with_prefetch_depth(config.training.prefetch_batches);
    for (name, spec) in fold_streams(fold, config.training.unlabeled_includes_labeled) {
        info!("Stream '{}': {} samples", name, spec.ids().len());
        provider.add_stream(name, spec)?;
    }

    let sampling = match &config.data.sampling_file {
        Some(path) => SamplingConfig::load(path)?,
        None => SamplingConfig::semixup_default(),
    };

    let mut model = GradingCnnConfig::new()
        .with_num_classes(population.num_classes())
        .with_base_filters(config.model.base_filters)
        .with_hidden_size(config.model.hidden_size)
        .with_dropout_rate(config.model.dropout_rate)
        .init::<B>(&device);
    if let Some(path) = &config.model.pretrained {
        model = load_pretrained(model, path)?.0;
    }

    let optimizer = AdamConfig::new()
        .with_beta_1(config.optim.beta1 as f32)
        .with_beta_2(config.optim.beta2 as f32)
        .with_weight_decay(Some(WeightDecayConfig::new(config.optim.weight_decay as f32)))
        .init();

    let loss = LossEngine::new(config.loss.clone())?;
    let terms = loss.enabled_terms();
    info!("Loss terms: {:?}", terms.iter().map(|t| t.name()).collect::<Vec<_>>());
    let class_names = population.class_names().to_vec();

    let strategy_config = StrategyConfig {
        n_epochs: config.training.n_epochs,
        n_training_batches: config.training.n_training_batches,
        validate_every: config.training.validate_every,
        learning_rate: config.optim.learning_rate,
        image_size: config.data.image_size,
        out_dir: run_dir.clone(),
    };
    let mut strategy = TrainingStrategy::new(
        model,
        optimizer,
        loss,
        Arc::new(provider),
        sampling,
        strategy_config,
        device,
    )?
    .with_callbacks(
        CallbackSet::train(&terms, &class_names),
        CallbackSet::eval(&terms, &class_names)?,
    );

    let history = strategy.run()?.clone();
    log_summary(&history);
    info!("Checkpoints written to {:?}", run_dir.join("models"));

    Ok(FoldRun { run_dir, history })
}

fn log_summary(history: &MetricHistory) {
    let watched = [
        ("eval/kappa", Direction::Max),
        ("eval/acc", Direction::Max),
        ("eval/loss_cls", Direction::Min),
    ];
    for (metric, direction) in watched {
        if let Some((epoch, value)) = history.best(metric, direction) {
            info!("Best {}: {:.4} (epoch {})", metric, value, epoch + 1);
        }
    }
}
