//! Semixup training loop
//!
//! ```text
//! Idle -> Training(0) -> Validating(0) -> Training(1) -> ... -> Done
//! ```
//!
//! A training step draws one batch from every active training stream,
//! evaluates the [`LossEngine`] over them, backpropagates and applies one
//! optimizer step. Validation runs on the inner (non-autodiff) model with
//! its own callback set. Errors from batch production or the loss are
//! returned as-is; checkpoints already written stay on disk.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::callbacks::{BatchRecord, CallbackSet};
use super::checkpoint::Direction;
use super::loss::{LossConfig, LossEngine};
use crate::dataset::burn_dataset::{SemixupBatch, SemixupBatcher};
use crate::dataset::provider::DataProvider;
use crate::dataset::sampling::SamplingConfig;
use crate::model::Classifier;
use crate::utils::error::{Result, SemixupError};
use crate::utils::logging::TrainingLogger;

/// Loop settings
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub n_epochs: usize,
    /// Steps per epoch; defaults to the longest training stream
    pub n_training_batches: Option<usize>,
    /// Validate every this many epochs (and always after the last one)
    pub validate_every: usize,
    pub learning_rate: f64,
    /// Square input resolution
    pub image_size: usize,
    /// Run directory for metrics, confusion matrices and checkpoints
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    Idle,
    Training(usize),
    Validating(usize),
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub metrics: BTreeMap<String, f64>,
}

/// Metrics of every finished epoch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    pub epochs: Vec<EpochRecord>,
}

impl MetricHistory {
    pub fn push(&mut self, epoch: usize, metrics: BTreeMap<String, f64>) {
        self.epochs.push(EpochRecord { epoch, metrics });
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn latest(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// `(epoch, value)` for every epoch that reported `name`
    pub fn values(&self, name: &str) -> Vec<(usize, f64)> {
        self.epochs
            .iter()
            .filter_map(|record| record.metrics.get(name).map(|v| (record.epoch, *v)))
            .collect()
    }

    /// First epoch holding the best value of `name`
    pub fn best(&self, name: &str, direction: Direction) -> Option<(usize, f64)> {
        self.values(name).into_iter().fold(None, |best, (epoch, value)| match best {
            Some((_, current)) if !direction.is_better(value, current) => best,
            _ => Some((epoch, value)),
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Owns the model, optimizer, loss engine, data provider and callbacks
pub struct TrainingStrategy<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Classifier<B>,
    O: Optimizer<M, B>,
{
    model: M,
    optimizer: O,
    loss: LossEngine,
    eval_loss: LossEngine,
    provider: Arc<DataProvider>,
    sampling: SamplingConfig,
    train_callbacks: CallbackSet,
    eval_callbacks: CallbackSet,
    batcher: SemixupBatcher,
    config: StrategyConfig,
    device: B::Device,
    state: StrategyState,
    history: MetricHistory,
    _backend: PhantomData<B>,
}

impl<B, M, O> TrainingStrategy<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Classifier<B>,
    M::InnerModule: Classifier<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// Fails if the sampling configuration names a stream the provider
    /// does not expose.
    pub fn new(
        model: M,
        optimizer: O,
        loss: LossEngine,
        provider: Arc<DataProvider>,
        sampling: SamplingConfig,
        config: StrategyConfig,
        device: B::Device,
    ) -> Result<Self> {
        if config.n_epochs == 0 || config.validate_every == 0 {
            return Err(SemixupError::Config(
                "n_epochs and validate_every must be positive".to_string(),
            ));
        }
        if sampling.train.data_provider.is_empty() {
            return Err(SemixupError::Config("sampling configuration names no training stream".to_string()));
        }
        if provider.image_size() != config.image_size {
            return Err(SemixupError::Config(format!(
                "image_size {} does not match the provider's {}",
                config.image_size,
                provider.image_size()
            )));
        }
        for name in sampling.train.stream_names().iter().chain(&sampling.eval.stream_names()) {
            if !provider.has_stream(name) {
                return Err(SemixupError::MissingStream(name.clone()));
            }
        }

        let eval_loss = LossEngine::new(LossConfig {
            seed: loss.config().seed.wrapping_add(1),
            ..loss.config().clone()
        })?;

        Ok(Self {
            model,
            optimizer,
            loss,
            eval_loss,
            provider,
            sampling,
            train_callbacks: CallbackSet::new("train"),
            eval_callbacks: CallbackSet::new("eval"),
            batcher: SemixupBatcher::new(config.image_size),
            config,
            device,
            state: StrategyState::Idle,
            history: MetricHistory::default(),
            _backend: PhantomData,
        })
    }

    pub fn with_callbacks(mut self, train: CallbackSet, eval: CallbackSet) -> Self {
        self.train_callbacks = train;
        self.eval_callbacks = eval;
        self
    }

    pub fn state(&self) -> StrategyState {
        self.state
    }

    pub fn history(&self) -> &MetricHistory {
        &self.history
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.config.out_dir.join("metrics.json")
    }

    fn should_validate(&self, epoch: usize) -> bool {
        (epoch + 1) % self.config.validate_every == 0 || epoch + 1 == self.config.n_epochs
    }

    /// Run exactly `n_epochs` epochs
    pub fn run(&mut self) -> Result<&MetricHistory> {
        let mut logger = TrainingLogger::new(self.config.n_epochs);
        info!(
            "Training for {} epochs on streams {:?}, validating on {:?}",
            self.config.n_epochs,
            self.sampling.train.stream_names(),
            self.sampling.eval.stream_names()
        );

        for epoch in 0..self.config.n_epochs {
            logger.start_epoch(epoch);

            self.state = StrategyState::Training(epoch);
            let mut metrics = self.train_epoch(epoch)?;

            if self.should_validate(epoch) {
                self.state = StrategyState::Validating(epoch);
                metrics.extend(self.validate_epoch(epoch)?);
            }

            logger.end_epoch(metrics.get("train/loss").copied(), metrics.get("eval/loss").copied());
            for (name, value) in &metrics {
                debug!("  {name}: {value:.4}");
            }
            self.history.push(epoch, metrics);
            self.history.save(self.metrics_path())?;
        }

        self.state = StrategyState::Done;
        logger.log_complete();
        Ok(&self.history)
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        let provider = Arc::clone(&self.provider);

        let mut active = Vec::new();
        for name in self.sampling.train.stream_names() {
            if provider.spec(&name)?.is_empty() {
                debug!("Stream '{}' is empty; skipped", name);
            } else {
                active.push(name);
            }
        }
        if active.is_empty() {
            return Err(SemixupError::Training("every training stream is empty".to_string()));
        }

        let n_steps = match self.config.n_training_batches {
            Some(n) => n,
            None => active
                .iter()
                .map(|name| provider.len(name))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .max()
                .unwrap_or(0),
        };
        let mut streams = active
            .iter()
            .map(|name| provider.prefetch(name, epoch, true))
            .collect::<Result<Vec<_>>>()?;

        self.train_callbacks.on_epoch_begin(epoch);
        for step in 0..n_steps {
            self.train_callbacks.on_batch_begin();

            let mut batches: Vec<SemixupBatch<B>> = Vec::with_capacity(streams.len());
            for (stream, name) in streams.iter_mut().zip(&active) {
                let items = stream
                    .next()
                    .ok_or_else(|| SemixupError::Training(format!("stream '{name}' ran dry")))??;
                batches.push(self.batcher.batch(items, &self.device));
            }

            let output = self.loss.compute(&self.model, &batches)?;
            let record = BatchRecord::from_loss(&output);

            let grads = output.total.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optimizer.step(self.config.learning_rate, self.model.clone(), grads);

            self.train_callbacks.on_batch_end(&record);

            if (step + 1) % 10 == 0 || step + 1 == n_steps {
                debug!(
                    "  Step {}/{}: loss = {:.4}",
                    step + 1,
                    n_steps,
                    record.scalars.get("loss").copied().unwrap_or_default()
                );
            }
        }

        self.train_callbacks
            .on_epoch_end(epoch, &self.model, &self.config.out_dir)
    }

    fn validate_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        let provider = Arc::clone(&self.provider);
        let model = self.model.valid();

        self.eval_callbacks.on_epoch_begin(epoch);
        for name in self.sampling.eval.stream_names() {
            for items in provider.prefetch(&name, epoch, false)? {
                let items = items?;
                self.eval_callbacks.on_batch_begin();

                let batch: SemixupBatch<B::InnerBackend> = self.batcher.batch(items, &self.device);
                let output = self.eval_loss.compute(&model, std::slice::from_ref(&batch))?;
                self.eval_callbacks.on_batch_end(&BatchRecord::from_loss(&output));
            }
        }

        self.eval_callbacks.on_epoch_end(epoch, &model, &self.config.out_dir)
    }
}
