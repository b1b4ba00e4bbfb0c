//! Metric callbacks
//!
//! Every meter and saver implements [`Callback`]. They are wrapped in the
//! tagged [`MetricCallback`] enum and composed into an ordered
//! [`CallbackSet`], one per phase (`train`, `eval`), so training and
//! evaluation never share accumulators.
//!
//! Meters publish `<phase>/<name>` into the epoch metric map; savers run
//! after the meters of their set and read from that map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::ElementConversion;
use tracing::{debug, info};

use super::checkpoint::{Checkpoint, Direction, TriggerMetric};
use super::loss::{LossOutput, LossTerm};
use crate::model::NamedParams;
use crate::utils::error::{Result, SemixupError};
use crate::utils::metrics::{ConfusionMatrix, RunningAverage};

/// Name of the total loss in batch records and metric maps
pub const TOTAL_LOSS: &str = "loss";

/// What a batch step hands to the callbacks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRecord {
    /// Total loss and per-term values, keyed by metric name
    pub scalars: BTreeMap<String, f64>,
    pub predictions: Vec<usize>,
    pub targets: Vec<Option<usize>>,
}

impl BatchRecord {
    pub fn from_loss<B: Backend>(output: &LossOutput<B>) -> Self {
        let mut scalars: BTreeMap<String, f64> = output
            .terms
            .iter()
            .map(|(term, value)| (term.name().to_string(), *value))
            .collect();
        scalars.insert(TOTAL_LOSS.to_string(), output.total.clone().into_scalar().elem::<f64>());

        Self {
            scalars,
            predictions: output.predictions.clone(),
            targets: output.targets.clone(),
        }
    }

    /// `(actual, predicted)` pairs of the labeled samples
    pub fn labeled_pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.targets
            .iter()
            .zip(&self.predictions)
            .filter_map(|(target, &pred)| target.map(|t| (t, pred)))
    }
}

/// State visible to callbacks at the end of an epoch
pub struct EpochContext<'a> {
    pub epoch: usize,
    /// `train` or `eval`
    pub phase: &'a str,
    pub metrics: &'a mut BTreeMap<String, f64>,
    pub model: &'a dyn NamedParams,
    /// Run directory
    pub out_dir: &'a Path,
}

impl EpochContext<'_> {
    pub fn metric_name(&self, name: &str) -> String {
        format!("{}/{}", self.phase, name)
    }

    pub fn publish(&mut self, name: &str, value: f64) {
        let key = self.metric_name(name);
        self.metrics.insert(key, value);
    }
}

pub trait Callback {
    fn on_epoch_begin(&mut self, _epoch: usize) {}

    fn on_batch_begin(&mut self) {}

    fn on_batch_end(&mut self, _batch: &BatchRecord) {}

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> Result<()>;
}

/// Mean of one batch scalar over the epoch
#[derive(Debug, Clone)]
pub struct RunningAverageMeter {
    key: String,
    meter: RunningAverage,
}

impl RunningAverageMeter {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            meter: RunningAverage::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Callback for RunningAverageMeter {
    fn on_epoch_begin(&mut self, _epoch: usize) {
        self.meter.reset();
    }

    fn on_batch_end(&mut self, batch: &BatchRecord) {
        if let Some(value) = batch.scalars.get(&self.key) {
            self.meter.add(*value);
        }
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> Result<()> {
        if let Some(avg) = self.meter.average() {
            ctx.publish(&self.key, avg);
        }
        Ok(())
    }
}

/// Decides whether a batch counts towards a classification meter
pub type Eligibility = fn(&BatchRecord) -> bool;

/// Batches with at least one labeled sample
pub fn has_labels(batch: &BatchRecord) -> bool {
    batch.targets.iter().any(Option::is_some)
}

/// Mean per-class recall
#[derive(Debug, Clone)]
pub struct BalancedAccuracyMeter {
    name: String,
    confusion: ConfusionMatrix,
    eligible: Eligibility,
}

impl BalancedAccuracyMeter {
    pub fn new(name: impl Into<String>, num_classes: usize) -> Self {
        Self::with_eligibility(name, num_classes, has_labels)
    }

    pub fn with_eligibility(name: impl Into<String>, num_classes: usize, eligible: Eligibility) -> Self {
        Self {
            name: name.into(),
            confusion: ConfusionMatrix::new(num_classes),
            eligible,
        }
    }
}

impl Callback for BalancedAccuracyMeter {
    fn on_epoch_begin(&mut self, _epoch: usize) {
        self.confusion.reset();
    }

    fn on_batch_end(&mut self, batch: &BatchRecord) {
        if (self.eligible)(batch) {
            batch
                .labeled_pairs()
                .for_each(|(actual, pred)| self.confusion.add(actual, pred));
        }
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> Result<()> {
        if self.confusion.total() > 0 {
            ctx.publish(&self.name, self.confusion.balanced_accuracy());
        }
        Ok(())
    }
}

/// Quadratic weighted kappa between grades and predictions
#[derive(Debug, Clone)]
pub struct AgreementMeter {
    name: String,
    confusion: ConfusionMatrix,
}

impl AgreementMeter {
    pub fn new(name: impl Into<String>, num_classes: usize) -> Self {
        Self {
            name: name.into(),
            confusion: ConfusionMatrix::new(num_classes),
        }
    }
}

impl Callback for AgreementMeter {
    fn on_epoch_begin(&mut self, _epoch: usize) {
        self.confusion.reset();
    }

    fn on_batch_end(&mut self, batch: &BatchRecord) {
        batch
            .labeled_pairs()
            .for_each(|(actual, pred)| self.confusion.add(actual, pred));
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> Result<()> {
        if self.confusion.total() > 0 {
            ctx.publish(&self.name, self.confusion.quadratic_weighted_kappa());
        }
        Ok(())
    }
}

/// Collects the epoch confusion matrix, logs it and writes it as CSV
#[derive(Debug, Clone)]
pub struct ConfusionMatrixAggregator {
    confusion: ConfusionMatrix,
    class_names: Vec<String>,
}

impl ConfusionMatrixAggregator {
    pub fn new(class_names: Vec<String>) -> Self {
        Self {
            confusion: ConfusionMatrix::new(class_names.len()),
            class_names,
        }
    }

    pub fn csv_path(out_dir: &Path, phase: &str, epoch: usize) -> PathBuf {
        out_dir.join("confusion").join(format!("{phase}_epoch{:03}.csv", epoch + 1))
    }
}

impl Callback for ConfusionMatrixAggregator {
    fn on_epoch_begin(&mut self, _epoch: usize) {
        self.confusion.reset();
    }

    fn on_batch_end(&mut self, batch: &BatchRecord) {
        batch
            .labeled_pairs()
            .for_each(|(actual, pred)| self.confusion.add(actual, pred));
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> Result<()> {
        if self.confusion.total() == 0 {
            return Ok(());
        }
        let rendered = self.confusion.display(Some(&self.class_names));
        if ctx.phase == "eval" {
            info!("[{}] epoch {}{}", ctx.phase, ctx.epoch + 1, rendered);
        } else {
            debug!("[{}] epoch {}{}", ctx.phase, ctx.epoch + 1, rendered);
        }

        let path = Self::csv_path(ctx.out_dir, ctx.phase, ctx.epoch);
        self.confusion.save_csv(&path, Some(&self.class_names))
    }
}

/// Saves the model when its watched metric(s) improve.
///
/// With several metrics the score is the mean of the direction-signed
/// values, so `(kappa max, acc max)` saves when their average improves.
#[derive(Debug, Clone)]
pub struct CheckpointSaver {
    trigger: String,
    watched: Vec<(String, Direction)>,
    best: Option<f64>,
}

impl CheckpointSaver {
    pub fn new<S: Into<String>>(watched: Vec<(S, Direction)>) -> Result<Self> {
        let watched: Vec<(String, Direction)> = watched.into_iter().map(|(n, d)| (n.into(), d)).collect();
        if watched.is_empty() {
            return Err(SemixupError::Config("a checkpoint saver needs at least one metric".to_string()));
        }
        let trigger = watched
            .iter()
            .map(|(name, _)| name.replace('/', "_"))
            .collect::<Vec<_>>()
            .join("+");

        Ok(Self {
            trigger,
            watched,
            best: None,
        })
    }

    pub fn single(metric: impl Into<String>, direction: Direction) -> Result<Self> {
        Self::new(vec![(metric.into(), direction)])
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Best signed score so far
    pub fn best_score(&self) -> Option<f64> {
        self.best
    }

    pub fn checkpoint_path(&self, out_dir: &Path) -> PathBuf {
        out_dir.join("models").join(format!("{}.json", self.trigger))
    }

    fn current(&self, metrics: &BTreeMap<String, f64>) -> Result<Vec<TriggerMetric>> {
        self.watched
            .iter()
            .map(|(name, direction)| {
                metrics
                    .get(name)
                    .map(|&value| TriggerMetric {
                        name: name.clone(),
                        value,
                        direction: *direction,
                    })
                    .ok_or_else(|| {
                        SemixupError::Training(format!(
                            "checkpoint '{}' watches '{}', which was not reported this epoch",
                            self.trigger, name
                        ))
                    })
            })
            .collect()
    }
}

impl Callback for CheckpointSaver {
    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> Result<()> {
        let current = self.current(ctx.metrics)?;
        let score = current.iter().map(|m| m.direction.sign() * m.value).sum::<f64>() / current.len() as f64;

        if self.best.is_some_and(|best| score <= best) || score.is_nan() {
            return Ok(());
        }
        self.best = Some(score);

        let path = self.checkpoint_path(ctx.out_dir);
        let summary = current
            .iter()
            .map(|m| format!("{}={:.4}", m.name, m.value))
            .collect::<Vec<_>>()
            .join(", ");
        Checkpoint::new(&self.trigger, ctx.epoch, current, ctx.model.export_params()?).save(&path)?;
        info!("Saved checkpoint '{}' ({}) to {:?}", self.trigger, summary, path);
        Ok(())
    }
}

/// The callback variants a phase can run
#[derive(Debug, Clone)]
pub enum MetricCallback {
    RunningAverage(RunningAverageMeter),
    BalancedAccuracy(BalancedAccuracyMeter),
    Agreement(AgreementMeter),
    ConfusionMatrix(ConfusionMatrixAggregator),
    CheckpointSaver(CheckpointSaver),
}

impl MetricCallback {
    fn inner(&mut self) -> &mut dyn Callback {
        match self {
            MetricCallback::RunningAverage(cb) => cb,
            MetricCallback::BalancedAccuracy(cb) => cb,
            MetricCallback::Agreement(cb) => cb,
            MetricCallback::ConfusionMatrix(cb) => cb,
            MetricCallback::CheckpointSaver(cb) => cb,
        }
    }
}

impl Callback for MetricCallback {
    fn on_epoch_begin(&mut self, epoch: usize) {
        self.inner().on_epoch_begin(epoch);
    }

    fn on_batch_begin(&mut self) {
        self.inner().on_batch_begin();
    }

    fn on_batch_end(&mut self, batch: &BatchRecord) {
        self.inner().on_batch_end(batch);
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> Result<()> {
        self.inner().on_epoch_end(ctx)
    }
}

/// Ordered callbacks of one phase
#[derive(Debug, Clone)]
pub struct CallbackSet {
    phase: String,
    callbacks: Vec<MetricCallback>,
}

impl CallbackSet {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            callbacks: Vec::new(),
        }
    }

    /// Running averages of the total and of every enabled term, balanced
    /// accuracy, kappa and the confusion matrix
    pub fn meters(phase: impl Into<String>, terms: &[LossTerm], class_names: &[String]) -> Self {
        let num_classes = class_names.len();
        let mut set = Self::new(phase);
        set.push(MetricCallback::RunningAverage(RunningAverageMeter::new(TOTAL_LOSS)));
        for term in terms {
            set.push(MetricCallback::RunningAverage(RunningAverageMeter::new(term.name())));
        }
        set.push(MetricCallback::BalancedAccuracy(BalancedAccuracyMeter::new("acc", num_classes)));
        set.push(MetricCallback::Agreement(AgreementMeter::new("kappa", num_classes)));
        set.push(MetricCallback::ConfusionMatrix(ConfusionMatrixAggregator::new(class_names.to_vec())));
        set
    }

    pub fn train(terms: &[LossTerm], class_names: &[String]) -> Self {
        Self::meters("train", terms, class_names)
    }

    /// Evaluation meters followed by the four checkpoint savers
    pub fn eval(terms: &[LossTerm], class_names: &[String]) -> Result<Self> {
        let mut set = Self::meters("eval", terms, class_names);
        let savers = [
            CheckpointSaver::single("eval/loss_cls", Direction::Min)?,
            CheckpointSaver::new(vec![("eval/kappa", Direction::Max), ("eval/acc", Direction::Max)])?,
            CheckpointSaver::single("eval/kappa", Direction::Max)?,
            CheckpointSaver::single("eval/acc", Direction::Max)?,
        ];
        for saver in savers {
            // a saver on a disabled loss term would never see its metric
            let reported = saver
                .watched
                .iter()
                .all(|(name, _)| match name.strip_prefix("eval/") {
                    Some(metric) if metric.starts_with("loss_") => terms.iter().any(|t| t.name() == metric),
                    _ => true,
                });
            if reported {
                set.push(MetricCallback::CheckpointSaver(saver));
            }
        }
        Ok(set)
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn push(&mut self, callback: MetricCallback) {
        self.callbacks.push(callback);
    }

    pub fn callbacks(&self) -> &[MetricCallback] {
        &self.callbacks
    }

    pub fn savers(&self) -> impl Iterator<Item = &CheckpointSaver> {
        self.callbacks.iter().filter_map(|cb| match cb {
            MetricCallback::CheckpointSaver(saver) => Some(saver),
            _ => None,
        })
    }

    pub fn on_epoch_begin(&mut self, epoch: usize) {
        self.callbacks.iter_mut().for_each(|cb| cb.on_epoch_begin(epoch));
    }

    pub fn on_batch_begin(&mut self) {
        self.callbacks.iter_mut().for_each(|cb| cb.on_batch_begin());
    }

    pub fn on_batch_end(&mut self, batch: &BatchRecord) {
        self.callbacks.iter_mut().for_each(|cb| cb.on_batch_end(batch));
    }

    /// Run the epoch-end hooks in order and return the published metrics
    pub fn on_epoch_end(
        &mut self,
        epoch: usize,
        model: &dyn NamedParams,
        out_dir: &Path,
    ) -> Result<BTreeMap<String, f64>> {
        let mut metrics = BTreeMap::new();
        let mut ctx = EpochContext {
            epoch,
            phase: &self.phase,
            metrics: &mut metrics,
            model,
            out_dir,
        };
        for callback in self.callbacks.iter_mut() {
            callback.on_epoch_end(&mut ctx)?;
        }
        Ok(metrics)
    }
}
