//! Composite Semixup loss
//!
//! | term             | batches   | penalty                                              |
//! |------------------|-----------|------------------------------------------------------|
//! | `cls`            | labeled   | cross-entropy against the grades                     |
//! | `cons`           | unlabeled | `‖p(x_aug) − p(x)‖²`                                 |
//! | `mixup`          | both      | `‖p(λx + (1−λ)x_π) − (λp(x) + (1−λ)p(x)_π)‖²`        |
//! | `cons_mixup`     | unlabeled | mixed clean input against mixed `p(x_aug)`           |
//! | `cons_aug_mixup` | unlabeled | mixed augmented input against mixed `p(x)`           |
//!
//! `p` is the softmax output; reference distributions are detached. λ is
//! drawn from Beta(0.75, 0.75) for every mixup operation and π comes from
//! the configured [`Rearrange`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::ElementConversion;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use crate::dataset::burn_dataset::{check_permutation, permutation_tensor, RandomRearrange, Rearrange, SemixupBatch};
use crate::model::Classifier;
use crate::utils::error::{Result, SemixupError};

/// Shape parameter of the symmetric Beta distribution λ is drawn from
pub const BETA_ALPHA: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossTerm {
    Cls,
    Cons,
    Mixup,
    ConsMixup,
    ConsAugMixup,
}

impl LossTerm {
    pub const ALL: [LossTerm; 5] = [
        LossTerm::Cls,
        LossTerm::Cons,
        LossTerm::Mixup,
        LossTerm::ConsMixup,
        LossTerm::ConsAugMixup,
    ];

    /// Metric name of the term
    pub fn name(&self) -> &'static str {
        match self {
            LossTerm::Cls => "loss_cls",
            LossTerm::Cons => "loss_cons",
            LossTerm::Mixup => "loss_mixup",
            LossTerm::ConsMixup => "loss_cons_mixup",
            LossTerm::ConsAugMixup => "loss_cons_aug_mixup",
        }
    }
}

impl std::fmt::Display for LossTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossTerm {
    type Err = SemixupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches("loss_") {
            "cls" => Ok(LossTerm::Cls),
            "cons" => Ok(LossTerm::Cons),
            "mixup" => Ok(LossTerm::Mixup),
            "cons_mixup" => Ok(LossTerm::ConsMixup),
            "cons_aug_mixup" => Ok(LossTerm::ConsAugMixup),
            other => Err(SemixupError::Config(format!(
                "unknown loss term '{other}' (expected cls, cons, mixup, cons_mixup or cons_aug_mixup)"
            ))),
        }
    }
}

/// Loss coefficients and ablation switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub cons_coef: f64,
    pub mixup_coef: f64,
    pub cons_mixup_coef: f64,
    pub cons_aug_mixup_coef: f64,
    /// Terms excluded from the total
    pub elim_loss: Vec<LossTerm>,
    /// Seed for λ and pairing permutations
    pub seed: u64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            cons_coef: 2.0,
            mixup_coef: 4.0,
            cons_mixup_coef: 2.0,
            cons_aug_mixup_coef: 2.0,
            elim_loss: Vec::new(),
            seed: 12345,
        }
    }
}

impl LossConfig {
    pub fn coefficient(&self, term: LossTerm) -> f64 {
        match term {
            LossTerm::Cls => 1.0,
            LossTerm::Cons => self.cons_coef,
            LossTerm::Mixup => self.mixup_coef,
            LossTerm::ConsMixup => self.cons_mixup_coef,
            LossTerm::ConsAugMixup => self.cons_aug_mixup_coef,
        }
    }

    pub fn is_enabled(&self, term: LossTerm) -> bool {
        !self.elim_loss.contains(&term)
    }

    pub fn enabled_terms(&self) -> Vec<LossTerm> {
        LossTerm::ALL.into_iter().filter(|t| self.is_enabled(*t)).collect()
    }
}

/// Draws interpolation coefficients strictly inside (0, 1)
#[derive(Debug, Clone)]
pub struct InterpolationSampler {
    beta: Beta<f64>,
}

impl InterpolationSampler {
    pub fn new(alpha: f64) -> Result<Self> {
        let beta = Beta::new(alpha, alpha)
            .map_err(|e| SemixupError::Config(format!("invalid Beta({alpha}, {alpha}): {e}")))?;
        Ok(Self { beta })
    }

    pub fn sample(&self, rng: &mut ChaCha8Rng) -> f64 {
        loop {
            // f64 draws can round to the closed endpoints
            let lambda = self.beta.sample(rng);
            if lambda > 0.0 && lambda < 1.0 {
                return lambda;
            }
        }
    }
}

/// A batch paired with a permutation of itself, mixed with weight λ
#[derive(Debug, Clone, PartialEq)]
pub struct MixupPair {
    pub lambda: f64,
    pub permutation: Vec<usize>,
}

impl MixupPair {
    /// `λ·first + (1−λ)·second`
    pub fn interpolate<B: Backend, const D: usize>(&self, first: Tensor<B, D>, second: Tensor<B, D>) -> Tensor<B, D> {
        first.mul_scalar(self.lambda) + second.mul_scalar(1.0 - self.lambda)
    }

    /// Interpolate every row of `tensor` with its permuted partner
    pub fn mix<B: Backend, const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let index = permutation_tensor::<B>(&self.permutation, &tensor.device());
        let partner = tensor.clone().select(0, index);
        self.interpolate(tensor, partner)
    }
}

/// Result of one loss evaluation
#[derive(Debug)]
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    /// Weighted contribution of every enabled term; sums to `total`
    pub terms: BTreeMap<LossTerm, f64>,
    /// Argmax of the clean-view logits, batch by batch
    pub predictions: Vec<usize>,
    /// Labels aligned with `predictions` (`None` for unlabeled samples)
    pub targets: Vec<Option<usize>>,
}

impl<B: Backend> LossOutput<B> {
    pub fn total_value(&self) -> f64 {
        self.terms.values().sum()
    }
}

pub struct LossEngine {
    config: LossConfig,
    sampler: InterpolationSampler,
    rearrange: Arc<dyn Rearrange>,
    rng: ChaCha8Rng,
}

impl LossEngine {
    pub fn new(config: LossConfig) -> Result<Self> {
        Ok(Self {
            sampler: InterpolationSampler::new(BETA_ALPHA)?,
            rearrange: Arc::new(RandomRearrange),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
        })
    }

    /// Replace the pairing permutation
    pub fn with_rearrange(mut self, rearrange: Arc<dyn Rearrange>) -> Self {
        self.rearrange = rearrange;
        self
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn enabled_terms(&self) -> Vec<LossTerm> {
        self.config.enabled_terms()
    }

    /// Fresh λ and permutation for a batch of `len` samples
    pub fn sample_pair(&mut self, len: usize) -> Result<MixupPair> {
        let lambda = self.sampler.sample(&mut self.rng);
        let permutation = self.rearrange.permutation(len, &mut self.rng);
        check_permutation(&permutation, len)?;
        Ok(MixupPair { lambda, permutation })
    }

    /// Evaluate the enabled terms over the batches of one step.
    ///
    /// Batches with targets take the labeled path, the others must carry a
    /// second view and take the unlabeled path.
    pub fn compute<B: Backend, M: Classifier<B>>(
        &mut self,
        model: &M,
        batches: &[SemixupBatch<B>],
    ) -> Result<LossOutput<B>> {
        let device = batches
            .first()
            .map(|b| b.images.device())
            .ok_or_else(|| SemixupError::Training("loss requested without batches".to_string()))?;

        let mut raw: BTreeMap<LossTerm, Tensor<B, 1>> = BTreeMap::new();
        let mut predictions = Vec::new();
        let mut targets = Vec::new();

        for batch in batches.iter().filter(|b| !b.is_empty()) {
            let logits = model.forward(batch.images.clone());
            predictions.extend(argmax(logits.clone())?);
            targets.extend(batch.labels.iter().copied());

            match &batch.targets {
                Some(grades) => self.labeled_terms(model, batch, logits, grades.clone(), &mut raw)?,
                None => self.unlabeled_terms(model, batch, logits, &mut raw)?,
            }
        }

        let mut total = Tensor::<B, 1>::zeros([1], &device);
        let mut terms = BTreeMap::new();
        for term in self.enabled_terms() {
            let weighted = match raw.remove(&term) {
                Some(value) => value.mul_scalar(self.config.coefficient(term)),
                None => Tensor::<B, 1>::zeros([1], &device),
            };
            terms.insert(term, weighted.clone().into_scalar().elem::<f64>());
            total = total + weighted;
        }

        Ok(LossOutput {
            total,
            terms,
            predictions,
            targets,
        })
    }

    fn labeled_terms<B: Backend, M: Classifier<B>>(
        &mut self,
        model: &M,
        batch: &SemixupBatch<B>,
        logits: Tensor<B, 2>,
        grades: Tensor<B, 1, Int>,
        raw: &mut BTreeMap<LossTerm, Tensor<B, 1>>,
    ) -> Result<()> {
        if self.config.is_enabled(LossTerm::Cls) {
            let ce = CrossEntropyLossConfig::new()
                .init(&logits.device())
                .forward(logits.clone(), grades);
            accumulate(raw, LossTerm::Cls, ce);
        }

        if self.config.is_enabled(LossTerm::Mixup) {
            let reference = softmax(logits, 1).detach();
            let value = self.mixup_distance(model, batch.images.clone(), reference)?;
            accumulate(raw, LossTerm::Mixup, value);
        }
        Ok(())
    }

    fn unlabeled_terms<B: Backend, M: Classifier<B>>(
        &mut self,
        model: &M,
        batch: &SemixupBatch<B>,
        logits: Tensor<B, 2>,
        raw: &mut BTreeMap<LossTerm, Tensor<B, 1>>,
    ) -> Result<()> {
        let augmented = batch.images_aug.clone().ok_or_else(|| {
            SemixupError::Training("unlabeled batch is missing its augmented view".to_string())
        })?;
        let reference = softmax(logits, 1).detach();

        let wants_aug = self.config.is_enabled(LossTerm::Cons) || self.config.is_enabled(LossTerm::ConsMixup);
        let probs_aug = wants_aug.then(|| softmax(model.forward(augmented.clone()), 1));

        if let Some(probs_aug) = probs_aug.as_ref().filter(|_| self.config.is_enabled(LossTerm::Cons)) {
            accumulate(raw, LossTerm::Cons, distribution_distance(probs_aug.clone(), reference.clone()));
        }

        if self.config.is_enabled(LossTerm::Mixup) {
            let value = self.mixup_distance(model, batch.images.clone(), reference.clone())?;
            accumulate(raw, LossTerm::Mixup, value);
        }

        if let Some(probs_aug) = probs_aug.filter(|_| self.config.is_enabled(LossTerm::ConsMixup)) {
            let value = self.mixup_distance(model, batch.images.clone(), probs_aug.detach())?;
            accumulate(raw, LossTerm::ConsMixup, value);
        }

        if self.config.is_enabled(LossTerm::ConsAugMixup) {
            let value = self.mixup_distance(model, augmented, reference)?;
            accumulate(raw, LossTerm::ConsAugMixup, value);
        }
        Ok(())
    }

    /// Distance between the output on mixed inputs and the mixed reference outputs
    fn mixup_distance<B: Backend, M: Classifier<B>>(
        &mut self,
        model: &M,
        inputs: Tensor<B, 4>,
        reference: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>> {
        let [n, ..] = inputs.dims();
        let pair = self.sample_pair(n)?;
        let mixed_output = softmax(model.forward(pair.mix(inputs)), 1);
        Ok(distribution_distance(mixed_output, pair.mix(reference)))
    }
}

fn accumulate<B: Backend>(raw: &mut BTreeMap<LossTerm, Tensor<B, 1>>, term: LossTerm, value: Tensor<B, 1>) {
    let value = match raw.remove(&term) {
        Some(previous) => previous + value,
        None => value,
    };
    raw.insert(term, value);
}

/// Mean over the batch of the squared L2 distance between two distributions
pub fn distribution_distance<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 1> {
    (a - b).powf_scalar(2.0).sum_dim(1).mean()
}

fn argmax<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<usize>> {
    let [n, _] = logits.dims();
    logits
        .argmax(1)
        .reshape([n])
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map(|v| v.into_iter().map(|i| i as usize).collect())
        .map_err(|e| SemixupError::Tensor(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::burn_dataset::{SampleItem, SemixupBatcher};
    use crate::dataset::loader::SampleId;
    use crate::model::GradingCnnConfig;
    use burn::backend::Autodiff;
    use burn::data::dataloader::batcher::Batcher;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;
    type TestAutodiff = Autodiff<NdArray>;

    const SIZE: usize = 16;

    fn items(n: usize, labeled: bool, offset: usize) -> Vec<SampleItem> {
        (0..n)
            .map(|i| {
                let view = |shift: f32| {
                    (0..SIZE * SIZE)
                        .map(|p| ((p + i * 7) % 13) as f32 / 13.0 - 0.5 + shift)
                        .collect::<Vec<f32>>()
                };
                SampleItem {
                    id: SampleId(offset + i),
                    label: labeled.then_some(i % 5),
                    views: if labeled { vec![view(0.0)] } else { vec![view(0.0), view(0.3)] },
                }
            })
            .collect()
    }

    fn batches<B: Backend>(device: &B::Device, with_unlabeled: bool) -> Vec<SemixupBatch<B>> {
        let batcher = SemixupBatcher::new(SIZE);
        let mut out = vec![batcher.batch(items(6, true, 0), device)];
        if with_unlabeled {
            out.push(batcher.batch(items(6, false, 100), device));
        }
        out
    }

    fn model<B: Backend>(device: &B::Device) -> crate::model::GradingCnn<B> {
        GradingCnnConfig::new()
            .with_base_filters(2)
            .with_hidden_size(8)
            .init::<B>(device)
    }

    fn engine(elim: Vec<LossTerm>) -> LossEngine {
        LossEngine::new(LossConfig {
            elim_loss: elim,
            ..LossConfig::default()
        })
        .unwrap()
    }

    struct Identity;

    impl Rearrange for Identity {
        fn permutation(&self, len: usize, _rng: &mut ChaCha8Rng) -> Vec<usize> {
            (0..len).collect()
        }
    }

    struct Broken;

    impl Rearrange for Broken {
        fn permutation(&self, len: usize, _rng: &mut ChaCha8Rng) -> Vec<usize> {
            vec![0; len]
        }
    }

    #[test]
    fn test_lambda_strictly_inside_unit_interval() {
        let sampler = InterpolationSampler::new(BETA_ALPHA).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let draws: Vec<f64> = (0..20_000).map(|_| sampler.sample(&mut rng)).collect();

        assert!(draws.iter().all(|&l| l > 0.0 && l < 1.0));
        let extreme = draws.iter().filter(|&&l| l < 0.2 || l > 0.8).count();
        let middle = draws.iter().filter(|&&l| l > 0.4 && l < 0.6).count();
        assert!(extreme > middle);
        assert!(middle > 0);
    }

    #[test]
    fn test_lambda_resampled_per_pair() {
        let mut engine = engine(vec![]);
        let a = engine.sample_pair(8).unwrap();
        let b = engine.sample_pair(8).unwrap();
        assert_ne!(a.lambda, b.lambda);
    }

    #[test]
    fn test_invalid_rearrange_is_rejected() {
        let mut engine = engine(vec![]).with_rearrange(Arc::new(Broken));
        assert!(engine.sample_pair(3).is_err());
    }

    #[test]
    fn test_loss_term_parsing() {
        assert_eq!("cons".parse::<LossTerm>().unwrap(), LossTerm::Cons);
        assert_eq!("loss_cons_mixup".parse::<LossTerm>().unwrap(), LossTerm::ConsMixup);
        assert_eq!("cons_aug_mixup".parse::<LossTerm>().unwrap(), LossTerm::ConsAugMixup);
        assert_eq!(LossTerm::ConsAugMixup.name(), "loss_cons_aug_mixup");
        assert!("entropy".parse::<LossTerm>().is_err());
        assert_eq!(LossTerm::Mixup.to_string(), "loss_mixup");
    }

    #[test]
    fn test_mixup_pair_interpolation() {
        let device = Default::default();
        let pair = MixupPair {
            lambda: 0.25,
            permutation: vec![1, 0],
        };
        let x = Tensor::<TestBackend, 2>::from_floats([[0.0, 4.0], [8.0, 0.0]], &device);
        let mixed = pair.mix(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(mixed, vec![6.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_disabling_consistency_removes_term() {
        let device = Default::default();
        let model = model::<TestAutodiff>(&device);
        let mut engine = engine(vec![LossTerm::Cons]);

        let output = engine.compute(&model, &batches(&device, true)).unwrap();

        assert!(!output.terms.contains_key(&LossTerm::Cons));
        assert_eq!(output.terms.len(), 4);
        let expected = output.terms[&LossTerm::Cls]
            + output.terms[&LossTerm::Mixup]
            + output.terms[&LossTerm::ConsMixup]
            + output.terms[&LossTerm::ConsAugMixup];
        let total = output.total.clone().into_scalar().elem::<f64>();
        assert!((total - expected).abs() < 1e-5, "total {total} vs terms {expected}");
    }

    #[test]
    fn test_without_unlabeled_batches_unlabeled_terms_are_zero() {
        let device = Default::default();
        let model = model::<TestAutodiff>(&device);
        let mut engine = engine(vec![]);

        let output = engine.compute(&model, &batches(&device, false)).unwrap();

        assert_eq!(output.terms[&LossTerm::Cons], 0.0);
        assert_eq!(output.terms[&LossTerm::ConsMixup], 0.0);
        assert_eq!(output.terms[&LossTerm::ConsAugMixup], 0.0);
        assert!(output.terms[&LossTerm::Cls] > 0.0);
        assert_eq!(output.predictions.len(), 6);
        assert!(output.targets.iter().all(Option::is_some));
    }

    #[test]
    fn test_total_backpropagates() {
        let device = Default::default();
        let model = model::<TestAutodiff>(&device);
        let mut engine = engine(vec![]);

        let output = engine.compute(&model, &batches(&device, true)).unwrap();
        assert!(output.terms.values().all(|v| v.is_finite() && *v >= 0.0));
        assert!((output.total_value() - output.total.clone().into_scalar().elem::<f64>()).abs() < 1e-5);

        let grads = output.total.backward();
        let weight_grad = model.fc2.weight.val().grad(&grads);
        assert!(weight_grad.is_some());
    }

    #[test]
    fn test_identity_pairing_gives_zero_mixup() {
        // inner backend: dropout and batch statistics are inactive
        let device = Default::default();
        let model = model::<TestBackend>(&device);
        let mut engine = engine(vec![LossTerm::Cls]).with_rearrange(Arc::new(Identity));

        let output = engine.compute(&model, &batches(&device, true)).unwrap();
        assert!(output.terms[&LossTerm::Mixup].abs() < 1e-6);
        assert!(!output.terms.contains_key(&LossTerm::Cls));
    }

    #[test]
    fn test_removing_cons_aug_mixup_leaves_other_terms() {
        // with identity pairing every mixup reduces to its unmixed form
        let device = Default::default();
        let model = model::<TestBackend>(&device);
        let data = batches(&device, true);

        let full = engine(vec![])
            .with_rearrange(Arc::new(Identity))
            .compute(&model, &data)
            .unwrap();
        let ablated = engine(vec![LossTerm::ConsAugMixup])
            .with_rearrange(Arc::new(Identity))
            .compute(&model, &data)
            .unwrap();

        assert!(!ablated.terms.contains_key(&LossTerm::ConsAugMixup));
        for term in [LossTerm::Cls, LossTerm::Cons, LossTerm::Mixup, LossTerm::ConsMixup] {
            assert!((full.terms[&term] - ablated.terms[&term]).abs() < 1e-6, "{term}");
        }

        let config = LossConfig::default();
        let cons = full.terms[&LossTerm::Cons] / config.cons_coef;
        let cons_aug_mixup = full.terms[&LossTerm::ConsAugMixup] / config.cons_aug_mixup_coef;
        assert!((cons - cons_aug_mixup).abs() < 1e-6);

        let removed = full.total_value() - ablated.total_value();
        assert!((removed - full.terms[&LossTerm::ConsAugMixup]).abs() < 1e-5);
    }

    #[test]
    fn test_same_seed_same_losses() {
        let device = Default::default();
        let model = model::<TestBackend>(&device);

        let a = engine(vec![]).compute(&model, &batches(&device, true)).unwrap();
        let b = engine(vec![]).compute(&model, &batches(&device, true)).unwrap();
        assert_eq!(a.terms, b.terms);
    }

    #[test]
    fn test_unlabeled_batch_requires_second_view() {
        let device = Default::default();
        let model = model::<TestBackend>(&device);
        let mut items = items(4, false, 0);
        items.iter_mut().for_each(|item| item.views.truncate(1));
        let batch: SemixupBatch<TestBackend> = SemixupBatcher::new(SIZE).batch(items, &device);

        assert!(engine(vec![]).compute(&model, &[batch]).is_err());
    }
}
