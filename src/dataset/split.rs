//! Stratified semi-supervised fold splitting
//!
//! Produces `n_folds` cross-validation folds. Inside each fold the training
//! part is divided again into `n_ss_folds` stratified sub-folds: the first one
//! is the pool labeled samples are drawn from, the remaining ones (plus any
//! labeled candidates that were not taken) are the unlabeled pool.
//!
//! ```text
//! population ──stratified k-fold──▶ val_labeled | train pool
//! train pool ──stratified sub-folds──▶ labeled pool | unlabeled pool
//! labeled pool ──per class──▶ train_labeled (+ leftovers → unlabeled pool)
//! unlabeled pool ──per unlabeled target──▶ train_unlabeled | val_unlabeled
//! ```
//!
//! Every draw uses a ChaCha stream derived from `(seed, fold)`, so a fold can
//! be regenerated on its own and identical inputs always yield identical folds.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::loader::{Population, SampleId};
use crate::utils::error::{Result, SemixupError};

/// Configuration for fold generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Number of outer cross-validation folds
    pub n_folds: usize,
    /// Number of stratified sub-folds the training part is divided into
    pub n_ss_folds: usize,
    /// Labeled training samples drawn per class
    pub labeled_train_size_per_class: usize,
    /// Unlabeled training samples drawn per unlabeled-target group (0 disables unlabeled data)
    pub unlabeled_train_size_per_class: usize,
    /// Fail when a class cannot provide `labeled_train_size_per_class` samples
    pub equal_target: bool,
    /// Balance the unlabeled draw over the unlabeled-target groups
    pub equal_unlabeled_target: bool,
    /// Shuffle within classes before dealing folds
    pub shuffle: bool,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            n_folds: 5,
            n_ss_folds: 3,
            labeled_train_size_per_class: 100,
            unlabeled_train_size_per_class: 500,
            equal_target: true,
            equal_unlabeled_target: true,
            shuffle: true,
            seed: 12345,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_folds < 2 {
            return Err(SemixupError::Config(format!(
                "n_folds must be at least 2, got {}",
                self.n_folds
            )));
        }
        if self.n_ss_folds < 2 {
            return Err(SemixupError::Config(format!(
                "n_ss_folds must be at least 2, got {}",
                self.n_ss_folds
            )));
        }
        Ok(())
    }
}

/// One cross-validation fold. Partitions are sets of sample ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    train_labeled: BTreeSet<SampleId>,
    val_labeled: BTreeSet<SampleId>,
    train_unlabeled: BTreeSet<SampleId>,
    val_unlabeled: BTreeSet<SampleId>,
}

impl Fold {
    pub fn train_labeled(&self) -> &BTreeSet<SampleId> {
        &self.train_labeled
    }

    pub fn val_labeled(&self) -> &BTreeSet<SampleId> {
        &self.val_labeled
    }

    pub fn train_unlabeled(&self) -> &BTreeSet<SampleId> {
        &self.train_unlabeled
    }

    pub fn val_unlabeled(&self) -> &BTreeSet<SampleId> {
        &self.val_unlabeled
    }

    /// Check that no sample appears in two partitions
    pub fn check_disjoint(&self) -> Result<()> {
        let parts = [
            ("train_labeled", &self.train_labeled),
            ("val_labeled", &self.val_labeled),
            ("train_unlabeled", &self.train_unlabeled),
            ("val_unlabeled", &self.val_unlabeled),
        ];
        for (i, (name_a, a)) in parts.iter().enumerate() {
            for (name_b, b) in parts.iter().skip(i + 1) {
                if let Some(id) = a.intersection(b).next() {
                    return Err(SemixupError::Split(format!(
                        "sample {} is in both {} and {}",
                        id, name_a, name_b
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Partition sizes of one fold
#[derive(Debug, Clone)]
pub struct FoldStats {
    pub index: usize,
    pub train_labeled: usize,
    pub val_labeled: usize,
    pub train_unlabeled: usize,
    pub val_unlabeled: usize,
    /// Labeled-train count per grade
    pub labeled_per_class: BTreeMap<usize, usize>,
}

impl std::fmt::Display for FoldStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Fold {}:", self.index)?;
        writeln!(f, "  train_labeled:   {:>6}", self.train_labeled)?;
        writeln!(f, "  val_labeled:     {:>6}", self.val_labeled)?;
        writeln!(f, "  train_unlabeled: {:>6}", self.train_unlabeled)?;
        writeln!(f, "  val_unlabeled:   {:>6}", self.val_unlabeled)?;
        let per_class: Vec<String> = self
            .labeled_per_class
            .iter()
            .map(|(class, n)| format!("{class}:{n}"))
            .collect();
        write!(f, "  labeled per class: {}", per_class.join(" "))
    }
}

/// Materialized sequence of folds together with the config that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldSplit {
    config: SplitConfig,
    population_size: usize,
    folds: Vec<Fold>,
}

impl FoldSplit {
    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.folds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }

    /// Direct access to fold `index` (0-based)
    pub fn fold(&self, index: usize) -> Result<&Fold> {
        self.folds.get(index).ok_or_else(|| {
            SemixupError::Config(format!(
                "fold index {} out of range (split has {} folds)",
                index,
                self.folds.len()
            ))
        })
    }

    /// Iterate over all folds from the start; may be called any number of times
    pub fn iter(&self) -> std::slice::Iter<'_, Fold> {
        self.folds.iter()
    }

    pub fn stats(&self, index: usize, population: &Population) -> Result<FoldStats> {
        let fold = self.fold(index)?;
        let mut labeled_per_class = BTreeMap::new();
        for id in fold.train_labeled() {
            *labeled_per_class.entry(population.get(*id)?.target).or_insert(0) += 1;
        }
        Ok(FoldStats {
            index,
            train_labeled: fold.train_labeled.len(),
            val_labeled: fold.val_labeled.len(),
            train_unlabeled: fold.train_unlabeled.len(),
            val_unlabeled: fold.val_unlabeled.len(),
            labeled_per_class,
        })
    }

    /// Save the split to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Saved {} folds to {:?}", self.folds.len(), path);
        Ok(())
    }

    /// Load a split from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let split: Self = serde_json::from_str(&content)?;
        Ok(split)
    }

    /// Load the persisted split, or generate and persist it when the file is missing.
    ///
    /// A stored split always wins over the requested config so that every run
    /// of an experiment sees the same folds; a differing config is only warned about.
    pub fn load_or_generate<P: AsRef<Path>>(
        path: P,
        population: &Population,
        config: &SplitConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let split = Self::load(path)?;
            if split.population_size != population.len() {
                return Err(SemixupError::Split(format!(
                    "persisted split {:?} was built for {} samples, population has {}",
                    path,
                    split.population_size,
                    population.len()
                )));
            }
            if &split.config != config {
                warn!(
                    "Persisted split {:?} was generated with a different configuration; using the stored folds",
                    path
                );
            }
            info!("Loaded {} folds from {:?}", split.len(), path);
            return Ok(split);
        }

        info!("No persisted split at {:?}, generating", path);
        let split = FoldSplitter::new(config.clone())?.split(population)?;
        split.save(path)?;
        Ok(split)
    }
}

impl<'a> IntoIterator for &'a FoldSplit {
    type Item = &'a Fold;
    type IntoIter = std::slice::Iter<'a, Fold>;

    fn into_iter(self) -> Self::IntoIter {
        self.folds.iter()
    }
}

/// Generates [`FoldSplit`]s from a population
#[derive(Debug, Clone)]
pub struct FoldSplitter {
    config: SplitConfig,
}

impl FoldSplitter {
    pub fn new(config: SplitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn split(&self, population: &Population) -> Result<FoldSplit> {
        if population.is_empty() {
            return Err(SemixupError::Split("population is empty".to_string()));
        }

        let by_class = group_by(population.records().iter().map(|r| (r.target, r.id)));
        let mut outer_rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let chunks = stratified_chunks(&by_class, self.config.n_folds, self.config.shuffle, &mut outer_rng);

        let folds = (0..self.config.n_folds)
            .map(|k| self.build_fold(k, &chunks, population))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Generated {} folds ({} labeled / {} unlabeled per class)",
            folds.len(),
            self.config.labeled_train_size_per_class,
            self.config.unlabeled_train_size_per_class
        );

        Ok(FoldSplit {
            config: self.config.clone(),
            population_size: population.len(),
            folds,
        })
    }

    fn build_fold(&self, k: usize, chunks: &[Vec<SampleId>], population: &Population) -> Result<Fold> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        rng.set_stream(k as u64 + 1);

        let val_labeled: BTreeSet<SampleId> = chunks[k].iter().copied().collect();
        let train_pool: Vec<SampleId> = chunks
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != k)
            .flat_map(|(_, chunk)| chunk.iter().copied())
            .collect();

        let target_of = |id: &SampleId| population.records()[id.0].target;
        let pool_by_class = group_by(train_pool.iter().map(|id| (target_of(id), *id)));
        let sub_folds = stratified_chunks(&pool_by_class, self.config.n_ss_folds, self.config.shuffle, &mut rng);

        let mut unlabeled_pool: Vec<SampleId> = sub_folds[1..].iter().flatten().copied().collect();

        // labeled draw
        let labeled_by_class = group_by(sub_folds[0].iter().map(|id| (target_of(id), *id)));
        let wanted = self.config.labeled_train_size_per_class;
        let mut train_labeled = BTreeSet::new();
        for class in 0..population.num_classes() {
            let mut candidates = labeled_by_class.get(&class).cloned().unwrap_or_default();
            if self.config.equal_target && candidates.len() < wanted {
                return Err(SemixupError::Config(format!(
                    "fold {}: class {} has {} labeled candidates but {} were requested",
                    k,
                    class,
                    candidates.len(),
                    wanted
                )));
            }
            candidates.shuffle(&mut rng);
            let take = wanted.min(candidates.len());
            train_labeled.extend(candidates.drain(..take));
            unlabeled_pool.extend(candidates);
        }

        let (train_unlabeled, val_unlabeled) = self.draw_unlabeled(k, unlabeled_pool, population, &mut rng)?;

        let fold = Fold {
            train_labeled,
            val_labeled,
            train_unlabeled,
            val_unlabeled,
        };
        fold.check_disjoint()?;
        Ok(fold)
    }

    fn draw_unlabeled(
        &self,
        k: usize,
        mut pool: Vec<SampleId>,
        population: &Population,
        rng: &mut ChaCha8Rng,
    ) -> Result<(BTreeSet<SampleId>, BTreeSet<SampleId>)> {
        let wanted = self.config.unlabeled_train_size_per_class;
        if wanted == 0 {
            return Ok((BTreeSet::new(), BTreeSet::new()));
        }

        // pool is assembled in a deterministic order; sort for a canonical start
        pool.sort();
        let groups: BTreeSet<usize> = population.records().iter().map(|r| r.unlabeled_target).collect();
        let mut selected = BTreeSet::new();

        if self.config.equal_unlabeled_target {
            let by_group = group_by(pool.iter().map(|id| (population.records()[id.0].unlabeled_target, *id)));
            for group in &groups {
                let mut candidates = by_group.get(group).cloned().unwrap_or_default();
                if candidates.len() < wanted {
                    return Err(SemixupError::Config(format!(
                        "fold {}: unlabeled group {} has {} candidates but {} were requested",
                        k,
                        group,
                        candidates.len(),
                        wanted
                    )));
                }
                candidates.shuffle(rng);
                selected.extend(candidates.into_iter().take(wanted));
            }
        } else {
            let total = wanted * groups.len();
            if pool.len() < total {
                return Err(SemixupError::Config(format!(
                    "fold {}: {} unlabeled candidates but {} were requested",
                    k,
                    pool.len(),
                    total
                )));
            }
            pool.shuffle(rng);
            selected.extend(pool.iter().take(total).copied());
        }

        let rest = pool.into_iter().filter(|id| !selected.contains(id)).collect();
        Ok((selected, rest))
    }
}

fn group_by<I>(pairs: I) -> BTreeMap<usize, Vec<SampleId>>
where
    I: IntoIterator<Item = (usize, SampleId)>,
{
    let mut groups: BTreeMap<usize, Vec<SampleId>> = BTreeMap::new();
    for (key, id) in pairs {
        groups.entry(key).or_default().push(id);
    }
    groups
}

/// Deal each class round-robin into `n` chunks. The offset carries over
/// between classes so chunk sizes stay within one of each other.
fn stratified_chunks(
    by_class: &BTreeMap<usize, Vec<SampleId>>,
    n: usize,
    shuffle: bool,
    rng: &mut ChaCha8Rng,
) -> Vec<Vec<SampleId>> {
    let mut chunks = vec![Vec::new(); n];
    let mut offset = 0;
    for ids in by_class.values() {
        let mut ids = ids.clone();
        ids.sort();
        if shuffle {
            ids.shuffle(rng);
        }
        for (i, id) in ids.iter().enumerate() {
            chunks[(offset + i) % n].push(*id);
        }
        offset += ids.len();
    }
    chunks
}
