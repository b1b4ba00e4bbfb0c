//! Run configuration
//!
//! A run is described by one TOML document. Every section and field has a
//! default, so an empty file is a valid configuration:
//!
//! ```toml
//! device = "cpu"            # or { cuda = 0 }
//!
//! [data]
//! root = "data/kl"
//! split_file = "data/folds.json"
//!
//! [split]
//! labeled_train_size_per_class = 100
//! unlabeled_train_size_per_class = 500
//!
//! [loss]
//! elim_loss = ["cons"]
//!
//! [training]
//! n_epochs = 100
//! fold_index = 0
//! ```

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::DeviceChoice;
use crate::dataset::augmentation::AugmentationConfig;
use crate::dataset::split::SplitConfig;
use crate::training::loss::{LossConfig, LossTerm};
use crate::utils::error::{Result, SemixupError};

/// Read and deserialize a TOML document
pub fn load_toml_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| SemixupError::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&content).map_err(|e| SemixupError::Config(format!("{}: {e}", path.display())))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory with one sub-folder per grade
    pub root: PathBuf,
    /// JSON manifest used instead of scanning `root`
    pub manifest: Option<PathBuf>,
    /// Grade names for manifest populations
    pub class_names: Vec<String>,
    /// Persisted fold split; generated on first use
    pub split_file: PathBuf,
    /// Sampling configuration; labeled + unlabeled / val_labeled when unset
    pub sampling_file: Option<PathBuf>,
    pub image_size: usize,
    /// Decode every image once before training
    pub preload: bool,
    pub augmentation: AugmentationConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/kl"),
            manifest: None,
            class_names: crate::grade_names(),
            split_file: PathBuf::from("data/folds.json"),
            sampling_file: None,
            image_size: 128,
            preload: false,
            augmentation: AugmentationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_filters: usize,
    pub hidden_size: usize,
    pub dropout_rate: f64,
    /// Parameter snapshot or checkpoint loaded with partial matching
    pub pretrained: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_filters: 32,
            hidden_size: 128,
            dropout_rate: 0.35,
            pretrained: None,
        }
    }
}

/// Adam settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            beta1: 0.95,
            beta2: 0.999,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// 0-based index into the fold split
    pub fold_index: usize,
    pub n_epochs: usize,
    /// Steps per epoch; the longest training stream when unset
    pub n_training_batches: Option<usize>,
    pub validate_every: usize,
    pub batch_size: usize,
    /// Loader threads
    pub num_threads: usize,
    /// Finished batches queued ahead of the training loop, per stream
    pub prefetch_batches: usize,
    /// Also serve the labeled training samples on the unlabeled stream
    pub unlabeled_includes_labeled: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            fold_index: 0,
            n_epochs: 100,
            n_training_batches: None,
            validate_every: 1,
            batch_size: 32,
            num_threads: 4,
            prefetch_batches: 2,
            unlabeled_includes_labeled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Parent of the per-run directories
    pub log_dir: PathBuf,
    /// Suffix of the run directory name
    pub comment: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("runs"),
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub device: DeviceChoice,
    pub data: DataConfig,
    pub split: SplitConfig,
    pub model: ModelConfig,
    pub optim: OptimConfig,
    pub loss: LossConfig,
    pub training: TrainingConfig,
    pub output: OutputConfig,
}

/// Command-line values that replace config fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub fold_index: Option<usize>,
    pub n_labels: Option<usize>,
    pub n_unlabels: Option<usize>,
    pub n_epochs: Option<usize>,
    pub remove_loss: Vec<LossTerm>,
    pub pretrained: Option<PathBuf>,
    pub comment: Option<String>,
}

impl RunConfig {
    /// Load and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_toml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(fold) = overrides.fold_index {
            self.training.fold_index = fold;
        }
        if let Some(n) = overrides.n_labels {
            self.split.labeled_train_size_per_class = n;
        }
        if let Some(n) = overrides.n_unlabels {
            self.split.unlabeled_train_size_per_class = n;
        }
        if let Some(n) = overrides.n_epochs {
            self.training.n_epochs = n;
        }
        for term in &overrides.remove_loss {
            if !self.loss.elim_loss.contains(term) {
                self.loss.elim_loss.push(*term);
            }
        }
        if overrides.pretrained.is_some() {
            self.model.pretrained = overrides.pretrained.clone();
        }
        if overrides.comment.is_some() {
            self.output.comment = overrides.comment.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.split.validate()?;
        self.data.augmentation.validate()?;

        let positive = [
            ("training.batch_size", self.training.batch_size),
            ("training.num_threads", self.training.num_threads),
            ("training.prefetch_batches", self.training.prefetch_batches),
            ("training.n_epochs", self.training.n_epochs),
            ("training.validate_every", self.training.validate_every),
            ("data.image_size", self.data.image_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(SemixupError::Config(format!("{name} must be positive")));
        }
        if self.training.n_training_batches == Some(0) {
            return Err(SemixupError::Config("training.n_training_batches must be positive".to_string()));
        }
        if self.training.fold_index >= self.split.n_folds {
            return Err(SemixupError::Config(format!(
                "fold index {} is out of range for {} folds",
                self.training.fold_index, self.split.n_folds
            )));
        }
        if self.optim.learning_rate <= 0.0 {
            return Err(SemixupError::Config(format!(
                "learning rate must be positive, got {}",
                self.optim.learning_rate
            )));
        }
        for (name, beta) in [("beta1", self.optim.beta1), ("beta2", self.optim.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(SemixupError::Config(format!("{name} must lie in [0, 1), got {beta}")));
            }
        }
        if self.loss.enabled_terms().is_empty() {
            return Err(SemixupError::Config("every loss term is eliminated".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: RunConfig = toml::from_str("").unwrap();
        assert_eq!(config, RunConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.loss.cons_coef, 2.0);
        assert_eq!(config.device, DeviceChoice::Cpu);
    }

    #[test]
    fn test_partial_document() {
        let doc = r#"
            device = { cuda = 1 }

            [split]
            labeled_train_size_per_class = 10
            unlabeled_train_size_per_class = 50

            [loss]
            elim_loss = ["cons", "cons_mixup"]

            [training]
            fold_index = 2
        "#;
        let config: RunConfig = toml::from_str(doc).unwrap();
        assert_eq!(config.device, DeviceChoice::Cuda(1));
        assert_eq!(config.split.labeled_train_size_per_class, 10);
        assert_eq!(config.split.n_folds, 5);
        assert_eq!(config.loss.elim_loss, vec![LossTerm::Cons, LossTerm::ConsMixup]);
        assert_eq!(config.training.fold_index, 2);
        assert_eq!(config.training.batch_size, 32);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = RunConfig::default();
        config.training.n_training_batches = Some(20);
        config.output.comment = Some("ablation".to_string());

        config.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validation_errors() {
        let cases: Vec<Box<dyn Fn(&mut RunConfig)>> = vec![
            Box::new(|c| c.training.batch_size = 0),
            Box::new(|c| c.training.prefetch_batches = 0),
            Box::new(|c| c.training.fold_index = 5),
            Box::new(|c| c.split.n_ss_folds = 1),
            Box::new(|c| c.optim.learning_rate = 0.0),
            Box::new(|c| c.optim.beta2 = 1.0),
            Box::new(|c| c.training.n_training_batches = Some(0)),
            Box::new(|c| c.loss.elim_loss = LossTerm::ALL.to_vec()),
            Box::new(|c| {
                c.loss.elim_loss = LossTerm::ALL.to_vec();
                c.loss.elim_loss.insert(0, LossTerm::Cons);
            }),
            Box::new(|c| c.data.augmentation.rotation_degrees = -5.0),
            Box::new(|c| c.data.augmentation.contrast_prob = 2.0),
        ];
        for mutate in cases {
            let mut config = RunConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(SemixupError::Config(_))));
        }
    }

    #[test]
    fn test_overrides() {
        let mut config = RunConfig::default();
        config.loss.elim_loss = vec![LossTerm::Cons];
        config.apply_overrides(&Overrides {
            fold_index: Some(3),
            n_labels: Some(10),
            n_unlabels: Some(0),
            n_epochs: Some(2),
            remove_loss: vec![LossTerm::Cons, LossTerm::Mixup],
            pretrained: Some(PathBuf::from("weights.json")),
            comment: None,
        });

        assert_eq!(config.training.fold_index, 3);
        assert_eq!(config.split.labeled_train_size_per_class, 10);
        assert_eq!(config.split.unlabeled_train_size_per_class, 0);
        assert_eq!(config.training.n_epochs, 2);
        assert_eq!(config.loss.elim_loss, vec![LossTerm::Cons, LossTerm::Mixup]);
        assert_eq!(config.model.pretrained, Some(PathBuf::from("weights.json")));
        assert_eq!(config.output.comment, None);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            RunConfig::load("/no/such/config.toml"),
            Err(SemixupError::Config(_))
        ));
    }

    #[test]
    fn test_shipped_configs_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs");
        let config = RunConfig::load(root.join("semixup.toml")).unwrap();
        assert_eq!(config.split, SplitConfig::default());
        assert_eq!(config.loss, LossConfig::default());
        assert_eq!(config.training, TrainingConfig::default());

        let sampling = crate::dataset::sampling::SamplingConfig::load(root.join("sampling.toml")).unwrap();
        assert_eq!(sampling.train.stream_names(), vec!["labeled", "unlabeled"]);
    }
}
