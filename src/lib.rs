//! # Semixup
//!
//! Semi-supervised ordinal grading of radiographs with mixup consistency
//! regularization, built on the Burn framework.
//!
//! ## Features
//!
//! - **Reproducible folds**: stratified cross-validation with per-grade labeled
//!   and unlabeled budgets, persisted as JSON
//! - **Composite loss**: cross-entropy plus consistency, mixup and two
//!   consistency-mixup terms, each with its own weight and ablation switch
//! - **Named data streams** loaded and augmented in parallel
//! - **Metric callbacks**: balanced accuracy, quadratic weighted kappa,
//!   confusion matrices and metric-triggered checkpoints
//!
//! ## Modules
//!
//! - `backend`: compiled backend and device selection
//! - `config`: TOML run configuration
//! - `dataset`: population, fold splitting, augmentation and batch streams
//! - `model`: grading CNN and named parameter snapshots
//! - `training`: loss engine, callbacks and the training strategy
//! - `utils`: errors, logging and metric primitives
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use semixup::backend::{resolve_device, TrainingBackend};
//! use semixup::config::RunConfig;
//! use semixup::training::run_fold;
//!
//! let config = RunConfig::load("configs/semixup.toml")?;
//! let device = resolve_device(config.device)?;
//! let run = run_fold::<TrainingBackend>(&config, device)?;
//! println!("metrics in {:?}", run.run_dir);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::{Overrides, RunConfig};
pub use dataset::{DataProvider, Fold, FoldSplit, FoldSplitter, Population, SampleId, SplitConfig, StreamSpec};
pub use model::{Classifier, GradingCnn, GradingCnnConfig, ParamSnapshot};
pub use training::{CallbackSet, LossConfig, LossEngine, LossTerm, TrainingStrategy};
pub use utils::error::{Result, SemixupError};
pub use utils::metrics::{ConfusionMatrix, RunningAverage};

/// Number of Kellgren-Lawrence grades
pub const NUM_GRADES: usize = 5;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `KL0` .. `KL4`
pub fn grade_names() -> Vec<String> {
    (0..NUM_GRADES).map(|g| format!("KL{g}")).collect()
}
