//! Training module for Semixup
//!
//! This module provides:
//! - The composite consistency/mixup loss ([`loss`])
//! - Metric meters and checkpoint savers ([`callbacks`], [`checkpoint`])
//! - The epoch loop over named data streams ([`strategy`])
//! - One-fold orchestration from configuration to run directory ([`pipeline`])
//!
//! ## Semi-Supervised Learning Approach
//!
//! Every training step combines:
//! 1. Cross-entropy on a labeled batch
//! 2. Agreement between two augmentations of an unlabeled batch
//! 3. Linear behaviour of the outputs between mixed pairs of inputs
//! 4. The same mixup constraint on augmented unlabeled inputs

pub mod callbacks;
pub mod checkpoint;
pub mod loss;
pub mod pipeline;
pub mod strategy;

pub use callbacks::{BatchRecord, Callback, CallbackSet, CheckpointSaver, MetricCallback};
pub use checkpoint::{Checkpoint, Direction};
pub use loss::{LossConfig, LossEngine, LossOutput, LossTerm, MixupPair};
pub use pipeline::{run_fold, FoldRun};
pub use strategy::{MetricHistory, StrategyConfig, StrategyState, TrainingStrategy};
