//! Dataset module for Semixup data handling
//!
//! This module provides functionality for:
//! - Building the sample population from class folders or a manifest
//! - Stratified cross-validation folds with labeled/unlabeled partitions
//! - Image decoding, caching and augmentation
//! - Named, restartable batch streams and Burn batching
//!
//! ## Fold Layout
//!
//! Every fold holds four disjoint partitions:
//! 1. **train_labeled**: a fixed number of labeled samples per grade
//! 2. **val_labeled**: the held-out chunk of the outer cross-validation
//! 3. **train_unlabeled**: samples whose labels are hidden during training
//! 4. **val_unlabeled**: the remaining training-side samples

pub mod augmentation;
pub mod burn_dataset;
pub mod loader;
pub mod provider;
pub mod sampling;
pub mod source;
pub mod split;

// Re-export main types for convenience
pub use augmentation::{AugmentationConfig, Augmenter, Normalization, SampleTransform};
pub use burn_dataset::{RandomRearrange, Rearrange, SampleItem, SemixupBatch, SemixupBatcher};
pub use loader::{ManifestEntry, Population, SampleId, SampleRecord};
pub use provider::{BatchStream, DataProvider, StreamSpec};
pub use sampling::{PhaseSampling, SamplingConfig};
pub use source::{DiskSource, MemorySource, SampleSource};
pub use split::{Fold, FoldSplit, FoldSplitter, FoldStats, SplitConfig};

/// Image extensions picked up by directory scans
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
