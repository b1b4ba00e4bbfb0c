//! Model module
//!
//! - [`cnn`]: the default grading network
//! - [`snapshot`]: named parameter snapshots and partial-match loading
//!
//! Training code is generic over [`Classifier`], so any Burn module that
//! maps `[batch, 1, H, W]` images to `[batch, num_classes]` logits and can
//! export/import named parameters plugs in.

pub mod cnn;
pub mod snapshot;

use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};

pub use cnn::{GradingCnn, GradingCnnConfig};
pub use snapshot::{load_pretrained, LoadReport, ParamSnapshot};

use crate::utils::error::Result;

/// Export of named parameter values, independent of the backend
pub trait NamedParams {
    fn export_params(&self) -> Result<ParamSnapshot>;
}

/// A classifier the training strategy can drive
pub trait Classifier<B: Backend>: Module<B> + NamedParams {
    /// Raw logits, `[batch, num_classes]`
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn num_classes(&self) -> usize;

    /// Restore parameters whose name and shape match `snapshot`; the rest keep their values
    fn import_params(self, snapshot: &ParamSnapshot) -> (Self, LoadReport);
}
