//! Named parameter snapshots
//!
//! A [`ParamSnapshot`] maps dotted parameter names (`conv1.bn.gamma`,
//! `fc2.weight`, ...) to shaped `f32` buffers. It is what checkpoints store
//! and what pretrained weights are loaded from.
//!
//! Loading is best-effort: a parameter is restored only when the snapshot
//! holds the same name with the same shape. Everything else keeps its
//! current value and is listed in the returned [`LoadReport`].

use std::collections::BTreeMap;
use std::path::Path;

use burn::module::{Param, RunningState};
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, Linear};
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::Classifier;
use crate::utils::error::{Result, SemixupError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSnapshot {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSnapshot {
    pub tensors: BTreeMap<String, TensorSnapshot>,
}

/// Outcome of a partial load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Restored from the snapshot
    pub loaded: Vec<String>,
    /// Present in the snapshot with a different shape; left untouched
    pub mismatched: Vec<String>,
    /// Not present in the snapshot; left untouched
    pub missing: Vec<String>,
}

impl LoadReport {
    pub fn log_summary(&self) {
        info!(
            "Pretrained weights: {} loaded, {} shape-mismatched, {} missing",
            self.loaded.len(),
            self.mismatched.len(),
            self.missing.len()
        );
        for name in &self.mismatched {
            warn!("Skipped '{}' (shape mismatch)", name);
        }
    }
}

impl ParamSnapshot {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TensorSnapshot> {
        self.tensors.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorSnapshot> {
        self.tensors.remove(name)
    }

    /// Record a tensor under `name`
    pub fn insert<B: Backend, const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) -> Result<()> {
        let shape = tensor.dims().to_vec();
        let data = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| SemixupError::Tensor(format!("{name}: {e:?}")))?;
        self.tensors.insert(name.to_string(), TensorSnapshot { shape, data });
        Ok(())
    }

    /// Snapshot data for `name` if it fits `dims`, recording the outcome
    fn matching(&self, name: &str, dims: &[usize], report: &mut LoadReport) -> Option<TensorData> {
        match self.tensors.get(name) {
            None => {
                report.missing.push(name.to_string());
                None
            }
            Some(saved) if saved.shape != dims || saved.data.len() != dims.iter().product::<usize>() => {
                report.mismatched.push(name.to_string());
                None
            }
            Some(saved) => {
                report.loaded.push(name.to_string());
                Some(TensorData::new(saved.data.clone(), saved.shape.clone()))
            }
        }
    }

    /// Restore a trainable parameter, keeping its id and gradient flag
    pub fn restore_param<B: Backend, const D: usize>(
        &self,
        name: &str,
        param: Param<Tensor<B, D>>,
        report: &mut LoadReport,
    ) -> Param<Tensor<B, D>> {
        let dims = param.val().dims();
        match self.matching(name, &dims, report) {
            Some(data) => param.map(|current| {
                let require_grad = current.is_require_grad();
                let loaded = Tensor::<B, D>::from_data(data.clone(), &current.device());
                if require_grad {
                    loaded.require_grad()
                } else {
                    loaded
                }
            }),
            None => param,
        }
    }

    /// Restore a running statistic (batch-norm mean/variance)
    pub fn restore_running<B: Backend, const D: usize>(
        &self,
        name: &str,
        state: RunningState<Tensor<B, D>>,
        report: &mut LoadReport,
    ) -> RunningState<Tensor<B, D>> {
        let current = state.value();
        match self.matching(name, &current.dims(), report) {
            Some(data) => RunningState::new(Tensor::<B, D>::from_data(data, &current.device())),
            None => state,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    /// Read a bare snapshot or the `params` of a checkpoint file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum SnapshotFile {
            Checkpoint { params: ParamSnapshot },
            Bare(ParamSnapshot),
        }

        let content = std::fs::read_to_string(path.as_ref())?;
        match serde_json::from_str::<SnapshotFile>(&content)? {
            SnapshotFile::Checkpoint { params } | SnapshotFile::Bare(params) => Ok(params),
        }
    }
}

pub fn export_conv2d<B: Backend>(prefix: &str, conv: &Conv2d<B>, snapshot: &mut ParamSnapshot) -> Result<()> {
    snapshot.insert(&format!("{prefix}.weight"), conv.weight.val())?;
    if let Some(bias) = &conv.bias {
        snapshot.insert(&format!("{prefix}.bias"), bias.val())?;
    }
    Ok(())
}

pub fn import_conv2d<B: Backend>(
    prefix: &str,
    mut conv: Conv2d<B>,
    snapshot: &ParamSnapshot,
    report: &mut LoadReport,
) -> Conv2d<B> {
    conv.weight = snapshot.restore_param(&format!("{prefix}.weight"), conv.weight, report);
    conv.bias = conv
        .bias
        .map(|bias| snapshot.restore_param(&format!("{prefix}.bias"), bias, report));
    conv
}

pub fn export_linear<B: Backend>(prefix: &str, linear: &Linear<B>, snapshot: &mut ParamSnapshot) -> Result<()> {
    snapshot.insert(&format!("{prefix}.weight"), linear.weight.val())?;
    if let Some(bias) = &linear.bias {
        snapshot.insert(&format!("{prefix}.bias"), bias.val())?;
    }
    Ok(())
}

pub fn import_linear<B: Backend>(
    prefix: &str,
    mut linear: Linear<B>,
    snapshot: &ParamSnapshot,
    report: &mut LoadReport,
) -> Linear<B> {
    linear.weight = snapshot.restore_param(&format!("{prefix}.weight"), linear.weight, report);
    linear.bias = linear
        .bias
        .map(|bias| snapshot.restore_param(&format!("{prefix}.bias"), bias, report));
    linear
}

pub fn export_batch_norm<B: Backend>(prefix: &str, bn: &BatchNorm<B>, snapshot: &mut ParamSnapshot) -> Result<()> {
    snapshot.insert(&format!("{prefix}.gamma"), bn.gamma.val())?;
    snapshot.insert(&format!("{prefix}.beta"), bn.beta.val())?;
    snapshot.insert(&format!("{prefix}.running_mean"), bn.running_mean.value())?;
    snapshot.insert(&format!("{prefix}.running_var"), bn.running_var.value())?;
    Ok(())
}

pub fn import_batch_norm<B: Backend>(
    prefix: &str,
    mut bn: BatchNorm<B>,
    snapshot: &ParamSnapshot,
    report: &mut LoadReport,
) -> BatchNorm<B> {
    bn.gamma = snapshot.restore_param(&format!("{prefix}.gamma"), bn.gamma, report);
    bn.beta = snapshot.restore_param(&format!("{prefix}.beta"), bn.beta, report);
    bn.running_mean = snapshot.restore_running(&format!("{prefix}.running_mean"), bn.running_mean, report);
    bn.running_var = snapshot.restore_running(&format!("{prefix}.running_var"), bn.running_var, report);
    bn
}

/// Load pretrained weights into `model` with partial-match semantics.
///
/// A missing file is not an error: the model is returned unchanged.
pub fn load_pretrained<B, M, P>(model: M, path: P) -> Result<(M, LoadReport)>
where
    B: Backend,
    M: Classifier<B>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.is_file() {
        warn!("Pretrained weights {:?} not found; starting from scratch", path);
        return Ok((model, LoadReport::default()));
    }

    let snapshot = ParamSnapshot::load(path)?;
    info!("Loading pretrained weights from {:?} ({} tensors)", path, snapshot.len());
    let (model, report) = model.import_params(&snapshot);
    report.log_summary();
    Ok((model, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::LinearConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_insert_records_shape() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let mut snapshot = ParamSnapshot::default();
        snapshot.insert("w", tensor).unwrap();

        let saved = snapshot.get("w").unwrap();
        assert_eq!(saved.shape, vec![2, 3]);
        assert_eq!(saved.data, vec![1.0; 6]);
    }

    #[test]
    fn test_linear_round_trip_and_mismatch() {
        let device = Default::default();
        let source = LinearConfig::new(3, 2).init::<TestBackend>(&device);
        let mut snapshot = ParamSnapshot::default();
        export_linear("fc", &source, &mut snapshot).unwrap();

        // same shape: restored
        let target = LinearConfig::new(3, 2).init::<TestBackend>(&device);
        let mut report = LoadReport::default();
        let target = import_linear("fc", target, &snapshot, &mut report);
        assert_eq!(report.loaded, vec!["fc.weight".to_string(), "fc.bias".to_string()]);
        let restored = target.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(restored, snapshot.get("fc.weight").unwrap().data);

        // other shape: untouched
        let other = LinearConfig::new(3, 4).init::<TestBackend>(&device);
        let before = other.weight.val().into_data().to_vec::<f32>().unwrap();
        let mut report = LoadReport::default();
        let other = import_linear("fc", other, &snapshot, &mut report);
        assert_eq!(report.mismatched.len(), 2);
        assert_eq!(other.weight.val().into_data().to_vec::<f32>().unwrap(), before);
    }

    #[test]
    fn test_load_accepts_checkpoint_and_bare_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut snapshot = ParamSnapshot::default();
        snapshot.tensors.insert(
            "fc.bias".to_string(),
            TensorSnapshot {
                shape: vec![2],
                data: vec![0.5, -0.5],
            },
        );

        let bare = dir.path().join("bare.json");
        snapshot.save(&bare).unwrap();
        assert_eq!(ParamSnapshot::load(&bare).unwrap(), snapshot);

        let wrapped = dir.path().join("ckpt.json");
        let doc = serde_json::json!({ "trigger": "eval_kappa", "epoch": 3, "params": snapshot });
        std::fs::write(&wrapped, doc.to_string()).unwrap();
        assert_eq!(ParamSnapshot::load(&wrapped).unwrap(), snapshot);
    }
}
