//! Metric-triggered checkpoint files

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::ParamSnapshot;
use crate::utils::error::{Result, SemixupError};

/// Improvement direction of a watched metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Min,
    Max,
}

impl Direction {
    /// `+1` for metrics to maximize, `-1` for metrics to minimize
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Min => -1.0,
            Direction::Max => 1.0,
        }
    }

    pub fn is_better(&self, candidate: f64, best: f64) -> bool {
        match self {
            Direction::Min => candidate < best,
            Direction::Max => candidate > best,
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = SemixupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "min" => Ok(Direction::Min),
            "max" => Ok(Direction::Max),
            other => Err(SemixupError::Config(format!("direction must be 'min' or 'max', got '{other}'"))),
        }
    }
}

/// Metric value recorded with a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetric {
    pub name: String,
    pub value: f64,
    pub direction: Direction,
}

/// Parameters saved because `trigger` improved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub trigger: String,
    pub epoch: usize,
    /// RFC 3339
    pub timestamp: String,
    pub metrics: Vec<TriggerMetric>,
    pub params: ParamSnapshot,
}

impl Checkpoint {
    pub fn new(trigger: impl Into<String>, epoch: usize, metrics: Vec<TriggerMetric>, params: ParamSnapshot) -> Self {
        Self {
            trigger: trigger.into(),
            epoch,
            timestamp: chrono::Local::now().to_rfc3339(),
            metrics,
            params,
        }
    }

    /// Write the checkpoint, replacing any previous file at `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)
            .map_err(|e| SemixupError::Checkpoint(format!("failed to write {}: {e}", path.display())))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SemixupError::Checkpoint(format!("failed to read {}: {e}", path.display())))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::snapshot::TensorSnapshot;

    #[test]
    fn test_direction() {
        assert!(Direction::Min.is_better(0.1, 0.2));
        assert!(!Direction::Min.is_better(0.2, 0.2));
        assert!(Direction::Max.is_better(0.3, 0.2));
        assert_eq!("max".parse::<Direction>().unwrap(), Direction::Max);
        assert!("up".parse::<Direction>().is_err());
    }

    #[test]
    fn test_save_overwrites_and_loads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("models").join("eval_kappa.json");

        let mut params = ParamSnapshot::default();
        params.tensors.insert(
            "fc2.bias".to_string(),
            TensorSnapshot {
                shape: vec![2],
                data: vec![1.0, 2.0],
            },
        );
        let metric = |value| TriggerMetric {
            name: "eval/kappa".to_string(),
            value,
            direction: Direction::Max,
        };

        Checkpoint::new("eval_kappa", 1, vec![metric(0.4)], params.clone()).save(&path).unwrap();
        Checkpoint::new("eval_kappa", 4, vec![metric(0.6)], params.clone()).save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.epoch, 4);
        assert_eq!(loaded.metrics[0].value, 0.6);
        assert_eq!(loaded.params, params);
        assert!(chrono::DateTime::parse_from_rfc3339(&loaded.timestamp).is_ok());

        // pretrained loading reads the params of a checkpoint file
        assert_eq!(ParamSnapshot::load(&path).unwrap(), params);
    }
}
