//! Sampling configuration
//!
//! ```toml
//! [train.data_provider.labeled]
//! batches = 1
//!
//! [train.data_provider.unlabeled]
//! batches = 1
//!
//! [eval.data_provider.val_labeled]
//! batches = 1
//! ```
//! Only the stream names are interpreted; per-stream tables are kept opaque.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::load_toml_config;
use crate::utils::error::Result;

/// Streams taking part in one phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseSampling {
    #[serde(default)]
    pub data_provider: BTreeMap<String, toml::Table>,
}

impl PhaseSampling {
    pub fn stream_names(&self) -> Vec<String> {
        self.data_provider.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub train: PhaseSampling,
    #[serde(default)]
    pub eval: PhaseSampling,
}

impl SamplingConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_toml_config(path.as_ref())
    }

    /// labeled + unlabeled for training, val_labeled for evaluation
    pub fn semixup_default() -> Self {
        let phase = |names: &[&str]| PhaseSampling {
            data_provider: names.iter().map(|n| (n.to_string(), toml::Table::new())).collect(),
        };
        Self {
            train: phase(&["labeled", "unlabeled"]),
            eval: phase(&["val_labeled"]),
        }
    }
}
