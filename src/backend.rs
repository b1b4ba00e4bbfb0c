//! Backend abstraction - CPU (NdArray) by default, CUDA behind the `cuda` feature.
//!
//! The compute device is not detected implicitly: it is part of the run
//! configuration and resolved once with [`resolve_device`], then passed to
//! every model and tensor constructor.

use burn::backend::Autodiff;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SemixupError};

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray")))]
compile_error!("At least one backend (cuda or ndarray) must be enabled!");

/// The autodiff backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

pub type Device = <DefaultBackend as burn::tensor::backend::Backend>::Device;

/// Compute device requested by the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    #[default]
    Cpu,
    /// CUDA device ordinal
    Cuda(usize),
}

/// Map a configured device onto the compiled backend
pub fn resolve_device(choice: DeviceChoice) -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        match choice {
            DeviceChoice::Cuda(index) => Ok(burn_cuda::CudaDevice::new(index)),
            DeviceChoice::Cpu => Err(SemixupError::Config(
                "binary was built with the cuda backend; set device = { cuda = 0 }".to_string(),
            )),
        }
    }

    #[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
    {
        match choice {
            DeviceChoice::Cpu => Ok(burn_ndarray::NdArrayDevice::Cpu),
            DeviceChoice::Cuda(_) => Err(SemixupError::Config(
                "CUDA device requested but the `cuda` feature is not enabled".to_string(),
            )),
        }
    }
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
    {
        "NdArray (CPU)"
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_device_resolves() {
        assert!(resolve_device(DeviceChoice::Cpu).is_ok());
        assert_eq!(backend_name(), "NdArray (CPU)");
    }

    #[test]
    fn test_cuda_without_feature_is_config_error() {
        let err = resolve_device(DeviceChoice::Cuda(0)).unwrap_err();
        assert!(matches!(err, SemixupError::Config(_)));
    }

    #[test]
    fn test_device_choice_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            device: DeviceChoice,
        }

        let cpu: Wrapper = toml::from_str("device = \"cpu\"").unwrap();
        assert_eq!(cpu.device, DeviceChoice::Cpu);

        let gpu: Wrapper = toml::from_str("device = { cuda = 1 }").unwrap();
        assert_eq!(gpu.device, DeviceChoice::Cuda(1));
    }
}
