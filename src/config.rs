//! Configuration of the assembly engine.
use eyre::{eyre, WrapErr};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Options controlling how assembly is carried out.
///
/// None of the options change the assembled values beyond rounding.
///
/// Can be loaded from JSON, where every field is optional:
///
/// ```json
/// { "parallel_kernels": true, "kernel_chunk_size": 512 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssemblyConfig {
    /// Evaluate element kernels for a chunk of cells in parallel (with rayon) before inserting
    /// the local tensors sequentially.
    pub parallel_kernels: bool,
    /// Number of cells per chunk when kernels are evaluated in parallel.
    pub kernel_chunk_size: usize,
    /// Collectively check the owner of every single DOF before assembling.
    ///
    /// The total number of owned DOFs is checked regardless.
    pub validate_ownership: bool,
    /// Receive timeout of in-process ranks, in seconds. No timeout if absent.
    pub communication_timeout_secs: Option<f64>,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            parallel_kernels: false,
            kernel_chunk_size: 1024,
            validate_ownership: true,
            communication_timeout_secs: None,
        }
    }
}

impl AssemblyConfig {
    pub fn from_json_str(json: &str) -> eyre::Result<Self> {
        let config: Self = serde_json::from_str(json).wrap_err("Failed to parse assembly configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read assembly configuration from {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.kernel_chunk_size == 0 {
            return Err(eyre!("kernel_chunk_size must be positive"));
        }
        match self.communication_timeout_secs {
            Some(secs) if !(secs.is_finite() && secs > 0.0) => {
                Err(eyre!("communication_timeout_secs must be positive and finite, got {secs}"))
            }
            _ => Ok(()),
        }
    }

    pub fn communication_timeout(&self) -> Option<Duration> {
        self.communication_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn with_parallel_kernels(self, parallel_kernels: bool) -> Self {
        Self {
            parallel_kernels,
            ..self
        }
    }

    pub fn with_kernel_chunk_size(self, kernel_chunk_size: usize) -> Self {
        Self {
            kernel_chunk_size,
            ..self
        }
    }

    pub fn with_ownership_validation(self, validate_ownership: bool) -> Self {
        Self {
            validate_ownership,
            ..self
        }
    }
}
