//! Errors of distributed assembly.
use parfem_comm::{CollectiveContext, CommError};
use parfem_sparse::MatrixError;
use std::error::Error;
use std::fmt;
use thiserror::Error;

/// The stage of a collective operation at which an error was detected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssemblyStage {
    PreCheck,
    SparsityPattern,
    PerCell,
    FinalizeExchange,
    /// The barriers around a timed collective operation.
    Synchronization,
}

impl fmt::Display for AssemblyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssemblyStage::PreCheck => "pre-check",
            AssemblyStage::SparsityPattern => "sparsity-pattern",
            AssemblyStage::PerCell => "per-cell",
            AssemblyStage::FinalizeExchange => "finalize-exchange",
            AssemblyStage::Synchronization => "synchronization",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("configuration error during {stage}: {message}")]
    Configuration { stage: AssemblyStage, message: String },
    #[error("integrity error during {stage}: {message}")]
    Integrity { stage: AssemblyStage, message: String },
    #[error("element kernel failed on cell {cell} during {stage}")]
    Kernel {
        stage: AssemblyStage,
        /// Global index of the failing cell.
        cell: usize,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    #[error("communication failure during {stage}")]
    Communication {
        stage: AssemblyStage,
        #[source]
        source: CommError,
    },
    #[error("rank {rank} failed during {stage}")]
    RemoteFailure { stage: AssemblyStage, rank: usize },
}

impl AssemblyError {
    pub fn stage(&self) -> AssemblyStage {
        match self {
            AssemblyError::Configuration { stage, .. }
            | AssemblyError::Integrity { stage, .. }
            | AssemblyError::Kernel { stage, .. }
            | AssemblyError::Communication { stage, .. }
            | AssemblyError::RemoteFailure { stage, .. } => *stage,
        }
    }

    pub fn configuration(stage: AssemblyStage, message: impl Into<String>) -> Self {
        AssemblyError::Configuration {
            stage,
            message: message.into(),
        }
    }

    pub fn integrity(stage: AssemblyStage, message: impl Into<String>) -> Self {
        AssemblyError::Integrity {
            stage,
            message: message.into(),
        }
    }

    pub fn communication(stage: AssemblyStage, source: CommError) -> Self {
        AssemblyError::Communication { stage, source }
    }

    /// Classify an error of the distributed matrix (or vector) at the given stage.
    pub fn from_matrix_error(stage: AssemblyStage, error: MatrixError) -> Self {
        match error {
            MatrixError::RemoteFailure { rank, .. } => AssemblyError::RemoteFailure { stage, rank },
            MatrixError::Communication(source) => AssemblyError::Communication { stage, source },
            err if err.is_integrity_violation() => AssemblyError::integrity(stage, err.to_string()),
            err => AssemblyError::configuration(stage, err.to_string()),
        }
    }

    pub fn is_remote_failure(&self) -> bool {
        matches!(self, AssemblyError::RemoteFailure { .. })
    }
}

/// Agreement point: every rank learns whether any rank failed at the given stage.
///
/// Returns the local error if there is one, otherwise an error naming the lowest failing rank.
pub(crate) fn agree<C, T>(ctx: &C, stage: AssemblyStage, result: Result<T, AssemblyError>) -> Result<T, AssemblyError>
where
    C: CollectiveContext,
{
    let first_failure = ctx
        .first_failure(result.is_err())
        .map_err(|err| AssemblyError::communication(stage, err));
    let value = result?;
    match first_failure? {
        Some(rank) => Err(AssemblyError::RemoteFailure { stage, rank }),
        None => Ok(value),
    }
}
