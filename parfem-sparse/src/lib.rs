//! Distributed sparse matrices and vectors, partitioned by row ownership.
//!
//! Every rank stores the complete rows it owns (including columns that refer to
//! remotely owned unknowns) and stages contributions to rows owned by other ranks.
//! Staged contributions are sent to their owners in a single batched exchange when the
//! matrix (or vector) is finalized.
//!
//! The typical life cycle is
//!
//! 1. build a [`RowPartition`] from the ownership table of a degree-of-freedom map,
//! 2. collectively assemble a [`DistributedSparsityPattern`],
//! 3. allocate a [`DistributedCsrMatrix`] and add contributions while it is open,
//! 4. [`finalize`](DistributedCsrMatrix::finalize) it collectively.
use nalgebra::RealField;
use parfem_comm::{CollectiveContext, CommError, Exchangeable};
use thiserror::Error;

mod matrix;
mod partition;
mod pattern;
mod staging;
mod vector;

pub use matrix::*;
pub use partition::*;
pub use pattern::*;
pub use vector::*;

pub extern crate nalgebra_sparse;

/// Scalar types that can be stored in distributed matrices and sent between ranks.
pub trait Real: RealField + Copy + Exchangeable {}

impl<T> Real for T where T: RealField + Copy + Exchangeable {}

/// Accumulation state of a distributed matrix or vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationState {
    /// Contributions may be added.
    Open,
    /// Finalized. All contributions have been delivered to their owners.
    Assembled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("global index {index} is neither owned by rank {rank} nor routed to a remote owner")]
    Unroutable { index: usize, rank: usize },
    #[error("rank {rank} received a contribution for row {row} from rank {source_rank}, but does not own it")]
    Misrouted { row: usize, rank: usize, source_rank: usize },
    #[error("entry ({row}, {col}) is not part of the preallocated sparsity pattern")]
    OutsidePattern { row: usize, col: usize },
    #[error("index {index} is out of bounds for dimension {dim}")]
    OutOfBounds { index: usize, dim: usize },
    #[error("invalid row partition: {0}")]
    InvalidPartition(String),
    #[error("block of shape {actual:?} does not match index lists of shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("contributions can only be added while the accumulation is open")]
    NotOpen,
    #[error("the operation requires a finalized accumulation")]
    NotAssembled,
    #[error("rank {rank} failed during {operation}")]
    RemoteFailure { rank: usize, operation: &'static str },
    #[error(transparent)]
    Communication(#[from] CommError),
}

/// Where the entries of a batched insertion ended up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InsertionCounts {
    /// Entries added directly to locally owned rows.
    pub local: usize,
    /// Entries staged for remote owners.
    pub staged: usize,
}

impl std::ops::AddAssign for InsertionCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.local += rhs.local;
        self.staged += rhs.staged;
    }
}

/// Number of contributions moved by a finalize exchange, as seen from one rank.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeStats {
    pub sent: usize,
    pub received: usize,
}

impl MatrixError {
    /// Whether the error indicates inconsistent ownership or index data.
    pub fn is_integrity_violation(&self) -> bool {
        use MatrixError::*;
        matches!(
            self,
            Unroutable { .. } | Misrouted { .. } | OutsidePattern { .. } | OutOfBounds { .. } | InvalidPartition(_)
        )
    }
}

/// Agreement point: all ranks learn whether any rank failed before proceeding.
///
/// Returns the local error if there is one, otherwise an error naming the lowest failing rank.
pub(crate) fn agree<C, T>(ctx: &C, result: Result<T, MatrixError>, operation: &'static str) -> Result<T, MatrixError>
where
    C: CollectiveContext,
{
    let first_failure = ctx.first_failure(result.is_err());
    let value = result?;
    match first_failure? {
        Some(rank) => Err(MatrixError::RemoteFailure { rank, operation }),
        None => Ok(value),
    }
}
