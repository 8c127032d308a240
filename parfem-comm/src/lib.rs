//! Collective communication for distributed assembly.
//!
//! Every operation that needs to synchronize with other processes takes an explicit
//! [`CollectiveContext`] instead of reaching for process-wide state. Three contexts are provided:
//!
//! - [`SerialContext`]: a single rank, all collectives are trivial.
//! - [`ThreadedContext`]: several ranks living as threads of the same process, connected by
//!   one FIFO channel per ordered pair of ranks. Created through [`ThreadedUniverse`].
//! - `MpiContext` (feature `mpi`): wraps an MPI communicator.
//!
//! All collectives must be called by every rank of the context, in the same order.
use std::ops::Add;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "mpi")]
mod mpi_context;
mod serial;
mod threaded;

#[cfg(feature = "mpi")]
pub use mpi_context::MpiContext;
pub use serial::SerialContext;
pub use threaded::{ThreadedContext, ThreadedUniverse};

/// Types that can be sent between ranks.
#[cfg(not(feature = "mpi"))]
pub trait Exchangeable: Copy + Default + Send + 'static {}

#[cfg(not(feature = "mpi"))]
impl<T> Exchangeable for T where T: Copy + Default + Send + 'static {}

/// Types that can be sent between ranks.
#[cfg(feature = "mpi")]
pub trait Exchangeable: Copy + Default + Send + 'static + mpi::traits::Equivalence {}

#[cfg(feature = "mpi")]
impl<T> Exchangeable for T where T: Copy + Default + Send + 'static + mpi::traits::Equivalence {}

/// Failure of a collective operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    #[error("rank {peer} disconnected before completing the collective operation")]
    Disconnected { peer: usize },
    #[error("timed out after {timeout:?} waiting for rank {peer}")]
    Timeout { peer: usize, timeout: Duration },
    #[error("received a payload of unexpected type from rank {peer}")]
    UnexpectedPayload { peer: usize },
    #[error("expected {expected} outgoing buffers (one per rank), got {actual}")]
    BufferCount { expected: usize, actual: usize },
    #[error("ranks disagree on the shape of a collective operation: {0}")]
    Mismatch(String),
}

/// Rank/size queries and the collective primitives needed for distributed assembly.
pub trait CollectiveContext {
    /// The rank of the calling process, in `0 .. size()`.
    fn rank(&self) -> usize;

    /// The number of participating ranks.
    fn size(&self) -> usize;

    /// Block until every rank has reached the barrier.
    fn barrier(&self) -> Result<(), CommError>;

    /// Gather one value from every rank on every rank, ordered by rank.
    fn all_gather<T: Exchangeable>(&self, value: T) -> Result<Vec<T>, CommError>;

    /// Sparse all-to-all exchange.
    ///
    /// `outgoing` must contain exactly one buffer per rank; `outgoing[r]` is delivered to rank `r`.
    /// The result contains one buffer per rank, where entry `r` holds the data sent by rank `r`.
    /// The buffer addressed to the calling rank itself is passed through unchanged.
    fn exchange<T: Exchangeable>(&self, outgoing: Vec<Vec<T>>) -> Result<Vec<Vec<T>>, CommError>;

    /// Whether this is the lowest rank, which is responsible for reporting.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Sum of `value` over all ranks. Values are summed in rank order on every rank,
    /// so all ranks obtain bitwise identical results.
    fn all_reduce_sum<T>(&self, value: T) -> Result<T, CommError>
    where
        T: Exchangeable + Add<Output = T>,
    {
        let values = self.all_gather(value)?;
        Ok(values.into_iter().reduce(|a, b| a + b).unwrap_or(value))
    }

    fn all_reduce_max<T>(&self, value: T) -> Result<T, CommError>
    where
        T: Exchangeable + PartialOrd,
    {
        let values = self.all_gather(value)?;
        Ok(values
            .into_iter()
            .reduce(|a, b| if b > a { b } else { a })
            .unwrap_or(value))
    }

    fn all_reduce_min<T>(&self, value: T) -> Result<T, CommError>
    where
        T: Exchangeable + PartialOrd,
    {
        let values = self.all_gather(value)?;
        Ok(values
            .into_iter()
            .reduce(|a, b| if b < a { b } else { a })
            .unwrap_or(value))
    }

    /// Agreement point: every rank reports whether it failed locally, and every rank learns
    /// the lowest failing rank (if any).
    fn first_failure(&self, failed: bool) -> Result<Option<usize>, CommError> {
        let flags = self.all_gather(u8::from(failed))?;
        Ok(flags.iter().position(|&flag| flag != 0))
    }
}

pub(crate) fn check_buffer_count<T>(outgoing: &[Vec<T>], size: usize) -> Result<(), CommError> {
    if outgoing.len() == size {
        Ok(())
    } else {
        Err(CommError::BufferCount {
            expected: size,
            actual: outgoing.len(),
        })
    }
}
