use crate::staging::StagingBuffers;
use crate::{agree, AccumulationState, FinalizeStats, InsertionCounts, MatrixError, Real, RowPartition, RowRoute};
use log::debug;
use nalgebra::DVector;
use parfem_comm::CollectiveContext;
use std::sync::Arc;

/// A vector partitioned by row ownership, with the same accumulation protocol as
/// [`DistributedCsrMatrix`](crate::DistributedCsrMatrix).
#[derive(Debug, Clone)]
pub struct DistributedVector<T> {
    partition: Arc<RowPartition>,
    local: DVector<T>,
    staging: StagingBuffers<T>,
    state: AccumulationState,
}

impl<T: Real> DistributedVector<T> {
    pub fn zeros(partition: Arc<RowPartition>) -> Self {
        Self {
            local: DVector::zeros(partition.num_owned_rows()),
            staging: StagingBuffers::new(partition.num_ranks(), 1),
            partition,
            state: AccumulationState::Open,
        }
    }

    pub fn partition(&self) -> &Arc<RowPartition> {
        &self.partition
    }

    pub fn state(&self) -> AccumulationState {
        self.state
    }

    /// The owned entries, in the order of [`RowPartition::owned_rows`].
    pub fn local_vector(&self) -> &DVector<T> {
        &self.local
    }

    pub fn add(&mut self, row: usize, value: T) -> Result<(), MatrixError> {
        if self.state != AccumulationState::Open {
            return Err(MatrixError::NotOpen);
        }
        match self.partition.route(row)? {
            RowRoute::Local(local_row) => self.local[local_row] += value,
            RowRoute::Remote(owner) => self.staging.push(owner, &[row], value),
        }
        Ok(())
    }

    /// Add a dense local vector to the entries at the global indices `rows`.
    pub fn add_local_vector(&mut self, rows: &[usize], values: &DVector<T>) -> Result<InsertionCounts, MatrixError> {
        if rows.len() != values.len() {
            return Err(MatrixError::ShapeMismatch {
                expected: (rows.len(), 1),
                actual: (values.len(), 1),
            });
        }

        let mut counts = InsertionCounts::default();
        for (&row, &value) in rows.iter().zip(values.iter()) {
            self.add(row, value)?;
            if self.partition.is_owned(row) {
                counts.local += 1;
            } else {
                counts.staged += 1;
            }
        }
        Ok(counts)
    }

    /// Collective. See [`DistributedCsrMatrix::finalize`](crate::DistributedCsrMatrix::finalize).
    pub fn finalize<C: CollectiveContext>(&mut self, ctx: &C) -> Result<FinalizeStats, MatrixError> {
        let open = match self.state {
            AccumulationState::Open => Ok(()),
            AccumulationState::Assembled => Err(MatrixError::NotOpen),
        };
        agree(ctx, open, "finalize")?;

        let incoming = self.staging.exchange(ctx)?;
        let rank = self.partition.rank();
        let applied = incoming.iter().try_for_each(|(source, indices, value)| {
            let row = indices[0];
            match self.partition.route(row) {
                Ok(RowRoute::Local(local_row)) => {
                    self.local[local_row] += value;
                    Ok(())
                }
                _ => Err(MatrixError::Misrouted {
                    row,
                    rank,
                    source_rank: source,
                }),
            }
        });
        agree(ctx, applied, "finalize")?;

        self.state = AccumulationState::Assembled;
        let stats = FinalizeStats {
            sent: incoming.sent,
            received: incoming.num_received(),
        };
        debug!(
            "[{}] finalized vector: sent {} contributions, received {}",
            rank, stats.sent, stats.received
        );
        Ok(stats)
    }

    pub fn reopen(&mut self) {
        self.state = AccumulationState::Open;
    }

    pub fn fill_zero(&mut self) {
        self.local.fill(T::zero());
        self.staging.clear();
        self.state = AccumulationState::Open;
    }

    /// The locally stored value of a global entry, if it is owned by this rank.
    pub fn get(&self, row: usize) -> Option<T> {
        self.partition.local_index(row).map(|local_row| self.local[local_row])
    }

    /// Sum of all entries. Collective.
    pub fn sum<C: CollectiveContext>(&self, ctx: &C) -> Result<T, MatrixError> {
        Ok(ctx.all_reduce_sum(self.local.sum())?)
    }

    /// Euclidean norm. Collective.
    pub fn norm<C: CollectiveContext>(&self, ctx: &C) -> Result<T, MatrixError> {
        Ok(ctx.all_reduce_sum(self.local.norm_squared())?.sqrt())
    }

    /// Collect the complete vector on rank `root`. Collective.
    pub fn gather<C: CollectiveContext>(&self, ctx: &C, root: usize) -> Result<Option<DVector<T>>, MatrixError> {
        let assembled = match self.state {
            AccumulationState::Assembled if root < ctx.size() => Ok(()),
            AccumulationState::Assembled => Err(MatrixError::OutOfBounds {
                index: root,
                dim: ctx.size(),
            }),
            AccumulationState::Open => Err(MatrixError::NotAssembled),
        };
        agree(ctx, assembled, "gather")?;

        let mut indices = vec![Vec::new(); ctx.size()];
        let mut values = vec![Vec::new(); ctx.size()];
        indices[root] = self.partition.owned_rows().to_vec();
        values[root] = self.local.as_slice().to_vec();
        let indices = ctx.exchange(indices)?;
        let values = ctx.exchange(values)?;

        if ctx.rank() != root {
            return Ok(None);
        }

        let mut result = DVector::zeros(self.partition.num_global_rows());
        for (idx, vals) in indices.iter().zip(&values) {
            for (&row, &v) in idx.iter().zip(vals) {
                result[row] += v;
            }
        }
        Ok(Some(result))
    }
}
