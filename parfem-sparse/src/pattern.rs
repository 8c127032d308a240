use crate::staging::StagingBuffers;
use crate::{agree, MatrixError, RowPartition, RowRoute};
use log::debug;
use nalgebra_sparse::pattern::SparsityPattern;
use parfem_comm::CollectiveContext;
use rayon::slice::ParallelSliceMut;
use std::sync::Arc;

/// The sparsity pattern of the owned rows of a distributed square matrix.
///
/// The local pattern has one row per owned row (in the order of
/// [`RowPartition::owned_rows`]) and one column per global column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSparsityPattern {
    partition: Arc<RowPartition>,
    local: SparsityPattern,
}

impl DistributedSparsityPattern {
    /// Collectively assemble a pattern from the `(row, col)` entries referenced on each rank.
    ///
    /// Entries may be duplicated and given in any order. Entries in rows owned by other ranks
    /// are routed to their owner in a single exchange.
    pub fn assemble<C>(
        ctx: &C,
        partition: Arc<RowPartition>,
        entries: impl IntoIterator<Item = (usize, usize)>,
    ) -> Result<Self, MatrixError>
    where
        C: CollectiveContext,
    {
        let n = partition.num_global_rows();
        let mut coordinates = Vec::new();
        let mut staging = StagingBuffers::new(partition.num_ranks(), 2);

        let routed = entries.into_iter().try_for_each(|(row, col)| {
            if col >= n {
                return Err(MatrixError::OutOfBounds { index: col, dim: n });
            }
            match partition.route(row)? {
                RowRoute::Local(local_row) => coordinates.push((local_row, col)),
                // The value is irrelevant, only the indices are used
                RowRoute::Remote(owner) => staging.push(owner, &[row, col], 0u8),
            }
            Ok(())
        });
        agree(ctx, routed, "sparsity pattern routing")?;

        let incoming = staging.exchange(ctx)?;
        let received = incoming.iter().try_for_each(|(source, indices, _)| {
            let (row, col) = (indices[0], indices[1]);
            match partition.route(row) {
                Ok(RowRoute::Local(local_row)) if col < n => {
                    coordinates.push((local_row, col));
                    Ok(())
                }
                Ok(RowRoute::Local(_)) => Err(MatrixError::OutOfBounds { index: col, dim: n }),
                _ => Err(MatrixError::Misrouted {
                    row,
                    rank: partition.rank(),
                    source_rank: source,
                }),
            }
        });
        agree(ctx, received, "sparsity pattern exchange")?;

        coordinates.par_sort_unstable();
        coordinates.dedup();

        let num_rows = partition.num_owned_rows();
        let mut row_offsets = Vec::with_capacity(num_rows + 1);
        let mut column_indices = Vec::with_capacity(coordinates.len());
        row_offsets.push(0);

        let mut current_row = 0;
        for (i, j) in coordinates {
            while i > current_row {
                row_offsets.push(column_indices.len());
                current_row += 1;
            }
            column_indices.push(j);
        }

        // Fill out offsets for remaining empty rows
        while row_offsets.len() < num_rows + 1 {
            row_offsets.push(column_indices.len());
        }

        let local = SparsityPattern::try_from_offsets_and_indices(num_rows, n, row_offsets, column_indices)
            .map_err(|err| MatrixError::InvalidPartition(format!("failed to build local pattern: {err}")))?;

        debug!(
            "[{}] assembled sparsity pattern: {} owned rows, {} local nonzeros, {} entries received",
            partition.rank(),
            num_rows,
            local.nnz(),
            incoming.num_received()
        );

        Ok(Self { partition, local })
    }

    pub fn partition(&self) -> &Arc<RowPartition> {
        &self.partition
    }

    pub fn local_pattern(&self) -> &SparsityPattern {
        &self.local
    }

    pub fn local_nnz(&self) -> usize {
        self.local.nnz()
    }

    /// Total number of structural nonzeros over all ranks. Collective.
    pub fn global_nnz<C: CollectiveContext>(&self, ctx: &C) -> Result<usize, MatrixError> {
        Ok(ctx.all_reduce_sum(self.local_nnz())?)
    }

    pub fn into_parts(self) -> (Arc<RowPartition>, SparsityPattern) {
        (self.partition, self.local)
    }
}
