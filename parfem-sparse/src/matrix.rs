use crate::staging::StagingBuffers;
use crate::{
    agree, AccumulationState, DistributedSparsityPattern, FinalizeStats, InsertionCounts, MatrixError, Real,
    RowPartition, RowRoute,
};
use log::debug;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use parfem_comm::CollectiveContext;
use std::sync::Arc;

/// A square sparse matrix partitioned by row ownership.
///
/// Each rank stores its owned rows in CSR format, with all global columns. Contributions to
/// rows owned by other ranks are staged and delivered to the owner by
/// [`finalize`](Self::finalize).
#[derive(Debug, Clone)]
pub struct DistributedCsrMatrix<T> {
    partition: Arc<RowPartition>,
    local: CsrMatrix<T>,
    staging: StagingBuffers<T>,
    state: AccumulationState,
    // Buffer for sorting the columns of batched insertions
    column_permutation: Vec<usize>,
}

impl<T: Real> DistributedCsrMatrix<T> {
    /// Allocate an open matrix with the given pattern and all values zero.
    pub fn zeros(pattern: &DistributedSparsityPattern) -> Self {
        let partition = Arc::clone(pattern.partition());
        let local_pattern = pattern.local_pattern().clone();
        let nnz = local_pattern.nnz();
        let local = CsrMatrix::try_from_pattern_and_values(local_pattern, vec![T::zero(); nnz])
            .expect("Number of values always matches the pattern");
        Self {
            staging: StagingBuffers::new(partition.num_ranks(), 2),
            partition,
            local,
            state: AccumulationState::Open,
            column_permutation: Vec::new(),
        }
    }

    pub fn partition(&self) -> &Arc<RowPartition> {
        &self.partition
    }

    pub fn state(&self) -> AccumulationState {
        self.state
    }

    /// The global dimension of the (square) matrix.
    pub fn num_global_rows(&self) -> usize {
        self.partition.num_global_rows()
    }

    /// The owned rows, in the order of [`RowPartition::owned_rows`].
    pub fn local_matrix(&self) -> &CsrMatrix<T> {
        &self.local
    }

    pub fn into_local_matrix(self) -> CsrMatrix<T> {
        self.local
    }

    /// Number of contributions currently staged for remote owners.
    pub fn num_staged(&self) -> usize {
        self.staging.len()
    }

    fn check_open(&self) -> Result<(), MatrixError> {
        match self.state {
            AccumulationState::Open => Ok(()),
            AccumulationState::Assembled => Err(MatrixError::NotOpen),
        }
    }

    fn check_column(&self, col: usize) -> Result<(), MatrixError> {
        let n = self.num_global_rows();
        if col < n {
            Ok(())
        } else {
            Err(MatrixError::OutOfBounds { index: col, dim: n })
        }
    }

    fn add_to_owned_row(
        &mut self,
        local_row: usize,
        global_row: usize,
        col: usize,
        value: T,
    ) -> Result<(), MatrixError> {
        let mut row = self.local.row_mut(local_row);
        let (cols, values) = row.cols_and_values_mut();
        let idx = cols
            .binary_search(&col)
            .map_err(|_| MatrixError::OutsidePattern { row: global_row, col })?;
        values[idx] += value;
        Ok(())
    }

    /// Add `value` to the entry at global `(row, col)`.
    pub fn add(&mut self, row: usize, col: usize, value: T) -> Result<(), MatrixError> {
        self.check_open()?;
        self.check_column(col)?;
        match self.partition.route(row)? {
            RowRoute::Local(local_row) => self.add_to_owned_row(local_row, row, col, value),
            RowRoute::Remote(owner) => {
                self.staging.push(owner, &[row, col], value);
                Ok(())
            }
        }
    }

    /// Add a dense block to the entries at the global indices `rows × cols`.
    ///
    /// Index lists may contain duplicates, in which case the corresponding contributions
    /// are summed.
    pub fn add_local_matrix(
        &mut self,
        rows: &[usize],
        cols: &[usize],
        block: &DMatrix<T>,
    ) -> Result<InsertionCounts, MatrixError> {
        self.check_open()?;
        if block.shape() != (rows.len(), cols.len()) {
            return Err(MatrixError::ShapeMismatch {
                expected: (rows.len(), cols.len()),
                actual: block.shape(),
            });
        }
        for &col in cols {
            self.check_column(col)?;
        }

        let mut permutation = std::mem::take(&mut self.column_permutation);
        permutation.clear();
        permutation.extend(0..cols.len());
        permutation.sort_unstable_by_key(|&j| cols[j]);

        let result = self.add_block_rows(rows, cols, block, &permutation);
        self.column_permutation = permutation;
        result
    }

    fn add_block_rows(
        &mut self,
        rows: &[usize],
        cols: &[usize],
        block: &DMatrix<T>,
        sorted_permutation: &[usize],
    ) -> Result<InsertionCounts, MatrixError> {
        let mut counts = InsertionCounts::default();
        for (i, &row) in rows.iter().enumerate() {
            match self.partition.route(row)? {
                RowRoute::Local(local_row) => {
                    let mut csr_row = self.local.row_mut(local_row);
                    let (csr_cols, values) = csr_row.cols_and_values_mut();

                    // Both the CSR row and the permuted columns are sorted, so a single
                    // forward scan finds every entry
                    let mut k = 0;
                    for &j in sorted_permutation {
                        let col = cols[j];
                        while k < csr_cols.len() && csr_cols[k] < col {
                            k += 1;
                        }
                        if k < csr_cols.len() && csr_cols[k] == col {
                            values[k] += block[(i, j)];
                        } else {
                            return Err(MatrixError::OutsidePattern { row, col });
                        }
                    }
                    counts.local += cols.len();
                }
                RowRoute::Remote(owner) => {
                    for (j, &col) in cols.iter().enumerate() {
                        self.staging.push(owner, &[row, col], block[(i, j)]);
                    }
                    counts.staged += cols.len();
                }
            }
        }
        Ok(counts)
    }

    /// Deliver all staged contributions to their owners and mark the matrix as assembled.
    ///
    /// Collective. Either every rank succeeds, or every rank returns an error.
    pub fn finalize<C: CollectiveContext>(&mut self, ctx: &C) -> Result<FinalizeStats, MatrixError> {
        agree(ctx, self.check_open(), "finalize")?;

        let incoming = self.staging.exchange(ctx)?;
        let rank = self.partition.rank();
        let applied = incoming.iter().try_for_each(|(source, indices, value)| {
            let (row, col) = (indices[0], indices[1]);
            match self.partition.route(row) {
                Ok(RowRoute::Local(local_row)) => {
                    self.check_column(col)?;
                    self.add_to_owned_row(local_row, row, col, value)
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
            "[{}] finalized matrix: sent {} contributions, received {}",
            rank, stats.sent, stats.received
        );
        Ok(stats)
    }

    /// Allow further contributions to be added on top of the current values.
    pub fn reopen(&mut self) {
        self.state = AccumulationState::Open;
    }

    /// Reset all values to zero and discard staged contributions. The matrix is left open.
    pub fn fill_zero(&mut self) {
        self.local.values_mut().fill(T::zero());
        self.staging.clear();
        self.state = AccumulationState::Open;
    }

    /// The locally stored value at global `(row, col)`.
    ///
    /// Returns `None` if the row is not owned by this rank or the column is out of bounds.
    /// Entries outside the pattern are zero.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        let local_row = self.partition.local_index(row)?;
        self.local.get_entry(local_row, col).map(|entry| entry.into_value())
    }

    pub fn local_nnz(&self) -> usize {
        self.local.nnz()
    }

    /// Total number of structural nonzeros over all ranks. Collective.
    pub fn global_nnz<C: CollectiveContext>(&self, ctx: &C) -> Result<usize, MatrixError> {
        Ok(ctx.all_reduce_sum(self.local_nnz())?)
    }

    /// The Frobenius norm of the global matrix. Collective.
    pub fn frobenius_norm<C: CollectiveContext>(&self, ctx: &C) -> Result<T, MatrixError> {
        let local_sum_sq = self.local.values().iter().fold(T::zero(), |acc, &v| acc + v * v);
        Ok(ctx.all_reduce_sum(local_sum_sq)?.sqrt())
    }

    /// Row sums of the owned rows, in local row order.
    pub fn local_row_sums(&self) -> DVector<T> {
        DVector::from_iterator(
            self.local.nrows(),
            self.local
                .row_iter()
                .map(|row| row.values().iter().fold(T::zero(), |acc, &v| acc + v)),
        )
    }

    /// Collect the complete matrix on rank `root`.
    ///
    /// Collective. The matrix must be assembled. Returns `Some` on the root and `None` elsewhere.
    pub fn gather<C: CollectiveContext>(&self, ctx: &C, root: usize) -> Result<Option<CsrMatrix<T>>, MatrixError> {
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
        let owned_rows = self.partition.owned_rows();
        for (local_row, col, &v) in self.local.triplet_iter() {
            indices[root].push(owned_rows[local_row]);
            indices[root].push(col);
            values[root].push(v);
        }
        let indices = ctx.exchange(indices)?;
        let values = ctx.exchange(values)?;

        if ctx.rank() != root {
            return Ok(None);
        }

        let n = self.num_global_rows();
        let mut coo = CooMatrix::new(n, n);
        for (idx, vals) in indices.iter().zip(&values) {
            for (ij, &v) in idx.chunks_exact(2).zip(vals) {
                coo.push(ij[0], ij[1], v);
            }
        }
        Ok(Some(CsrMatrix::from(&coo)))
    }
}
