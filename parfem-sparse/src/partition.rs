use crate::MatrixError;
use rustc_hash::FxHashMap;

/// Where contributions to a global row must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRoute {
    /// The row is owned by this rank and stored at the given local index.
    Local(usize),
    /// The row is owned by the given remote rank.
    Remote(usize),
}

/// Row ownership of a distributed matrix, as seen from one rank.
///
/// Holds the sorted global indices of the rows owned by this rank, and a routing table for the
/// rows this rank references but does not own. Rows that are neither owned nor routed cannot
/// receive contributions from this rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPartition {
    rank: usize,
    num_ranks: usize,
    num_global_rows: usize,
    owned_rows: Vec<usize>,
    local_indices: FxHashMap<usize, usize>,
    remote_owners: FxHashMap<usize, usize>,
}

impl RowPartition {
    /// Construct a partition from the owned rows and the owners of referenced remote rows.
    ///
    /// `owned_rows` need not be sorted, but must not contain duplicates.
    pub fn try_new(
        rank: usize,
        num_ranks: usize,
        num_global_rows: usize,
        mut owned_rows: Vec<usize>,
        remote_owners: impl IntoIterator<Item = (usize, usize)>,
    ) -> Result<Self, MatrixError> {
        if rank >= num_ranks {
            return Err(MatrixError::InvalidPartition(format!(
                "rank {rank} is not smaller than the number of ranks {num_ranks}"
            )));
        }

        owned_rows.sort_unstable();
        if let Some(window) = owned_rows.windows(2).find(|w| w[0] == w[1]) {
            return Err(MatrixError::InvalidPartition(format!(
                "row {} is listed as owned more than once",
                window[0]
            )));
        }
        if let Some(&row) = owned_rows.last().filter(|&&row| row >= num_global_rows) {
            return Err(MatrixError::OutOfBounds {
                index: row,
                dim: num_global_rows,
            });
        }

        let local_indices: FxHashMap<_, _> = owned_rows
            .iter()
            .enumerate()
            .map(|(local, &global)| (global, local))
            .collect();

        let mut owners = FxHashMap::default();
        for (row, owner) in remote_owners {
            if row >= num_global_rows {
                return Err(MatrixError::OutOfBounds {
                    index: row,
                    dim: num_global_rows,
                });
            }
            if owner >= num_ranks {
                return Err(MatrixError::InvalidPartition(format!(
                    "row {row} is routed to rank {owner}, but there are only {num_ranks} ranks"
                )));
            }
            if owner == rank || local_indices.contains_key(&row) {
                return Err(MatrixError::InvalidPartition(format!(
                    "row {row} is both owned by rank {rank} and routed to rank {owner}"
                )));
            }
            if let Some(previous) = owners.insert(row, owner) {
                if previous != owner {
                    return Err(MatrixError::InvalidPartition(format!(
                        "row {row} is routed to both rank {previous} and rank {owner}"
                    )));
                }
            }
        }

        Ok(Self {
            rank,
            num_ranks,
            num_global_rows,
            owned_rows,
            local_indices,
            remote_owners: owners,
        })
    }

    /// A partition for a single rank which owns every row.
    pub fn serial(num_rows: usize) -> Self {
        let owned_rows: Vec<_> = (0..num_rows).collect();
        let local_indices = owned_rows.iter().map(|&row| (row, row)).collect();
        Self {
            rank: 0,
            num_ranks: 1,
            num_global_rows: num_rows,
            owned_rows,
            local_indices,
            remote_owners: FxHashMap::default(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn num_global_rows(&self) -> usize {
        self.num_global_rows
    }

    pub fn num_owned_rows(&self) -> usize {
        self.owned_rows.len()
    }

    pub fn num_remote_rows(&self) -> usize {
        self.remote_owners.len()
    }

    /// The global indices of the owned rows, sorted. Position `i` holds local row `i`.
    pub fn owned_rows(&self) -> &[usize] {
        &self.owned_rows
    }

    pub fn local_index(&self, global_row: usize) -> Option<usize> {
        self.local_indices.get(&global_row).copied()
    }

    pub fn is_owned(&self, global_row: usize) -> bool {
        self.local_indices.contains_key(&global_row)
    }

    /// Determine where contributions to the given global row must go.
    pub fn route(&self, global_row: usize) -> Result<RowRoute, MatrixError> {
        if global_row >= self.num_global_rows {
            Err(MatrixError::OutOfBounds {
                index: global_row,
                dim: self.num_global_rows,
            })
        } else if let Some(&local) = self.local_indices.get(&global_row) {
            Ok(RowRoute::Local(local))
        } else if let Some(&owner) = self.remote_owners.get(&global_row) {
            Ok(RowRoute::Remote(owner))
        } else {
            Err(MatrixError::Unroutable {
                index: global_row,
                rank: self.rank,
            })
        }
    }
}
