//! Maps from local cells to global degrees of freedom.
use crate::error::{AssemblyError, AssemblyStage};
use crate::partition::{LocalMeshPartition, MeshPartition, Ownership};
use log::{debug, warn};
use nalgebra::Scalar;
use parfem_comm::CollectiveContext;
use parfem_sparse::{MatrixError, RowPartition};
use rustc_hash::FxHashMap;

/// Global numbering and ownership of the degrees of freedom of one rank.
///
/// The numbering is global: the same DOF has the same index on every rank.
pub trait DofMap {
    fn num_global_dofs(&self) -> usize;

    /// Number of local cells.
    fn num_cells(&self) -> usize;

    fn dofs_per_cell(&self) -> usize;

    /// Global indices of the DOFs of a local cell.
    fn cell_dofs(&self, cell: usize) -> &[usize];

    fn is_owned(&self, dof: usize) -> bool;

    /// The rank owning the DOF, if it is known to this rank.
    fn owner_of(&self, dof: usize) -> Option<usize>;

    /// The DOFs owned by this rank, sorted.
    fn owned_dofs(&self) -> &[usize];

    /// The non-owned DOFs referenced by this rank, with their owners.
    fn ghost_dofs(&self) -> Vec<(usize, usize)>;
}

/// A DOF map with a fixed number of DOFs per cell, stored in flat arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellDofMap {
    rank: usize,
    num_ranks: usize,
    num_global_dofs: usize,
    dofs_per_cell: usize,
    cell_dofs: Vec<usize>,
    owned_dofs: Vec<usize>,
    ghost_owners: FxHashMap<usize, usize>,
}

impl CellDofMap {
    /// Construct a DOF map from flat cell DOF indices and an ownership table.
    ///
    /// `cell_dofs` contains `dofs_per_cell` global indices per cell. The ownership table lists
    /// DOFs this rank owns or references. A DOF referenced by a cell but absent from the table
    /// is not rejected here, but cannot be routed during assembly.
    pub fn try_from_parts(
        rank: usize,
        num_ranks: usize,
        num_global_dofs: usize,
        dofs_per_cell: usize,
        cell_dofs: Vec<usize>,
        ownership: impl IntoIterator<Item = (usize, Ownership)>,
    ) -> Result<Self, AssemblyError> {
        let config_error = |message: String| AssemblyError::configuration(AssemblyStage::PreCheck, message);

        if rank >= num_ranks {
            return Err(config_error(format!("rank {rank} out of bounds for {num_ranks} ranks")));
        }
        if dofs_per_cell == 0 && !cell_dofs.is_empty() {
            return Err(config_error("cells must have at least one DOF".to_string()));
        }
        if dofs_per_cell > 0 && cell_dofs.len() % dofs_per_cell != 0 {
            return Err(config_error(format!(
                "{} cell DOF indices is not a multiple of {dofs_per_cell} DOFs per cell",
                cell_dofs.len()
            )));
        }
        if let Some(&dof) = cell_dofs.iter().find(|&&dof| dof >= num_global_dofs) {
            return Err(config_error(format!(
                "cell DOF {dof} out of bounds for {num_global_dofs} global DOFs"
            )));
        }

        let mut owned_dofs = Vec::new();
        let mut ghost_owners = FxHashMap::default();
        for (dof, ownership) in ownership {
            if dof >= num_global_dofs {
                return Err(config_error(format!("DOF {dof} out of bounds for {num_global_dofs} global DOFs")));
            }
            match ownership {
                Ownership::Owned => owned_dofs.push(dof),
                Ownership::Ghost(owner) if owner >= num_ranks || owner == rank => {
                    return Err(config_error(format!("ghost DOF {dof} has invalid owner {owner}")));
                }
                Ownership::Ghost(owner) => {
                    if ghost_owners.insert(dof, owner).is_some() {
                        return Err(config_error(format!("DOF {dof} is listed more than once")));
                    }
                }
            }
        }
        owned_dofs.sort_unstable();
        if let Some(window) = owned_dofs.windows(2).find(|w| w[0] == w[1]) {
            return Err(config_error(format!("DOF {} is listed more than once", window[0])));
        }
        if let Some(&dof) = owned_dofs.iter().find(|dof| ghost_owners.contains_key(dof)) {
            return Err(config_error(format!("DOF {dof} is listed as both owned and ghost")));
        }

        Ok(Self {
            rank,
            num_ranks,
            num_global_dofs,
            dofs_per_cell,
            cell_dofs,
            owned_dofs,
            ghost_owners,
        })
    }

    /// One DOF per vertex, numbered by the global vertex index (P1 elements).
    pub fn vertex_dofs<T: Scalar>(partition: &LocalMeshPartition<T>) -> Self {
        let global = partition.vertex_global_indices();
        let cell_dofs = partition
            .cell_vertices()
            .iter()
            .flat_map(|cell| cell.iter().map(|&v| global[v]))
            .collect();
        let ownership = global
            .iter()
            .copied()
            .zip(partition.vertex_ownership().iter().copied());
        Self::try_from_parts(
            partition.rank(),
            partition.num_ranks(),
            partition.num_global_vertices(),
            4,
            cell_dofs,
            ownership,
        )
        .expect("Mesh partitions always produce consistent vertex DOFs")
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }
}

impl DofMap for CellDofMap {
    fn num_global_dofs(&self) -> usize {
        self.num_global_dofs
    }

    fn num_cells(&self) -> usize {
        if self.dofs_per_cell == 0 {
            0
        } else {
            self.cell_dofs.len() / self.dofs_per_cell
        }
    }

    fn dofs_per_cell(&self) -> usize {
        self.dofs_per_cell
    }

    fn cell_dofs(&self, cell: usize) -> &[usize] {
        let begin = self.dofs_per_cell * cell;
        &self.cell_dofs[begin..begin + self.dofs_per_cell]
    }

    fn is_owned(&self, dof: usize) -> bool {
        self.owned_dofs.binary_search(&dof).is_ok()
    }

    fn owner_of(&self, dof: usize) -> Option<usize> {
        if self.is_owned(dof) {
            Some(self.rank)
        } else {
            self.ghost_owners.get(&dof).copied()
        }
    }

    fn owned_dofs(&self) -> &[usize] {
        &self.owned_dofs
    }

    fn ghost_dofs(&self) -> Vec<(usize, usize)> {
        let mut ghosts: Vec<_> = self.ghost_owners.iter().map(|(&dof, &owner)| (dof, owner)).collect();
        ghosts.sort_unstable();
        ghosts
    }
}

/// The row partition of matrices and vectors over a DOF map.
pub fn row_partition<C, D>(ctx: &C, dofmap: &D) -> Result<RowPartition, MatrixError>
where
    C: CollectiveContext,
    D: DofMap + ?Sized,
{
    RowPartition::try_new(
        ctx.rank(),
        ctx.size(),
        dofmap.num_global_dofs(),
        dofmap.owned_dofs().to_vec(),
        dofmap.ghost_dofs(),
    )
}

/// Check that every DOF is owned by exactly one rank, and that every rank agrees on the owner
/// of the DOFs it references. Collective.
///
/// Each DOF is checked by rank `dof % size`. If any rank finds a violation, every rank
/// returns an integrity error.
pub fn validate_ownership<C, D>(ctx: &C, dofmap: &D) -> Result<(), AssemblyError>
where
    C: CollectiveContext,
    D: DofMap + ?Sized,
{
    let stage = AssemblyStage::PreCheck;
    let comm_error = |err| AssemblyError::communication(stage, err);
    let size = ctx.size();
    let rank = ctx.rank();
    let n = dofmap.num_global_dofs();

    let max_n = ctx.all_reduce_max(n).map_err(comm_error)?;
    let min_n = ctx.all_reduce_min(n).map_err(comm_error)?;
    if max_n != min_n {
        return Err(AssemblyError::configuration(
            stage,
            format!("ranks disagree on the number of global DOFs ({min_n} to {max_n})"),
        ));
    }

    let mut claims = vec![Vec::new(); size];
    for &dof in dofmap.owned_dofs() {
        claims[dof % size].push(dof);
    }
    let mut references = vec![Vec::new(); size];
    for (dof, owner) in dofmap.ghost_dofs() {
        references[dof % size].extend([dof, owner]);
    }
    let claims = ctx.exchange(claims).map_err(comm_error)?;
    let references = ctx.exchange(references).map_err(comm_error)?;

    // Owners of the DOFs this rank is responsible for, indexed by dof / size
    let num_checked = (n + size - 1 - rank) / size;
    let mut owners: Vec<Vec<usize>> = vec![Vec::new(); num_checked];
    let mut violations = Vec::new();
    for (claimant, dofs) in claims.iter().enumerate() {
        for &dof in dofs {
            if dof < n {
                owners[dof / size].push(claimant);
            } else {
                violations.push(format!("rank {claimant} claims DOF {dof}, which is out of bounds"));
            }
        }
    }

    for (i, dof_owners) in owners.iter().enumerate() {
        let dof = i * size + rank;
        match dof_owners.as_slice() {
            [_] => {}
            [] => violations.push(format!("DOF {dof} is not owned by any rank")),
            many => violations.push(format!("DOF {dof} is claimed by ranks {many:?}")),
        }
    }
    for (referencing_rank, pairs) in references.iter().enumerate() {
        for pair in pairs.chunks_exact(2) {
            let (dof, assumed_owner) = (pair[0], pair[1]);
            if dof >= n {
                violations.push(format!("rank {referencing_rank} references DOF {dof}, which is out of bounds"));
            } else if owners[dof / size].as_slice() != [assumed_owner] {
                violations.push(format!(
                    "rank {referencing_rank} assumes DOF {dof} is owned by rank {assumed_owner}, \
                     but it is claimed by ranks {:?}",
                    owners[dof / size]
                ));
            }
        }
    }

    for violation in &violations {
        warn!("[{rank}] {violation}");
    }
    let total = ctx.all_reduce_sum(violations.len()).map_err(comm_error)?;
    if total == 0 {
        debug!("[{rank}] DOF ownership validated for {n} global DOFs");
        Ok(())
    } else {
        let message = match violations.first() {
            Some(first) => format!("{total} ownership violations, including: {first}"),
            None => format!("{total} ownership violations detected on other ranks"),
        };
        Err(AssemblyError::integrity(stage, message))
    }
}

/// Check that the DOF map is consistent with the mesh partition it is used with.
pub(crate) fn check_cell_count<T, M, D>(mesh: &M, dofmap: &D) -> Result<(), AssemblyError>
where
    T: Scalar,
    M: MeshPartition<T> + ?Sized,
    D: DofMap + ?Sized,
{
    if mesh.num_local_cells() == dofmap.num_cells() {
        Ok(())
    } else {
        Err(AssemblyError::configuration(
            AssemblyStage::PreCheck,
            format!(
                "mesh partition has {} local cells, but the DOF map has {}",
                mesh.num_local_cells(),
                dofmap.num_cells()
            ),
        ))
    }
}
