//! Distributed assembly of global matrices and vectors from local element tensors.
//!
//! Every assembly is a collective operation, carried out in stages:
//!
//! 1. **pre-check**: the mesh partition, DOF map, kernel and coefficients must agree on their
//!    dimensions, the owned DOFs of all ranks must add up to the global DOFs, and (optionally)
//!    every DOF must have exactly one owner,
//! 2. **sparsity-pattern**: the pattern of the global matrix is assembled collectively,
//! 3. **per-cell**: every local cell's tensor is computed and added to the global matrix,
//! 4. **finalize-exchange**: contributions to rows owned by other ranks are delivered.
//!
//! Each stage ends with an agreement point, so that an error on one rank makes every rank
//! return an error instead of leaving the others waiting.
use crate::dofmap::{check_cell_count, row_partition, validate_ownership, DofMap};
use crate::error::{agree, AssemblyError, AssemblyStage};
use crate::kernel::CoefficientField;
use crate::partition::MeshPartition;
use crate::Real;
use eyre::eyre;
use itertools::Itertools;
use log::debug;
use nalgebra::Scalar;
use parfem_comm::CollectiveContext;
use parfem_sparse::{DistributedSparsityPattern, FinalizeStats, InsertionCounts, RowPartition};
use std::sync::Arc;

mod matrix;
mod vector;

pub use matrix::MatrixAssembler;
pub use vector::VectorAssembler;

/// Diagnostic counters of one assembly, as seen from one rank.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyStats {
    pub cells_assembled: usize,
    /// Entries added directly to locally owned rows.
    pub entries_added_locally: usize,
    /// Entries staged for their remote owners.
    pub entries_staged: usize,
    pub contributions_sent: usize,
    pub contributions_received: usize,
}

impl AssemblyStats {
    fn record_insertion(&mut self, counts: InsertionCounts) {
        self.cells_assembled += 1;
        self.entries_added_locally += counts.local;
        self.entries_staged += counts.staged;
    }

    fn record_finalize(&mut self, stats: FinalizeStats) {
        self.contributions_sent += stats.sent;
        self.contributions_received += stats.received;
    }
}

/// Local part of the pre-check shared by matrix and vector assembly.
fn check_arity<T, M, D, F>(
    mesh: &M,
    dofmap: &D,
    kernel_dofs_per_cell: usize,
    kernel_num_coefficients: usize,
    coefficients: &F,
) -> Result<(), AssemblyError>
where
    T: Scalar,
    M: MeshPartition<T> + ?Sized,
    D: DofMap + ?Sized,
    F: CoefficientField<T> + ?Sized,
{
    let stage = AssemblyStage::PreCheck;
    check_cell_count(mesh, dofmap)?;
    if dofmap.dofs_per_cell() != kernel_dofs_per_cell {
        return Err(AssemblyError::configuration(
            stage,
            format!(
                "DOF map has {} DOFs per cell, but the kernel expects {kernel_dofs_per_cell}",
                dofmap.dofs_per_cell()
            ),
        ));
    }
    if coefficients.num_components() != kernel_num_coefficients {
        return Err(AssemblyError::configuration(
            stage,
            format!(
                "coefficient field has {} components, but the kernel expects {kernel_num_coefficients}",
                coefficients.num_components()
            ),
        ));
    }
    Ok(())
}

/// Agree on the local pre-check result, then validate DOF ownership. Collective.
///
/// The total number of owned DOFs is always checked, the owner of every single DOF only if
/// `validate` is set.
fn collective_pre_check<C, D>(
    ctx: &C,
    dofmap: &D,
    local_check: Result<(), AssemblyError>,
    validate: bool,
) -> Result<(), AssemblyError>
where
    C: CollectiveContext,
    D: DofMap + ?Sized,
{
    let stage = AssemblyStage::PreCheck;
    agree(ctx, stage, local_check)?;
    check_owned_count(ctx, dofmap, stage)?;
    if validate {
        validate_ownership(ctx, dofmap)?;
    }
    debug!("[{}] pre-check passed", ctx.rank());
    Ok(())
}

/// Check that the numbers of DOFs owned by all ranks add up to the number of global DOFs.
/// Collective.
fn check_owned_count<C, D>(ctx: &C, dofmap: &D, stage: AssemblyStage) -> Result<(), AssemblyError>
where
    C: CollectiveContext,
    D: DofMap + ?Sized,
{
    let num_owned = ctx
        .all_reduce_sum(dofmap.owned_dofs().len())
        .map_err(|err| AssemblyError::communication(stage, err))?;
    let num_global_dofs = dofmap.num_global_dofs();
    let result = if num_owned == num_global_dofs {
        Ok(())
    } else {
        Err(AssemblyError::integrity(
            stage,
            format!("ranks own {num_owned} DOFs in total, but there are {num_global_dofs} global DOFs"),
        ))
    };
    agree(ctx, stage, result)
}

/// The row partition of the DOF map, agreed upon by all ranks. Collective.
fn agreed_row_partition<C, D>(ctx: &C, dofmap: &D, stage: AssemblyStage) -> Result<RowPartition, AssemblyError>
where
    C: CollectiveContext,
    D: DofMap + ?Sized,
{
    check_owned_count(ctx, dofmap, stage)?;
    let partition = row_partition(ctx, dofmap).map_err(|err| AssemblyError::from_matrix_error(stage, err));
    agree(ctx, stage, partition)
}

/// Collectively assemble the sparsity pattern of a bilinear form over the DOF map.
///
/// Every pair of DOFs sharing a cell forms an entry.
pub fn assemble_pattern<C, D>(ctx: &C, dofmap: &D) -> Result<DistributedSparsityPattern, AssemblyError>
where
    C: CollectiveContext,
    D: DofMap + ?Sized,
{
    let stage = AssemblyStage::SparsityPattern;
    let partition = agreed_row_partition(ctx, dofmap, stage)?;
    let entries = (0..dofmap.num_cells()).flat_map(|cell| {
        let dofs = dofmap.cell_dofs(cell);
        dofs.iter().copied().cartesian_product(dofs.iter().copied())
    });
    DistributedSparsityPattern::assemble(ctx, Arc::new(partition), entries)
        .map_err(|err| AssemblyError::from_matrix_error(stage, err))
}

/// Fetch the coefficients of a local cell into a buffer of the right length.
fn populate_coefficients<T, M, F>(mesh: &M, coefficients: &F, cell: usize, buffer: &mut Vec<T>) -> eyre::Result<()>
where
    T: Real,
    M: MeshPartition<T> + ?Sized,
    F: CoefficientField<T> + ?Sized,
{
    buffer.resize(coefficients.num_components(), T::zero());
    coefficients.populate_cell_coefficients(mesh.global_cell_index(cell), buffer)
}

fn kernel_error(cell: usize, error: eyre::Report) -> AssemblyError {
    AssemblyError::Kernel {
        stage: AssemblyStage::PerCell,
        cell,
        source: error.into(),
    }
}

fn malformed_tensor_error(cell: usize, expected: (usize, usize), actual: (usize, usize)) -> AssemblyError {
    kernel_error(
        cell,
        eyre!("Kernel produced a local tensor of shape {actual:?}, expected {expected:?}"),
    )
}
