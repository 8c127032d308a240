//! The Poisson assembly benchmark driven by `solve-poisson`.
use crate::assembly::{AssemblyStats, MatrixAssembler};
use crate::config::AssemblyConfig;
use crate::dofmap::{CellDofMap, DofMap};
use crate::error::{AssemblyError, AssemblyStage};
use crate::kernel::{NoCoefficients, PoissonKernel};
use crate::mesh::procedural::create_unit_cube_uniform_tet_mesh_3d;
use crate::partition::{LocalMeshPartition, MeshPartition};
use crate::timing::{time_collective, Timings, TimingSummary};
use log::info;
use parfem_comm::CollectiveContext;
use parfem_sparse::DistributedCsrMatrix;
use std::time::Duration;

/// Outcome of one benchmark run, as seen from one rank.
#[derive(Debug, Clone)]
pub struct PoissonReport {
    /// Wall time of the assembly between the two barriers.
    pub elapsed: Duration,
    /// Elapsed times of all ranks.
    pub summary: TimingSummary,
    pub num_global_dofs: usize,
    pub global_nnz: usize,
    pub frobenius_norm: f64,
    pub stats: AssemblyStats,
}

/// Assemble the P1 Poisson stiffness matrix on the unit cube divided into `n × n × n` cubes,
/// each split into six tetrahedra. Collective.
///
/// Every rank generates the global mesh and extracts its own part with the contiguous block
/// partitioner. Only the assembly itself is timed, between two barriers.
pub fn run_poisson_benchmark<C>(
    ctx: &C,
    n: usize,
    config: &AssemblyConfig,
) -> Result<(DistributedCsrMatrix<f64>, PoissonReport), AssemblyError>
where
    C: CollectiveContext,
{
    let mut timings = Timings::new();
    let (partition, dofmap) = timings.time("mesh", || {
        let mesh = create_unit_cube_uniform_tet_mesh_3d::<f64>(n);
        let partition = LocalMeshPartition::partition_contiguous(&mesh, ctx.rank(), ctx.size());
        let dofmap = CellDofMap::vertex_dofs(&partition);
        (partition, dofmap)
    });
    info!(
        "[{}] mesh partition with {} of {} cells, {} owned DOFs",
        ctx.rank(),
        partition.num_local_cells(),
        partition.num_global_cells(),
        dofmap.owned_dofs().len()
    );

    let synchronization_error = |err| AssemblyError::communication(AssemblyStage::Synchronization, err);
    let assembler = MatrixAssembler::new(config.clone());
    let timed = time_collective(ctx, || {
        assembler.assemble(ctx, &partition, &dofmap, &PoissonKernel, &NoCoefficients)
    })
    .map_err(synchronization_error)?;
    let (matrix, stats) = timed.value?;
    timings.record("assembly", timed.elapsed);

    let summary = TimingSummary::reduce(ctx, timed.elapsed).map_err(synchronization_error)?;
    let query_error = |err| AssemblyError::from_matrix_error(AssemblyStage::FinalizeExchange, err);
    let global_nnz = matrix.global_nnz(ctx).map_err(query_error)?;
    let frobenius_norm = matrix.frobenius_norm(ctx).map_err(query_error)?;

    let table = timings.reduce(ctx).map_err(synchronization_error)?;
    if ctx.is_root() {
        info!(
            "assembled {} DOFs, {} nonzeros, Frobenius norm {:.6e}",
            dofmap.num_global_dofs(),
            global_nnz,
            frobenius_norm
        );
        info!("timings over {} ranks:\n{}", ctx.size(), table);
    }

    let report = PoissonReport {
        elapsed: timed.elapsed,
        summary,
        num_global_dofs: dofmap.num_global_dofs(),
        global_nnz,
        frobenius_norm,
        stats,
    };
    Ok((matrix, report))
}
