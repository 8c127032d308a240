use crate::assembly::{
    assemble_pattern, check_arity, collective_pre_check, kernel_error, malformed_tensor_error,
    populate_coefficients, AssemblyStats,
};
use crate::config::AssemblyConfig;
use crate::dofmap::DofMap;
use crate::error::{agree, AssemblyError, AssemblyStage};
use crate::kernel::{CoefficientField, ElementKernel};
use crate::partition::MeshPartition;
use crate::Real;
use log::debug;
use nalgebra::DMatrix;
use parfem_comm::CollectiveContext;
use parfem_sparse::{AccumulationState, DistributedCsrMatrix};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::cell::RefCell;
use thread_local::ThreadLocal;

/// An assembler for distributed CSR matrices.
#[derive(Debug)]
pub struct MatrixAssembler<T: Real> {
    config: AssemblyConfig,
    // Buffers that prevent unnecessary allocations when assembling several matrices
    // with the same assembler
    coefficients: RefCell<Vec<T>>,
    par_coefficients: ThreadLocal<RefCell<Vec<T>>>,
}

impl<T: Real> Default for MatrixAssembler<T> {
    fn default() -> Self {
        Self::new(AssemblyConfig::default())
    }
}

impl<T: Real> MatrixAssembler<T> {
    pub fn new(config: AssemblyConfig) -> Self {
        Self {
            config,
            coefficients: RefCell::new(Vec::new()),
            par_coefficients: ThreadLocal::new(),
        }
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Assemble the global matrix of a bilinear form. Collective.
    ///
    /// The sparsity pattern is assembled from the DOF map, a matrix is allocated with it, and
    /// the local tensors of all local cells are added to it before it is finalized.
    pub fn assemble<C, M, D, K, F>(
        &self,
        ctx: &C,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
    ) -> Result<(DistributedCsrMatrix<T>, AssemblyStats), AssemblyError>
    where
        C: CollectiveContext,
        M: MeshPartition<T> + Sync + ?Sized,
        D: DofMap + ?Sized,
        K: ElementKernel<T> + Sync + ?Sized,
        F: CoefficientField<T> + Sync + ?Sized,
    {
        let local_check = check_arity(
            mesh,
            dofmap,
            kernel.dofs_per_cell(),
            kernel.num_coefficients(),
            coefficients,
        );
        collective_pre_check(ctx, dofmap, local_check, self.config.validate_ownership)?;

        let pattern = assemble_pattern(ctx, dofmap)?;
        let mut matrix = DistributedCsrMatrix::zeros(&pattern);
        let stats = self.assemble_cells_and_finalize(ctx, &mut matrix, mesh, dofmap, kernel, coefficients)?;
        Ok((matrix, stats))
    }

    /// Add the local tensors of all local cells to an open matrix, then finalize it. Collective.
    ///
    /// The matrix must have been allocated with a pattern containing every entry of the form,
    /// for instance one produced by [`assemble_pattern`](crate::assembly::assemble_pattern)
    /// with the same DOF map.
    pub fn assemble_into<C, M, D, K, F>(
        &self,
        ctx: &C,
        matrix: &mut DistributedCsrMatrix<T>,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
    ) -> Result<AssemblyStats, AssemblyError>
    where
        C: CollectiveContext,
        M: MeshPartition<T> + Sync + ?Sized,
        D: DofMap + ?Sized,
        K: ElementKernel<T> + Sync + ?Sized,
        F: CoefficientField<T> + Sync + ?Sized,
    {
        let local_check = check_arity(
            mesh,
            dofmap,
            kernel.dofs_per_cell(),
            kernel.num_coefficients(),
            coefficients,
        )
        .and_then(|_| check_matrix(matrix, dofmap));
        collective_pre_check(ctx, dofmap, local_check, self.config.validate_ownership)?;
        self.assemble_cells_and_finalize(ctx, matrix, mesh, dofmap, kernel, coefficients)
    }

    fn assemble_cells_and_finalize<C, M, D, K, F>(
        &self,
        ctx: &C,
        matrix: &mut DistributedCsrMatrix<T>,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
    ) -> Result<AssemblyStats, AssemblyError>
    where
        C: CollectiveContext,
        M: MeshPartition<T> + Sync + ?Sized,
        D: DofMap + ?Sized,
        K: ElementKernel<T> + Sync + ?Sized,
        F: CoefficientField<T> + Sync + ?Sized,
    {
        let mut stats = AssemblyStats::default();
        let result = if self.config.parallel_kernels {
            self.assemble_cells_par(matrix, mesh, dofmap, kernel, coefficients, &mut stats)
        } else {
            self.assemble_cells(matrix, mesh, dofmap, kernel, coefficients, &mut stats)
        };
        agree(ctx, AssemblyStage::PerCell, result)?;
        debug!(
            "[{}] assembled {} cells: {} entries added locally, {} staged",
            ctx.rank(),
            stats.cells_assembled,
            stats.entries_added_locally,
            stats.entries_staged
        );

        let finalize_stats = matrix
            .finalize(ctx)
            .map_err(|err| AssemblyError::from_matrix_error(AssemblyStage::FinalizeExchange, err))?;
        stats.record_finalize(finalize_stats);
        Ok(stats)
    }

    fn assemble_cells<M, D, K, F>(
        &self,
        matrix: &mut DistributedCsrMatrix<T>,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
        stats: &mut AssemblyStats,
    ) -> Result<(), AssemblyError>
    where
        M: MeshPartition<T> + ?Sized,
        D: DofMap + ?Sized,
        K: ElementKernel<T> + ?Sized,
        F: CoefficientField<T> + ?Sized,
    {
        let buffer = &mut *self.coefficients.borrow_mut();
        for cell in 0..mesh.num_local_cells() {
            let tensor = compute_local_tensor(mesh, kernel, coefficients, cell, buffer);
            insert_local_tensor(matrix, mesh, dofmap, cell, tensor, stats)?;
        }
        Ok(())
    }

    /// Compute the local tensors of a chunk of cells in parallel, then insert them sequentially
    /// in cell order. Gives the same result as the sequential path.
    fn assemble_cells_par<M, D, K, F>(
        &self,
        matrix: &mut DistributedCsrMatrix<T>,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
        stats: &mut AssemblyStats,
    ) -> Result<(), AssemblyError>
    where
        M: MeshPartition<T> + Sync + ?Sized,
        D: DofMap + ?Sized,
        K: ElementKernel<T> + Sync + ?Sized,
        F: CoefficientField<T> + Sync + ?Sized,
    {
        let num_cells = mesh.num_local_cells();
        let chunk_size = self.config.kernel_chunk_size.max(1);
        let par_coefficients = &self.par_coefficients;
        for chunk_begin in (0..num_cells).step_by(chunk_size) {
            let chunk = chunk_begin..usize::min(chunk_begin + chunk_size, num_cells);
            let tensors: Vec<_> = chunk
                .clone()
                .into_par_iter()
                .map(|cell| {
                    let buffer = &mut *par_coefficients.get_or_default().borrow_mut();
                    compute_local_tensor(mesh, kernel, coefficients, cell, buffer)
                })
                .collect();

            for (cell, tensor) in chunk.zip(tensors) {
                insert_local_tensor(matrix, mesh, dofmap, cell, tensor, stats)?;
            }
        }
        Ok(())
    }
}

fn check_matrix<T, D>(matrix: &DistributedCsrMatrix<T>, dofmap: &D) -> Result<(), AssemblyError>
where
    T: Real,
    D: DofMap + ?Sized,
{
    let stage = AssemblyStage::PreCheck;
    if matrix.num_global_rows() != dofmap.num_global_dofs() {
        Err(AssemblyError::configuration(
            stage,
            format!(
                "matrix has dimension {}, but the DOF map has {} global DOFs",
                matrix.num_global_rows(),
                dofmap.num_global_dofs()
            ),
        ))
    } else if matrix.state() != AccumulationState::Open {
        Err(AssemblyError::configuration(stage, "matrix must be open for assembly"))
    } else {
        Ok(())
    }
}

fn compute_local_tensor<T, M, K, F>(
    mesh: &M,
    kernel: &K,
    coefficients: &F,
    cell: usize,
    buffer: &mut Vec<T>,
) -> eyre::Result<DMatrix<T>>
where
    T: Real,
    M: MeshPartition<T> + ?Sized,
    K: ElementKernel<T> + ?Sized,
    F: CoefficientField<T> + ?Sized,
{
    populate_coefficients(mesh, coefficients, cell, buffer)?;
    kernel.compute_local_tensor(&mesh.cell_geometry(cell), buffer)
}

fn insert_local_tensor<T, M, D>(
    matrix: &mut DistributedCsrMatrix<T>,
    mesh: &M,
    dofmap: &D,
    cell: usize,
    tensor: eyre::Result<DMatrix<T>>,
    stats: &mut AssemblyStats,
) -> Result<(), AssemblyError>
where
    T: Real,
    M: MeshPartition<T> + ?Sized,
    D: DofMap + ?Sized,
{
    let global_cell = mesh.global_cell_index(cell);
    let tensor = tensor.map_err(|err| kernel_error(global_cell, err))?;
    let dofs = dofmap.cell_dofs(cell);
    let expected = (dofs.len(), dofs.len());
    if tensor.shape() != expected {
        return Err(malformed_tensor_error(global_cell, expected, tensor.shape()));
    }
    let counts = matrix
        .add_local_matrix(dofs, dofs, &tensor)
        .map_err(|err| AssemblyError::from_matrix_error(AssemblyStage::PerCell, err))?;
    stats.record_insertion(counts);
    Ok(())
}

impl<T: Real> MatrixAssembler<T> {
    /// Allocate a matrix with the pattern of the DOF map, without adding any values. Collective.
    ///
    /// Useful for assembling several forms with the same DOF map into matrices with the same
    /// pattern, see [`assemble_into`](Self::assemble_into).
    pub fn allocate<C, D>(&self, ctx: &C, dofmap: &D) -> Result<DistributedCsrMatrix<T>, AssemblyError>
    where
        C: CollectiveContext,
        D: DofMap + ?Sized,
    {
        let pattern = assemble_pattern(ctx, dofmap)?;
        debug!(
            "[{}] allocated matrix with {} owned rows of {}",
            ctx.rank(),
            pattern.partition().num_owned_rows(),
            dofmap.num_global_dofs()
        );
        Ok(DistributedCsrMatrix::zeros(&pattern))
    }
}
