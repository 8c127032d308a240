use crate::assembly::{
    agreed_row_partition, check_arity, collective_pre_check, kernel_error, malformed_tensor_error,
    populate_coefficients, AssemblyStats,
};
use crate::config::AssemblyConfig;
use crate::dofmap::DofMap;
use crate::error::{agree, AssemblyError, AssemblyStage};
use crate::kernel::{CoefficientField, ElementVectorKernel};
use crate::partition::MeshPartition;
use crate::Real;
use log::debug;
use nalgebra::DVector;
use parfem_comm::CollectiveContext;
use parfem_sparse::{AccumulationState, DistributedVector};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::cell::RefCell;
use std::sync::Arc;
use thread_local::ThreadLocal;

/// An assembler for distributed vectors of linear forms.
#[derive(Debug)]
pub struct VectorAssembler<T: Real> {
    config: AssemblyConfig,
    coefficients: RefCell<Vec<T>>,
    par_coefficients: ThreadLocal<RefCell<Vec<T>>>,
}

impl<T: Real> Default for VectorAssembler<T> {
    fn default() -> Self {
        Self::new(AssemblyConfig::default())
    }
}

impl<T: Real> VectorAssembler<T> {
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

    /// Assemble the global vector of a linear form. Collective.
    pub fn assemble<C, M, D, K, F>(
        &self,
        ctx: &C,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
    ) -> Result<(DistributedVector<T>, AssemblyStats), AssemblyError>
    where
        C: CollectiveContext,
        M: MeshPartition<T> + Sync + ?Sized,
        D: DofMap + ?Sized,
        K: ElementVectorKernel<T> + Sync + ?Sized,
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

        let partition = agreed_row_partition(ctx, dofmap, AssemblyStage::PreCheck)?;
        let mut vector = DistributedVector::zeros(Arc::new(partition));
        let stats = self.assemble_cells_and_finalize(ctx, &mut vector, mesh, dofmap, kernel, coefficients)?;
        Ok((vector, stats))
    }

    /// Add the local vectors of all local cells to an open vector, then finalize it. Collective.
    pub fn assemble_into<C, M, D, K, F>(
        &self,
        ctx: &C,
        vector: &mut DistributedVector<T>,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
    ) -> Result<AssemblyStats, AssemblyError>
    where
        C: CollectiveContext,
        M: MeshPartition<T> + Sync + ?Sized,
        D: DofMap + ?Sized,
        K: ElementVectorKernel<T> + Sync + ?Sized,
        F: CoefficientField<T> + Sync + ?Sized,
    {
        let local_check = check_arity(
            mesh,
            dofmap,
            kernel.dofs_per_cell(),
            kernel.num_coefficients(),
            coefficients,
        )
        .and_then(|_| check_vector(vector, dofmap));
        collective_pre_check(ctx, dofmap, local_check, self.config.validate_ownership)?;
        self.assemble_cells_and_finalize(ctx, vector, mesh, dofmap, kernel, coefficients)
    }

    fn assemble_cells_and_finalize<C, M, D, K, F>(
        &self,
        ctx: &C,
        vector: &mut DistributedVector<T>,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
    ) -> Result<AssemblyStats, AssemblyError>
    where
        C: CollectiveContext,
        M: MeshPartition<T> + Sync + ?Sized,
        D: DofMap + ?Sized,
        K: ElementVectorKernel<T> + Sync + ?Sized,
        F: CoefficientField<T> + Sync + ?Sized,
    {
        let mut stats = AssemblyStats::default();
        let result = self.assemble_cells(vector, mesh, dofmap, kernel, coefficients, &mut stats);
        agree(ctx, AssemblyStage::PerCell, result)?;
        debug!("[{}] assembled {} cells into vector", ctx.rank(), stats.cells_assembled);

        let finalize_stats = vector
            .finalize(ctx)
            .map_err(|err| AssemblyError::from_matrix_error(AssemblyStage::FinalizeExchange, err))?;
        stats.record_finalize(finalize_stats);
        Ok(stats)
    }

    /// With parallel kernels, local vectors of a chunk of cells are computed in parallel and then
    /// inserted sequentially in cell order.
    fn assemble_cells<M, D, K, F>(
        &self,
        vector: &mut DistributedVector<T>,
        mesh: &M,
        dofmap: &D,
        kernel: &K,
        coefficients: &F,
        stats: &mut AssemblyStats,
    ) -> Result<(), AssemblyError>
    where
        M: MeshPartition<T> + Sync + ?Sized,
        D: DofMap + ?Sized,
        K: ElementVectorKernel<T> + Sync + ?Sized,
        F: CoefficientField<T> + Sync + ?Sized,
    {
        let num_cells = mesh.num_local_cells();
        let parallel = self.config.parallel_kernels;
        let chunk_size = if parallel { self.config.kernel_chunk_size.max(1) } else { 1 };
        let par_coefficients = &self.par_coefficients;

        for chunk_begin in (0..num_cells).step_by(chunk_size) {
            let chunk = chunk_begin..usize::min(chunk_begin + chunk_size, num_cells);
            let tensors: Vec<_> = if parallel {
                chunk
                    .clone()
                    .into_par_iter()
                    .map(|cell| {
                        let buffer = &mut *par_coefficients.get_or_default().borrow_mut();
                        compute_local_vector(mesh, kernel, coefficients, cell, buffer)
                    })
                    .collect()
            } else {
                let buffer = &mut *self.coefficients.borrow_mut();
                chunk
                    .clone()
                    .map(|cell| compute_local_vector(mesh, kernel, coefficients, cell, buffer))
                    .collect()
            };

            for (cell, tensor) in chunk.zip(tensors) {
                let global_cell = mesh.global_cell_index(cell);
                let tensor = tensor.map_err(|err| kernel_error(global_cell, err))?;
                let dofs = dofmap.cell_dofs(cell);
                if tensor.len() != dofs.len() {
                    return Err(malformed_tensor_error(global_cell, (dofs.len(), 1), tensor.shape()));
                }
                let counts = vector
                    .add_local_vector(dofs, &tensor)
                    .map_err(|err| AssemblyError::from_matrix_error(AssemblyStage::PerCell, err))?;
                stats.record_insertion(counts);
            }
        }
        Ok(())
    }
}

fn check_vector<T, D>(vector: &DistributedVector<T>, dofmap: &D) -> Result<(), AssemblyError>
where
    T: Real,
    D: DofMap + ?Sized,
{
    let stage = AssemblyStage::PreCheck;
    let dim = vector.partition().num_global_rows();
    if dim != dofmap.num_global_dofs() {
        Err(AssemblyError::configuration(
            stage,
            format!(
                "vector has dimension {dim}, but the DOF map has {} global DOFs",
                dofmap.num_global_dofs()
            ),
        ))
    } else if vector.state() != AccumulationState::Open {
        Err(AssemblyError::configuration(stage, "vector must be open for assembly"))
    } else {
        Ok(())
    }
}

fn compute_local_vector<T, M, K, F>(
    mesh: &M,
    kernel: &K,
    coefficients: &F,
    cell: usize,
    buffer: &mut Vec<T>,
) -> eyre::Result<DVector<T>>
where
    T: Real,
    M: MeshPartition<T> + ?Sized,
    K: ElementVectorKernel<T> + ?Sized,
    F: CoefficientField<T> + ?Sized,
{
    populate_coefficients(mesh, coefficients, cell, buffer)?;
    kernel.compute_local_tensor(&mesh.cell_geometry(cell), buffer)
}
