use crate::{gathered_poisson_matrix, partitioned_unit_cube};
use eyre::eyre;
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use parfem::assembly::{assemble_pattern, MatrixAssembler, VectorAssembler};
use parfem::comm::{CollectiveContext, SerialContext, ThreadedUniverse};
use parfem::config::AssemblyConfig;
use parfem::dofmap::{CellDofMap, DofMap};
use parfem::element::Tet4Element;
use parfem::error::{AssemblyError, AssemblyStage};
use parfem::kernel::{
    CellwiseCoefficients, CoefficientField, ConstantCoefficients, ElementKernel, NoCoefficients, PoissonKernel,
    SourceKernel,
};
use parfem::mesh::procedural::create_unit_cube_uniform_tet_mesh_3d;
use parfem::partition::{assign_vertex_owners, LocalMeshPartition, MeshPartition, Ownership};
use parfem::poisson::run_poisson_benchmark;
use parfem::sparse::AccumulationState;
use proptest::prelude::*;
use util::{assert_relative_frobenius_eq, csr_coordinates, dense_from_triplets};

/// Adds one to the entry of the first two DOFs of every cell, and nothing else.
struct SinglePairKernel;

impl ElementKernel<f64> for SinglePairKernel {
    fn dofs_per_cell(&self) -> usize {
        4
    }

    fn compute_local_tensor(&self, _element: &Tet4Element<f64>, _coefficients: &[f64]) -> eyre::Result<DMatrix<f64>> {
        let mut local = DMatrix::zeros(4, 4);
        local[(0, 1)] = 1.0;
        Ok(local)
    }
}

/// Produces a tensor of the wrong shape on cells whose coefficient is non-zero.
struct MalformedKernel;

impl ElementKernel<f64> for MalformedKernel {
    fn dofs_per_cell(&self) -> usize {
        4
    }

    fn num_coefficients(&self) -> usize {
        1
    }

    fn compute_local_tensor(&self, _element: &Tet4Element<f64>, coefficients: &[f64]) -> eyre::Result<DMatrix<f64>> {
        if coefficients[0] != 0.0 {
            Ok(DMatrix::zeros(3, 3))
        } else {
            Ok(DMatrix::identity(4, 4))
        }
    }
}

/// Fails on cells whose coefficient is non-zero.
struct FailingKernel;

impl ElementKernel<f64> for FailingKernel {
    fn dofs_per_cell(&self) -> usize {
        4
    }

    fn num_coefficients(&self) -> usize {
        1
    }

    fn compute_local_tensor(&self, _element: &Tet4Element<f64>, coefficients: &[f64]) -> eyre::Result<DMatrix<f64>> {
        if coefficients[0] != 0.0 {
            Err(eyre!("Kernel failure requested"))
        } else {
            Ok(DMatrix::zeros(4, 4))
        }
    }
}

/// Coefficients that are zero on every cell except the given one.
fn marker_on_cell(num_cells: usize, marked_cell: usize) -> CellwiseCoefficients<f64> {
    let mut values = vec![0.0; num_cells];
    values[marked_cell] = 1.0;
    CellwiseCoefficients::from_values(1, values)
}

#[test]
fn poisson_matrix_does_not_depend_on_number_of_ranks() {
    let config = AssemblyConfig::default();
    let reference = gathered_poisson_matrix(3, 1, &config);
    assert_eq!(reference.nrows(), 64);
    for num_ranks in 2..=5 {
        let matrix = gathered_poisson_matrix(3, num_ranks, &config);
        assert_eq!(csr_coordinates(&matrix), csr_coordinates(&reference));
        assert_relative_frobenius_eq!(matrix, reference, reltol = 1e-10);
        assert_matrix_eq!(matrix, reference, comp = abs, tol = 1e-12);
    }
}

#[test]
fn poisson_norm_and_nnz_agree_on_one_two_and_four_ranks() {
    let config = AssemblyConfig::default();
    let reports: Vec<_> = [1, 2, 4]
        .into_iter()
        .map(|num_ranks| {
            let mut reports = ThreadedUniverse::new(num_ranks).run(|ctx| {
                let (_, report) = run_poisson_benchmark(&ctx, 8, &config).unwrap();
                report
            });
            // Global quantities are known on every rank
            assert!(reports
                .iter()
                .all(|report| report.global_nnz == reports[0].global_nnz));
            reports.swap_remove(0)
        })
        .collect();

    let reference = &reports[0];
    assert_eq!(reference.num_global_dofs, 9 * 9 * 9);
    for report in &reports[1..] {
        assert_eq!(report.global_nnz, reference.global_nnz);
        assert_scalar_eq!(
            (report.frobenius_norm - reference.frobenius_norm).abs() / reference.frobenius_norm,
            0.0,
            comp = abs,
            tol = 1e-10
        );
    }
}

#[test]
fn poisson_row_sums_vanish_for_single_cube() {
    let (partition, dofmap) = partitioned_unit_cube(1, 0, 1);
    let (matrix, stats) = MatrixAssembler::<f64>::default()
        .assemble(&SerialContext, &partition, &dofmap, &PoissonKernel, &NoCoefficients)
        .unwrap();
    assert_eq!(matrix.state(), AccumulationState::Assembled);
    assert_eq!(stats.cells_assembled, 6);
    assert_eq!(stats.entries_added_locally, 6 * 16);
    assert_eq!(stats.entries_staged, 0);

    let row_sums = matrix.local_row_sums();
    assert_eq!(row_sums.len(), 8);
    assert_matrix_eq!(row_sums, DVector::zeros(8), comp = abs, tol = 1e-14);
}

#[test]
fn empty_mesh_assembles_to_zero_matrix_with_single_row() {
    for num_ranks in [1, 2] {
        let matrix = gathered_poisson_matrix(0, num_ranks, &AssemblyConfig::default());
        assert_eq!(matrix.nrows(), 1);
        assert_eq!(matrix.ncols(), 1);
        assert_eq!(matrix.nnz(), 0);
    }
}

#[test]
fn single_pair_kernel_produces_exactly_the_expected_entries() {
    let n = 2;
    let mesh = create_unit_cube_uniform_tet_mesh_3d::<f64>(n);
    let num_vertices = mesh.num_vertices();
    let expected = dense_from_triplets(
        num_vertices,
        num_vertices,
        mesh.connectivity().iter().map(|conn| (conn.0[0], conn.0[1], 1.0)),
    );

    for num_ranks in [1, 3] {
        let mut gathered = ThreadedUniverse::new(num_ranks).run(|ctx| {
            let (partition, dofmap) = partitioned_unit_cube(n, ctx.rank(), ctx.size());
            let (matrix, _) = MatrixAssembler::<f64>::default()
                .assemble(&ctx, &partition, &dofmap, &SinglePairKernel, &NoCoefficients)
                .unwrap();
            matrix.gather(&ctx, 0).unwrap()
        });
        let matrix = DMatrix::from(&gathered.swap_remove(0).unwrap());
        assert_eq!(matrix, expected);
    }
}

#[test]
fn reassembly_is_deterministic_and_accumulates() {
    let n = 2;
    let num_ranks = 2;
    let results = ThreadedUniverse::new(num_ranks).run(|ctx| {
        let (partition, dofmap) = partitioned_unit_cube(n, ctx.rank(), ctx.size());
        let assembler = MatrixAssembler::<f64>::default();

        let mut first = assembler.allocate(&ctx, &dofmap).unwrap();
        let mut second = assembler.allocate(&ctx, &dofmap).unwrap();
        for matrix in [&mut first, &mut second] {
            assembler
                .assemble_into(&ctx, matrix, &partition, &dofmap, &PoissonKernel, &NoCoefficients)
                .unwrap();
        }
        let once = second.gather(&ctx, 0).unwrap();
        assert_eq!(first.local_matrix(), second.local_matrix());

        // Adding into an assembled matrix requires reopening it
        let err = assembler
            .assemble_into(&ctx, &mut first, &partition, &dofmap, &PoissonKernel, &NoCoefficients)
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Configuration { stage: AssemblyStage::PreCheck, .. }));

        first.reopen();
        let stats = assembler
            .assemble_into(&ctx, &mut first, &partition, &dofmap, &PoissonKernel, &NoCoefficients)
            .unwrap();
        assert_eq!(stats.cells_assembled, partition.num_local_cells());
        let twice = first.gather(&ctx, 0).unwrap();
        (once, twice, stats)
    });

    let (once, twice, _) = &results[0];
    let once = DMatrix::from(once.as_ref().unwrap());
    let twice = DMatrix::from(twice.as_ref().unwrap());
    assert_matrix_eq!(twice, &once * 2.0, comp = abs, tol = 1e-14);

    // Contributions to shared rows cross the partition boundary
    let total_sent: usize = results.iter().map(|(_, _, stats)| stats.contributions_sent).sum();
    let total_received: usize = results.iter().map(|(_, _, stats)| stats.contributions_received).sum();
    assert!(total_sent > 0);
    assert_eq!(total_sent, total_received);
}

#[test]
fn parallel_kernels_give_identical_matrix() {
    let sequential = gathered_poisson_matrix(3, 2, &AssemblyConfig::default());
    let config = AssemblyConfig::default()
        .with_parallel_kernels(true)
        .with_kernel_chunk_size(7);
    let parallel = gathered_poisson_matrix(3, 2, &config);
    assert_eq!(csr_coordinates(&parallel), csr_coordinates(&sequential));
    assert_eq!(parallel.values(), sequential.values());
}

#[test]
fn double_ownership_claim_is_integrity_error_on_every_rank() {
    let results = ThreadedUniverse::new(2).run(|ctx| {
        let (partition, _) = partitioned_unit_cube(1, ctx.rank(), ctx.size());
        // Every rank claims every vertex it references
        let cell_dofs = partition
            .cell_vertices()
            .iter()
            .flat_map(|cell| cell.map(|v| partition.vertex_global_indices()[v]))
            .collect();
        let ownership = partition
            .vertex_global_indices()
            .iter()
            .map(|&v| (v, Ownership::Owned));
        let dofmap = CellDofMap::try_from_parts(ctx.rank(), ctx.size(), 8, 4, cell_dofs, ownership).unwrap();
        MatrixAssembler::<f64>::default()
            .assemble(&ctx, &partition, &dofmap, &PoissonKernel, &NoCoefficients)
            .map(|_| ())
    });
    for result in results {
        assert!(matches!(
            result,
            Err(AssemblyError::Integrity { stage: AssemblyStage::PreCheck, .. })
        ));
    }
}

#[test]
fn double_ownership_claim_is_detected_without_full_validation() {
    let results = ThreadedUniverse::new(2).run(|ctx| {
        let (partition, _) = partitioned_unit_cube(1, ctx.rank(), ctx.size());
        let cell_dofs = partition
            .cell_vertices()
            .iter()
            .flat_map(|cell| cell.map(|v| partition.vertex_global_indices()[v]))
            .collect();
        let ownership = partition
            .vertex_global_indices()
            .iter()
            .map(|&v| (v, Ownership::Owned));
        let dofmap = CellDofMap::try_from_parts(ctx.rank(), ctx.size(), 8, 4, cell_dofs, ownership).unwrap();
        let assembler = MatrixAssembler::<f64>::new(AssemblyConfig::default().with_ownership_validation(false));
        let assembled = assembler
            .assemble(&ctx, &partition, &dofmap, &PoissonKernel, &NoCoefficients)
            .map(|_| ());
        let pattern = assemble_pattern(&ctx, &dofmap).map(|_| ());
        (assembled, pattern)
    });
    for (assembled, pattern) in results {
        assert!(matches!(
            assembled,
            Err(AssemblyError::Integrity { stage: AssemblyStage::PreCheck, .. })
        ));
        assert!(matches!(
            pattern,
            Err(AssemblyError::Integrity { stage: AssemblyStage::SparsityPattern, .. })
        ));
    }
}

#[test]
fn malformed_tensor_on_one_rank_fails_every_rank() {
    let n = 1;
    let num_ranks = 3;
    let last_cell = 6 * n - 1;
    let coefficients = marker_on_cell(6, last_cell);
    let results = ThreadedUniverse::new(num_ranks).run(|ctx| {
        let (partition, dofmap) = partitioned_unit_cube(n, ctx.rank(), ctx.size());
        MatrixAssembler::<f64>::default()
            .assemble(&ctx, &partition, &dofmap, &MalformedKernel, &coefficients)
            .map(|_| ())
    });

    // The last cell belongs to the last rank
    let failing_rank = num_ranks - 1;
    for (rank, result) in results.into_iter().enumerate() {
        let err = result.unwrap_err();
        assert_eq!(err.stage(), AssemblyStage::PerCell);
        if rank == failing_rank {
            assert!(matches!(err, AssemblyError::Kernel { cell, .. } if cell == last_cell));
        } else {
            assert!(matches!(err, AssemblyError::RemoteFailure { rank, .. } if rank == failing_rank));
        }
    }
}

#[test]
fn kernel_failure_leaves_matrix_open() {
    let coefficients = marker_on_cell(6, 0);
    let (partition, dofmap) = partitioned_unit_cube(1, 0, 1);
    let assembler = MatrixAssembler::<f64>::default();
    let mut matrix = assembler.allocate(&SerialContext, &dofmap).unwrap();
    let err = assembler
        .assemble_into(
            &SerialContext,
            &mut matrix,
            &partition,
            &dofmap,
            &FailingKernel,
            &coefficients,
        )
        .unwrap_err();
    assert!(matches!(err, AssemblyError::Kernel { cell: 0, stage: AssemblyStage::PerCell, .. }));
    assert_eq!(matrix.state(), AccumulationState::Open);
}

#[test]
fn arity_mismatch_on_one_rank_is_detected_before_assembly() {
    let results = ThreadedUniverse::new(2).run(|ctx| {
        let (partition, dofmap) = partitioned_unit_cube(2, ctx.rank(), ctx.size());
        let assembler = MatrixAssembler::<f64>::default();
        let mut matrix = assembler.allocate(&ctx, &dofmap).unwrap();

        // Only rank 1 passes coefficients to a kernel without coefficients
        let constant = ConstantCoefficients(vec![1.0]);
        let coefficients: &(dyn CoefficientField<f64> + Sync) =
            if ctx.rank() == 1 { &constant } else { &NoCoefficients };
        let result = assembler.assemble_into(&ctx, &mut matrix, &partition, &dofmap, &PoissonKernel, coefficients);

        assert_eq!(matrix.state(), AccumulationState::Open);
        assert_eq!(matrix.num_staged(), 0);
        assert!(matrix.local_matrix().values().iter().all(|&v| v == 0.0));
        result
    });

    assert!(matches!(
        results[1],
        Err(AssemblyError::Configuration { stage: AssemblyStage::PreCheck, .. })
    ));
    assert!(matches!(
        results[0],
        Err(AssemblyError::RemoteFailure { stage: AssemblyStage::PreCheck, rank: 1 })
    ));
}

#[test]
fn cell_count_mismatch_is_configuration_error() {
    let (partition, _) = partitioned_unit_cube(1, 0, 1);
    let (_, other_dofmap) = partitioned_unit_cube(2, 0, 1);
    let err = MatrixAssembler::<f64>::default()
        .assemble(
            &SerialContext,
            &partition,
            &other_dofmap,
            &PoissonKernel,
            &NoCoefficients,
        )
        .unwrap_err();
    assert!(matches!(err, AssemblyError::Configuration { stage: AssemblyStage::PreCheck, .. }));
}

#[test]
fn rank_that_stops_participating_causes_communication_failure() {
    let results = ThreadedUniverse::new(3).run(|ctx| {
        if ctx.rank() == 2 {
            // Drops the context without taking part in assembly
            return None;
        }
        let (partition, dofmap) = partitioned_unit_cube(2, ctx.rank(), ctx.size());
        let result =
            MatrixAssembler::<f64>::default().assemble(&ctx, &partition, &dofmap, &PoissonKernel, &NoCoefficients);
        Some(result.map(|_| ()))
    });

    for result in results.into_iter().take(2) {
        assert!(matches!(result, Some(Err(AssemblyError::Communication { .. }))));
    }
}

#[test]
fn source_vector_sums_to_source_times_volume() {
    let f = 2.5;
    let sums = ThreadedUniverse::new(3).run(|ctx| {
        let (partition, dofmap) = partitioned_unit_cube(3, ctx.rank(), ctx.size());
        let (vector, stats) = VectorAssembler::<f64>::default()
            .assemble(&ctx, &partition, &dofmap, &SourceKernel, &ConstantCoefficients(vec![f]))
            .unwrap();
        assert_eq!(stats.cells_assembled, partition.num_local_cells());
        assert_eq!(vector.local_vector().len(), dofmap.owned_dofs().len());
        vector.sum(&ctx).unwrap()
    });
    for sum in sums {
        assert_scalar_eq!(sum, f, comp = abs, tol = 1e-12);
    }
}

#[test]
fn source_vector_does_not_depend_on_number_of_ranks() {
    let gathered_source = |num_ranks: usize, config: AssemblyConfig| {
        let mut vectors = ThreadedUniverse::new(num_ranks).run(|ctx| {
            let (partition, dofmap) = partitioned_unit_cube(2, ctx.rank(), ctx.size());
            let (vector, _) = VectorAssembler::new(config.clone())
                .assemble(
                    &ctx,
                    &partition,
                    &dofmap,
                    &SourceKernel,
                    &ConstantCoefficients(vec![1.0]),
                )
                .unwrap();
            vector.gather(&ctx, 0).unwrap()
        });
        vectors.swap_remove(0).unwrap()
    };

    let reference = gathered_source(1, AssemblyConfig::default());
    // The origin belongs to all six tetrahedra of its cube
    assert_scalar_eq!(reference[0], 1.0 / 8.0 / 4.0, comp = abs, tol = 1e-15);
    for num_ranks in [2, 4] {
        let vector = gathered_source(num_ranks, AssemblyConfig::default().with_parallel_kernels(true));
        assert_matrix_eq!(vector, reference, comp = abs, tol = 1e-14);
    }
}

#[test]
fn missing_coefficients_for_vector_kernel_is_configuration_error() {
    let (partition, dofmap) = partitioned_unit_cube(1, 0, 1);
    let err = VectorAssembler::<f64>::default()
        .assemble(&SerialContext, &partition, &dofmap, &SourceKernel, &NoCoefficients)
        .unwrap_err();
    assert!(matches!(err, AssemblyError::Configuration { stage: AssemblyStage::PreCheck, .. }));
}

#[test]
fn pattern_contains_all_pairs_of_cell_dofs() {
    let (_, dofmap) = partitioned_unit_cube(1, 0, 1);
    let pattern = assemble_pattern(&SerialContext, &dofmap).unwrap();
    let mut expected: Vec<_> = (0..dofmap.num_cells())
        .flat_map(|cell| {
            let dofs = dofmap.cell_dofs(cell).to_vec();
            dofs.iter()
                .flat_map(|&i| dofs.iter().map(move |&j| (i, j)))
                .collect::<Vec<_>>()
        })
        .collect();
    expected.sort_unstable();
    expected.dedup();

    let matrix = CsrMatrix::try_from_pattern_and_values(
        pattern.local_pattern().clone(),
        vec![0.0; pattern.local_nnz()],
    )
    .unwrap();
    assert_eq!(csr_coordinates(&matrix), expected);
    assert_eq!(pattern.global_nnz(&SerialContext).unwrap(), expected.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn arbitrary_cell_distribution_gives_same_matrix(
        (num_ranks, cell_owners) in (1usize..=4)
            .prop_flat_map(|num_ranks| (Just(num_ranks), proptest::collection::vec(0..num_ranks, 48)))
    ) {
        let n = 2;
        let mesh = create_unit_cube_uniform_tet_mesh_3d::<f64>(n);
        let vertex_owners = assign_vertex_owners(&mesh, &cell_owners);
        let mut gathered = ThreadedUniverse::new(num_ranks).run(|ctx| {
            let partition =
                LocalMeshPartition::from_global_mesh(&mesh, ctx.rank(), ctx.size(), &cell_owners, &vertex_owners);
            let dofmap = CellDofMap::vertex_dofs(&partition);
            let (matrix, _) = MatrixAssembler::<f64>::default()
                .assemble(&ctx, &partition, &dofmap, &PoissonKernel, &NoCoefficients)
                .unwrap();
            matrix.gather(&ctx, 0).unwrap()
        });
        let matrix = gathered.swap_remove(0).unwrap();
        let reference = gathered_poisson_matrix(n, 1, &AssemblyConfig::default());
        prop_assert_eq!(csr_coordinates(&matrix), csr_coordinates(&reference));
        assert_matrix_eq!(matrix, reference, comp = abs, tol = 1e-12);
    }
}
