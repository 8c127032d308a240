use crate::partitioned_unit_cube;
use parfem::comm::{CollectiveContext, SerialContext, ThreadedUniverse};
use parfem::dofmap::{row_partition, validate_ownership, CellDofMap, DofMap};
use parfem::error::{AssemblyError, AssemblyStage};
use parfem::partition::Ownership;

fn owned(dofs: &[usize]) -> Vec<(usize, Ownership)> {
    dofs.iter().map(|&dof| (dof, Ownership::Owned)).collect()
}

#[test]
fn vertex_dofs_follow_global_vertex_numbering() {
    let (partition, dofmap) = partitioned_unit_cube(2, 1, 2);
    assert_eq!(dofmap.num_global_dofs(), 27);
    assert_eq!(dofmap.num_cells(), partition.cell_vertices().len());
    assert_eq!(dofmap.dofs_per_cell(), 4);
    for (cell, vertices) in partition.cell_vertices().iter().enumerate() {
        let expected: Vec<_> = vertices
            .iter()
            .map(|&v| partition.vertex_global_indices()[v])
            .collect();
        assert_eq!(dofmap.cell_dofs(cell), expected.as_slice());
    }
    assert_eq!(dofmap.owned_dofs().len(), partition.num_owned_vertices());
    for (dof, owner) in dofmap.ghost_dofs() {
        assert_eq!(owner, 0);
        assert!(!dofmap.is_owned(dof));
        assert_eq!(dofmap.owner_of(dof), Some(0));
    }
}

#[test]
fn try_from_parts_rejects_malformed_input() {
    let err = CellDofMap::try_from_parts(2, 2, 4, 2, vec![0, 1], owned(&[0])).unwrap_err();
    assert!(matches!(err, AssemblyError::Configuration { stage: AssemblyStage::PreCheck, .. }));

    // Cell DOF out of bounds
    assert!(CellDofMap::try_from_parts(0, 1, 4, 2, vec![0, 4], owned(&[0])).is_err());
    // Not a whole number of cells
    assert!(CellDofMap::try_from_parts(0, 1, 4, 2, vec![0, 1, 2], owned(&[0])).is_err());
    // Listed twice
    assert!(CellDofMap::try_from_parts(0, 1, 4, 2, vec![0, 1], owned(&[0, 0])).is_err());
    // Owned and ghost
    let ownership = vec![(1, Ownership::Owned), (1, Ownership::Ghost(1))];
    assert!(CellDofMap::try_from_parts(0, 2, 4, 2, vec![0, 1], ownership).is_err());
    // Ghost owned by itself
    assert!(CellDofMap::try_from_parts(0, 2, 4, 2, vec![0, 1], vec![(1, Ownership::Ghost(0))]).is_err());
}

#[test]
fn contiguous_partitions_pass_ownership_validation() {
    for num_ranks in 1..=4 {
        let results = ThreadedUniverse::new(num_ranks).run(|ctx| {
            let (_, dofmap) = partitioned_unit_cube(2, ctx.rank(), ctx.size());
            validate_ownership(&ctx, &dofmap)
        });
        assert!(results.iter().all(Result::is_ok), "{num_ranks} ranks: {results:?}");
    }
}

#[test]
fn unowned_dof_is_detected_on_every_rank() {
    let results = ThreadedUniverse::new(2).run(|ctx| {
        // Nobody owns DOF 2
        let ownership = match ctx.rank() {
            0 => owned(&[0]),
            _ => owned(&[1]),
        };
        let dofmap = CellDofMap::try_from_parts(ctx.rank(), 2, 3, 1, vec![], ownership).unwrap();
        validate_ownership(&ctx, &dofmap)
    });
    for result in results {
        assert!(matches!(
            result,
            Err(AssemblyError::Integrity { stage: AssemblyStage::PreCheck, .. })
        ));
    }
}

#[test]
fn wrong_assumed_owner_is_detected_on_every_rank() {
    let results = ThreadedUniverse::new(3).run(|ctx| {
        let mut ownership = owned(&[ctx.rank()]);
        if ctx.rank() == 0 {
            // DOF 1 is owned by rank 1, not rank 2
            ownership.push((1, Ownership::Ghost(2)));
        }
        let dofmap = CellDofMap::try_from_parts(ctx.rank(), 3, 3, 1, vec![], ownership).unwrap();
        validate_ownership(&ctx, &dofmap)
    });
    for result in results {
        assert!(matches!(result, Err(AssemblyError::Integrity { .. })));
    }
}

#[test]
fn disagreement_on_global_dof_count_is_a_configuration_error() {
    let results = ThreadedUniverse::new(2).run(|ctx| {
        let n = 2 + ctx.rank();
        let dofmap = CellDofMap::try_from_parts(ctx.rank(), 2, n, 1, vec![], owned(&[ctx.rank()])).unwrap();
        validate_ownership(&ctx, &dofmap)
    });
    for result in results {
        assert!(matches!(result, Err(AssemblyError::Configuration { .. })));
    }
}

#[test]
fn row_partition_matches_dof_ownership() {
    let (_, dofmap) = partitioned_unit_cube(1, 0, 1);
    let partition = row_partition(&SerialContext, &dofmap).unwrap();
    assert_eq!(partition.num_global_rows(), 8);
    assert_eq!(partition.num_owned_rows(), 8);
    assert_eq!(partition.owned_rows(), dofmap.owned_dofs());
}
