//! Distribution of mesh cells and vertices over ranks.
//!
//! Every cell is owned by exactly one rank. Vertices on partition boundaries are shared: every
//! rank with an adjacent cell references them, but only one rank owns each of them.
use crate::element::Tet4Element;
use crate::mesh::Tet4Mesh;
use crate::Real;
use nalgebra::{Point3, Scalar};
use num::Integer;
use rustc_hash::FxHashMap;
use std::ops::Range;

/// Ownership of an entity as seen from one rank.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Owned by the current rank.
    Owned,
    /// Referenced by the current rank, but owned by the given rank.
    Ghost(usize),
}

/// The part of a mesh that one rank assembles over.
pub trait MeshPartition<T: Scalar> {
    fn num_local_cells(&self) -> usize;

    /// The geometry of a local cell.
    ///
    /// # Panics
    ///
    /// May panic if `local_cell >= self.num_local_cells()`.
    fn cell_geometry(&self, local_cell: usize) -> Tet4Element<T>;

    /// The global index of a local cell.
    fn global_cell_index(&self, local_cell: usize) -> usize;
}

/// Split `num_cells` cells, in global index order, into `num_parts` contiguous blocks whose
/// sizes differ by at most one. Lower ranks receive the larger blocks.
pub fn partition_cells_contiguous(num_cells: usize, num_parts: usize) -> Vec<Range<usize>> {
    assert!(num_parts > 0, "Must partition into at least one part.");
    let (base, remainder) = num_cells.div_rem(&num_parts);
    let mut begin = 0;
    (0..num_parts)
        .map(|part| {
            let end = begin + base + usize::from(part < remainder);
            let range = begin..end;
            begin = end;
            range
        })
        .collect()
}

/// The owner of every cell, given the contiguous cell blocks of each rank.
pub fn cell_owners_from_blocks(blocks: &[Range<usize>]) -> Vec<usize> {
    blocks
        .iter()
        .enumerate()
        .flat_map(|(rank, block)| block.clone().map(move |_| rank))
        .collect()
}

/// Assign each vertex to the lowest rank that owns a cell containing it.
///
/// Vertices not contained in any cell are assigned to rank 0.
pub fn assign_vertex_owners<T: Scalar>(mesh: &Tet4Mesh<T>, cell_owners: &[usize]) -> Vec<usize> {
    assert_eq!(cell_owners.len(), mesh.num_cells(), "Every cell needs an owner.");
    let mut owners = vec![usize::MAX; mesh.num_vertices()];
    for (conn, &owner) in mesh.connectivity().iter().zip(cell_owners) {
        for &v in conn.vertex_indices() {
            owners[v] = owners[v].min(owner);
        }
    }
    for owner in &mut owners {
        if *owner == usize::MAX {
            *owner = 0;
        }
    }
    owners
}

/// The cells owned by one rank, together with the vertices they reference.
///
/// Data is stored in flat arrays indexed by local indices, with maps from local to global
/// indices. Cell vertex indices are local.
#[derive(Debug, Clone)]
pub struct LocalMeshPartition<T: Scalar> {
    rank: usize,
    num_ranks: usize,
    num_global_vertices: usize,
    num_global_cells: usize,
    vertices: Vec<Point3<T>>,
    vertex_global_indices: Vec<usize>,
    vertex_ownership: Vec<Ownership>,
    cell_vertices: Vec<[usize; 4]>,
    cell_global_indices: Vec<usize>,
}

impl<T: Real> LocalMeshPartition<T> {
    /// Extract the part of a global mesh owned by `rank`, given the owner of every cell and
    /// every vertex.
    ///
    /// # Panics
    ///
    /// Panics if the owner arrays do not match the mesh, or reference ranks out of bounds.
    pub fn from_global_mesh(
        mesh: &Tet4Mesh<T>,
        rank: usize,
        num_ranks: usize,
        cell_owners: &[usize],
        vertex_owners: &[usize],
    ) -> Self {
        assert!(rank < num_ranks);
        assert_eq!(cell_owners.len(), mesh.num_cells());
        assert_eq!(vertex_owners.len(), mesh.num_vertices());
        assert!(cell_owners.iter().chain(vertex_owners).all(|&owner| owner < num_ranks));

        let mut global_to_local = FxHashMap::default();
        let mut vertices = Vec::new();
        let mut vertex_global_indices = Vec::new();
        let mut vertex_ownership = Vec::new();
        let mut cell_vertices = Vec::new();
        let mut cell_global_indices = Vec::new();

        let mut add_vertex = |global: usize| {
            *global_to_local.entry(global).or_insert_with(|| {
                vertices.push(mesh.vertices()[global]);
                vertex_global_indices.push(global);
                vertex_ownership.push(match vertex_owners[global] {
                    owner if owner == rank => Ownership::Owned,
                    owner => Ownership::Ghost(owner),
                });
                vertex_global_indices.len() - 1
            })
        };

        for (cell_index, conn) in mesh.connectivity().iter().enumerate() {
            if cell_owners[cell_index] == rank {
                cell_vertices.push(conn.0.map(&mut add_vertex));
                cell_global_indices.push(cell_index);
            }
        }

        // Owned vertices outside of any local cell still need a home
        for (global, &owner) in vertex_owners.iter().enumerate() {
            if owner == rank {
                add_vertex(global);
            }
        }

        Self {
            rank,
            num_ranks,
            num_global_vertices: mesh.num_vertices(),
            num_global_cells: mesh.num_cells(),
            vertices,
            vertex_global_indices,
            vertex_ownership,
            cell_vertices,
            cell_global_indices,
        }
    }

    /// Partition a global mesh with the contiguous block partitioner, and vertices owned by the
    /// lowest adjacent rank.
    pub fn partition_contiguous(mesh: &Tet4Mesh<T>, rank: usize, num_ranks: usize) -> Self {
        let blocks = partition_cells_contiguous(mesh.num_cells(), num_ranks);
        let cell_owners = cell_owners_from_blocks(&blocks);
        let vertex_owners = assign_vertex_owners(mesh, &cell_owners);
        Self::from_global_mesh(mesh, rank, num_ranks, &cell_owners, &vertex_owners)
    }
}

impl<T: Scalar> LocalMeshPartition<T> {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn num_global_vertices(&self) -> usize {
        self.num_global_vertices
    }

    pub fn num_global_cells(&self) -> usize {
        self.num_global_cells
    }

    pub fn num_local_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[Point3<T>] {
        &self.vertices
    }

    pub fn vertex_global_indices(&self) -> &[usize] {
        &self.vertex_global_indices
    }

    pub fn vertex_ownership(&self) -> &[Ownership] {
        &self.vertex_ownership
    }

    /// Local vertex indices of each local cell.
    pub fn cell_vertices(&self) -> &[[usize; 4]] {
        &self.cell_vertices
    }

    pub fn cell_global_indices(&self) -> &[usize] {
        &self.cell_global_indices
    }

    pub fn num_owned_vertices(&self) -> usize {
        self.vertex_ownership
            .iter()
            .filter(|&&ownership| ownership == Ownership::Owned)
            .count()
    }
}

impl<T: Scalar> MeshPartition<T> for LocalMeshPartition<T> {
    fn num_local_cells(&self) -> usize {
        self.cell_vertices.len()
    }

    fn cell_geometry(&self, local_cell: usize) -> Tet4Element<T> {
        Tet4Element::from_vertices(self.cell_vertices[local_cell].map(|v| self.vertices[v].clone()))
    }

    fn global_cell_index(&self, local_cell: usize) -> usize {
        self.cell_global_indices[local_cell]
    }
}
