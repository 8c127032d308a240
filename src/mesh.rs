//! Tetrahedral meshes stored as flat vertex and connectivity arrays.
use crate::element::Tet4Element;
use nalgebra::{Point3, Scalar};

pub mod procedural;

/// Global vertex indices of a linear tetrahedron.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tet4Connectivity(pub [usize; 4]);

impl Tet4Connectivity {
    pub fn vertex_indices(&self) -> &[usize] {
        &self.0
    }
}

/// A conforming tetrahedral mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct Tet4Mesh<T: Scalar> {
    vertices: Vec<Point3<T>>,
    connectivity: Vec<Tet4Connectivity>,
}

impl<T: Scalar> Tet4Mesh<T> {
    /// Construct a mesh from vertices and connectivity.
    ///
    /// # Panics
    ///
    /// Panics if the connectivity references vertices out of bounds.
    pub fn from_vertices_and_connectivity(vertices: Vec<Point3<T>>, connectivity: Vec<Tet4Connectivity>) -> Self {
        let num_vertices = vertices.len();
        assert!(
            connectivity
                .iter()
                .flat_map(|conn| conn.vertex_indices())
                .all(|&v| v < num_vertices),
            "Connectivity must only reference vertices in bounds."
        );
        Self { vertices, connectivity }
    }

    pub fn vertices(&self) -> &[Point3<T>] {
        &self.vertices
    }

    pub fn connectivity(&self) -> &[Tet4Connectivity] {
        &self.connectivity
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_cells(&self) -> usize {
        self.connectivity.len()
    }

    pub fn get_cell(&self, index: usize) -> Option<Tet4Element<T>> {
        self.connectivity.get(index).map(|Tet4Connectivity(indices)| {
            Tet4Element::from_vertices(indices.map(|v| self.vertices[v].clone()))
        })
    }
}
