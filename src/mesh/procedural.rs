//! Procedural mesh generation.
use crate::mesh::{Tet4Connectivity, Tet4Mesh};
use nalgebra::{convert, Point3, RealField};

/// Generates a uniform tetrahedral mesh of the unit cube `[0, 1]^3`.
///
/// The cube is divided into `cells_per_dim^3` hexahedra, each of which is split into six
/// tetrahedra sharing the diagonal from its lowest to its highest corner. The resulting mesh is
/// conforming. Vertices are numbered lexicographically, with `x` varying fastest.
///
/// For `cells_per_dim == 0` the mesh consists of a single vertex at the origin and no cells.
pub fn create_unit_cube_uniform_tet_mesh_3d<T>(cells_per_dim: usize) -> Tet4Mesh<T>
where
    T: RealField + Copy,
{
    if cells_per_dim == 0 {
        return Tet4Mesh::from_vertices_and_connectivity(vec![Point3::origin()], Vec::new());
    }

    let n = cells_per_dim;
    let num_vertices_per_dim = n + 1;
    let cell_size: T = T::one() / convert::<f64, T>(n as f64);

    let to_global_vertex_index =
        |i: usize, j: usize, k: usize| (num_vertices_per_dim * num_vertices_per_dim) * k + num_vertices_per_dim * j + i;

    let mut vertices = Vec::with_capacity(num_vertices_per_dim.pow(3));
    for k in 0..num_vertices_per_dim {
        for j in 0..num_vertices_per_dim {
            for i in 0..num_vertices_per_dim {
                let coord = |idx: usize| convert::<f64, T>(idx as f64) * cell_size;
                vertices.push(Point3::new(coord(i), coord(j), coord(k)));
            }
        }
    }

    let mut cells = Vec::with_capacity(6 * n.pow(3));
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                let idx = &to_global_vertex_index;
                let v0 = idx(i, j, k);
                let v1 = idx(i + 1, j, k);
                let v2 = idx(i, j + 1, k);
                let v3 = idx(i + 1, j + 1, k);
                let v4 = idx(i, j, k + 1);
                let v5 = idx(i + 1, j, k + 1);
                let v6 = idx(i, j + 1, k + 1);
                let v7 = idx(i + 1, j + 1, k + 1);
                cells.extend([
                    Tet4Connectivity([v0, v1, v3, v7]),
                    Tet4Connectivity([v0, v1, v5, v7]),
                    Tet4Connectivity([v0, v4, v5, v7]),
                    Tet4Connectivity([v0, v2, v3, v7]),
                    Tet4Connectivity([v0, v4, v6, v7]),
                    Tet4Connectivity([v0, v2, v6, v7]),
                ]);
            }
        }
    }

    Tet4Mesh::from_vertices_and_connectivity(vertices, cells)
}
