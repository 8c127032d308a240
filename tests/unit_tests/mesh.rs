use matrixcompare::assert_scalar_eq;
use parfem::mesh::procedural::create_unit_cube_uniform_tet_mesh_3d;
use parfem::mesh::{Tet4Connectivity, Tet4Mesh};
use nalgebra::Point3;

#[test]
fn unit_cube_mesh_has_expected_size() {
    for n in 1..=4 {
        let mesh = create_unit_cube_uniform_tet_mesh_3d::<f64>(n);
        assert_eq!(mesh.num_vertices(), (n + 1).pow(3));
        assert_eq!(mesh.num_cells(), 6 * n.pow(3));
    }
}

#[test]
fn unit_cube_mesh_with_zero_cells_is_a_single_vertex() {
    let mesh = create_unit_cube_uniform_tet_mesh_3d::<f64>(0);
    assert_eq!(mesh.num_vertices(), 1);
    assert_eq!(mesh.num_cells(), 0);
    assert_eq!(mesh.vertices()[0], Point3::origin());
}

#[test]
fn unit_cube_mesh_cells_fill_the_cube() {
    let mesh = create_unit_cube_uniform_tet_mesh_3d::<f64>(3);
    let cell_volume = 1.0 / (6.0 * 27.0);
    let mut total_volume = 0.0;
    for cell_index in 0..mesh.num_cells() {
        let cell = mesh.get_cell(cell_index).unwrap();
        assert_scalar_eq!(cell.volume(), cell_volume, comp = abs, tol = 1e-14);
        total_volume += cell.volume();
    }
    assert_scalar_eq!(total_volume, 1.0, comp = abs, tol = 1e-12);

    for vertex in mesh.vertices() {
        assert!(vertex.iter().all(|&x| (0.0..=1.0).contains(&x)));
    }
}

#[test]
fn unit_cube_mesh_for_single_cube() {
    let mesh = create_unit_cube_uniform_tet_mesh_3d::<f64>(1);
    assert_eq!(mesh.vertices()[1], Point3::new(1.0, 0.0, 0.0));
    assert_eq!(mesh.vertices()[2], Point3::new(0.0, 1.0, 0.0));
    assert_eq!(mesh.vertices()[4], Point3::new(0.0, 0.0, 1.0));
    assert_eq!(mesh.vertices()[7], Point3::new(1.0, 1.0, 1.0));

    // All six tetrahedra share the main diagonal
    for conn in mesh.connectivity() {
        assert_eq!(conn.vertex_indices()[0], 0);
        assert_eq!(conn.vertex_indices()[3], 7);
    }
}

#[test]
fn get_cell_out_of_bounds_is_none() {
    let vertices = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(0.0, 0.0, 1.0),
    ];
    let mesh = Tet4Mesh::from_vertices_and_connectivity(vertices, vec![Tet4Connectivity([0, 1, 2, 3])]);
    assert!(mesh.get_cell(0).is_some());
    assert!(mesh.get_cell(1).is_none());
    assert_scalar_eq!(mesh.get_cell(0).unwrap().volume(), 1.0 / 6.0, comp = abs, tol = 1e-15);
}
