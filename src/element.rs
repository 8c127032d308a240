//! Geometry of linear tetrahedral elements.
use crate::Real;
use nalgebra::{Matrix3, Matrix3x4, Point3, Scalar};
use numeric_literals::replace_float_literals;

/// A linear (four-node) tetrahedron in physical space.
///
/// The element is the affine image of the reference tetrahedron with vertices
/// `(0, 0, 0)`, `(1, 0, 0)`, `(0, 1, 0)` and `(0, 0, 1)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tet4Element<T>
where
    T: Scalar,
{
    vertices: [Point3<T>; 4],
}

impl<T> Tet4Element<T>
where
    T: Scalar,
{
    pub fn from_vertices(vertices: [Point3<T>; 4]) -> Self {
        Self { vertices }
    }

    pub fn vertices(&self) -> &[Point3<T>; 4] {
        &self.vertices
    }
}

impl<T> Tet4Element<T>
where
    T: Real,
{
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn reference() -> Self {
        Self {
            vertices: [
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, 0.0, 1.0),
            ],
        }
    }

    /// The (constant) Jacobian of the map from reference to physical coordinates.
    pub fn jacobian(&self) -> Matrix3<T> {
        let [x0, x1, x2, x3] = &self.vertices;
        Matrix3::from_columns(&[x1 - x0, x2 - x0, x3 - x0])
    }

    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn volume(&self) -> T {
        self.jacobian().determinant().abs() / 6.0
    }

    /// Gradients of the four linear basis functions, stored as the columns of the result.
    ///
    /// Returns `None` if the element is degenerate.
    pub fn basis_gradients(&self) -> Option<Matrix3x4<T>> {
        let j_inv_t = self.jacobian().try_inverse()?.transpose();
        #[rustfmt::skip]
        let reference_gradients = Matrix3x4::new(
            -T::one(), T::one(), T::zero(), T::zero(),
            -T::one(), T::zero(), T::one(), T::zero(),
            -T::one(), T::zero(), T::zero(), T::one(),
        );
        Some(j_inv_t * reference_gradients)
    }
}
