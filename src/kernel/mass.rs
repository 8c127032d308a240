use crate::element::Tet4Element;
use crate::kernel::ElementKernel;
use crate::Real;
use nalgebra::DMatrix;
use numeric_literals::replace_float_literals;

/// Consistent mass matrix, `m(u, v) = ∫ u v dx`, for linear tetrahedra.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MassKernel;

#[replace_float_literals(T::from_f64(literal).unwrap())]
impl<T: Real> ElementKernel<T> for MassKernel {
    fn dofs_per_cell(&self) -> usize {
        4
    }

    fn compute_local_tensor(&self, element: &Tet4Element<T>, _coefficients: &[T]) -> eyre::Result<DMatrix<T>> {
        let scale = element.volume() / 20.0;
        Ok(DMatrix::from_fn(4, 4, |i, j| if i == j { 2.0 * scale } else { scale }))
    }
}
