use crate::element::Tet4Element;
use crate::kernel::ElementKernel;
use crate::Real;
use eyre::eyre;
use nalgebra::DMatrix;

/// Stiffness matrix of the Laplace operator, `a(u, v) = ∫ ∇u · ∇v dx`, for linear tetrahedra.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PoissonKernel;

impl<T: Real> ElementKernel<T> for PoissonKernel {
    fn dofs_per_cell(&self) -> usize {
        4
    }

    fn compute_local_tensor(&self, element: &Tet4Element<T>, _coefficients: &[T]) -> eyre::Result<DMatrix<T>> {
        // Basis gradients are constant on the element
        let g = element
            .basis_gradients()
            .ok_or_else(|| eyre!("Singular element Jacobian encountered"))?;
        let volume = element.volume();
        let local = g.transpose() * g * volume;
        Ok(DMatrix::from_iterator(4, 4, local.iter().copied()))
    }
}
