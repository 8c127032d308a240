use crate::element::Tet4Element;
use crate::kernel::ElementVectorKernel;
use crate::Real;
use eyre::eyre;
use nalgebra::DVector;
use numeric_literals::replace_float_literals;

/// Load vector of a piecewise constant source, `L(v) = ∫ f v dx`, for linear tetrahedra.
///
/// Expects one coefficient per cell: the value of `f`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SourceKernel;

#[replace_float_literals(T::from_f64(literal).unwrap())]
impl<T: Real> ElementVectorKernel<T> for SourceKernel {
    fn dofs_per_cell(&self) -> usize {
        4
    }

    fn num_coefficients(&self) -> usize {
        1
    }

    fn compute_local_tensor(&self, element: &Tet4Element<T>, coefficients: &[T]) -> eyre::Result<DVector<T>> {
        let f = *coefficients
            .first()
            .ok_or_else(|| eyre!("Source kernel requires the source value as coefficient"))?;
        Ok(DVector::repeat(4, f * element.volume() / 4.0))
    }
}
