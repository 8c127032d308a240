//! Local element kernels and the coefficient data they consume.
//!
//! A kernel computes the dense local tensor of a single cell, independently of all other cells.
//! Kernels are injected into the assembly routines and never hard-wired.
use crate::element::Tet4Element;
use eyre::eyre;
use nalgebra::{DMatrix, DVector, Scalar};

mod mass;
mod poisson;
mod source;

pub use mass::MassKernel;
pub use poisson::PoissonKernel;
pub use source::SourceKernel;

/// Computes the local matrix of a bilinear form on a single cell.
pub trait ElementKernel<T: Scalar> {
    /// The number of DOFs per cell the kernel expects.
    fn dofs_per_cell(&self) -> usize;

    /// The number of coefficient values per cell the kernel expects.
    fn num_coefficients(&self) -> usize {
        0
    }

    /// Compute the `dofs_per_cell x dofs_per_cell` local matrix of a cell.
    fn compute_local_tensor(&self, element: &Tet4Element<T>, coefficients: &[T]) -> eyre::Result<DMatrix<T>>;
}

/// Computes the local vector of a linear form on a single cell.
pub trait ElementVectorKernel<T: Scalar> {
    fn dofs_per_cell(&self) -> usize;

    fn num_coefficients(&self) -> usize {
        0
    }

    /// Compute the local vector of length `dofs_per_cell` of a cell.
    fn compute_local_tensor(&self, element: &Tet4Element<T>, coefficients: &[T]) -> eyre::Result<DVector<T>>;
}

impl<T: Scalar, K: ElementKernel<T> + ?Sized> ElementKernel<T> for &K {
    fn dofs_per_cell(&self) -> usize {
        K::dofs_per_cell(self)
    }

    fn num_coefficients(&self) -> usize {
        K::num_coefficients(self)
    }

    fn compute_local_tensor(&self, element: &Tet4Element<T>, coefficients: &[T]) -> eyre::Result<DMatrix<T>> {
        K::compute_local_tensor(self, element, coefficients)
    }
}

/// Per-cell coefficient data, such as material parameters or source terms.
pub trait CoefficientField<T> {
    /// Number of coefficient values per cell.
    fn num_components(&self) -> usize;

    /// Write the coefficients of the cell with the given global index into `output`,
    /// which has length `num_components()`.
    fn populate_cell_coefficients(&self, global_cell: usize, output: &mut [T]) -> eyre::Result<()>;
}

/// The coefficient field of forms without coefficients.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct NoCoefficients;

impl<T> CoefficientField<T> for NoCoefficients {
    fn num_components(&self) -> usize {
        0
    }

    fn populate_cell_coefficients(&self, _global_cell: usize, _output: &mut [T]) -> eyre::Result<()> {
        Ok(())
    }
}

/// The same coefficient values on every cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantCoefficients<T>(pub Vec<T>);

impl<T: Copy> CoefficientField<T> for ConstantCoefficients<T> {
    fn num_components(&self) -> usize {
        self.0.len()
    }

    fn populate_cell_coefficients(&self, _global_cell: usize, output: &mut [T]) -> eyre::Result<()> {
        output.copy_from_slice(&self.0);
        Ok(())
    }
}

/// Piecewise constant coefficients, stored for every global cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellwiseCoefficients<T> {
    num_components: usize,
    values: Vec<T>,
}

impl<T> CellwiseCoefficients<T> {
    /// `values` holds `num_components` values per global cell, cell after cell.
    pub fn from_values(num_components: usize, values: Vec<T>) -> Self {
        Self { num_components, values }
    }
}

impl<T: Copy> CoefficientField<T> for CellwiseCoefficients<T> {
    fn num_components(&self) -> usize {
        self.num_components
    }

    fn populate_cell_coefficients(&self, global_cell: usize, output: &mut [T]) -> eyre::Result<()> {
        let begin = global_cell * self.num_components;
        let values = self
            .values
            .get(begin..begin + self.num_components)
            .ok_or_else(|| eyre!("No coefficients stored for cell {global_cell}"))?;
        output.copy_from_slice(values);
        Ok(())
    }
}
