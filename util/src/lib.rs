//! Helpers shared by the tests of the workspace.
use nalgebra::{DMatrix, RealField};
use nalgebra_sparse::CsrMatrix;

/// Assert that two sparse or dense matrices are equal up to a relative tolerance,
/// measured in the Frobenius norm of their difference.
#[macro_export]
macro_rules! assert_relative_frobenius_eq {
    ($x:expr, $y:expr, reltol = $tol:expr) => {{
        use $crate::ToDense;
        let x = $x.to_dense();
        let y = $y.to_dense();
        let rel = $crate::relative_frobenius_difference(&x, &y);
        if !(rel <= $tol) {
            println!("reltol: {:e}", $tol);
            println!("relative difference: {:e}", rel);
            println!("left: {}", x);
            println!("right: {}", y);
        }
        assert!(rel <= $tol);
    }};
}

/// Conversion of test matrices to dense form for comparison.
pub trait ToDense<T> {
    fn to_dense(&self) -> DMatrix<T>;
}

impl<T: RealField + Copy> ToDense<T> for DMatrix<T> {
    fn to_dense(&self) -> DMatrix<T> {
        self.clone()
    }
}

impl<T: RealField + Copy> ToDense<T> for CsrMatrix<T> {
    fn to_dense(&self) -> DMatrix<T> {
        DMatrix::from(self)
    }
}

/// `‖x - y‖ / max(‖x‖, ‖y‖)` in the Frobenius norm, or zero if both matrices are zero.
///
/// # Panics
///
/// Panics if the shapes differ.
pub fn relative_frobenius_difference<T: RealField + Copy>(x: &DMatrix<T>, y: &DMatrix<T>) -> T {
    assert_eq!(x.shape(), y.shape(), "Matrices must have the same shape");
    let scale = x.norm().max(y.norm());
    if scale.is_zero() {
        T::zero()
    } else {
        (x - y).norm() / scale
    }
}

/// The sorted `(row, col)` coordinates of the explicitly stored entries of a CSR matrix.
pub fn csr_coordinates<T>(matrix: &CsrMatrix<T>) -> Vec<(usize, usize)> {
    let mut coordinates: Vec<_> = matrix.triplet_iter().map(|(i, j, _)| (i, j)).collect();
    coordinates.sort_unstable();
    coordinates
}

/// Dense matrix obtained by summing `(row, col, value)` triplets, duplicates included.
pub fn dense_from_triplets<T: RealField + Copy>(
    nrows: usize,
    ncols: usize,
    triplets: impl IntoIterator<Item = (usize, usize, T)>,
) -> DMatrix<T> {
    let mut dense = DMatrix::zeros(nrows, ncols);
    for (i, j, v) in triplets {
        dense[(i, j)] += v;
    }
    dense
}
