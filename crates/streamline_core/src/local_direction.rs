use nalgebra::{DMatrix, DVector};
use std::cmp::Ordering;

use crate::error::{TraceError, TraceResult};
use crate::types::{Xi, MAX_XI_DIMENSIONS};

/// Relative pivot size below which an LU factorization is treated as singular.
const SINGULAR_TOLERANCE: f64 = 1e-12;

/// Converts a world-space `vector` into a parametric direction `delta_xi`
/// with `jacobian * delta_xi ≈ vector`.
///
/// `jacobian` has one row per world component and one column per cell
/// dimension. Square systems are solved directly; when the cell has fewer
/// dimensions than the vector the least-squares solution of the normal
/// equations is returned. Cells with more dimensions than the vector are
/// rejected.
pub fn local_direction(vector: &DVector<f64>, jacobian: &DMatrix<f64>) -> TraceResult<Xi> {
    let vector_dimension = jacobian.nrows();
    let element_dimension = jacobian.ncols();
    if vector.len() != vector_dimension {
        return Err(TraceError::InvalidArgument(format!(
            "vector has {} components but the Jacobian has {} rows",
            vector.len(),
            vector_dimension
        )));
    }
    if element_dimension == 0 || element_dimension > MAX_XI_DIMENSIONS {
        return Err(TraceError::InvalidArgument(format!(
            "unsupported element dimension {element_dimension}"
        )));
    }

    let solution = match element_dimension.cmp(&vector_dimension) {
        Ordering::Equal => solve_lu(jacobian.clone(), vector)?,
        Ordering::Less => {
            let transpose = jacobian.transpose();
            let normal_matrix = &transpose * jacobian;
            let rhs = &transpose * vector;
            solve_lu(normal_matrix, &rhs)?
        }
        Ordering::Greater => {
            return Err(TraceError::UnderdeterminedSystem {
                element_dimension,
                vector_dimension,
            })
        }
    };

    let mut delta_xi = Xi::zeros();
    for (i, value) in solution.iter().enumerate() {
        delta_xi[i] = *value;
    }
    Ok(delta_xi)
}

fn solve_lu(matrix: DMatrix<f64>, rhs: &DVector<f64>) -> TraceResult<DVector<f64>> {
    let scale = matrix.amax();
    if scale <= 0.0 || !scale.is_finite() {
        return Err(TraceError::SingularJacobian);
    }
    let lu = matrix.lu();
    let threshold = SINGULAR_TOLERANCE * scale;
    if lu.u().diagonal().iter().any(|pivot| pivot.abs() <= threshold) {
        return Err(TraceError::SingularJacobian);
    }
    lu.solve(rhs).ok_or(TraceError::SingularJacobian)
}
