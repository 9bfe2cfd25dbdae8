//! Value types shared by the tracing engine and its collaborators.
//!
//! Cells, faces and fields are opaque handles owned by the external mesh and
//! field evaluator; the engine only copies them around.

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

/// Largest parametric dimension a cell may have.
pub const MAX_XI_DIMENSIONS: usize = 3;

/// Parametric coordinates within a cell. Components past the cell dimension are zero.
pub type Xi = Vector3<f64>;

/// Predicate restricting cell transitions to a sub-mesh.
pub type CellFilter<'a> = &'a dyn Fn(CellId) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u32);

/// A point inside a particular cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshLocation {
    pub cell: CellId,
    pub xi: Xi,
}

impl MeshLocation {
    pub fn new(cell: CellId, xi: Xi) -> Self {
        Self { cell, xi }
    }
}

/// Result of evaluating a field at a mesh location.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValues {
    pub values: Vec<f64>,
    /// Partial derivatives with respect to xi: one row per component, one
    /// column per cell dimension. `None` when not requested or unavailable.
    pub derivatives: Option<DMatrix<f64>>,
}

impl FieldValues {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            derivatives: None,
        }
    }

    pub fn with_derivatives(values: Vec<f64>, derivatives: DMatrix<f64>) -> Self {
        Self {
            values,
            derivatives: Some(derivatives),
        }
    }

    /// First three components as a vector, zero-padded.
    pub fn to_triple(&self) -> Vector3<f64> {
        let mut triple = Vector3::zeros();
        for (slot, value) in triple.iter_mut().zip(self.values.iter()) {
            *slot = *value;
        }
        triple
    }

    /// Components `start..start + 3` as a vector, zero-padded.
    pub fn triple_at(&self, start: usize) -> Vector3<f64> {
        let mut triple = Vector3::zeros();
        for i in 0..3 {
            if let Some(value) = self.values.get(start + i) {
                triple[i] = *value;
            }
        }
        triple
    }
}

/// Outcome of clipping an xi increment against the boundary of a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryClip {
    /// Position reached, on the boundary if a face was hit.
    pub xi: Xi,
    /// Fraction of the requested increment actually taken, in `[0, 1]`.
    pub fraction: f64,
    pub face: Option<FaceId>,
    /// Coordinates of `xi` within the face that was hit.
    pub face_xi: Xi,
}

impl BoundaryClip {
    /// A full step that stays inside the cell.
    pub fn interior(xi: Xi) -> Self {
        Self {
            xi,
            fraction: 1.0,
            face: None,
            face_xi: Xi::zeros(),
        }
    }
}

/// Request to move from a cell into the neighbour sharing `face`.
pub struct FaceCrossing<'a> {
    pub cell: CellId,
    pub face: FaceId,
    /// Position on the face in the current cell.
    pub xi: Xi,
    pub face_xi: Xi,
    /// Remaining increment to re-express in the neighbour, if any.
    pub increment: Option<Xi>,
    /// Which of the face's possible orientations to try.
    pub permutation: usize,
    pub region: Option<CellFilter<'a>>,
}

/// The neighbour reached through a face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellCrossing {
    pub cell: CellId,
    pub xi: Xi,
    pub increment: Option<Xi>,
}
