use nalgebra::{DVector, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{TraceError, TraceResult};
use crate::integrator::{coordinates_with_jacobian, evaluate_field};
use crate::local_direction::local_direction;
use crate::shape::walk_increment;
use crate::traits::{FieldEvaluator, MeshTopology};
use crate::types::{FieldId, MeshLocation, Xi};

/// Largest xi change per axis used when the Jacobian cannot be inverted.
pub const SINGULAR_PERTURBATION: f64 = 1e-3;

/// A dragged seed point: where it is in the mesh and in the world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InteractivePoint {
    pub location: MeshLocation,
    pub position: Vector3<f64>,
}

/// Moves `point` by a world-space `translation` and re-evaluates its position.
///
/// The translation is mapped to xi with the local Jacobian, so it is only
/// accurate for small moves. A singular Jacobian does not fail the update:
/// the point is nudged by a small random xi offset instead.
pub fn update_interactive_point<R: Rng + ?Sized>(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    coordinate_field: FieldId,
    point: MeshLocation,
    translation: Option<&Vector3<f64>>,
    time: f64,
    rng: &mut R,
) -> TraceResult<InteractivePoint> {
    let dimension = topology.dimension(point.cell);
    if dimension != 3 {
        return Err(TraceError::InvalidArgument(format!(
            "interactive points need a 3-D cell, got dimension {dimension}"
        )));
    }
    let components = evaluator.component_count(coordinate_field);
    if components == 0 || components > 3 {
        return Err(TraceError::InvalidArgument(format!(
            "coordinate field must have 1 to 3 components, got {components}"
        )));
    }

    let mut location = point;
    if let Some(translation) = translation {
        let (_, jacobian) = coordinates_with_jacobian(evaluator, coordinate_field, point, time)?;
        let rows = jacobian.nrows().min(3);
        let vector = DVector::from_iterator(rows, translation.iter().take(rows).copied());
        let increment = match local_direction(&vector, &jacobian) {
            Ok(increment) => increment,
            Err(TraceError::SingularJacobian) => {
                warn!(cell = point.cell.0, "singular Jacobian, perturbing interactive point");
                let mut increment = Xi::zeros();
                for axis in 0..dimension {
                    increment[axis] = rng.gen_range(-SINGULAR_PERTURBATION..=SINGULAR_PERTURBATION);
                }
                increment
            }
            Err(err) => return Err(err),
        };
        let (cell, xi) = walk_increment(topology, point.cell, &point.xi, &increment, None);
        location = MeshLocation::new(cell, xi);
    }

    let coordinates = evaluate_field(evaluator, coordinate_field, location, time, false)?;
    Ok(InteractivePoint {
        location,
        position: coordinates.to_triple(),
    })
}
