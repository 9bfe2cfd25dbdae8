use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{TraceError, TraceResult};
use crate::local_direction::local_direction;
use crate::traits::{FieldEvaluator, MeshTopology};
use crate::types::{
    BoundaryClip, CellFilter, CellId, FaceCrossing, FaceId, FieldId, FieldValues, MeshLocation, Xi,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSettings {
    /// Largest accepted xi distance between the single and the double half step.
    pub tolerance: f64,
    /// Below this xi travel a step counts as exact.
    pub resolved_step_floor: f64,
    /// Xi distance covered by an auto-initialized first step.
    pub initial_xi_step: f64,
    /// Added to the boundary fraction so the refined step still reaches the face.
    pub boundary_overshoot: f64,
    pub max_step_retries: usize,
    /// Allowed position mismatch after a cell transition, relative to the cell size.
    pub coordinate_tolerance: f64,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            resolved_step_floor: 1e-3,
            initial_xi_step: 1e-2,
            boundary_overshoot: 1e-3,
            max_step_retries: 50,
            coordinate_tolerance: 1e-2,
        }
    }
}

impl StepSettings {
    pub fn validate(&self) -> TraceResult<()> {
        let positive = [
            ("tolerance", self.tolerance),
            ("resolved_step_floor", self.resolved_step_floor),
            ("initial_xi_step", self.initial_xi_step),
            ("coordinate_tolerance", self.coordinate_tolerance),
        ];
        for (name, value) in positive {
            if value <= 0.0 || !value.is_finite() {
                return Err(TraceError::InvalidArgument(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.boundary_overshoot) {
            return Err(TraceError::InvalidArgument(format!(
                "boundary_overshoot must lie in [0, 1), got {}",
                self.boundary_overshoot
            )));
        }
        if self.max_step_retries == 0 {
            return Err(TraceError::InvalidArgument(
                "max_step_retries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a trace is and how far it has come. Each step returns a new state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrationState {
    pub cell: CellId,
    pub xi: Xi,
    /// Zero requests an automatic first step.
    pub step_size: f64,
    pub total_arc_length: f64,
    pub keep_tracking: bool,
}

impl IntegrationState {
    pub fn new(cell: CellId, xi: Xi) -> Self {
        Self {
            cell,
            xi,
            step_size: 0.0,
            total_arc_length: 0.0,
            keep_tracking: true,
        }
    }

    pub fn location(&self) -> MeshLocation {
        MeshLocation::new(self.cell, self.xi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepEvent {
    /// The step stayed inside the cell.
    Interior,
    CrossedFace { from: CellId, to: CellId },
    /// A face was reached with no neighbour behind it.
    MeshBoundary,
    /// A neighbour exists but no orientation of it matched the coordinates.
    TransitionRejected,
    /// The error control loop gave up; the state is unchanged.
    RetriesExhausted,
    /// The local direction is zero, so the step cannot advance.
    Stationary,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub state: IntegrationState,
    pub event: StepEvent,
}

/// Everything a step needs besides the state itself.
pub struct FlowContext<'a> {
    pub evaluator: &'a mut dyn FieldEvaluator,
    pub topology: &'a dyn MeshTopology,
    pub coordinate_field: FieldId,
    pub stream_field: FieldId,
    pub reverse: bool,
    pub time: f64,
    pub region: Option<CellFilter<'a>>,
    /// An auto-initialized first step never goes past this arc length.
    pub arc_length_limit: f64,
    pub settings: StepSettings,
}

/// Evaluates a field, attaching the field and cell to any evaluator failure.
pub(crate) fn evaluate_field(
    evaluator: &mut dyn FieldEvaluator,
    field: FieldId,
    location: MeshLocation,
    time: f64,
    with_derivative: bool,
) -> TraceResult<FieldValues> {
    evaluator
        .evaluate(field, location, time, with_derivative)
        .map_err(|source| TraceError::FieldUndefined {
            field,
            cell: location.cell,
            source,
        })
}

/// Coordinates and their Jacobian at `location`.
pub(crate) fn coordinates_with_jacobian(
    evaluator: &mut dyn FieldEvaluator,
    coordinate_field: FieldId,
    location: MeshLocation,
    time: f64,
) -> TraceResult<(FieldValues, DMatrix<f64>)> {
    let mut sample = evaluate_field(evaluator, coordinate_field, location, time, true)?;
    let jacobian = sample
        .derivatives
        .take()
        .ok_or(TraceError::MissingDerivatives {
            field: coordinate_field,
        })?;
    Ok((sample, jacobian))
}

/// Root mean square column length of the Jacobian.
pub(crate) fn length_scale(jacobian: &DMatrix<f64>) -> f64 {
    let columns = jacobian.ncols().max(1) as f64;
    (jacobian.norm_squared() / columns).sqrt()
}

struct Slope {
    delta_xi: Xi,
    jacobian: DMatrix<f64>,
}

fn slope(ctx: &mut FlowContext<'_>, cell: CellId, xi: &Xi) -> TraceResult<Slope> {
    let location = MeshLocation::new(cell, *xi);
    let (_, jacobian) =
        coordinates_with_jacobian(ctx.evaluator, ctx.coordinate_field, location, ctx.time)?;
    let stream = evaluate_field(ctx.evaluator, ctx.stream_field, location, ctx.time, false)?;
    let vector_dimension = jacobian.nrows();
    if stream.values.len() < vector_dimension {
        return Err(TraceError::ComponentMismatch {
            field: ctx.stream_field,
            expected: vector_dimension,
            actual: stream.values.len(),
        });
    }
    let mut vector = DVector::from_column_slice(&stream.values[..vector_dimension]);
    if ctx.reverse {
        vector.neg_mut();
    }
    let delta_xi = local_direction(&vector, &jacobian)?;
    Ok(Slope { delta_xi, jacobian })
}

fn position(ctx: &mut FlowContext<'_>, cell: CellId, xi: &Xi) -> TraceResult<DVector<f64>> {
    let sample = evaluate_field(
        ctx.evaluator,
        ctx.coordinate_field,
        MeshLocation::new(cell, *xi),
        ctx.time,
        false,
    )?;
    Ok(DVector::from_vec(sample.values))
}

/// True when some axis of `moved` did not move and sits on a face of the cell.
fn still_on_face(dimension: usize, start: &Xi, moved: &Xi) -> bool {
    (0..dimension)
        .any(|axis| moved[axis] == start[axis] && (moved[axis] == 0.0 || moved[axis] == 1.0))
}

/// Advances `state` by one adaptive improved-Euler step.
///
/// The step is estimated twice, once whole and once as two half steps, and
/// halved until both agree within `settings.tolerance`. Every sub-step is
/// clipped at the cell boundary; when the accepted step ends on a face the
/// trace moves into the neighbouring cell.
pub fn adaptive_step(
    ctx: &mut FlowContext<'_>,
    state: IntegrationState,
) -> TraceResult<StepOutcome> {
    let settings = ctx.settings;
    let topology = ctx.topology;
    let cell = state.cell;
    let xi = state.xi;
    let dimension = topology.dimension(cell);

    let start = slope(ctx, cell, &xi)?;
    let delta_xi = start.delta_xi;
    let coordinate_length = length_scale(&start.jacobian);

    let mut step = state.step_size;
    if step == 0.0 {
        let magnitude = delta_xi.norm();
        if magnitude <= 0.0 || !magnitude.is_finite() {
            return Ok(StepOutcome {
                state,
                event: StepEvent::Stationary,
            });
        }
        step = settings.initial_xi_step / magnitude;
        let remaining = ctx.arc_length_limit - state.total_arc_length;
        if remaining > 0.0 && step > remaining {
            step = remaining;
        }
    }

    let whole = topology.boundary_clip(cell, &xi, &(delta_xi * step));
    let slope_whole = slope(ctx, cell, &whole.xi)?;
    let mut corrected = topology.boundary_clip(
        cell,
        &xi,
        &((delta_xi + slope_whole.delta_xi) * (step / 2.0)),
    );
    let corrected_face = corrected.face;

    let mut accepted: Option<(BoundaryClip, f64)> = None;
    if corrected_face.is_some() {
        if corrected.fraction <= 0.0 {
            step = 0.0;
            accepted = Some((corrected, 0.0));
        } else {
            step *= corrected.fraction + settings.boundary_overshoot;
        }
    }

    let mut retries = 0;
    let (finish, error) = loop {
        if let Some(result) = accepted {
            break result;
        }
        if retries >= settings.max_step_retries {
            return Ok(StepOutcome {
                state,
                event: StepEvent::RetriesExhausted,
            });
        }
        retries += 1;

        let quarter = topology.boundary_clip(cell, &xi, &(delta_xi * (step / 2.0)));
        let slope_quarter = slope(ctx, cell, &quarter.xi)?;
        let mut half = topology.boundary_clip(
            cell,
            &xi,
            &((delta_xi + slope_quarter.delta_xi) * (step / 4.0)),
        );
        if half.face.is_some()
            && corrected_face.is_none()
            && still_on_face(dimension, &xi, &half.xi)
        {
            half = BoundaryClip::interior(corrected.xi);
        }

        let finish = if half.face.is_none() {
            let slope_half = slope(ctx, cell, &half.xi)?;
            let three_quarter =
                topology.boundary_clip(cell, &half.xi, &(slope_half.delta_xi * (step / 2.0)));
            let slope_three_quarter = slope(ctx, cell, &three_quarter.xi)?;
            let finish = topology.boundary_clip(
                cell,
                &half.xi,
                &((slope_half.delta_xi + slope_three_quarter.delta_xi) * (step / 4.0)),
            );
            if finish.face.is_some() {
                step *= 0.5 + finish.fraction / 2.0;
            }
            finish
        } else {
            step *= half.fraction / 2.0;
            half
        };

        let mut error = (finish.xi - corrected.xi).norm();
        if step * slope_quarter.delta_xi.norm() < settings.resolved_step_floor {
            error = 0.0;
        }
        if error > settings.tolerance {
            step /= 2.0;
            corrected.xi = half.xi;
            continue;
        }
        break (finish, error);
    };

    let total_arc_length = state.total_arc_length + step;
    match finish.face {
        None => {
            if error < settings.tolerance / 10.0 {
                step *= 2.0;
            }
            Ok(StepOutcome {
                state: IntegrationState {
                    cell,
                    xi: finish.xi,
                    step_size: step,
                    total_arc_length,
                    keep_tracking: state.keep_tracking,
                },
                event: StepEvent::Interior,
            })
        }
        Some(face) => {
            let arrived = IntegrationState {
                cell,
                xi: finish.xi,
                step_size: state.step_size,
                total_arc_length,
                keep_tracking: state.keep_tracking,
            };
            change_cell(ctx, arrived, face, &finish.face_xi, coordinate_length)
        }
    }
}

/// Moves a state sitting on `face` into the neighbouring cell, trying each
/// orientation of the face until the coordinates agree on both sides.
fn change_cell(
    ctx: &mut FlowContext<'_>,
    state: IntegrationState,
    face: FaceId,
    face_xi: &Xi,
    coordinate_length: f64,
) -> TraceResult<StepOutcome> {
    let topology = ctx.topology;
    let stopped = IntegrationState {
        keep_tracking: false,
        ..state
    };
    let permutations = topology.crossing_permutations(state.cell, face).max(1);
    let mut reference: Option<DVector<f64>> = None;
    let mut mismatch = f64::INFINITY;

    for permutation in 0..permutations {
        let request = FaceCrossing {
            cell: state.cell,
            face,
            xi: state.xi,
            face_xi: *face_xi,
            increment: None,
            permutation,
            region: ctx.region,
        };
        let Some(crossing) = topology.cross_face(&request) else {
            if permutation == 0 {
                return Ok(StepOutcome {
                    state: stopped,
                    event: StepEvent::MeshBoundary,
                });
            }
            continue;
        };

        let here = match reference.take() {
            Some(here) => here,
            None => position(ctx, state.cell, &state.xi)?,
        };
        let there = position(ctx, crossing.cell, &crossing.xi)?;
        let distance = if here.len() == there.len() {
            (&there - &here).norm()
        } else {
            f64::INFINITY
        };
        mismatch = if coordinate_length > 0.0 {
            distance / coordinate_length
        } else {
            distance
        };
        if mismatch <= ctx.settings.coordinate_tolerance {
            return Ok(StepOutcome {
                state: IntegrationState {
                    cell: crossing.cell,
                    xi: crossing.xi,
                    ..state
                },
                event: StepEvent::CrossedFace {
                    from: state.cell,
                    to: crossing.cell,
                },
            });
        }
        reference = Some(here);
    }

    warn!(
        cell = state.cell.0,
        face = face.0,
        mismatch,
        "coordinates do not match after changing cells"
    );
    Ok(StepOutcome {
        state: stopped,
        event: StepEvent::TransitionRejected,
    })
}
