use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TraceError, TraceResult};
use crate::integrator::{
    adaptive_step, evaluate_field, FlowContext, IntegrationState, StepEvent, StepSettings,
};
use crate::streamline::StreamFields;
use crate::traits::{FieldEvaluator, MeshTopology};
use crate::types::{CellFilter, CellId, FieldId, MeshLocation, Xi};

/// Sub-steps allowed for one particle in one update.
const MAX_SUB_STEPS: usize = 10_000;

/// A massless particle carried along by the stream vector field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowParticle {
    pub location: MeshLocation,
    pub position: Vector3<f64>,
    /// Set once the particle has left the mesh or got trapped. Stranded
    /// particles are not advanced again.
    pub stranded: bool,
}

impl FlowParticle {
    /// Places a particle at `location`, evaluating its world position.
    pub fn place(
        evaluator: &mut dyn FieldEvaluator,
        coordinate_field: FieldId,
        location: MeshLocation,
        time: f64,
    ) -> TraceResult<Self> {
        let coordinates = evaluate_field(evaluator, coordinate_field, location, time, false)?;
        Ok(Self {
            location,
            position: coordinates.to_triple(),
            stranded: false,
        })
    }
}

/// Places one particle at `seed_xi` in every top-level 3-D cell of `cells`
/// accepted by `filter`.
pub fn place_particles<I>(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    cells: I,
    coordinate_field: FieldId,
    seed_xi: Xi,
    time: f64,
    filter: Option<CellFilter<'_>>,
) -> TraceResult<Vec<FlowParticle>>
where
    I: IntoIterator<Item = CellId>,
{
    let mut particles = Vec::new();
    for cell in cells {
        if topology.dimension(cell) != 3
            || !topology.is_top_level(cell)
            || filter.is_some_and(|accept| !accept(cell))
        {
            continue;
        }
        let location = MeshLocation::new(cell, seed_xi);
        particles.push(FlowParticle::place(evaluator, coordinate_field, location, time)?);
    }
    evaluator.clear_cache(coordinate_field);
    debug!(particles = particles.len(), "flow particles placed");
    Ok(particles)
}

/// Advances every particle by `step` units of integration at `time`.
///
/// Returns how many particles moved. Evaluation failures abort the update;
/// particles processed before the failure keep their new positions.
pub fn advance_particles(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    fields: StreamFields,
    particles: &mut [FlowParticle],
    step: f64,
    time: f64,
) -> TraceResult<usize> {
    if step <= 0.0 || !step.is_finite() {
        return Err(TraceError::InvalidArgument(format!(
            "particle step must be positive, got {step}"
        )));
    }
    let coordinate_components = evaluator.component_count(fields.coordinate);
    let stream_components = evaluator.component_count(fields.stream);
    if coordinate_components != 3 || stream_components < 3 {
        return Err(TraceError::InvalidArgument(format!(
            "particles need 3 coordinate and at least 3 stream components, got \
             {coordinate_components} and {stream_components}"
        )));
    }

    let mut moved = 0;
    for particle in particles.iter_mut().filter(|particle| !particle.stranded) {
        let result = advance_particle(evaluator, topology, fields, particle, step, time);
        evaluator.clear_cache(fields.coordinate);
        evaluator.clear_cache(fields.stream);
        if result? {
            moved += 1;
        }
    }
    debug!(moved, total = particles.len(), "flow particles advanced");
    Ok(moved)
}

fn advance_particle(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    fields: StreamFields,
    particle: &mut FlowParticle,
    step: f64,
    time: f64,
) -> TraceResult<bool> {
    let dimension = topology.dimension(particle.location.cell);
    if dimension != 3 {
        return Err(TraceError::InvalidArgument(format!(
            "particle cell {:?} has dimension {dimension}, expected 3",
            particle.location.cell
        )));
    }

    let mut ctx = FlowContext {
        evaluator: &mut *evaluator,
        topology,
        coordinate_field: fields.coordinate,
        stream_field: fields.stream,
        reverse: false,
        time,
        region: None,
        arc_length_limit: step,
        settings: StepSettings::default(),
    };
    let mut state = IntegrationState {
        step_size: step,
        ..IntegrationState::new(particle.location.cell, particle.location.xi)
    };
    // Cells entered since the arc length last grew.
    let mut stuck_cells: Vec<CellId> = Vec::new();
    let mut stuck_length = state.total_arc_length;
    let mut sub_steps = 0;

    while state.total_arc_length < step {
        if sub_steps == MAX_SUB_STEPS {
            warn!(cell = state.cell.0, step, "particle made no headway, stranding it");
            particle.stranded = true;
            break;
        }
        sub_steps += 1;
        let remaining = step - state.total_arc_length;
        if state.step_size > remaining {
            state.step_size = remaining;
        }
        let outcome = adaptive_step(&mut ctx, state)?;
        state = outcome.state;
        if state.total_arc_length > stuck_length {
            stuck_cells.clear();
            stuck_length = state.total_arc_length;
        }
        match outcome.event {
            StepEvent::Interior => {}
            StepEvent::CrossedFace { from, to } => {
                if stuck_cells.is_empty() {
                    stuck_cells.push(from);
                }
                // Back in a cell already visited without moving: the flow
                // circulates around a shared face or edge.
                if stuck_cells.contains(&to) {
                    particle.stranded = true;
                    break;
                }
                stuck_cells.push(to);
            }
            StepEvent::MeshBoundary
            | StepEvent::TransitionRejected
            | StepEvent::RetriesExhausted => {
                particle.stranded = true;
                break;
            }
            StepEvent::Stationary => break,
        }
    }

    particle.location = state.location();
    let coordinates = evaluate_field(evaluator, fields.coordinate, particle.location, time, false)?;
    particle.position = coordinates.to_triple();
    Ok(state.total_arc_length > 0.0)
}
