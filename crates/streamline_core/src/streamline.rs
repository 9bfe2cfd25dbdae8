use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TraceError, TraceResult};
use crate::frame::{FrameRule, FrameSample, FrameTracker};
use crate::integrator::{
    adaptive_step, coordinates_with_jacobian, evaluate_field, FlowContext, IntegrationState,
    StepEvent, StepSettings,
};
use crate::traits::{FieldEvaluator, MeshTopology};
use crate::types::{CellFilter, CellId, FieldId, MeshLocation};

/// Initial number of samples reserved for a streamline.
pub const INITIAL_CAPACITY: usize = 100;

/// Stream vectors shorter than this end the trace.
const VANISHING_VECTOR: f64 = 1e-30;

/// Relative slack when deciding the requested length has been covered.
const LENGTH_TOLERANCE: f64 = 1e-12;

/// Scalar recorded alongside each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScalarData {
    #[default]
    None,
    /// Magnitude of the stream vector.
    Magnitude,
    /// Value of a scalar field.
    Field(FieldId),
    /// Arc length travelled so far, negative for reverse traces.
    ArcLength,
}

/// Why a trace stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    LengthReached,
    VectorVanished,
    NoNeighborCell,
    TransitionRejected,
    /// Bouncing between two cells whose vectors point at each other.
    Oscillating,
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceSettings {
    pub length: f64,
    pub reverse: bool,
    pub data: ScalarData,
    pub time: f64,
    pub step: StepSettings,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            length: 1.0,
            reverse: false,
            data: ScalarData::None,
            time: 0.0,
            step: StepSettings::default(),
        }
    }
}

/// Fields a trace follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFields {
    pub coordinate: FieldId,
    /// 2, 3, 6 or 9 components; the first ones form the tracked vector.
    pub stream: FieldId,
}

/// A traced curve with one entry per sample in every array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Streamline {
    points: Vec<Vector3<f64>>,
    vectors: Vec<Vector3<f64>>,
    ribbon_normals: Vec<Vector3<f64>>,
    data: Option<Vec<f64>>,
    end: MeshLocation,
    arc_length: f64,
    termination: Termination,
}

fn reserve<T>(buffer: &mut Vec<T>) -> TraceResult<()> {
    if buffer.len() == buffer.capacity() {
        let additional = buffer.len().max(INITIAL_CAPACITY);
        buffer
            .try_reserve_exact(additional)
            .map_err(|_| TraceError::OutOfMemory)?;
    }
    Ok(())
}

impl Streamline {
    /// An empty streamline starting at `start`.
    pub fn new(start: MeshLocation, with_data: bool) -> TraceResult<Self> {
        let mut streamline = Self {
            points: Vec::new(),
            vectors: Vec::new(),
            ribbon_normals: Vec::new(),
            data: with_data.then(Vec::new),
            end: start,
            arc_length: 0.0,
            termination: Termination::LengthReached,
        };
        streamline.reserve_sample()?;
        Ok(streamline)
    }

    fn reserve_sample(&mut self) -> TraceResult<()> {
        reserve(&mut self.points)?;
        reserve(&mut self.vectors)?;
        reserve(&mut self.ribbon_normals)?;
        if let Some(data) = self.data.as_mut() {
            reserve(data)?;
        }
        Ok(())
    }

    /// Appends one sample to every array, or to none of them.
    pub fn push(
        &mut self,
        point: Vector3<f64>,
        vector: Vector3<f64>,
        ribbon_normal: Vector3<f64>,
        datum: Option<f64>,
    ) -> TraceResult<()> {
        if self.data.is_some() != datum.is_some() {
            return Err(TraceError::InvalidArgument(
                "scalar datum must be given exactly when data is recorded".to_string(),
            ));
        }
        self.reserve_sample()?;
        self.points.push(point);
        self.vectors.push(vector);
        self.ribbon_normals.push(ribbon_normal);
        if let (Some(data), Some(datum)) = (self.data.as_mut(), datum) {
            data.push(datum);
        }
        Ok(())
    }

    fn finish(&mut self, end: MeshLocation, arc_length: f64, termination: Termination) {
        self.end = end;
        self.arc_length = arc_length;
        self.termination = termination;
        self.points.shrink_to_fit();
        self.vectors.shrink_to_fit();
        self.ribbon_normals.shrink_to_fit();
        if let Some(data) = self.data.as_mut() {
            data.shrink_to_fit();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    pub fn vectors(&self) -> &[Vector3<f64>] {
        &self.vectors
    }

    pub fn ribbon_normals(&self) -> &[Vector3<f64>] {
        &self.ribbon_normals
    }

    pub fn data(&self) -> Option<&[f64]> {
        self.data.as_deref()
    }

    /// Where tracing stopped; pass it as the next seed to continue.
    pub fn end(&self) -> MeshLocation {
        self.end
    }

    pub fn arc_length(&self) -> f64 {
        self.arc_length
    }

    pub fn termination(&self) -> Termination {
        self.termination
    }
}

/// Traces a streamline from `seed` through the whole mesh.
///
/// Returns `Ok(None)` when nothing could be recorded, for instance when the
/// stream vector vanishes at the seed. Any evaluation or solver failure
/// discards the partial streamline and is returned as an error.
pub fn trace_streamline(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    seed: MeshLocation,
    fields: StreamFields,
    settings: &TraceSettings,
) -> TraceResult<Option<Streamline>> {
    trace_streamline_in_region(evaluator, topology, seed, fields, settings, None)
}

/// Like [`trace_streamline`], but only moves into cells accepted by `region`.
pub fn trace_streamline_in_region(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    seed: MeshLocation,
    fields: StreamFields,
    settings: &TraceSettings,
    region: Option<CellFilter<'_>>,
) -> TraceResult<Option<Streamline>> {
    let rule = check_trace_request(evaluator, topology, &seed, fields, settings)?;
    let stream_components = evaluator.component_count(fields.stream);
    let mut frames = FrameTracker::new(rule, settings.reverse);
    let mut streamline = Streamline::new(seed, settings.data != ScalarData::None)?;
    let mut state = IntegrationState::new(seed.cell, seed.xi);
    let mut boundary: Option<Termination> = None;
    // (cell, arc length) before the last step and the one before that.
    let mut history: [Option<(CellId, f64)>; 2] = [None, None];

    let termination = loop {
        let location = state.location();
        let (coordinates, jacobian) =
            coordinates_with_jacobian(evaluator, fields.coordinate, location, settings.time)?;
        let stream = evaluate_field(
            evaluator,
            fields.stream,
            location,
            settings.time,
            frames.needs_stream_derivatives(),
        )?;
        if stream.values.len() != stream_components {
            return Err(TraceError::ComponentMismatch {
                field: fields.stream,
                expected: stream_components,
                actual: stream.values.len(),
            });
        }

        let mut vector = stream.to_triple();
        if settings.reverse {
            vector = -vector;
        }
        let magnitude = vector.norm();
        if magnitude < VANISHING_VECTOR {
            break Termination::VectorVanished;
        }

        let position = coordinates.to_triple();
        let frame = frames.frame(&FrameSample {
            vector,
            stream: &stream,
            coordinate_jacobian: &jacobian,
            position,
            arc_length: state.total_arc_length,
        });
        let datum = match settings.data {
            ScalarData::None => None,
            ScalarData::Magnitude => Some(magnitude),
            ScalarData::ArcLength if settings.reverse => Some(-state.total_arc_length),
            ScalarData::ArcLength => Some(state.total_arc_length),
            ScalarData::Field(field) => {
                let sample = evaluate_field(evaluator, field, location, settings.time, false)?;
                match sample.values.as_slice() {
                    [value] => Some(*value),
                    values => {
                        return Err(TraceError::ComponentMismatch {
                            field,
                            expected: 1,
                            actual: values.len(),
                        })
                    }
                }
            }
        };
        streamline.push(position, vector, frame.normal, datum)?;

        if let Some(termination) = boundary {
            break termination;
        }
        let remaining = settings.length - state.total_arc_length;
        if remaining <= LENGTH_TOLERANCE * settings.length {
            break Termination::LengthReached;
        }
        if state.step_size > remaining {
            state.step_size = remaining;
        }

        history[1] = history[0];
        history[0] = Some((state.cell, state.total_arc_length));
        let mut ctx = FlowContext {
            evaluator: &mut *evaluator,
            topology,
            coordinate_field: fields.coordinate,
            stream_field: fields.stream,
            reverse: settings.reverse,
            time: settings.time,
            region,
            arc_length_limit: settings.length,
            settings: settings.step,
        };
        let outcome = adaptive_step(&mut ctx, state)?;
        state = outcome.state;
        match outcome.event {
            StepEvent::Interior | StepEvent::CrossedFace { .. } => {}
            StepEvent::MeshBoundary => boundary = Some(Termination::NoNeighborCell),
            StepEvent::TransitionRejected => boundary = Some(Termination::TransitionRejected),
            StepEvent::RetriesExhausted => break Termination::Stalled,
            StepEvent::Stationary => break Termination::VectorVanished,
        }

        if let (Some((previous_cell, _)), Some((earlier_cell, earlier_length))) =
            (history[0], history[1])
        {
            if state.total_arc_length == earlier_length {
                if state.cell == earlier_cell && state.cell != previous_cell {
                    break Termination::Oscillating;
                }
                break Termination::Stalled;
            }
        }
    };

    evaluator.clear_cache(fields.coordinate);
    evaluator.clear_cache(fields.stream);
    if let ScalarData::Field(field) = settings.data {
        evaluator.clear_cache(field);
    }

    if streamline.is_empty() {
        debug!(?termination, "no streamline samples recorded");
        return Ok(None);
    }
    streamline.finish(state.location(), state.total_arc_length, termination);
    debug!(
        samples = streamline.len(),
        arc_length = streamline.arc_length(),
        ?termination,
        "streamline traced"
    );
    Ok(Some(streamline))
}

fn check_trace_request(
    evaluator: &dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    seed: &MeshLocation,
    fields: StreamFields,
    settings: &TraceSettings,
) -> TraceResult<FrameRule> {
    if !topology.is_top_level(seed.cell) {
        return Err(TraceError::InvalidArgument(format!(
            "seed cell {:?} is not a top-level cell",
            seed.cell
        )));
    }
    let dimension = topology.dimension(seed.cell);
    if dimension != 2 && dimension != 3 {
        return Err(TraceError::InvalidArgument(format!(
            "seed cell dimension must be 2 or 3, got {dimension}"
        )));
    }
    if seed.xi.iter().any(|value| !(0.0..=1.0).contains(value)) {
        return Err(TraceError::InvalidArgument(format!(
            "seed xi {:?} is outside the unit cell",
            seed.xi.as_slice()
        )));
    }

    let coordinate_components = evaluator.component_count(fields.coordinate);
    let stream_components = evaluator.component_count(fields.stream);
    let supported = matches!(
        (coordinate_components, stream_components),
        (3, 3) | (3, 6) | (3, 9) | (2, 2)
    );
    let rule = FrameRule::select(dimension, stream_components).filter(|_| supported);
    let Some(rule) = rule else {
        return Err(TraceError::InvalidArgument(format!(
            "unsupported combination of {dimension}-D cell, {coordinate_components} coordinate \
             and {stream_components} stream vector components"
        )));
    };

    if settings.length <= 0.0 || !settings.length.is_finite() {
        return Err(TraceError::InvalidArgument(format!(
            "length must be positive and finite, got {}",
            settings.length
        )));
    }
    if let ScalarData::Field(field) = settings.data {
        let components = evaluator.component_count(field);
        if components != 1 {
            return Err(TraceError::InvalidArgument(format!(
                "data field {field:?} must be scalar, it has {components} components"
            )));
        }
    }
    settings.step.validate()?;
    Ok(rule)
}
