use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

use crate::error::{TraceError, TraceResult};
use crate::frame::unit_or_zero;
use crate::streamline::{trace_streamline, StreamFields, Streamline, TraceSettings};
use crate::traits::{FieldEvaluator, MeshTopology};
use crate::types::MeshLocation;

/// Points around an extruded ellipse or circle; the last repeats the first.
pub const ELLIPSE_POINTS: usize = 20;

/// Thickness of extruded rectangles and ellipses relative to their width.
pub const THICKNESS_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossSection {
    Line,
    Ribbon,
    ExtrudedRectangle,
    ExtrudedEllipse,
    ExtrudedCircle,
}

impl CrossSection {
    /// Vertices emitted per streamline sample.
    pub fn ring_size(self) -> usize {
        match self {
            Self::Line => 1,
            Self::Ribbon => 2,
            Self::ExtrudedRectangle => 8,
            Self::ExtrudedEllipse | Self::ExtrudedCircle => ELLIPSE_POINTS,
        }
    }

    pub fn thickness(self, width: f64) -> f64 {
        match self {
            Self::ExtrudedCircle => width,
            _ => THICKNESS_RATIO * width,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Polyline,
    /// Consecutive rings of `ring_size` vertices joined by quads.
    Surface { ring_size: usize },
}

/// Renderable output for one streamline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPrimitive {
    pub kind: PrimitiveKind,
    pub points: Vec<Vector3<f64>>,
    pub normals: Option<Vec<Vector3<f64>>>,
    pub data: Option<Vec<f64>>,
    /// Number of streamline samples the primitive was built from.
    pub samples: usize,
}

impl StreamPrimitive {
    /// Triangles joining consecutive rings, two per quad. Empty for polylines.
    pub fn triangle_indices(&self) -> Vec<[usize; 3]> {
        let PrimitiveKind::Surface { ring_size } = self.kind else {
            return Vec::new();
        };
        if ring_size < 2 || self.samples < 2 {
            return Vec::new();
        }
        let mut triangles = Vec::with_capacity(2 * (ring_size - 1) * (self.samples - 1));
        for sample in 0..self.samples - 1 {
            for corner in 0..ring_size - 1 {
                let here = sample * ring_size + corner;
                let next = here + ring_size;
                triangles.push([here, next, here + 1]);
                triangles.push([here + 1, next, next + 1]);
            }
        }
        triangles
    }
}

/// Sweeps `cross_section` along a traced streamline. `None` for an empty streamline.
pub fn build_primitive(
    streamline: &Streamline,
    cross_section: CrossSection,
    width: f64,
) -> Option<StreamPrimitive> {
    if streamline.is_empty() {
        return None;
    }
    let samples = streamline.len();
    if cross_section == CrossSection::Line {
        return Some(StreamPrimitive {
            kind: PrimitiveKind::Polyline,
            points: streamline.points().to_vec(),
            normals: None,
            data: streamline.data().map(<[f64]>::to_vec),
            samples,
        });
    }

    let ring_size = cross_section.ring_size();
    let thickness = cross_section.thickness(width);
    let mut points = Vec::with_capacity(samples * ring_size);
    let mut normals = Vec::with_capacity(samples * ring_size);
    let mut direction = Vector3::x();

    for index in 0..samples {
        let point = streamline.points()[index];
        let vector = streamline.vectors()[index];
        let normal = streamline.ribbon_normals()[index];
        if vector.norm() > 0.0 {
            direction = vector.normalize();
        }
        let cross = normal.cross(&direction);
        let cross_width = cross * (0.5 * width);
        let cross_thickness = normal * (0.5 * thickness);

        match cross_section {
            CrossSection::Line => {}
            CrossSection::Ribbon => {
                points.extend([point + cross_width, point - cross_width]);
                normals.extend([normal, normal]);
            }
            CrossSection::ExtrudedRectangle => {
                points.extend([
                    point + cross_width + cross_thickness,
                    point - cross_width + cross_thickness,
                    point - cross_width + cross_thickness,
                    point - cross_width - cross_thickness,
                    point - cross_width - cross_thickness,
                    point + cross_width - cross_thickness,
                    point + cross_width - cross_thickness,
                    point + cross_width + cross_thickness,
                ]);
                normals.extend([normal, normal, -cross, -cross, -normal, -normal, cross, cross]);
            }
            CrossSection::ExtrudedEllipse | CrossSection::ExtrudedCircle => {
                for step in 0..ELLIPSE_POINTS {
                    let angle = TAU * step as f64 / (ELLIPSE_POINTS - 1) as f64;
                    let (sin, cos) = angle.sin_cos();
                    points.push(point + cross_width * sin + cross_thickness * cos);
                    let outward = cross * (sin * 0.5 * thickness) + normal * (cos * 0.5 * width);
                    normals.push(unit_or_zero(outward));
                }
            }
        }
    }

    let data = streamline.data().map(|data| {
        data.iter()
            .flat_map(|datum| std::iter::repeat(*datum).take(ring_size))
            .collect()
    });
    Some(StreamPrimitive {
        kind: PrimitiveKind::Surface { ring_size },
        points,
        normals: Some(normals),
        data,
        samples,
    })
}

/// Traces from `seed` and sweeps `cross_section` along the result.
#[allow(clippy::too_many_arguments)]
pub fn create_stream_primitive(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    seed: MeshLocation,
    fields: StreamFields,
    settings: &TraceSettings,
    cross_section: CrossSection,
    width: f64,
) -> TraceResult<Option<StreamPrimitive>> {
    if width < 0.0 || !width.is_finite() {
        return Err(TraceError::InvalidArgument(format!(
            "width must be finite and non-negative, got {width}"
        )));
    }
    let streamline = trace_streamline(evaluator, topology, seed, fields, settings)?;
    Ok(streamline.and_then(|streamline| build_primitive(&streamline, cross_section, width)))
}
