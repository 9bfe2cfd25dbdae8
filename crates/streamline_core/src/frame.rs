//! Ribbon frames attached to streamline samples.
//!
//! Fields carrying a single 3-vector on 3-D cells get a rotation-minimizing
//! frame transported along the curve and twisted by the local curl. The
//! remaining field shapes read or derive the frame directly from the sample.

use nalgebra::{DMatrix, Matrix3, Vector3};
use tracing::warn;

use crate::types::FieldValues;

/// Orthonormal pair perpendicular to the stream vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RibbonFrame {
    /// Direction across the ribbon.
    pub lateral: Vector3<f64>,
    /// Normal to the ribbon surface.
    pub normal: Vector3<f64>,
}

/// How the frame is obtained for a given cell dimension and stream field shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRule {
    /// 2-D cell, 2-component vector: the ribbon lies in the xy-plane.
    Planar,
    /// 2-D cell embedded in 3-D: the ribbon normal is the surface normal.
    Sheet,
    /// 3-D cell, 3-component vector: rotation-minimizing transport.
    Transported,
    /// 6 components: the lateral direction is supplied.
    Lateral,
    /// 9 components: lateral direction and ribbon normal are supplied.
    Explicit,
}

impl FrameRule {
    pub fn select(dimension: usize, components: usize) -> Option<Self> {
        match (dimension, components) {
            (2, 2) => Some(Self::Planar),
            (2, 3) => Some(Self::Sheet),
            (3, 3) => Some(Self::Transported),
            (3, 6) => Some(Self::Lateral),
            (3, 9) => Some(Self::Explicit),
            _ => None,
        }
    }
}

/// Inputs for one frame evaluation.
pub struct FrameSample<'a> {
    /// Stream vector, already negated for reverse traces.
    pub vector: Vector3<f64>,
    /// Raw stream field sample, derivatives included when requested.
    pub stream: &'a FieldValues,
    pub coordinate_jacobian: &'a DMatrix<f64>,
    pub position: Vector3<f64>,
    pub arc_length: f64,
}

#[derive(Debug, Clone, Copy)]
struct Transport {
    curl: f64,
    position: Vector3<f64>,
    arc_length: f64,
    frame: RibbonFrame,
}

/// Carries what the frame of the next sample depends on.
#[derive(Debug, Clone)]
pub struct FrameTracker {
    rule: FrameRule,
    reverse: bool,
    curl_enabled: bool,
    previous: Option<Transport>,
}

impl FrameTracker {
    pub fn new(rule: FrameRule, reverse: bool) -> Self {
        Self {
            rule,
            reverse,
            curl_enabled: true,
            previous: None,
        }
    }

    /// Whether stream field derivatives should be requested for the next sample.
    pub fn needs_stream_derivatives(&self) -> bool {
        self.rule == FrameRule::Transported && self.curl_enabled
    }

    pub fn frame(&mut self, sample: &FrameSample<'_>) -> RibbonFrame {
        let vector = sample.vector;
        match self.rule {
            FrameRule::Planar => {
                let normal = Vector3::z();
                RibbonFrame {
                    lateral: unit_or_zero(vector.cross(&normal)),
                    normal,
                }
            }
            FrameRule::Sheet => {
                let jacobian = sample.coordinate_jacobian;
                let normal = if jacobian.nrows() == 3 && jacobian.ncols() == 2 {
                    let first = Vector3::new(jacobian[(0, 0)], jacobian[(1, 0)], jacobian[(2, 0)]);
                    let second = Vector3::new(jacobian[(0, 1)], jacobian[(1, 1)], jacobian[(2, 1)]);
                    unit_or_zero(first.cross(&second))
                } else {
                    Vector3::z()
                };
                RibbonFrame {
                    lateral: unit_or_zero(vector.cross(&normal)),
                    normal,
                }
            }
            FrameRule::Lateral => {
                let lateral = self.signed(sample.stream.triple_at(3));
                RibbonFrame {
                    lateral,
                    normal: unit_or_zero(vector.cross(&lateral)),
                }
            }
            FrameRule::Explicit => RibbonFrame {
                lateral: self.signed(sample.stream.triple_at(3)),
                normal: sample.stream.triple_at(6),
            },
            FrameRule::Transported => self.transport(sample),
        }
    }

    fn signed(&self, direction: Vector3<f64>) -> Vector3<f64> {
        if self.reverse {
            -direction
        } else {
            direction
        }
    }

    fn transport(&mut self, sample: &FrameSample<'_>) -> RibbonFrame {
        let vector = sample.vector;
        let curl = self.curl_along(sample);

        let (seed, angle) = match self.previous {
            None => (least_aligned_axis(&vector), 0.0),
            Some(previous) => {
                let travelled = sample.arc_length - previous.arc_length;
                let mut angle = 0.5 * (previous.curl + curl) * travelled;
                if self.reverse {
                    angle = -angle;
                }
                let displacement = sample.position - previous.position;
                let mut seed = displacement.cross(&previous.frame.lateral);
                if seed.norm_squared() <= 0.0 {
                    seed = vector.cross(&previous.frame.lateral);
                }
                if seed.norm_squared() <= 0.0 {
                    seed = previous.frame.normal;
                }
                (seed, angle)
            }
        };

        let lateral = unit_or_zero(seed.cross(&vector));
        let normal = unit_or_zero(vector.cross(&lateral));
        let (sin, cos) = angle.sin_cos();
        let frame = RibbonFrame {
            lateral: lateral * cos + normal * sin,
            normal: normal * cos - lateral * sin,
        };
        self.previous = Some(Transport {
            curl,
            position: sample.position,
            arc_length: sample.arc_length,
            frame,
        });
        frame
    }

    /// Component of the curl along the stream direction.
    fn curl_along(&mut self, sample: &FrameSample<'_>) -> f64 {
        if !self.curl_enabled {
            return 0.0;
        }
        let Some(dv_dxi) = sample.stream.derivatives.as_ref() else {
            warn!("stream vector derivatives are unavailable, continuing without curl twist");
            self.curl_enabled = false;
            return 0.0;
        };
        let magnitude = sample.vector.norm();
        if magnitude <= 0.0 {
            return 0.0;
        }
        match curl(dv_dxi, sample.coordinate_jacobian) {
            Some(curl) => curl.dot(&sample.vector) / magnitude,
            None => 0.0,
        }
    }
}

/// Curl of a vector field from its xi-derivatives and the coordinate
/// Jacobian of a 3-D cell. `None` when the Jacobian cannot be inverted.
pub fn curl(dv_dxi: &DMatrix<f64>, dx_dxi: &DMatrix<f64>) -> Option<Vector3<f64>> {
    if dv_dxi.nrows() < 3 || dv_dxi.ncols() != 3 || dx_dxi.shape() != (3, 3) {
        return None;
    }
    let dv_dxi = Matrix3::from_fn(|row, col| dv_dxi[(row, col)]);
    let dx_dxi = Matrix3::from_fn(|row, col| dx_dxi[(row, col)]);
    let dv_dx = dv_dxi * dx_dxi.try_inverse()?;
    Some(Vector3::new(
        dv_dx[(2, 1)] - dv_dx[(1, 2)],
        dv_dx[(0, 2)] - dv_dx[(2, 0)],
        dv_dx[(1, 0)] - dv_dx[(0, 1)],
    ))
}

/// Coordinate axis on which `vector` has its smallest component.
fn least_aligned_axis(vector: &Vector3<f64>) -> Vector3<f64> {
    let (x, y, z) = (vector.x.abs(), vector.y.abs(), vector.z.abs());
    if x < y {
        if z < x {
            Vector3::z()
        } else {
            Vector3::x()
        }
    } else if z < y {
        Vector3::z()
    } else {
        Vector3::y()
    }
}

pub(crate) fn unit_or_zero(vector: Vector3<f64>) -> Vector3<f64> {
    let magnitude = vector.norm();
    if magnitude > 0.0 {
        vector / magnitude
    } else {
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_orthonormal(frame: &RibbonFrame, vector: &Vector3<f64>) {
        let direction = vector.normalize();
        assert_relative_eq!(frame.lateral.norm(), 1.0, epsilon = 1e-10);
        assert_relative_eq!(frame.normal.norm(), 1.0, epsilon = 1e-10);
        assert_relative_eq!(frame.lateral.dot(&frame.normal), 0.0, epsilon = 1e-10);
        assert_relative_eq!(frame.lateral.dot(&direction), 0.0, epsilon = 1e-10);
        assert_relative_eq!(frame.normal.dot(&direction), 0.0, epsilon = 1e-10);
    }

    fn sample<'a>(
        vector: Vector3<f64>,
        stream: &'a FieldValues,
        jacobian: &'a DMatrix<f64>,
        position: Vector3<f64>,
        arc_length: f64,
    ) -> FrameSample<'a> {
        FrameSample {
            vector,
            stream,
            coordinate_jacobian: jacobian,
            position,
            arc_length,
        }
    }

    #[test]
    fn rule_selection_matches_shapes() {
        assert_eq!(FrameRule::select(2, 2), Some(FrameRule::Planar));
        assert_eq!(FrameRule::select(2, 3), Some(FrameRule::Sheet));
        assert_eq!(FrameRule::select(3, 3), Some(FrameRule::Transported));
        assert_eq!(FrameRule::select(3, 6), Some(FrameRule::Lateral));
        assert_eq!(FrameRule::select(3, 9), Some(FrameRule::Explicit));
        assert_eq!(FrameRule::select(2, 6), None);
        assert_eq!(FrameRule::select(3, 2), None);
    }

    #[test]
    fn curl_of_rigid_rotation() {
        // v = (-y, x, 0) on a cell with dx/dxi = 2 I.
        let dx_dxi = DMatrix::from_diagonal_element(3, 3, 2.0);
        let dv_dxi = DMatrix::from_row_slice(3, 3, &[0.0, -2.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let curl = curl(&dv_dxi, &dx_dxi).expect("invertible Jacobian");
        assert_relative_eq!(curl, Vector3::new(0.0, 0.0, 2.0), epsilon = 1e-12);
        assert!(super::curl(&dv_dxi, &DMatrix::zeros(3, 3)).is_none());
    }

    #[test]
    fn first_transported_frame_uses_least_aligned_axis() {
        let vector = Vector3::new(1.0, 0.2, 0.5);
        let stream = FieldValues::new(vec![1.0, 0.2, 0.5]);
        let jacobian = DMatrix::identity(3, 3);
        let mut tracker = FrameTracker::new(FrameRule::Transported, false);
        let frame = tracker.frame(&sample(vector, &stream, &jacobian, Vector3::zeros(), 0.0));
        assert_orthonormal(&frame, &vector);
        // The seed axis is y, so the normal leans towards it.
        assert!(frame.normal.y > 0.9);
        // The missing derivatives switched the curl off.
        assert!(!tracker.needs_stream_derivatives());
    }

    #[test]
    fn transported_frame_stays_orthonormal_along_helix() {
        let jacobian = DMatrix::identity(3, 3);
        let mut tracker = FrameTracker::new(FrameRule::Transported, false);
        let mut previous_lateral: Option<Vector3<f64>> = None;
        for step in 0..40 {
            let t = step as f64 * 0.1;
            let position = Vector3::new(t.cos(), t.sin(), 0.3 * t);
            let vector = Vector3::new(-t.sin(), t.cos(), 0.3);
            let stream = FieldValues::with_derivatives(
                vector.iter().copied().collect(),
                DMatrix::zeros(3, 3),
            );
            let frame = tracker.frame(&sample(vector, &stream, &jacobian, position, t));
            assert_orthonormal(&frame, &vector);
            if let Some(previous) = previous_lateral {
                // Minimal twist: consecutive laterals stay close.
                assert!(frame.lateral.dot(&previous) > 0.9);
            }
            previous_lateral = Some(frame.lateral);
        }
        assert!(tracker.needs_stream_derivatives());
    }

    #[test]
    fn curl_twists_the_frame() {
        let jacobian = DMatrix::identity(3, 3);
        // Constant vorticity 1 about the stream direction z.
        let dv_dxi = DMatrix::from_row_slice(3, 3, &[0.0, -0.5, 0.0, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let vector = Vector3::z();
        let stream = FieldValues::with_derivatives(vec![0.0, 0.0, 1.0], dv_dxi);
        let mut tracker = FrameTracker::new(FrameRule::Transported, false);
        let first = tracker.frame(&sample(vector, &stream, &jacobian, Vector3::zeros(), 0.0));
        let second = tracker.frame(&sample(vector, &stream, &jacobian, Vector3::new(0.0, 0.0, 0.5), 0.5));
        // Angle = 0.5 * (1 + 1) * 0.5 = 0.5 radians.
        assert_relative_eq!(first.lateral.dot(&second.lateral), 0.5_f64.cos(), epsilon = 1e-10);
        assert_orthonormal(&second, &vector);

        let mut reversed = FrameTracker::new(FrameRule::Transported, true);
        let first_reversed = reversed.frame(&sample(vector, &stream, &jacobian, Vector3::zeros(), 0.0));
        let second_reversed =
            reversed.frame(&sample(vector, &stream, &jacobian, Vector3::new(0.0, 0.0, 0.5), 0.5));
        assert_relative_eq!(
            first_reversed.normal.dot(&second_reversed.lateral),
            -second.lateral.dot(&first.normal),
            epsilon = 1e-10
        );
    }

    #[test]
    fn six_component_field_supplies_lateral() {
        let vector = Vector3::x();
        let stream = FieldValues::new(vec![1.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let jacobian = DMatrix::identity(3, 3);
        let mut tracker = FrameTracker::new(FrameRule::Lateral, false);
        let frame = tracker.frame(&sample(vector, &stream, &jacobian, Vector3::zeros(), 0.0));
        assert_eq!(frame.lateral, Vector3::new(0.0, 2.0, 0.0));
        assert_relative_eq!(frame.normal, Vector3::z(), epsilon = 1e-12);

        let mut reversed = FrameTracker::new(FrameRule::Lateral, true);
        let frame = reversed.frame(&sample(-vector, &stream, &jacobian, Vector3::zeros(), 0.0));
        assert_eq!(frame.lateral, Vector3::new(0.0, -2.0, 0.0));
        assert_relative_eq!(frame.normal, Vector3::z(), epsilon = 1e-12);
    }

    #[test]
    fn nine_component_field_supplies_both() {
        let vector = Vector3::x();
        let stream = FieldValues::new(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        let jacobian = DMatrix::identity(3, 3);
        let mut tracker = FrameTracker::new(FrameRule::Explicit, false);
        let frame = tracker.frame(&sample(vector, &stream, &jacobian, Vector3::zeros(), 0.0));
        assert_eq!(frame.lateral, Vector3::y());
        assert_eq!(frame.normal, Vector3::z());
    }

    #[test]
    fn planar_and_sheet_frames() {
        let vector = Vector3::new(1.0, 0.0, 0.0);
        let stream = FieldValues::new(vec![1.0, 0.0]);
        let planar_jacobian = DMatrix::identity(2, 2);
        let mut planar = FrameTracker::new(FrameRule::Planar, false);
        let frame = planar.frame(&sample(vector, &stream, &planar_jacobian, Vector3::zeros(), 0.0));
        assert_eq!(frame.normal, Vector3::z());
        assert_relative_eq!(frame.lateral, Vector3::new(0.0, -1.0, 0.0), epsilon = 1e-12);

        // Sheet in the xz-plane: tangents x and z give normal -y.
        let sheet_jacobian = DMatrix::from_row_slice(3, 2, &[2.0, 0.0, 0.0, 0.0, 0.0, 3.0]);
        let mut sheet = FrameTracker::new(FrameRule::Sheet, false);
        let frame = sheet.frame(&sample(vector, &stream, &sheet_jacobian, Vector3::zeros(), 0.0));
        assert_relative_eq!(frame.normal, Vector3::new(0.0, -1.0, 0.0), epsilon = 1e-12);
        assert_orthonormal(&frame, &vector);
    }
}
