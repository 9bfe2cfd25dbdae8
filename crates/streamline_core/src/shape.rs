use crate::traits::MeshTopology;
use crate::types::{BoundaryClip, CellFilter, CellId, FaceCrossing, FaceId, Xi};

/// Upper bound on cells visited by a single [`walk_increment`].
const MAX_WALK_CROSSINGS: usize = 1000;

/// Face of a line, square or cube cell: `2 * axis` for `xi[axis] = 0`,
/// `2 * axis + 1` for `xi[axis] = 1`.
pub fn cube_face(axis: usize, upper: bool) -> FaceId {
    FaceId((2 * axis + usize::from(upper)) as u32)
}

/// Inverse of [`cube_face`].
pub fn cube_face_axis(face: FaceId) -> (usize, bool) {
    let index = face.0 as usize;
    (index / 2, index % 2 == 1)
}

/// Boundary clip for cells whose parametric domain is the unit line,
/// square or cube.
pub fn clip_unit_cube(dimension: usize, xi: &Xi, increment: &Xi) -> BoundaryClip {
    let mut fraction = 1.0;
    let mut hit: Option<(usize, bool)> = None;
    for axis in 0..dimension {
        let step = increment[axis];
        if step > 0.0 {
            let allowed = ((1.0 - xi[axis]) / step).max(0.0);
            if allowed < fraction {
                fraction = allowed;
                hit = Some((axis, true));
            }
        } else if step < 0.0 {
            let allowed = (xi[axis] / -step).max(0.0);
            if allowed < fraction {
                fraction = allowed;
                hit = Some((axis, false));
            }
        }
    }

    let mut reached = Xi::zeros();
    for axis in 0..dimension {
        reached[axis] = (xi[axis] + fraction * increment[axis]).clamp(0.0, 1.0);
    }
    match hit {
        Some((axis, upper)) => {
            reached[axis] = if upper { 1.0 } else { 0.0 };
            let mut face_xi = Xi::zeros();
            let mut slot = 0;
            for other in (0..dimension).filter(|&other| other != axis) {
                face_xi[slot] = reached[other];
                slot += 1;
            }
            BoundaryClip {
                xi: reached,
                fraction,
                face: Some(cube_face(axis, upper)),
                face_xi,
            }
        }
        None => BoundaryClip::interior(reached),
    }
}

/// Moves `xi` by `increment`, continuing into neighbouring cells whenever a
/// face is reached. Stops on the boundary when there is no neighbour.
pub fn walk_increment(
    topology: &(impl MeshTopology + ?Sized),
    cell: CellId,
    xi: &Xi,
    increment: &Xi,
    region: Option<CellFilter<'_>>,
) -> (CellId, Xi) {
    let mut cell = cell;
    let mut xi = *xi;
    let mut remaining = *increment;
    for _ in 0..MAX_WALK_CROSSINGS {
        let clip = topology.boundary_clip(cell, &xi, &remaining);
        xi = clip.xi;
        let Some(face) = clip.face else {
            break;
        };
        if clip.fraction >= 1.0 {
            break;
        }
        remaining *= 1.0 - clip.fraction;
        let request = FaceCrossing {
            cell,
            face,
            xi,
            face_xi: clip.face_xi,
            increment: Some(remaining),
            permutation: 0,
            region,
        };
        match topology.cross_face(&request) {
            Some(crossing) => {
                cell = crossing.cell;
                xi = crossing.xi;
                remaining = crossing.increment.unwrap_or(remaining);
            }
            None => break,
        }
    }
    (cell, xi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::UniformGrid;
    use approx::assert_relative_eq;

    #[test]
    fn clip_inside_takes_full_step() {
        let clip = clip_unit_cube(3, &Xi::new(0.5, 0.5, 0.5), &Xi::new(0.1, -0.2, 0.3));
        assert_eq!(clip.face, None);
        assert_eq!(clip.fraction, 1.0);
        assert_relative_eq!(clip.xi[2], 0.8, epsilon = 1e-12);
    }

    #[test]
    fn clip_stops_on_nearest_face() {
        let clip = clip_unit_cube(3, &Xi::new(0.8, 0.5, 0.5), &Xi::new(0.4, 0.1, 0.0));
        assert_eq!(clip.face, Some(cube_face(0, true)));
        assert_relative_eq!(clip.fraction, 0.5, epsilon = 1e-12);
        assert_eq!(clip.xi[0], 1.0);
        assert_relative_eq!(clip.xi[1], 0.55, epsilon = 1e-12);
        assert_relative_eq!(clip.face_xi[0], 0.55, epsilon = 1e-12);
        assert_relative_eq!(clip.face_xi[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn clip_on_face_moving_outward_has_zero_fraction() {
        let clip = clip_unit_cube(2, &Xi::new(0.0, 0.3, 0.0), &Xi::new(-0.1, 0.0, 0.0));
        assert_eq!(clip.face, Some(cube_face(0, false)));
        assert_eq!(clip.fraction, 0.0);
        assert_eq!(clip.xi[0], 0.0);
    }

    #[test]
    fn face_numbering_round_trips() {
        for axis in 0..3 {
            for upper in [false, true] {
                assert_eq!(cube_face_axis(cube_face(axis, upper)), (axis, upper));
            }
        }
    }

    #[test]
    fn walk_increment_crosses_into_neighbour() {
        let grid = UniformGrid::cube([3, 1, 1], 1.0);
        let start = grid.cell_at([0, 0, 0]).expect("cell exists");
        let (cell, xi) =
            walk_increment(&grid, start, &Xi::new(0.5, 0.5, 0.5), &Xi::new(1.2, 0.0, 0.0), None);
        assert_eq!(cell, grid.cell_at([1, 0, 0]).expect("cell exists"));
        assert_relative_eq!(xi[0], 0.7, epsilon = 1e-12);
        assert_relative_eq!(xi[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn walk_increment_stops_at_mesh_boundary() {
        let grid = UniformGrid::cube([2, 1, 1], 1.0);
        let start = grid.cell_at([1, 0, 0]).expect("cell exists");
        let (cell, xi) =
            walk_increment(&grid, start, &Xi::new(0.5, 0.5, 0.5), &Xi::new(2.0, 0.0, 0.0), None);
        assert_eq!(cell, start);
        assert_eq!(xi[0], 1.0);
    }
}
