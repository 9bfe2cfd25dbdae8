//! Reference collaborators: a structured block of square or cube cells with
//! analytic fields defined in world coordinates.
//!
//! Useful for exercising the tracer without a full finite element library.

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, Vector3};
use std::collections::{HashMap, HashSet};

use crate::shape::{clip_unit_cube, cube_face_axis};
use crate::traits::{FieldEvaluator, MeshTopology};
use crate::types::{
    BoundaryClip, CellCrossing, CellId, FaceCrossing, FieldId, FieldValues, MeshLocation, Xi,
};

/// Xi offset used for central-difference derivatives of analytic fields.
const DERIVATIVE_XI_STEP: f64 = 1e-6;

/// A regular block of `counts[0] × counts[1] × counts[2]` cells.
/// Two-dimensional grids use `counts[2] == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformGrid {
    dimension: usize,
    counts: [usize; 3],
    spacing: Vector3<f64>,
    origin: Vector3<f64>,
}

impl UniformGrid {
    pub fn new(
        dimension: usize,
        counts: [usize; 3],
        spacing: Vector3<f64>,
        origin: Vector3<f64>,
    ) -> Result<Self> {
        if dimension != 2 && dimension != 3 {
            bail!("Grid dimension must be 2 or 3, got {}.", dimension);
        }
        if counts[..dimension].iter().any(|&count| count == 0) {
            bail!("Grid must have at least one cell along each axis.");
        }
        if dimension == 2 && counts[2] != 1 {
            bail!("Two-dimensional grids must have a single layer of cells.");
        }
        if spacing.iter().take(dimension).any(|&h| h <= 0.0 || h.is_nan()) {
            bail!("Grid spacing must be positive.");
        }
        Ok(Self {
            dimension,
            counts,
            spacing,
            origin,
        })
    }

    /// Cube cells of edge `spacing` with the origin at zero.
    pub fn cube(counts: [usize; 3], spacing: f64) -> Self {
        Self {
            dimension: 3,
            counts: counts.map(|count| count.max(1)),
            spacing: Vector3::repeat(spacing),
            origin: Vector3::zeros(),
        }
    }

    /// Square cells of edge `spacing` in the plane `z = 0`.
    pub fn square(counts: [usize; 2], spacing: f64) -> Self {
        Self {
            dimension: 2,
            counts: [counts[0].max(1), counts[1].max(1), 1],
            spacing: Vector3::repeat(spacing),
            origin: Vector3::zeros(),
        }
    }

    pub fn spatial_dimension(&self) -> usize {
        self.dimension
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    pub fn cell_count(&self) -> usize {
        self.counts.iter().product()
    }

    pub fn cell_at(&self, index: [usize; 3]) -> Option<CellId> {
        if (0..3).any(|axis| index[axis] >= self.counts[axis]) {
            return None;
        }
        let linear = index[0] + self.counts[0] * (index[1] + self.counts[1] * index[2]);
        Some(CellId(linear as u64))
    }

    pub fn cell_index(&self, cell: CellId) -> Option<[usize; 3]> {
        let linear = cell.0 as usize;
        if linear >= self.cell_count() {
            return None;
        }
        let i = linear % self.counts[0];
        let j = (linear / self.counts[0]) % self.counts[1];
        let k = linear / (self.counts[0] * self.counts[1]);
        Some([i, j, k])
    }

    pub fn cells(&self) -> impl DoubleEndedIterator<Item = CellId> {
        (0..self.cell_count() as u64).map(CellId)
    }

    pub fn world_position(&self, location: &MeshLocation) -> Option<Vector3<f64>> {
        let index = self.cell_index(location.cell)?;
        let mut position = self.origin;
        for axis in 0..self.dimension {
            position[axis] += (index[axis] as f64 + location.xi[axis]) * self.spacing[axis];
        }
        Some(position)
    }

    /// Cell and xi containing a world point, if it lies inside the grid.
    pub fn locate(&self, point: &Vector3<f64>) -> Option<MeshLocation> {
        let mut index = [0usize; 3];
        let mut xi = Xi::zeros();
        for axis in 0..self.dimension {
            let scaled = (point[axis] - self.origin[axis]) / self.spacing[axis];
            let count = self.counts[axis] as f64;
            if !(0.0..=count).contains(&scaled) {
                return None;
            }
            let cell = (scaled.floor() as usize).min(self.counts[axis] - 1);
            index[axis] = cell;
            xi[axis] = scaled - cell as f64;
        }
        Some(MeshLocation::new(self.cell_at(index)?, xi))
    }
}

impl MeshTopology for UniformGrid {
    fn dimension(&self, _cell: CellId) -> usize {
        self.dimension
    }

    fn is_top_level(&self, cell: CellId) -> bool {
        self.cell_index(cell).is_some()
    }

    fn boundary_clip(&self, _cell: CellId, xi: &Xi, increment: &Xi) -> BoundaryClip {
        clip_unit_cube(self.dimension, xi, increment)
    }

    fn cross_face(&self, request: &FaceCrossing<'_>) -> Option<CellCrossing> {
        if request.permutation != 0 {
            return None;
        }
        let mut index = self.cell_index(request.cell)?;
        let (axis, upper) = cube_face_axis(request.face);
        if axis >= self.dimension {
            return None;
        }
        if upper {
            index[axis] += 1;
        } else {
            index[axis] = index[axis].checked_sub(1)?;
        }
        let neighbour = self.cell_at(index)?;
        if let Some(region) = request.region {
            if !region(neighbour) {
                return None;
            }
        }
        let mut xi = request.xi;
        xi[axis] = if upper { 0.0 } else { 1.0 };
        Some(CellCrossing {
            cell: neighbour,
            xi,
            increment: request.increment,
        })
    }
}

/// Closure evaluating a field at a world position and time.
pub type FieldFunction = Box<dyn Fn(&Vector3<f64>, f64) -> Vec<f64>>;

enum GridField {
    Coordinates,
    Analytic {
        components: usize,
        function: FieldFunction,
        derivatives: bool,
        undefined_on: HashSet<CellId>,
    },
}

struct CachedEvaluation {
    location: MeshLocation,
    time: f64,
    result: FieldValues,
}

/// Field evaluator over a [`UniformGrid`]. Field 0 is always the coordinate field.
pub struct GridFields {
    grid: UniformGrid,
    coordinate_components: usize,
    fields: Vec<GridField>,
    cache: HashMap<FieldId, CachedEvaluation>,
}

impl GridFields {
    pub fn new(grid: UniformGrid) -> Self {
        let coordinate_components = grid.spatial_dimension();
        Self {
            grid,
            coordinate_components,
            fields: vec![GridField::Coordinates],
            cache: HashMap::new(),
        }
    }

    /// Reports coordinates with `components` entries, e.g. 3 for a planar
    /// grid embedded in 3-D space.
    pub fn with_coordinate_components(mut self, components: usize) -> Result<Self> {
        if components < self.grid.spatial_dimension() || components > 3 {
            bail!(
                "Coordinate components must be between {} and 3, got {}.",
                self.grid.spatial_dimension(),
                components
            );
        }
        self.coordinate_components = components;
        Ok(self)
    }

    pub fn grid(&self) -> &UniformGrid {
        &self.grid
    }

    pub fn coordinate_field(&self) -> FieldId {
        FieldId(0)
    }

    /// Registers an analytic field with derivatives by central differences.
    pub fn add_field(
        &mut self,
        components: usize,
        function: impl Fn(&Vector3<f64>, f64) -> Vec<f64> + 'static,
    ) -> FieldId {
        self.push_field(components, Box::new(function), true)
    }

    /// Registers an analytic field that refuses to provide derivatives.
    pub fn add_field_without_derivatives(
        &mut self,
        components: usize,
        function: impl Fn(&Vector3<f64>, f64) -> Vec<f64> + 'static,
    ) -> FieldId {
        self.push_field(components, Box::new(function), false)
    }

    /// Makes `field` fail to evaluate on `cell`.
    pub fn undefine_on(&mut self, field: FieldId, cell: CellId) -> Result<()> {
        match self.fields.get_mut(field.0 as usize) {
            Some(GridField::Analytic { undefined_on, .. }) => {
                undefined_on.insert(cell);
                Ok(())
            }
            Some(GridField::Coordinates) => bail!("The coordinate field is defined everywhere."),
            None => bail!("Unknown field {:?}.", field),
        }
    }

    /// Number of fields with a cached evaluation.
    pub fn cached_field_count(&self) -> usize {
        self.cache.len()
    }

    fn push_field(
        &mut self,
        components: usize,
        function: FieldFunction,
        derivatives: bool,
    ) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(GridField::Analytic {
            components,
            function,
            derivatives,
            undefined_on: HashSet::new(),
        });
        id
    }

    fn compute(
        &self,
        field: FieldId,
        location: MeshLocation,
        time: f64,
        with_derivative: bool,
    ) -> Result<FieldValues> {
        let definition = self
            .fields
            .get(field.0 as usize)
            .ok_or_else(|| anyhow!("Unknown field {:?}.", field))?;
        let position = self
            .grid
            .world_position(&location)
            .ok_or_else(|| anyhow!("Cell {:?} is not part of the grid.", location.cell))?;
        let dimension = self.grid.spatial_dimension();

        match definition {
            GridField::Coordinates => {
                let values = position.iter().take(self.coordinate_components).copied().collect();
                if !with_derivative {
                    return Ok(FieldValues::new(values));
                }
                let mut jacobian = DMatrix::zeros(self.coordinate_components, dimension);
                for axis in 0..dimension {
                    jacobian[(axis, axis)] = self.grid.spacing()[axis];
                }
                Ok(FieldValues::with_derivatives(values, jacobian))
            }
            GridField::Analytic {
                components,
                function,
                derivatives,
                undefined_on,
            } => {
                if undefined_on.contains(&location.cell) {
                    bail!("Field {:?} is not defined on cell {:?}.", field, location.cell);
                }
                let values = function(&position, time);
                if values.len() != *components {
                    bail!(
                        "Field {:?} produced {} values, expected {}.",
                        field,
                        values.len(),
                        components
                    );
                }
                if !(with_derivative && *derivatives) {
                    return Ok(FieldValues::new(values));
                }
                let mut derivative = DMatrix::zeros(*components, dimension);
                for axis in 0..dimension {
                    let mut offset = Vector3::zeros();
                    offset[axis] = DERIVATIVE_XI_STEP * self.grid.spacing()[axis];
                    let forward = function(&(position + offset), time);
                    let backward = function(&(position - offset), time);
                    for component in 0..*components {
                        derivative[(component, axis)] =
                            (forward[component] - backward[component]) / (2.0 * DERIVATIVE_XI_STEP);
                    }
                }
                Ok(FieldValues::with_derivatives(values, derivative))
            }
        }
    }
}

impl FieldEvaluator for GridFields {
    fn component_count(&self, field: FieldId) -> usize {
        match self.fields.get(field.0 as usize) {
            Some(GridField::Coordinates) => self.coordinate_components,
            Some(GridField::Analytic { components, .. }) => *components,
            None => 0,
        }
    }

    fn evaluate(
        &mut self,
        field: FieldId,
        location: MeshLocation,
        time: f64,
        with_derivative: bool,
    ) -> Result<FieldValues> {
        if let Some(cached) = self.cache.get(&field) {
            let has_derivatives = cached.result.derivatives.is_some();
            if cached.location == location
                && cached.time == time
                && (has_derivatives || !with_derivative)
            {
                return Ok(cached.result.clone());
            }
        }
        let result = self
            .compute(field, location, time, with_derivative)
            .with_context(|| format!("Failed to evaluate field {:?} at time {}.", field, time))?;
        self.cache.insert(
            field,
            CachedEvaluation {
                location,
                time,
                result: result.clone(),
            },
        );
        Ok(result)
    }

    fn clear_cache(&mut self, field: FieldId) {
        self.cache.remove(&field);
    }
}
