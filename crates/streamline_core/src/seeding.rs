use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TraceResult;
use crate::geometry::{create_stream_primitive, CrossSection, StreamPrimitive};
use crate::streamline::{StreamFields, TraceSettings};
use crate::traits::{FieldEvaluator, MeshTopology};
use crate::types::{CellFilter, CellId, MeshLocation, Xi};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeedingSettings {
    /// Starting xi inside every seeded cell.
    pub seed_xi: Xi,
    pub trace: TraceSettings,
    pub cross_section: CrossSection,
    pub width: f64,
    /// Also seed from top-level 2-D cells.
    pub include_surfaces: bool,
}

impl Default for SeedingSettings {
    fn default() -> Self {
        Self {
            seed_xi: Xi::new(0.5, 0.5, 0.5),
            trace: TraceSettings::default(),
            cross_section: CrossSection::Line,
            width: 1.0,
            include_surfaces: false,
        }
    }
}

fn seeds_from(
    topology: &dyn MeshTopology,
    cell: CellId,
    include_surfaces: bool,
    filter: Option<CellFilter<'_>>,
) -> bool {
    let dimension = topology.dimension(cell);
    let seeded = dimension == 3 || (dimension == 2 && include_surfaces);
    seeded && topology.is_top_level(cell) && filter.map_or(true, |accept| accept(cell))
}

/// Traces one streamline from each eligible cell in `cells`.
///
/// Cells that are not top-level, or whose dimension is not seeded, are
/// skipped. Seeds that record no samples produce no primitive. The first
/// failing trace aborts the whole batch.
pub fn trace_from_cells<I>(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    cells: I,
    fields: StreamFields,
    settings: &SeedingSettings,
) -> TraceResult<Vec<StreamPrimitive>>
where
    I: IntoIterator<Item = CellId>,
{
    let mut primitives = Vec::new();
    let mut skipped = 0usize;
    for cell in cells {
        if !seeds_from(topology, cell, settings.include_surfaces, None) {
            skipped += 1;
            continue;
        }
        let mut xi = settings.seed_xi;
        for axis in topology.dimension(cell)..3 {
            xi[axis] = 0.0;
        }
        let primitive = create_stream_primitive(
            evaluator,
            topology,
            MeshLocation::new(cell, xi),
            fields,
            &settings.trace,
            settings.cross_section,
            settings.width,
        )?;
        primitives.extend(primitive);
    }
    debug!(primitives = primitives.len(), skipped, "seeded streamlines from cells");
    Ok(primitives)
}

/// Traces from stored seed locations, such as mesh locations kept at nodes.
///
/// Each location keeps its own xi; `settings.seed_xi` is not used. Locations
/// in cells rejected by `filter`, or in cells [`trace_from_cells`] would skip,
/// produce nothing.
pub fn trace_from_locations<I>(
    evaluator: &mut dyn FieldEvaluator,
    topology: &dyn MeshTopology,
    locations: I,
    fields: StreamFields,
    settings: &SeedingSettings,
    filter: Option<CellFilter<'_>>,
) -> TraceResult<Vec<StreamPrimitive>>
where
    I: IntoIterator<Item = MeshLocation>,
{
    let mut primitives = Vec::new();
    let mut skipped = 0usize;
    for location in locations {
        if !seeds_from(topology, location.cell, settings.include_surfaces, filter) {
            skipped += 1;
            continue;
        }
        let primitive = create_stream_primitive(
            evaluator,
            topology,
            location,
            fields,
            &settings.trace,
            settings.cross_section,
            settings.width,
        )?;
        primitives.extend(primitive);
    }
    debug!(primitives = primitives.len(), skipped, "seeded streamlines from locations");
    Ok(primitives)
}
