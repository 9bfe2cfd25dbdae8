use crate::types::{
    BoundaryClip, CellCrossing, CellId, FaceCrossing, FaceId, FieldId, FieldValues, MeshLocation,
    Xi,
};

/// Evaluates fields defined piecewise over mesh cells.
///
/// Implementations may cache evaluations internally; the engine calls
/// `clear_cache` once it has finished with a field.
pub trait FieldEvaluator {
    /// Number of components of the field.
    fn component_count(&self, field: FieldId) -> usize;

    /// Evaluates `field` at `location`.
    /// When `with_derivative` is true the xi-derivatives should be returned
    /// as well, if the field can provide them.
    fn evaluate(
        &mut self,
        field: FieldId,
        location: MeshLocation,
        time: f64,
        with_derivative: bool,
    ) -> anyhow::Result<FieldValues>;

    fn clear_cache(&mut self, field: FieldId);
}

/// Read-only access to mesh topology.
pub trait MeshTopology {
    /// Parametric dimension of the cell.
    fn dimension(&self, cell: CellId) -> usize;

    /// False for cells that are faces or lines of another cell.
    fn is_top_level(&self, cell: CellId) -> bool;

    /// Advances `xi` by `increment`, stopping at the cell boundary.
    fn boundary_clip(&self, cell: CellId, xi: &Xi, increment: &Xi) -> BoundaryClip;

    /// Number of orientations worth trying when crossing `face`.
    fn crossing_permutations(&self, _cell: CellId, _face: FaceId) -> usize {
        1
    }

    /// Neighbour across the face, or `None` at the mesh (or region) boundary.
    fn cross_face(&self, request: &FaceCrossing<'_>) -> Option<CellCrossing>;
}
