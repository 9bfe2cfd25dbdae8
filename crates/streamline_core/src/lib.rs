//! The `streamline_core` crate traces streamlines through vector fields defined
//! on finite element meshes and turns them into renderable geometry.
//!
//! Key components:
//! - **Traits**: `FieldEvaluator` (field values and xi-derivatives) and `MeshTopology` (cells, faces, neighbours).
//! - **Integrator**: adaptive improved Euler stepping in xi space, changing cells at faces.
//! - **Streamline**: the tracker that records points, vectors, ribbon normals and scalar data.
//! - **Geometry**: polylines, ribbons and extruded tubes swept along a streamline.
//! - **Particles / Seeding / Interactive**: flow particles, per-cell seeding and dragged seed points.
//! - **Grid**: a uniform structured mesh with analytic fields, used as a reference implementation.
pub mod error;
pub mod frame;
pub mod geometry;
pub mod grid;
pub mod integrator;
pub mod interactive;
pub mod local_direction;
pub mod particles;
pub mod seeding;
pub mod shape;
pub mod streamline;
pub mod traits;
pub mod types;
