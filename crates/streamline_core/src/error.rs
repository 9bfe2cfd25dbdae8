//! Error types for streamline tracing.

use thiserror::Error;

use crate::types::{CellId, FieldId};

/// Failures that abort a step, a trace or a point update.
///
/// Normal ways for a trace to end (leaving the mesh, getting stuck, reaching
/// the requested length) are reported through
/// [`Termination`](crate::streamline::Termination) instead.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The local-to-world transform cannot be inverted at the sample point.
    #[error("Jacobian is singular")]
    SingularJacobian,

    /// More parametric dimensions than vector components; never approximated.
    #[error(
        "underdetermined system: element dimension {element_dimension} exceeds vector dimension {vector_dimension}"
    )]
    UnderdeterminedSystem {
        element_dimension: usize,
        vector_dimension: usize,
    },

    #[error("field {field:?} could not be evaluated on cell {cell:?}: {source}")]
    FieldUndefined {
        field: FieldId,
        cell: CellId,
        #[source]
        source: anyhow::Error,
    },

    /// The coordinate field did not return a Jacobian.
    #[error("field {field:?} did not provide derivatives")]
    MissingDerivatives { field: FieldId },

    #[error("field {field:?} returned {actual} components, expected {expected}")]
    ComponentMismatch {
        field: FieldId,
        expected: usize,
        actual: usize,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not enough memory for streamline")]
    OutOfMemory,
}

/// Result type for tracing operations.
pub type TraceResult<T> = std::result::Result<T, TraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TraceError::SingularJacobian;
        assert_eq!(format!("{err}"), "Jacobian is singular");

        let err = TraceError::UnderdeterminedSystem {
            element_dimension: 3,
            vector_dimension: 2,
        };
        let message = format!("{err}");
        assert!(message.contains("element dimension 3"));
        assert!(message.contains("vector dimension 2"));
    }

    #[test]
    fn field_undefined_keeps_source() {
        let err = TraceError::FieldUndefined {
            field: FieldId(4),
            cell: CellId(7),
            source: anyhow::anyhow!("no definition"),
        };
        let message = format!("{err}");
        assert!(message.contains("FieldId(4)"));
        assert!(message.contains("CellId(7)"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
