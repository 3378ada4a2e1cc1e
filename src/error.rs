//! The error type shared across mesh, functional and optimizer operations.

use crate::{ElementId, Grade};

/// Errors surfaced by the optimization core.
///
/// Integrand failures are hot-path and always reported through `Result`
/// rather than panics; the evaluator aborts the current map operation and
/// leaves the mesh in its original state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MorphoError {
    /// Operand shapes are incompatible: mismatched matrix dimensions,
    /// fields with different per-grade layouts passed to `op`, or an
    /// element with the wrong number of vertices for a functional.
    #[error("incompatible shapes in {0}")]
    ShapeMismatch(&'static str),

    /// A functional requested connectivity for a grade the mesh does not carry.
    #[error("mesh carries no elements of grade {0}")]
    MissingGrade(Grade),

    /// LU/QR detected a singular system, e.g. in constraint reprojection
    /// or a degenerate reference element in elasticity.
    #[error("singular linear system in {0}")]
    SingularSystem(&'static str),

    /// An integrand is undefined on degenerate geometry
    /// (a norm below machine epsilon).
    #[error("degenerate element {id} of grade {grade}")]
    DegenerateElement { grade: Grade, id: ElementId },

    /// A user-supplied function returned a non-finite value
    /// or a result of the wrong shape.
    #[error("user function returned an invalid value")]
    BadUserFunction,

    /// The line search could not find a descending bracket.
    /// Non-fatal: the caller exits its outer loop with the current state.
    #[error("line search failed to bracket a minimum after {0} expansions")]
    BracketingFailed(usize),

    /// The refiner does not support this grade of element.
    #[error("refinement is not supported for meshes of grade {0}")]
    UnsupportedRefinement(Grade),
}
