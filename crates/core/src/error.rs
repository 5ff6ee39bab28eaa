use thiserror::Error;

use crate::tensor::Shape;

/// Failure raised by a numeric kernel or by shape inference.
///
/// Kernel failures are assumed deterministic: the same inputs always
/// produce the same error, so nothing upstream retries them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericError {
    #[error("incompatible dimensions for {op}: {lhs} and {rhs}")]
    IncompatibleDimensions {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    #[error("shape {shape} has more elements than fit in memory")]
    ShapeOverflow { shape: Shape },

    #[error("element count {actual} does not match shape {shape}")]
    ElementCount { shape: Shape, actual: usize },

    #[error("{op} expects {expected} input(s), got {actual}")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{op} produced a non-finite value")]
    NonFinite { op: &'static str },

    #[error("{op} has no kernel")]
    NotComputable { op: &'static str },

    #[error("{op} received an empty matrix")]
    EmptyInput { op: &'static str },

    #[error("invalid sum axis {0}, expected 0 or 1")]
    InvalidAxis(usize),
}
