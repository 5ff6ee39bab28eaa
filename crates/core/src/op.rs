//! Operation kinds supported by the graph and their static shape rules.

use serde::{Deserialize, Serialize};

use crate::error::NumericError;
use crate::tensor::{Shape, Tensor};

/// What a node computes.
///
/// `Placeholder` and `Constant` are sources: they have no inputs and their
/// value is known before any kernel runs. Every other kind is evaluated by a
/// kernel over its input values, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Value bound per run through a named feed.
    Placeholder { name: String },
    /// Literal matrix baked into the graph.
    Constant { value: Tensor },
    /// Element-wise sum with row-vector and column-vector broadcasting.
    Add,
    /// Matrix product.
    MatMul,
    /// Element-wise product of equally shaped matrices.
    Hadamard,
    Relu,
    /// Row-wise softmax.
    Softmax,
    /// Natural logarithm.
    Log,
    Neg,
    /// Sum over axis 0 (columns), axis 1 (rows), or everything when `axis` is `None`.
    Sum {
        #[serde(default)]
        axis: Option<usize>,
    },
    /// `-sum(target * ln(prediction))`; inputs are `[prediction, target]`.
    CrossEntropy,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Placeholder { .. } => "placeholder",
            OpKind::Constant { .. } => "constant",
            OpKind::Add => "add",
            OpKind::MatMul => "matmul",
            OpKind::Hadamard => "hadamard",
            OpKind::Relu => "relu",
            OpKind::Softmax => "softmax",
            OpKind::Log => "log",
            OpKind::Neg => "neg",
            OpKind::Sum { .. } => "sum",
            OpKind::CrossEntropy => "cross_entropy",
        }
    }

    /// Number of inputs the operation consumes.
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Placeholder { .. } | OpKind::Constant { .. } => 0,
            OpKind::Relu | OpKind::Softmax | OpKind::Log | OpKind::Neg | OpKind::Sum { .. } => 1,
            OpKind::Add | OpKind::MatMul | OpKind::Hadamard | OpKind::CrossEntropy => 2,
        }
    }

    pub fn is_source(&self) -> bool {
        self.arity() == 0
    }

    /// Output shape for the given input shapes.
    ///
    /// Sources have no input-driven shape: `Constant` reports its literal's
    /// shape and `Placeholder` fails with `NotComputable`.
    pub fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape, NumericError> {
        let op = self.name();
        if inputs.len() != self.arity() {
            return Err(NumericError::Arity {
                op,
                expected: self.arity(),
                actual: inputs.len(),
            });
        }
        match self {
            OpKind::Placeholder { .. } => Err(NumericError::NotComputable { op }),
            OpKind::Constant { value } => Ok(value.shape()),
            OpKind::Relu | OpKind::Log | OpKind::Neg => Ok(inputs[0]),
            OpKind::Softmax => {
                if inputs[0].cols == 0 {
                    return Err(NumericError::EmptyInput { op });
                }
                Ok(inputs[0])
            }
            OpKind::Sum { axis } => match axis {
                None => Ok(Shape::SCALAR),
                Some(0) => Ok(Shape::new(1, inputs[0].cols)),
                Some(1) => Ok(Shape::new(inputs[0].rows, 1)),
                Some(other) => Err(NumericError::InvalidAxis(*other)),
            },
            OpKind::Add => broadcast_shape(inputs[0], inputs[1]).ok_or(
                NumericError::IncompatibleDimensions {
                    op,
                    lhs: inputs[0],
                    rhs: inputs[1],
                },
            ),
            OpKind::MatMul => {
                let (lhs, rhs) = (inputs[0], inputs[1]);
                if lhs.cols != rhs.rows {
                    return Err(NumericError::IncompatibleDimensions { op, lhs, rhs });
                }
                Ok(Shape::new(lhs.rows, rhs.cols))
            }
            OpKind::Hadamard => {
                let (lhs, rhs) = (inputs[0], inputs[1]);
                if lhs != rhs {
                    return Err(NumericError::IncompatibleDimensions { op, lhs, rhs });
                }
                Ok(lhs)
            }
            OpKind::CrossEntropy => {
                let (pred, target) = (inputs[0], inputs[1]);
                if target != pred && target.transposed() != pred {
                    return Err(NumericError::IncompatibleDimensions {
                        op,
                        lhs: pred,
                        rhs: target,
                    });
                }
                Ok(Shape::SCALAR)
            }
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Placeholder { name } => write!(f, "placeholder({name})"),
            OpKind::Constant { value } => write!(f, "constant{}", value.shape()),
            OpKind::Sum { axis: Some(axis) } => write!(f, "sum(axis={axis})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Result shape of `lhs + rhs` under row/column vector broadcasting.
///
/// `(1, N) + (M, N)` and `(M, 1) + (M, N)` stretch the vector across the
/// matrix (either side may be the vector); otherwise shapes must match.
pub fn broadcast_shape(lhs: Shape, rhs: Shape) -> Option<Shape> {
    if lhs == rhs {
        return Some(lhs);
    }
    let row_vector = |v: Shape, m: Shape| v.rows == 1 && v.cols == m.cols && m.rows > 1;
    let col_vector = |v: Shape, m: Shape| v.cols == 1 && v.rows == m.rows && m.cols > 1;
    if row_vector(lhs, rhs) || col_vector(lhs, rhs) {
        Some(rhs)
    } else if row_vector(rhs, lhs) || col_vector(rhs, lhs) {
        Some(lhs)
    } else {
        None
    }
}
