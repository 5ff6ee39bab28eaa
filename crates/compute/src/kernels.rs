//! Reference numeric kernels for the op set.
//!
//! Matrix products go through faer; everything else is a straight loop
//! over row-major `f64` data.

use exgraf_core::{NumericError, OpKind, Shape, Tensor};
use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};

/// Lower bound applied to predictions before taking their log.
const LOG_EPSILON: f64 = 1e-12;

/// Linear-algebra backend: `apply(op, inputs) -> value`.
///
/// Implementations must be callable from any pool thread.
pub trait Kernels: Send + Sync {
    fn apply(&self, op: &OpKind, inputs: &[&Tensor]) -> Result<Tensor, NumericError>;
}

/// CPU implementation of every [`OpKind`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuKernels;

impl Kernels for CpuKernels {
    fn apply(&self, op: &OpKind, inputs: &[&Tensor]) -> Result<Tensor, NumericError> {
        let shapes: Vec<Shape> = inputs.iter().map(|t| t.shape()).collect();
        let out_shape = op.infer_shape(&shapes)?;

        let out = match op {
            OpKind::Placeholder { .. } => {
                return Err(NumericError::NotComputable { op: op.name() })
            }
            OpKind::Constant { value } => value.clone(),
            OpKind::Add => broadcast_zip(inputs[0], inputs[1], out_shape, |a, b| a + b)?,
            OpKind::Hadamard => broadcast_zip(inputs[0], inputs[1], out_shape, |a, b| a * b)?,
            OpKind::MatMul => matrix_product(inputs[0], inputs[1])?,
            OpKind::Relu => inputs[0].map(|x| x.max(0.0)),
            OpKind::Neg => inputs[0].map(|x| -x),
            OpKind::Log => inputs[0].map(f64::ln),
            OpKind::Softmax => softmax_rows(inputs[0])?,
            OpKind::Sum { axis } => sum(inputs[0], *axis, out_shape)?,
            OpKind::CrossEntropy => cross_entropy(inputs[0], inputs[1])?,
        };

        if !out.is_finite() {
            return Err(NumericError::NonFinite { op: op.name() });
        }
        Ok(out)
    }
}

fn faer_parallelism() -> Par {
    let par = faer::get_global_parallelism();
    if par.degree() == 1 {
        Par::Seq
    } else {
        par
    }
}

/// Element-wise combine with row/column vector stretching. Shapes were
/// already checked by `infer_shape`.
fn broadcast_zip(
    lhs: &Tensor,
    rhs: &Tensor,
    out_shape: Shape,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, NumericError> {
    let at = |t: &Tensor, r: usize, c: usize| {
        let r = if t.rows() == 1 { 0 } else { r };
        let c = if t.cols() == 1 { 0 } else { c };
        t.get(r, c)
    };
    let mut data = Vec::with_capacity(out_shape.len());
    for r in 0..out_shape.rows {
        for c in 0..out_shape.cols {
            data.push(f(at(lhs, r, c), at(rhs, r, c)));
        }
    }
    Tensor::new(out_shape, data)
}

fn matrix_product(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, NumericError> {
    let (m, k, n) = (lhs.rows(), lhs.cols(), rhs.cols());
    let mut row_major = vec![0.0f64; m * n];
    if m > 0 && n > 0 && k > 0 {
        let lhs_view = MatRef::from_row_major_slice(lhs.data(), m, k);
        let rhs_view = MatRef::from_row_major_slice(rhs.data(), k, n);
        // C^T = B^T * A^T into a column-major (n x m) view, which is C in
        // row-major layout.
        let a_t = lhs_view.transpose();
        let b_t = rhs_view.transpose();
        let mut out_view = MatMut::from_column_major_slice_mut(row_major.as_mut_slice(), n, m);
        matmul(&mut out_view, Accum::Replace, b_t, a_t, 1.0f64, faer_parallelism());
    }
    Tensor::new(Shape::new(m, n), row_major)
}

/// Row-wise softmax, max-subtracted.
fn softmax_rows(input: &Tensor) -> Result<Tensor, NumericError> {
    let mut data = Vec::with_capacity(input.shape().len());
    for r in 0..input.rows() {
        let row = input.row(r);
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let start = data.len();
        let mut total = 0.0;
        for &x in row {
            let e = (x - max).exp();
            total += e;
            data.push(e);
        }
        for v in &mut data[start..] {
            *v /= total;
        }
    }
    Tensor::new(input.shape(), data)
}

fn sum(input: &Tensor, axis: Option<usize>, out_shape: Shape) -> Result<Tensor, NumericError> {
    let data = match axis {
        None => vec![input.data().iter().sum()],
        Some(0) => (0..input.cols())
            .map(|c| (0..input.rows()).map(|r| input.get(r, c)).sum())
            .collect(),
        Some(1) => (0..input.rows()).map(|r| input.row(r).iter().sum()).collect(),
        Some(other) => return Err(NumericError::InvalidAxis(other)),
    };
    Tensor::new(out_shape, data)
}

/// `-sum(target * ln(prediction))`, the target transposed when its shape
/// only matches that way.
fn cross_entropy(prediction: &Tensor, target: &Tensor) -> Result<Tensor, NumericError> {
    let transposed;
    let target = if target.shape() == prediction.shape() {
        target
    } else {
        transposed = target.transpose();
        &transposed
    };
    let loss: f64 = prediction
        .data()
        .iter()
        .zip(target.data())
        .map(|(&p, &t)| t * p.max(LOG_EPSILON).ln())
        .sum();
    Ok(Tensor::scalar(-loss))
}
