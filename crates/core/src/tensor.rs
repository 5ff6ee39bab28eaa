use serde::{Deserialize, Serialize};

use crate::error::NumericError;

/// Dimensions of a 2-D matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub const SCALAR: Shape = Shape { rows: 1, cols: 1 };

    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of elements, saturating at `usize::MAX` for shapes no
    /// buffer could hold.
    pub fn len(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    /// Number of elements, `None` if it overflows `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn transposed(&self) -> Shape {
        Shape::new(self.cols, self.rows)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.rows, self.cols)
    }
}

/// Dense row-major `f64` matrix, the value type flowing along graph edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Shape,
    data: Vec<f64>,
}

/// Unchecked wire form; converted through [`Tensor::new`] so a decoded
/// tensor can never disagree with its own shape.
#[derive(Deserialize)]
struct RawTensor {
    shape: Shape,
    data: Vec<f64>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = NumericError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        Tensor::new(raw.shape, raw.data)
    }
}

impl Tensor {
    pub fn new(shape: Shape, data: Vec<f64>) -> Result<Self, NumericError> {
        let expected = shape
            .checked_len()
            .ok_or(NumericError::ShapeOverflow { shape })?;
        if data.len() != expected {
            return Err(NumericError::ElementCount {
                shape,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: Shape, value: f64) -> Self {
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Shape::SCALAR,
            data: vec![value],
        }
    }

    /// Build a matrix from row slices. All rows must have the same length.
    pub fn from_rows(rows: &[&[f64]]) -> Result<Self, NumericError> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let data: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::new(Shape::new(rows.len(), cols), data)
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    pub fn cols(&self) -> usize {
        self.shape.cols
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.shape.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        let start = row * self.shape.cols;
        &self.data[start..start + self.shape.cols]
    }

    /// Apply `f` element-wise.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Tensor {
            shape: self.shape,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn transpose(&self) -> Tensor {
        let Shape { rows, cols } = self.shape;
        let mut data = Vec::with_capacity(self.data.len());
        for c in 0..cols {
            for r in 0..rows {
                data.push(self.data[r * cols + c]);
            }
        }
        Tensor {
            shape: self.shape.transposed(),
            data,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Raw payload size in bytes, used to pick between inline and bulk transfer.
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }

    /// Element-wise comparison with an absolute tolerance.
    pub fn approx_eq(&self, other: &Tensor, tol: f64) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}
