//! Fixed-capacity multi-dimensional value types.
//!
//! Every geometry type in this crate is bounded by [`MAX_DIMS`]. Dimension 0
//! is the innermost (x) dimension, 1 is y, 2 is z and the remaining ones are
//! batch-like outer dimensions.

use std::fmt;
use std::ops::Index;

/// Maximum number of dimensions a tensor or window can have.
pub const MAX_DIMS: usize = 6;

// ── Coordinates ──────────────────────────────────────────────────────────────

/// Signed per-dimension coordinates. Negative values address padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Coordinates {
    values: [i32; MAX_DIMS],
    num_dimensions: usize,
}

impl Coordinates {
    /// Build coordinates from the leading `values`.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_DIMS`] values are supplied.
    pub fn new(values: &[i32]) -> Self {
        assert!(values.len() <= MAX_DIMS, "at most {MAX_DIMS} coordinates are supported");
        let mut coords = Self::default();
        coords.values[..values.len()].copy_from_slice(values);
        coords.num_dimensions = values.len();
        coords
    }

    /// Set `dim` to `value`, growing the dimension count if needed.
    pub fn set(&mut self, dim: usize, value: i32) {
        self.values[dim] = value;
        self.num_dimensions = self.num_dimensions.max(dim + 1);
    }

    pub const fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.values[..self.num_dimensions]
    }
}

impl Index<usize> for Coordinates {
    type Output = i32;

    fn index(&self, dim: usize) -> &i32 {
        &self.values[dim]
    }
}

// ── TensorShape ──────────────────────────────────────────────────────────────

/// Logical tensor extent. Unset dimensions read as 1.
///
/// Trailing dimensions of size 1 are not counted by
/// [`num_dimensions`](Self::num_dimensions), so `(4, 3, 1)` is two-dimensional.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    values: [usize; MAX_DIMS],
    num_dimensions: usize,
}

impl Default for TensorShape {
    fn default() -> Self {
        Self { values: [1; MAX_DIMS], num_dimensions: 0 }
    }
}

impl TensorShape {
    /// # Panics
    ///
    /// Panics if more than [`MAX_DIMS`] extents are supplied.
    pub fn new(extents: &[usize]) -> Self {
        assert!(extents.len() <= MAX_DIMS, "at most {MAX_DIMS} dimensions are supported");
        let mut shape = Self::default();
        shape.values[..extents.len()].copy_from_slice(extents);
        shape.num_dimensions = extents.len();
        shape.apply_dimension_correction();
        shape
    }

    pub fn set(&mut self, dim: usize, extent: usize) {
        self.values[dim] = extent;
        self.num_dimensions = self.num_dimensions.max(dim + 1);
        self.apply_dimension_correction();
    }

    pub const fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    /// Product of all extents.
    pub fn total_size(&self) -> usize {
        self.values.iter().product()
    }

    /// Product of the extents from `dim` upwards.
    pub fn total_size_upper(&self, dim: usize) -> usize {
        self.values[dim..].iter().product()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.values[..self.num_dimensions]
    }

    fn apply_dimension_correction(&mut self) {
        while self.num_dimensions > 1 && self.values[self.num_dimensions - 1] == 1 {
            self.num_dimensions -= 1;
        }
    }
}

impl Index<usize> for TensorShape {
    type Output = usize;

    fn index(&self, dim: usize) -> &usize {
        &self.values[dim]
    }
}

impl fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorShape{:?}", self.as_slice())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.as_slice().iter().map(ToString::to_string).collect();
        write!(f, "{}", dims.join("x"))
    }
}

// ── Steps ────────────────────────────────────────────────────────────────────

/// Per-dimension iteration step. Unset dimensions step by 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Steps {
    values: [u32; MAX_DIMS],
}

impl Default for Steps {
    fn default() -> Self {
        Self { values: [1; MAX_DIMS] }
    }
}

impl Steps {
    /// Steps for the leading dimensions; zero entries are promoted to 1.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_DIMS`] steps are supplied.
    pub fn new(steps: &[u32]) -> Self {
        assert!(steps.len() <= MAX_DIMS, "at most {MAX_DIMS} steps are supported");
        let mut out = Self::default();
        for (slot, &step) in out.values.iter_mut().zip(steps) {
            *slot = step.max(1);
        }
        out
    }

    pub fn set(&mut self, dim: usize, step: u32) {
        self.values[dim] = step.max(1);
    }
}

impl Index<usize> for Steps {
    type Output = u32;

    fn index(&self, dim: usize) -> &u32 {
        &self.values[dim]
    }
}

// ── Strides ──────────────────────────────────────────────────────────────────

/// Per-dimension byte strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Strides {
    values: [usize; MAX_DIMS],
}

impl Strides {
    pub fn new(strides: &[usize]) -> Self {
        let mut out = Self::default();
        out.values[..strides.len()].copy_from_slice(strides);
        out
    }

    pub fn set(&mut self, dim: usize, stride: usize) {
        self.values[dim] = stride;
    }
}

impl Index<usize> for Strides {
    type Output = usize;

    fn index(&self, dim: usize) -> &usize {
        &self.values[dim]
    }
}
