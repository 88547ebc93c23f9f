//! Border, padding and valid-region descriptors.

use crate::dimensions::{Coordinates, TensorShape};

/// Element counts around the x/y plane of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BorderSize {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

/// Padding uses the same layout as a border.
pub type PaddingSize = BorderSize;

impl BorderSize {
    pub const fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self { top, right, bottom, left }
    }

    /// The same size on all four sides.
    pub const fn uniform(size: u32) -> Self {
        Self::new(size, size, size, size)
    }

    pub const fn is_zero(&self) -> bool {
        self.top == 0 && self.right == 0 && self.bottom == 0 && self.left == 0
    }

    /// Component-wise maximum.
    #[must_use]
    pub fn extend(self, other: Self) -> Self {
        Self {
            top: self.top.max(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
            left: self.left.max(other.left),
        }
    }

    /// Component-wise minimum.
    #[must_use]
    pub fn limit(self, other: Self) -> Self {
        Self {
            top: self.top.min(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
            left: self.left.min(other.left),
        }
    }

    /// `true` if every side of `self` is at least as large as `other`.
    pub const fn covers(&self, other: &Self) -> bool {
        self.top >= other.top
            && self.right >= other.right
            && self.bottom >= other.bottom
            && self.left >= other.left
    }
}

/// The sub-region of a tensor that holds computed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValidRegion {
    pub anchor: Coordinates,
    pub shape: TensorShape,
}

impl ValidRegion {
    pub const fn new(anchor: Coordinates, shape: TensorShape) -> Self {
        Self { anchor, shape }
    }

    /// A region anchored at the origin covering all of `shape`.
    pub fn full(shape: TensorShape) -> Self {
        let zeros = [0_i32; crate::dimensions::MAX_DIMS];
        Self { anchor: Coordinates::new(&zeros[..shape.num_dimensions()]), shape }
    }

    /// First coordinate of `dim` that holds valid data.
    pub fn start(&self, dim: usize) -> i32 {
        self.anchor[dim]
    }

    /// One past the last valid coordinate of `dim`.
    pub fn end(&self, dim: usize) -> i32 {
        self.anchor[dim] + self.shape[dim] as i32
    }
}
