//! Tensor metadata: shape, element type, padding and derived strides.

use std::fmt;

use crate::border::{PaddingSize, ValidRegion};
use crate::dimensions::{Coordinates, MAX_DIMS, Strides, TensorShape};
use crate::error::WindowError;

// ── DataType ─────────────────────────────────────────────────────────────────

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    U8,
    S8,
    QAsymm8,
    QAsymm8Signed,
    U16,
    S16,
    F16,
    U32,
    S32,
    F32,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            Self::U8 | Self::S8 | Self::QAsymm8 | Self::QAsymm8Signed => 1,
            Self::U16 | Self::S16 | Self::F16 => 2,
            Self::U32 | Self::S32 | Self::F32 => 4,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::F32)
    }

    pub const fn is_quantized(self) -> bool {
        matches!(self, Self::QAsymm8 | Self::QAsymm8Signed)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "U8",
            Self::S8 => "S8",
            Self::QAsymm8 => "QASYMM8",
            Self::QAsymm8Signed => "QASYMM8_SIGNED",
            Self::U16 => "U16",
            Self::S16 => "S16",
            Self::F16 => "F16",
            Self::U32 => "U32",
            Self::S32 => "S32",
            Self::F32 => "F32",
        };
        f.write_str(name)
    }
}

// ── TensorInfo ───────────────────────────────────────────────────────────────

/// Metadata describing how a tensor is laid out in memory.
///
/// Padding surrounds the x/y plane only. Strides, the offset of the first
/// element and the total allocation size are recomputed whenever padding
/// changes. Once a tensor is locked with [`set_is_resizable(false)`], its
/// padding can no longer grow; this happens when its storage is allocated.
///
/// [`set_is_resizable(false)`]: TensorInfo::set_is_resizable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    shape: TensorShape,
    data_type: DataType,
    padding: PaddingSize,
    strides: Strides,
    offset_first_element: usize,
    total_size: usize,
    valid_region: ValidRegion,
    is_resizable: bool,
}

impl TensorInfo {
    pub fn new(shape: TensorShape, data_type: DataType) -> Self {
        let mut info = Self {
            shape,
            data_type,
            padding: PaddingSize::default(),
            strides: Strides::default(),
            offset_first_element: 0,
            total_size: 0,
            valid_region: ValidRegion::full(shape),
            is_resizable: true,
        };
        info.recompute_layout();
        info
    }

    /// Same as [`new`](Self::new) with explicit initial padding.
    pub fn with_padding(shape: TensorShape, data_type: DataType, padding: PaddingSize) -> Self {
        let mut info = Self::new(shape, data_type);
        info.padding = padding;
        info.recompute_layout();
        info
    }

    pub const fn tensor_shape(&self) -> &TensorShape {
        &self.shape
    }

    pub const fn data_type(&self) -> DataType {
        self.data_type
    }

    pub const fn element_size(&self) -> usize {
        self.data_type.element_size()
    }

    pub const fn num_dimensions(&self) -> usize {
        self.shape.num_dimensions()
    }

    pub const fn padding(&self) -> PaddingSize {
        self.padding
    }

    pub fn has_padding(&self) -> bool {
        !self.padding.is_zero()
    }

    pub const fn strides_in_bytes(&self) -> &Strides {
        &self.strides
    }

    pub const fn offset_first_element_in_bytes(&self) -> usize {
        self.offset_first_element
    }

    /// Bytes required to hold the tensor including padding.
    pub const fn total_size(&self) -> usize {
        self.total_size
    }

    pub const fn valid_region(&self) -> &ValidRegion {
        &self.valid_region
    }

    pub fn set_valid_region(&mut self, region: ValidRegion) {
        self.valid_region = region;
    }

    pub const fn is_resizable(&self) -> bool {
        self.is_resizable
    }

    pub fn set_is_resizable(&mut self, resizable: bool) {
        self.is_resizable = resizable;
    }

    /// Grow padding so every side is at least `required`.
    ///
    /// Returns `Ok(true)` if any side grew. A locked tensor whose padding
    /// already covers `required` is left untouched; a locked tensor that
    /// would need to grow reports [`WindowError::TensorLocked`].
    pub fn extend_padding(&mut self, required: PaddingSize) -> Result<bool, WindowError> {
        if self.padding.covers(&required) {
            return Ok(false);
        }
        if !self.is_resizable {
            return Err(WindowError::TensorLocked { current: self.padding, required });
        }
        self.padding = self.padding.extend(required);
        self.recompute_layout();
        Ok(true)
    }

    /// First addressable coordinate of `dim`, including padding.
    pub fn padded_start(&self, dim: usize) -> i32 {
        match dim {
            0 => -(self.padding.left as i32),
            1 => -(self.padding.top as i32),
            _ => 0,
        }
    }

    /// One past the last addressable coordinate of `dim`, including padding.
    pub fn padded_end(&self, dim: usize) -> i32 {
        let extent = self.shape[dim] as i32;
        match dim {
            0 => extent + self.padding.right as i32,
            1 => extent + self.padding.bottom as i32,
            _ => extent,
        }
    }

    /// Byte offset of `coords` relative to the start of the allocation.
    pub fn offset_element_in_bytes(&self, coords: &Coordinates) -> isize {
        let mut offset = self.offset_first_element as isize;
        for dim in 0..coords.num_dimensions() {
            offset += coords[dim] as isize * self.strides[dim] as isize;
        }
        offset
    }

    fn recompute_layout(&mut self) {
        let elem = self.element_size();
        let p = self.padding;
        let stride_x = elem;
        let stride_y = (p.left as usize + self.shape[0] + p.right as usize) * stride_x;
        let stride_z = (p.top as usize + self.shape[1] + p.bottom as usize) * stride_y;

        let mut strides = Strides::default();
        strides.set(0, stride_x);
        strides.set(1, stride_y);
        strides.set(2, stride_z);
        for dim in 3..MAX_DIMS {
            strides.set(dim, self.shape[dim - 1] * strides[dim - 1]);
        }

        let rank = self.shape.num_dimensions();
        self.total_size = if rank <= 2 {
            stride_z
        } else {
            self.shape[rank - 1] * strides[rank - 1]
        };
        self.offset_first_element = p.left as usize * stride_x + p.top as usize * stride_y;
        self.strides = strides;
    }
}
