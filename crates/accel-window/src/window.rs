//! N-dimensional iteration windows.
//!
//! A [`Window`] describes the iteration space a kernel covers as up to
//! [`MAX_DIMS`] half-open `[start, end)` ranges, each walked with its own
//! step. Kernels compute a maximal window once at configure time and then
//! dispatch it slice by slice:
//!
//! ```
//! use accel_window::{Steps, TensorShape, calculate_max_window};
//!
//! let shape = TensorShape::new(&[32, 8, 4]);
//! let window = calculate_max_window(&shape, &Steps::new(&[16]), true, Default::default());
//!
//! let mut slice = window.first_slice(2);
//! let mut dispatched = 0;
//! loop {
//!     dispatched += 1;
//!     if !window.slide_slice(2, &mut slice) {
//!         break;
//!     }
//! }
//! assert_eq!(dispatched, 4);
//! ```

use std::fmt;
use std::ops::Index;

use crate::border::{BorderSize, ValidRegion};
use crate::dimensions::{MAX_DIMS, Steps, TensorShape};
use crate::error::WindowError;

// ── Dimension ────────────────────────────────────────────────────────────────

/// One `[start, end)` range walked with `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimension {
    start: i32,
    end: i32,
    step: i32,
}

impl Default for Dimension {
    fn default() -> Self {
        Self { start: 0, end: 1, step: 1 }
    }
}

impl Dimension {
    pub const fn new(start: i32, end: i32, step: i32) -> Self {
        Self { start, end, step }
    }

    /// Unit-step range.
    pub const fn range(start: i32, end: i32) -> Self {
        Self { start, end, step: 1 }
    }

    pub const fn start(&self) -> i32 {
        self.start
    }

    pub const fn end(&self) -> i32 {
        self.end
    }

    pub const fn step(&self) -> i32 {
        self.step
    }

    pub const fn extent(&self) -> i32 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Number of steps needed to cover the range, counting a trailing
    /// partial step.
    pub fn num_iterations(&self) -> usize {
        if self.is_empty() || self.step <= 0 {
            return 0;
        }
        (self.extent() as u32).div_ceil(self.step as u32) as usize
    }

    /// `true` if the step divides the extent exactly.
    pub fn is_evenly_covered(&self) -> bool {
        self.step > 0 && self.extent() % self.step == 0
    }
}

// ── Window ───────────────────────────────────────────────────────────────────

/// Iteration space of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Window {
    dims: [Dimension; MAX_DIMS],
    broadcast: [bool; MAX_DIMS],
}

impl Window {
    pub const DIM_X: usize = 0;
    pub const DIM_Y: usize = 1;
    pub const DIM_Z: usize = 2;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, dim: usize, dimension: Dimension) {
        self.dims[dim] = dimension;
    }

    pub fn x(&self) -> &Dimension {
        &self.dims[Self::DIM_X]
    }

    pub fn y(&self) -> &Dimension {
        &self.dims[Self::DIM_Y]
    }

    pub fn z(&self) -> &Dimension {
        &self.dims[Self::DIM_Z]
    }

    pub fn set_dimension_step(&mut self, dim: usize, step: i32) {
        self.dims[dim].step = step;
    }

    /// Check `start <= end` and `step > 0` on every dimension.
    pub fn validate(&self) -> Result<(), WindowError> {
        for (dim, d) in self.dims.iter().enumerate() {
            if d.start > d.end {
                return Err(WindowError::InvalidRange { dim, start: d.start, end: d.end });
            }
            if d.step <= 0 {
                return Err(WindowError::InvalidStep { dim, step: d.step });
            }
        }
        Ok(())
    }

    pub fn shift(&mut self, dim: usize, offset: i32) {
        let d = &mut self.dims[dim];
        d.start += offset;
        d.end += offset;
    }

    /// Move the start (`at_start`) or the end of `dim` by `amount`.
    pub fn adjust(&mut self, dim: usize, amount: i32, at_start: bool) {
        let d = &mut self.dims[dim];
        if at_start {
            d.start += amount;
        } else {
            d.end += amount;
        }
    }

    pub fn scale(&mut self, dim: usize, factor: f32) {
        let d = &mut self.dims[dim];
        d.start = (d.start as f32 * factor) as i32;
        d.end = (d.end as f32 * factor) as i32;
    }

    /// Cover `shape` from `first_dim` upwards with unit steps.
    pub fn use_tensor_dimensions(&mut self, shape: &TensorShape, first_dim: usize) {
        for dim in first_dim..shape.num_dimensions() {
            self.dims[dim] = Dimension::range(0, shape[dim].max(1) as i32);
        }
    }

    /// Mark every dimension where `shape` has extent <= 1 as broadcast.
    pub fn broadcast_if_dimension_le_one(&mut self, shape: &TensorShape) {
        for dim in 0..MAX_DIMS {
            if shape[dim] <= 1 {
                self.set_broadcasted(dim);
            }
        }
    }

    pub fn set_broadcasted(&mut self, dim: usize) {
        self.dims[dim] = Dimension::default();
        self.broadcast[dim] = true;
    }

    pub fn is_broadcasted(&self, dim: usize) -> bool {
        self.broadcast[dim]
    }

    pub fn num_iterations(&self, dim: usize) -> usize {
        self.dims[dim].num_iterations()
    }

    pub fn num_iterations_total(&self) -> usize {
        self.dims.iter().map(Dimension::num_iterations).product()
    }

    /// Drop `shift` dimensions starting at `start_dim`, moving the higher
    /// ones down and filling the top with unit dimensions.
    #[must_use]
    pub fn shift_dimensions(&self, shift: usize, start_dim: usize) -> Self {
        let mut out = Self::default();
        out.dims[..start_dim].copy_from_slice(&self.dims[..start_dim]);
        out.broadcast[..start_dim].copy_from_slice(&self.broadcast[..start_dim]);
        for dim in start_dim..MAX_DIMS.saturating_sub(shift) {
            out.dims[dim] = self.dims[dim + shift];
            out.broadcast[dim] = self.broadcast[dim + shift];
        }
        out
    }

    /// Try to merge dimensions `[first, last)` into `first`.
    ///
    /// The merge happens only when `first` starts at 0, matches `full` and
    /// steps evenly through its extent, and when every higher dimension in
    /// the range starts
    /// at 0, steps by 1 and spans the same extent as `full`. Otherwise the
    /// window is returned unchanged with `false`.
    pub fn collapse_if_possible(&self, full: &Self, first: usize, last: usize) -> (Self, bool) {
        match self.collapse_checked(full, first, last) {
            Ok(collapsed) => (collapsed, true),
            Err(_) => (*self, false),
        }
    }

    /// Merge dimensions `[first, last)` into `first`, rejecting any range
    /// where a dimension is only partially covered.
    pub fn collapse(&self, full: &Self, first: usize, last: usize) -> Result<Self, WindowError> {
        self.collapse_checked(full, first, last)
    }

    fn collapse_checked(&self, full: &Self, first: usize, last: usize) -> Result<Self, WindowError> {
        if last > MAX_DIMS {
            return Err(WindowError::DimensionOutOfRange { dim: last, max: MAX_DIMS });
        }
        if first >= last {
            return Ok(*self);
        }

        let head = self.dims[first];
        if head.start != 0 || head != full.dims[first] || !head.is_evenly_covered() {
            return Err(WindowError::PartialCollapse { first, last, dim: first });
        }

        let mut collapsed_end = head.end;
        for dim in first + 1..last {
            let d = &self.dims[dim];
            let f = &full.dims[dim];
            let covered = d.start == 0 && f.start == 0 && d.step == 1 && d.end == f.end;
            if !covered {
                return Err(WindowError::PartialCollapse { first, last, dim });
            }
            collapsed_end *= d.end;
        }

        let mut out = *self;
        out.dims[first].end = collapsed_end;
        for dim in first + 1..last {
            out.dims[dim] = Dimension::default();
        }
        Ok(out)
    }

    /// The slice at the first position of every dimension `>= rank`.
    #[must_use]
    pub fn first_slice(&self, rank: usize) -> Self {
        let mut slice = *self;
        for dim in rank..MAX_DIMS {
            let start = self.dims[dim].start;
            slice.dims[dim] = Dimension::range(start, start + 1);
        }
        slice
    }

    /// Advance `slice` to the next position among dimensions `>= rank`.
    ///
    /// Returns `false` once every position has been visited; `slice` is
    /// left on the last position in that case.
    pub fn slide_slice(&self, rank: usize, slice: &mut Self) -> bool {
        for dim in rank..MAX_DIMS {
            let next = slice.dims[dim].start + self.dims[dim].step.max(1);
            if next < self.dims[dim].end {
                slice.dims[dim] = Dimension::range(next, next + 1);
                for lower in rank..dim {
                    let start = self.dims[lower].start;
                    slice.dims[lower] = Dimension::range(start, start + 1);
                }
                return true;
            }
        }
        false
    }

    /// Iterate the slices of rank `rank`.
    ///
    /// Yields nothing when a dimension `>= rank` is empty.
    pub fn slices(&self, rank: usize) -> Slices<'_> {
        let empty = self.dims[rank.min(MAX_DIMS)..].iter().any(Dimension::is_empty);
        Slices { window: self, rank, next: (!empty).then(|| self.first_slice(rank)) }
    }

    /// Split `dim` into `total` near-equal parts and return part `id`.
    ///
    /// Parts differ by at most one step; the remainder goes to the lowest ids.
    pub fn split_window(&self, dim: usize, id: usize, total: usize) -> Result<Self, WindowError> {
        if total == 0 || id >= total {
            return Err(WindowError::InvalidSplit { id, total });
        }
        let d = self.dims[dim];
        let iterations = d.num_iterations();
        let remainder = iterations % total;
        let mut work = iterations / total;
        let mut first_iteration = work * id;
        if id < remainder {
            work += 1;
            first_iteration += id;
        } else {
            first_iteration += remainder;
        }
        let start = (d.start + first_iteration as i32 * d.step).min(d.end.max(d.start));
        let end = d.end.min(start + work as i32 * d.step);

        let mut out = *self;
        out.dims[dim] = Dimension::new(start, end.max(start), d.step);
        Ok(out)
    }
}

impl Index<usize> for Window {
    type Output = Dimension;

    fn index(&self, dim: usize) -> &Dimension {
        &self.dims[dim]
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "[{}, {}, {}]", d.start, d.end, d.step)?;
        }
        f.write_str("}")
    }
}

// ── Slices ───────────────────────────────────────────────────────────────────

/// Iterator over the slices of a window, see [`Window::slices`].
#[derive(Debug)]
pub struct Slices<'a> {
    window: &'a Window,
    rank: usize,
    next: Option<Window>,
}

impl Iterator for Slices<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let current = self.next.take()?;
        let mut following = current;
        if self.window.slide_slice(self.rank, &mut following) {
            self.next = Some(following);
        }
        Some(current)
    }
}

// ── Max window ───────────────────────────────────────────────────────────────

/// Round `value` up to a multiple of `step`.
pub const fn ceil_to_multiple(value: i32, step: i32) -> i32 {
    if step <= 0 {
        return value;
    }
    (value + step - 1) / step * step
}

/// Largest window a kernel can process over a tensor of `shape`.
///
/// Dimensions 0 and 1 are stretched to a multiple of their step. When the
/// border is defined the window also covers the border, starting at
/// `-border`; when it is undefined the window starts at 0 and only covers
/// the tensor itself. Dimension 2 keeps its step, higher dimensions step
/// by 1.
pub fn calculate_max_window(
    shape: &TensorShape,
    steps: &Steps,
    border_undefined: bool,
    border: BorderSize,
) -> Window {
    calculate_max_window_for_region(&ValidRegion::full(*shape), steps, border_undefined, border)
}

/// [`calculate_max_window`] for a region that may not start at the origin.
pub fn calculate_max_window_for_region(
    region: &ValidRegion,
    steps: &Steps,
    border_undefined: bool,
    border: BorderSize,
) -> Window {
    let border = if border_undefined { BorderSize::default() } else { border };
    let shape = &region.shape;
    let rank = shape.num_dimensions().max(1);
    let mut window = Window::new();

    let x_start = region.start(0) - border.left as i32;
    let x_extent = shape[0] as i32 + (border.left + border.right) as i32;
    window.set(
        0,
        Dimension::new(x_start, x_start + ceil_to_multiple(x_extent, steps[0] as i32), steps[0] as i32),
    );

    if rank > 1 {
        let y_start = region.start(1) - border.top as i32;
        let y_extent = shape[1] as i32 + (border.top + border.bottom) as i32;
        window.set(
            1,
            Dimension::new(
                y_start,
                y_start + ceil_to_multiple(y_extent, steps[1] as i32),
                steps[1] as i32,
            ),
        );
    }

    if rank > 2 {
        let z_start = region.start(2);
        window.set(2, Dimension::new(z_start, z_start + shape[2].max(1) as i32, steps[2] as i32));
    }

    for dim in 3..rank {
        let start = region.start(dim);
        window.set(dim, Dimension::range(start, start + shape[dim].max(1) as i32));
    }

    window
}
