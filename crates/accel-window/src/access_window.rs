//! Operand access footprints and the padding/window negotiation they drive.
//!
//! Each operand of a kernel declares how many elements one iteration step
//! touches through an [`AccessPattern`]. At configure time
//! [`update_window_and_padding`] reconciles the kernel window with every
//! operand: resizable tensors grow their padding to cover the footprint,
//! locked tensors shrink the window instead and report the change.

use crate::border::{BorderSize, PaddingSize, ValidRegion};
use crate::error::WindowError;
use crate::tensor_info::TensorInfo;
use crate::window::{Dimension, Window};

// ── AccessPattern ────────────────────────────────────────────────────────────

/// Footprint of one iteration step on an operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AccessPattern {
    /// One row of `width` elements starting `x` elements after the
    /// iteration position.
    Horizontal { x: i32, width: i32, scale_x: f32 },
    /// A `width` x `height` block offset by `(x, y)`.
    Rectangular { x: i32, y: i32, width: i32, height: i32, scale_x: f32, scale_y: f32 },
    /// A fixed `[start, end)` region, independent of the iteration position.
    Static { start_x: i32, start_y: i32, end_x: i32, end_y: i32 },
}

impl AccessPattern {
    pub const fn horizontal(x: i32, width: i32) -> Self {
        Self::Horizontal { x, width, scale_x: 1.0 }
    }

    pub const fn rectangular(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::Rectangular { x, y, width, height, scale_x: 1.0, scale_y: 1.0 }
    }

    pub const fn static_region(start_x: i32, start_y: i32, end_x: i32, end_y: i32) -> Self {
        Self::Static { start_x, start_y, end_x, end_y }
    }

    /// Scale the iteration position before applying the offset, for
    /// operands read at a different resolution than the window.
    #[must_use]
    pub fn scaled(self, sx: f32, sy: f32) -> Self {
        match self {
            Self::Horizontal { x, width, .. } => Self::Horizontal { x, width, scale_x: sx },
            Self::Rectangular { x, y, width, height, .. } => {
                Self::Rectangular { x, y, width, height, scale_x: sx, scale_y: sy }
            }
            Self::Static { .. } => self,
        }
    }

    /// `(offset, extent)` of a single step at iteration position `pos`
    /// along `dim`, or `None` when the footprint is not position-relative
    /// in that dimension.
    fn step_footprint(&self, dim: usize, pos: i32) -> Option<(i32, i32)> {
        let (offset, size, scale) = match (*self, dim) {
            (Self::Horizontal { x, width, scale_x }, 0) => (x, width, scale_x),
            (Self::Horizontal { .. }, 1) => (0, 1, 1.0),
            (Self::Rectangular { x, width, scale_x, .. }, 0) => (x, width, scale_x),
            (Self::Rectangular { y, height, scale_y, .. }, 1) => (y, height, scale_y),
            _ => return None,
        };
        Some(((pos as f32 * scale).floor() as i32 + offset, size))
    }

    /// `(offset, extent)` of everything this pattern touches along `dim`
    /// while `window` is walked.
    ///
    /// An empty window dimension touches nothing.
    pub fn compute_footprint(&self, window: &Window, dim: usize) -> (i32, i32) {
        let d = window[dim];
        if let Self::Static { start_x, start_y, end_x, end_y } = *self {
            return match dim {
                0 => (start_x, end_x - start_x),
                1 => (start_y, end_y - start_y),
                _ => (d.start(), d.extent().max(0)),
            };
        }
        if d.is_empty() {
            return (d.start(), 0);
        }
        let last = last_position(&d);
        match (self.step_footprint(dim, d.start()), self.step_footprint(dim, last)) {
            (Some((first_offset, _)), Some((last_offset, size))) => {
                (first_offset, last_offset + size - first_offset)
            }
            _ => (d.start(), d.extent()),
        }
    }

    /// Padding a tensor needs so the footprint over `window` stays in bounds.
    pub fn required_padding(&self, info: &TensorInfo, window: &Window) -> PaddingSize {
        let shape = info.tensor_shape();
        let (min_x, extent_x) = self.compute_footprint(window, 0);
        let (min_y, extent_y) = self.compute_footprint(window, 1);
        if extent_x <= 0 && !matches!(self, Self::Static { .. }) {
            return PaddingSize::default();
        }
        let max_x = min_x + extent_x;
        let max_y = min_y + extent_y;
        PaddingSize {
            top: (-min_y).max(0) as u32,
            right: (max_x - shape[0] as i32).max(0) as u32,
            bottom: (max_y - shape[1] as i32).max(0) as u32,
            left: (-min_x).max(0) as u32,
        }
    }
}

fn last_position(d: &Dimension) -> i32 {
    let iterations = d.num_iterations().max(1) as i32;
    d.start() + (iterations - 1) * d.step()
}

// ── AccessWindow ─────────────────────────────────────────────────────────────

/// An [`AccessPattern`] bound to the operand it describes.
///
/// The operand is optional so kernels can pass optional tensors through
/// unconditionally; an access window without a tensor never changes
/// anything.
#[derive(Debug)]
pub struct AccessWindow<'a> {
    info: Option<&'a mut TensorInfo>,
    pattern: AccessPattern,
}

impl<'a> AccessWindow<'a> {
    pub fn new(info: Option<&'a mut TensorInfo>, pattern: AccessPattern) -> Self {
        Self { info, pattern }
    }

    pub fn horizontal(info: &'a mut TensorInfo, x: i32, width: i32) -> Self {
        Self::new(Some(info), AccessPattern::horizontal(x, width))
    }

    pub fn rectangular(info: &'a mut TensorInfo, x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(Some(info), AccessPattern::rectangular(x, y, width, height))
    }

    pub fn static_region(
        info: &'a mut TensorInfo,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
    ) -> Self {
        Self::new(Some(info), AccessPattern::static_region(start_x, start_y, end_x, end_y))
    }

    pub const fn pattern(&self) -> &AccessPattern {
        &self.pattern
    }

    pub fn info(&self) -> Option<&TensorInfo> {
        self.info.as_deref()
    }

    /// Shrink `window` so the footprint fits the padding a locked tensor
    /// already has. Resizable tensors are left to
    /// [`update_padding_if_needed`](Self::update_padding_if_needed).
    ///
    /// Returns `true` if the window changed.
    pub fn update_window_if_needed(&self, window: &mut Window) -> bool {
        let Some(info) = self.info.as_deref() else {
            return false;
        };
        if info.is_resizable() {
            return false;
        }

        let mut changed = false;
        for dim in [Window::DIM_X, Window::DIM_Y] {
            let lo = info.padded_start(dim);
            let hi = info.padded_end(dim);
            let d = window[dim];

            let shrunk = if let AccessPattern::Static { .. } = self.pattern {
                let (offset, extent) = self.pattern.compute_footprint(window, dim);
                if offset < lo || offset + extent > hi {
                    Dimension::new(d.start(), d.start(), d.step())
                } else {
                    d
                }
            } else {
                self.shrink_to_fit(&d, dim, lo, hi)
            };

            if shrunk != d {
                window.set(dim, shrunk);
                changed = true;
            }
        }
        changed
    }

    fn shrink_to_fit(&self, d: &Dimension, dim: usize, lo: i32, hi: i32) -> Dimension {
        if d.is_empty() {
            return *d;
        }
        let fits_start =
            |pos: i32| self.pattern.step_footprint(dim, pos).is_none_or(|(offset, _)| offset >= lo);
        let fits_end = |pos: i32| {
            self.pattern.step_footprint(dim, pos).is_none_or(|(offset, size)| offset + size <= hi)
        };

        let mut start = d.start();
        while start < d.end() && !fits_start(start) {
            start += d.step();
        }
        if start >= d.end() {
            let start = start.min(d.end());
            return Dimension::new(start, start, d.step());
        }

        let original_last = start + (Dimension::new(start, d.end(), d.step()).num_iterations() as i32 - 1) * d.step();
        let mut last = original_last;
        while last >= start && !fits_end(last) {
            last -= d.step();
        }
        let end = if last == original_last {
            d.end()
        } else if last < start {
            start
        } else {
            last + d.step()
        };
        Dimension::new(start, end, d.step())
    }

    /// Grow the tensor's padding to cover the footprint over `window`.
    ///
    /// Returns `Ok(true)` if the padding grew. A locked tensor whose padding
    /// does not cover the footprint fails with [`WindowError::TensorLocked`].
    pub fn update_padding_if_needed(&mut self, window: &Window) -> Result<bool, WindowError> {
        let pattern = self.pattern;
        let Some(info) = self.info.as_deref_mut() else {
            return Ok(false);
        };
        let required = pattern.required_padding(info, window);
        info.extend_padding(required)
    }

    /// Region of the operand that holds valid data after `window` has been
    /// processed, given the valid region of the input it was computed from.
    pub fn compute_valid_region(
        &self,
        window: &Window,
        input: ValidRegion,
        border_undefined: bool,
        border: BorderSize,
    ) -> ValidRegion {
        let Some(info) = self.info.as_deref() else {
            return input;
        };
        let rank = info.num_dimensions();
        let mut anchor = input.anchor;
        let mut shape = input.shape;

        match self.pattern {
            AccessPattern::Static { start_x, start_y, end_x, end_y } => {
                let extents = [(start_x, end_x), (start_y, end_y)];
                for (dim, (start, end)) in extents.into_iter().enumerate().take(rank.max(1)) {
                    let first = start.max(0);
                    let last = end.min(info.tensor_shape()[dim] as i32);
                    anchor.set(dim, first);
                    shape.set(dim, (last - first).max(0) as usize);
                }
            }
            _ => {
                let border = if border_undefined { border } else { BorderSize::default() };
                let leading = [border.left, border.top];
                let trailing = [border.right, border.bottom];
                for dim in 0..rank.clamp(1, 2) {
                    let d = window[dim];
                    let (first_write, _) =
                        self.pattern.step_footprint(dim, d.start()).unwrap_or((d.start(), 1));
                    let (last_write, size) =
                        self.pattern.step_footprint(dim, last_position(&d)).unwrap_or((d.end() - 1, 1));
                    let first = first_write.max(input.anchor[dim] + leading[dim] as i32);
                    let last = (input.end(dim) - trailing[dim] as i32).min(last_write + size);
                    anchor.set(dim, first);
                    shape.set(dim, (last - first).max(0) as usize);
                }
            }
        }

        for dim in 2..rank {
            let first = window[dim].start().max(input.anchor[dim]);
            let last = window[dim].end().min(input.end(dim));
            anchor.set(dim, first);
            shape.set(dim, (last - first).max(0) as usize);
        }

        ValidRegion::new(anchor, shape)
    }

    /// Record on the operand the region [`compute_valid_region`] yields.
    ///
    /// [`compute_valid_region`]: Self::compute_valid_region
    pub fn set_valid_region(
        &mut self,
        window: &Window,
        input: ValidRegion,
        border_undefined: bool,
        border: BorderSize,
    ) {
        let region = self.compute_valid_region(window, input, border_undefined, border);
        if let Some(info) = self.info.as_deref_mut() {
            info.set_valid_region(region);
        }
    }
}

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Outcome of [`update_window_and_padding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowUpdate {
    /// A locked operand forced the window to shrink: its padding is
    /// insufficient for the requested access.
    pub window_changed: bool,
    /// A resizable operand had to grow its padding.
    pub padding_changed: bool,
}

impl WindowUpdate {
    pub const fn changed(&self) -> bool {
        self.window_changed || self.padding_changed
    }
}

/// Reconcile `window` with every access in `accesses`.
///
/// All window shrinking happens before any padding grows, so the padding
/// computed for resizable operands reflects the final window. Fails if a
/// locked operand still cannot cover its footprint after shrinking.
pub fn update_window_and_padding(
    window: &mut Window,
    accesses: &mut [AccessWindow<'_>],
) -> Result<WindowUpdate, WindowError> {
    let mut update = WindowUpdate::default();
    for access in accesses.iter() {
        update.window_changed |= access.update_window_if_needed(window);
    }
    for access in accesses.iter_mut() {
        update.padding_changed |= access.update_padding_if_needed(window)?;
    }
    if update.window_changed {
        tracing::debug!(window = %window, "window shrunk to fit locked operand padding");
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::{Steps, TensorShape};
    use crate::tensor_info::DataType;
    use crate::window::calculate_max_window;

    fn f32_tensor(extents: &[usize]) -> TensorInfo {
        TensorInfo::new(TensorShape::new(extents), DataType::F32)
    }

    #[test]
    fn horizontal_footprint_spans_window() {
        let mut w = Window::new();
        w.set(0, Dimension::new(0, 16, 4));
        let pattern = AccessPattern::horizontal(-1, 6);
        assert_eq!(pattern.compute_footprint(&w, 0), (-1, 18));
        assert_eq!(pattern.compute_footprint(&w, 1), (0, 1));
    }

    #[test]
    fn static_footprint_ignores_window() {
        let mut w = Window::new();
        w.set(0, Dimension::new(0, 64, 8));
        let pattern = AccessPattern::static_region(0, 0, 10, 3);
        assert_eq!(pattern.compute_footprint(&w, 0), (0, 10));
        assert_eq!(pattern.compute_footprint(&w, 1), (0, 3));
    }

    #[test]
    fn resizable_tensor_grows_padding() {
        let mut info = f32_tensor(&[10]);
        let mut w = calculate_max_window(info.tensor_shape(), &Steps::new(&[16]), true, BorderSize::default());
        let update = update_window_and_padding(&mut w, &mut [AccessWindow::horizontal(&mut info, 0, 16)]).unwrap();
        assert!(update.padding_changed);
        assert!(!update.window_changed);
        assert_eq!(info.padding(), PaddingSize::new(0, 6, 0, 0));
        assert_eq!(*w.x(), Dimension::new(0, 16, 16));
    }

    #[test]
    fn locked_tensor_shrinks_window() {
        let mut info = f32_tensor(&[10]);
        info.set_is_resizable(false);
        let mut w = calculate_max_window(info.tensor_shape(), &Steps::new(&[16]), true, BorderSize::default());
        let update = update_window_and_padding(&mut w, &mut [AccessWindow::horizontal(&mut info, 0, 16)]).unwrap();
        assert!(update.window_changed);
        assert!(update.changed());
        assert!(w.x().is_empty());
        assert_eq!(info.padding(), PaddingSize::default());
    }

    #[test]
    fn locked_tensor_trims_only_overflowing_steps() {
        let mut info = f32_tensor(&[20]);
        info.set_is_resizable(false);
        let mut w = Window::new();
        w.set(0, Dimension::new(0, 24, 4));
        let access = AccessWindow::horizontal(&mut info, 0, 4);
        assert!(access.update_window_if_needed(&mut w));
        assert_eq!(*w.x(), Dimension::new(0, 20, 4));
    }

    #[test]
    fn border_read_requires_leading_padding() {
        let mut info = f32_tensor(&[8, 8]);
        let mut w = calculate_max_window(info.tensor_shape(), &Steps::default(), true, BorderSize::default());
        update_window_and_padding(&mut w, &mut [AccessWindow::rectangular(&mut info, -1, -1, 3, 3)]).unwrap();
        assert_eq!(info.padding(), PaddingSize::uniform(1));
    }

    #[test]
    fn static_access_pads_to_fixed_region() {
        let mut info = f32_tensor(&[8, 2]);
        let mut w = Window::new();
        update_window_and_padding(&mut w, &mut [AccessWindow::static_region(&mut info, -2, 0, 12, 2)]).unwrap();
        assert_eq!(info.padding(), PaddingSize::new(0, 4, 0, 2));
    }

    #[test]
    fn locked_static_region_beyond_padding_is_an_error() {
        let mut info = f32_tensor(&[8, 2]);
        info.set_is_resizable(false);
        let mut w = Window::new();
        let err = update_window_and_padding(&mut w, &mut [AccessWindow::static_region(&mut info, 0, 0, 12, 2)])
            .unwrap_err();
        assert_eq!(
            err,
            WindowError::TensorLocked { current: PaddingSize::default(), required: PaddingSize::new(0, 4, 0, 0) }
        );
        assert_eq!(info.padding(), PaddingSize::default());
    }

    #[test]
    fn optional_operand_is_a_no_op() {
        let mut w = Window::new();
        let mut accesses = [AccessWindow::new(None, AccessPattern::horizontal(0, 4))];
        assert_eq!(update_window_and_padding(&mut w, &mut accesses).unwrap(), WindowUpdate::default());
    }

    #[test]
    fn valid_region_trims_undefined_border() {
        let mut info = f32_tensor(&[8, 8]);
        let w = calculate_max_window(info.tensor_shape(), &Steps::default(), true, BorderSize::default());
        let input = ValidRegion::full(*info.tensor_shape());
        let mut access = AccessWindow::horizontal(&mut info, 0, 1);
        access.set_valid_region(&w, input, true, BorderSize::uniform(1));
        let region = info.valid_region();
        assert_eq!((region.start(0), region.end(0)), (1, 7));
        assert_eq!((region.start(1), region.end(1)), (1, 7));
    }

    #[test]
    fn valid_region_follows_window_when_border_defined() {
        let mut info = f32_tensor(&[8, 4, 3]);
        let mut w = calculate_max_window(info.tensor_shape(), &Steps::new(&[4]), false, BorderSize::default());
        w.set(2, Dimension::range(1, 3));
        let input = ValidRegion::full(*info.tensor_shape());
        let region = AccessWindow::horizontal(&mut info, 0, 4).compute_valid_region(&w, input, false, BorderSize::uniform(1));
        assert_eq!((region.start(0), region.end(0)), (0, 8));
        assert_eq!((region.start(2), region.end(2)), (1, 3));
    }
}
