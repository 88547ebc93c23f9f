//! Property-based tests for window geometry.
//!
//! - Every access produced by walking a negotiated window stays inside the
//!   operand's padded extent, for resizable and locked operands alike.
//! - Collapsing fully covered dimensions preserves the slice count.
//! - Splitting a window partitions its iterations exactly.

use accel_window::{
    AccessWindow, BorderSize, DataType, Dimension, MAX_DIMS, PaddingSize, Steps, TensorInfo,
    TensorShape, Window, calculate_max_window, execute_window_loop, update_window_and_padding,
};
use proptest::prelude::*;

fn count_slices(window: &Window, rank: usize) -> usize {
    let mut slice = window.first_slice(rank);
    let mut count = 1;
    while window.slide_slice(rank, &mut slice) {
        count += 1;
    }
    count
}

fn accesses_in_bounds(window: &Window, info: &TensorInfo, rank: usize, width: i32) -> bool {
    let lo = info.padded_start(0);
    let hi = info.padded_end(0);
    let mut ok = true;
    for slice in window.slices(rank) {
        execute_window_loop(&slice, |c| {
            ok &= c[0] >= lo && c[0] + width <= hi;
        });
    }
    ok
}

// ── window / padding round trip ──────────────────────────────────────

proptest! {
    #[test]
    fn resizable_operand_padding_covers_every_access(
        width in 1_usize..=64,
        rows in 1_usize..=4,
        step in 1_u32..=16,
    ) {
        let mut info = TensorInfo::new(TensorShape::new(&[width, rows]), DataType::F32);
        let mut window = calculate_max_window(
            info.tensor_shape(), &Steps::new(&[step]), true, BorderSize::default());
        let update = update_window_and_padding(
            &mut window, &mut [AccessWindow::horizontal(&mut info, 0, step as i32)]).unwrap();

        prop_assert!(!update.window_changed);
        prop_assert!(accesses_in_bounds(&window, &info, 1, step as i32));
    }

    #[test]
    fn locked_operand_window_never_overreads(
        width in 1_usize..=64,
        right_pad in 0_u32..=8,
        step in 1_u32..=16,
    ) {
        let mut info = TensorInfo::with_padding(
            TensorShape::new(&[width]), DataType::U8, PaddingSize::new(0, right_pad, 0, 0));
        info.set_is_resizable(false);
        let mut window = calculate_max_window(
            info.tensor_shape(), &Steps::new(&[step]), true, BorderSize::default());
        let update = update_window_and_padding(
            &mut window, &mut [AccessWindow::horizontal(&mut info, 0, step as i32)]).unwrap();

        let needed = (width as u32).div_ceil(step) * step;
        prop_assert_eq!(update.window_changed, needed > width as u32 + right_pad);
        prop_assert!(accesses_in_bounds(&window, &info, 1, step as i32));
    }

    #[test]
    fn collapse_preserves_slice_count(
        x in 1_usize..=32,
        z in 1_usize..=6,
        w in 1_usize..=6,
        v in 1_usize..=3,
    ) {
        let shape = TensorShape::new(&[x, 2, z, w, v]);
        let window = calculate_max_window(&shape, &Steps::default(), true, BorderSize::default());
        let collapsed = window.collapse(&window, Window::DIM_Z, MAX_DIMS).unwrap();

        prop_assert_eq!(count_slices(&window, 2), z * w * v);
        prop_assert_eq!(count_slices(&collapsed, 2), count_slices(&window, 2));
        prop_assert_eq!(*collapsed.z(), Dimension::range(0, (z * w * v) as i32));
    }

    #[test]
    fn split_parts_partition_iterations(
        extent in 0_i32..=200,
        step in 1_i32..=8,
        total in 1_usize..=12,
    ) {
        let mut window = Window::new();
        window.set(0, Dimension::new(0, extent, step));
        let mut covered = 0;
        let mut next_start = 0;
        for id in 0..total {
            let part = window.split_window(0, id, total).unwrap();
            prop_assert_eq!(part.x().start(), next_start.min(extent.max(0)));
            covered += part.num_iterations(0);
            next_start = part.x().end().max(part.x().start());
        }
        prop_assert_eq!(covered, window.num_iterations(0));
    }
}
