//! Execution-window geometry for accelerated tensor kernels.
//!
//! This crate provides:
//! - [`window`]: N-dimensional iteration windows, max-window calculation,
//!   collapsing and slicing
//! - [`access_window`]: per-operand access footprints and the
//!   window/padding negotiation they drive
//! - [`tensor_info`]: tensor layout metadata (shape, padding, strides,
//!   valid region)
//! - [`padding`]: before/after padding snapshots for configure-time checks
//! - [`cpu`]: host-side window loops and parallel window splitting

pub mod access_window;
pub mod border;
pub mod cpu;
pub mod dimensions;
pub mod error;
pub mod padding;
pub mod tensor_info;
pub mod window;

pub use access_window::{AccessPattern, AccessWindow, WindowUpdate, update_window_and_padding};
pub use border::{BorderSize, PaddingSize, ValidRegion};
pub use cpu::{ThreadInfo, execute_window_loop, run_parallel};
pub use dimensions::{Coordinates, MAX_DIMS, Steps, Strides, TensorShape};
pub use error::WindowError;
pub use padding::PaddingSnapshot;
pub use tensor_info::{DataType, TensorInfo};
pub use window::{
    Dimension, Slices, Window, calculate_max_window, calculate_max_window_for_region,
    ceil_to_multiple,
};
