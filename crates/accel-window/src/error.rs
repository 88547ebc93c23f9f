//! Error types for window geometry and padding validation.

use crate::border::PaddingSize;

/// Errors produced while building, collapsing or validating windows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("dimension index {dim} out of range (max {max})")]
    DimensionOutOfRange { dim: usize, max: usize },

    #[error("dimension {dim} is invalid: start {start} > end {end}")]
    InvalidRange { dim: usize, start: i32, end: i32 },

    #[error("dimension {dim} has a non-positive step {step}")]
    InvalidStep { dim: usize, step: i32 },

    #[error("cannot collapse dimensions [{first}, {last}): dimension {dim} is only partially covered")]
    PartialCollapse { first: usize, last: usize, dim: usize },

    #[error("padding of operand {operand} shrank from {before:?} to {after:?}")]
    PaddingShrunk { operand: usize, before: PaddingSize, after: PaddingSize },

    #[error("padding snapshot covers {expected} operands but {actual} were supplied")]
    SnapshotMismatch { expected: usize, actual: usize },

    #[error("tensor is locked; padding cannot grow from {current:?} to {required:?}")]
    TensorLocked { current: PaddingSize, required: PaddingSize },

    #[error("window split {id} of {total} is invalid")]
    InvalidSplit { id: usize, total: usize },
}
