//! Error types for compilation, configuration and driver calls.

use accel_window::{DataType, WindowError};

use crate::driver::EntryPoint;

/// OpenCL status codes surfaced by the driver seam.
pub mod status {
    pub const CL_SUCCESS: i32 = 0;
    pub const CL_DEVICE_NOT_FOUND: i32 = -1;
    pub const CL_MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
    pub const CL_OUT_OF_RESOURCES: i32 = -5;
    pub const CL_OUT_OF_HOST_MEMORY: i32 = -6;
    pub const CL_BUILD_PROGRAM_FAILURE: i32 = -11;
    pub const CL_INVALID_VALUE: i32 = -30;
    pub const CL_INVALID_DEVICE: i32 = -33;
    pub const CL_INVALID_CONTEXT: i32 = -34;
    pub const CL_INVALID_COMMAND_QUEUE: i32 = -36;
    pub const CL_INVALID_MEM_OBJECT: i32 = -38;
    pub const CL_INVALID_BINARY: i32 = -42;
    pub const CL_INVALID_PROGRAM: i32 = -44;
    pub const CL_INVALID_PROGRAM_EXECUTABLE: i32 = -45;
    pub const CL_INVALID_KERNEL_NAME: i32 = -46;
    pub const CL_INVALID_KERNEL: i32 = -48;
    pub const CL_INVALID_ARG_INDEX: i32 = -49;
    pub const CL_INVALID_WORK_GROUP_SIZE: i32 = -54;
    pub const CL_INVALID_OPERATION: i32 = -59;
    pub const CL_INVALID_BUFFER_SIZE: i32 = -61;
    pub const CL_INVALID_GLOBAL_WORK_SIZE: i32 = -63;
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClError>;

/// A kernel cannot be configured for the given device or operands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("device does not support {capability}")]
    MissingCapability { capability: &'static str },

    #[error("insufficient padding for kernel '{kernel}': window shrank to {window}")]
    InsufficientPadding { kernel: String, window: String },

    #[error("operand {operand} of '{kernel}' has shape {actual}, expected {expected}")]
    ShapeMismatch { kernel: String, operand: usize, expected: String, actual: String },

    #[error("operand {operand} of '{kernel}' has data type {actual}, expected {expected}")]
    DataTypeMismatch { kernel: String, operand: usize, expected: DataType, actual: DataType },

    #[error("data type {data_type} is not supported by '{kernel}'")]
    UnsupportedDataType { kernel: String, data_type: DataType },

    #[error("'{kernel}' expects {expected} operands, got {actual}")]
    OperandCount { kernel: String, expected: usize, actual: usize },
}

/// Errors produced by the compile/dispatch core.
#[derive(Debug, thiserror::Error)]
pub enum ClError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("failed to build program '{program}' with options '{options}':\n{log}")]
    Compilation { program: String, options: String, log: String },

    #[error("driver entry point {entry_point} is unavailable (status {code})")]
    ResourceUnavailable { entry_point: EntryPoint, code: i32 },

    #[error("{call} failed with status {code}")]
    Driver { call: &'static str, code: i32 },

    #[error("program '{name}' is already loaded with a different payload")]
    ProgramConflict { name: String },

    #[error("program '{name}' has not been loaded")]
    ProgramNotFound { name: String },

    #[error("no device is bound to the compile context")]
    NoDeviceBound,

    #[error("no OpenCL device matches platform {platform}, device {device}")]
    DeviceNotFound { platform: usize, device: usize },

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error("kernel cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kernel cache index error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClError {
    /// Build a [`ClError::Driver`] from a failing call.
    pub const fn driver(call: &'static str, code: i32) -> Self {
        Self::Driver { call, code }
    }

    /// The OpenCL status code equivalent to this error.
    ///
    /// Errors that do not originate in the driver map to the closest
    /// status a raw OpenCL caller would have observed.
    pub const fn status_code(&self) -> i32 {
        match self {
            Self::ResourceUnavailable { code, .. } | Self::Driver { code, .. } => *code,
            Self::Compilation { .. } => status::CL_BUILD_PROGRAM_FAILURE,
            Self::ProgramNotFound { .. } | Self::ProgramConflict { .. } => status::CL_INVALID_PROGRAM,
            Self::NoDeviceBound | Self::DeviceNotFound { .. } => status::CL_DEVICE_NOT_FOUND,
            Self::Configuration(_) | Self::Window(_) => status::CL_INVALID_VALUE,
            Self::LockPoisoned(_) | Self::Io(_) | Self::Json(_) => status::CL_INVALID_OPERATION,
        }
    }

    /// `true` for the soft "out of resources" family: a missing driver
    /// symbol or a failed allocation.
    pub const fn is_resource_unavailable(&self) -> bool {
        matches!(
            self.status_code(),
            status::CL_OUT_OF_RESOURCES
                | status::CL_OUT_OF_HOST_MEMORY
                | status::CL_MEM_OBJECT_ALLOCATION_FAILURE
        )
    }

    pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>, what: &'static str) -> Self {
        Self::LockPoisoned(what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_symbol_maps_to_out_of_resources() {
        let err = ClError::ResourceUnavailable {
            entry_point: EntryPoint::BuildProgram,
            code: status::CL_OUT_OF_RESOURCES,
        };
        assert_eq!(err.status_code(), status::CL_OUT_OF_RESOURCES);
        assert!(err.is_resource_unavailable());
        assert!(err.to_string().contains("clBuildProgram"));
    }

    #[test]
    fn allocation_failure_is_soft() {
        let err = ClError::driver("clCreateBuffer", status::CL_MEM_OBJECT_ALLOCATION_FAILURE);
        assert!(err.is_resource_unavailable());
        assert!(!ClError::NoDeviceBound.is_resource_unavailable());
    }

    #[test]
    fn compilation_error_carries_log() {
        let err = ClError::Compilation {
            program: "activation".into(),
            options: "-DDATA_TYPE=float".into(),
            log: "error: unknown type 'flaot'".into(),
        };
        let text = err.to_string();
        assert!(text.contains("activation"));
        assert!(text.contains("unknown type 'flaot'"));
        assert_eq!(err.status_code(), status::CL_BUILD_PROGRAM_FAILURE);
    }
}
