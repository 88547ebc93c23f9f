//! OpenCL compile-context cache and window-driven kernel dispatch.
//!
//! The crate turns a kernel request (entry point, program, payload, build
//! options) into a cached, compiled, dispatch-ready [`KernelHandle`], and
//! drives kernels over iteration windows from `accel-window`.
//!
//! - [`driver`]: the explicit driver seam, a deterministic mock backend,
//!   and the `opencl3` backend behind the `opencl` feature
//! - [`compile_context`]: device binding, capability-gated build options,
//!   kernel creation
//! - [`program_store`]: at-most-once compilation per composite key
//! - [`kernel_cache`]: persisted binaries keyed by device fingerprint
//! - [`operator`]: the generic configure/run driver for kernel descriptors
//! - [`runtime`]: device selection, queues and tensor storage
//!
//! ```
//! use std::sync::Arc;
//!
//! use accel_opencl::driver::mock::{MockBackend, MockDevice};
//! use accel_opencl::kernels::CopyKernel;
//! use accel_opencl::{ClRuntime, Driver, RuntimeConfig, configure};
//! use accel_window::{DataType, TensorInfo, TensorShape};
//!
//! let driver = Driver::new(Arc::new(MockBackend::single(MockDevice::mali_g77())));
//! let runtime = ClRuntime::new(driver, RuntimeConfig::default()).unwrap();
//!
//! let mut src = TensorInfo::new(TensorShape::new(&[10, 4]), DataType::F32);
//! let mut dst = src.clone();
//! let mut copy = configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap();
//!
//! let src = runtime.allocate(src).unwrap();
//! let dst = runtime.allocate(dst).unwrap();
//! copy.run(runtime.queue(), &[&src, &dst]).unwrap();
//! runtime.finish().unwrap();
//! ```

pub mod build_options;
pub mod compile_context;
pub mod config;
pub mod device_capabilities;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod kernel_cache;
pub mod kernels;
pub mod operator;
pub mod program_store;
pub mod runtime;

pub use build_options::BuildOptions;
pub use compile_context::{CompileContext, ProgramSource};
pub use config::RuntimeConfig;
pub use device_capabilities::{ClVersion, DeviceCapabilities, GpuArch, GpuTarget};
pub use driver::{ClBackend, Driver, EntryPoint, SymbolTable};
pub use error::{ClError, ConfigurationError, Result};
pub use kernel::{KernelHandle, KernelScalar, NdRange};
pub use kernel_cache::{CachedProgram, KernelCacheStore};
pub use operator::{ConfiguredKernel, KernelDescriptor, ProgramDefinition, ScalarArgument, configure, gws_from_window};
pub use program_store::{CompiledProgram, Program, ProgramPayload, ProgramStore, composite_key};
pub use runtime::{ClBuffer, ClRuntime, ClTensor, CommandQueue};
