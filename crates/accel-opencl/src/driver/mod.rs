//! The driver seam.
//!
//! Every OpenCL call the core makes goes through [`Driver`], an explicit
//! context object constructed once and shared by reference. A [`Driver`]
//! wraps a [`ClBackend`] together with the [`SymbolTable`] of entry points
//! the backend managed to resolve. Calls whose entry point is missing fail
//! with [`ClError::ResourceUnavailable`] carrying `CL_OUT_OF_RESOURCES` and
//! never reach the backend.
//!
//! Two backends ship with the crate:
//! - [`mock::MockBackend`]: deterministic, in-memory, always available
//! - `opencl::OpenClBackend`: real devices through `opencl3`, behind the
//!   `opencl` feature

pub mod mock;
#[cfg(feature = "opencl")]
pub mod opencl;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::{ClError, Result, status};

// ── Handles ──────────────────────────────────────────────────────────────────

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub const fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> usize {
                self.0
            }
        }
    };
}

handle!(
    /// Opaque platform handle.
    PlatformId
);
handle!(
    /// Opaque device handle.
    DeviceId
);
handle!(
    /// Opaque context handle.
    ContextId
);
handle!(
    /// Opaque in-order command queue handle.
    QueueId
);
handle!(
    /// Opaque program object handle.
    ProgramId
);
handle!(
    /// Opaque kernel object handle.
    KernelId
);
handle!(
    /// Opaque device buffer handle.
    BufferId
);

/// Any driver object that can be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClObject {
    Context(ContextId),
    Queue(QueueId),
    Program(ProgramId),
    Kernel(KernelId),
    Buffer(BufferId),
}

impl ClObject {
    const fn entry_point(self) -> EntryPoint {
        match self {
            Self::Context(_) => EntryPoint::ReleaseContext,
            Self::Queue(_) => EntryPoint::ReleaseCommandQueue,
            Self::Program(_) => EntryPoint::ReleaseProgram,
            Self::Kernel(_) => EntryPoint::ReleaseKernel,
            Self::Buffer(_) => EntryPoint::ReleaseMemObject,
        }
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Driver functions the core depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryPoint {
    GetPlatformIds,
    GetDeviceIds,
    GetDeviceInfo,
    CreateContext,
    GetContextInfo,
    CreateCommandQueue,
    CreateProgramWithSource,
    CreateProgramWithBinary,
    BuildProgram,
    GetProgramBuildInfo,
    GetProgramInfo,
    CreateKernel,
    SetKernelArg,
    GetKernelWorkGroupInfo,
    EnqueueNdRangeKernel,
    CreateBuffer,
    EnqueueReadBuffer,
    EnqueueWriteBuffer,
    Flush,
    Finish,
    ReleaseContext,
    ReleaseCommandQueue,
    ReleaseProgram,
    ReleaseKernel,
    ReleaseMemObject,
}

impl EntryPoint {
    pub const ALL: [Self; 25] = [
        Self::GetPlatformIds,
        Self::GetDeviceIds,
        Self::GetDeviceInfo,
        Self::CreateContext,
        Self::GetContextInfo,
        Self::CreateCommandQueue,
        Self::CreateProgramWithSource,
        Self::CreateProgramWithBinary,
        Self::BuildProgram,
        Self::GetProgramBuildInfo,
        Self::GetProgramInfo,
        Self::CreateKernel,
        Self::SetKernelArg,
        Self::GetKernelWorkGroupInfo,
        Self::EnqueueNdRangeKernel,
        Self::CreateBuffer,
        Self::EnqueueReadBuffer,
        Self::EnqueueWriteBuffer,
        Self::Flush,
        Self::Finish,
        Self::ReleaseContext,
        Self::ReleaseCommandQueue,
        Self::ReleaseProgram,
        Self::ReleaseKernel,
        Self::ReleaseMemObject,
    ];

    /// The C symbol name.
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::GetPlatformIds => "clGetPlatformIDs",
            Self::GetDeviceIds => "clGetDeviceIDs",
            Self::GetDeviceInfo => "clGetDeviceInfo",
            Self::CreateContext => "clCreateContext",
            Self::GetContextInfo => "clGetContextInfo",
            Self::CreateCommandQueue => "clCreateCommandQueue",
            Self::CreateProgramWithSource => "clCreateProgramWithSource",
            Self::CreateProgramWithBinary => "clCreateProgramWithBinary",
            Self::BuildProgram => "clBuildProgram",
            Self::GetProgramBuildInfo => "clGetProgramBuildInfo",
            Self::GetProgramInfo => "clGetProgramInfo",
            Self::CreateKernel => "clCreateKernel",
            Self::SetKernelArg => "clSetKernelArg",
            Self::GetKernelWorkGroupInfo => "clGetKernelWorkGroupInfo",
            Self::EnqueueNdRangeKernel => "clEnqueueNDRangeKernel",
            Self::CreateBuffer => "clCreateBuffer",
            Self::EnqueueReadBuffer => "clEnqueueReadBuffer",
            Self::EnqueueWriteBuffer => "clEnqueueWriteBuffer",
            Self::Flush => "clFlush",
            Self::Finish => "clFinish",
            Self::ReleaseContext => "clReleaseContext",
            Self::ReleaseCommandQueue => "clReleaseCommandQueue",
            Self::ReleaseProgram => "clReleaseProgram",
            Self::ReleaseKernel => "clReleaseKernel",
            Self::ReleaseMemObject => "clReleaseMemObject",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// The entry points a backend resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTable {
    resolved: BTreeSet<EntryPoint>,
}

impl SymbolTable {
    /// Every entry point resolved.
    pub fn complete() -> Self {
        Self { resolved: EntryPoint::ALL.into_iter().collect() }
    }

    pub fn from_resolved(resolved: impl IntoIterator<Item = EntryPoint>) -> Self {
        Self { resolved: resolved.into_iter().collect() }
    }

    #[must_use]
    pub fn without(mut self, missing: &[EntryPoint]) -> Self {
        for entry_point in missing {
            self.resolved.remove(entry_point);
        }
        self
    }

    pub fn is_resolved(&self, entry_point: EntryPoint) -> bool {
        self.resolved.contains(&entry_point)
    }

    pub fn missing(&self) -> Vec<EntryPoint> {
        EntryPoint::ALL.into_iter().filter(|ep| !self.resolved.contains(ep)).collect()
    }
}

// ── Backend trait ────────────────────────────────────────────────────────────

/// Device query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceInfo {
    Name,
    Vendor,
    /// `CL_DEVICE_VERSION`, e.g. `"OpenCL 3.0 v1.r38p1-01eac0"`.
    Version,
    /// `CL_DRIVER_VERSION`.
    DriverVersion,
    /// Space-separated extension list.
    Extensions,
    MaxComputeUnits,
    MaxWorkGroupSize,
    GlobalMemSize,
    /// `CL_DEVICE_NON_UNIFORM_WORK_GROUP_SUPPORT` (OpenCL 3.0).
    NonUniformWorkGroupSupport,
}

/// A kernel argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferId),
    /// Raw bytes of a scalar, in host byte order.
    Scalar(Vec<u8>),
    /// Size in bytes of a `__local` allocation.
    Local(usize),
}

/// Raw driver calls.
///
/// Implementations translate each call to their driver and report
/// failures as [`ClError::Driver`] with the driver's status code. Symbol
/// availability is checked by [`Driver`] before any call is made.
pub trait ClBackend: Send + Sync + fmt::Debug {
    /// Entry points this backend can serve.
    fn resolved_symbols(&self) -> SymbolTable;

    fn platforms(&self) -> Result<Vec<PlatformId>>;
    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceId>>;
    fn device_info_string(&self, device: DeviceId, param: DeviceInfo) -> Result<String>;
    fn device_info_uint(&self, device: DeviceId, param: DeviceInfo) -> Result<u64>;

    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId>;
    fn context_devices(&self, context: ContextId) -> Result<Vec<DeviceId>>;
    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId>;

    fn create_program_with_source(&self, context: ContextId, source: &str) -> Result<ProgramId>;
    fn create_program_with_binary(
        &self,
        context: ContextId,
        device: DeviceId,
        binary: &[u8],
    ) -> Result<ProgramId>;
    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> Result<()>;
    fn program_build_log(&self, program: ProgramId, device: DeviceId) -> Result<String>;
    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>>;

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId>;
    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> Result<()>;
    fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize>;
    fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<()>;

    fn create_buffer(&self, context: ContextId, size: usize) -> Result<BufferId>;
    /// Blocking host-to-device copy.
    fn write_buffer(&self, queue: QueueId, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()>;
    /// Blocking device-to-host copy.
    fn read_buffer(&self, queue: QueueId, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()>;

    fn flush(&self, queue: QueueId) -> Result<()>;
    fn finish(&self, queue: QueueId) -> Result<()>;
    fn release(&self, object: ClObject) -> Result<()>;
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Guarded access to a [`ClBackend`].
///
/// Cheap to clone; clones share the backend.
#[derive(Debug, Clone)]
pub struct Driver {
    backend: Arc<dyn ClBackend>,
    symbols: Arc<SymbolTable>,
}

impl Driver {
    pub fn new(backend: Arc<dyn ClBackend>) -> Self {
        let symbols = backend.resolved_symbols();
        let missing = symbols.missing();
        if !missing.is_empty() {
            warn!(?missing, "OpenCL driver is missing entry points; dependent calls will fail");
        }
        Self { backend, symbols: Arc::new(symbols) }
    }

    /// Driver for the first OpenCL ICD found on the system.
    #[cfg(feature = "opencl")]
    pub fn opencl() -> Result<Self> {
        Ok(Self::new(Arc::new(opencl::OpenClBackend::new()?)))
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    fn require(&self, entry_point: EntryPoint) -> Result<()> {
        if self.symbols.is_resolved(entry_point) {
            Ok(())
        } else {
            Err(ClError::ResourceUnavailable { entry_point, code: status::CL_OUT_OF_RESOURCES })
        }
    }

    pub fn platforms(&self) -> Result<Vec<PlatformId>> {
        self.require(EntryPoint::GetPlatformIds)?;
        self.backend.platforms()
    }

    pub fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceId>> {
        self.require(EntryPoint::GetDeviceIds)?;
        self.backend.devices(platform)
    }

    pub fn device_info_string(&self, device: DeviceId, param: DeviceInfo) -> Result<String> {
        self.require(EntryPoint::GetDeviceInfo)?;
        self.backend.device_info_string(device, param)
    }

    pub fn device_info_uint(&self, device: DeviceId, param: DeviceInfo) -> Result<u64> {
        self.require(EntryPoint::GetDeviceInfo)?;
        self.backend.device_info_uint(device, param)
    }

    pub fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId> {
        self.require(EntryPoint::CreateContext)?;
        self.backend.create_context(devices)
    }

    pub fn context_devices(&self, context: ContextId) -> Result<Vec<DeviceId>> {
        self.require(EntryPoint::GetContextInfo)?;
        self.backend.context_devices(context)
    }

    pub fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        self.require(EntryPoint::CreateCommandQueue)?;
        self.backend.create_queue(context, device)
    }

    pub fn create_program_with_source(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        self.require(EntryPoint::CreateProgramWithSource)?;
        self.backend.create_program_with_source(context, source)
    }

    pub fn create_program_with_binary(
        &self,
        context: ContextId,
        device: DeviceId,
        binary: &[u8],
    ) -> Result<ProgramId> {
        self.require(EntryPoint::CreateProgramWithBinary)?;
        self.backend.create_program_with_binary(context, device, binary)
    }

    pub fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> Result<()> {
        self.require(EntryPoint::BuildProgram)?;
        self.backend.build_program(program, device, options)
    }

    pub fn program_build_log(&self, program: ProgramId, device: DeviceId) -> Result<String> {
        self.require(EntryPoint::GetProgramBuildInfo)?;
        self.backend.program_build_log(program, device)
    }

    pub fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>> {
        self.require(EntryPoint::GetProgramInfo)?;
        self.backend.program_binary(program)
    }

    pub fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        self.require(EntryPoint::CreateKernel)?;
        self.backend.create_kernel(program, name)
    }

    pub fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> Result<()> {
        self.require(EntryPoint::SetKernelArg)?;
        self.backend.set_kernel_arg(kernel, index, arg)
    }

    pub fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize> {
        self.require(EntryPoint::GetKernelWorkGroupInfo)?;
        self.backend.kernel_work_group_size(kernel, device)
    }

    pub fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<()> {
        self.require(EntryPoint::EnqueueNdRangeKernel)?;
        self.backend.enqueue_nd_range(queue, kernel, global, local)
    }

    pub fn create_buffer(&self, context: ContextId, size: usize) -> Result<BufferId> {
        self.require(EntryPoint::CreateBuffer)?;
        self.backend.create_buffer(context, size)
    }

    pub fn write_buffer(&self, queue: QueueId, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        self.require(EntryPoint::EnqueueWriteBuffer)?;
        self.backend.write_buffer(queue, buffer, offset, data)
    }

    pub fn read_buffer(&self, queue: QueueId, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        self.require(EntryPoint::EnqueueReadBuffer)?;
        self.backend.read_buffer(queue, buffer, offset, out)
    }

    pub fn flush(&self, queue: QueueId) -> Result<()> {
        self.require(EntryPoint::Flush)?;
        self.backend.flush(queue)
    }

    pub fn finish(&self, queue: QueueId) -> Result<()> {
        self.require(EntryPoint::Finish)?;
        self.backend.finish(queue)
    }

    pub fn release(&self, object: ClObject) -> Result<()> {
        self.require(object.entry_point())?;
        self.backend.release(object)
    }

    /// Release `object`, logging instead of failing. Used from `Drop`.
    pub(crate) fn release_quietly(&self, object: ClObject) {
        if let Err(err) = self.release(object) {
            warn!(?object, %err, "failed to release OpenCL object");
        }
    }
}
