//! Device selection, queues and tensor storage.
//!
//! [`ClRuntime`] is the top-level owner: it picks a device, creates the
//! context and an in-order queue, and owns the [`CompileContext`] whose
//! program store lives as long as the runtime. When a kernel cache
//! directory is configured, binaries saved for the same device fingerprint
//! are restored on start-up and written back on drop.

use accel_window::{TensorInfo, Window, execute_window_loop};
use tracing::{info, warn};

use crate::compile_context::CompileContext;
use crate::config::RuntimeConfig;
use crate::driver::{BufferId, ClObject, ContextId, DeviceId, Driver, QueueId};
use crate::error::{ClError, Result, status};
use crate::kernel_cache::KernelCacheStore;

/// An in-order command queue.
#[derive(Debug)]
pub struct CommandQueue {
    id: QueueId,
    device: DeviceId,
    driver: Driver,
}

impl CommandQueue {
    pub fn new(driver: &Driver, context: ContextId, device: DeviceId) -> Result<Self> {
        let id = driver.create_queue(context, device)?;
        Ok(Self { id, device, driver: driver.clone() })
    }

    pub const fn id(&self) -> QueueId {
        self.id
    }

    pub const fn device(&self) -> DeviceId {
        self.device
    }

    /// Blocking write of `data` at `offset` bytes into `buffer`.
    pub fn write(&self, buffer: &ClBuffer, offset: usize, data: &[u8]) -> Result<()> {
        self.driver.write_buffer(self.id, buffer.id, offset, data)
    }

    /// Blocking read of `out.len()` bytes at `offset` from `buffer`.
    pub fn read(&self, buffer: &ClBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        self.driver.read_buffer(self.id, buffer.id, offset, out)
    }

    pub fn flush(&self) -> Result<()> {
        self.driver.flush(self.id)
    }

    pub fn finish(&self) -> Result<()> {
        self.driver.finish(self.id)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.driver.release_quietly(ClObject::Queue(self.id));
    }
}

/// A device buffer, released on drop.
#[derive(Debug)]
pub struct ClBuffer {
    id: BufferId,
    size: usize,
    driver: Driver,
}

impl ClBuffer {
    pub fn new(driver: &Driver, context: ContextId, size: usize) -> Result<Self> {
        let id = driver.create_buffer(context, size)?;
        Ok(Self { id, size, driver: driver.clone() })
    }

    pub const fn id(&self) -> BufferId {
        self.id
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ClBuffer {
    fn drop(&mut self) {
        self.driver.release_quietly(ClObject::Buffer(self.id));
    }
}

/// Tensor metadata plus the buffer that stores it.
///
/// The metadata is locked: its padding can no longer grow.
#[derive(Debug)]
pub struct ClTensor {
    info: TensorInfo,
    buffer: ClBuffer,
}

impl ClTensor {
    pub const fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub const fn buffer(&self) -> &ClBuffer {
        &self.buffer
    }

    /// Byte offsets of the first element of every row (dimension 0 run).
    fn row_offsets(&self) -> Vec<usize> {
        let mut rows = Window::new();
        rows.use_tensor_dimensions(self.info.tensor_shape(), 1);
        let mut offsets = Vec::with_capacity(self.info.tensor_shape().total_size_upper(1));
        execute_window_loop(&rows, |coords| {
            offsets.push(self.info.offset_element_in_bytes(coords) as usize);
        });
        offsets
    }

    fn row_bytes(&self) -> usize {
        self.info.tensor_shape()[0] * self.info.element_size()
    }

    fn dense_size(&self) -> usize {
        self.info.tensor_shape().total_size() * self.info.element_size()
    }
}

#[derive(Debug)]
struct ContextGuard {
    id: ContextId,
    driver: Driver,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.driver.release_quietly(ClObject::Context(self.id));
    }
}

/// A bound device with its queue and compile context.
///
/// Fields drop in declaration order: kernels and programs go before the
/// queue, and the context goes last.
#[derive(Debug)]
pub struct ClRuntime {
    compile: CompileContext,
    queue: CommandQueue,
    kernel_cache: Option<KernelCacheStore>,
    config: RuntimeConfig,
    context: ContextGuard,
}

impl ClRuntime {
    pub fn new(driver: Driver, config: RuntimeConfig) -> Result<Self> {
        let not_found =
            || ClError::DeviceNotFound { platform: config.platform_index, device: config.device_index };
        let platform = *driver.platforms()?.get(config.platform_index).ok_or_else(not_found)?;
        let device = *driver.devices(platform)?.get(config.device_index).ok_or_else(not_found)?;

        let context = ContextGuard { id: driver.create_context(&[device])?, driver: driver.clone() };
        let mut compile = CompileContext::bound(driver.clone(), context.id, device)?;
        compile.set_include_path(config.include_path_str());
        let queue = CommandQueue::new(&driver, context.id, device)?;
        let kernel_cache = config.kernel_cache_dir.as_ref().map(KernelCacheStore::open).transpose()?;

        let runtime = Self { compile, queue, kernel_cache, config, context };
        runtime.restore_kernel_cache()?;
        Ok(runtime)
    }

    /// Runtime for the configured device of the system OpenCL driver.
    #[cfg(feature = "opencl")]
    pub fn from_env() -> Result<Self> {
        Self::new(Driver::opencl()?, RuntimeConfig::from_env())
    }

    fn restore_kernel_cache(&self) -> Result<()> {
        let (Some(cache), Some(caps)) = (&self.kernel_cache, self.compile.capabilities()) else {
            return Ok(());
        };
        if let Some(programs) = cache.load(&caps.fingerprint()) {
            let restored = self.compile.restore_programs(&programs)?;
            info!(restored, dir = %cache.dir().display(), "restored kernel cache");
        }
        Ok(())
    }

    pub const fn driver(&self) -> &Driver {
        self.compile.driver()
    }

    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub const fn compile_context(&self) -> &CompileContext {
        &self.compile
    }

    pub const fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub const fn context(&self) -> ContextId {
        self.context.id
    }

    pub fn create_buffer(&self, size: usize) -> Result<ClBuffer> {
        ClBuffer::new(self.driver(), self.context.id, size)
    }

    /// Allocate storage for `info`, locking its padding.
    pub fn allocate(&self, mut info: TensorInfo) -> Result<ClTensor> {
        info.set_is_resizable(false);
        let buffer = self.create_buffer(info.total_size())?;
        Ok(ClTensor { info, buffer })
    }

    /// Write densely packed elements into the tensor's padded layout.
    pub fn write_tensor(&self, tensor: &ClTensor, data: &[u8]) -> Result<()> {
        if data.len() != tensor.dense_size() {
            return Err(ClError::driver("clEnqueueWriteBuffer", status::CL_INVALID_VALUE));
        }
        let row = tensor.row_bytes();
        if row == 0 {
            return Ok(());
        }
        for (offset, chunk) in tensor.row_offsets().into_iter().zip(data.chunks_exact(row)) {
            self.queue.write(&tensor.buffer, offset, chunk)?;
        }
        Ok(())
    }

    /// Read the tensor's elements back, densely packed.
    pub fn read_tensor(&self, tensor: &ClTensor) -> Result<Vec<u8>> {
        let mut out = vec![0; tensor.dense_size()];
        let row = tensor.row_bytes();
        if row == 0 {
            return Ok(out);
        }
        for (offset, chunk) in tensor.row_offsets().into_iter().zip(out.chunks_exact_mut(row)) {
            self.queue.read(&tensor.buffer, offset, chunk)?;
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        self.queue.flush()
    }

    pub fn finish(&self) -> Result<()> {
        self.queue.finish()
    }

    /// Persist every compiled program. Returns `0` when no cache directory
    /// is configured.
    pub fn save_kernel_cache(&self) -> Result<usize> {
        match (&self.kernel_cache, self.compile.capabilities()) {
            (Some(cache), Some(caps)) => cache.save(&caps.fingerprint(), self.compile.program_store()),
            _ => Ok(0),
        }
    }
}

impl Drop for ClRuntime {
    fn drop(&mut self) {
        if self.config.save_kernel_cache_on_drop {
            if let Err(err) = self.save_kernel_cache() {
                warn!(%err, "failed to save kernel cache");
            }
        }
    }
}
