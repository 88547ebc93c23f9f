//! [`ClBackend`] over the system OpenCL ICD via `opencl3`.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_GPU, Device};
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE, ClMem};
use opencl3::platform::{Platform, get_platforms};
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_device_id};
use tracing::debug;

use super::{
    BufferId, ClBackend, ClObject, ContextId, DeviceId, DeviceInfo, KernelArg, KernelId, PlatformId,
    ProgramId, QueueId, SymbolTable,
};
use crate::error::{ClError, Result, status};

fn cl(call: &'static str) -> impl Fn(opencl3::error_codes::ClError) -> ClError {
    move |err| ClError::driver(call, err.0)
}

#[derive(Default)]
struct State {
    platforms: Vec<Platform>,
    devices: Vec<cl_device_id>,
    next_id: usize,
    contexts: HashMap<usize, Context>,
    queues: HashMap<usize, CommandQueue>,
    programs: HashMap<usize, Program>,
    kernels: HashMap<usize, Kernel>,
    buffers: HashMap<usize, Buffer<u8>>,
}

// SAFETY: OpenCL objects may be used from any thread; every access goes
// through the backend mutex.
unsafe impl Send for State {}

impl State {
    fn next(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn device(&self, device: DeviceId) -> Result<cl_device_id> {
        device
            .as_raw()
            .checked_sub(1)
            .and_then(|i| self.devices.get(i).copied())
            .ok_or(ClError::driver("clGetDeviceInfo", status::CL_INVALID_DEVICE))
    }

    fn device_index(&self, id: cl_device_id) -> Option<DeviceId> {
        self.devices.iter().position(|&d| d == id).map(|i| DeviceId::from_raw(i + 1))
    }
}

/// Backend for real OpenCL devices. Only GPU devices are exposed.
pub struct OpenClBackend {
    state: Mutex<State>,
}

impl std::fmt::Debug for OpenClBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClBackend").finish_non_exhaustive()
    }
}

impl OpenClBackend {
    pub fn new() -> Result<Self> {
        let platforms = get_platforms().map_err(cl("clGetPlatformIDs"))?;
        if platforms.is_empty() {
            return Err(ClError::driver("clGetPlatformIDs", status::CL_DEVICE_NOT_FOUND));
        }
        debug!(platforms = platforms.len(), "found OpenCL platforms");
        let state = State { platforms, ..State::default() };
        Ok(Self { state: Mutex::new(state) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|e| ClError::poisoned(e, "OpenCL backend state"))
    }
}

impl ClBackend for OpenClBackend {
    fn resolved_symbols(&self) -> SymbolTable {
        SymbolTable::complete()
    }

    fn platforms(&self) -> Result<Vec<PlatformId>> {
        Ok((1..=self.lock()?.platforms.len()).map(PlatformId::from_raw).collect())
    }

    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceId>> {
        let mut state = self.lock()?;
        let ids = platform
            .as_raw()
            .checked_sub(1)
            .and_then(|i| state.platforms.get(i))
            .ok_or(ClError::driver("clGetDeviceIDs", status::CL_INVALID_VALUE))?
            .get_devices(CL_DEVICE_TYPE_GPU)
            .map_err(cl("clGetDeviceIDs"))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let handle = match state.device_index(id) {
                Some(handle) => handle,
                None => {
                    state.devices.push(id);
                    DeviceId::from_raw(state.devices.len())
                }
            };
            out.push(handle);
        }
        Ok(out)
    }

    fn device_info_string(&self, device: DeviceId, param: DeviceInfo) -> Result<String> {
        let d = Device::new(self.lock()?.device(device)?);
        let value = match param {
            DeviceInfo::Name => d.name(),
            DeviceInfo::Vendor => d.vendor(),
            DeviceInfo::Version => d.version(),
            DeviceInfo::DriverVersion => d.driver_version(),
            DeviceInfo::Extensions => d.extensions(),
            _ => return Err(ClError::driver("clGetDeviceInfo", status::CL_INVALID_VALUE)),
        };
        value.map_err(cl("clGetDeviceInfo"))
    }

    fn device_info_uint(&self, device: DeviceId, param: DeviceInfo) -> Result<u64> {
        let d = Device::new(self.lock()?.device(device)?);
        let value = match param {
            DeviceInfo::MaxComputeUnits => d.max_compute_units().map(u64::from),
            DeviceInfo::MaxWorkGroupSize => d.max_work_group_size().map(|v| v as u64),
            DeviceInfo::GlobalMemSize => d.global_mem_size(),
            DeviceInfo::NonUniformWorkGroupSupport => d.non_uniform_work_group_support().map(u64::from),
            _ => return Err(ClError::driver("clGetDeviceInfo", status::CL_INVALID_VALUE)),
        };
        value.map_err(cl("clGetDeviceInfo"))
    }

    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId> {
        let mut state = self.lock()?;
        let ids = devices.iter().map(|&d| state.device(d)).collect::<Result<Vec<_>>>()?;
        let context = Context::from_devices(&ids, &[], None, ptr::null_mut()).map_err(cl("clCreateContext"))?;
        let id = state.next();
        state.contexts.insert(id, context);
        Ok(ContextId::from_raw(id))
    }

    fn context_devices(&self, context: ContextId) -> Result<Vec<DeviceId>> {
        let state = self.lock()?;
        let ctx = state
            .contexts
            .get(&context.as_raw())
            .ok_or(ClError::driver("clGetContextInfo", status::CL_INVALID_CONTEXT))?;
        Ok(ctx.devices().iter().filter_map(|&id| state.device_index(id)).collect())
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        let mut state = self.lock()?;
        let device = state.device(device)?;
        let ctx = state
            .contexts
            .get(&context.as_raw())
            .ok_or(ClError::driver("clCreateCommandQueue", status::CL_INVALID_CONTEXT))?;
        let queue = CommandQueue::create_command_queue_with_properties(ctx, device, 0, 0)
            .map_err(cl("clCreateCommandQueue"))?;
        let id = state.next();
        state.queues.insert(id, queue);
        Ok(QueueId::from_raw(id))
    }

    fn create_program_with_source(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        let mut state = self.lock()?;
        let ctx = state
            .contexts
            .get(&context.as_raw())
            .ok_or(ClError::driver("clCreateProgramWithSource", status::CL_INVALID_CONTEXT))?;
        let program = Program::create_from_source(ctx, source).map_err(cl("clCreateProgramWithSource"))?;
        let id = state.next();
        state.programs.insert(id, program);
        Ok(ProgramId::from_raw(id))
    }

    fn create_program_with_binary(&self, context: ContextId, device: DeviceId, binary: &[u8]) -> Result<ProgramId> {
        let mut state = self.lock()?;
        let device = state.device(device)?;
        let ctx = state
            .contexts
            .get(&context.as_raw())
            .ok_or(ClError::driver("clCreateProgramWithBinary", status::CL_INVALID_CONTEXT))?;
        // SAFETY: the binary is passed to the driver, which validates it.
        let program = unsafe { Program::create_from_binary(ctx, &[device], &[binary]) }
            .map_err(cl("clCreateProgramWithBinary"))?;
        let id = state.next();
        state.programs.insert(id, program);
        Ok(ProgramId::from_raw(id))
    }

    /// The program is taken out of the table while the driver compiles, so
    /// other calls on this backend do not wait for the build.
    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> Result<()> {
        let (device, mut built) = {
            let mut state = self.lock()?;
            let device = state.device(device)?;
            let built = state
                .programs
                .remove(&program.as_raw())
                .ok_or(ClError::driver("clBuildProgram", status::CL_INVALID_PROGRAM))?;
            (device, built)
        };
        let result = built.build(&[device], options).map_err(cl("clBuildProgram"));
        self.lock()?.programs.insert(program.as_raw(), built);
        result
    }

    fn program_build_log(&self, program: ProgramId, device: DeviceId) -> Result<String> {
        let state = self.lock()?;
        let device = state.device(device)?;
        state
            .programs
            .get(&program.as_raw())
            .ok_or(ClError::driver("clGetProgramBuildInfo", status::CL_INVALID_PROGRAM))?
            .get_build_log(device)
            .map_err(cl("clGetProgramBuildInfo"))
    }

    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>> {
        let state = self.lock()?;
        let binaries = state
            .programs
            .get(&program.as_raw())
            .ok_or(ClError::driver("clGetProgramInfo", status::CL_INVALID_PROGRAM))?
            .get_binaries()
            .map_err(cl("clGetProgramInfo"))?;
        binaries
            .into_iter()
            .next()
            .ok_or(ClError::driver("clGetProgramInfo", status::CL_INVALID_PROGRAM_EXECUTABLE))
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.lock()?;
        let program = state
            .programs
            .get(&program.as_raw())
            .ok_or(ClError::driver("clCreateKernel", status::CL_INVALID_PROGRAM))?;
        let kernel = Kernel::create(program, name).map_err(cl("clCreateKernel"))?;
        let id = state.next();
        state.kernels.insert(id, kernel);
        Ok(KernelId::from_raw(id))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> Result<()> {
        let state = self.lock()?;
        let k = state
            .kernels
            .get(&kernel.as_raw())
            .ok_or(ClError::driver("clSetKernelArg", status::CL_INVALID_KERNEL))?;
        // SAFETY: sizes and pointers describe live host memory for the
        // duration of the call; buffers are looked up under the lock.
        unsafe {
            match arg {
                KernelArg::Buffer(buffer) => {
                    let mem = state
                        .buffers
                        .get(&buffer.as_raw())
                        .ok_or(ClError::driver("clSetKernelArg", status::CL_INVALID_MEM_OBJECT))?
                        .get();
                    k.set_arg(index, &mem)
                }
                KernelArg::Scalar(bytes) => k.set_arg_raw(index, bytes.len(), bytes.as_ptr().cast::<c_void>()),
                KernelArg::Local(size) => k.set_arg_local_buffer(index, *size),
            }
        }
        .map_err(cl("clSetKernelArg"))
    }

    fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize> {
        let state = self.lock()?;
        let device = state.device(device)?;
        state
            .kernels
            .get(&kernel.as_raw())
            .ok_or(ClError::driver("clGetKernelWorkGroupInfo", status::CL_INVALID_KERNEL))?
            .get_work_group_size(device)
            .map_err(cl("clGetKernelWorkGroupInfo"))
    }

    fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<()> {
        const CALL: &str = "clEnqueueNDRangeKernel";
        let state = self.lock()?;
        let q = state.queues.get(&queue.as_raw()).ok_or(ClError::driver(CALL, status::CL_INVALID_COMMAND_QUEUE))?;
        let k = state.kernels.get(&kernel.as_raw()).ok_or(ClError::driver(CALL, status::CL_INVALID_KERNEL))?;
        let local_ptr = local.map_or(ptr::null(), <[usize]>::as_ptr);
        // SAFETY: `global` and `local` outlive the call and hold
        // `global.len()` entries each.
        unsafe {
            q.enqueue_nd_range_kernel(k.get(), global.len() as u32, ptr::null(), global.as_ptr(), local_ptr, &[])
        }
        .map(drop)
        .map_err(cl(CALL))
    }

    fn create_buffer(&self, context: ContextId, size: usize) -> Result<BufferId> {
        let mut state = self.lock()?;
        let ctx = state
            .contexts
            .get(&context.as_raw())
            .ok_or(ClError::driver("clCreateBuffer", status::CL_INVALID_CONTEXT))?;
        // SAFETY: no host pointer is supplied.
        let buffer = unsafe { Buffer::<u8>::create(ctx, CL_MEM_READ_WRITE, size, ptr::null_mut()) }
            .map_err(cl("clCreateBuffer"))?;
        let id = state.next();
        state.buffers.insert(id, buffer);
        Ok(BufferId::from_raw(id))
    }

    fn write_buffer(&self, queue: QueueId, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        const CALL: &str = "clEnqueueWriteBuffer";
        let mut state = self.lock()?;
        let State { queues, buffers, .. } = &mut *state;
        let q = queues.get(&queue.as_raw()).ok_or(ClError::driver(CALL, status::CL_INVALID_COMMAND_QUEUE))?;
        let b = buffers.get_mut(&buffer.as_raw()).ok_or(ClError::driver(CALL, status::CL_INVALID_MEM_OBJECT))?;
        // SAFETY: blocking write; `data` outlives the call.
        unsafe { q.enqueue_write_buffer(b, CL_BLOCKING, offset, data, &[]) }.map(drop).map_err(cl(CALL))
    }

    fn read_buffer(&self, queue: QueueId, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        const CALL: &str = "clEnqueueReadBuffer";
        let state = self.lock()?;
        let q = state.queues.get(&queue.as_raw()).ok_or(ClError::driver(CALL, status::CL_INVALID_COMMAND_QUEUE))?;
        let b = state.buffers.get(&buffer.as_raw()).ok_or(ClError::driver(CALL, status::CL_INVALID_MEM_OBJECT))?;
        // SAFETY: blocking read; `out` outlives the call.
        unsafe { q.enqueue_read_buffer(b, CL_BLOCKING, offset, out, &[]) }.map(drop).map_err(cl(CALL))
    }

    fn flush(&self, queue: QueueId) -> Result<()> {
        let state = self.lock()?;
        let q = state
            .queues
            .get(&queue.as_raw())
            .ok_or(ClError::driver("clFlush", status::CL_INVALID_COMMAND_QUEUE))?;
        q.flush().map_err(cl("clFlush"))
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        let state = self.lock()?;
        let q = state
            .queues
            .get(&queue.as_raw())
            .ok_or(ClError::driver("clFinish", status::CL_INVALID_COMMAND_QUEUE))?;
        q.finish().map_err(cl("clFinish"))
    }

    fn release(&self, object: ClObject) -> Result<()> {
        let mut state = self.lock()?;
        // Dropping the opencl3 wrapper releases the driver object.
        let removed = match object {
            ClObject::Context(id) => state.contexts.remove(&id.as_raw()).is_some(),
            ClObject::Queue(id) => state.queues.remove(&id.as_raw()).is_some(),
            ClObject::Program(id) => state.programs.remove(&id.as_raw()).is_some(),
            ClObject::Kernel(id) => state.kernels.remove(&id.as_raw()).is_some(),
            ClObject::Buffer(id) => state.buffers.remove(&id.as_raw()).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(ClError::driver("clRelease", status::CL_INVALID_VALUE))
        }
    }
}
