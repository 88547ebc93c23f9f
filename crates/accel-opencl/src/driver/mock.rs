//! Deterministic in-memory OpenCL backend for tests and development.
//!
//! [`MockBackend`] behaves like a single-platform driver:
//! - programs build successfully unless their source contains an `#error`
//!   line, in which case the build fails and the line becomes the log
//! - kernels resolve when the source declares `__kernel void <name>(`
//! - program binaries round-trip through [`MOCK_BINARY_MAGIC`]
//! - every dispatch is recorded and can be inspected with
//!   [`MockBackend::dispatches`]
//!
//! Builds are counted so tests can assert on compilation reuse.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{
    BufferId, ClBackend, ClObject, ContextId, DeviceId, DeviceInfo, EntryPoint, KernelArg,
    KernelId, PlatformId, ProgramId, QueueId, SymbolTable,
};
use crate::error::{ClError, Result, status};

/// Prefix of every binary produced by [`MockBackend`].
pub const MOCK_BINARY_MAGIC: &[u8] = b"MOCKCL\0";

const PLATFORM: PlatformId = PlatformId::from_raw(1);

// ── MockDevice ───────────────────────────────────────────────────────────────

/// Properties reported by a mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub driver_version: String,
    pub extensions: Vec<String>,
    pub compute_units: u32,
    pub max_work_group_size: usize,
    pub global_memory_bytes: u64,
    pub non_uniform_work_group: bool,
}

impl MockDevice {
    /// A Valhall-class GPU on an OpenCL 3.0 driver with a DDK version.
    pub fn mali_g77() -> Self {
        Self {
            name: "Mali-G77".into(),
            vendor: "ARM".into(),
            version: "OpenCL 3.0 v1.r38p1-01eac0.2819f9d4dbe0b5cb".into(),
            driver_version: "3.0".into(),
            extensions: [
                "cl_khr_fp16",
                "cl_khr_int64_base_atomics",
                "cl_arm_integer_dot_product_int8",
                "cl_arm_integer_dot_product_accumulate_int8",
                "cl_arm_non_uniform_work_group_size",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            compute_units: 9,
            max_work_group_size: 512,
            global_memory_bytes: 4 * 1024 * 1024 * 1024,
            non_uniform_work_group: true,
        }
    }

    /// A Midgard-class GPU on an OpenCL 1.2 driver.
    pub fn mali_t760() -> Self {
        Self {
            name: "Mali-T760".into(),
            vendor: "ARM".into(),
            version: "OpenCL 1.2 v1.r20p0-01rel0.2a1a2a3a4a5a6a7a".into(),
            driver_version: "1.2".into(),
            extensions: ["cl_khr_fp16", "cl_arm_non_uniform_work_group_size"]
                .into_iter()
                .map(String::from)
                .collect(),
            compute_units: 4,
            max_work_group_size: 256,
            global_memory_bytes: 2 * 1024 * 1024 * 1024,
            non_uniform_work_group: false,
        }
    }

    /// A non-Mali OpenCL 3.0 device without a DDK version string.
    pub fn generic(name: &str) -> Self {
        Self {
            name: name.into(),
            vendor: "MockVendor".into(),
            version: "OpenCL 3.0".into(),
            driver_version: "1.0.0-mock".into(),
            extensions: Vec::new(),
            compute_units: 32,
            max_work_group_size: 1024,
            global_memory_bytes: 8 * 1024 * 1024 * 1024,
            non_uniform_work_group: true,
        }
    }
}

// ── Recorded state ───────────────────────────────────────────────────────────

/// One recorded `clEnqueueNDRangeKernel` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub kernel: String,
    pub global: Vec<usize>,
    pub local: Option<Vec<usize>>,
    /// Arguments bound at enqueue time, by index.
    pub args: BTreeMap<u32, KernelArg>,
}

#[derive(Debug)]
struct MockProgram {
    source: String,
    device: Option<DeviceId>,
    built_with: Option<String>,
    log: String,
}

#[derive(Debug)]
struct MockKernel {
    name: String,
    args: BTreeMap<u32, KernelArg>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: usize,
    contexts: HashMap<ContextId, Vec<DeviceId>>,
    queues: HashMap<QueueId, DeviceId>,
    programs: HashMap<ProgramId, MockProgram>,
    kernels: HashMap<KernelId, MockKernel>,
    buffers: HashMap<BufferId, Vec<u8>>,
    dispatches: Vec<Dispatch>,
}

impl MockState {
    fn next(&mut self) -> usize {
        self.next_id += 1;
        1000 + self.next_id
    }
}

// ── MockBackend ──────────────────────────────────────────────────────────────

/// In-memory [`ClBackend`].
#[derive(Debug)]
pub struct MockBackend {
    devices: Vec<MockDevice>,
    symbols: SymbolTable,
    build_delay: Option<Duration>,
    builds: AtomicUsize,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            symbols: SymbolTable::complete(),
            build_delay: None,
            builds: AtomicUsize::new(0),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn single(device: MockDevice) -> Self {
        Self::new(vec![device])
    }

    /// Pretend the listed entry points failed to resolve.
    #[must_use]
    pub fn without_symbols(mut self, missing: &[EntryPoint]) -> Self {
        self.symbols = self.symbols.without(missing);
        self
    }

    /// Make every build take at least `delay`, to widen race windows.
    #[must_use]
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Number of `clBuildProgram` calls that reached the backend.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.lock().map(|s| s.dispatches.clone()).unwrap_or_default()
    }

    /// Programs, kernels, buffers, queues and contexts not yet released.
    pub fn live_objects(&self) -> usize {
        self.lock()
            .map(|s| {
                s.programs.len() + s.kernels.len() + s.buffers.len() + s.queues.len() + s.contexts.len()
            })
            .unwrap_or_default()
    }

    pub fn device_id(index: usize) -> DeviceId {
        DeviceId::from_raw(index + 1)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state.lock().map_err(|e| ClError::poisoned(e, "mock backend state"))
    }

    fn device(&self, device: DeviceId) -> Result<&MockDevice> {
        device
            .as_raw()
            .checked_sub(1)
            .and_then(|index| self.devices.get(index))
            .ok_or(ClError::driver("clGetDeviceInfo", status::CL_INVALID_DEVICE))
    }
}

/// Names of the `__kernel` functions declared in `source`.
fn declared_kernels(source: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("__kernel") {
        rest = &rest[pos + "__kernel".len()..];
        let after_void = rest.trim_start().strip_prefix("void").map(str::trim_start);
        if let Some(decl) = after_void {
            let end = decl.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(decl.len());
            if end > 0 && decl[end..].trim_start().starts_with('(') {
                names.push(&decl[..end]);
            }
        }
    }
    names
}

impl ClBackend for MockBackend {
    fn resolved_symbols(&self) -> SymbolTable {
        self.symbols.clone()
    }

    fn platforms(&self) -> Result<Vec<PlatformId>> {
        Ok(vec![PLATFORM])
    }

    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceId>> {
        if platform != PLATFORM || self.devices.is_empty() {
            return Err(ClError::driver("clGetDeviceIDs", status::CL_DEVICE_NOT_FOUND));
        }
        Ok((0..self.devices.len()).map(Self::device_id).collect())
    }

    fn device_info_string(&self, device: DeviceId, param: DeviceInfo) -> Result<String> {
        let d = self.device(device)?;
        match param {
            DeviceInfo::Name => Ok(d.name.clone()),
            DeviceInfo::Vendor => Ok(d.vendor.clone()),
            DeviceInfo::Version => Ok(d.version.clone()),
            DeviceInfo::DriverVersion => Ok(d.driver_version.clone()),
            DeviceInfo::Extensions => Ok(d.extensions.join(" ")),
            _ => Err(ClError::driver("clGetDeviceInfo", status::CL_INVALID_VALUE)),
        }
    }

    fn device_info_uint(&self, device: DeviceId, param: DeviceInfo) -> Result<u64> {
        let d = self.device(device)?;
        match param {
            DeviceInfo::MaxComputeUnits => Ok(u64::from(d.compute_units)),
            DeviceInfo::MaxWorkGroupSize => Ok(d.max_work_group_size as u64),
            DeviceInfo::GlobalMemSize => Ok(d.global_memory_bytes),
            DeviceInfo::NonUniformWorkGroupSupport => Ok(u64::from(d.non_uniform_work_group)),
            _ => Err(ClError::driver("clGetDeviceInfo", status::CL_INVALID_VALUE)),
        }
    }

    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId> {
        if devices.is_empty() {
            return Err(ClError::driver("clCreateContext", status::CL_INVALID_VALUE));
        }
        for &device in devices {
            self.device(device)?;
        }
        let mut state = self.lock()?;
        let id = ContextId::from_raw(state.next());
        state.contexts.insert(id, devices.to_vec());
        Ok(id)
    }

    fn context_devices(&self, context: ContextId) -> Result<Vec<DeviceId>> {
        self.lock()?
            .contexts
            .get(&context)
            .cloned()
            .ok_or(ClError::driver("clGetContextInfo", status::CL_INVALID_CONTEXT))
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        let mut state = self.lock()?;
        let devices = state
            .contexts
            .get(&context)
            .ok_or(ClError::driver("clCreateCommandQueue", status::CL_INVALID_CONTEXT))?;
        if !devices.contains(&device) {
            return Err(ClError::driver("clCreateCommandQueue", status::CL_INVALID_DEVICE));
        }
        let id = QueueId::from_raw(state.next());
        state.queues.insert(id, device);
        Ok(id)
    }

    fn create_program_with_source(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        let mut state = self.lock()?;
        if !state.contexts.contains_key(&context) {
            return Err(ClError::driver("clCreateProgramWithSource", status::CL_INVALID_CONTEXT));
        }
        let id = ProgramId::from_raw(state.next());
        let program = MockProgram { source: source.to_owned(), device: None, built_with: None, log: String::new() };
        state.programs.insert(id, program);
        Ok(id)
    }

    fn create_program_with_binary(
        &self,
        context: ContextId,
        device: DeviceId,
        binary: &[u8],
    ) -> Result<ProgramId> {
        let source = binary
            .strip_prefix(MOCK_BINARY_MAGIC)
            .and_then(|body| std::str::from_utf8(body).ok())
            .ok_or(ClError::driver("clCreateProgramWithBinary", status::CL_INVALID_BINARY))?;
        let mut state = self.lock()?;
        if !state.contexts.get(&context).is_some_and(|devices| devices.contains(&device)) {
            return Err(ClError::driver("clCreateProgramWithBinary", status::CL_INVALID_DEVICE));
        }
        let id = ProgramId::from_raw(state.next());
        let program =
            MockProgram { source: source.to_owned(), device: Some(device), built_with: None, log: String::new() };
        state.programs.insert(id, program);
        Ok(id)
    }

    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> Result<()> {
        self.device(device)?;
        if let Some(delay) = self.build_delay {
            std::thread::sleep(delay);
        }
        self.builds.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock()?;
        let entry = state
            .programs
            .get_mut(&program)
            .ok_or(ClError::driver("clBuildProgram", status::CL_INVALID_PROGRAM))?;
        if entry.device.is_some_and(|bound| bound != device) {
            return Err(ClError::driver("clBuildProgram", status::CL_INVALID_DEVICE));
        }

        let errors: Vec<String> = entry
            .source
            .lines()
            .enumerate()
            .filter_map(|(line, text)| {
                text.trim_start()
                    .strip_prefix("#error")
                    .map(|msg| format!("<source>:{}: error: {}", line + 1, msg.trim()))
            })
            .collect();
        if !errors.is_empty() {
            entry.log = errors.join("\n");
            entry.built_with = None;
            return Err(ClError::driver("clBuildProgram", status::CL_BUILD_PROGRAM_FAILURE));
        }

        entry.log.clear();
        entry.device = Some(device);
        entry.built_with = Some(options.to_owned());
        Ok(())
    }

    fn program_build_log(&self, program: ProgramId, _device: DeviceId) -> Result<String> {
        self.lock()?
            .programs
            .get(&program)
            .map(|p| p.log.clone())
            .ok_or(ClError::driver("clGetProgramBuildInfo", status::CL_INVALID_PROGRAM))
    }

    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>> {
        let state = self.lock()?;
        let entry = state
            .programs
            .get(&program)
            .ok_or(ClError::driver("clGetProgramInfo", status::CL_INVALID_PROGRAM))?;
        if entry.built_with.is_none() {
            return Err(ClError::driver("clGetProgramInfo", status::CL_INVALID_PROGRAM_EXECUTABLE));
        }
        let mut binary = MOCK_BINARY_MAGIC.to_vec();
        binary.extend_from_slice(entry.source.as_bytes());
        Ok(binary)
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.lock()?;
        let entry = state
            .programs
            .get(&program)
            .ok_or(ClError::driver("clCreateKernel", status::CL_INVALID_PROGRAM))?;
        if entry.built_with.is_none() {
            return Err(ClError::driver("clCreateKernel", status::CL_INVALID_PROGRAM_EXECUTABLE));
        }
        if !declared_kernels(&entry.source).contains(&name) {
            return Err(ClError::driver("clCreateKernel", status::CL_INVALID_KERNEL_NAME));
        }
        let id = KernelId::from_raw(state.next());
        state.kernels.insert(id, MockKernel { name: name.to_owned(), args: BTreeMap::new() });
        Ok(id)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> Result<()> {
        let mut state = self.lock()?;
        if let KernelArg::Buffer(buffer) = arg {
            if !state.buffers.contains_key(buffer) {
                return Err(ClError::driver("clSetKernelArg", status::CL_INVALID_MEM_OBJECT));
            }
        }
        let entry = state
            .kernels
            .get_mut(&kernel)
            .ok_or(ClError::driver("clSetKernelArg", status::CL_INVALID_KERNEL))?;
        entry.args.insert(index, arg.clone());
        Ok(())
    }

    fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize> {
        if !self.lock()?.kernels.contains_key(&kernel) {
            return Err(ClError::driver("clGetKernelWorkGroupInfo", status::CL_INVALID_KERNEL));
        }
        Ok(self.device(device)?.max_work_group_size)
    }

    fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<()> {
        const CALL: &str = "clEnqueueNDRangeKernel";
        let mut state = self.lock()?;
        let device = *state.queues.get(&queue).ok_or(ClError::driver(CALL, status::CL_INVALID_COMMAND_QUEUE))?;
        if global.is_empty() || global.contains(&0) {
            return Err(ClError::driver(CALL, status::CL_INVALID_GLOBAL_WORK_SIZE));
        }
        if let Some(local) = local {
            let max = self.device(device)?.max_work_group_size;
            if local.len() != global.len() || local.iter().product::<usize>() > max {
                return Err(ClError::driver(CALL, status::CL_INVALID_WORK_GROUP_SIZE));
            }
        }
        let entry = state.kernels.get(&kernel).ok_or(ClError::driver(CALL, status::CL_INVALID_KERNEL))?;
        let dispatch = Dispatch {
            kernel: entry.name.clone(),
            global: global.to_vec(),
            local: local.map(<[usize]>::to_vec),
            args: entry.args.clone(),
        };
        state.dispatches.push(dispatch);
        Ok(())
    }

    fn create_buffer(&self, context: ContextId, size: usize) -> Result<BufferId> {
        const CALL: &str = "clCreateBuffer";
        if size == 0 {
            return Err(ClError::driver(CALL, status::CL_INVALID_BUFFER_SIZE));
        }
        let mut state = self.lock()?;
        let devices = state.contexts.get(&context).ok_or(ClError::driver(CALL, status::CL_INVALID_CONTEXT))?;
        let limit = devices
            .iter()
            .filter_map(|&d| self.device(d).ok())
            .map(|d| d.global_memory_bytes)
            .min()
            .unwrap_or(0);
        if size as u64 > limit {
            return Err(ClError::driver(CALL, status::CL_MEM_OBJECT_ALLOCATION_FAILURE));
        }
        let id = BufferId::from_raw(state.next());
        state.buffers.insert(id, vec![0; size]);
        Ok(id)
    }

    fn write_buffer(&self, queue: QueueId, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        const CALL: &str = "clEnqueueWriteBuffer";
        let mut state = self.lock()?;
        if !state.queues.contains_key(&queue) {
            return Err(ClError::driver(CALL, status::CL_INVALID_COMMAND_QUEUE));
        }
        let storage = state.buffers.get_mut(&buffer).ok_or(ClError::driver(CALL, status::CL_INVALID_MEM_OBJECT))?;
        let target = offset
            .checked_add(data.len())
            .and_then(|end| storage.get_mut(offset..end))
            .ok_or(ClError::driver(CALL, status::CL_INVALID_VALUE))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, queue: QueueId, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        const CALL: &str = "clEnqueueReadBuffer";
        let state = self.lock()?;
        if !state.queues.contains_key(&queue) {
            return Err(ClError::driver(CALL, status::CL_INVALID_COMMAND_QUEUE));
        }
        let storage = state.buffers.get(&buffer).ok_or(ClError::driver(CALL, status::CL_INVALID_MEM_OBJECT))?;
        let source = offset
            .checked_add(out.len())
            .and_then(|end| storage.get(offset..end))
            .ok_or(ClError::driver(CALL, status::CL_INVALID_VALUE))?;
        out.copy_from_slice(source);
        Ok(())
    }

    fn flush(&self, queue: QueueId) -> Result<()> {
        if self.lock()?.queues.contains_key(&queue) {
            Ok(())
        } else {
            Err(ClError::driver("clFlush", status::CL_INVALID_COMMAND_QUEUE))
        }
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        if self.lock()?.queues.contains_key(&queue) {
            Ok(())
        } else {
            Err(ClError::driver("clFinish", status::CL_INVALID_COMMAND_QUEUE))
        }
    }

    fn release(&self, object: ClObject) -> Result<()> {
        let mut state = self.lock()?;
        let removed = match object {
            ClObject::Context(id) => state.contexts.remove(&id).is_some(),
            ClObject::Queue(id) => state.queues.remove(&id).is_some(),
            ClObject::Program(id) => state.programs.remove(&id).is_some(),
            ClObject::Kernel(id) => state.kernels.remove(&id).is_some(),
            ClObject::Buffer(id) => state.buffers.remove(&id).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(ClError::driver("clRelease", status::CL_INVALID_VALUE))
        }
    }
}
