//! Kernel compilation façade.
//!
//! [`CompileContext`] binds a device and a context, derives the
//! device-dependent build options, and turns a kernel request into a
//! [`KernelHandle`] through the shared [`ProgramStore`].
//!
//! Binding is the only mutation: [`CompileContext::set_device`] and
//! [`CompileContext::set_context`]. Everything else takes `&self`, so a
//! bound context can be shared between configuring threads.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::build_options::BuildOptions;
use crate::device_capabilities::{DeviceCapabilities, GpuArch};
use crate::driver::{ContextId, DeviceId, Driver};
use crate::error::{ClError, ConfigurationError, Result};
use crate::kernel::{KernelHandle, NdRange};
use crate::kernel_cache::CachedProgram;
use crate::program_store::{ProgramPayload, ProgramStore};

/// Program payload passed to [`CompileContext::create_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramSource<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

impl ProgramSource<'_> {
    fn to_payload(self) -> ProgramPayload {
        match self {
            Self::Text(text) => ProgramPayload::Source(text.to_owned()),
            Self::Binary(bytes) => ProgramPayload::Binary(bytes.to_vec()),
        }
    }
}

#[derive(Debug)]
pub struct CompileContext {
    driver: Driver,
    context: Option<ContextId>,
    capabilities: Option<DeviceCapabilities>,
    include_path: Option<String>,
    store: ProgramStore,
}

impl CompileContext {
    /// An unbound context with an empty program store.
    pub fn new(driver: Driver) -> Self {
        let store = ProgramStore::new(driver.clone());
        Self { driver, context: None, capabilities: None, include_path: None, store }
    }

    /// A context bound to `context` and `device`.
    pub fn bound(driver: Driver, context: ContextId, device: DeviceId) -> Result<Self> {
        let mut ctx = Self::new(driver);
        ctx.set_device(device)?;
        ctx.set_context(context)?;
        Ok(ctx)
    }

    pub const fn driver(&self) -> &Driver {
        &self.driver
    }

    pub const fn context(&self) -> Option<ContextId> {
        self.context
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.capabilities.as_ref().map(DeviceCapabilities::device)
    }

    pub const fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.capabilities.as_ref()
    }

    pub const fn program_store(&self) -> &ProgramStore {
        &self.store
    }

    pub fn include_path(&self) -> Option<&str> {
        self.include_path.as_deref()
    }

    /// Header directory used when a request does not name one.
    pub fn set_include_path(&mut self, path: Option<&str>) {
        self.include_path = path.filter(|p| !p.is_empty()).map(str::to_owned);
    }

    /// Bind `device` and re-query its capabilities.
    ///
    /// Switching to a different device clears the program store.
    pub fn set_device(&mut self, device: DeviceId) -> Result<()> {
        let capabilities = DeviceCapabilities::query(&self.driver, device)?;
        if self.device().is_some_and(|previous| previous != device) {
            self.store.clear()?;
        }
        info!(device = %capabilities, "bound OpenCL device");
        self.capabilities = Some(capabilities);
        Ok(())
    }

    /// Bind `context`. The first device of the context is bound unless the
    /// current device already belongs to it.
    pub fn set_context(&mut self, context: ContextId) -> Result<()> {
        let devices = self.driver.context_devices(context)?;
        self.context = Some(context);
        match (self.device(), devices.first()) {
            (Some(current), _) if devices.contains(&current) => Ok(()),
            (_, Some(&first)) => self.set_device(first),
            (_, None) => Err(ClError::NoDeviceBound),
        }
    }

    fn binding(&self) -> Result<(ContextId, &DeviceCapabilities)> {
        match (self.context, self.capabilities.as_ref()) {
            (Some(context), Some(caps)) => Ok((context, caps)),
            _ => Err(ClError::NoDeviceBound),
        }
    }

    /// `false` until a device is bound.
    pub fn supports_extension(&self, name: &str) -> bool {
        self.capabilities.as_ref().is_some_and(|caps| caps.supports_extension(name))
    }

    /// Options every kernel on the bound device is built with.
    ///
    /// Fails when the device cannot run non-uniform work-groups.
    pub fn generate_build_options(&self) -> Result<BuildOptions> {
        let caps = self.capabilities.as_ref().ok_or(ClError::NoDeviceBound)?;
        let non_uniform = caps
            .non_uniform_work_group_option()
            .ok_or(ConfigurationError::MissingCapability { capability: "non-uniform work-group size" })?;

        let mut options = BuildOptions::new();
        options.add(non_uniform);
        options.add(format!("-DGPU_ARCH={}", caps.target_architecture().code()));
        options.add_if(caps.fp16_supported(), "-DACCEL_OPENCL_FP16_ENABLED=1");
        options.add_if(caps.dot8_supported(), "-DACCEL_OPENCL_DOT8_ENABLED=1");
        options.add_if(caps.dot8_acc_supported(), "-DACCEL_OPENCL_DOT8_ACC_ENABLED=1");
        options.add_if(caps.int64_base_atomics_supported(), "-DACCEL_OPENCL_INT64_BASE_ATOMICS_ENABLED=1");
        options.add_if(caps.unroll_with_pragma(), "-DUNROLL_WITH_PRAGMA");
        Ok(options)
    }

    /// Compile (or reuse) `program_name` with the device options plus
    /// `options`, and resolve `kernel_name` from it.
    ///
    /// `include_path` falls back to the context's own include path.
    pub fn create_kernel(
        &self,
        kernel_name: &str,
        program_name: &str,
        source: ProgramSource<'_>,
        include_path: Option<&str>,
        options: &BuildOptions,
    ) -> Result<KernelHandle> {
        let mut all = self.generate_build_options()?;
        let (context, caps) = self.binding()?;
        all.add_all(options);
        let canonical = all.canonical_string(include_path.or(self.include_path.as_deref()));

        self.store.load_program(program_name, source.to_payload())?;
        let program = self.store.build(context, caps.device(), program_name, &canonical)?;
        KernelHandle::create(&self.driver, program, kernel_name)
    }

    /// Preferred local size, or `None` to let the driver choose.
    pub fn default_dispatch_granularity(&self) -> Option<NdRange> {
        match self.capabilities.as_ref()?.target_architecture() {
            GpuArch::Midgard => Some(NdRange::d2(128, 1)),
            _ => None,
        }
    }

    pub fn max_local_workgroup_size(&self, kernel: &KernelHandle) -> usize {
        kernel.max_work_group_size()
    }

    /// Compute units of the bound device, `0` when unbound.
    pub fn compute_unit_count(&self) -> u32 {
        self.capabilities.as_ref().map_or(0, DeviceCapabilities::compute_unit_count)
    }

    /// Install persisted binaries under their composite keys.
    ///
    /// Entries that fail to load are skipped. Returns how many were
    /// restored.
    pub fn restore_programs(&self, programs: &BTreeMap<String, CachedProgram>) -> Result<usize> {
        let (context, caps) = self.binding()?;
        let mut restored = 0;
        for (key, cached) in programs {
            match self.store.add_built_program(
                context,
                caps.device(),
                &cached.program_name,
                &cached.options,
                &cached.source_hash,
                &cached.binary,
            ) {
                Ok(_) => restored += 1,
                Err(err) => warn!(%key, %err, "skipping persisted program"),
            }
        }
        debug!(restored, total = programs.len(), "restored persisted programs");
        Ok(restored)
    }
}
