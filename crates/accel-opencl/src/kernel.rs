//! Dispatch-ready kernel handles.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::driver::{ClObject, DeviceId, Driver, KernelArg, KernelId};
use crate::error::Result;
use crate::program_store::CompiledProgram;
use crate::runtime::{ClBuffer, CommandQueue};

/// A 1- to 3-dimensional work size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    sizes: [usize; 3],
    rank: usize,
}

impl NdRange {
    pub const fn d1(x: usize) -> Self {
        Self { sizes: [x, 1, 1], rank: 1 }
    }

    pub const fn d2(x: usize, y: usize) -> Self {
        Self { sizes: [x, y, 1], rank: 2 }
    }

    pub const fn d3(x: usize, y: usize, z: usize) -> Self {
        Self { sizes: [x, y, z], rank: 3 }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.sizes[..self.rank]
    }

    pub const fn rank(&self) -> usize {
        self.rank
    }

    pub fn total(&self) -> usize {
        self.as_slice().iter().product()
    }

    /// Same sizes viewed at `rank`, padding with 1s.
    #[must_use]
    pub const fn with_rank(mut self, rank: usize) -> Self {
        let mut d = self.rank;
        while d < 3 {
            self.sizes[d] = 1;
            d += 1;
        }
        self.rank = if rank == 0 { 1 } else if rank > 3 { 3 } else { rank };
        self
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_slice())
    }
}

/// Scalar types that can be passed by value to a kernel.
pub trait KernelScalar: Copy {
    fn to_arg_bytes(self) -> Vec<u8>;
}

macro_rules! kernel_scalar {
    ($($t:ty),*) => {
        $(impl KernelScalar for $t {
            fn to_arg_bytes(self) -> Vec<u8> {
                self.to_ne_bytes().to_vec()
            }
        })*
    };
}

kernel_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32);

/// A kernel entry point resolved from a compiled program.
///
/// Arguments are set immediately before each enqueue. A handle is driven
/// by one thread at a time.
#[derive(Debug)]
pub struct KernelHandle {
    id: KernelId,
    name: String,
    program: Arc<CompiledProgram>,
    max_work_group_size: usize,
    driver: Driver,
}

impl KernelHandle {
    pub(crate) fn create(driver: &Driver, program: Arc<CompiledProgram>, name: &str) -> Result<Self> {
        let id = driver.create_kernel(program.id(), name)?;
        let max_work_group_size = match driver.kernel_work_group_size(id, program.device()) {
            Ok(size) => size,
            Err(err) => {
                driver.release_quietly(ClObject::Kernel(id));
                return Err(err);
            }
        };
        debug!(kernel = name, program = program.key(), max_work_group_size, "created kernel");
        Ok(Self { id, name: name.to_owned(), program, max_work_group_size, driver: driver.clone() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn id(&self) -> KernelId {
        self.id
    }

    pub fn program(&self) -> &CompiledProgram {
        &self.program
    }

    pub fn device(&self) -> DeviceId {
        self.program.device()
    }

    /// Largest work-group this kernel can be launched with on its device.
    pub const fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    pub fn set_scalar_argument<T: KernelScalar>(&mut self, index: u32, value: T) -> Result<()> {
        self.driver.set_kernel_arg(self.id, index, &KernelArg::Scalar(value.to_arg_bytes()))
    }

    pub fn set_buffer_argument(&mut self, index: u32, buffer: &ClBuffer) -> Result<()> {
        self.driver.set_kernel_arg(self.id, index, &KernelArg::Buffer(buffer.id()))
    }

    /// Reserve `bytes` of `__local` memory for argument `index`.
    pub fn set_local_argument(&mut self, index: u32, bytes: usize) -> Result<()> {
        self.driver.set_kernel_arg(self.id, index, &KernelArg::Local(bytes))
    }

    /// The local size actually used for `global` given `hint`.
    ///
    /// A hint larger than the kernel's work-group limit, larger than the
    /// global size in any dimension, or of a different rank is dropped and
    /// the driver picks the local size.
    pub fn effective_local_size(&self, global: NdRange, hint: Option<NdRange>) -> Option<NdRange> {
        let hint = hint?;
        let fits = hint.rank() == global.rank()
            && hint.total() <= self.max_work_group_size
            && hint.as_slice().iter().zip(global.as_slice()).all(|(l, g)| *l > 0 && l <= g);
        if !fits {
            trace!(kernel = %self.name, %global, %hint, "dropping local size hint");
        }
        fits.then_some(hint)
    }

    pub fn enqueue(&self, queue: &CommandQueue, global: NdRange, local_hint: Option<NdRange>) -> Result<()> {
        let local = self.effective_local_size(global, local_hint);
        self.driver.enqueue_nd_range(
            queue.id(),
            self.id,
            global.as_slice(),
            local.as_ref().map(NdRange::as_slice),
        )
    }
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        self.driver.release_quietly(ClObject::Kernel(self.id));
    }
}
