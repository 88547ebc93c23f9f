//! Generic configure/run driver for window-dispatched kernels.
//!
//! A kernel is described by a [`KernelDescriptor`]: which program and entry
//! point to use, which build options and steps to request, and how much of
//! each operand one work-item touches. [`configure`] turns a descriptor
//! plus operand metadata into a [`ConfiguredKernel`]; the compiled handle
//! is created last, so a failed configure never leaves a usable handle
//! behind. [`ConfiguredKernel::run`] slices the window and dispatches one
//! enqueue per slice.

use accel_window::{
    AccessPattern, AccessWindow, BorderSize, Coordinates, MAX_DIMS, PaddingSnapshot, Steps, TensorInfo,
    Window, WindowError, calculate_max_window, update_window_and_padding,
};
use tracing::{debug, trace};

use crate::build_options::BuildOptions;
use crate::compile_context::{CompileContext, ProgramSource};
use crate::device_capabilities::DeviceCapabilities;
use crate::error::{ClError, ConfigurationError, Result};
use crate::kernel::{KernelHandle, NdRange};
use crate::runtime::{ClTensor, CommandQueue};

/// Program a descriptor's kernel lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramDefinition {
    pub name: &'static str,
    pub source: &'static str,
}

/// A by-value kernel argument appended after the tensor arguments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarArgument {
    U32(u32),
    I32(i32),
    F32(f32),
}

/// Data-driven description of one kernel family.
///
/// Operands are passed in kernel-argument order. Unless
/// [`output_index`](KernelDescriptor::output_index) says otherwise the
/// last operand is the output.
pub trait KernelDescriptor {
    fn program(&self) -> ProgramDefinition;

    fn kernel_name(&self, operands: &[&TensorInfo]) -> String;

    /// Reject unsupported operand combinations.
    fn validate(&self, operands: &[&TensorInfo]) -> Result<()>;

    /// Elements processed per work-item, per dimension.
    fn steps(&self, operands: &[&TensorInfo], caps: &DeviceCapabilities) -> Steps;

    fn build_options(&self, operands: &[&TensorInfo], steps: &Steps, caps: &DeviceCapabilities) -> BuildOptions;

    /// Access pattern of each operand, `None` for operands that are not
    /// accessed through the window.
    fn footprints(&self, operands: &[&TensorInfo], steps: &Steps) -> Vec<Option<AccessPattern>>;

    fn border(&self) -> BorderSize {
        BorderSize::default()
    }

    fn border_undefined(&self) -> bool {
        true
    }

    fn output_index(&self, operands: &[&TensorInfo]) -> usize {
        operands.len().saturating_sub(1)
    }

    /// Number of leading window dimensions mapped onto the ND-range.
    fn dispatch_rank(&self) -> usize {
        3
    }

    fn scalar_arguments(&self) -> Vec<ScalarArgument> {
        Vec::new()
    }

    fn lws_hint(&self) -> Option<NdRange> {
        None
    }
}

/// Global work size covering the first `rank` dimensions of `window`, or
/// `None` when the window is empty.
pub fn gws_from_window(window: &Window, rank: usize) -> Option<NdRange> {
    let iterations: Vec<usize> = (0..rank.clamp(1, 3)).map(|d| window.num_iterations(d)).collect();
    if iterations.contains(&0) {
        return None;
    }
    Some(match iterations.as_slice() {
        [x] => NdRange::d1(*x),
        [x, y] => NdRange::d2(*x, *y),
        [x, y, z, ..] => NdRange::d3(*x, *y, *z),
        [] => return None,
    })
}

/// Validate operands, negotiate the window and padding, and compile.
///
/// Steps run in order: validate, snapshot padding, compute the maximum
/// window on the output, reconcile it with every footprint, record the
/// output's valid region, check that no padding shrank, compile. A window
/// that had to shrink to fit a locked operand fails with
/// [`ConfigurationError::InsufficientPadding`].
pub fn configure<D: KernelDescriptor>(
    ctx: &CompileContext,
    include_path: Option<&str>,
    descriptor: D,
    operands: &mut [&mut TensorInfo],
) -> Result<ConfiguredKernel<D>> {
    let caps = ctx.capabilities().ok_or(ClError::NoDeviceBound)?;

    let (kernel_name, steps, options, footprints, output) = {
        let views: Vec<&TensorInfo> = operands.iter().map(|info| &**info).collect();
        descriptor.validate(&views)?;
        let steps = descriptor.steps(&views, caps);
        let output = descriptor.output_index(&views);
        if output >= views.len() {
            return Err(ConfigurationError::OperandCount {
                kernel: descriptor.kernel_name(&views),
                expected: output + 1,
                actual: views.len(),
            }
            .into());
        }
        (
            descriptor.kernel_name(&views),
            steps,
            descriptor.build_options(&views, &steps, caps),
            descriptor.footprints(&views, &steps),
            output,
        )
    };

    let snapshot = PaddingSnapshot::capture(operands.iter().map(|info| &**info));
    let border = descriptor.border();
    let border_undefined = descriptor.border_undefined();
    let input_region = *operands[0].valid_region();
    let mut window = calculate_max_window(operands[output].tensor_shape(), &steps, border_undefined, border);

    {
        let mut indices = Vec::with_capacity(footprints.len());
        let mut windows = Vec::with_capacity(footprints.len());
        for (i, (info, pattern)) in operands.iter_mut().zip(footprints).enumerate() {
            if let Some(pattern) = pattern {
                indices.push(i);
                windows.push(AccessWindow::new(Some(&mut **info), pattern));
            }
        }

        let update = match update_window_and_padding(&mut window, &mut windows) {
            Ok(update) => update,
            Err(WindowError::TensorLocked { .. }) => {
                return Err(ConfigurationError::InsufficientPadding { kernel: kernel_name, window: window.to_string() }
                    .into());
            }
            Err(err) => return Err(err.into()),
        };
        if update.window_changed {
            return Err(
                ConfigurationError::InsufficientPadding { kernel: kernel_name, window: window.to_string() }.into()
            );
        }
        if let Some(pos) = indices.iter().position(|&i| i == output) {
            windows[pos].set_valid_region(&window, input_region, border_undefined, border);
        }
    }

    snapshot.verify_not_shrunk(operands.iter().map(|info| &**info))?;

    let program = descriptor.program();
    let kernel =
        ctx.create_kernel(&kernel_name, program.name, ProgramSource::Text(program.source), include_path, &options)?;

    let rank = descriptor.dispatch_rank().clamp(1, 3);
    let lws = descriptor
        .lws_hint()
        .or_else(|| ctx.default_dispatch_granularity())
        .map(|hint| hint.with_rank(rank));
    debug!(kernel = %kernel_name, %window, options = %options, "configured kernel");

    Ok(ConfiguredKernel {
        descriptor,
        kernel,
        window,
        operands: operands.iter().map(|info| (**info).clone()).collect(),
        rank,
        lws,
    })
}

/// A compiled kernel with its negotiated window.
#[derive(Debug)]
pub struct ConfiguredKernel<D> {
    descriptor: D,
    kernel: KernelHandle,
    window: Window,
    operands: Vec<TensorInfo>,
    rank: usize,
    lws: Option<NdRange>,
}

impl<D: KernelDescriptor> ConfiguredKernel<D> {
    pub const fn descriptor(&self) -> &D {
        &self.descriptor
    }

    pub const fn kernel(&self) -> &KernelHandle {
        &self.kernel
    }

    pub const fn window(&self) -> &Window {
        &self.window
    }

    /// Operand metadata as it stood after configure.
    pub fn operands(&self) -> &[TensorInfo] {
        &self.operands
    }

    fn check_operands(&self, tensors: &[&ClTensor]) -> Result<()> {
        let kernel = self.kernel.name();
        if tensors.len() != self.operands.len() {
            return Err(ConfigurationError::OperandCount {
                kernel: kernel.to_owned(),
                expected: self.operands.len(),
                actual: tensors.len(),
            }
            .into());
        }
        for (operand, (tensor, expected)) in tensors.iter().zip(&self.operands).enumerate() {
            let actual = tensor.info();
            if actual.data_type() != expected.data_type() {
                return Err(ConfigurationError::DataTypeMismatch {
                    kernel: kernel.to_owned(),
                    operand,
                    expected: expected.data_type(),
                    actual: actual.data_type(),
                }
                .into());
            }
            if actual.tensor_shape() != expected.tensor_shape()
                || actual.strides_in_bytes() != expected.strides_in_bytes()
                || actual.offset_first_element_in_bytes() != expected.offset_first_element_in_bytes()
            {
                return Err(ConfigurationError::ShapeMismatch {
                    kernel: kernel.to_owned(),
                    operand,
                    expected: format!("{} padded {:?}", expected.tensor_shape(), expected.padding()),
                    actual: format!("{} padded {:?}", actual.tensor_shape(), actual.padding()),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Bind buffer, strides and slice offset of `tensor` starting at
    /// argument `*index`.
    fn add_tensor_argument(&mut self, index: &mut u32, tensor: &ClTensor, slice: &Window) -> Result<()> {
        let info = tensor.info();
        self.kernel.set_buffer_argument(*index, tensor.buffer())?;
        *index += 1;

        let strides = info.strides_in_bytes();
        for dim in 0..self.rank {
            let stride = strides[dim] as u32;
            self.kernel.set_scalar_argument(*index, stride)?;
            self.kernel.set_scalar_argument(*index + 1, stride * slice[dim].step() as u32)?;
            *index += 2;
        }

        let mut start = Coordinates::default();
        for dim in 0..MAX_DIMS {
            start.set(dim, slice[dim].start());
        }
        let offset = u32::try_from(info.offset_element_in_bytes(&start)).map_err(|_| {
            ConfigurationError::InsufficientPadding { kernel: self.kernel.name().to_owned(), window: slice.to_string() }
        })?;
        self.kernel.set_scalar_argument(*index, offset)?;
        *index += 1;
        Ok(())
    }

    /// Dispatch the kernel over its window, one enqueue per slice.
    pub fn run(&mut self, queue: &CommandQueue, tensors: &[&ClTensor]) -> Result<()> {
        self.check_operands(tensors)?;

        let (collapsed, did_collapse) = self.window.collapse_if_possible(&self.window, Window::DIM_Z, MAX_DIMS);
        trace!(kernel = self.kernel.name(), did_collapse, "dispatch window {collapsed}");

        let scalars = self.descriptor.scalar_arguments();
        let mut slice = collapsed.first_slice(self.rank);
        loop {
            if let Some(gws) = gws_from_window(&slice, self.rank) {
                let mut index = 0;
                for tensor in tensors {
                    self.add_tensor_argument(&mut index, tensor, &slice)?;
                }
                for scalar in &scalars {
                    match *scalar {
                        ScalarArgument::U32(v) => self.kernel.set_scalar_argument(index, v)?,
                        ScalarArgument::I32(v) => self.kernel.set_scalar_argument(index, v)?,
                        ScalarArgument::F32(v) => self.kernel.set_scalar_argument(index, v)?,
                    }
                    index += 1;
                }
                self.kernel.enqueue(queue, gws, self.lws)?;
            }
            if !collapsed.slide_slice(self.rank, &mut slice) {
                break;
            }
        }
        Ok(())
    }
}
