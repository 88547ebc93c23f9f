//! Built-in kernel descriptors.
//!
//! Elementwise kernels over 3D-addressed tensors, vectorised along x.

use accel_window::{AccessPattern, DataType, Steps, TensorInfo};

use crate::build_options::BuildOptions;
use crate::device_capabilities::DeviceCapabilities;
use crate::error::{ConfigurationError, Result};
use crate::operator::{KernelDescriptor, ProgramDefinition, ScalarArgument};

pub const COPY_PROGRAM: ProgramDefinition =
    ProgramDefinition { name: "copy", source: concat!(include_str!("helpers.cl"), include_str!("copy.cl")) };

pub const ACTIVATION_PROGRAM: ProgramDefinition = ProgramDefinition {
    name: "activation",
    source: concat!(include_str!("helpers.cl"), include_str!("activation.cl")),
};

/// OpenCL C scalar type for `data_type`.
pub const fn cl_type_name(data_type: DataType) -> &'static str {
    match data_type {
        DataType::U8 | DataType::QAsymm8 => "uchar",
        DataType::S8 | DataType::QAsymm8Signed => "char",
        DataType::U16 => "ushort",
        DataType::S16 => "short",
        DataType::F16 => "half",
        DataType::U32 => "uint",
        DataType::S32 => "int",
        DataType::F32 => "float",
    }
}

/// Largest power-of-two vector width not exceeding `preferred` or `dim0`.
pub fn adjust_vec_size(preferred: u32, dim0: usize) -> u32 {
    let mut vec = preferred.max(1);
    while vec > 1 && vec as usize > dim0 {
        vec /= 2;
    }
    vec
}

fn vector_steps(operands: &[&TensorInfo]) -> Steps {
    let Some(src) = operands.first() else {
        return Steps::default();
    };
    let preferred = (16 / src.element_size()) as u32;
    Steps::new(&[adjust_vec_size(preferred, src.tensor_shape()[0])])
}

fn elementwise_options(operands: &[&TensorInfo], steps: &Steps) -> BuildOptions {
    let mut options = BuildOptions::new();
    if let Some(src) = operands.first() {
        options.add(format!("-DDATA_TYPE={}", cl_type_name(src.data_type())));
    }
    options.add(format!("-DVEC_SIZE={}", steps[0]));
    options
}

fn validate_unary(kernel: &str, operands: &[&TensorInfo], supported: impl Fn(DataType) -> bool) -> Result<()> {
    let [src, dst] = operands else {
        return Err(ConfigurationError::OperandCount { kernel: kernel.to_owned(), expected: 2, actual: operands.len() }
            .into());
    };
    if !supported(src.data_type()) {
        return Err(ConfigurationError::UnsupportedDataType { kernel: kernel.to_owned(), data_type: src.data_type() }
            .into());
    }
    if dst.data_type() != src.data_type() {
        return Err(ConfigurationError::DataTypeMismatch {
            kernel: kernel.to_owned(),
            operand: 1,
            expected: src.data_type(),
            actual: dst.data_type(),
        }
        .into());
    }
    if dst.tensor_shape() != src.tensor_shape() {
        return Err(ConfigurationError::ShapeMismatch {
            kernel: kernel.to_owned(),
            operand: 1,
            expected: src.tensor_shape().to_string(),
            actual: dst.tensor_shape().to_string(),
        }
        .into());
    }
    Ok(())
}

fn unary_footprints(steps: &Steps) -> Vec<Option<AccessPattern>> {
    let width = steps[0] as i32;
    vec![Some(AccessPattern::horizontal(0, width)), Some(AccessPattern::horizontal(0, width))]
}

/// Copies `src` to `dst` element for element.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyKernel;

impl KernelDescriptor for CopyKernel {
    fn program(&self) -> ProgramDefinition {
        COPY_PROGRAM
    }

    fn kernel_name(&self, _: &[&TensorInfo]) -> String {
        "copy_tensor".into()
    }

    fn validate(&self, operands: &[&TensorInfo]) -> Result<()> {
        validate_unary("copy_tensor", operands, |_| true)
    }

    fn steps(&self, operands: &[&TensorInfo], _: &DeviceCapabilities) -> Steps {
        vector_steps(operands)
    }

    fn build_options(&self, operands: &[&TensorInfo], steps: &Steps, _: &DeviceCapabilities) -> BuildOptions {
        elementwise_options(operands, steps)
    }

    fn footprints(&self, _: &[&TensorInfo], steps: &Steps) -> Vec<Option<AccessPattern>> {
        unary_footprints(steps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationFunction {
    Relu,
    /// `min(upper, max(0, x))`
    BoundedRelu { upper: f32 },
}

/// Applies an activation function to a floating-point tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationKernel {
    pub function: ActivationFunction,
}

impl ActivationKernel {
    pub const fn new(function: ActivationFunction) -> Self {
        Self { function }
    }

    fn name(&self) -> &'static str {
        match self.function {
            ActivationFunction::Relu => "activation_relu",
            ActivationFunction::BoundedRelu { .. } => "activation_bounded_relu",
        }
    }
}

impl KernelDescriptor for ActivationKernel {
    fn program(&self) -> ProgramDefinition {
        ACTIVATION_PROGRAM
    }

    fn kernel_name(&self, _: &[&TensorInfo]) -> String {
        self.name().into()
    }

    fn validate(&self, operands: &[&TensorInfo]) -> Result<()> {
        validate_unary(self.name(), operands, DataType::is_float)
    }

    fn steps(&self, operands: &[&TensorInfo], _: &DeviceCapabilities) -> Steps {
        vector_steps(operands)
    }

    fn build_options(&self, operands: &[&TensorInfo], steps: &Steps, _: &DeviceCapabilities) -> BuildOptions {
        elementwise_options(operands, steps)
    }

    fn footprints(&self, _: &[&TensorInfo], steps: &Steps) -> Vec<Option<AccessPattern>> {
        unary_footprints(steps)
    }

    fn scalar_arguments(&self) -> Vec<ScalarArgument> {
        match self.function {
            ActivationFunction::Relu => Vec::new(),
            ActivationFunction::BoundedRelu { upper } => vec![ScalarArgument::F32(upper)],
        }
    }
}
