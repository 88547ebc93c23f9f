use std::sync::Arc;

use accel_opencl::driver::KernelArg;
use accel_opencl::driver::mock::{MockBackend, MockDevice};
use accel_opencl::error::status;
use accel_opencl::kernels::{ActivationFunction, ActivationKernel, CopyKernel};
use accel_opencl::{
    BuildOptions, ClError, ClRuntime, ConfigurationError, DeviceCapabilities, Driver, KernelDescriptor,
    ProgramDefinition, RuntimeConfig, configure,
};
use accel_window::{AccessPattern, DataType, PaddingSize, Steps, TensorInfo, TensorShape};

// ── helpers ────────────────────────────────────────────────────────

fn runtime(device: MockDevice) -> (Arc<MockBackend>, ClRuntime) {
    let backend = Arc::new(MockBackend::single(device));
    let runtime = ClRuntime::new(Driver::new(backend.clone()), RuntimeConfig::default()).unwrap();
    (backend, runtime)
}

fn f32_info(dims: &[usize]) -> TensorInfo {
    TensorInfo::new(TensorShape::new(dims), DataType::F32)
}

fn scalar(value: u32) -> KernelArg {
    KernelArg::Scalar(value.to_ne_bytes().to_vec())
}

fn dense_f32(values: impl IntoIterator<Item = f32>) -> Vec<u8> {
    values.into_iter().flat_map(f32::to_ne_bytes).collect()
}

/// Copy whose input is read as a fixed 16-element region.
#[derive(Debug)]
struct FixedRegionCopy;

impl KernelDescriptor for FixedRegionCopy {
    fn program(&self) -> ProgramDefinition {
        CopyKernel.program()
    }

    fn kernel_name(&self, _operands: &[&TensorInfo]) -> String {
        "copy_tensor".into()
    }

    fn validate(&self, _operands: &[&TensorInfo]) -> accel_opencl::Result<()> {
        Ok(())
    }

    fn steps(&self, _operands: &[&TensorInfo], _caps: &DeviceCapabilities) -> Steps {
        Steps::default()
    }

    fn build_options(&self, _operands: &[&TensorInfo], _steps: &Steps, _caps: &DeviceCapabilities) -> BuildOptions {
        BuildOptions::new()
    }

    fn footprints(&self, _operands: &[&TensorInfo], _steps: &Steps) -> Vec<Option<AccessPattern>> {
        vec![Some(AccessPattern::static_region(0, 0, 16, 1)), Some(AccessPattern::horizontal(0, 1))]
    }
}

// ── configure ──────────────────────────────────────────────────────

#[test]
fn copy_pads_rows_to_the_vector_width() {
    let (backend, runtime) = runtime(MockDevice::mali_g77());
    let mut src = f32_info(&[10, 4]);
    let mut dst = f32_info(&[10, 4]);

    let mut copy = configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap();
    assert_eq!(src.padding().right, 2);
    assert_eq!(dst.padding().right, 2);
    assert_eq!(copy.window().x().end(), 12);
    assert_eq!(copy.window().x().step(), 4);
    assert!(copy.kernel().program().options().contains("-DVEC_SIZE=4"));
    assert!(copy.kernel().program().options().contains("-DDATA_TYPE=float"));

    let src = runtime.allocate(src).unwrap();
    let dst = runtime.allocate(dst).unwrap();
    copy.run(runtime.queue(), &[&src, &dst]).unwrap();

    let dispatches = backend.dispatches();
    assert_eq!(dispatches.len(), 1);
    let dispatch = &dispatches[0];
    assert_eq!(dispatch.kernel, "copy_tensor");
    assert_eq!(dispatch.global, vec![3, 4, 1]);
    assert_eq!(dispatch.local, None);

    assert_eq!(dispatch.args[&0], KernelArg::Buffer(src.buffer().id()));
    assert_eq!(dispatch.args[&1], scalar(4));
    assert_eq!(dispatch.args[&2], scalar(16));
    assert_eq!(dispatch.args[&3], scalar(48));
    assert_eq!(dispatch.args[&4], scalar(48));
    assert_eq!(dispatch.args[&7], scalar(0));
    assert_eq!(dispatch.args[&8], KernelArg::Buffer(dst.buffer().id()));
    assert_eq!(dispatch.args.len(), 16);
}

#[test]
fn upper_dimensions_collapse_into_one_dispatch() {
    let (backend, runtime) = runtime(MockDevice::mali_g77());
    let mut src = f32_info(&[8, 4, 3, 2]);
    let mut dst = f32_info(&[8, 4, 3, 2]);

    let mut copy = configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap();
    assert!(!src.has_padding());

    let src = runtime.allocate(src).unwrap();
    let dst = runtime.allocate(dst).unwrap();
    copy.run(runtime.queue(), &[&src, &dst]).unwrap();

    let dispatches = backend.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].global, vec![2, 4, 6]);
}

#[test]
fn locked_operand_without_padding_fails_before_compiling() {
    let (backend, runtime) = runtime(MockDevice::mali_g77());
    let mut src = f32_info(&[10]);
    src.set_is_resizable(false);
    let mut dst = f32_info(&[10]);

    let err = configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap_err();
    assert!(
        matches!(err, ClError::Configuration(ConfigurationError::InsufficientPadding { ref kernel, .. }) if kernel == "copy_tensor"),
        "unexpected error {err}"
    );
    assert!(runtime.compile_context().program_store().all_compiled().unwrap().is_empty());
    assert_eq!(backend.build_count(), 0);
}

#[test]
fn locked_operand_that_cannot_cover_a_fixed_region_fails_before_compiling() {
    let (backend, runtime) = runtime(MockDevice::mali_g77());
    let mut src = f32_info(&[10]);
    src.set_is_resizable(false);
    let mut dst = f32_info(&[10]);

    let err = configure(runtime.compile_context(), None, FixedRegionCopy, &mut [&mut src, &mut dst]).unwrap_err();
    assert!(
        matches!(err, ClError::Configuration(ConfigurationError::InsufficientPadding { .. })),
        "unexpected error {err}"
    );
    assert_eq!(src.padding(), PaddingSize::default());
    assert_eq!(backend.build_count(), 0);
}

#[test]
fn locked_operand_with_enough_padding_configures() {
    let (_backend, runtime) = runtime(MockDevice::mali_g77());
    let mut src = TensorInfo::with_padding(TensorShape::new(&[10]), DataType::F32, PaddingSize::new(0, 2, 0, 0));
    src.set_is_resizable(false);
    let mut dst = f32_info(&[10]);

    configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap();
    assert_eq!(src.padding().right, 2);
}

#[test]
fn integer_relu_is_unsupported() {
    let (backend, runtime) = runtime(MockDevice::mali_g77());
    let mut src = TensorInfo::new(TensorShape::new(&[16]), DataType::S32);
    let mut dst = src.clone();

    let err = configure(
        runtime.compile_context(),
        None,
        ActivationKernel::new(ActivationFunction::Relu),
        &mut [&mut src, &mut dst],
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ClError::Configuration(ConfigurationError::UnsupportedDataType { data_type: DataType::S32, .. })
    ));
    assert_eq!(backend.build_count(), 0);
}

#[test]
fn bounded_relu_appends_its_limit_after_the_tensors() {
    let (backend, runtime) = runtime(MockDevice::mali_g77());
    let mut src = f32_info(&[16, 2]);
    let mut dst = f32_info(&[16, 2]);

    let mut relu = configure(
        runtime.compile_context(),
        None,
        ActivationKernel::new(ActivationFunction::BoundedRelu { upper: 6.0 }),
        &mut [&mut src, &mut dst],
    )
    .unwrap();
    assert_eq!(relu.kernel().name(), "activation_bounded_relu");

    let src = runtime.allocate(src).unwrap();
    let dst = runtime.allocate(dst).unwrap();
    relu.run(runtime.queue(), &[&src, &dst]).unwrap();

    let dispatch = &backend.dispatches()[0];
    assert_eq!(dispatch.args[&16], KernelArg::Scalar(6.0_f32.to_ne_bytes().to_vec()));
    assert_eq!(dispatch.args.len(), 17);
}

#[test]
fn kernels_in_one_program_with_equal_options_share_a_build() {
    let (backend, runtime) = runtime(MockDevice::mali_g77());
    let mut a = f32_info(&[16]);
    let mut b = f32_info(&[16]);
    let mut c = f32_info(&[16]);
    let mut d = f32_info(&[16]);

    configure(runtime.compile_context(), None, ActivationKernel::new(ActivationFunction::Relu), &mut [&mut a, &mut b])
        .unwrap();
    configure(
        runtime.compile_context(),
        None,
        ActivationKernel::new(ActivationFunction::BoundedRelu { upper: 1.0 }),
        &mut [&mut c, &mut d],
    )
    .unwrap();
    assert_eq!(backend.build_count(), 1);
}

// ── run ────────────────────────────────────────────────────────────

#[test]
fn run_rejects_tensors_that_differ_from_configure() {
    let (backend, runtime) = runtime(MockDevice::mali_g77());
    let mut src = f32_info(&[10, 4]);
    let mut dst = f32_info(&[10, 4]);
    let mut copy = configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap();

    let wrong = runtime.allocate(f32_info(&[10, 5])).unwrap();
    let dst = runtime.allocate(dst).unwrap();
    let err = copy.run(runtime.queue(), &[&wrong, &dst]).unwrap_err();
    assert!(matches!(err, ClError::Configuration(ConfigurationError::ShapeMismatch { operand: 0, .. })));

    let err = copy.run(runtime.queue(), &[&dst]).unwrap_err();
    assert!(matches!(err, ClError::Configuration(ConfigurationError::OperandCount { expected: 2, actual: 1, .. })));
    assert!(backend.dispatches().is_empty());
}

#[test]
fn midgard_dispatch_uses_its_default_granularity() {
    let (backend, runtime) = runtime(MockDevice::mali_t760());
    let mut src = f32_info(&[1024, 2]);
    let mut dst = f32_info(&[1024, 2]);
    let mut copy = configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap();

    let src = runtime.allocate(src).unwrap();
    let dst = runtime.allocate(dst).unwrap();
    copy.run(runtime.queue(), &[&src, &dst]).unwrap();

    let dispatch = &backend.dispatches()[0];
    assert_eq!(dispatch.global, vec![256, 2, 1]);
    assert_eq!(dispatch.local, Some(vec![128, 1, 1]));
}

#[test]
fn granularity_larger_than_the_range_is_dropped() {
    let (backend, runtime) = runtime(MockDevice::mali_t760());
    let mut src = f32_info(&[40, 2]);
    let mut dst = f32_info(&[40, 2]);
    let mut copy = configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap();

    let src = runtime.allocate(src).unwrap();
    let dst = runtime.allocate(dst).unwrap();
    copy.run(runtime.queue(), &[&src, &dst]).unwrap();
    assert_eq!(backend.dispatches()[0].local, None);
}

// ── runtime storage ────────────────────────────────────────────────

#[test]
fn padded_tensor_round_trips_through_device_memory() {
    let (_backend, runtime) = runtime(MockDevice::mali_g77());
    let info = TensorInfo::with_padding(TensorShape::new(&[3, 2]), DataType::F32, PaddingSize::new(1, 2, 1, 1));
    let tensor = runtime.allocate(info).unwrap();
    assert!(!tensor.info().is_resizable());

    let data = dense_f32((0..6).map(|v| v as f32));
    runtime.write_tensor(&tensor, &data).unwrap();
    assert_eq!(runtime.read_tensor(&tensor).unwrap(), data);

    let mut first = [0_u8; 4];
    runtime.queue().read(tensor.buffer(), tensor.info().offset_first_element_in_bytes(), &mut first).unwrap();
    assert_eq!(first, 0.0_f32.to_ne_bytes());
}

#[test]
fn write_with_wrong_length_is_rejected() {
    let (_backend, runtime) = runtime(MockDevice::mali_g77());
    let tensor = runtime.allocate(f32_info(&[4])).unwrap();
    let err = runtime.write_tensor(&tensor, &[0_u8; 8]).unwrap_err();
    assert_eq!(err.status_code(), status::CL_INVALID_VALUE);
}

#[test]
fn selecting_a_missing_device_fails() {
    let backend = Arc::new(MockBackend::single(MockDevice::mali_g77()));
    let config = RuntimeConfig { device_index: 3, ..RuntimeConfig::default() };
    let err = ClRuntime::new(Driver::new(backend), config).unwrap_err();
    assert!(matches!(err, ClError::DeviceNotFound { platform: 0, device: 3 }));
}

#[test]
fn dropping_everything_releases_every_driver_object() {
    let backend = Arc::new(MockBackend::single(MockDevice::mali_g77()));
    {
        let runtime = ClRuntime::new(Driver::new(backend.clone()), RuntimeConfig::default()).unwrap();
        let mut src = f32_info(&[10, 4]);
        let mut dst = f32_info(&[10, 4]);
        let mut copy = configure(runtime.compile_context(), None, CopyKernel, &mut [&mut src, &mut dst]).unwrap();
        let src = runtime.allocate(src).unwrap();
        let dst = runtime.allocate(dst).unwrap();
        copy.run(runtime.queue(), &[&src, &dst]).unwrap();
        runtime.finish().unwrap();
        assert!(backend.live_objects() > 0);
    }
    assert_eq!(backend.live_objects(), 0);
}
