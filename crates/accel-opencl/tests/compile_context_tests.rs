use std::sync::Arc;
use std::time::Duration;

use accel_opencl::driver::mock::{MockBackend, MockDevice};
use accel_opencl::error::status;
use accel_opencl::{
    BuildOptions, ClError, CompileContext, ConfigurationError, Driver, EntryPoint, NdRange, ProgramSource,
};

const SOURCE: &str = "\
__kernel void fill(__global float *dst, const float value)
{
    dst[get_global_id(0)] = value;
}

__kernel void scale(__global float *dst, const float factor)
{
    dst[get_global_id(0)] *= factor;
}
";

// ── helpers ────────────────────────────────────────────────────────

fn bound(backend: &Arc<MockBackend>) -> CompileContext {
    let driver = Driver::new(backend.clone());
    let context = driver.create_context(&[MockBackend::device_id(0)]).unwrap();
    CompileContext::bound(driver, context, MockBackend::device_id(0)).unwrap()
}

fn backend(device: MockDevice) -> Arc<MockBackend> {
    Arc::new(MockBackend::single(device))
}

fn opts(items: &[&str]) -> BuildOptions {
    items.iter().copied().collect()
}

// ── build options ──────────────────────────────────────────────────

#[test]
fn valhall_options_enable_every_supported_feature() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    let options = ctx.generate_build_options().unwrap();

    for expected in [
        "-cl-std=CL3.0",
        "-DGPU_ARCH=768",
        "-DACCEL_OPENCL_FP16_ENABLED=1",
        "-DACCEL_OPENCL_DOT8_ENABLED=1",
        "-DACCEL_OPENCL_DOT8_ACC_ENABLED=1",
        "-DACCEL_OPENCL_INT64_BASE_ATOMICS_ENABLED=1",
        "-DUNROLL_WITH_PRAGMA",
    ] {
        assert!(options.contains(expected), "missing {expected} in {options}");
    }
}

#[test]
fn unparsable_driver_version_disables_pragma_unroll() {
    let backend = backend(MockDevice::generic("Mali-G77"));
    let ctx = bound(&backend);
    let caps = ctx.capabilities().unwrap();
    assert_eq!(caps.driver_version(), -1);

    let options = ctx.generate_build_options().unwrap();
    assert!(options.contains("-DGPU_ARCH=768"));
    assert!(!options.contains("-DUNROLL_WITH_PRAGMA"));
    assert!(!options.contains("-DACCEL_OPENCL_FP16_ENABLED=1"));
}

#[test]
fn midgard_uses_arm_non_uniform_extension() {
    let backend = backend(MockDevice::mali_t760());
    let ctx = bound(&backend);
    let options = ctx.generate_build_options().unwrap();
    assert!(options.contains("-cl-arm-non-uniform-work-group-size"));
    assert!(!options.contains("-cl-std=CL3.0"));
    assert!(!options.contains("-DUNROLL_WITH_PRAGMA"));
}

#[test]
fn device_without_non_uniform_support_cannot_build_anything() {
    let device = MockDevice {
        version: "OpenCL 1.2".into(),
        extensions: Vec::new(),
        non_uniform_work_group: false,
        ..MockDevice::mali_t760()
    };
    let backend = backend(device);
    let ctx = bound(&backend);

    for kernel in ["fill", "scale", "does_not_exist"] {
        let err = ctx
            .create_kernel(kernel, "fill_prog", ProgramSource::Text(SOURCE), None, &BuildOptions::new())
            .unwrap_err();
        assert!(
            matches!(err, ClError::Configuration(ConfigurationError::MissingCapability { .. })),
            "unexpected error {err}"
        );
    }
    assert_eq!(backend.build_count(), 0);
    assert_eq!(ctx.program_store().compilations(), 0);
}

#[test]
fn cl3_device_without_non_uniform_support_cannot_build_anything() {
    let device = MockDevice { non_uniform_work_group: false, ..MockDevice::generic("Mali-G77") };
    let backend = backend(device);
    let ctx = bound(&backend);

    for kernel in ["fill", "scale"] {
        let err = ctx
            .create_kernel(kernel, "fill_prog", ProgramSource::Text(SOURCE), None, &BuildOptions::new())
            .unwrap_err();
        assert!(
            matches!(err, ClError::Configuration(ConfigurationError::MissingCapability { .. })),
            "unexpected error {err}"
        );
    }
    assert_eq!(backend.build_count(), 0);
}

#[test]
fn cl2_device_builds_with_cl2_standard() {
    let device = MockDevice {
        version: "OpenCL 2.0 v1.r20p0-01rel0".into(),
        non_uniform_work_group: false,
        ..MockDevice::generic("Mali-G71")
    };
    let backend = backend(device);
    let ctx = bound(&backend);

    let kernel = ctx
        .create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &BuildOptions::new())
        .unwrap();
    assert!(kernel.program().options().contains("-cl-std=CL2.0"));
    assert_eq!(backend.build_count(), 1);
}

// ── kernel creation ────────────────────────────────────────────────

#[test]
fn kernels_of_one_program_share_a_compilation() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    let options = opts(&["-DVEC=4"]);

    let fill = ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &options).unwrap();
    let scale = ctx.create_kernel("scale", "fill_prog", ProgramSource::Text(SOURCE), None, &options).unwrap();

    assert_eq!(fill.name(), "fill");
    assert_eq!(scale.name(), "scale");
    assert_eq!(fill.program().key(), scale.program().key());
    assert_eq!(backend.build_count(), 1);
    assert_eq!(ctx.program_store().compilations(), 1);
    assert_eq!(ctx.max_local_workgroup_size(&fill), 512);
}

#[test]
fn different_options_compile_separately() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);

    ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &opts(&["-DA"])).unwrap();
    ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &opts(&["-DB"])).unwrap();
    ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), Some("/opt/kernels"), &opts(&["-DB"]))
        .unwrap();

    assert_eq!(ctx.program_store().compilations(), 3);
    assert_eq!(ctx.program_store().all_compiled().unwrap().len(), 3);
}

#[test]
fn include_path_leads_the_option_string() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    let kernel = ctx
        .create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), Some("/opt/kernels"), &opts(&["-DX"]))
        .unwrap();
    assert!(kernel.program().options().starts_with("-I/opt/kernels "));
    assert!(kernel.program().key().starts_with("fill_prog_-I/opt/kernels "));
}

#[test]
fn unknown_kernel_name_is_reported_by_the_driver() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    let err = ctx
        .create_kernel("missing", "fill_prog", ProgramSource::Text(SOURCE), None, &BuildOptions::new())
        .unwrap_err();
    assert_eq!(err.status_code(), status::CL_INVALID_KERNEL_NAME);
    // The program itself built and stays cached.
    assert_eq!(ctx.program_store().compilations(), 1);
}

#[test]
fn compile_error_surfaces_the_build_log() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    let broken = "__kernel void broken(__global int *p)\n{\n#error VEC_SIZE must be defined\n}\n";

    let err = ctx
        .create_kernel("broken", "broken_prog", ProgramSource::Text(broken), None, &BuildOptions::new())
        .unwrap_err();
    match &err {
        ClError::Compilation { program, log, .. } => {
            assert_eq!(program, "broken_prog");
            assert!(log.contains("VEC_SIZE must be defined"), "log was {log:?}");
        }
        other => panic!("expected a compilation error, got {other}"),
    }
    assert_eq!(err.status_code(), status::CL_BUILD_PROGRAM_FAILURE);
    assert!(ctx.program_store().all_compiled().unwrap().is_empty());
    assert_eq!(backend.live_objects(), 1, "only the context should remain");
}

#[test]
fn missing_build_entry_point_is_a_soft_failure() {
    let backend = Arc::new(MockBackend::single(MockDevice::mali_g77()).without_symbols(&[EntryPoint::BuildProgram]));
    let ctx = bound(&backend);
    let err = ctx
        .create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &BuildOptions::new())
        .unwrap_err();
    assert!(err.is_resource_unavailable());
    assert_eq!(err.status_code(), status::CL_OUT_OF_RESOURCES);
    assert_eq!(backend.build_count(), 0);
}

#[test]
fn conflicting_payload_under_a_taken_name_is_rejected() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &BuildOptions::new()).unwrap();

    let other = "__kernel void fill(__global float *dst, const float value) { }\n";
    let err = ctx
        .create_kernel("fill", "fill_prog", ProgramSource::Text(other), None, &BuildOptions::new())
        .unwrap_err();
    assert!(matches!(err, ClError::ProgramConflict { ref name } if name == "fill_prog"));
}

#[test]
fn binary_payload_builds_through_the_binary_path() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    let first = ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &opts(&["-DA"])).unwrap();
    let binary = first.program().binary().unwrap();

    let kernel =
        ctx.create_kernel("scale", "fill_bin", ProgramSource::Binary(&binary), None, &opts(&["-DA"])).unwrap();
    assert_eq!(kernel.program().program_name(), "fill_bin");
    assert!(ctx.program_store().program("fill_bin").unwrap().unwrap().payload().is_binary());
}

#[test]
fn unbound_context_refuses_work() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = CompileContext::new(Driver::new(backend.clone()));

    assert!(!ctx.supports_extension("cl_khr_fp16"));
    assert_eq!(ctx.compute_unit_count(), 0);
    assert_eq!(ctx.default_dispatch_granularity(), None);
    assert!(matches!(ctx.generate_build_options(), Err(ClError::NoDeviceBound)));
    assert!(matches!(
        ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &BuildOptions::new()),
        Err(ClError::NoDeviceBound)
    ));
}

// ── caching semantics ──────────────────────────────────────────────

#[test]
fn concurrent_requests_compile_once() {
    let backend = Arc::new(MockBackend::single(MockDevice::mali_g77()).with_build_delay(Duration::from_millis(20)));
    let ctx = bound(&backend);
    let options = opts(&["-DDATA_TYPE=float"]);

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let kernel =
                    ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &options).unwrap();
                assert_eq!(kernel.name(), "fill");
            });
        }
    });

    assert_eq!(backend.build_count(), 1);
    assert_eq!(ctx.program_store().compilations(), 1);
}

#[test]
fn clearing_the_store_forces_a_rebuild() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    let options = opts(&["-DA"]);

    let kernel = ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &options).unwrap();
    let key = kernel.program().key().to_owned();

    ctx.program_store().clear().unwrap();
    assert!(ctx.program_store().all_compiled().unwrap().is_empty());
    // Handles created before the clear stay usable.
    assert_eq!(kernel.name(), "fill");

    let again = ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &options).unwrap();
    assert_eq!(again.program().key(), key);
    assert_eq!(ctx.program_store().compilations(), 2);
}

// ── device binding ─────────────────────────────────────────────────

#[test]
fn switching_devices_clears_compiled_programs() {
    let backend = Arc::new(MockBackend::new(vec![MockDevice::mali_g77(), MockDevice::mali_t760()]));
    let driver = Driver::new(backend.clone());
    let devices = [MockBackend::device_id(0), MockBackend::device_id(1)];
    let context = driver.create_context(&devices).unwrap();
    let mut ctx = CompileContext::bound(driver, context, devices[0]).unwrap();
    assert_eq!(ctx.device(), Some(devices[0]));

    ctx.create_kernel("fill", "fill_prog", ProgramSource::Text(SOURCE), None, &BuildOptions::new()).unwrap();
    assert_eq!(ctx.program_store().all_compiled().unwrap().len(), 1);

    ctx.set_device(devices[0]).unwrap();
    assert_eq!(ctx.program_store().all_compiled().unwrap().len(), 1, "rebinding the same device keeps the cache");

    ctx.set_device(devices[1]).unwrap();
    assert!(ctx.program_store().all_compiled().unwrap().is_empty());
    assert_eq!(ctx.capabilities().unwrap().name(), "Mali-T760");
    assert_eq!(ctx.compute_unit_count(), 4);
}

#[test]
fn binding_a_context_picks_its_first_device() {
    let backend = Arc::new(MockBackend::new(vec![MockDevice::mali_g77(), MockDevice::mali_t760()]));
    let driver = Driver::new(backend.clone());
    let context = driver.create_context(&[MockBackend::device_id(1)]).unwrap();

    let mut ctx = CompileContext::new(driver);
    ctx.set_context(context).unwrap();
    assert_eq!(ctx.device(), Some(MockBackend::device_id(1)));
    assert_eq!(ctx.context(), Some(context));
}

#[test]
fn dispatch_granularity_follows_architecture() {
    let midgard = backend(MockDevice::mali_t760());
    assert_eq!(bound(&midgard).default_dispatch_granularity(), Some(NdRange::d2(128, 1)));

    let valhall = backend(MockDevice::mali_g77());
    assert_eq!(bound(&valhall).default_dispatch_granularity(), None);
}

#[test]
fn extension_queries_follow_the_bound_device() {
    let backend = backend(MockDevice::mali_g77());
    let ctx = bound(&backend);
    assert!(ctx.supports_extension("cl_khr_fp16"));
    assert!(!ctx.supports_extension("cl_khr_fp64"));
    assert_eq!(ctx.compute_unit_count(), 9);
}
