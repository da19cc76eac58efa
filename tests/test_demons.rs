// tests/test_demons.rs — Demons registration end to end.
//
// Host-executor runs need nothing special. Accelerator runs use the host
// emulation backend, except the `inner_*` wgpu tests, which are #[ignore]d
// and driven through a subprocess so a missing or crashing driver cannot
// take down the whole test binary.

use std::sync::{Arc, Mutex};

use fdgpu::config::{BackendPreference, DemonsConfig, DeviceConfig};
use fdgpu::gpu::DeviceContext;
use fdgpu::{DemonsRegistration, Executor, Geometry, GpuError, Image, IterationEvent, RealPixel};

fn blob<T: RealPixel>(g: Geometry, cx: f64, cy: f64) -> Image<T> {
    let [w, h, _] = g.extent();
    let mut data = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
            data.push(T::from_f64(100.0 * (-r2 / 18.0).exp()));
        }
    }
    Image::from_vec(g, data)
}

fn config(iterations: u32) -> DemonsConfig {
    let mut cfg = DemonsConfig::default();
    cfg.solver.max_iterations = iterations;
    cfg
}

fn registration<T: RealPixel>(executor: Executor, iterations: u32) -> DemonsRegistration<T> {
    let g = Geometry::new(&[24, 20]);
    let mut reg = DemonsRegistration::new(config(iterations), executor);
    reg.set_fixed_image(blob(g, 11.0, 10.0));
    reg.set_moving_image(blob(g, 13.0, 9.0));
    reg
}

fn max_abs_diff(a: &Image<f64>, b: &Image<f64>) -> f64 {
    a.as_slice().iter().zip(b.as_slice()).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

// ===== Scenarios =====

#[test]
fn identical_images_give_zero_field() {
    for executor in [Executor::Host, Executor::Accelerator(DeviceContext::host(1))] {
        let g = Geometry::new(&[4, 4]);
        let mut reg = DemonsRegistration::<f32>::new(config(1), executor.clone());
        reg.set_fixed_image(Image::filled(g, 10.0));
        reg.set_moving_image(Image::filled(g, 10.0));
        reg.update().unwrap();

        let field = reg.output().unwrap();
        assert_eq!(field.geometry(), &g.vector_field());
        assert!(field.as_slice().iter().all(|&v| v == 0.0), "{executor:?}");
        assert_eq!(reg.metric(), 0.0);
        assert_eq!(reg.rms_change(), 0.0);
        assert_eq!(reg.elapsed_iterations(), 1);
    }
}

#[test]
fn metric_starts_at_max_and_decreases() {
    let mut reg = registration::<f64>(Executor::Host, 1);
    assert_eq!(reg.metric(), f64::MAX);
    reg.update().unwrap();
    let first = reg.metric();
    assert!(first > 0.0 && first < f64::MAX);

    reg.set_number_of_iterations(20);
    reg.update().unwrap();
    assert!(reg.metric() < first, "metric {} did not drop below {first}", reg.metric());
}

#[test]
fn field_moves_fixed_towards_moving() {
    let mut reg = registration::<f64>(Executor::Host, 30);
    reg.update().unwrap();
    let field = reg.output().unwrap();
    // Moving blob sits at (+2, -1) relative to the fixed one.
    let u = field.get_vector(&[11, 10]);
    assert!(u[0] > 0.5, "x displacement {u:?}");
    assert!(u[1] < -0.2, "y displacement {u:?}");
}

#[test]
fn host_and_accelerator_agree() {
    let mut host = registration::<f64>(Executor::Host, 4);
    let mut accel = registration::<f64>(Executor::Accelerator(DeviceContext::host(1)), 4);
    host.update().unwrap();
    accel.update().unwrap();

    let diff = max_abs_diff(host.output().unwrap(), accel.output().unwrap());
    assert!(diff < 1e-9, "fields differ by {diff}");
    assert!((host.metric() - accel.metric()).abs() <= 1e-9 * host.metric());
    assert!((host.rms_change() - accel.rms_change()).abs() <= 1e-9 * host.rms_change().max(1e-12));
}

#[test]
fn host_and_accelerator_agree_with_update_smoothing_and_moving_gradient() {
    let build = |executor| {
        let mut reg = registration::<f64>(executor, 3);
        reg.set_smooth_update_field(true);
        reg.set_update_field_standard_deviations(&[0.8, 1.2]);
        reg.set_standard_deviations(&[1.5, 1.5]);
        reg.set_use_moving_image_gradient(true);
        reg
    };
    let mut host = build(Executor::Host);
    let mut accel = build(Executor::Accelerator(DeviceContext::host(1)));
    host.update().unwrap();
    accel.update().unwrap();
    let diff = max_abs_diff(host.output().unwrap(), accel.output().unwrap());
    assert!(diff < 1e-9, "fields differ by {diff}");
}

#[test]
fn initial_field_is_the_starting_point() {
    let g = Geometry::new(&[6, 6]);
    let mut initial = Image::<f64>::new(g.vector_field());
    initial.set_vector(&[1, 1], &[0.25, -0.5]);

    let mut reg = DemonsRegistration::<f64>::new(config(0), Executor::Host);
    reg.set_fixed_image(Image::filled(g, 1.0));
    reg.set_moving_image(Image::filled(g, 1.0));
    reg.set_initial_deformation_field(Some(initial.clone()));
    reg.update().unwrap();
    assert_eq!(reg.output().unwrap(), &initial);
}

#[test]
fn mismatched_initial_field_is_rejected() {
    let g = Geometry::new(&[6, 6]);
    let mut reg = DemonsRegistration::<f32>::new(config(1), Executor::Host);
    reg.set_fixed_image(Image::filled(g, 1.0));
    reg.set_moving_image(Image::filled(g, 1.0));
    reg.set_initial_deformation_field(Some(Image::new(Geometry::new(&[5, 6]).vector_field())));
    assert!(matches!(reg.update(), Err(GpuError::Geometry(_))));
}

#[test]
fn mismatched_dimensions_are_rejected() {
    let mut reg = DemonsRegistration::<f32>::new(config(1), Executor::Host);
    reg.set_fixed_image(Image::filled(Geometry::new(&[6, 6]), 1.0));
    reg.set_moving_image(Image::filled(Geometry::new(&[6, 6, 2]), 1.0));
    assert!(matches!(reg.update(), Err(GpuError::Geometry(_))));
}

// ===== Stop, abort, observers =====

#[test]
fn stop_registration_from_observer() {
    for executor in [Executor::Host, Executor::Accelerator(DeviceContext::host(1))] {
        let mut reg = registration::<f32>(executor, 50);
        let stop = reg.stop_handle();
        reg.on_iteration(move |e| {
            if e.iteration == 3 {
                stop.stop();
            }
        });
        reg.update().unwrap();
        assert_eq!(reg.elapsed_iterations(), 3);
        assert!(reg.output().is_some());
    }
}

#[test]
fn stop_before_update_is_cleared_on_initialize() {
    let mut reg = registration::<f32>(Executor::Host, 4);
    reg.stop_registration();
    reg.update().unwrap();
    assert_eq!(reg.elapsed_iterations(), 4);
}

#[test]
fn abort_keeps_partial_output() {
    let mut reg = registration::<f32>(Executor::Host, 50);
    let abort = reg.solver().abort_handle();
    reg.on_iteration(move |e| {
        if e.iteration == 2 {
            abort.abort();
        }
    });
    let err = reg.update().unwrap_err();
    assert!(matches!(err, GpuError::ProcessAborted { iteration: 2 }));
    assert!(reg.output().is_some());
}

#[test]
fn observers_report_metric() {
    let mut reg = registration::<f64>(Executor::Host, 3);
    let seen: Arc<Mutex<Vec<IterationEvent>>> = Arc::default();
    let sink = Arc::clone(&seen);
    reg.on_iteration(move |e| sink.lock().unwrap().push(*e));
    reg.update().unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|e| e.metric.is_some_and(|m| m < f64::MAX)));
    assert_eq!(seen[2].metric, Some(reg.metric()));
}

#[test]
fn manual_reinitialization_resumes_from_previous_field() {
    let mut once = registration::<f64>(Executor::Host, 6);
    once.update().unwrap();

    let mut twice = registration::<f64>(Executor::Host, 3);
    twice.solver_mut().set_manual_reinitialization(true);
    twice.update().unwrap();
    twice.set_number_of_iterations(6);
    twice.update().unwrap();

    assert_eq!(twice.elapsed_iterations(), 6);
    assert!(max_abs_diff(once.output().unwrap(), twice.output().unwrap()) < 1e-12);
}

// ===== wgpu =====

fn run_gpu_test_in_subprocess(test_name: &str) -> String {
    let output = std::process::Command::new("cargo")
        .args(["test", "--test", "test_demons", "--", test_name, "--exact", "--ignored", "--nocapture"])
        .output()
        .unwrap_or_else(|e| panic!("subprocess failed for {test_name}: {e}"));
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    print!("{stdout}");
    eprint!("{stderr}");
    stdout + &stderr
}

#[test]
#[ignore = "GPU integration: run via outer subprocess wrapper"]
fn inner_wgpu_matches_host() {
    let cfg = DeviceConfig { backend: BackendPreference::Gpu, ..DeviceConfig::default() };
    let ctx = DeviceContext::init(&cfg).expect("need a wgpu adapter");
    let mut host = registration::<f32>(Executor::Host, 5);
    let mut gpu = registration::<f32>(Executor::Accelerator(Arc::clone(&ctx)), 5);
    host.update().unwrap();
    gpu.update().unwrap();

    let (a, b) = (host.output().unwrap(), gpu.output().unwrap());
    let diff = a.as_slice().iter().zip(b.as_slice()).map(|(x, y)| (x - y).abs()).fold(0.0f32, f32::max);
    assert!(diff < 1e-3, "fields differ by {diff}");
    assert!((host.metric() - gpu.metric()).abs() <= 1e-3 * host.metric());
    println!("GPU_TEST_OK");
    drop(gpu);
    ctx.shutdown();
}

#[test]
#[ignore = "requires a GPU; spawns a subprocess"]
fn wgpu_matches_host() {
    let out = run_gpu_test_in_subprocess("inner_wgpu_matches_host");
    assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
}
