// benches/benchmarks.rs -- Host-side benchmarks.
//
//   cargo bench --bench benchmarks
//
// Everything here runs on the CPU: the rayon executors and the emulated
// device backend. See gpu_benchmarks.rs for the wgpu counterparts.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use fdgpu::config::{DemonsConfig, DiffusionConfig, MeanConfig, ReductionConfig};
use fdgpu::gpu::{DeviceContext, Reduction};
use fdgpu::{DemonsRegistration, Executor, Geometry, GradientAnisotropicDiffusion, Image, MeanImageFilter};

// ============================================================
// Helpers
// ============================================================

/// Smooth blob of radius ~`w / 6` centred at (cx, cy).
fn make_blob(w: usize, h: usize, cx: f64, cy: f64) -> Image<f32> {
    let sigma2 = 2.0 * (w as f64 / 6.0).powi(2);
    let mut data = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
            data.push((200.0 * (-r2 / sigma2).exp()) as f32);
        }
    }
    Image::from_vec(Geometry::new(&[w, h]), data)
}

/// Blocky scene with mild texture, for edge-preserving smoothing.
fn make_scene(w: usize, h: usize) -> Image<f32> {
    let mut data = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let block = if (x / 32 + y / 32) % 2 == 0 { 40.0 } else { 160.0 };
            let texture = ((x * 31 + y * 17) % 11) as f32 - 5.0;
            data.push(block + texture);
        }
    }
    Image::from_vec(Geometry::new(&[w, h]), data)
}

// ============================================================
// Reduction
// ============================================================

fn bench_reduction(c: &mut Criterion) {
    let ctx = DeviceContext::host(1);
    let mut group = c.benchmark_group("reduction");
    for n in [1usize << 12, 1 << 16, 1 << 20] {
        let data: Vec<f32> = (0..n).map(|i| (i % 7) as f32).collect();
        let mut reduction = Reduction::<f32>::new(ctx.clone(), ReductionConfig::default()).unwrap();
        reduction.set_input(&data).unwrap();
        reduction.initialize_kernel(n).unwrap();

        group.bench_with_input(BenchmarkId::new("cpu_reference", n), &data, |b, data| {
            b.iter(|| reduction.cpu_reference(data))
        });
        let mut emulated = Reduction::<f32>::new(ctx.clone(), ReductionConfig::default()).unwrap();
        emulated.set_input(&data).unwrap();
        emulated.initialize_kernel(n).unwrap();
        group.bench_function(BenchmarkId::new("emulated_device", n), |b| {
            b.iter(|| emulated.generate().unwrap())
        });
    }
    group.finish();
}

// ============================================================
// Demons
// ============================================================

fn bench_demons(c: &mut Criterion) {
    let mut group = c.benchmark_group("demons");
    group.sample_size(10);
    for size in [64usize, 128] {
        let fixed = make_blob(size, size, size as f64 / 2.0, size as f64 / 2.0);
        let moving = make_blob(size, size, size as f64 / 2.0 + 3.0, size as f64 / 2.0 - 2.0);
        let mut cfg = DemonsConfig::default();
        cfg.solver.max_iterations = 5;

        group.bench_function(BenchmarkId::new("host_5_iter", size), |b| {
            b.iter(|| {
                let mut reg = DemonsRegistration::new(cfg.clone(), Executor::Host);
                reg.set_fixed_image(fixed.clone());
                reg.set_moving_image(moving.clone());
                reg.update().unwrap();
                reg.take_output()
            })
        });
    }
    group.finish();
}

// ============================================================
// Anisotropic diffusion
// ============================================================

fn bench_diffusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("diffusion");
    group.sample_size(10);
    for size in [128usize, 256] {
        let img = make_scene(size, size);
        group.bench_function(BenchmarkId::new("host_5_iter", size), |b| {
            b.iter(|| {
                let mut f = GradientAnisotropicDiffusion::<f32>::new(DiffusionConfig::default(), Executor::Host);
                f.set_input(&img);
                f.update().unwrap();
                f.take_output()
            })
        });
    }
    group.finish();
}

// ============================================================
// Mean
// ============================================================

fn bench_mean(c: &mut Criterion) {
    let mut group = c.benchmark_group("mean");
    let img = make_scene(256, 256);
    for radius in [1usize, 2, 4] {
        group.bench_function(BenchmarkId::new("host_radius", radius), |b| {
            b.iter(|| {
                let mut f = MeanImageFilter::<f32>::new(MeanConfig::default(), Executor::Host);
                f.set_radius(&[radius, radius]).unwrap();
                f.set_input(img.clone());
                f.update().unwrap();
                f.take_output()
            })
        });
    }
    group.finish();
}

// ============================================================
// Register
// ============================================================

criterion_group!(benches, bench_reduction, bench_demons, bench_diffusion, bench_mean);
criterion_main!(benches);
