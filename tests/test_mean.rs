// tests/test_mean.rs — Neighbourhood mean, host executor against accelerator.

use fdgpu::config::MeanConfig;
use fdgpu::gpu::DeviceContext;
use fdgpu::{Executor, Geometry, GpuError, Image, MeanImageFilter, Pixel};

fn executors() -> [Executor; 2] {
    [Executor::Host, Executor::Accelerator(DeviceContext::host(1))]
}

/// Deterministic texture in 0..=250.
fn texture<T: Pixel>(g: Geometry) -> Image<T> {
    Image::from_vec(g, (0..g.num_elements()).map(|i| T::from_f64(((i * 53 + i / 7) % 251) as f64)).collect())
}

fn run<T: Pixel>(executor: Executor, image: &Image<T>, radius: &[usize]) -> Image<T> {
    let mut f = MeanImageFilter::<T>::new(MeanConfig::default(), executor);
    f.set_radius(radius).unwrap();
    f.set_input(image.clone());
    f.update().unwrap();
    f.take_output().unwrap()
}

// ===== Agreement =====

#[test]
fn radius_two_in_3d_agrees() {
    let g = Geometry::new(&[9, 8, 7]);
    let [host, device] = executors().map(|e| run(e, &texture::<f32>(g), &[2, 2, 2]));
    assert_eq!(host, device);

    let [host, device] = executors().map(|e| run(e, &texture::<i32>(g), &[2, 2, 2]));
    assert_eq!(host, device);
}

#[test]
fn anisotropic_radius_agrees_in_2d() {
    let g = Geometry::new(&[17, 5]);
    let [host, device] = executors().map(|e| run(e, &texture::<f64>(g), &[3, 1]));
    assert_eq!(host, device);
    let [host, device] = executors().map(|e| run(e, &texture::<u32>(g), &[0, 2]));
    assert_eq!(host, device);
}

// ===== Values =====

#[test]
fn constant_image_is_unchanged() {
    for executor in executors() {
        let img = Image::filled(Geometry::new(&[6, 5, 4]), 42.5f64);
        assert_eq!(run(executor, &img, &[2, 2, 2]), img);
    }
}

#[test]
fn three_by_three_box() {
    // 0 1 2
    // 3 4 5
    // 6 7 8
    let img = Image::from_vec(Geometry::new(&[3, 3]), (0..9).map(|v| v as f32).collect());
    for executor in executors() {
        let out = run(executor, &img, &[1, 1]);
        assert_eq!(out.get(&[1, 1]), 4.0);
        // Corner box repeats the edge: {0,0,1, 0,0,1, 3,3,4} / 9.
        assert_eq!(out.get(&[0, 0]), 12.0 / 9.0);
    }
}

#[test]
fn zero_radius_copies_input() {
    let img = texture::<f32>(Geometry::new(&[5, 4]));
    for executor in executors() {
        assert_eq!(run(executor, &img, &[0, 0]), img);
    }
}

// ===== Pixel types =====

#[test]
fn unsigned_char_runs_on_host_only() {
    let img = texture::<u8>(Geometry::new(&[6, 6, 6]));
    let out = run(Executor::Host, &img, &[2, 2, 2]);
    assert_eq!(out.geometry(), img.geometry());

    let mut f = MeanImageFilter::<u8>::new(MeanConfig::default(), Executor::Accelerator(DeviceContext::host(1)));
    f.set_input(img);
    assert!(matches!(f.update(), Err(GpuError::UnsupportedPixelType("unsigned char"))));
}
