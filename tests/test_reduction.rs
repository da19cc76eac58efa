// tests/test_reduction.rs — Reduction engine on the host backend.
//
// Sizes straddle the power-of-two boundaries and the block cap, where the
// grid-stride kernel's bounds handling matters.

use std::sync::Arc;

use fdgpu::config::{ReductionConfig, ReductionVariant};
use fdgpu::gpu::{DeviceContext, Reduction};

const VARIANTS: [ReductionVariant; 3] =
    [ReductionVariant::SinglePerThread, ReductionVariant::FirstAddDuringLoad, ReductionVariant::GridStride];

fn ctx() -> Arc<DeviceContext> {
    DeviceContext::host(1)
}

fn reduce_ones(variant: ReductionVariant, n: usize) -> i32 {
    let cfg = ReductionConfig { variant, ..ReductionConfig::default() };
    let mut r = Reduction::<i32>::new(ctx(), cfg).unwrap();
    r.initialize_kernel(n).unwrap();
    r.set_input(&vec![1; n]).unwrap();
    let sum = r.generate().unwrap();
    assert_eq!(r.cpu_reference(&vec![1; n]), n as i32);
    sum
}

#[test]
fn sum_of_ones_matches_count() {
    for variant in VARIANTS {
        for n in [1usize, 2, 1023, 1024, 1025] {
            assert_eq!(reduce_ones(variant, n), n as i32, "{variant:?} n={n}");
        }
    }
}

/// Deterministic values in −10..=10 (xorshift32).
fn small_random(n: usize, mut seed: u32) -> Vec<i32> {
    (0..n)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed % 21) as i32 - 10
        })
        .collect()
}

fn input_table(n: usize) -> [(&'static str, Vec<i32>); 3] {
    [("zeros", vec![0; n]), ("sevens", vec![7; n]), ("random", small_random(n, 0x2545_f491 ^ n as u32))]
}

fn check_inputs(sizes: &[usize]) {
    for variant in VARIANTS {
        for cpu_final_reduction in [true, false] {
            let cfg = ReductionConfig { variant, cpu_final_reduction, ..ReductionConfig::default() };
            for &n in sizes {
                for (name, data) in input_table(n) {
                    let expected: i64 = data.iter().map(|&v| v as i64).sum();
                    let mut r = Reduction::<i32>::new(ctx(), cfg.clone()).unwrap();
                    r.initialize_kernel(n).unwrap();
                    r.set_input(&data).unwrap();
                    assert_eq!(
                        r.generate().unwrap() as i64,
                        expected,
                        "{variant:?} cpu_final={cpu_final_reduction} n={n} {name}"
                    );
                }
            }
        }
    }
}

#[test]
fn zero_equal_and_random_inputs() {
    check_inputs(&[1, 2, 1023, 1024, 1025]);
}

#[test]
fn zero_equal_and_random_inputs_large() {
    check_inputs(&[(1 << 24) - 1917]);
}

#[test]
fn large_non_power_of_two() {
    let n = (1usize << 24) - 1917;
    assert_eq!(reduce_ones(ReductionVariant::GridStride, n), n as i32);
}

#[test]
fn float_sum_is_exact_for_small_integers() {
    let data: Vec<f32> = (0..1000).map(|i| (i % 7) as f32).collect();
    let expected: f32 = data.iter().sum();
    assert_eq!(Reduction::<f32>::sum(&ctx(), &data).unwrap(), expected);
}

#[test]
fn double_sum() {
    let data: Vec<f64> = (0..4097).map(|i| i as f64 * 0.5).collect();
    let expected = 4096.0 * 4097.0 / 4.0;
    assert_eq!(Reduction::<f64>::sum(&ctx(), &data).unwrap(), expected);
}

/// The power-of-two build skips the second bounds check, so run over a
/// 7-element prefix of an 8-element buffer it also counts the 8th element.
#[test]
fn mismatched_pow2_build_reads_past_size() {
    let mut r = Reduction::<i32>::new(ctx(), ReductionConfig::default()).unwrap();
    r.set_input(&[1; 8]).unwrap();
    r.initialize_kernel(7).unwrap();
    assert_eq!(r.reduce_with(true).unwrap(), 8);
    assert_eq!(r.reduce_with(false).unwrap(), 7);
    assert_eq!(r.generate().unwrap(), 7);
}

#[test]
fn device_final_reduction_uses_several_passes() {
    let cfg = ReductionConfig {
        variant: ReductionVariant::SinglePerThread,
        cpu_final_reduction: false,
        cpu_final_threshold: 1,
        ..ReductionConfig::default()
    };
    let n = 100_000;
    let mut r = Reduction::<u32>::new(ctx(), cfg).unwrap();
    r.initialize_kernel(n).unwrap();
    r.set_input(&vec![3; n]).unwrap();
    assert_eq!(r.generate().unwrap(), 3 * n as u32);
    assert!(r.passes() > 1, "passes = {}", r.passes());
    assert_eq!(r.gpu_result(), 3 * n as u32);
}

#[test]
fn host_final_reduction_uses_one_pass() {
    let mut r = Reduction::<u32>::new(ctx(), ReductionConfig::default()).unwrap();
    r.initialize_kernel(50_000).unwrap();
    r.set_input(&vec![2; 50_000]).unwrap();
    assert_eq!(r.generate().unwrap(), 100_000);
    assert_eq!(r.passes(), 1);
}

#[test]
fn shared_input_buffer_is_reduced_in_place() {
    let c = ctx();
    let mut r = Reduction::<i32>::new(Arc::clone(&c), ReductionConfig::default()).unwrap();
    r.initialize_kernel(16).unwrap();
    let buf = r.allocate_input_buffer(16).unwrap();
    buf.with_host_mut(|h| h.iter_mut().enumerate().for_each(|(i, v)| *v = i as i32)).unwrap();
    assert_eq!(r.generate().unwrap(), 120);
    buf.with_host_mut(|h| h[0] = 100).unwrap();
    assert_eq!(r.generate().unwrap(), 220);
}

#[test]
fn reduce_without_input_is_an_error() {
    let mut r = Reduction::<f32>::new(ctx(), ReductionConfig::default()).unwrap();
    r.initialize_kernel(4).unwrap();
    assert!(r.generate().is_err());
    r.set_input(&[1.0; 2]).unwrap();
    assert!(r.generate().is_err(), "input shorter than the kernel size");
}
