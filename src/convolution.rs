// convolution.rs — Separable Gaussian smoothing of N-D (vector) images.
//
// Used to regularise displacement fields between registration iterations.
// A Gaussian is separable, so an N-D blur is N one-dimensional passes, one
// per axis, each applied to every component independently.
//
// BORDER HANDLING: clamp (replicate edge pixels), i.e. zero-flux.
//
// KERNEL SIZE: the sampled Gaussian is truncated at the smallest radius
// whose discarded tail mass is at most `max_error`, and never wider than
// `max_width` taps. The truncated kernel is renormalised to sum to one, so
// constant fields pass through unchanged.

use crate::image::{Image, Pixel, MAX_DIM};

/// Normalised, truncated, sampled 1-D Gaussian with odd length.
///
/// `sigma <= 0` yields the identity kernel `[1.0]`.
pub fn gaussian_kernel(sigma: f64, max_error: f64, max_width: usize) -> Vec<f64> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let weight = |i: f64| (-(i * i) / (2.0 * sigma * sigma)).exp();

    // Total mass of the untruncated sampled kernel; the tail past 10σ is
    // below f64 resolution.
    let far = (10.0 * sigma).ceil() as i64;
    let total: f64 = (-far..=far).map(|i| weight(i as f64)).sum();

    let max_radius = max_width.max(1).saturating_sub(1) / 2;
    let mut radius = 0usize;
    let mut mass = weight(0.0);
    while radius < max_radius && 1.0 - mass / total > max_error {
        radius += 1;
        mass += 2.0 * weight(radius as f64);
    }

    let mut kernel: Vec<f64> = (-(radius as i64)..=radius as i64).map(|i| weight(i as f64)).collect();
    let sum: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Convolve every component of `src` along `axis` with a centred kernel.
pub fn convolve_axis<T: Pixel>(src: &Image<T>, axis: usize, kernel: &[f64]) -> Image<T> {
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());
    let g = *src.geometry();
    assert!(axis < g.dim(), "axis {axis} out of range for {}D image", g.dim());

    let half = (kernel.len() / 2) as isize;
    let comps = g.components();
    let mut dst = Image::<T>::new(g);
    let out = dst.as_mut_slice();

    for linear in 0..g.num_pixels() {
        let idx = g.index_of(linear);
        let base = [idx[0] as isize, idx[1] as isize, idx[2] as isize];
        for c in 0..comps {
            let mut acc = 0.0;
            for (ki, &kv) in kernel.iter().enumerate() {
                let mut s = base;
                s[axis] += ki as isize - half;
                acc += kv * src.at_clamped(&s, c).to_f64();
            }
            out[linear * comps + c] = T::from_f64(acc);
        }
    }
    dst
}

/// Separable Gaussian smoothing with a per-axis standard deviation (in pixels).
pub fn smooth<T: Pixel>(src: &Image<T>, sigmas: &[f64], max_error: f64, max_width: usize) -> Image<T> {
    let dim = src.geometry().dim();
    let mut out = src.clone();
    for axis in 0..dim.min(MAX_DIM) {
        let sigma = sigmas.get(axis).copied().unwrap_or(0.0);
        let kernel = gaussian_kernel(sigma, max_error, max_width);
        if kernel.len() == 1 {
            continue;
        }
        out = convolve_axis(&out, axis, &kernel);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Geometry;

    #[test]
    fn test_kernel_normalised_and_symmetric() {
        let k = gaussian_kernel(1.0, 0.1, 30);
        assert_eq!(k.len() % 2, 1);
        let sum: f64 = k.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        for i in 0..k.len() / 2 {
            assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-15);
        }
    }

    #[test]
    fn test_kernel_width_capped() {
        let k = gaussian_kernel(50.0, 1e-6, 7);
        assert_eq!(k.len(), 7);
    }

    #[test]
    fn test_tighter_error_widens_kernel() {
        let loose = gaussian_kernel(2.0, 0.1, 64);
        let tight = gaussian_kernel(2.0, 0.001, 64);
        assert!(tight.len() > loose.len());
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        assert_eq!(gaussian_kernel(0.0, 0.1, 30), vec![1.0]);
    }

    #[test]
    fn test_constant_field_unchanged() {
        let g = Geometry::new(&[5, 4]).vector_field();
        let img = Image::<f32>::filled(g, 3.0);
        let out = smooth(&img, &[1.0, 1.0], 0.1, 30);
        for &v in out.as_slice() {
            assert!((v - 3.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_impulse_spreads_along_axis_only() {
        let g = Geometry::new(&[5, 5]);
        let mut img = Image::<f64>::new(g);
        img.set(&[2, 2], 1.0);
        let k = [0.25, 0.5, 0.25];
        let out = convolve_axis(&img, 0, &k);
        assert_eq!(out.get(&[1, 2]), 0.25);
        assert_eq!(out.get(&[2, 2]), 0.5);
        assert_eq!(out.get(&[2, 1]), 0.0);
    }
}
