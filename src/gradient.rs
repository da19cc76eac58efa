// gradient.rs — Central-difference image gradients.
//
// Two flavours are needed by the registration update:
//   - at a grid index of the fixed image (exact samples), and
//   - at a continuous index of the moving image (samples interpolated one
//     pixel either side of the mapped point).
//
// Both return derivatives in physical units (divided by spacing). An axis
// whose ±1 neighbours are not both inside the grid gets a zero derivative,
// so border pixels never see a one-sided difference.
//
// The zero-flux variant used by anisotropic diffusion clamps neighbours
// instead; a clamped border sample equals the centre, so the difference
// across the boundary vanishes.

use crate::image::{interpolate_linear, Image, Pixel, MAX_DIM};

/// Gradient of component 0 at a grid index.
pub fn central_difference_at_index<T: Pixel>(img: &Image<T>, index: &[usize; MAX_DIM]) -> [f64; MAX_DIM] {
    let g = img.geometry();
    let size = g.extent();
    let spacing = g.full_spacing();
    let mut grad = [0.0; MAX_DIM];
    for d in 0..g.dim() {
        if index[d] < 1 || index[d] + 1 >= size[d] {
            continue;
        }
        let mut hi = *index;
        let mut lo = *index;
        hi[d] += 1;
        lo[d] -= 1;
        grad[d] = (img.at(&hi, 0).to_f64() - img.at(&lo, 0).to_f64()) * 0.5 / spacing[d];
    }
    grad
}

/// Gradient of component 0 at a continuous index, from interpolated samples.
pub fn central_difference_at_continuous_index<T: Pixel>(
    img: &Image<T>,
    cindex: &[f64; MAX_DIM],
) -> [f64; MAX_DIM] {
    let g = img.geometry();
    let spacing = g.full_spacing();
    let mut grad = [0.0; MAX_DIM];
    for d in 0..g.dim() {
        let mut hi = *cindex;
        let mut lo = *cindex;
        hi[d] += 1.0;
        lo[d] -= 1.0;
        if !g.is_inside_buffer(&hi) || !g.is_inside_buffer(&lo) {
            continue;
        }
        grad[d] = (interpolate_linear(img, &hi, 0) - interpolate_linear(img, &lo, 0)) * 0.5 / spacing[d];
    }
    grad
}

/// Squared gradient magnitude at a grid index with clamped (zero-flux)
/// neighbours. `coefficients` scale each axis' derivative.
pub fn gradient_magnitude_squared<T: Pixel>(
    img: &Image<T>,
    index: &[usize; MAX_DIM],
    coefficients: &[f64; MAX_DIM],
) -> f64 {
    let g = img.geometry();
    let base = [index[0] as isize, index[1] as isize, index[2] as isize];
    let mut acc = 0.0;
    for d in 0..g.dim() {
        let mut hi = base;
        let mut lo = base;
        hi[d] += 1;
        lo[d] -= 1;
        let dx = (img.at_clamped(&hi, 0).to_f64() - img.at_clamped(&lo, 0).to_f64()) * 0.5 * coefficients[d];
        acc += dx * dx;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Geometry;

    fn ramp_x(w: usize, h: usize, spacing: f64) -> Image<f32> {
        let g = Geometry::new(&[w, h]).with_spacing(&[spacing, spacing]);
        let data = (0..w * h).map(|i| (i % w) as f32 * 2.0).collect();
        Image::from_vec(g, data)
    }

    #[test]
    fn test_index_gradient_on_ramp() {
        let img = ramp_x(6, 4, 1.0);
        let grad = central_difference_at_index(&img, &[2, 1, 0]);
        assert!((grad[0] - 2.0).abs() < 1e-12);
        assert_eq!(grad[1], 0.0);
    }

    #[test]
    fn test_index_gradient_zero_on_border() {
        let img = ramp_x(6, 4, 1.0);
        let grad = central_difference_at_index(&img, &[0, 1, 0]);
        assert_eq!(grad[0], 0.0);
        let grad = central_difference_at_index(&img, &[5, 1, 0]);
        assert_eq!(grad[0], 0.0);
    }

    #[test]
    fn test_gradient_scaled_by_spacing() {
        let img = ramp_x(6, 4, 2.0);
        let grad = central_difference_at_index(&img, &[2, 1, 0]);
        assert!((grad[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_continuous_gradient_matches_index_gradient() {
        let img = ramp_x(8, 8, 1.0);
        let a = central_difference_at_index(&img, &[3, 3, 0]);
        let b = central_difference_at_continuous_index(&img, &[3.0, 3.0, 0.0]);
        assert!((a[0] - b[0]).abs() < 1e-12);
        let c = central_difference_at_continuous_index(&img, &[3.5, 3.0, 0.0]);
        assert!((c[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_flux_magnitude() {
        let img = ramp_x(5, 3, 1.0);
        // Interior: dx = 2, dy = 0.
        let m = gradient_magnitude_squared(&img, &[2, 1, 0], &[1.0, 1.0, 1.0]);
        assert!((m - 4.0).abs() < 1e-12);
        // Left border: clamped neighbour halves the difference.
        let m = gradient_magnitude_squared(&img, &[0, 1, 0], &[1.0, 1.0, 1.0]);
        assert!((m - 1.0).abs() < 1e-12);
    }
}
