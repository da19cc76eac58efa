// mean.rs — Neighbourhood mean filter.
//
// Each output component is the mean of a box of (2r+1) samples per axis
// centred on the pixel. Samples past the border repeat the edge pixel
// (zero-flux), so every output averages the full box and a constant image
// is left unchanged. The output has the input's pixel type; integer types
// round the mean half away from zero.
//
// Radii on axes beyond the image dimensionality are ignored.

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::info;

use crate::config::MeanConfig;
use crate::error::{GpuError, Result};
use crate::image::{Image, Pixel, MAX_DIM};
use crate::solver::Executor;

/// Radius per axis with axes past `dim` zeroed.
pub fn effective_radius(radius: &[usize; MAX_DIM], dim: usize) -> [usize; MAX_DIM] {
    let mut r = [0; MAX_DIM];
    r[..dim].copy_from_slice(&radius[..dim]);
    r
}

/// Mean of component `c` over the clamped box around `index`.
pub fn mean_at<T: Pixel>(img: &Image<T>, index: &[usize; MAX_DIM], radius: &[usize; MAX_DIM], c: usize) -> f64 {
    let [rx, ry, rz] = (*radius).map(|r| r as isize);
    let [x, y, z] = (*index).map(|i| i as isize);
    let mut sum = 0.0;
    for dz in -rz..=rz {
        for dy in -ry..=ry {
            for dx in -rx..=rx {
                sum += img.at_clamped(&[x + dx, y + dy, z + dz], c).to_f64();
            }
        }
    }
    let count = (2 * rx + 1) * (2 * ry + 1) * (2 * rz + 1);
    sum / count as f64
}

/// Host mean of every pixel, one rayon task per pixel.
pub fn mean_image<T: Pixel>(img: &Image<T>, radius: &[usize; MAX_DIM]) -> Image<T> {
    let g = *img.geometry();
    let radius = effective_radius(radius, g.dim());
    let components = g.components();
    let mut out = Image::new(g);
    out.as_mut_slice().par_chunks_mut(components).enumerate().for_each(|(p, pixel)| {
        let index = g.index_of(p);
        for (c, v) in pixel.iter_mut().enumerate() {
            *v = T::from_f64(mean_at(img, &index, &radius, c));
        }
    });
    out
}

/// Box mean with a per-axis radius.
pub struct MeanImageFilter<T: Pixel> {
    radius: [usize; MAX_DIM],
    executor: Executor,
    input: Option<Arc<Image<T>>>,
    output: Option<Image<T>>,
}

impl<T: Pixel> MeanImageFilter<T> {
    pub fn new(config: MeanConfig, executor: Executor) -> Self {
        MeanImageFilter { radius: config.radius, executor, input: None, output: None }
    }

    pub fn radius(&self) -> [usize; MAX_DIM] {
        self.radius
    }

    /// Per-axis radius; axes not listed keep radius 0.
    pub fn set_radius(&mut self, radius: &[usize]) -> Result<()> {
        if radius.len() > MAX_DIM {
            return Err(GpuError::InvalidArgument(format!("radius {radius:?} has more than {MAX_DIM} axes")));
        }
        self.radius = [0; MAX_DIM];
        self.radius[..radius.len()].copy_from_slice(radius);
        self.output = None;
        Ok(())
    }

    pub fn set_input(&mut self, image: Image<T>) {
        self.input = Some(Arc::new(image));
        self.output = None;
    }

    pub fn output(&self) -> Option<&Image<T>> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<Image<T>> {
        self.output.take()
    }

    pub fn update(&mut self) -> Result<()> {
        let input = self.input.clone().ok_or_else(|| GpuError::InvalidArgument("input image not set".into()))?;
        info!(executor = self.executor.name(), pixel = %T::TYPE, radius = ?self.radius, "mean filter");
        let out = match &self.executor {
            Executor::Host => mean_image(&input, &self.radius),
            Executor::Accelerator(ctx) => crate::gpu::mean::mean_on_device(Arc::clone(ctx), &input, &self.radius)?,
        };
        self.output = Some(out);
        Ok(())
    }
}

impl<T: Pixel> fmt::Debug for MeanImageFilter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeanImageFilter")
            .field("pixel", &T::TYPE)
            .field("executor", &self.executor)
            .field("radius", &self.radius)
            .finish()
    }
}
