// threshold.rs — Binary threshold functor.
//
// output = inside   if lower ≤ v ≤ upper
//          outside  otherwise
//
// Defaults cover the whole input range: lower is the input type's lowest
// value, upper its highest, inside the output type's highest and outside 0.
// Kernel scalars are bound in the order lower, upper, inside, outside.

use crate::config::ThresholdConfig;
use crate::error::Result;
use crate::functor::{PixelFunctor, UnaryFunctorFilter};
use crate::gpu::functor::BINARY_THRESHOLD;
use crate::gpu::kernel::{KernelHandle, KernelManager, KernelSource};
use crate::image::Pixel;
use crate::solver::Executor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinaryThreshold<I: Pixel, O: Pixel> {
    lower: I,
    upper: I,
    inside: O,
    outside: O,
}

impl<I: Pixel, O: Pixel> Default for BinaryThreshold<I, O> {
    fn default() -> Self {
        BinaryThreshold { lower: I::LOWEST, upper: I::HIGHEST, inside: O::HIGHEST, outside: O::default() }
    }
}

impl<I: Pixel, O: Pixel> BinaryThreshold<I, O> {
    /// Defaults overridden by whichever values `config` sets.
    pub fn from_config(config: &ThresholdConfig) -> Self {
        let d = Self::default();
        BinaryThreshold {
            lower: config.lower.map_or(d.lower, I::from_f64),
            upper: config.upper.map_or(d.upper, I::from_f64),
            inside: config.inside.map_or(d.inside, O::from_f64),
            outside: config.outside.map_or(d.outside, O::from_f64),
        }
    }

    pub fn lower_threshold(&self) -> I {
        self.lower
    }

    pub fn set_lower_threshold(&mut self, v: I) {
        self.lower = v;
    }

    pub fn upper_threshold(&self) -> I {
        self.upper
    }

    pub fn set_upper_threshold(&mut self, v: I) {
        self.upper = v;
    }

    pub fn inside_value(&self) -> O {
        self.inside
    }

    pub fn set_inside_value(&mut self, v: O) {
        self.inside = v;
    }

    pub fn outside_value(&self) -> O {
        self.outside
    }

    pub fn set_outside_value(&mut self, v: O) {
        self.outside = v;
    }
}

impl<I: Pixel, O: Pixel> PixelFunctor<I, O> for BinaryThreshold<I, O> {
    fn kernel_source(&self) -> &'static KernelSource {
        &BINARY_THRESHOLD
    }

    fn entry_point(&self) -> &'static str {
        "binary_threshold"
    }

    #[inline]
    fn evaluate(&self, value: I) -> O {
        if self.lower <= value && value <= self.upper {
            self.inside
        } else {
            self.outside
        }
    }

    fn set_kernel_arguments(&self, kernels: &mut KernelManager, handle: KernelHandle, first: usize) -> Result<usize> {
        kernels.set_kernel_arg_scalar(handle, first, self.lower)?;
        kernels.set_kernel_arg_scalar(handle, first + 1, self.upper)?;
        kernels.set_kernel_arg_scalar(handle, first + 2, self.inside)?;
        kernels.set_kernel_arg_scalar(handle, first + 3, self.outside)?;
        Ok(first + 4)
    }
}

pub type BinaryThresholdImageFilter<I, O> = UnaryFunctorFilter<I, O, BinaryThreshold<I, O>>;

/// Threshold filter configured from `config`.
pub fn binary_threshold_filter<I: Pixel, O: Pixel>(
    config: &ThresholdConfig,
    executor: Executor,
) -> BinaryThresholdImageFilter<I, O> {
    UnaryFunctorFilter::new(BinaryThreshold::from_config(config), executor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functor::apply_functor;
    use crate::image::{Geometry, Image};

    #[test]
    fn test_defaults_span_input_range() {
        let t = BinaryThreshold::<i16, u8>::default();
        assert_eq!(t.lower_threshold(), i16::MIN);
        assert_eq!(t.upper_threshold(), i16::MAX);
        assert_eq!(t.inside_value(), 255);
        assert_eq!(t.outside_value(), 0);
        assert_eq!(t.evaluate(i16::MIN), 255);
        let f = BinaryThreshold::<f32, f32>::default();
        assert_eq!(f.evaluate(-1e30), f32::MAX);
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let mut t = BinaryThreshold::<f64, u32>::default();
        t.set_lower_threshold(10.0);
        t.set_upper_threshold(20.0);
        t.set_inside_value(1);
        assert_eq!(t.evaluate(10.0), 1);
        assert_eq!(t.evaluate(20.0), 1);
        assert_eq!(t.evaluate(9.999), 0);
        assert_eq!(t.evaluate(20.5), 0);
    }

    #[test]
    fn test_from_config_keeps_unset_defaults() {
        let cfg = ThresholdConfig { lower: Some(3.0), outside: Some(7.0), ..ThresholdConfig::default() };
        let t = BinaryThreshold::<i32, i32>::from_config(&cfg);
        assert_eq!(t.lower_threshold(), 3);
        assert_eq!(t.upper_threshold(), i32::MAX);
        assert_eq!(t.inside_value(), i32::MAX);
        assert_eq!(t.outside_value(), 7);
    }

    #[test]
    fn test_host_filter() {
        let img = Image::from_vec(Geometry::new(&[5]), vec![0u8, 50, 100, 150, 200]);
        let mut t = BinaryThreshold::<u8, u8>::default();
        t.set_lower_threshold(50);
        t.set_upper_threshold(150);
        assert_eq!(apply_functor(&img, &t).as_slice(), &[0, 255, 255, 255, 0]);

        let mut f = BinaryThresholdImageFilter::<u8, u8>::new(t, Executor::Host);
        f.set_input(img);
        f.functor_mut().set_inside_value(1);
        f.update().unwrap();
        assert_eq!(f.output().unwrap().as_slice(), &[0, 1, 1, 1, 0]);
    }
}
