// image.rs — Host-side N-dimensional image container, generic over pixel type.
//
// An image is a `Geometry` (dimensionality 1–3, per-axis size, spacing and
// origin, components per pixel) plus a flat row-major `Vec<T>`. Vector
// pixels such as displacement fields are stored interleaved: pixel `p`
// owns elements `[p * components, (p + 1) * components)`.
//
// Axes beyond `dim` are carried internally with size 1, spacing 1 and
// origin 0 so every routine can loop over three axes without branching on
// the dimensionality. Public accessors only expose the first `dim` entries.
//
// The same `Geometry` describes device-resident images (`gpu::image`), and
// is what kernels receive as scalar arguments.

use std::fmt;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::error::{GpuError, Result};
use crate::gpu::reduction::ReduceElement;

/// Highest supported dimensionality.
pub const MAX_DIM: usize = 3;

// ---------------------------------------------------------------------------
// Pixel types
// ---------------------------------------------------------------------------

/// The closed set of pixel types kernels can be instantiated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    UChar,
    Char,
    Short,
    Int,
    UInt,
    Float,
    Double,
}

impl PixelType {
    /// C-family type name, used in rendered define blocks.
    pub fn cl_name(self) -> &'static str {
        match self {
            PixelType::UChar => "unsigned char",
            PixelType::Char => "char",
            PixelType::Short => "short",
            PixelType::Int => "int",
            PixelType::UInt => "unsigned int",
            PixelType::Float => "float",
            PixelType::Double => "double",
        }
    }

    /// WGSL storage type, if WGSL can hold this type in a storage buffer.
    pub fn wgsl_name(self) -> Option<&'static str> {
        match self {
            PixelType::Int => Some("i32"),
            PixelType::UInt => Some("u32"),
            PixelType::Float => Some("f32"),
            PixelType::Double => Some("f64"),
            PixelType::UChar | PixelType::Char | PixelType::Short => None,
        }
    }

    pub fn from_cl_name(name: &str) -> Option<Self> {
        match name {
            "unsigned char" => Some(PixelType::UChar),
            "char" => Some(PixelType::Char),
            "short" => Some(PixelType::Short),
            "int" => Some(PixelType::Int),
            "unsigned int" => Some(PixelType::UInt),
            "float" => Some(PixelType::Float),
            "double" => Some(PixelType::Double),
            _ => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, PixelType::Float | PixelType::Double)
    }

    pub fn size_bytes(self) -> usize {
        match self {
            PixelType::UChar | PixelType::Char => 1,
            PixelType::Short => 2,
            PixelType::Int | PixelType::UInt | PixelType::Float => 4,
            PixelType::Double => 8,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cl_name())
    }
}

/// Element types that can be stored in an [`Image`] and shipped to a device.
///
/// `Pod` lets host buffers be reinterpreted as bytes for transfers.
pub trait Pixel: Pod + Default + PartialOrd + fmt::Debug + Send + Sync + 'static {
    const TYPE: PixelType;
    /// Lowest finite value.
    const LOWEST: Self;
    const HIGHEST: Self;

    fn to_f64(self) -> f64;

    /// Convert back from `f64`, rounding and saturating for integer types.
    fn from_f64(v: f64) -> Self;
}

macro_rules! int_pixel {
    ($t:ty, $pt:expr) => {
        impl Pixel for $t {
            const TYPE: PixelType = $pt;
            const LOWEST: Self = <$t>::MIN;
            const HIGHEST: Self = <$t>::MAX;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                // `as` saturates on overflow and maps NaN to 0.
                v.round() as $t
            }
        }
    };
}

int_pixel!(u8, PixelType::UChar);
int_pixel!(i8, PixelType::Char);
int_pixel!(i16, PixelType::Short);
int_pixel!(i32, PixelType::Int);
int_pixel!(u32, PixelType::UInt);

impl Pixel for f32 {
    const TYPE: PixelType = PixelType::Float;
    const LOWEST: Self = f32::MIN;
    const HIGHEST: Self = f32::MAX;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Pixel for f64 {
    const TYPE: PixelType = PixelType::Double;
    const LOWEST: Self = f64::MIN;
    const HIGHEST: Self = f64::MAX;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
}

/// Floating-point pixels: the types PDE solvers produce. Every one of them
/// can also be summed by the reduction kernels.
pub trait RealPixel: ReduceElement {}

impl RealPixel for f32 {}
impl RealPixel for f64 {}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Size, spacing, origin and component count of an image grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    dim: usize,
    size: [usize; MAX_DIM],
    spacing: [f64; MAX_DIM],
    origin: [f64; MAX_DIM],
    components: usize,
}

impl Geometry {
    /// Grid of the given per-axis size, unit spacing, zero origin, scalar pixels.
    ///
    /// `GpuError::Geometry` if `size` is empty, longer than [`MAX_DIM`], or
    /// has a zero extent.
    pub fn try_new(size: &[usize]) -> Result<Self> {
        if !(1..=MAX_DIM).contains(&size.len()) {
            return Err(GpuError::Geometry(format!(
                "image dimensionality must be 1..={MAX_DIM}, got {}",
                size.len()
            )));
        }
        if size.contains(&0) {
            return Err(GpuError::Geometry(format!("image extents must be non-zero: {size:?}")));
        }
        let mut full = [1usize; MAX_DIM];
        full[..size.len()].copy_from_slice(size);
        Ok(Geometry {
            dim: size.len(),
            size: full,
            spacing: [1.0; MAX_DIM],
            origin: [0.0; MAX_DIM],
            components: 1,
        })
    }

    /// [`Geometry::try_new`] for sizes known to be valid (literals, tests).
    ///
    /// # Panics
    /// If `size` is empty, longer than [`MAX_DIM`], or has a zero extent.
    pub fn new(size: &[usize]) -> Self {
        match Self::try_new(size) {
            Ok(g) => g,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn with_spacing(mut self, spacing: &[f64]) -> Self {
        assert_eq!(spacing.len(), self.dim, "spacing length must equal dimensionality");
        self.spacing[..self.dim].copy_from_slice(spacing);
        self
    }

    pub fn with_origin(mut self, origin: &[f64]) -> Self {
        assert_eq!(origin.len(), self.dim, "origin length must equal dimensionality");
        self.origin[..self.dim].copy_from_slice(origin);
        self
    }

    pub fn with_components(mut self, components: usize) -> Self {
        assert!(components > 0, "pixels need at least one component");
        self.components = components;
        self
    }

    /// Same grid, one displacement component per axis.
    pub fn vector_field(&self) -> Self {
        self.with_components(self.dim)
    }

    /// Same grid, scalar pixels.
    pub fn scalar(&self) -> Self {
        self.with_components(1)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn size(&self) -> &[usize] {
        &self.size[..self.dim]
    }

    pub fn spacing(&self) -> &[f64] {
        &self.spacing[..self.dim]
    }

    pub fn origin(&self) -> &[f64] {
        &self.origin[..self.dim]
    }

    /// Size padded to three axes with 1.
    pub fn extent(&self) -> [usize; MAX_DIM] {
        self.size
    }

    /// Spacing padded to three axes with 1.0.
    pub fn full_spacing(&self) -> [f64; MAX_DIM] {
        self.spacing
    }

    /// Origin padded to three axes with 0.0.
    pub fn full_origin(&self) -> [f64; MAX_DIM] {
        self.origin
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn num_pixels(&self) -> usize {
        self.size.iter().product()
    }

    /// Total scalar elements (`num_pixels * components`).
    pub fn num_elements(&self) -> usize {
        self.num_pixels() * self.components
    }

    /// Pixel stride along axis `d`, in pixels.
    pub fn stride(&self, d: usize) -> usize {
        self.size[..d].iter().product()
    }

    /// Linear pixel offset of an N-D index, or `None` if out of range.
    pub fn linear_index(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.dim {
            return None;
        }
        let mut offset = 0;
        for d in (0..self.dim).rev() {
            if index[d] >= self.size[d] {
                return None;
            }
            offset = offset * self.size[d] + index[d];
        }
        Some(offset)
    }

    /// Inverse of [`Geometry::linear_index`], padded to three axes.
    pub fn index_of(&self, linear: usize) -> [usize; MAX_DIM] {
        let mut rest = linear;
        let mut index = [0usize; MAX_DIM];
        for d in 0..MAX_DIM {
            index[d] = rest % self.size[d];
            rest /= self.size[d];
        }
        index
    }

    /// Physical location of a grid index (axis-aligned, no direction matrix).
    pub fn physical_point(&self, index: &[usize; MAX_DIM]) -> [f64; MAX_DIM] {
        let mut p = [0.0; MAX_DIM];
        for d in 0..self.dim {
            p[d] = self.origin[d] + index[d] as f64 * self.spacing[d];
        }
        p
    }

    /// Continuous grid index of a physical point.
    pub fn continuous_index(&self, point: &[f64; MAX_DIM]) -> [f64; MAX_DIM] {
        let mut c = [0.0; MAX_DIM];
        for d in 0..self.dim {
            c[d] = (point[d] - self.origin[d]) / self.spacing[d];
        }
        c
    }

    /// True when the continuous index lies inside `[0, size - 1]` on every axis.
    pub fn is_inside_buffer(&self, cindex: &[f64; MAX_DIM]) -> bool {
        (0..self.dim).all(|d| cindex[d] >= 0.0 && cindex[d] <= (self.size[d] - 1) as f64)
    }

    /// Same size, spacing and origin (component count ignored).
    pub fn same_grid(&self, other: &Geometry) -> bool {
        self.dim == other.dim
            && self.size == other.size
            && self.spacing == other.spacing
            && self.origin == other.origin
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}D {:?} spacing {:?} origin {:?} x{}",
            self.dim,
            self.size(),
            self.spacing(),
            self.origin(),
            self.components
        )
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// A host-resident image: geometry plus interleaved pixel data.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    geometry: Geometry,
    data: Vec<T>,
}

impl<T: Pixel> Image<T> {
    /// Zero-initialised image.
    pub fn new(geometry: Geometry) -> Self {
        Image { geometry, data: vec![T::default(); geometry.num_elements()] }
    }

    /// Image with every element set to `value`.
    pub fn filled(geometry: Geometry, value: T) -> Self {
        Image { geometry, data: vec![value; geometry.num_elements()] }
    }

    /// Wrap existing data.
    ///
    /// # Panics
    /// If `data.len() != geometry.num_elements()`.
    pub fn from_vec(geometry: Geometry, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            geometry.num_elements(),
            "data length {} does not match geometry {geometry}",
            data.len()
        );
        Image { geometry, data }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// First component of the pixel at `index`.
    ///
    /// # Panics
    /// If `index` is outside the grid.
    pub fn get(&self, index: &[usize]) -> T {
        self.data[self.offset(index)]
    }

    pub fn set(&mut self, index: &[usize], value: T) {
        let o = self.offset(index);
        self.data[o] = value;
    }

    /// All components of the pixel at `index`.
    pub fn get_vector(&self, index: &[usize]) -> &[T] {
        let o = self.offset(index);
        &self.data[o..o + self.geometry.components]
    }

    pub fn set_vector(&mut self, index: &[usize], value: &[T]) {
        assert_eq!(value.len(), self.geometry.components, "component count mismatch");
        let o = self.offset(index);
        self.data[o..o + value.len()].copy_from_slice(value);
    }

    /// Components of the pixel at a linear pixel offset.
    #[inline]
    pub fn pixel(&self, linear: usize) -> &[T] {
        let c = self.geometry.components;
        &self.data[linear * c..(linear + 1) * c]
    }

    /// Component `c` at a three-axis index; no bounds check beyond the slice's own.
    #[inline]
    pub fn at(&self, index: &[usize; MAX_DIM], c: usize) -> T {
        let g = &self.geometry;
        let linear = index[0] + g.size[0] * (index[1] + g.size[1] * index[2]);
        self.data[linear * g.components + c]
    }

    /// Component `c` at a three-axis index with each axis clamped to the grid.
    #[inline]
    pub fn at_clamped(&self, index: &[isize; MAX_DIM], c: usize) -> T {
        let g = &self.geometry;
        let mut clamped = [0usize; MAX_DIM];
        for d in 0..MAX_DIM {
            clamped[d] = index[d].clamp(0, g.size[d] as isize - 1) as usize;
        }
        self.at(&clamped, c)
    }

    fn offset(&self, index: &[usize]) -> usize {
        match self.geometry.linear_index(index) {
            Some(p) => p * self.geometry.components,
            None => panic!("index {index:?} out of bounds for {}", self.geometry),
        }
    }
}

impl<T: Pixel> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image<{}>({})", T::TYPE, self.geometry)?;
        if self.data.len() <= 16 {
            write!(f, " {:?}", self.data)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Linear interpolation
// ---------------------------------------------------------------------------

/// N-linear interpolation of component `c` at a continuous index.
///
/// Neighbours outside the grid are clamped to the border, so the result is
/// defined everywhere; callers that need the strict interpolation domain
/// test [`Geometry::is_inside_buffer`] first.
pub fn interpolate_linear<T: Pixel>(img: &Image<T>, cindex: &[f64; MAX_DIM], c: usize) -> f64 {
    let dim = img.geometry.dim;
    let mut base = [0isize; MAX_DIM];
    let mut frac = [0.0f64; MAX_DIM];
    for d in 0..dim {
        let f = cindex[d].floor();
        base[d] = f as isize;
        frac[d] = cindex[d] - f;
    }

    let mut value = 0.0;
    for corner in 0..(1usize << dim) {
        let mut weight = 1.0;
        let mut idx = base;
        for d in 0..dim {
            if corner & (1 << d) != 0 {
                idx[d] += 1;
                weight *= frac[d];
            } else {
                weight *= 1.0 - frac[d];
            }
        }
        if weight == 0.0 {
            continue;
        }
        value += weight * img.at_clamped(&idx, c).to_f64();
    }
    value
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
