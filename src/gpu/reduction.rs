// gpu/reduction.rs — Parallel sum reduction.
//
// Two-level tree reduction: one device pass writes a partial sum per
// work-group, then the partials are folded. With `cpu_final_reduction` the
// host folds them straight away; without it, further device passes run over
// the partials until at most `cpu_final_threshold` remain, and only those
// are folded on the host.
//
// KERNEL VARIANTS (numbered after the classic series):
//   2 — one element per work-item.
//   5 — two elements per work-item, first add during load.
//   6 — grid-stride loop over a capped number of work-groups. Compiled per
//       `N_IS_POW2`: the power-of-two build skips the bounds check on the
//       second load, so it is only correct when n is a power of two.
//
// Geometry follows `num_blocks_and_threads`. Launches needing more than
// 65535 work-groups use a 2-D grid; the tail of that grid contributes zero
// partials.

use std::sync::Arc;

use tracing::debug;

use crate::config::{ReductionConfig, ReductionVariant};
use crate::error::{GpuError, Result};
use crate::gpu::buffer::BufferManager;
use crate::gpu::context::DeviceContext;
use crate::gpu::host::HostLaunch;
use crate::gpu::kernel::{ArgKind, Defines, EntryPoint, KernelManager, KernelSource};
use crate::image::{Pixel, PixelType};

const MAX_GROUPS_PER_DIM: usize = 65535;

const REDUCE_ARGS: &[ArgKind] = &[ArgKind::Buffer, ArgKind::BufferMut, ArgKind::Scalar];

pub static REDUCTION: KernelSource = KernelSource {
    id: "reduction",
    wgsl: include_str!("../shaders/reduction.wgsl"),
    entry_points: &[
        EntryPoint { name: "reduce2", args: REDUCE_ARGS, host: reduce2_host },
        EntryPoint { name: "reduce5", args: REDUCE_ARGS, host: reduce5_host },
        EntryPoint { name: "reduce6", args: REDUCE_ARGS, host: reduce6_host },
    ],
};

// ---------------------------------------------------------------------------
// Element types and geometry
// ---------------------------------------------------------------------------

/// Element types the reduction kernels are instantiated for.
pub trait ReduceElement: Pixel {
    /// Addition as the device performs it (wrapping for integers).
    fn reduce_add(self, other: Self) -> Self;
}

impl ReduceElement for i32 {
    fn reduce_add(self, other: Self) -> Self {
        self.wrapping_add(other)
    }
}

impl ReduceElement for u32 {
    fn reduce_add(self, other: Self) -> Self {
        self.wrapping_add(other)
    }
}

impl ReduceElement for f32 {
    fn reduce_add(self, other: Self) -> Self {
        self + other
    }
}

impl ReduceElement for f64 {
    fn reduce_add(self, other: Self) -> Self {
        self + other
    }
}

/// Smallest power of two ≥ `x`; 0 maps to 0.
pub fn next_pow2(x: usize) -> usize {
    if x == 0 {
        0
    } else {
        x.next_power_of_two()
    }
}

/// `(x & (x - 1)) == 0`; true for 0 as well.
pub fn is_pow2(x: usize) -> bool {
    x & x.wrapping_sub(1) == 0
}

/// `(blocks, threads)` for reducing `n` elements with `variant`.
pub fn num_blocks_and_threads(
    n: usize,
    variant: ReductionVariant,
    max_blocks: usize,
    max_threads: usize,
) -> (usize, usize) {
    let (mut blocks, threads) = if variant.number() < 3 {
        let threads = if n < max_threads { next_pow2(n) } else { max_threads };
        (n.div_ceil(threads.max(1)), threads)
    } else {
        let threads = if n < max_threads * 2 { next_pow2(n.div_ceil(2)) } else { max_threads };
        ((n + threads * 2 - 1) / (threads * 2).max(1), threads)
    };
    if variant == ReductionVariant::GridStride && blocks > max_blocks {
        blocks = max_blocks;
    }
    (blocks, threads)
}

/// Work-group grid covering `blocks` groups within the per-axis limit.
fn group_grid(blocks: usize) -> [usize; 2] {
    if blocks <= MAX_GROUPS_PER_DIM {
        [blocks, 1]
    } else {
        [MAX_GROUPS_PER_DIM, blocks.div_ceil(MAX_GROUPS_PER_DIM)]
    }
}

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

/// Sum of a device buffer.
///
/// ```text
/// initialize_kernel(n) → allocate_input_buffer(len) → set_input(..) → generate()
/// ```
pub struct Reduction<T: ReduceElement> {
    kernels: KernelManager,
    config: ReductionConfig,
    max_threads: usize,
    size: usize,
    input: Option<Arc<BufferManager<T>>>,
    gpu_result: T,
    cpu_result: T,
    passes: usize,
}

impl<T: ReduceElement> Reduction<T> {
    pub fn new(ctx: Arc<DeviceContext>, config: ReductionConfig) -> Result<Self> {
        config.validate()?;
        let max_threads = if ctx.info().max_workgroup_size < config.max_threads {
            config.small_block_threads
        } else {
            config.max_threads
        };
        Ok(Reduction {
            kernels: KernelManager::new(ctx),
            config,
            max_threads,
            size: 0,
            input: None,
            gpu_result: T::default(),
            cpu_result: T::default(),
            passes: 0,
        })
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    /// Threads per work-group cap after the device limit check.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Number of elements the next `generate` reduces.
    pub fn size(&self) -> usize {
        self.size
    }

    /// `(blocks, threads)` of the first pass for the current size.
    pub fn geometry(&self) -> (usize, usize) {
        self.geometry_for(self.size)
    }

    fn geometry_for(&self, n: usize) -> (usize, usize) {
        num_blocks_and_threads(n, self.config.variant, self.config.max_blocks, self.max_threads)
    }

    /// Set the element count and build the first-pass kernel for it.
    pub fn initialize_kernel(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(GpuError::DeviceAllocation { bytes: 0, reason: "reduction over zero elements".into() });
        }
        if n > u32::MAX as usize {
            return Err(GpuError::InvalidArgument(format!("reduction of {n} elements exceeds the u32 index range")));
        }
        self.size = n;
        let (blocks, threads) = self.geometry_for(n);
        self.load(threads, is_pow2(n))?;
        debug!(n, blocks, threads, variant = ?self.config.variant, "reduction kernel ready");
        Ok(())
    }

    /// Fresh zeroed input buffer of `len` elements.
    pub fn allocate_input_buffer(&mut self, len: usize) -> Result<Arc<BufferManager<T>>> {
        let buf = Arc::new(BufferManager::new(Arc::clone(self.kernels.context())));
        buf.allocate(len)?;
        buf.set_device_dirty_flag(true);
        self.input = Some(Arc::clone(&buf));
        Ok(buf)
    }

    /// Copy `data` into the input buffer (allocated on demand to `data.len()`).
    pub fn set_input(&mut self, data: &[T]) -> Result<()> {
        let reusable = self.input.as_ref().filter(|buf| buf.len() == data.len()).cloned();
        let input = match reusable {
            Some(buf) => buf,
            None => self.allocate_input_buffer(data.len())?,
        };
        input.copy_from_slice(data)
    }

    /// Reduce an existing buffer in place of the owned input.
    pub fn set_input_buffer(&mut self, buffer: Arc<BufferManager<T>>) {
        self.input = Some(buffer);
    }

    pub fn input_buffer(&self) -> Option<&Arc<BufferManager<T>>> {
        self.input.as_ref()
    }

    pub fn release_input_buffer(&mut self) {
        if let Some(buf) = self.input.take() {
            if Arc::strong_count(&buf) == 1 {
                buf.initialize();
            }
        }
    }

    /// Device sum of the first `size()` input elements, using the kernel
    /// build that matches `size()`'s power-of-two-ness.
    pub fn generate(&mut self) -> Result<T> {
        self.reduce_with(is_pow2(self.size))
    }

    /// As [`generate`](Self::generate) with the first pass compiled for
    /// `n_is_pow2` regardless of the actual size. A mismatched build gives
    /// a wrong sum for the grid-stride variant.
    pub fn reduce_with(&mut self, n_is_pow2: bool) -> Result<T> {
        let n = self.size;
        if n == 0 {
            return Err(GpuError::InvalidArgument("initialize_kernel must run before reduce".into()));
        }
        let input = self
            .input
            .clone()
            .ok_or_else(|| GpuError::InvalidArgument("reduction has no input buffer".into()))?;
        if input.len() < n {
            return Err(GpuError::InvalidArgument(format!(
                "input buffer holds {} elements, reduction expects {n}",
                input.len()
            )));
        }

        let mut partials = self.pass(&input, n, n_is_pow2)?;
        self.passes = 1;
        let threshold = self.config.cpu_final_threshold.max(1);
        while !self.config.cpu_final_reduction && partials.len() > threshold {
            let m = partials.len();
            partials = self.pass(&partials, m, is_pow2(m))?;
            self.passes += 1;
        }

        let result = partials.with_host(|p| p.iter().fold(T::default(), |acc, &v| acc.reduce_add(v)))?;
        debug!(n, passes = self.passes, "reduction done");
        self.gpu_result = result;
        Ok(result)
    }

    fn load(&mut self, threads: usize, n_is_pow2: bool) -> Result<()> {
        let defines = Defines::new()
            .pixel("T", T::TYPE)
            .define("BLOCK_SIZE", threads)
            .define("N_IS_POW2", n_is_pow2);
        self.kernels.load_program(&REDUCTION, &defines)
    }

    fn pass(&mut self, input: &Arc<BufferManager<T>>, n: usize, n_is_pow2: bool) -> Result<Arc<BufferManager<T>>> {
        let (blocks, threads) = self.geometry_for(n);
        let [gx, gy] = group_grid(blocks);

        self.load(threads, n_is_pow2)?;
        let kernel = self.kernels.create_kernel(self.config.variant.entry_point())?;
        let output = Arc::new(BufferManager::new(Arc::clone(self.kernels.context())));
        output.allocate(gx * gy)?;

        self.kernels.set_kernel_arg_with_buffer(kernel, 0, input)?;
        self.kernels.set_kernel_arg_with_buffer(kernel, 1, &output)?;
        self.kernels.set_kernel_arg_scalar(kernel, 2, n as u32)?;
        if gy == 1 {
            self.kernels.launch(kernel, 1, &[gx * threads], &[threads])?;
        } else {
            self.kernels.launch(kernel, 2, &[gx * threads, gy], &[threads, 1])?;
        }
        Ok(output)
    }

    /// Result of the last device reduction.
    pub fn gpu_result(&self) -> T {
        self.gpu_result
    }

    /// Result of the last [`cpu_reference`](Self::cpu_reference).
    pub fn cpu_result(&self) -> T {
        self.cpu_result
    }

    /// Device passes used by the last reduction.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Serial host sum of `data`, recorded as the CPU result.
    pub fn cpu_reference(&mut self, data: &[T]) -> T {
        self.cpu_result = data.iter().fold(T::default(), |acc, &v| acc.reduce_add(v));
        self.cpu_result
    }

    /// One-shot device sum of `data` with the default configuration.
    pub fn sum(ctx: &Arc<DeviceContext>, data: &[T]) -> Result<T> {
        let mut r = Reduction::new(Arc::clone(ctx), ReductionConfig::default())?;
        r.initialize_kernel(data.len())?;
        r.set_input(data)?;
        r.generate()
    }
}

// ---------------------------------------------------------------------------
// Host emulation
// ---------------------------------------------------------------------------

fn reduce2_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    reduce_host(hl, ReductionVariant::SinglePerThread)
}

fn reduce5_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    reduce_host(hl, ReductionVariant::FirstAddDuringLoad)
}

fn reduce6_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    reduce_host(hl, ReductionVariant::GridStride)
}

fn reduce_host(hl: &mut HostLaunch<'_>, variant: ReductionVariant) -> Result<()> {
    match hl.pixel("T")? {
        PixelType::Int => reduce_emulated::<i32>(hl, variant),
        PixelType::UInt => reduce_emulated::<u32>(hl, variant),
        PixelType::Float => reduce_emulated::<f32>(hl, variant),
        PixelType::Double => reduce_emulated::<f64>(hl, variant),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn reduce_emulated<T: ReduceElement>(hl: &mut HostLaunch<'_>, variant: ReductionVariant) -> Result<()> {
    let input: Vec<T> = hl.buffer(0)?;
    let n = hl.scalar::<u32>(2)? as usize;
    let n_is_pow2 = hl.define_bool("N_IS_POW2")?;
    let bs = hl.local[0];
    let [gx, gy, _] = hl.groups();
    let num_groups = gx * gy;
    // Out-of-range loads read zero, as robust buffer access may.
    let load = |i: usize| input.get(i).copied().unwrap_or_default();

    let mut partials = vec![T::default(); num_groups];
    let mut sdata = vec![T::default(); bs];
    for (g, partial) in partials.iter_mut().enumerate() {
        for (tid, slot) in sdata.iter_mut().enumerate() {
            *slot = match variant {
                ReductionVariant::SinglePerThread => {
                    let i = g * bs + tid;
                    if i < n {
                        load(i)
                    } else {
                        T::default()
                    }
                }
                ReductionVariant::FirstAddDuringLoad => {
                    let i = g * bs * 2 + tid;
                    let mut v = if i < n { load(i) } else { T::default() };
                    if i + bs < n {
                        v = v.reduce_add(load(i + bs));
                    }
                    v
                }
                ReductionVariant::GridStride => {
                    let grid_size = bs * 2 * num_groups;
                    let mut i = g * bs * 2 + tid;
                    let mut sum = T::default();
                    while i < n {
                        sum = sum.reduce_add(load(i));
                        if n_is_pow2 || i + bs < n {
                            sum = sum.reduce_add(load(i + bs));
                        }
                        i += grid_size;
                    }
                    sum
                }
            };
        }
        let mut s = bs / 2;
        while s > 0 {
            for tid in 0..s {
                sdata[tid] = sdata[tid].reduce_add(sdata[tid + s]);
            }
            s >>= 1;
        }
        *partial = sdata[0];
    }
    hl.store(1, &partials)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Arc<DeviceContext> {
        DeviceContext::host(1)
    }

    #[test]
    fn test_next_pow2() {
        assert_eq!(next_pow2(0), 0);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(64), 64);
        assert_eq!(next_pow2(65), 128);
    }

    #[test]
    fn test_is_pow2() {
        assert!(is_pow2(1));
        assert!(is_pow2(1024));
        assert!(!is_pow2(1023));
        assert!(!is_pow2(1025));
    }

    #[test]
    fn test_geometry_grid_stride() {
        // Small n: one block, threads from ceil(n/2).
        assert_eq!(num_blocks_and_threads(7, ReductionVariant::GridStride, 64, 128), (1, 4));
        assert_eq!(num_blocks_and_threads(1, ReductionVariant::GridStride, 64, 128), (1, 1));
        // Large n: capped at max_blocks.
        assert_eq!(num_blocks_and_threads(1 << 20, ReductionVariant::GridStride, 64, 128), (64, 128));
    }

    #[test]
    fn test_geometry_single_per_thread() {
        assert_eq!(num_blocks_and_threads(100, ReductionVariant::SinglePerThread, 64, 128), (1, 128));
        assert_eq!(num_blocks_and_threads(1000, ReductionVariant::SinglePerThread, 64, 128), (8, 128));
    }

    #[test]
    fn test_group_grid_splits_large_launches() {
        assert_eq!(group_grid(10), [10, 1]);
        assert_eq!(group_grid(MAX_GROUPS_PER_DIM + 1), [MAX_GROUPS_PER_DIM, 2]);
    }

    #[test]
    fn test_sum_of_ones() {
        let ctx = host();
        assert_eq!(Reduction::<i32>::sum(&ctx, &[1; 8]).unwrap(), 8);
        assert_eq!(Reduction::<i32>::sum(&ctx, &[1; 7]).unwrap(), 7);
    }

    #[test]
    fn test_zero_elements_is_allocation_error() {
        let mut r = Reduction::<f32>::new(host(), ReductionConfig::default()).unwrap();
        assert!(matches!(r.initialize_kernel(0), Err(GpuError::DeviceAllocation { .. })));
    }

    #[test]
    fn test_cpu_reference_records_result() {
        let mut r = Reduction::<u32>::new(host(), ReductionConfig::default()).unwrap();
        assert_eq!(r.cpu_reference(&[1, 2, 3]), 6);
        assert_eq!(r.cpu_result(), 6);
    }
}
