// gpu/mod.rs — Accelerator layer.
//
// Everything that touches device memory or launches a kernel lives here.
// The host-side modules in the parent crate stay the reference: every
// kernel has a host emulation built on the same per-pixel functions, and
// the tests compare the two.
//
// LAYERS
// ──────
//   backend    ComputeBackend trait, DeviceInfo, device memory, programs
//   device     wgpu implementation (adapter selection, WGSL pipelines)
//   host       CPU implementation that runs the kernels' host emulations
//   context    one selected device, its queues and the program cache
//   buffer     host/device buffer pair with the dirty-flag protocol
//   kernel     WGSL templates, argument binding, launch geometry
//   reduction  multi-pass parallel sum
//   image      Image<T> whose pixels live in a BufferManager
//
// Filter kernels on top: apply (output += dt·update), smooth (separable
// Gaussian), demons and diffusion (per-pixel updates plus statistics),
// mean (box neighbourhood) and functor (per-pixel maps, binary threshold).

pub mod backend;
pub mod device;
pub mod host;
pub mod context;
pub mod buffer;
pub mod kernel;
pub mod reduction;
pub mod image;

pub mod apply;
pub mod smooth;
pub mod demons;
pub mod diffusion;
pub mod mean;
pub mod functor;

pub use buffer::BufferManager;
pub use context::DeviceContext;
pub use image::GpuImage;
pub use kernel::{Defines, KernelManager, KernelSource};
pub use reduction::Reduction;
