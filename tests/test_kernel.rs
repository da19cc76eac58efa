// tests/test_kernel.rs — Program cache, argument binding and launch checks.
//
// Everything runs on the host backend; the apply-update program serves as
// a small real kernel to bind and launch.

use std::sync::Arc;

use fdgpu::gpu::apply::APPLY_UPDATE;
use fdgpu::gpu::backend::{CompiledProgram, ComputeBackend, DeviceInfo, DeviceMemory, Launch};
use fdgpu::gpu::host::HostBackend;
use fdgpu::gpu::kernel::{image_extent_args, image_local_size, round_up_global, KernelHandle};
use fdgpu::gpu::{BufferManager, DeviceContext, Defines, KernelManager, KernelSource};
use fdgpu::{Geometry, GpuError, PixelType, Result};

fn apply_defines(pixel: PixelType, dim: usize) -> Defines {
    Defines::new().pixel("T", pixel).dim(dim).workgroup(image_local_size(dim))
}

/// Apply-update kernel over a 1-D image of `n` pixels, every argument bound.
fn bound_apply(ctx: &Arc<DeviceContext>, n: usize) -> (KernelManager, KernelHandle, Vec<Arc<BufferManager<f32>>>) {
    let mut k = KernelManager::new(Arc::clone(ctx));
    k.load_program(&APPLY_UPDATE, &apply_defines(PixelType::Float, 1)).unwrap();
    let h = k.create_kernel("apply_update").unwrap();
    let out = Arc::new(BufferManager::from_vec(Arc::clone(ctx), vec![1.0f32; n]).unwrap());
    let upd = Arc::new(BufferManager::from_vec(Arc::clone(ctx), vec![2.0f32; n]).unwrap());
    k.set_kernel_arg_with_buffer(h, 0, &out).unwrap();
    k.set_kernel_arg_with_buffer(h, 1, &upd).unwrap();
    for (i, v) in image_extent_args(&Geometry::new(&[n])).into_iter().enumerate() {
        k.set_kernel_arg_scalar(h, 2 + i, v).unwrap();
    }
    k.set_kernel_arg_scalar(h, 6, 0.5f32).unwrap();
    (k, h, vec![out, upd])
}

#[test]
fn same_program_builds_once() {
    let ctx = DeviceContext::host(1);
    let defines = apply_defines(PixelType::Float, 2);
    let mut a = KernelManager::new(Arc::clone(&ctx));
    let mut b = KernelManager::new(Arc::clone(&ctx));
    a.load_program(&APPLY_UPDATE, &defines).unwrap();
    b.load_program(&APPLY_UPDATE, &defines).unwrap();
    assert_eq!(ctx.programs_built(), 1);
    assert!(Arc::ptr_eq(a.program().unwrap(), b.program().unwrap()));

    // A different define block is a different program.
    a.load_program(&APPLY_UPDATE, &apply_defines(PixelType::Double, 2)).unwrap();
    assert_eq!(ctx.programs_built(), 2);
}

#[test]
fn launch_applies_update() {
    let ctx = DeviceContext::host(1);
    let n = 64;
    let (k, h, bufs) = bound_apply(&ctx, n);
    k.launch(h, 1, &[round_up_global(n, 64)], &[64]).unwrap();
    assert_eq!(bufs[0].to_vec().unwrap(), vec![2.0; n]);
    assert_eq!(bufs[1].to_vec().unwrap(), vec![2.0; n]);
}

#[test]
fn global_not_multiple_of_local_is_rejected() {
    let ctx = DeviceContext::host(1);
    let (k, h, _bufs) = bound_apply(&ctx, 10);
    let err = k.launch(h, 1, &[10], &[64]).unwrap_err();
    assert!(matches!(err, GpuError::InvalidWorkGroupSize { .. }));
    let err = k.launch(h, 1, &[64], &[0]).unwrap_err();
    assert!(matches!(err, GpuError::InvalidWorkGroupSize { .. }));
    let err = k.launch(h, 4, &[64, 1, 1, 1], &[64, 1, 1, 1]).unwrap_err();
    assert!(matches!(err, GpuError::InvalidWorkGroupSize { .. }));
}

#[test]
fn unbound_argument_is_rejected() {
    let ctx = DeviceContext::host(1);
    let mut k = KernelManager::new(Arc::clone(&ctx));
    k.load_program(&APPLY_UPDATE, &apply_defines(PixelType::Float, 1)).unwrap();
    let h = k.create_kernel("apply_update").unwrap();
    let out = Arc::new(BufferManager::from_vec(Arc::clone(&ctx), vec![0.0f32; 4]).unwrap());
    k.set_kernel_arg_with_buffer(h, 0, &out).unwrap();
    let err = k.launch(h, 1, &[64], &[64]).unwrap_err();
    assert!(matches!(err, GpuError::InvalidArgument(_)), "{err}");
}

#[test]
fn argument_kind_and_index_are_checked() {
    let ctx = DeviceContext::host(1);
    let mut k = KernelManager::new(Arc::clone(&ctx));
    k.load_program(&APPLY_UPDATE, &apply_defines(PixelType::Float, 1)).unwrap();
    let h = k.create_kernel("apply_update").unwrap();
    let buf = Arc::new(BufferManager::from_vec(Arc::clone(&ctx), vec![0.0f32; 4]).unwrap());
    assert!(matches!(k.set_kernel_arg_scalar(h, 0, 1u32), Err(GpuError::InvalidArgument(_))));
    assert!(matches!(k.set_kernel_arg_with_buffer(h, 3, &buf), Err(GpuError::InvalidArgument(_))));
    assert!(matches!(k.set_kernel_arg_scalar(h, 7, 1u32), Err(GpuError::InvalidArgument(_))));
    assert!(matches!(k.set_kernel_arg(h, 2, &[0u8; 2]), Err(GpuError::InvalidArgument(_))));
}

#[test]
fn unknown_entry_point() {
    let ctx = DeviceContext::host(1);
    let mut k = KernelManager::new(ctx);
    assert!(matches!(k.create_kernel("apply_update"), Err(GpuError::InvalidArgument(_))), "no program yet");
    k.load_program(&APPLY_UPDATE, &apply_defines(PixelType::Float, 1)).unwrap();
    let err = k.create_kernel("no_such_kernel").unwrap_err();
    assert!(matches!(err, GpuError::KernelNotFound(ref name) if name == "no_such_kernel"));
}

#[test]
fn command_queue_range() {
    let ctx = DeviceContext::host(2);
    let mut k = KernelManager::new(ctx);
    k.set_command_queue(1).unwrap();
    assert!(matches!(k.set_command_queue(2), Err(GpuError::InvalidQueue { id: 2, count: 2 })));
}

/// Host backend that refuses every pixel type except `float`.
struct FloatOnly(HostBackend);

impl ComputeBackend for FloatOnly {
    fn info(&self) -> &DeviceInfo {
        self.0.info()
    }

    fn queue_count(&self) -> usize {
        self.0.queue_count()
    }

    fn supports(&self, pixel: PixelType) -> bool {
        pixel == PixelType::Float
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceMemory> {
        self.0.allocate(bytes)
    }

    fn write(&self, queue: usize, mem: &DeviceMemory, data: &[u8]) -> Result<()> {
        self.0.write(queue, mem, data)
    }

    fn read(&self, queue: usize, mem: &DeviceMemory, out: &mut [u8]) -> Result<()> {
        self.0.read(queue, mem, out)
    }

    fn build(&self, source: &'static KernelSource, defines: &Defines) -> Result<CompiledProgram> {
        self.0.build(source, defines)
    }

    fn dispatch(&self, queue: usize, launch: &Launch<'_>) -> Result<()> {
        self.0.dispatch(queue, launch)
    }
}

#[test]
fn unsupported_pixel_type_is_reported_before_building() {
    let ctx = DeviceContext::with_backend(Box::new(FloatOnly(HostBackend::new(1))));
    let mut k = KernelManager::new(Arc::clone(&ctx));
    let err = k.load_program(&APPLY_UPDATE, &apply_defines(PixelType::Double, 1)).unwrap_err();
    assert!(matches!(err, GpuError::UnsupportedPixelType("double")));
    assert_eq!(ctx.programs_built(), 0);
    k.load_program(&APPLY_UPDATE, &apply_defines(PixelType::Float, 1)).unwrap();
    assert_eq!(ctx.programs_built(), 1);
}
