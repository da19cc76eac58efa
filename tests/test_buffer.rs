// tests/test_buffer.rs — Dirty-flag protocol of BufferManager.
//
// Runs on the host backend, so no GPU is needed. The property test drives a
// buffer through random sequences of host writes, simulated kernel writes
// and syncs, and checks it against a two-copy model after every step.

use std::sync::Arc;

use fdgpu::gpu::backend::DeviceMemory;
use fdgpu::gpu::{BufferManager, DeviceContext};
use fdgpu::GpuError;
use proptest::prelude::*;

const LEN: usize = 6;

#[derive(Debug, Clone)]
enum Op {
    /// Host writes `value` at `index` through `with_host_mut`.
    HostWrite(usize, u32),
    /// A kernel binds the buffer writable and stores `value` everywhere.
    KernelWrite(u32),
    /// A kernel binds the buffer read-only.
    KernelRead,
    MarkDeviceDirty,
    MarkHostDirty,
    SyncHost,
    SyncDevice,
    Resolve,
    ReadHost,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..LEN, any::<u32>()).prop_map(|(i, v)| Op::HostWrite(i, v)),
        any::<u32>().prop_map(Op::KernelWrite),
        Just(Op::KernelRead),
        Just(Op::MarkDeviceDirty),
        Just(Op::MarkHostDirty),
        Just(Op::SyncHost),
        Just(Op::SyncDevice),
        Just(Op::Resolve),
        Just(Op::ReadHost),
    ]
}

fn bind(b: &BufferManager<u32>, writable: bool) -> DeviceMemory {
    use fdgpu::gpu::buffer::DeviceBinding;
    b.bind(writable).unwrap()
}

fn device_contents(ctx: &Arc<DeviceContext>, mem: &DeviceMemory) -> Vec<u32> {
    let mut bytes = vec![0u8; LEN * 4];
    ctx.backend().read(0, mem, &mut bytes).unwrap();
    bytes.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

proptest! {
    /// The protocol never sets both flags, and a host read always returns
    /// the most recent write from either side.
    #[test]
    fn dirty_flags_track_latest_write(ops in prop::collection::vec(op(), 1..40)) {
        let ctx = DeviceContext::host(1);
        let b = BufferManager::from_vec(Arc::clone(&ctx), vec![0u32; LEN]).unwrap();
        let mut latest = vec![0u32; LEN];

        for op in ops {
            match op {
                Op::HostWrite(i, v) => {
                    b.with_host_mut(|h| h[i] = v).unwrap();
                    latest[i] = v;
                    prop_assert!(b.device_dirty());
                }
                Op::KernelWrite(v) => {
                    let mem = bind(&b, true);
                    // Binding pushed every pending host write.
                    prop_assert_eq!(device_contents(&ctx, &mem), latest.clone());
                    ctx.backend().write(0, &mem, bytemuck::cast_slice(&[v; LEN])).unwrap();
                    latest = vec![v; LEN];
                    prop_assert!(b.host_dirty());
                }
                Op::KernelRead => {
                    let mem = bind(&b, false);
                    prop_assert_eq!(device_contents(&ctx, &mem), latest.clone());
                    prop_assert!(!b.device_dirty());
                }
                Op::MarkDeviceDirty => {
                    b.mark_device_dirty().unwrap();
                    prop_assert!(!b.host_dirty());
                }
                Op::MarkHostDirty => {
                    b.mark_host_dirty().unwrap();
                    prop_assert!(!b.device_dirty());
                }
                Op::SyncHost => {
                    b.sync_host_from_device().unwrap();
                    prop_assert!(!b.host_dirty());
                }
                Op::SyncDevice => {
                    b.sync_device_from_host().unwrap();
                    prop_assert!(!b.device_dirty());
                }
                Op::Resolve => {
                    b.resolve().unwrap();
                    prop_assert!(!b.host_dirty() && !b.device_dirty());
                }
                Op::ReadHost => {
                    prop_assert_eq!(b.to_vec().unwrap(), latest.clone());
                }
            }
            prop_assert!(!(b.host_dirty() && b.device_dirty()));
        }
        prop_assert_eq!(b.to_vec().unwrap(), latest);
    }

    /// Each sync transfers at most once, however often it is repeated.
    #[test]
    fn repeated_syncs_transfer_once(repeats in 1usize..8) {
        let ctx = DeviceContext::host(1);
        let b = BufferManager::from_vec(ctx, vec![3u32; LEN]).unwrap();
        for _ in 0..repeats {
            b.sync_device_from_host().unwrap();
        }
        prop_assert_eq!(b.transfer_count(), 1);
        bind(&b, true);
        for _ in 0..repeats {
            b.sync_host_from_device().unwrap();
        }
        prop_assert_eq!(b.transfer_count(), 2);
    }
}

#[test]
fn both_flags_set_is_inconsistent() {
    let b = BufferManager::from_vec(DeviceContext::host(1), vec![0u32; LEN]).unwrap();
    b.set_host_dirty_flag(true);
    b.set_device_dirty_flag(true);
    assert!(matches!(b.resolve(), Err(GpuError::InconsistentState)));
}

#[test]
fn copy_from_slice_discards_pending_device_data() {
    let ctx = DeviceContext::host(1);
    let b = BufferManager::from_vec(Arc::clone(&ctx), vec![1u32; LEN]).unwrap();
    let mem = bind(&b, true);
    ctx.backend().write(0, &mem, bytemuck::cast_slice(&[9u32; LEN])).unwrap();
    b.copy_from_slice(&[4u32; LEN]).unwrap();
    assert!(!b.host_dirty());
    assert_eq!(b.to_vec().unwrap(), vec![4; LEN]);
    assert_eq!(device_contents(&ctx, &bind(&b, false)), vec![4; LEN]);
}

#[test]
fn copy_from_slice_rejects_other_length() {
    let b = BufferManager::from_vec(DeviceContext::host(1), vec![0u32; LEN]).unwrap();
    assert!(matches!(b.copy_from_slice(&[1, 2]), Err(GpuError::InvalidArgument(_))));
}

#[test]
fn concurrent_host_syncs_share_one_transfer() {
    let ctx = DeviceContext::host(1);
    let b = BufferManager::from_vec(Arc::clone(&ctx), vec![1u32; LEN]).unwrap();
    let mem = bind(&b, true);
    ctx.backend().write(0, &mem, bytemuck::cast_slice(&[5u32; LEN])).unwrap();
    assert!(b.host_dirty());
    let before = b.transfer_count();

    let reads: Vec<Vec<u32>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    b.sync_host_from_device().unwrap();
                    b.to_vec().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(b.transfer_count(), before + 1);
    assert!(reads.iter().all(|r| r == &vec![5u32; LEN]));
    assert!(!b.host_dirty());
}
