// gpu/buffer.rs — Host/device buffer manager with a two-flag dirty protocol.
//
// Each `BufferManager<T>` owns one logical array in two places: a host
// `Vec<T>` and a device allocation. Two independent flags say which copy
// is stale:
//
//   host_dirty   — the device holds newer data; pull before any host read.
//   device_dirty — the host holds newer data; push before any kernel use.
//
// PROTOCOL
// ────────
//   mark_device_dirty   pull first if the host was stale, then set device_dirty.
//                       Call before writing the host copy.
//   mark_host_dirty     push first if the device was stale, then set host_dirty.
//                       Call before a kernel writes the device copy.
//   sync_*              no-op unless the matching flag is set; otherwise one
//                       blocking transfer on the buffer's queue, flag cleared.
//   resolve             both flags set is a protocol violation
//                       (`InconsistentState`); otherwise the single needed sync.
//
// Because each `mark_*` settles the other side first, the protocol itself
// never leaves both flags set. Only the raw flag setters, used by producers
// that wrote one side behind the manager's back, can create that state.
//
// LOCKING
// ───────
// One `parking_lot::Mutex` per buffer guards the flags, the host vector and
// the device handle. Transfers run with the lock held, so concurrent readers
// serialise on the single physical copy and later callers see a clean flag.
// Unrelated buffers never contend.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{GpuError, Result};
use crate::gpu::backend::DeviceMemory;
use crate::gpu::context::DeviceContext;

/// Round `value` up to the next multiple of `alignment`.
///
///   align_to(10, 4) = 12
///   align_to(12, 4) = 12
#[inline]
pub(crate) fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Storage buffers are addressed in 4-byte words.
const DEVICE_ALIGNMENT: usize = 4;

struct BufferState<T> {
    host: Vec<T>,
    device: Option<DeviceMemory>,
    host_dirty: bool,
    device_dirty: bool,
    queue: usize,
}

/// One logical array mirrored in host and device memory.
pub struct BufferManager<T: Pod> {
    ctx: Arc<DeviceContext>,
    state: Mutex<BufferState<T>>,
    transfers: AtomicUsize,
}

impl<T: Pod + Send + Sync> BufferManager<T> {
    /// Empty, unsized manager.
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        BufferManager {
            ctx,
            state: Mutex::new(BufferState {
                host: Vec::new(),
                device: None,
                host_dirty: false,
                device_dirty: false,
                queue: 0,
            }),
            transfers: AtomicUsize::new(0),
        }
    }

    /// Manager holding `data` on the host, device copy allocated and marked stale.
    pub fn from_vec(ctx: Arc<DeviceContext>, data: Vec<T>) -> Result<Self> {
        let mgr = Self::new(ctx);
        {
            let mut st = mgr.state.lock();
            st.host = data;
        }
        mgr.allocate_device()?;
        mgr.set_device_dirty_flag(true);
        Ok(mgr)
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    // -----------------------------------------------------------------------
    // Sizing and lifecycle
    // -----------------------------------------------------------------------

    /// Resize the host copy to `len` zeroed elements and drop any device
    /// allocation of the previous size. Flags are left untouched.
    pub fn set_buffer_size(&self, len: usize) {
        let mut st = self.state.lock();
        if st.host.len() != len {
            st.host = vec![T::zeroed(); len];
            st.device = None;
        }
    }

    /// Size the buffer to `len` elements and create device storage for it.
    ///
    /// Device contents are uninitialised; mark a side dirty to drive the
    /// first transfer.
    pub fn allocate(&self, len: usize) -> Result<()> {
        self.set_buffer_size(len);
        self.allocate_device()
    }

    fn allocate_device(&self) -> Result<()> {
        let mut st = self.state.lock();
        let bytes = align_to(st.host.len() * std::mem::size_of::<T>(), DEVICE_ALIGNMENT);
        if bytes == 0 {
            return Err(GpuError::DeviceAllocation { bytes, reason: "buffer has zero length".into() });
        }
        let mem = self.ctx.backend().allocate(bytes)?;
        debug!(bytes, "allocated device buffer");
        st.device = Some(mem);
        Ok(())
    }

    /// Release device memory and reset to the empty state.
    pub fn initialize(&self) {
        let mut st = self.state.lock();
        st.host = Vec::new();
        st.device = None;
        st.host_dirty = false;
        st.device_dirty = false;
        st.queue = 0;
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.state.lock().host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_device_allocation(&self) -> bool {
        self.state.lock().device.is_some()
    }

    // -----------------------------------------------------------------------
    // Flags
    // -----------------------------------------------------------------------

    pub fn host_dirty(&self) -> bool {
        self.state.lock().host_dirty
    }

    pub fn device_dirty(&self) -> bool {
        self.state.lock().device_dirty
    }

    /// Set the host-stale flag without any transfer.
    pub fn set_host_dirty_flag(&self, dirty: bool) {
        self.state.lock().host_dirty = dirty;
    }

    /// Set the device-stale flag without any transfer.
    pub fn set_device_dirty_flag(&self, dirty: bool) {
        self.state.lock().device_dirty = dirty;
    }

    /// Host copy is about to change: settle the host first, then mark the
    /// device stale.
    pub fn mark_device_dirty(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.pull(&mut st)?;
        st.device_dirty = true;
        Ok(())
    }

    /// Device copy is about to change: settle the device first, then mark
    /// the host stale.
    pub fn mark_host_dirty(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.push(&mut st)?;
        st.host_dirty = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Synchronisation
    // -----------------------------------------------------------------------

    pub fn sync_host_from_device(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.pull(&mut st)
    }

    pub fn sync_device_from_host(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.push(&mut st)
    }

    /// Perform whichever single sync is pending.
    pub fn resolve(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.host_dirty && st.device_dirty {
            return Err(GpuError::InconsistentState);
        }
        self.pull(&mut st)?;
        self.push(&mut st)
    }

    fn pull(&self, st: &mut BufferState<T>) -> Result<()> {
        if !st.host_dirty || st.host.is_empty() {
            return Ok(());
        }
        let Some(mem) = st.device.clone() else {
            // Nothing was ever written on the device side.
            st.host_dirty = false;
            return Ok(());
        };
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut st.host);
        self.ctx.backend().read(st.queue, &mem, bytes)?;
        debug!(bytes = bytes.len(), queue = st.queue, "device -> host");
        self.transfers.fetch_add(1, Ordering::Relaxed);
        st.host_dirty = false;
        Ok(())
    }

    fn push(&self, st: &mut BufferState<T>) -> Result<()> {
        if !st.device_dirty || st.host.is_empty() {
            return Ok(());
        }
        let mem = match &st.device {
            Some(m) => m.clone(),
            None => {
                let bytes = align_to(st.host.len() * std::mem::size_of::<T>(), DEVICE_ALIGNMENT);
                let m = self.ctx.backend().allocate(bytes)?;
                st.device = Some(m.clone());
                m
            }
        };
        let bytes: &[u8] = bytemuck::cast_slice(&st.host);
        self.ctx.backend().write(st.queue, &mem, bytes)?;
        debug!(bytes = bytes.len(), queue = st.queue, "host -> device");
        self.transfers.fetch_add(1, Ordering::Relaxed);
        st.device_dirty = false;
        Ok(())
    }

    /// Physical transfers performed so far.
    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Queue and graft
    // -----------------------------------------------------------------------

    pub fn command_queue(&self) -> usize {
        self.state.lock().queue
    }

    /// Move subsequent transfers to queue `id`. The host copy is pulled up to
    /// date first and the device marked stale, so the next kernel use
    /// re-uploads on the new queue.
    pub fn set_command_queue(&self, id: usize) -> Result<()> {
        let count = self.ctx.queue_count();
        if id >= count {
            return Err(GpuError::InvalidQueue { id, count });
        }
        let mut st = self.state.lock();
        self.pull(&mut st)?;
        st.queue = id;
        st.device_dirty = true;
        Ok(())
    }

    /// Adopt `donor`'s host data, device handle, queue and flags. The donor
    /// is consumed, so its device handle cannot be released twice.
    pub fn graft(&self, donor: BufferManager<T>) {
        let theirs = donor.state.into_inner();
        let mut st = self.state.lock();
        *st = theirs;
    }

    // -----------------------------------------------------------------------
    // Host access
    // -----------------------------------------------------------------------

    /// Read the host copy after pulling pending device writes.
    pub fn with_host<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let mut st = self.state.lock();
        self.pull(&mut st)?;
        Ok(f(&st.host))
    }

    /// Mutate the host copy; the device is marked stale.
    pub fn with_host_mut<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let mut st = self.state.lock();
        self.pull(&mut st)?;
        st.device_dirty = true;
        Ok(f(&mut st.host))
    }

    /// Lock and expose the synchronised host copy. Holding the guard blocks
    /// every other operation on this buffer.
    pub fn host_read(&self) -> Result<HostRead<'_, T>> {
        let mut st = self.state.lock();
        self.pull(&mut st)?;
        Ok(HostRead(MutexGuard::map(st, |s| s.host.as_mut_slice())))
    }

    /// Lock and expose the host copy for writing; the device is marked stale.
    pub fn host_write(&self) -> Result<HostWrite<'_, T>> {
        let mut st = self.state.lock();
        self.pull(&mut st)?;
        st.device_dirty = true;
        Ok(HostWrite(MutexGuard::map(st, |s| s.host.as_mut_slice())))
    }

    /// Copy of the host data after synchronisation.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.with_host(|h| h.to_vec())
    }

    /// Replace the host contents (same length) and mark the device stale.
    pub fn copy_from_slice(&self, data: &[T]) -> Result<()> {
        let mut st = self.state.lock();
        if data.len() != st.host.len() {
            return Err(GpuError::InvalidArgument(format!(
                "copy of {} elements into a buffer of {}",
                data.len(),
                st.host.len()
            )));
        }
        // Whole buffer is overwritten, so pending device data is discarded.
        st.host_dirty = false;
        st.host.copy_from_slice(data);
        st.device_dirty = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Device access
    // -----------------------------------------------------------------------

    /// Device handle for a kernel that reads and may write the buffer:
    /// pushes pending host data, then marks the host stale.
    pub fn device_memory(&self) -> Result<DeviceMemory> {
        self.bind(true)
    }

    fn device_handle(&self, writable: bool) -> Result<DeviceMemory> {
        let mut st = self.state.lock();
        if st.host.is_empty() {
            return Err(GpuError::DeviceAllocation { bytes: 0, reason: "buffer has zero length".into() });
        }
        if st.device.is_none() {
            // First device use: the host copy is authoritative.
            st.device_dirty = true;
        }
        self.push(&mut st)?;
        if writable {
            st.host_dirty = true;
        }
        st.device.clone().ok_or_else(|| GpuError::DeviceAllocation {
            bytes: st.host.len() * std::mem::size_of::<T>(),
            reason: "device storage missing after upload".into(),
        })
    }
}

/// Object-safe view of a buffer manager used for kernel argument binding.
pub trait DeviceBinding: Send + Sync {
    /// Synchronise for device use and return the handle. `writable` marks
    /// the host copy stale.
    fn bind(&self, writable: bool) -> Result<DeviceMemory>;

    fn byte_len(&self) -> usize;
}

impl<T: Pod + Send + Sync> DeviceBinding for BufferManager<T> {
    fn bind(&self, writable: bool) -> Result<DeviceMemory> {
        self.device_handle(writable)
    }

    fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }
}

/// Read guard over a synchronised host copy.
pub struct HostRead<'a, T>(MappedMutexGuard<'a, [T]>);

impl<T> Deref for HostRead<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

/// Write guard over the host copy; the device was marked stale on creation.
pub struct HostWrite<'a, T>(MappedMutexGuard<'a, [T]>);

impl<T> Deref for HostWrite<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T> DerefMut for HostWrite<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.0
    }
}
