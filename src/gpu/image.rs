// gpu/image.rs — Image whose pixels live in a buffer manager.
//
// RESPONSIBILITIES
// ─────────────────
// `GpuImage<T>` pairs a `Geometry` with an `Arc<BufferManager<T>>`. Kernels
// bind the buffer; host code uses the pixel accessors below. The accessors
// keep the two copies coherent with a conservative policy:
//
//   reads  (get_pixel, get_vector, host_buffer, to_image)
//          → pull device writes under the host lock, then read.
//   writes (set_pixel, set_vector, fill, host_buffer_mut)
//          → write the host copy immediately, mark the device stale.
//          The upload is deferred until a kernel binds the buffer.
//
// A read therefore has a side effect (a blocking transfer). `sync_host` is
// the named, public form of it so callers and tests can trigger it alone.
//
// GRAFT
// ──────
// `graft` makes this image share another image's buffer: both refer to
// one allocation, no pixels are copied, and the allocation is released
// once by whichever `Arc` drops last.

use std::sync::Arc;

use crate::error::{GpuError, Result};
use crate::gpu::buffer::{BufferManager, HostRead, HostWrite};
use crate::gpu::context::DeviceContext;
use crate::image::{Geometry, Image, Pixel};

pub struct GpuImage<T: Pixel> {
    geometry: Geometry,
    buffer: Arc<BufferManager<T>>,
}

impl<T: Pixel> GpuImage<T> {
    /// Zero-filled image with device storage allocated.
    pub fn new(ctx: Arc<DeviceContext>, geometry: Geometry) -> Result<Self> {
        let buffer = BufferManager::new(ctx);
        buffer.allocate(geometry.num_elements())?;
        // Host zeros are authoritative until the first upload.
        buffer.set_device_dirty_flag(true);
        Ok(GpuImage { geometry, buffer: Arc::new(buffer) })
    }

    /// Upload-on-demand copy of a host image.
    pub fn from_image(ctx: Arc<DeviceContext>, image: &Image<T>) -> Result<Self> {
        let buffer = BufferManager::from_vec(ctx, image.as_slice().to_vec())?;
        Ok(GpuImage { geometry: *image.geometry(), buffer: Arc::new(buffer) })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn buffer(&self) -> &Arc<BufferManager<T>> {
        &self.buffer
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        self.buffer.context()
    }

    /// Pull device writes into the host copy if the host is stale.
    pub fn sync_host(&self) -> Result<()> {
        self.buffer.sync_host_from_device()
    }

    /// Settle whichever side is stale; `InconsistentState` if both are.
    pub fn update_buffers(&self) -> Result<()> {
        self.buffer.resolve()
    }

    /// Set every component of every pixel to `value`.
    pub fn fill(&self, value: T) -> Result<()> {
        let mut host = self.buffer.host_write()?;
        host.fill(value);
        Ok(())
    }

    /// Component 0 at `index`.
    pub fn get_pixel(&self, index: &[usize]) -> Result<T> {
        let offset = self.offset(index)?;
        Ok(self.buffer.host_read()?[offset])
    }

    pub fn set_pixel(&self, index: &[usize], value: T) -> Result<()> {
        let offset = self.offset(index)?;
        self.buffer.host_write()?[offset] = value;
        Ok(())
    }

    /// All components at `index`.
    pub fn get_vector(&self, index: &[usize]) -> Result<Vec<T>> {
        let offset = self.offset(index)?;
        let c = self.geometry.components();
        Ok(self.buffer.host_read()?[offset..offset + c].to_vec())
    }

    pub fn set_vector(&self, index: &[usize], value: &[T]) -> Result<()> {
        let c = self.geometry.components();
        if value.len() != c {
            return Err(GpuError::InvalidArgument(format!("expected {c} components, got {}", value.len())));
        }
        let offset = self.offset(index)?;
        self.buffer.host_write()?[offset..offset + c].copy_from_slice(value);
        Ok(())
    }

    /// Synchronised host pixels. The buffer stays locked while the guard lives.
    pub fn host_buffer(&self) -> Result<HostRead<'_, T>> {
        self.buffer.host_read()
    }

    /// Writable host pixels; the device copy is marked stale.
    pub fn host_buffer_mut(&self) -> Result<HostWrite<'_, T>> {
        self.buffer.host_write()
    }

    /// Host copy as an owned image.
    pub fn to_image(&self) -> Result<Image<T>> {
        Ok(Image::from_vec(self.geometry, self.buffer.to_vec()?))
    }

    /// Share `other`'s buffer and geometry without copying pixels.
    pub fn graft(&mut self, other: &GpuImage<T>) {
        self.geometry = other.geometry;
        self.buffer = Arc::clone(&other.buffer);
    }

    fn offset(&self, index: &[usize]) -> Result<usize> {
        self.geometry
            .linear_index(index)
            .map(|p| p * self.geometry.components())
            .ok_or_else(|| GpuError::InvalidArgument(format!("index {index:?} outside {}", self.geometry)))
    }
}

impl<T: Pixel> std::fmt::Debug for GpuImage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("pixel", &T::TYPE)
            .field("geometry", &self.geometry)
            .field("host_dirty", &self.buffer.host_dirty())
            .field("device_dirty", &self.buffer.device_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<DeviceContext> {
        DeviceContext::host(1)
    }

    #[test]
    fn test_set_pixel_writes_host_and_marks_device() {
        let img = GpuImage::<f32>::new(ctx(), Geometry::new(&[4, 4])).unwrap();
        img.buffer().sync_device_from_host().unwrap();
        assert!(!img.buffer().device_dirty());
        img.set_pixel(&[1, 2], 3.5).unwrap();
        assert!(img.buffer().device_dirty());
        assert_eq!(img.get_pixel(&[1, 2]).unwrap(), 3.5);
    }

    #[test]
    fn test_get_pixel_sees_device_write() {
        let img = GpuImage::<f32>::new(ctx(), Geometry::new(&[2, 2])).unwrap();
        let mem = img.buffer().device_memory().unwrap();
        let data = [1.0f32, 2.0, 3.0, 4.0];
        img.context().backend().write(0, &mem, bytemuck::cast_slice(&data)).unwrap();
        assert!(img.buffer().host_dirty());
        assert_eq!(img.get_pixel(&[1, 1]).unwrap(), 4.0);
        assert!(!img.buffer().host_dirty());
    }

    #[test]
    fn test_reads_after_device_write_transfer_once() {
        let img = GpuImage::<f32>::new(ctx(), Geometry::new(&[2, 2]).vector_field()).unwrap();
        let mem = img.buffer().device_memory().unwrap();
        let data = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        img.context().backend().write(0, &mem, bytemuck::cast_slice(&data)).unwrap();
        let before = img.buffer().transfer_count();
        assert_eq!(img.get_pixel(&[1, 0]).unwrap(), 2.0);
        assert_eq!(img.get_vector(&[1, 1]).unwrap(), vec![6.0, 7.0]);
        assert_eq!(img.get_pixel(&[0, 1]).unwrap(), 4.0);
        assert_eq!(img.buffer().transfer_count(), before + 1);
    }

    #[test]
    fn test_out_of_range_index() {
        let img = GpuImage::<f32>::new(ctx(), Geometry::new(&[2, 2])).unwrap();
        assert!(matches!(img.get_pixel(&[2, 0]), Err(GpuError::InvalidArgument(_))));
        assert!(matches!(img.set_pixel(&[0], 1.0), Err(GpuError::InvalidArgument(_))));
    }

    #[test]
    fn test_fill_and_vector_access() {
        let g = Geometry::new(&[3, 3]).vector_field();
        let img = GpuImage::<f64>::new(ctx(), g).unwrap();
        img.fill(0.5).unwrap();
        img.set_vector(&[2, 1], &[1.0, -1.0]).unwrap();
        assert_eq!(img.get_vector(&[2, 1]).unwrap(), vec![1.0, -1.0]);
        assert_eq!(img.get_vector(&[0, 0]).unwrap(), vec![0.5, 0.5]);
        assert!(img.set_vector(&[0, 0], &[1.0]).is_err());
    }

    #[test]
    fn test_graft_shares_buffer() {
        let src = GpuImage::from_image(ctx(), &Image::filled(Geometry::new(&[2, 2]), 7u32)).unwrap();
        let mut dst = GpuImage::<u32>::new(ctx(), Geometry::new(&[1])).unwrap();
        dst.graft(&src);
        assert!(Arc::ptr_eq(dst.buffer(), src.buffer()));
        src.set_pixel(&[0, 0], 9).unwrap();
        assert_eq!(dst.get_pixel(&[0, 0]).unwrap(), 9);
        assert_eq!(dst.geometry().size(), &[2, 2]);
    }

    #[test]
    fn test_update_buffers_clears_flags() {
        let img = GpuImage::<f32>::new(ctx(), Geometry::new(&[4])).unwrap();
        img.update_buffers().unwrap();
        assert!(!img.buffer().device_dirty());
        assert!(!img.buffer().host_dirty());
    }
}
