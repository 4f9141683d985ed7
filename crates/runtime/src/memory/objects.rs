//! Memory objects handed to kernels as arguments
//!
//! Objects share their device allocation through an `Arc`'d backing that
//! returns the allocation to the registry when the last handle drops. The
//! registry defers that release while submissions still reference it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anvil_packets::prelude::{
    FilterMode, SURFACE_FORMAT_RAW, SamplerStateFields, SurfaceStateFields, SurfaceType,
    TextureAddressMode,
};

use super::registry::AllocationRegistry;
use super::{Allocation, AllocationKind};
use crate::error::AllocationError;

/// Identity of the context an object was created in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

impl ContextId {
    pub(crate) fn next() -> Self {
        ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Owner handle of one allocation; releases it on drop
pub(crate) struct Backing {
    allocation: Arc<Allocation>,
    registry: Arc<AllocationRegistry>,
}

impl Backing {
    pub(crate) fn allocate(
        registry: &Arc<AllocationRegistry>,
        size: u64,
        alignment: u64,
        kind: AllocationKind,
    ) -> Result<Arc<Self>, AllocationError> {
        let allocation = registry.allocate(size, alignment, kind)?;
        Ok(Arc::new(Self {
            allocation,
            registry: Arc::clone(registry),
        }))
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Err(err) = self.registry.release(&self.allocation) {
            log::warn!("releasing {:?}: {err}", self.allocation.id());
        }
    }
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.allocation, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MemoryAccess {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl MemoryAccess {
    pub fn name(self) -> &'static str {
        match self {
            MemoryAccess::ReadWrite => "read-write",
            MemoryAccess::ReadOnly => "read-only",
            MemoryAccess::WriteOnly => "write-only",
        }
    }

    pub fn can_read(self) -> bool {
        self != MemoryAccess::WriteOnly
    }

    pub fn can_write(self) -> bool {
        self != MemoryAccess::ReadOnly
    }
}

// ============================================================================
// Buffers
// ============================================================================

/// Linear device buffer, or a view into one
#[derive(Debug, Clone)]
pub struct Buffer {
    context: ContextId,
    backing: Arc<Backing>,
    offset: u64,
    size: u64,
    access: MemoryAccess,
}

impl Buffer {
    pub(crate) fn allocate(
        registry: &Arc<AllocationRegistry>,
        context: ContextId,
        size: u64,
        access: MemoryAccess,
    ) -> Result<Self, AllocationError> {
        let backing = Backing::allocate(registry, size, 64, AllocationKind::UserBuffer)?;
        Ok(Self {
            context,
            backing,
            offset: 0,
            size,
            access,
        })
    }

    /// View of `size` bytes starting `offset` bytes into this buffer
    pub fn sub_buffer(
        &self,
        offset: u64,
        size: u64,
        access: MemoryAccess,
    ) -> Result<Buffer, AllocationError> {
        if size == 0 {
            return Err(AllocationError::InvalidSize);
        }
        if offset.checked_add(size).is_none_or(|end| end > self.size) {
            return Err(AllocationError::OutOfBounds {
                offset,
                len: size,
                size: self.size,
            });
        }
        Ok(Buffer {
            context: self.context,
            backing: Arc::clone(&self.backing),
            offset: self.offset + offset,
            size,
            access,
        })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.backing.allocation
    }

    /// Offset of this view inside its allocation
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn access(&self) -> MemoryAccess {
        self.access
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation().gpu_address() + self.offset
    }

    fn check(&self, offset: u64, len: u64) -> Result<(), AllocationError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(AllocationError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), AllocationError> {
        self.check(offset, data.len() as u64)?;
        self.allocation().write(self.offset + offset, data)
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, AllocationError> {
        self.check(offset, len)?;
        self.allocation().read(self.offset + offset, len)
    }
}

// ============================================================================
// Images
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ImageType {
    Image1D,
    Image1DArray,
    Image1DBuffer,
    #[default]
    Image2D,
    Image2DArray,
    Image3D,
}

impl ImageType {
    fn surface_type(self) -> SurfaceType {
        match self {
            ImageType::Image1D | ImageType::Image1DArray => SurfaceType::Surface1D,
            ImageType::Image1DBuffer => SurfaceType::Buffer,
            ImageType::Image2D | ImageType::Image2DArray => SurfaceType::Surface2D,
            ImageType::Image3D => SurfaceType::Surface3D,
        }
    }

    fn is_array(self) -> bool {
        matches!(self, ImageType::Image1DArray | ImageType::Image2DArray)
    }
}

/// Shape and format of an image
///
/// `channel_order` and `channel_type` are the API enumerants passed through
/// to kernels; `surface_format` is the hardware format code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub image_type: ImageType,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub channel_order: u32,
    pub channel_type: u32,
    pub bytes_per_pixel: u32,
    pub surface_format: u32,
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        Self {
            image_type: ImageType::Image2D,
            width: 1,
            height: 1,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            channel_order: 0,
            channel_type: 0,
            bytes_per_pixel: 4,
            surface_format: 0,
        }
    }
}

impl ImageDescriptor {
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn row_pitch(&self) -> u32 {
        self.width * self.bytes_per_pixel
    }

    pub fn byte_size(&self) -> u64 {
        let slices = match self.image_type {
            ImageType::Image3D => self.depth,
            ImageType::Image1DArray | ImageType::Image2DArray => self.array_size,
            _ => 1,
        };
        self.row_pitch() as u64 * self.height.max(1) as u64 * slices.max(1) as u64
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    context: ContextId,
    backing: Arc<Backing>,
    descriptor: ImageDescriptor,
    access: MemoryAccess,
}

impl Image {
    pub(crate) fn allocate(
        registry: &Arc<AllocationRegistry>,
        context: ContextId,
        descriptor: ImageDescriptor,
        access: MemoryAccess,
    ) -> Result<Self, AllocationError> {
        let backing = Backing::allocate(registry, descriptor.byte_size(), 4096, AllocationKind::Image)?;
        Ok(Self {
            context,
            backing,
            descriptor,
            access,
        })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.backing.allocation
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    pub fn access(&self) -> MemoryAccess {
        self.access
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation().gpu_address()
    }

    /// Surface-state record describing this image
    pub fn surface_state(&self) -> SurfaceStateFields {
        let desc = &self.descriptor;
        let image_type = desc.image_type;
        let depth = match image_type {
            ImageType::Image3D => desc.depth,
            ImageType::Image1DArray | ImageType::Image2DArray => desc.array_size,
            _ => 1,
        };
        SurfaceStateFields {
            surface_type: image_type.surface_type(),
            is_array: image_type.is_array(),
            format: desc.surface_format,
            coherent: self.allocation().is_coherent(),
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth: depth.max(1),
            pitch: desc.row_pitch().max(1),
            mip_count: desc.mip_levels.saturating_sub(1),
            base_address: self.gpu_address(),
            ..SurfaceStateFields::default()
        }
    }
}

// ============================================================================
// Samplers
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    None,
    #[default]
    ClampToEdge,
    Clamp,
    Repeat,
    MirroredRepeat,
}

impl AddressingMode {
    fn code(self) -> u32 {
        match self {
            AddressingMode::None => 0,
            AddressingMode::ClampToEdge => 1,
            AddressingMode::Clamp => 2,
            AddressingMode::Repeat => 3,
            AddressingMode::MirroredRepeat => 4,
        }
    }

    fn texture_mode(self) -> TextureAddressMode {
        match self {
            AddressingMode::None | AddressingMode::ClampToEdge => TextureAddressMode::Clamp,
            AddressingMode::Clamp => TextureAddressMode::ClampBorder,
            AddressingMode::Repeat => TextureAddressMode::Wrap,
            AddressingMode::MirroredRepeat => TextureAddressMode::Mirror,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    #[default]
    Nearest,
    Linear,
}

/// Sampler object; carries no device memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sampler {
    context: ContextId,
    pub normalized_coordinates: bool,
    pub addressing: AddressingMode,
    pub filter: SamplerFilter,
}

impl Sampler {
    pub(crate) fn new(
        context: ContextId,
        normalized_coordinates: bool,
        addressing: AddressingMode,
        filter: SamplerFilter,
    ) -> Self {
        Self {
            context,
            normalized_coordinates,
            addressing,
            filter,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Packed sampler value patched into the parameter block
    ///
    /// Bit 0: normalized coordinates, bits 1..4: addressing mode, bit 4: filter.
    pub fn packed(&self) -> u32 {
        let filter = match self.filter {
            SamplerFilter::Nearest => 0,
            SamplerFilter::Linear => 1,
        };
        self.normalized_coordinates as u32 | (self.addressing.code() << 1) | (filter << 4)
    }

    pub fn sampler_state(&self) -> SamplerStateFields {
        let filter = match self.filter {
            SamplerFilter::Nearest => FilterMode::Nearest,
            SamplerFilter::Linear => FilterMode::Linear,
        };
        let mode = self.addressing.texture_mode();
        SamplerStateFields {
            min_filter: filter,
            mag_filter: filter,
            address_u: mode,
            address_v: mode,
            address_r: mode,
            normalized_coordinates: self.normalized_coordinates,
        }
    }
}

// ============================================================================
// Pipes, device queues, accelerators and SVM
// ============================================================================

/// Packet pipe; its storage holds a control header followed by packets
#[derive(Debug, Clone)]
pub struct Pipe {
    context: ContextId,
    backing: Arc<Backing>,
    packet_size: u32,
    max_packets: u32,
    access: MemoryAccess,
}

impl Pipe {
    const HEADER_SIZE: u64 = 128;

    pub(crate) fn allocate(
        registry: &Arc<AllocationRegistry>,
        context: ContextId,
        packet_size: u32,
        max_packets: u32,
        access: MemoryAccess,
    ) -> Result<Self, AllocationError> {
        let size = Self::HEADER_SIZE + packet_size as u64 * (max_packets as u64 + 1);
        let backing = Backing::allocate(registry, size, 64, AllocationKind::UserBuffer)?;
        backing.allocation.write(0, &max_packets.to_le_bytes())?;
        Ok(Self {
            context,
            backing,
            packet_size,
            max_packets,
            access,
        })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.backing.allocation
    }

    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    pub fn max_packets(&self) -> u32 {
        self.max_packets
    }

    pub fn access(&self) -> MemoryAccess {
        self.access
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation().gpu_address()
    }
}

/// On-device queue used by kernels that enqueue child work
#[derive(Debug, Clone)]
pub struct DeviceQueue {
    context: ContextId,
    backing: Arc<Backing>,
}

impl DeviceQueue {
    pub(crate) fn allocate(
        registry: &Arc<AllocationRegistry>,
        context: ContextId,
        size: u64,
    ) -> Result<Self, AllocationError> {
        let backing = Backing::allocate(registry, size, 4096, AllocationKind::UserBuffer)?;
        Ok(Self { context, backing })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.backing.allocation
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation().gpu_address()
    }
}

/// Fixed-function accelerator whose descriptor lives in device memory
#[derive(Debug, Clone)]
pub struct Accelerator {
    context: ContextId,
    backing: Arc<Backing>,
}

impl Accelerator {
    pub(crate) fn allocate(
        registry: &Arc<AllocationRegistry>,
        context: ContextId,
        descriptor: &[u8],
    ) -> Result<Self, AllocationError> {
        let size = (descriptor.len() as u64).max(64);
        let backing = Backing::allocate(registry, size, 64, AllocationKind::UserBuffer)?;
        backing.allocation.write(0, descriptor)?;
        Ok(Self { context, backing })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.backing.allocation
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation().gpu_address()
    }
}

/// Shared virtual memory region addressable by host pointers and kernels
#[derive(Debug, Clone)]
pub struct SvmRegion {
    context: ContextId,
    backing: Arc<Backing>,
}

impl SvmRegion {
    pub(crate) fn allocate(
        registry: &Arc<AllocationRegistry>,
        context: ContextId,
        size: u64,
    ) -> Result<Self, AllocationError> {
        let backing = Backing::allocate(registry, size, 4096, AllocationKind::Svm)?;
        Ok(Self { context, backing })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.backing.allocation
    }

    pub fn size(&self) -> u64 {
        self.allocation().size()
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation().gpu_address()
    }
}

/// Raw buffer surface covering `[address, address + size)`
pub(crate) fn buffer_surface(address: u64, size: u64, coherent: bool) -> SurfaceStateFields {
    let fields = SurfaceStateFields::buffer(address, size, coherent);
    debug_assert_eq!(fields.format, SURFACE_FORMAT_RAW);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocationState;

    fn registry() -> Arc<AllocationRegistry> {
        Arc::new(AllocationRegistry::with_address_space(0x10_0000, 0x100_0000))
    }

    #[test]
    fn test_sub_buffer_shares_allocation() {
        let registry = registry();
        let context = ContextId::next();
        let buffer = Buffer::allocate(&registry, context, 256, MemoryAccess::ReadWrite).unwrap();
        let view = buffer.sub_buffer(0x42, 16, MemoryAccess::ReadOnly).unwrap();
        assert_eq!(view.gpu_address(), buffer.gpu_address() + 0x42);
        view.write(0, &[7; 4]).unwrap();
        assert_eq!(buffer.read(0x42, 4).unwrap(), vec![7; 4]);
        assert!(view.write(14, &[0; 4]).is_err());
        assert!(buffer.sub_buffer(250, 16, MemoryAccess::ReadWrite).is_err());
    }

    #[test]
    fn test_last_handle_releases_allocation() {
        let registry = registry();
        let buffer = Buffer::allocate(&registry, ContextId::next(), 64, MemoryAccess::ReadWrite).unwrap();
        let allocation = Arc::clone(buffer.allocation());
        let clone = buffer.clone();
        drop(buffer);
        assert_eq!(registry.state(&allocation), AllocationState::Created);
        drop(clone);
        assert_eq!(registry.state(&allocation), AllocationState::Released);
    }

    #[test]
    fn test_image_surface_state() {
        let registry = registry();
        let descriptor = ImageDescriptor {
            image_type: ImageType::Image2DArray,
            array_size: 3,
            ..ImageDescriptor::new_2d(32, 16)
        };
        let image = Image::allocate(&registry, ContextId::next(), descriptor, MemoryAccess::ReadOnly).unwrap();
        let state = image.surface_state();
        assert_eq!(state.surface_type, SurfaceType::Surface2D);
        assert!(state.is_array);
        assert_eq!((state.width, state.height, state.depth), (32, 16, 3));
        assert_eq!(state.pitch, 128);
        assert_eq!(image.allocation().size(), 128 * 16 * 3);
    }

    #[test]
    fn test_sampler_packing() {
        let sampler = Sampler::new(
            ContextId::next(),
            true,
            AddressingMode::Repeat,
            SamplerFilter::Linear,
        );
        assert_eq!(sampler.packed(), 1 | (3 << 1) | (1 << 4));
        let state = sampler.sampler_state();
        assert_eq!(state.address_u, TextureAddressMode::Wrap);
        assert_eq!(state.min_filter, FilterMode::Linear);
    }
}
