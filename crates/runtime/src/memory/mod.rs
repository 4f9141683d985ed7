//! Device memory: allocations, the residency registry and memory objects

pub mod allocator;
pub mod objects;
pub mod registry;

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::AllocationError;

pub use allocator::{DeviceMemory, LinearAddressSpace};
pub use objects::{
    Accelerator, AddressingMode, Buffer, ContextId, DeviceQueue, Image, ImageDescriptor, ImageType,
    MemoryAccess, Pipe, Sampler, SamplerFilter, SvmRegion,
};
pub use registry::{AllocationRegistry, AllocationState, RegistryStats, ReleaseOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

/// Process-wide submission sequence number
///
/// Numbers are handed out by a single atomic counter, so they are unique for
/// the life of the process and increase in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

static NEXT_SUBMISSION: AtomicU64 = AtomicU64::new(1);

impl SubmissionId {
    pub fn next() -> Self {
        SubmissionId(NEXT_SUBMISSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    UserBuffer,
    Image,
    Svm,
    FillPattern,
    Scratch,
    KernelInstructions,
    PrivateSurface,
    ConstantSurface,
    GlobalSurface,
    PrintfBuffer,
    SurfaceStateHeap,
    IndirectObjectHeap,
    DynamicStateHeap,
    CommandBuffer,
    TagBuffer,
}

impl AllocationKind {
    /// Whether the driver keeps a CPU-side view of the contents
    pub fn is_host_visible(self) -> bool {
        !matches!(self, AllocationKind::Scratch | AllocationKind::PrivateSurface)
    }
}

/// Lifetime policy of an allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Lives until its owner releases it
    #[default]
    Permanent,
    /// Freed once the last submission referencing it retires
    Temporary,
}

/// One device-visible memory range
///
/// Allocations are created and destroyed only by the [`AllocationRegistry`];
/// everyone else holds `Arc` handles that act as references.
pub struct Allocation {
    id: AllocationId,
    gpu_address: u64,
    size: u64,
    kind: AllocationKind,
    coherent: bool,
    lifetime: Lifetime,
    resident: AtomicBool,
    released: AtomicBool,
    last_submission: AtomicU64,
    completion_tag: AtomicU64,
    host: Option<Mutex<Vec<u8>>>,
}

impl Allocation {
    pub(crate) fn new(
        id: AllocationId,
        gpu_address: u64,
        size: u64,
        kind: AllocationKind,
        lifetime: Lifetime,
    ) -> Self {
        let host = kind
            .is_host_visible()
            .then(|| Mutex::new(vec![0; size as usize]));
        Self {
            id,
            gpu_address,
            size,
            kind,
            coherent: matches!(
                kind,
                AllocationKind::TagBuffer | AllocationKind::Svm | AllocationKind::CommandBuffer
            ),
            lifetime,
            resident: AtomicBool::new(false),
            released: AtomicBool::new(false),
            last_submission: AtomicU64::new(0),
            completion_tag: AtomicU64::new(0),
            host,
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Highest submission sequence number that referenced this allocation
    pub fn last_submission(&self) -> u64 {
        self.last_submission.load(Ordering::Acquire)
    }

    /// Highest completion tag observed retiring a submission that used it
    pub fn completion_tag(&self) -> u64 {
        self.completion_tag.load(Ordering::Acquire)
    }

    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.gpu_address
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.gpu_address + self.size)
    }

    pub(crate) fn set_resident(&self, resident: bool) {
        self.resident.store(resident, Ordering::Release);
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
        self.resident.store(false, Ordering::Release);
    }

    pub(crate) fn note_submission(&self, submission: SubmissionId) {
        self.last_submission.fetch_max(submission.0, Ordering::AcqRel);
    }

    pub(crate) fn note_completion(&self, tag: u64) {
        self.completion_tag.fetch_max(tag, Ordering::AcqRel);
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), AllocationError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(AllocationError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn shadow(&self) -> Result<&Mutex<Vec<u8>>, AllocationError> {
        self.host
            .as_ref()
            .ok_or(AllocationError::NotHostVisible(self.id))
    }

    /// Write through the host-visible mapping
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), AllocationError> {
        self.check_range(offset, data.len() as u64)?;
        let mut shadow = self.shadow()?.lock().unwrap();
        let start = offset as usize;
        shadow[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read through the host-visible mapping
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, AllocationError> {
        self.check_range(offset, len)?;
        let shadow = self.shadow()?.lock().unwrap();
        let start = offset as usize;
        Ok(shadow[start..start + len as usize].to_vec())
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> Result<(), AllocationError> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, AllocationError> {
        let bytes = self.read(offset, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, AllocationError> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("lifetime", &self.lifetime)
            .field("resident", &self.is_resident())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_access_bounds() {
        let alloc = Allocation::new(
            AllocationId(1),
            0x1000,
            16,
            AllocationKind::UserBuffer,
            Lifetime::Permanent,
        );
        alloc.write(8, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(alloc.read_u64(8).unwrap(), 0x0807_0605_0403_0201);
        assert!(matches!(
            alloc.write(12, &[0; 8]),
            Err(AllocationError::OutOfBounds { .. })
        ));
        assert!(alloc.contains(0x1000, 16));
        assert!(!alloc.contains(0x1008, 9));
    }

    #[test]
    fn test_scratch_is_not_host_visible() {
        let alloc = Allocation::new(
            AllocationId(2),
            0x2000,
            64,
            AllocationKind::Scratch,
            Lifetime::Temporary,
        );
        assert_eq!(
            alloc.read(0, 4).unwrap_err(),
            AllocationError::NotHostVisible(AllocationId(2))
        );
    }

    #[test]
    fn test_submission_ids_increase() {
        let a = SubmissionId::next();
        let b = SubmissionId::next();
        assert!(b > a);
    }
}
