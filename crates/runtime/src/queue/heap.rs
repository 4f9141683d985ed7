//! Linear state heaps: surface state, dynamic state and indirect objects
//!
//! A heap is a host-visible allocation consumed front to back. Space is never
//! reused; when a reservation does not fit, the heap is replaced by a fresh
//! allocation and the old one is released, which the registry defers until
//! every submission that used it has retired.

use std::sync::Arc;

use crate::error::AllocationError;
use crate::memory::{Allocation, AllocationKind, AllocationRegistry};

/// Space reserved in a heap for one dispatch
#[derive(Debug, Clone)]
pub struct HeapChunk {
    pub allocation: Arc<Allocation>,
    /// Offset of the chunk from the heap base
    pub offset: u64,
    pub size: u64,
}

impl HeapChunk {
    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address() + self.offset
    }

    /// Write `data` at `offset` bytes into the chunk
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), AllocationError> {
        if offset + data.len() as u64 > self.size {
            return Err(AllocationError::OutOfBounds {
                offset,
                len: data.len() as u64,
                size: self.size,
            });
        }
        self.allocation.write(self.offset + offset, data)
    }
}

#[derive(Debug)]
pub struct LinearHeap {
    kind: AllocationKind,
    size: u64,
    registry: Arc<AllocationRegistry>,
    current: Option<Arc<Allocation>>,
    used: u64,
    generations: u64,
}

impl LinearHeap {
    pub fn new(registry: Arc<AllocationRegistry>, kind: AllocationKind, size: u64) -> Self {
        Self {
            kind,
            size,
            registry,
            current: None,
            used: 0,
            generations: 0,
        }
    }

    /// Reserve `size` bytes at `alignment`, replacing the heap when full
    pub fn reserve(&mut self, size: u64, alignment: u64) -> Result<HeapChunk, AllocationError> {
        let size = size.max(1);
        let offset = self.used.div_ceil(alignment) * alignment;
        match &self.current {
            Some(current) if offset + size <= current.size() => {
                self.used = offset + size;
                return Ok(HeapChunk {
                    allocation: Arc::clone(current),
                    offset,
                    size,
                });
            }
            _ => {}
        }

        let heap_size = self.size.max(size.div_ceil(4096) * 4096);
        let fresh = self.registry.allocate(heap_size, 4096, self.kind)?;
        if let Some(old) = self.current.replace(Arc::clone(&fresh)) {
            log::debug!("{:?} heap full, replacing {:?}", self.kind, old.id());
            self.registry.release(&old)?;
        }
        self.generations += 1;
        self.used = size;
        Ok(HeapChunk {
            allocation: fresh,
            offset: 0,
            size,
        })
    }

    pub fn current(&self) -> Option<&Arc<Allocation>> {
        self.current.as_ref()
    }

    /// Number of allocations this heap has gone through
    pub fn generations(&self) -> u64 {
        self.generations
    }
}

impl Drop for LinearHeap {
    fn drop(&mut self) {
        if let Some(current) = self.current.take() {
            if let Err(err) = self.registry.release(&current) {
                log::warn!("releasing {:?} heap: {err}", self.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationState, SubmissionId};

    #[test]
    fn test_reservations_are_aligned() {
        let registry = Arc::new(AllocationRegistry::with_address_space(0x10_0000, 0x100_0000));
        let mut heap = LinearHeap::new(Arc::clone(&registry), AllocationKind::IndirectObjectHeap, 4096);
        let a = heap.reserve(40, 64).unwrap();
        let b = heap.reserve(8, 64).unwrap();
        assert_eq!((a.offset, b.offset), (0, 64));
        assert!(Arc::ptr_eq(&a.allocation, &b.allocation));
        b.write(0, &[1; 8]).unwrap();
        assert!(b.write(4, &[1; 8]).is_err());
        assert_eq!(a.allocation.read(64, 2).unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_full_heap_is_replaced_and_old_release_deferred() {
        let registry = Arc::new(AllocationRegistry::with_address_space(0x10_0000, 0x100_0000));
        let mut heap = LinearHeap::new(Arc::clone(&registry), AllocationKind::SurfaceStateHeap, 4096);
        let first = heap.reserve(4000, 64).unwrap();
        let submission = SubmissionId::next();
        registry.mark_resident(&first.allocation, submission).unwrap();

        let second = heap.reserve(200, 64).unwrap();
        assert!(!Arc::ptr_eq(&first.allocation, &second.allocation));
        assert_eq!(second.offset, 0);
        assert_eq!(heap.generations(), 2);
        assert_eq!(registry.state(&first.allocation), AllocationState::Resident);

        registry.retire(submission, 1);
        assert_eq!(registry.state(&first.allocation), AllocationState::Released);
    }

    #[test]
    fn test_oversized_reservation_grows_heap() {
        let registry = Arc::new(AllocationRegistry::with_address_space(0x10_0000, 0x100_0000));
        let mut heap = LinearHeap::new(Arc::clone(&registry), AllocationKind::DynamicStateHeap, 4096);
        let chunk = heap.reserve(10_000, 64).unwrap();
        assert_eq!(chunk.allocation.size(), 12_288);
        drop(heap);
        assert_eq!(registry.stats().live_allocations, 0);
    }
}
