//! Device virtual address allocation

use std::collections::BTreeMap;

use crate::error::AllocationError;

/// Source of device virtual address ranges
///
/// The registry calls `allocate` while holding its own lock, so
/// implementations need no internal synchronisation.
pub trait DeviceMemory: Send {
    /// Reserve `size` bytes aligned to `alignment`, returning the base address
    fn allocate(&mut self, size: u64, alignment: u64) -> Result<u64, AllocationError>;

    /// Return a range previously handed out by `allocate`
    fn free(&mut self, address: u64, size: u64);

    /// Bytes still available
    fn available(&self) -> u64;
}

/// First-fit allocator over a single contiguous address range
#[derive(Debug, Clone)]
pub struct LinearAddressSpace {
    /// Free ranges keyed by start address
    free: BTreeMap<u64, u64>,
    available: u64,
}

impl LinearAddressSpace {
    pub fn new(base: u64, size: u64) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(base, size);
        }
        Self {
            free,
            available: size,
        }
    }

    /// Number of disjoint free ranges
    pub fn fragments(&self) -> usize {
        self.free.len()
    }
}

impl DeviceMemory for LinearAddressSpace {
    fn allocate(&mut self, size: u64, alignment: u64) -> Result<u64, AllocationError> {
        if size == 0 {
            return Err(AllocationError::InvalidSize);
        }
        if !alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAlignment(alignment));
        }

        let found = self.free.iter().find_map(|(&start, &len)| {
            let aligned = start.checked_add(alignment - 1)? & !(alignment - 1);
            let padding = aligned - start;
            (len >= padding.checked_add(size)?).then_some((start, len, aligned))
        });
        let Some((start, len, aligned)) = found else {
            return Err(AllocationError::OutOfMemory {
                requested: size,
                available: self.available,
            });
        };

        self.free.remove(&start);
        if aligned > start {
            self.free.insert(start, aligned - start);
        }
        let end = aligned + size;
        let tail = start + len - end;
        if tail > 0 {
            self.free.insert(end, tail);
        }
        self.available -= size;
        Ok(aligned)
    }

    fn free(&mut self, address: u64, size: u64) {
        let mut start = address;
        let mut len = size;

        // merge with the preceding range
        if let Some((&prev, &prev_len)) = self.free.range(..address).next_back() {
            if prev + prev_len == address {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        // merge with the following range
        if let Some(&next_len) = self.free.get(&(address + size)) {
            self.free.remove(&(address + size));
            len += next_len;
        }

        self.free.insert(start, len);
        self.available += size;
    }

    fn available(&self) -> u64 {
        self.available
    }
}
