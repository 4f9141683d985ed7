//! Allocation registry: ownership, residency and deferred release
//!
//! Every allocation moves through
//!
//! ```text
//! Created --mark_resident--> Resident --retire (last holder)--> Idle --release--> Released
//!                               ^                                  |
//!                               +----------mark_resident-----------+
//! ```
//!
//! A release requested while submissions still hold the allocation is stored
//! and carried out by the retire that drops the last holder. Temporary
//! allocations are freed the same way without an explicit release.

use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};

use super::allocator::{DeviceMemory, LinearAddressSpace};
use super::{Allocation, AllocationId, AllocationKind, Lifetime, SubmissionId};
use crate::error::AllocationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// Registered, never referenced by a submission
    Created,
    /// Held by at least one outstanding submission
    Resident,
    /// No outstanding submission holds it
    Idle,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Memory returned to the allocator immediately
    Freed,
    /// Still referenced; freed when the last holder retires
    Deferred,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live_allocations: usize,
    pub live_bytes: u64,
    pub peak_bytes: u64,
    pub pending_releases: usize,
    pub outstanding_submissions: usize,
    pub total_allocated: u64,
    pub total_freed: u64,
}

struct Entry {
    allocation: Arc<Allocation>,
    holders: FxHashSet<SubmissionId>,
    release_requested: bool,
    ever_resident: bool,
}

struct RegistryState {
    memory: Box<dyn DeviceMemory>,
    next_id: u64,
    entries: FxHashMap<AllocationId, Entry>,
    submissions: FxHashMap<SubmissionId, Vec<AllocationId>>,
    stats: RegistryStats,
}

impl RegistryState {
    fn free_entry(&mut self, id: AllocationId) -> Option<AllocationId> {
        let entry = self.entries.remove(&id)?;
        let allocation = entry.allocation;
        allocation.mark_released();
        self.memory.free(allocation.gpu_address(), allocation.size());
        if entry.release_requested {
            self.stats.pending_releases -= 1;
        }
        self.stats.live_allocations -= 1;
        self.stats.live_bytes -= allocation.size();
        self.stats.total_freed += 1;
        log::trace!(
            "freed {:?} {:?} at {:#x} ({} bytes)",
            allocation.id(),
            allocation.kind(),
            allocation.gpu_address(),
            allocation.size()
        );
        Some(id)
    }

    /// Drop `submission`'s holds, returning the allocations that were freed
    fn drop_holds(&mut self, submission: SubmissionId, completed_tag: Option<u64>) -> Vec<AllocationId> {
        let Some(ids) = self.submissions.remove(&submission) else {
            return Vec::new();
        };
        self.stats.outstanding_submissions = self.submissions.len();

        let mut to_free = Vec::new();
        for id in ids {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            entry.holders.remove(&submission);
            if let Some(tag) = completed_tag {
                entry.allocation.note_completion(tag);
            }
            let temporary = entry.allocation.lifetime() == Lifetime::Temporary;
            if entry.holders.is_empty() && (entry.release_requested || temporary) {
                to_free.push(id);
            }
        }
        to_free
            .into_iter()
            .filter_map(|id| self.free_entry(id))
            .collect()
    }
}

/// Owner of every device allocation
///
/// One registry is shared by all queues of a device; all bookkeeping happens
/// under a single lock.
pub struct AllocationRegistry {
    state: Mutex<RegistryState>,
}

impl AllocationRegistry {
    pub fn new(memory: impl DeviceMemory + 'static) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                memory: Box::new(memory),
                next_id: 1,
                entries: FxHashMap::default(),
                submissions: FxHashMap::default(),
                stats: RegistryStats::default(),
            }),
        }
    }

    /// Registry over a first-fit range `[base, base + size)`
    pub fn with_address_space(base: u64, size: u64) -> Self {
        Self::new(LinearAddressSpace::new(base, size))
    }

    /// Allocate device memory that lives until released by its owner
    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
        kind: AllocationKind,
    ) -> Result<Arc<Allocation>, AllocationError> {
        self.register(size, alignment, kind, Lifetime::Permanent)
    }

    /// Allocate memory freed once the last submission referencing it retires
    pub fn allocate_temporary(
        &self,
        size: u64,
        alignment: u64,
        kind: AllocationKind,
    ) -> Result<Arc<Allocation>, AllocationError> {
        self.register(size, alignment, kind, Lifetime::Temporary)
    }

    fn register(
        &self,
        size: u64,
        alignment: u64,
        kind: AllocationKind,
        lifetime: Lifetime,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let mut state = self.state.lock().unwrap();
        // nothing is registered unless the allocator succeeds
        let address = state.memory.allocate(size, alignment)?;
        let id = AllocationId(state.next_id);
        state.next_id += 1;

        let allocation = Arc::new(Allocation::new(id, address, size, kind, lifetime));
        state.entries.insert(
            id,
            Entry {
                allocation: Arc::clone(&allocation),
                holders: FxHashSet::default(),
                release_requested: false,
                ever_resident: false,
            },
        );
        let stats = &mut state.stats;
        stats.live_allocations += 1;
        stats.live_bytes += size;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
        stats.total_allocated += 1;

        log::trace!("allocated {id:?} {kind:?} {lifetime:?} at {address:#x} ({size} bytes)");
        Ok(allocation)
    }

    /// Pin `allocation` for `submission`
    ///
    /// Marking the same allocation twice for one submission records a single
    /// hold.
    pub fn mark_resident(
        &self,
        allocation: &Allocation,
        submission: SubmissionId,
    ) -> Result<(), AllocationError> {
        let mut state = self.state.lock().unwrap();
        let id = allocation.id();
        let Some(entry) = state.entries.get_mut(&id) else {
            return Err(missing(allocation));
        };
        if entry.release_requested {
            return Err(AllocationError::AlreadyReleased(id));
        }
        let newly_held = entry.holders.insert(submission);
        entry.ever_resident = true;
        entry.allocation.set_resident(true);
        entry.allocation.note_submission(submission);
        if newly_held {
            state.submissions.entry(submission).or_default().push(id);
            state.stats.outstanding_submissions = state.submissions.len();
        }
        Ok(())
    }

    /// Unpin an idle allocation; refuses while any submission holds it
    pub fn mark_non_resident(&self, allocation: &Allocation) -> bool {
        let state = self.state.lock().unwrap();
        match state.entries.get(&allocation.id()) {
            Some(entry) if !entry.holders.is_empty() => false,
            Some(entry) => {
                entry.allocation.set_resident(false);
                true
            }
            None => false,
        }
    }

    /// Drop the holds of a completed submission
    ///
    /// Returns the allocations freed as a result: temporaries whose last
    /// holder this was and allocations with a pending release.
    pub fn retire(&self, submission: SubmissionId, completed_tag: u64) -> Vec<AllocationId> {
        let mut state = self.state.lock().unwrap();
        let freed = state.drop_holds(submission, Some(completed_tag));
        log::debug!(
            "retired submission {submission} at tag {completed_tag}, freed {} allocations",
            freed.len()
        );
        freed
    }

    /// Drop the holds of a submission the device never executed
    pub fn abandon(&self, submission: SubmissionId) -> Vec<AllocationId> {
        let mut state = self.state.lock().unwrap();
        let freed = state.drop_holds(submission, None);
        log::debug!("abandoned submission {submission}, freed {} allocations", freed.len());
        freed
    }

    /// Release an allocation, deferring the free while it is still held
    pub fn release(&self, allocation: &Allocation) -> Result<ReleaseOutcome, AllocationError> {
        let mut state = self.state.lock().unwrap();
        let id = allocation.id();
        let Some(entry) = state.entries.get_mut(&id) else {
            return Err(missing(allocation));
        };
        if entry.release_requested {
            return Err(AllocationError::AlreadyReleased(id));
        }
        if !entry.holders.is_empty() {
            entry.release_requested = true;
            state.stats.pending_releases += 1;
            log::trace!("release of {id:?} deferred");
            return Ok(ReleaseOutcome::Deferred);
        }
        state.free_entry(id);
        Ok(ReleaseOutcome::Freed)
    }

    pub fn state(&self, allocation: &Allocation) -> AllocationState {
        let state = self.state.lock().unwrap();
        match state.entries.get(&allocation.id()) {
            None => AllocationState::Released,
            Some(entry) if !entry.holders.is_empty() => AllocationState::Resident,
            Some(entry) if entry.ever_resident => AllocationState::Idle,
            Some(_) => AllocationState::Created,
        }
    }

    /// Number of outstanding submissions holding `allocation`
    pub fn holders(&self, allocation: &Allocation) -> usize {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(&allocation.id())
            .map_or(0, |entry| entry.holders.len())
    }

    /// Allocations pinned for `submission`
    pub fn residency_set(&self, submission: SubmissionId) -> Vec<Arc<Allocation>> {
        let state = self.state.lock().unwrap();
        state
            .submissions
            .get(&submission)
            .into_iter()
            .flatten()
            .filter_map(|id| state.entries.get(id))
            .map(|entry| Arc::clone(&entry.allocation))
            .collect()
    }

    pub fn lookup(&self, id: AllocationId) -> Option<Arc<Allocation>> {
        let state = self.state.lock().unwrap();
        state.entries.get(&id).map(|entry| Arc::clone(&entry.allocation))
    }

    /// Live allocation containing the device range `[address, address + len)`
    pub fn find_by_address(&self, address: u64, len: u64) -> Option<Arc<Allocation>> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .values()
            .find(|entry| entry.allocation.contains(address, len))
            .map(|entry| Arc::clone(&entry.allocation))
    }

    pub fn stats(&self) -> RegistryStats {
        self.state.lock().unwrap().stats
    }

    pub fn available(&self) -> u64 {
        self.state.lock().unwrap().memory.available()
    }
}

impl std::fmt::Debug for AllocationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

fn missing(allocation: &Allocation) -> AllocationError {
    if allocation.is_released() {
        AllocationError::AlreadyReleased(allocation.id())
    } else {
        AllocationError::NotRegistered(allocation.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AllocationRegistry {
        AllocationRegistry::with_address_space(0x10_0000, 0x10_0000)
    }

    #[test]
    fn test_state_machine() {
        let registry = registry();
        let alloc = registry
            .allocate(4096, 64, AllocationKind::UserBuffer)
            .unwrap();
        assert_eq!(registry.state(&alloc), AllocationState::Created);

        let submission = SubmissionId::next();
        registry.mark_resident(&alloc, submission).unwrap();
        assert_eq!(registry.state(&alloc), AllocationState::Resident);
        assert!(alloc.is_resident());
        assert!(!registry.mark_non_resident(&alloc));

        registry.retire(submission, 1);
        assert_eq!(registry.state(&alloc), AllocationState::Idle);
        assert_eq!(alloc.completion_tag(), 1);

        // idle allocations can become resident again
        let again = SubmissionId::next();
        registry.mark_resident(&alloc, again).unwrap();
        assert_eq!(registry.state(&alloc), AllocationState::Resident);
        registry.retire(again, 2);

        assert!(registry.mark_non_resident(&alloc));
        assert!(!alloc.is_resident());
        assert_eq!(registry.release(&alloc).unwrap(), ReleaseOutcome::Freed);
        assert_eq!(registry.state(&alloc), AllocationState::Released);
        assert!(alloc.is_released());
    }

    #[test]
    fn test_release_waits_for_both_holders() {
        let registry = registry();
        let alloc = registry
            .allocate(256, 64, AllocationKind::UserBuffer)
            .unwrap();
        let first = SubmissionId::next();
        let second = SubmissionId::next();
        registry.mark_resident(&alloc, first).unwrap();
        registry.mark_resident(&alloc, second).unwrap();
        assert_eq!(registry.holders(&alloc), 2);

        registry.retire(first, 1);
        assert_eq!(registry.release(&alloc).unwrap(), ReleaseOutcome::Deferred);
        assert!(!alloc.is_released());
        assert_eq!(registry.stats().pending_releases, 1);

        let freed = registry.retire(second, 2);
        assert_eq!(freed, vec![alloc.id()]);
        assert!(alloc.is_released());
        assert_eq!(registry.stats().pending_releases, 0);
        assert_eq!(registry.stats().live_allocations, 0);
    }

    #[test]
    fn test_mark_resident_is_idempotent() {
        let registry = registry();
        let alloc = registry
            .allocate(256, 64, AllocationKind::UserBuffer)
            .unwrap();
        let submission = SubmissionId::next();
        registry.mark_resident(&alloc, submission).unwrap();
        registry.mark_resident(&alloc, submission).unwrap();
        assert_eq!(registry.holders(&alloc), 1);
        assert_eq!(registry.residency_set(submission).len(), 1);

        registry.release(&alloc).unwrap();
        // one retire is enough to clear the single hold
        registry.retire(submission, 1);
        assert!(alloc.is_released());
    }

    #[test]
    fn test_temporary_freed_on_retire() {
        let registry = registry();
        let pattern = registry
            .allocate_temporary(16, 16, AllocationKind::FillPattern)
            .unwrap();
        let submission = SubmissionId::next();
        registry.mark_resident(&pattern, submission).unwrap();
        assert_eq!(registry.retire(submission, 7), vec![pattern.id()]);
        assert_eq!(registry.state(&pattern), AllocationState::Released);
        assert_eq!(registry.available(), 0x10_0000);
    }

    #[test]
    fn test_abandon_drops_holds() {
        let registry = registry();
        let buffer = registry
            .allocate(64, 64, AllocationKind::UserBuffer)
            .unwrap();
        let submission = SubmissionId::next();
        registry.mark_resident(&buffer, submission).unwrap();
        registry.abandon(submission);
        assert_eq!(registry.holders(&buffer), 0);
        assert_eq!(buffer.completion_tag(), 0);
        assert_eq!(registry.stats().outstanding_submissions, 0);
    }

    #[test]
    fn test_failed_allocation_registers_nothing() {
        let registry = AllocationRegistry::with_address_space(0, 0x1000);
        let err = registry
            .allocate(0x2000, 64, AllocationKind::UserBuffer)
            .unwrap_err();
        assert!(matches!(err, AllocationError::OutOfMemory { .. }));
        let stats = registry.stats();
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.total_allocated, 0);
    }

    #[test]
    fn test_double_release() {
        let registry = registry();
        let alloc = registry
            .allocate(64, 64, AllocationKind::UserBuffer)
            .unwrap();
        registry.release(&alloc).unwrap();
        assert_eq!(
            registry.release(&alloc).unwrap_err(),
            AllocationError::AlreadyReleased(alloc.id())
        );
        assert_eq!(
            registry.mark_resident(&alloc, SubmissionId::next()).unwrap_err(),
            AllocationError::AlreadyReleased(alloc.id())
        );
    }

    #[test]
    fn test_concurrent_residency() {
        let registry = Arc::new(registry());
        let alloc = registry
            .allocate(64, 64, AllocationKind::UserBuffer)
            .unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    let submission = SubmissionId::next();
                    registry.mark_resident(&alloc, submission).unwrap();
                    submission
                })
            })
            .collect();
        let submissions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(registry.holders(&alloc), 4);
        for (tag, submission) in submissions.into_iter().enumerate() {
            registry.retire(submission, tag as u64 + 1);
        }
        assert_eq!(registry.state(&alloc), AllocationState::Idle);
        assert_eq!(alloc.completion_tag(), 4);
    }
}
