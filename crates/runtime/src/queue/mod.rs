//! Command queue: turns dispatches into submitted command buffers
//!
//! Every enqueue produces one self-contained command buffer:
//!
//! 1. state invalidation and state base addresses for this dispatch's heaps
//! 2. front-end state (scratch, thread count)
//! 3. the interface descriptor load, on generations without inline descriptors
//! 4. semaphore waits for dependencies on other queues
//! 5. one walker per uniform region of the dispatch
//! 6. a pipe control writing the queue's completion tag, then batch end
//!
//! Work whose dependencies are not yet submitted is deferred and replayed in
//! enqueue order by [`CommandQueue::flush`].

pub mod builtins;
pub mod completion;
pub mod heap;
pub mod transport;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anvil_packets::prelude::*;

use crate::device::{DeviceShared, instantiate};
use crate::dispatch::{DispatchInfo, DispatchRegion, WalkerGeometry, generate_local_ids};
use crate::error::{AllocationError, DescriptorError, EnqueueError};
use crate::instrumentation::InstrumentationResource;
use crate::kernel::{ArgValue, KernelDescriptor, KernelInstance, SURFACE_STATE_SIZE};
use crate::memory::objects::buffer_surface;
use crate::memory::{Allocation, AllocationKind, Buffer, ContextId, MemoryAccess, SubmissionId};

pub use completion::{CompletionToken, Dependency, TokenStatus, UserEvent};
use completion::Resolution;
pub use heap::{HeapChunk, LinearHeap};
pub use transport::{ExecutedBatch, SimulatedTransport, SubmissionTransport, SubmitBatch};

const INTERFACE_DESCRIPTOR_SIZE: u64 = 32;

static NEXT_QUEUE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u64);

/// Enqueue-time work geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub work_dim: u32,
    pub global_size: [u64; 3],
    pub global_offset: [u64; 3],
    pub local_size: Option<[u32; 3]>,
}

impl NdRange {
    pub fn new_1d(x: u64) -> Self {
        Self::with_dim(1, [x, 1, 1])
    }

    pub fn new_2d(x: u64, y: u64) -> Self {
        Self::with_dim(2, [x, y, 1])
    }

    pub fn new_3d(x: u64, y: u64, z: u64) -> Self {
        Self::with_dim(3, [x, y, z])
    }

    fn with_dim(work_dim: u32, global_size: [u64; 3]) -> Self {
        Self {
            work_dim,
            global_size,
            global_offset: [0; 3],
            local_size: None,
        }
    }

    pub fn with_offset(mut self, offset: [u64; 3]) -> Self {
        self.global_offset = offset;
        self
    }

    pub fn with_local_size(mut self, local: [u32; 3]) -> Self {
        self.local_size = Some(local);
        self
    }
}

#[derive(Debug)]
enum Work {
    Kernel { kernel: KernelInstance, range: NdRange },
    Marker,
}

/// Work held back by an unresolved dependency
#[derive(Debug)]
struct DeferredWork {
    work: Work,
    wait_list: Vec<Dependency>,
    token: CompletionToken,
    /// Driver allocations owned by this work, released if it never runs
    temporaries: Vec<Arc<Allocation>>,
    /// Buffer views kept alive until the work is submitted
    retained: Vec<Buffer>,
}

#[derive(Debug)]
struct SubmissionRecord {
    submission: SubmissionId,
    tag: u64,
}

#[derive(Debug)]
struct Builtins {
    copy: KernelInstance,
    fill: KernelInstance,
}

/// In-order queue of one context
pub struct CommandQueue {
    id: QueueId,
    context: ContextId,
    device: Arc<DeviceShared>,
    tag_buffer: Arc<Allocation>,
    last_tag: u64,
    surface_heap: LinearHeap,
    dynamic_heap: LinearHeap,
    indirect_heap: LinearHeap,
    outstanding: VecDeque<SubmissionRecord>,
    deferred: VecDeque<DeferredWork>,
    builtins: Option<Builtins>,
}

impl CommandQueue {
    pub(crate) fn new(device: Arc<DeviceShared>, context: ContextId) -> Result<Self, AllocationError> {
        let registry = Arc::clone(&device.registry);
        let heap_size = device.config.heap_size;
        let tag_buffer = registry.allocate(64, 64, AllocationKind::TagBuffer)?;
        let id = QueueId(NEXT_QUEUE.fetch_add(1, Ordering::Relaxed));
        log::debug!("created queue {id:?} in {context:?}, tag buffer at {:#x}", tag_buffer.gpu_address());
        Ok(Self {
            id,
            context,
            tag_buffer,
            last_tag: 0,
            surface_heap: LinearHeap::new(Arc::clone(&registry), AllocationKind::SurfaceStateHeap, heap_size),
            dynamic_heap: LinearHeap::new(Arc::clone(&registry), AllocationKind::DynamicStateHeap, heap_size),
            indirect_heap: LinearHeap::new(registry, AllocationKind::IndirectObjectHeap, heap_size),
            outstanding: VecDeque::new(),
            deferred: VecDeque::new(),
            builtins: None,
            device,
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn tag_buffer(&self) -> &Arc<Allocation> {
        &self.tag_buffer
    }

    /// Tag of the most recent successful submission
    pub fn last_tag(&self) -> u64 {
        self.last_tag
    }

    /// Submissions not yet seen complete
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Enqueued work still waiting on a dependency
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    // ========================================================================
    // Enqueue operations
    // ========================================================================

    /// Enqueue a dispatch of `kernel` over `range`
    ///
    /// The instance's argument state is snapshotted, so later `set_arg` calls
    /// do not affect this dispatch even when it is deferred.
    pub fn enqueue_kernel(
        &mut self,
        kernel: &KernelInstance,
        range: &NdRange,
        wait_list: &[Dependency],
        blocking: bool,
    ) -> Result<CompletionToken, EnqueueError> {
        self.enqueue_prepared(kernel.clone(), *range, wait_list, blocking, Vec::new(), Vec::new())
    }

    /// Copy `size` bytes between two buffers
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_copy_buffer(
        &mut self,
        src: &Buffer,
        dst: &Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
        wait_list: &[Dependency],
        blocking: bool,
    ) -> Result<CompletionToken, EnqueueError> {
        if src.context() != self.context || dst.context() != self.context {
            return Err(EnqueueError::ContextMismatch);
        }
        check_range(src, src_offset, size)?;
        check_range(dst, dst_offset, size)?;

        let src_view = src.sub_buffer(src_offset, size, MemoryAccess::ReadOnly)?;
        let dst_view = dst.sub_buffer(dst_offset, size, MemoryAccess::WriteOnly)?;
        let mut kernel = self.builtins()?.copy.clone();
        kernel.set_arg(0, ArgValue::Buffer(Some(&src_view)))?;
        kernel.set_arg(1, ArgValue::Buffer(Some(&dst_view)))?;
        log::debug!("queue {:?}: copy {size} bytes", self.id);
        self.enqueue_prepared(
            kernel,
            NdRange::new_1d(size),
            wait_list,
            blocking,
            Vec::new(),
            vec![src_view, dst_view],
        )
    }

    /// Fill `size` bytes of `dst` from `offset` with a repeated pattern
    ///
    /// The pattern must be a power of two of at most 128 bytes, and `offset`
    /// and `size` multiples of it.
    pub fn enqueue_fill_buffer(
        &mut self,
        dst: &Buffer,
        pattern: &[u8],
        offset: u64,
        size: u64,
        wait_list: &[Dependency],
        blocking: bool,
    ) -> Result<CompletionToken, EnqueueError> {
        let len = pattern.len();
        if len == 0 || len > 128 || !len.is_power_of_two() {
            return Err(EnqueueError::InvalidFillPattern(len));
        }
        if dst.context() != self.context {
            return Err(EnqueueError::ContextMismatch);
        }
        check_range(dst, offset, size)?;
        if offset % len as u64 != 0 || size % len as u64 != 0 {
            return Err(EnqueueError::InvalidCopyRange {
                offset,
                size,
                limit: dst.size(),
            });
        }

        let dst_view = dst.sub_buffer(offset, size, MemoryAccess::WriteOnly)?;
        let registry = Arc::clone(&self.device.registry);
        let pattern_memory = registry.allocate_temporary(len as u64, 64, AllocationKind::FillPattern)?;
        let mut kernel = self.builtins()?.fill.clone();
        let bound = pattern_memory
            .write(0, pattern)
            .map_err(EnqueueError::from)
            .and_then(|()| {
                kernel.set_arg(0, ArgValue::Buffer(Some(&dst_view)))?;
                kernel.set_arg_allocation(1, &pattern_memory)?;
                kernel.set_arg(2, ArgValue::Value(&(len as u32).to_le_bytes()))?;
                Ok(())
            });
        if let Err(err) = bound {
            release_unused(&registry, &[pattern_memory]);
            return Err(err);
        }
        log::debug!("queue {:?}: fill {size} bytes with a {len} byte pattern", self.id);
        self.enqueue_prepared(
            kernel,
            NdRange::new_1d(size),
            wait_list,
            blocking,
            vec![pattern_memory],
            vec![dst_view],
        )
    }

    /// Token that completes once everything before it and `wait_list` has
    pub fn enqueue_marker(&mut self, wait_list: &[Dependency]) -> Result<CompletionToken, EnqueueError> {
        let token = CompletionToken::deferred(self.id);
        self.schedule(DeferredWork {
            work: Work::Marker,
            wait_list: wait_list.to_vec(),
            token: token.clone(),
            temporaries: Vec::new(),
            retained: Vec::new(),
        })?;
        Ok(token)
    }

    fn enqueue_prepared(
        &mut self,
        kernel: KernelInstance,
        range: NdRange,
        wait_list: &[Dependency],
        blocking: bool,
        temporaries: Vec<Arc<Allocation>>,
        retained: Vec<Buffer>,
    ) -> Result<CompletionToken, EnqueueError> {
        let checked = self.check_kernel(&kernel, &range);
        if let Err(err) = checked {
            release_unused(&self.device.registry, &temporaries);
            return Err(err);
        }

        let token = CompletionToken::deferred(self.id);
        self.schedule(DeferredWork {
            work: Work::Kernel { kernel, range },
            wait_list: wait_list.to_vec(),
            token: token.clone(),
            temporaries,
            retained,
        })?;
        if blocking {
            self.wait_for(&token)?;
        }
        Ok(token)
    }

    /// Checks that must fail at enqueue time rather than at replay
    fn check_kernel(&self, kernel: &KernelInstance, range: &NdRange) -> Result<(), EnqueueError> {
        if kernel.context() != self.context {
            return Err(EnqueueError::ContextMismatch);
        }
        if !kernel.is_dispatch_ready() {
            return Err(EnqueueError::NotDispatchReady {
                kernel: kernel.name().to_string(),
                missing: kernel.missing_args(),
            });
        }
        DispatchInfo::build(
            kernel.descriptor(),
            &self.device.limits,
            range.work_dim,
            range.global_size,
            range.global_offset,
            range.local_size,
        )?;
        kernel.referenced_allocations()?;
        Ok(())
    }

    /// Submit `work` now, or defer it behind earlier deferred work or an
    /// unresolved dependency
    fn schedule(&mut self, work: DeferredWork) -> Result<(), EnqueueError> {
        let waits = match resolve(self.id, &work.wait_list) {
            Ok(waits) => waits,
            Err(err) => {
                work.token.set_failed();
                release_unused(&self.device.registry, &work.temporaries);
                return Err(err);
            }
        };
        match waits {
            Some(waits) if self.deferred.is_empty() => self.submit(work, &waits),
            _ => {
                log::debug!(
                    "queue {:?}: deferring work behind {} unresolved dependencies",
                    self.id,
                    self.deferred.len() + 1
                );
                self.deferred.push_back(work);
                Ok(())
            }
        }
    }

    fn submit(&mut self, work: DeferredWork, waits: &[(Arc<Allocation>, u64)]) -> Result<(), EnqueueError> {
        let mut temporaries = work.temporaries;
        let result = match &work.work {
            Work::Kernel { kernel, range } => self.submit_kernel(kernel, range, waits, &work.token, &mut temporaries),
            Work::Marker => {
                let mut stream = CommandStream::new(self.device.config.family);
                let residency = emit_waits(&mut stream, waits)?;
                self.submit_stream(SubmissionId::next(), stream, residency, &work.token, &mut temporaries)
            }
        };
        if let Err(err) = &result {
            log::warn!("queue {:?}: submission failed: {err}", self.id);
            work.token.set_failed();
            release_unused(&self.device.registry, &temporaries);
        }
        drop(work.retained);
        result
    }

    // ========================================================================
    // Command buffer construction
    // ========================================================================

    fn submit_kernel(
        &mut self,
        kernel: &KernelInstance,
        range: &NdRange,
        waits: &[(Arc<Allocation>, u64)],
        token: &CompletionToken,
        temporaries: &mut Vec<Arc<Allocation>>,
    ) -> Result<(), EnqueueError> {
        let submission = SubmissionId::next();
        let instrumentation = self.device.instrumentation.clone();
        let resource = instrumentation
            .as_ref()
            .and_then(|i| i.kernel_submitted(self.id, submission, kernel.kernel_id()));

        let result = self
            .encode_kernel(kernel, range, waits, resource.as_ref(), temporaries)
            .and_then(|(stream, residency)| self.submit_stream(submission, stream, residency, token, temporaries));
        if result.is_err() {
            if let Some(instrumentation) = &instrumentation {
                instrumentation.discard(submission);
            }
        }
        result
    }

    fn encode_kernel(
        &mut self,
        kernel: &KernelInstance,
        range: &NdRange,
        waits: &[(Arc<Allocation>, u64)],
        resource: Option<&InstrumentationResource>,
        temporaries: &mut Vec<Arc<Allocation>>,
    ) -> Result<(CommandStream, Vec<Arc<Allocation>>), EnqueueError> {
        let device = Arc::clone(&self.device);
        let family = device.config.family;
        let descriptor = kernel.descriptor();
        let grf = family.grf_size();
        let hw_threads = device.config.front_end_threads()?;

        let info = DispatchInfo::build(
            descriptor,
            &device.limits,
            range.work_dim,
            range.global_size,
            range.global_offset,
            range.local_size,
        )?;
        let local = info.effective_local_size(descriptor, &device.limits);
        let regions = info.regions(local);
        let mut residency = kernel.referenced_allocations()?;

        // surface state: the instance's descriptor table plus an optional
        // instrumentation surface right after it
        let surface_chunk = if descriptor.flags.uses_descriptor_table {
            let table = kernel.descriptor_table().as_bytes();
            let table_len = (table.len() as u64).div_ceil(64) * 64;
            let extra = if resource.is_some() { SURFACE_STATE_SIZE as u64 } else { 0 };
            let chunk = self.surface_heap.reserve(table_len + extra, 4096)?;
            chunk.write(0, table)?;
            if let Some(resource) = resource {
                bind_instrumentation(family, descriptor, &chunk, table_len, resource)?;
            }
            residency.push(Arc::clone(&chunk.allocation));
            Some(chunk)
        } else {
            if let Some(resource) = resource {
                return Err(EnqueueError::Instrumentation(format!(
                    "binding table index {} out of range: kernel '{}' has no binding table",
                    resource.binding_table_index, descriptor.name
                )));
            }
            None
        };
        if let Some(resource) = resource {
            residency.push(Arc::clone(&resource.allocation));
        }

        let isa = kernel.resources().isa();
        let instruction_base = isa.gpu_address() & !0xFFF;
        let kernel_start = isa.gpu_address() - instruction_base;

        // indirect data: one patched parameter block (plus local IDs where the
        // hardware does not generate them) per region, in a single chunk
        let block_len = (kernel.parameter_block().len() as u64).div_ceil(grf as u64) * grf as u64;
        let mut payloads = Vec::with_capacity(regions.len());
        for region in &regions {
            let mut block = kernel.parameter_block().clone();
            info.patch_traits(&descriptor.traits, region, local, &mut block)?;
            let mut payload = block.as_bytes().to_vec();
            payload.resize(block_len as usize, 0);
            if !family.generates_local_ids() {
                payload.extend(generate_local_ids(region.local_size, descriptor.simd, grf));
            }
            payloads.push(payload);
        }
        let mut offsets = Vec::with_capacity(payloads.len());
        let mut total = 0u64;
        for payload in &payloads {
            offsets.push(total);
            total += (payload.len() as u64).div_ceil(64) * 64;
        }
        let indirect = self.indirect_heap.reserve(total, 64)?;
        for (payload, &offset) in payloads.iter().zip(&offsets) {
            indirect.write(offset, payload)?;
        }
        residency.push(Arc::clone(&indirect.allocation));

        let geometries: Vec<WalkerGeometry> = regions
            .iter()
            .map(|region| WalkerGeometry::new(region.local_size, descriptor.simd))
            .collect();
        let interface_descriptor = |geometry: &WalkerGeometry| InterfaceDescriptorFields {
            kernel_start_pointer: kernel_start,
            sampler_count: descriptor.sampler_count(),
            binding_table_entry_count: descriptor.binding_table_count.min(31),
            binding_table_pointer: descriptor.binding_table_offset as u64,
            threads_in_group: geometry.threads_per_group,
            shared_local_memory_size: kernel.shared_memory_size(),
            barrier_enable: descriptor.flags.uses_barriers,
            cross_thread_read_length: descriptor.cross_thread_registers(grf),
            ..Default::default()
        };

        // dynamic state: interface descriptors for generations that load them
        let dynamic_chunk = if family.has_inline_interface_descriptor() {
            None
        } else {
            let chunk = self
                .dynamic_heap
                .reserve(geometries.len() as u64 * INTERFACE_DESCRIPTOR_SIZE, 64)?;
            for (index, geometry) in geometries.iter().enumerate() {
                let record = family.encode_interface_descriptor(&interface_descriptor(geometry));
                chunk.write(index as u64 * INTERFACE_DESCRIPTOR_SIZE, &record.to_bytes())?;
            }
            residency.push(Arc::clone(&chunk.allocation));
            Some(chunk)
        };

        // the front end rounds the per-thread size up to its encoding, and
        // every hardware thread may use that much
        let per_thread_scratch = family.programmed_scratch_size(descriptor.scratch_size).ok_or(
            DescriptorError::ScratchTooLarge {
                size: descriptor.scratch_size,
                limit: family.max_scratch_size(),
            },
        )?;
        let scratch = if per_thread_scratch > 0 {
            let size = per_thread_scratch as u64 * hw_threads as u64;
            let scratch = device.registry.allocate_temporary(size, 4096, AllocationKind::Scratch)?;
            temporaries.push(Arc::clone(&scratch));
            residency.push(Arc::clone(&scratch));
            Some(scratch)
        } else {
            None
        };

        let mut stream = CommandStream::new(family);
        stream.emit(&Command::PipeControl(PipeControlFields::state_invalidate()))?;
        stream.emit(&Command::StateBaseAddress(StateBaseAddressFields {
            surface_state_base: surface_chunk.as_ref().map(HeapChunk::gpu_address),
            dynamic_state_base: dynamic_chunk.as_ref().map(|c| c.allocation.gpu_address()),
            dynamic_state_size_pages: dynamic_chunk.as_ref().map(|c| pages(c.allocation.size())),
            indirect_object_base: Some(indirect.allocation.gpu_address()),
            indirect_object_size_pages: Some(pages(indirect.allocation.size())),
            instruction_base: Some(instruction_base),
            instruction_size_pages: Some(pages(kernel_start + isa.size())),
            ..Default::default()
        }))?;
        stream.emit(&Command::FrontEndState(FrontEndStateFields {
            scratch_base: scratch.as_ref().map_or(0, |s| s.gpu_address()),
            per_thread_scratch_size: per_thread_scratch,
            max_threads: hw_threads,
            ..Default::default()
        }))?;
        if let Some(chunk) = &dynamic_chunk {
            stream.emit(&Command::InterfaceDescriptorLoad(InterfaceDescriptorLoadFields {
                total_length: (geometries.len() as u64 * INTERFACE_DESCRIPTOR_SIZE) as u32,
                data_start: chunk.offset,
            }))?;
        }
        residency.extend(emit_waits(&mut stream, waits)?);

        let inline = family.has_inline_interface_descriptor();
        for (index, (region, geometry)) in regions.iter().zip(&geometries).enumerate() {
            stream.emit(&Command::Walker(Box::new(walker_fields(
                region,
                geometry,
                indirect.offset + offsets[index],
                payloads[index].len() as u32,
                if inline { 0 } else { index as u32 },
                if family.generates_local_ids() { (1 << info.work_dim) - 1 } else { 0 },
                if inline { interface_descriptor(geometry) } else { InterfaceDescriptorFields::default() },
            ))))?;
        }
        log::debug!(
            "queue {:?}: kernel '{}' as {} walkers, local {local:?}, {} bytes indirect data",
            self.id,
            descriptor.name,
            regions.len(),
            total
        );
        Ok((stream, residency))
    }

    /// Append the completion tag write, upload, pin and hand to the transport
    fn submit_stream(
        &mut self,
        submission: SubmissionId,
        mut stream: CommandStream,
        mut residency: Vec<Arc<Allocation>>,
        token: &CompletionToken,
        temporaries: &mut Vec<Arc<Allocation>>,
    ) -> Result<(), EnqueueError> {
        let device = Arc::clone(&self.device);
        let registry = &device.registry;
        let tag = self.last_tag + 1;
        let family = stream.family();

        stream.emit(&Command::PipeControl(PipeControlFields::write_immediate(
            self.tag_buffer.gpu_address(),
            tag,
        )))?;
        stream.emit(&Command::BatchBufferEnd)?;
        let commands = stream.finish();

        let command_buffer =
            registry.allocate_temporary(commands.len() as u64, 4096, AllocationKind::CommandBuffer)?;
        temporaries.push(Arc::clone(&command_buffer));
        command_buffer.write(0, &commands)?;
        residency.push(Arc::clone(&command_buffer));
        residency.push(Arc::clone(&self.tag_buffer));

        for allocation in &residency {
            if let Err(err) = registry.mark_resident(allocation, submission) {
                registry.abandon(submission);
                return Err(err.into());
            }
        }

        let batch = SubmitBatch {
            submission,
            queue: self.id,
            family,
            command_buffer,
            commands,
            residency,
            tag_address: self.tag_buffer.gpu_address(),
            completion_tag: tag,
        };
        if let Err(err) = device.transport.submit(batch) {
            registry.abandon(submission);
            return Err(err.into());
        }

        self.last_tag = tag;
        self.outstanding.push_back(SubmissionRecord { submission, tag });
        token.set_submitted(submission, tag, Arc::clone(&self.tag_buffer));
        if let Some(instrumentation) = &device.instrumentation {
            instrumentation.flushed(self.id, tag);
        }
        Ok(())
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Replay deferred work whose dependencies have resolved, in order
    ///
    /// Work whose dependency failed is dropped with its token failed.
    pub fn flush(&mut self) -> Result<usize, EnqueueError> {
        let mut submitted = 0;
        while let Some(front) = self.deferred.front() {
            match resolve(self.id, &front.wait_list) {
                Ok(None) => break,
                Ok(Some(waits)) => {
                    if let Some(work) = self.deferred.pop_front() {
                        self.submit(work, &waits)?;
                        submitted += 1;
                    }
                }
                Err(err) => {
                    if let Some(work) = self.deferred.pop_front() {
                        log::warn!("queue {:?}: dropping deferred work: {err}", self.id);
                        work.token.set_failed();
                        release_unused(&self.device.registry, &work.temporaries);
                    }
                }
            }
        }
        Ok(submitted)
    }

    /// Retire every submission whose tag the device has written
    pub fn process_completions(&mut self) -> Result<usize, EnqueueError> {
        let observed = self.tag_buffer.read_u64(0)?;
        let mut retired = 0;
        while let Some(record) = self.outstanding.front() {
            if record.tag > observed {
                break;
            }
            let tag = record.tag;
            let submission = record.submission;
            self.outstanding.pop_front();
            self.device.registry.retire(submission, tag);
            retired += 1;
        }
        if retired > 0 {
            if let Some(instrumentation) = &self.device.instrumentation {
                instrumentation.completed(self.id, observed);
            }
        }
        Ok(retired)
    }

    /// Block on `token`, replaying deferred work as its dependencies resolve
    fn wait_for(&mut self, token: &CompletionToken) -> Result<(), EnqueueError> {
        let timeout = self.device.config.wait_timeout;
        let start = Instant::now();
        loop {
            self.flush()?;
            match token.status() {
                TokenStatus::Complete => {
                    self.process_completions()?;
                    return Ok(());
                }
                TokenStatus::Failed => return Err(EnqueueError::DependencyFailed),
                TokenStatus::Deferred | TokenStatus::Submitted => {}
            }
            if start.elapsed() >= timeout {
                return Err(EnqueueError::Timeout(timeout));
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    /// Flush and block until every enqueued operation has completed
    pub fn finish(&mut self) -> Result<(), EnqueueError> {
        let timeout = self.device.config.wait_timeout;
        let start = Instant::now();
        loop {
            self.flush()?;
            self.process_completions()?;
            if self.deferred.is_empty() && self.outstanding.is_empty() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(EnqueueError::Timeout(timeout));
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    fn builtins(&mut self) -> Result<&Builtins, EnqueueError> {
        if self.builtins.is_none() {
            let copy = instantiate(&self.device, self.context, &builtins::copy_kernel()?)?;
            let fill = instantiate(&self.device, self.context, &builtins::fill_kernel()?)?;
            self.builtins = Some(Builtins { copy, fill });
        }
        self.builtins
            .as_ref()
            .ok_or_else(|| EnqueueError::Instrumentation("built-in kernels unavailable".to_string()))
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        for work in self.deferred.drain(..) {
            work.token.set_failed();
            release_unused(&self.device.registry, &work.temporaries);
        }
        if let Err(err) = self.device.registry.release(&self.tag_buffer) {
            log::warn!("releasing tag buffer of queue {:?}: {err}", self.id);
        }
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("last_tag", &self.last_tag)
            .field("outstanding", &self.outstanding.len())
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

/// Semaphore targets for `wait_list`, `None` while any dependency is unresolved
#[allow(clippy::type_complexity)]
fn resolve(queue: QueueId, wait_list: &[Dependency]) -> Result<Option<Vec<(Arc<Allocation>, u64)>>, EnqueueError> {
    let mut waits = Vec::new();
    let mut blocked = false;
    for dependency in wait_list {
        match dependency.resolve(queue) {
            Resolution::Satisfied => {}
            Resolution::Wait { tag_buffer, tag } => waits.push((tag_buffer, tag)),
            Resolution::Blocked => blocked = true,
            Resolution::Failed => return Err(EnqueueError::DependencyFailed),
        }
    }
    Ok((!blocked).then_some(waits))
}

/// Emit one semaphore wait per dependency; returns the tag buffers to pin
fn emit_waits(
    stream: &mut CommandStream,
    waits: &[(Arc<Allocation>, u64)],
) -> Result<Vec<Arc<Allocation>>, EnqueueError> {
    let mut pinned = Vec::with_capacity(waits.len());
    for (tag_buffer, tag) in waits {
        // semaphores compare 32 bits: the low dword of the 64-bit tag
        stream.emit(&Command::SemaphoreWait(SemaphoreWaitFields {
            compare: SemaphoreCompare::GreaterOrEqual,
            polling: true,
            data: *tag as u32,
            address: tag_buffer.gpu_address(),
        }))?;
        pinned.push(Arc::clone(tag_buffer));
    }
    Ok(pinned)
}

fn walker_fields(
    region: &DispatchRegion,
    geometry: &WalkerGeometry,
    indirect_data_start: u64,
    indirect_data_length: u32,
    interface_descriptor_offset: u32,
    emit_local_id: u32,
    interface_descriptor: InterfaceDescriptorFields,
) -> WalkerFields {
    WalkerFields {
        simd_size: geometry.simd,
        threads_per_group: geometry.threads_per_group,
        local_size: region.local_size,
        thread_group_start: region.group_start,
        thread_group_count: region.group_count,
        indirect_data_start,
        indirect_data_length,
        right_execution_mask: geometry.right_execution_mask,
        bottom_execution_mask: geometry.bottom_execution_mask,
        interface_descriptor_offset,
        emit_local_id,
        interface_descriptor,
        ..Default::default()
    }
}

/// Write the tool's surface after the descriptor table and point its
/// binding-table slot at it
fn bind_instrumentation(
    family: HardwareFamily,
    descriptor: &KernelDescriptor,
    chunk: &HeapChunk,
    surface_offset: u64,
    resource: &InstrumentationResource,
) -> Result<(), EnqueueError> {
    let index = resource.binding_table_index;
    if index >= descriptor.binding_table_count {
        return Err(EnqueueError::Instrumentation(format!(
            "binding table index {index} out of range ({} entries)",
            descriptor.binding_table_count
        )));
    }
    let allocation = &resource.allocation;
    let surface = buffer_surface(allocation.gpu_address(), allocation.size(), allocation.is_coherent());
    chunk.write(surface_offset, &family.encode_surface_state(&surface).to_bytes())?;
    let entry = family.encode_binding_table_entry(surface_offset);
    chunk.write(
        descriptor.binding_table_offset as u64 + index as u64 * 4,
        &entry.to_le_bytes(),
    )?;
    Ok(())
}

fn check_range(buffer: &Buffer, offset: u64, size: u64) -> Result<(), EnqueueError> {
    match offset.checked_add(size) {
        Some(end) if size > 0 && end <= buffer.size() => Ok(()),
        _ => Err(EnqueueError::InvalidCopyRange {
            offset,
            size,
            limit: buffer.size(),
        }),
    }
}

/// Release driver temporaries that no submission took ownership of
fn release_unused(registry: &crate::memory::AllocationRegistry, temporaries: &[Arc<Allocation>]) {
    for allocation in temporaries {
        if allocation.is_released() || registry.holders(allocation) > 0 {
            continue;
        }
        if let Err(err) = registry.release(allocation) {
            log::trace!("temporary {:?} already gone: {err}", allocation.id());
        }
    }
}

fn pages(bytes: u64) -> u32 {
    bytes.div_ceil(4096) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::walker::local_id_bytes_per_thread;

    #[test]
    fn test_nd_range_builders() {
        let range = NdRange::new_2d(64, 32).with_offset([4, 0, 0]).with_local_size([8, 8, 1]);
        assert_eq!(range.work_dim, 2);
        assert_eq!(range.global_size, [64, 32, 1]);
        assert_eq!(range.global_offset, [4, 0, 0]);
        assert_eq!(range.local_size, Some([8, 8, 1]));
        assert_eq!(NdRange::new_3d(2, 3, 4).global_size, [2, 3, 4]);
    }

    #[test]
    fn test_resolve_blocks_on_user_event() {
        let event = UserEvent::new();
        let waits = resolve(QueueId(1), &[Dependency::from(&event)]).unwrap();
        assert!(waits.is_none());
        event.set_complete();
        assert_eq!(resolve(QueueId(1), &[Dependency::from(&event)]).unwrap().unwrap().len(), 0);
        let failed = UserEvent::new();
        failed.set_failed();
        assert!(matches!(
            resolve(QueueId(1), &[Dependency::from(&failed)]),
            Err(EnqueueError::DependencyFailed)
        ));
    }

    #[test]
    fn test_local_id_payload_fits_walker() {
        let per_thread = local_id_bytes_per_thread(SimdSize::Simd16, 32);
        let payload = generate_local_ids([64, 1, 1], SimdSize::Simd16, 32);
        assert_eq!(payload.len() as u32, per_thread * 4);
    }
}
