//! Submission transport: hands finished command buffers to the device
//!
//! The queue talks to the device only through [`SubmissionTransport`].
//! [`SimulatedTransport`] is an in-process command streamer that decodes each
//! submitted stream and executes it against the allocations made resident
//! for it, so the whole enqueue pipeline can run without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anvil_packets::prelude::*;
use anvil_packets::commands::interface_descriptor::INTERFACE_DESCRIPTOR_DWORDS;
use rustc_hash::FxHashSet;

use super::QueueId;
use crate::error::TransportError;
use crate::memory::{Allocation, SubmissionId};

/// One command buffer ready for execution
#[derive(Debug, Clone)]
pub struct SubmitBatch {
    pub submission: SubmissionId,
    pub queue: QueueId,
    pub family: HardwareFamily,
    pub command_buffer: Arc<Allocation>,
    /// Byte image of the stream, identical to the command buffer contents
    pub commands: Vec<u8>,
    /// Every allocation the stream may touch
    pub residency: Vec<Arc<Allocation>>,
    pub tag_address: u64,
    pub completion_tag: u64,
}

/// Device submission interface
pub trait SubmissionTransport: Send + Sync {
    fn submit(&self, batch: SubmitBatch) -> Result<(), TransportError>;
}

// ============================================================================
// Simulated command streamer
// ============================================================================

/// Launch of one walker as seen by a kernel emulator
pub struct Launch<'a> {
    /// Indirect data the walker points at: the patched parameter block
    /// followed by any local-ID payload
    pub parameters: &'a [u8],
    pub thread_group_start: [u32; 3],
    pub thread_group_count: [u32; 3],
    memory: &'a ResidentMemory<'a>,
}

impl Launch<'_> {
    pub fn param_u32(&self, offset: usize) -> Result<u32, String> {
        self.parameters
            .get(offset..offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| format!("parameter read at {offset} out of range"))
    }

    pub fn param_u64(&self, offset: usize) -> Result<u64, String> {
        let low = self.param_u32(offset)? as u64;
        let high = self.param_u32(offset + 4)? as u64;
        Ok(low | high << 32)
    }

    pub fn read(&self, address: u64, len: u64) -> Result<Vec<u8>, String> {
        self.memory.read(address, len)
    }

    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), String> {
        self.memory.write(address, data)
    }
}

/// Emulates the effect of one kernel binary
pub type KernelEmulator = Box<dyn Fn(&Launch<'_>) -> Result<(), String> + Send + Sync>;

/// Device memory restricted to a batch's residency set
struct ResidentMemory<'a> {
    allocations: &'a [Arc<Allocation>],
}

impl ResidentMemory<'_> {
    fn resolve(&self, address: u64, len: u64) -> Result<(&Arc<Allocation>, u64), String> {
        self.allocations
            .iter()
            .find(|a| a.contains(address, len))
            .map(|a| (a, address - a.gpu_address()))
            .ok_or_else(|| format!("page fault: {len} bytes at {address:#x} not resident"))
    }

    fn read(&self, address: u64, len: u64) -> Result<Vec<u8>, String> {
        let (allocation, offset) = self.resolve(address, len)?;
        allocation.read(offset, len).map_err(|err| err.to_string())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), String> {
        let (allocation, offset) = self.resolve(address, data.len() as u64)?;
        allocation.write(offset, data).map_err(|err| err.to_string())
    }

    fn read_u32(&self, address: u64) -> Result<u32, String> {
        let bytes = self.read(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Record of one executed command buffer
#[derive(Debug, Clone)]
pub struct ExecutedBatch {
    pub submission: SubmissionId,
    pub queue: QueueId,
    pub commands: Vec<DecodedCommand>,
    pub walkers: usize,
    /// Walkers whose kernel binary had no registered emulator
    pub unknown_kernels: usize,
    pub faults: Vec<String>,
}

enum Outcome {
    Done(ExecutedBatch),
    /// Stalled on a semaphore; nothing was executed
    Blocked,
}

#[derive(Default)]
struct SimulatorState {
    pending: VecDeque<SubmitBatch>,
    executed: Vec<ExecutedBatch>,
    held: bool,
    reject_next: Option<String>,
    lost: bool,
}

/// In-process command streamer
#[derive(Default)]
pub struct SimulatedTransport {
    state: Mutex<SimulatorState>,
    emulators: Mutex<Vec<(Vec<u8>, KernelEmulator)>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `emulator` for walkers whose kernel binary starts with `isa`
    pub fn register_kernel(&self, isa: &[u8], emulator: KernelEmulator) {
        self.emulators.lock().unwrap().push((isa.to_vec(), emulator));
    }

    /// Queue submissions without executing them until [`run_pending`](Self::run_pending)
    pub fn hold(&self, held: bool) {
        self.state.lock().unwrap().held = held;
    }

    /// Fail the next submission with `reason`
    pub fn reject_next(&self, reason: &str) {
        self.state.lock().unwrap().reject_next = Some(reason.to_string());
    }

    /// Fail every later submission with [`TransportError::DeviceLost`]
    pub fn set_device_lost(&self) {
        self.state.lock().unwrap().lost = true;
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn executed(&self) -> Vec<ExecutedBatch> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn executed_batch(&self, submission: SubmissionId) -> Option<ExecutedBatch> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .find(|batch| batch.submission == submission)
            .cloned()
    }

    /// Execute queued batches until none can make progress
    ///
    /// Batches of one queue run in submission order; a batch stalled on a
    /// semaphore holds back the later batches of its queue only.
    pub fn run_pending(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut ran = 0;
        loop {
            let mut progressed = false;
            let mut blocked_queues = FxHashSet::default();
            let mut index = 0;
            while index < state.pending.len() {
                let queue = state.pending[index].queue;
                if blocked_queues.contains(&queue) {
                    index += 1;
                    continue;
                }
                match self.execute(&state.pending[index]) {
                    Outcome::Done(record) => {
                        state.pending.remove(index);
                        state.executed.push(record);
                        ran += 1;
                        progressed = true;
                    }
                    Outcome::Blocked => {
                        blocked_queues.insert(queue);
                        index += 1;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        ran
    }

    fn execute(&self, batch: &SubmitBatch) -> Outcome {
        let memory = ResidentMemory {
            allocations: &batch.residency,
        };
        let mut record = ExecutedBatch {
            submission: batch.submission,
            queue: batch.queue,
            commands: Vec::new(),
            walkers: 0,
            unknown_kernels: 0,
            faults: Vec::new(),
        };
        let commands = match decode_all(batch.family, &batch.commands) {
            Ok(commands) => commands,
            Err(err) => {
                log::warn!("submission {}: undecodable stream: {err}", batch.submission);
                record.faults.push(err.to_string());
                return Outcome::Done(record);
            }
        };

        // semaphores precede every side effect, so a stalled batch can be
        // retried from the start
        for decoded in &commands {
            if let Command::SemaphoreWait(wait) = &decoded.command {
                match memory.read_u32(wait.address) {
                    Ok(value) if wait.compare.satisfied(value, wait.data) => {}
                    Ok(value) => {
                        log::trace!(
                            "submission {}: semaphore at {:#x} holds {value}, waiting for {}",
                            batch.submission,
                            wait.address,
                            wait.data
                        );
                        return Outcome::Blocked;
                    }
                    Err(fault) => record.faults.push(fault),
                }
            }
        }

        let mut base = StateBaseAddressFields::default();
        let mut descriptor_start = 0;
        for decoded in &commands {
            match &decoded.command {
                Command::StateBaseAddress(fields) => merge_base(&mut base, fields),
                Command::InterfaceDescriptorLoad(load) => descriptor_start = load.data_start,
                Command::Walker(walker) => {
                    record.walkers += 1;
                    match self.launch(batch.family, &memory, &base, descriptor_start, walker) {
                        Ok(true) => {}
                        Ok(false) => record.unknown_kernels += 1,
                        Err(fault) => record.faults.push(fault),
                    }
                    if walker.post_sync.operation == PostSyncOperation::WriteImmediate {
                        post_sync(&memory, walker.post_sync.address, walker.post_sync.immediate, &mut record);
                    }
                }
                Command::PipeControl(pc) if pc.post_sync == PostSyncOperation::WriteImmediate => {
                    post_sync(&memory, pc.address, pc.immediate, &mut record);
                }
                Command::BatchBufferEnd => break,
                _ => {}
            }
        }
        for fault in &record.faults {
            log::warn!("submission {}: {fault}", batch.submission);
        }
        record.commands = commands;
        Outcome::Done(record)
    }

    /// Resolve a walker's kernel and run its emulator; `Ok(false)` when no
    /// emulator matches the binary
    fn launch(
        &self,
        family: HardwareFamily,
        memory: &ResidentMemory<'_>,
        base: &StateBaseAddressFields,
        descriptor_start: u64,
        walker: &WalkerFields,
    ) -> Result<bool, String> {
        let descriptor = if family.has_inline_interface_descriptor() {
            walker.interface_descriptor.clone()
        } else {
            let address = base.dynamic_state_base.unwrap_or(0)
                + descriptor_start
                + walker.interface_descriptor_offset as u64 * (INTERFACE_DESCRIPTOR_DWORDS as u64 * 4);
            let bytes = memory.read(address, INTERFACE_DESCRIPTOR_DWORDS as u64 * 4)?;
            let words: Vec<u32> = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let packet = Packet::from_slice(&words).map_err(|err| err.to_string())?;
            family.decode_interface_descriptor(&packet)
        };

        let isa_address = base.instruction_base.unwrap_or(0) + descriptor.kernel_start_pointer;
        let parameters = memory.read(
            base.indirect_object_base.unwrap_or(0) + walker.indirect_data_start,
            walker.indirect_data_length as u64,
        )?;

        let emulators = self.emulators.lock().unwrap();
        for (isa, emulator) in emulators.iter() {
            let Ok(binary) = memory.read(isa_address, isa.len() as u64) else {
                continue;
            };
            if binary == *isa {
                let launch = Launch {
                    parameters: &parameters,
                    thread_group_start: walker.thread_group_start,
                    thread_group_count: walker.thread_group_count,
                    memory,
                };
                emulator(&launch)?;
                return Ok(true);
            }
        }
        // the binary itself must at least be resident
        memory.read(isa_address, 4)?;
        Ok(false)
    }
}

impl SubmissionTransport for SimulatedTransport {
    fn submit(&self, batch: SubmitBatch) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.lost {
                return Err(TransportError::DeviceLost);
            }
            if let Some(reason) = state.reject_next.take() {
                return Err(TransportError::Rejected(reason));
            }
            log::debug!(
                "queue {:?}: submission {} ({} bytes, {} resident allocations, tag {})",
                batch.queue,
                batch.submission,
                batch.commands.len(),
                batch.residency.len(),
                batch.completion_tag
            );
            state.pending.push_back(batch);
            if state.held {
                return Ok(());
            }
        }
        self.run_pending();
        Ok(())
    }
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("SimulatedTransport")
            .field("pending", &state.pending.len())
            .field("executed", &state.executed.len())
            .field("held", &state.held)
            .finish()
    }
}

/// Later state base address commands only override the bases they modify
fn merge_base(base: &mut StateBaseAddressFields, update: &StateBaseAddressFields) {
    let fields = [
        (&mut base.general_state_base, update.general_state_base),
        (&mut base.surface_state_base, update.surface_state_base),
        (&mut base.dynamic_state_base, update.dynamic_state_base),
        (&mut base.indirect_object_base, update.indirect_object_base),
        (&mut base.instruction_base, update.instruction_base),
    ];
    for (slot, value) in fields {
        if value.is_some() {
            *slot = value;
        }
    }
}

fn post_sync(memory: &ResidentMemory<'_>, address: u64, value: u64, record: &mut ExecutedBatch) {
    if let Err(fault) = memory.write(address, &value.to_le_bytes()) {
        record.faults.push(fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationKind, AllocationRegistry};

    fn batch(
        registry: &AllocationRegistry,
        queue: u64,
        commands: &[Command],
        residency: Vec<Arc<Allocation>>,
    ) -> SubmitBatch {
        let family = HardwareFamily::Gen12Lp;
        let mut stream = CommandStream::new(family);
        for command in commands {
            stream.emit(command).unwrap();
        }
        let bytes = stream.finish();
        let command_buffer = registry
            .allocate_temporary(bytes.len() as u64, 4096, AllocationKind::CommandBuffer)
            .unwrap();
        command_buffer.write(0, &bytes).unwrap();
        SubmitBatch {
            submission: SubmissionId::next(),
            queue: QueueId(queue),
            family,
            command_buffer,
            commands: bytes,
            residency,
            tag_address: 0,
            completion_tag: 0,
        }
    }

    #[test]
    fn test_post_sync_and_faults() {
        let registry = AllocationRegistry::with_address_space(0x10_0000, 0x100_0000);
        let tag = registry.allocate(64, 64, AllocationKind::TagBuffer).unwrap();
        let transport = SimulatedTransport::new();

        let write = |address| Command::PipeControl(PipeControlFields::write_immediate(address, 7));
        transport
            .submit(batch(
                &registry,
                1,
                &[write(tag.gpu_address()), write(0x8000_0000), Command::BatchBufferEnd],
                vec![Arc::clone(&tag)],
            ))
            .unwrap();

        assert_eq!(tag.read_u64(0).unwrap(), 7);
        let executed = transport.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].faults.len(), 1);
        assert!(executed[0].faults[0].contains("not resident"));
    }

    #[test]
    fn test_semaphore_orders_queues() {
        let registry = AllocationRegistry::with_address_space(0x10_0000, 0x100_0000);
        let tag = registry.allocate(64, 64, AllocationKind::TagBuffer).unwrap();
        let flag = registry.allocate(64, 64, AllocationKind::TagBuffer).unwrap();
        let transport = SimulatedTransport::new();

        let wait = Command::SemaphoreWait(SemaphoreWaitFields {
            compare: SemaphoreCompare::GreaterOrEqual,
            polling: true,
            data: 1,
            address: tag.gpu_address(),
        });
        let signal = |target: &Allocation| {
            Command::PipeControl(PipeControlFields::write_immediate(target.gpu_address(), 1))
        };

        transport
            .submit(batch(
                &registry,
                2,
                &[wait, signal(&flag), Command::BatchBufferEnd],
                vec![Arc::clone(&tag), Arc::clone(&flag)],
            ))
            .unwrap();
        assert_eq!(transport.pending(), 1);
        assert_eq!(flag.read_u64(0).unwrap(), 0);

        transport
            .submit(batch(&registry, 1, &[signal(&tag), Command::BatchBufferEnd], vec![Arc::clone(&tag)]))
            .unwrap();
        assert_eq!(transport.pending(), 0);
        assert_eq!(flag.read_u64(0).unwrap(), 1);
        let order: Vec<u64> = transport.executed().iter().map(|b| b.queue.0).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_reject_and_device_lost() {
        let registry = AllocationRegistry::with_address_space(0x10_0000, 0x100_0000);
        let transport = SimulatedTransport::new();
        transport.reject_next("ring full");
        let err = transport
            .submit(batch(&registry, 1, &[Command::BatchBufferEnd], Vec::new()))
            .unwrap_err();
        assert_eq!(err, TransportError::Rejected("ring full".into()));

        transport
            .submit(batch(&registry, 1, &[Command::BatchBufferEnd], Vec::new()))
            .unwrap();
        transport.set_device_lost();
        assert_eq!(
            transport
                .submit(batch(&registry, 1, &[Command::BatchBufferEnd], Vec::new()))
                .unwrap_err(),
            TransportError::DeviceLost
        );
    }

    #[test]
    fn test_hold_defers_execution() {
        let registry = AllocationRegistry::with_address_space(0x10_0000, 0x100_0000);
        let tag = registry.allocate(64, 64, AllocationKind::TagBuffer).unwrap();
        let transport = SimulatedTransport::new();
        transport.hold(true);
        transport
            .submit(batch(
                &registry,
                1,
                &[
                    Command::PipeControl(PipeControlFields::write_immediate(tag.gpu_address(), 3)),
                    Command::BatchBufferEnd,
                ],
                vec![Arc::clone(&tag)],
            ))
            .unwrap();
        assert_eq!(tag.read_u64(0).unwrap(), 0);
        assert_eq!(transport.run_pending(), 1);
        assert_eq!(tag.read_u64(0).unwrap(), 3);
    }
}
