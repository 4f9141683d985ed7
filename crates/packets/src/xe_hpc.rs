//! XeHPC packet layouts
//!
//! The interface descriptor moves inline into COMPUTE_WALKER, which also
//! carries its own post-sync write and hardware local-ID generation. There is
//! no MEDIA_INTERFACE_DESCRIPTOR_LOAD.

use crate::commands::batch_buffer::{self, BatchBufferStartLayout};
use crate::commands::front_end::{self, FrontEndLayout};
use crate::commands::interface_descriptor::{INTERFACE_DESCRIPTOR_DWORDS, InterfaceDescriptorLayout};
use crate::commands::pipe_control::{self, PipeControlLayout};
use crate::commands::semaphore::{self, SemaphoreWaitLayout};
use crate::commands::state_base_address::{self, StateBaseAddressLayout};
use crate::commands::surface_state::{SURFACE_STATE_DWORDS, SurfaceStateLayout};
use crate::commands::walker::{self, PostSyncLayout, WalkerLayout};
use crate::commands::{Command, CommandKind, MI_BATCH_BUFFER_END, MI_NOOP, Opcode, read_packet};
use crate::error::PacketError;
use crate::field::{AddressField, Field, Packet};
use crate::{gen9, gen12lp};

pub type StateBaseAddress = Packet<22>;
pub type CfeState = Packet<6>;
pub type ComputeWalker = Packet<39>;
pub type PipeControl = Packet<6>;
pub type SemaphoreWait = Packet<5>;
pub type BatchBufferStart = Packet<3>;
pub type InterfaceDescriptorData = Packet<INTERFACE_DESCRIPTOR_DWORDS>;
pub type SurfaceState = Packet<SURFACE_STATE_DWORDS>;

const _: () = assert!(StateBaseAddress::SIZE_BYTES == 88);
const _: () = assert!(CfeState::SIZE_BYTES == 24);
const _: () = assert!(ComputeWalker::SIZE_BYTES == 156);
const _: () = assert!(PipeControl::SIZE_BYTES == 24);
const _: () = assert!(SemaphoreWait::SIZE_BYTES == 20);
const _: () = assert!(BatchBufferStart::SIZE_BYTES == 12);
const _: () = assert!(InterfaceDescriptorData::SIZE_BYTES == 32);
const _: () = assert!(SurfaceState::SIZE_BYTES == 64);

/// Dword at which the interface descriptor sits inside COMPUTE_WALKER
pub const INLINE_INTERFACE_DESCRIPTOR_DWORD: usize = 17;

pub const STATE_BASE_ADDRESS: StateBaseAddressLayout = gen12lp::STATE_BASE_ADDRESS;

pub const CFE_STATE: FrontEndLayout = FrontEndLayout {
    opcode: Opcode::Gfx {
        pipeline: 2,
        opcode: 2,
        sub_opcode: 0,
    },
    scratch_base: AddressField::new(Field::new(1, 10, 54), 10),
    per_thread_scratch: Field::new(4, 0, 4),
    scratch_granule: 64,
    max_threads: Field::new(3, 16, 16),
    urb_entries: None,
    curbe_allocation_size: None,
    overdispatch_disable: Some(Field::bit(3, 3)),
};

/// Interface descriptor layout relative to its own first dword
pub const INTERFACE_DESCRIPTOR: InterfaceDescriptorLayout = InterfaceDescriptorLayout {
    kernel_start_pointer: AddressField::new(Field::new(0, 6, 58), 6),
    denorm_retain: Field::bit(2, 19),
    single_program_flow: Field::bit(2, 18),
    sampler_count: Field::new(3, 2, 3),
    sampler_state_pointer: AddressField::new(Field::new(3, 5, 27), 5),
    binding_table_entry_count: Field::new(4, 0, 5),
    binding_table_pointer: AddressField::new(Field::new(4, 5, 16), 5),
    constant_read_length: None,
    threads_in_group: Field::new(5, 0, 10),
    shared_local_memory: Field::new(5, 16, 5),
    slm_granule: 1024,
    barrier_enable: Field::bit(5, 28),
    cross_thread_read_length: Field::new(6, 0, 8),
};

pub const COMPUTE_WALKER: WalkerLayout = WalkerLayout {
    opcode: Opcode::Gfx {
        pipeline: 2,
        opcode: 2,
        sub_opcode: 2,
    },
    predicate_enable: Field::bit(0, 8),
    interface_descriptor_offset: None,
    indirect_data_length: Field::new(2, 0, 17),
    indirect_data_start: AddressField::new(Field::new(3, 6, 26), 6),
    threads_per_group: None,
    simd_size: Field::new(4, 30, 2),
    emit_local_id: Some(Field::new(4, 22, 3)),
    local_size: Some([Field::new(6, 0, 10), Field::new(6, 10, 10), Field::new(6, 20, 10)]),
    thread_group_start: [Field::dword(10), Field::dword(11), Field::dword(12)],
    thread_group_count: [Field::dword(7), Field::dword(8), Field::dword(9)],
    right_execution_mask: Field::dword(5),
    bottom_execution_mask: None,
    interface_descriptor: Some(INTERFACE_DESCRIPTOR.at(INLINE_INTERFACE_DESCRIPTOR_DWORD)),
    post_sync: Some(PostSyncLayout {
        operation: Field::new(25, 0, 2),
        address: AddressField::new(Field::new(26, 3, 61), 3),
        immediate: Field::new(28, 0, 64),
    }),
};

pub const PIPE_CONTROL: PipeControlLayout = PipeControlLayout {
    untyped_dataport_cache_flush: Some(Field::bit(0, 10)),
    address: AddressField::new(Field::new(2, 3, 54), 3),
    ..gen12lp::PIPE_CONTROL
};

pub const SEMAPHORE_WAIT: SemaphoreWaitLayout = SemaphoreWaitLayout {
    address: AddressField::new(Field::new(2, 2, 62), 2),
    ..gen9::SEMAPHORE_WAIT
};

pub const BATCH_BUFFER_START: BatchBufferStartLayout = BatchBufferStartLayout {
    address: AddressField::new(Field::new(1, 2, 62), 2),
    ..gen12lp::BATCH_BUFFER_START
};

pub const SURFACE_STATE: SurfaceStateLayout = gen12lp::SURFACE_STATE;

pub(crate) fn command_dwords(kind: CommandKind) -> Option<usize> {
    match kind {
        CommandKind::Noop | CommandKind::BatchBufferEnd => Some(1),
        CommandKind::BatchBufferStart => Some(BatchBufferStart::DWORDS),
        CommandKind::SemaphoreWait => Some(SemaphoreWait::DWORDS),
        CommandKind::StateBaseAddress => Some(StateBaseAddress::DWORDS),
        CommandKind::FrontEndState => Some(CfeState::DWORDS),
        CommandKind::InterfaceDescriptorLoad => None,
        CommandKind::Walker => Some(ComputeWalker::DWORDS),
        CommandKind::PipeControl => Some(PipeControl::DWORDS),
    }
}

pub(crate) fn encode(command: &Command) -> Result<Vec<u32>, PacketError> {
    let words = match command {
        Command::Noop => vec![MI_NOOP.header(1)],
        Command::BatchBufferEnd => vec![MI_BATCH_BUFFER_END.header(1)],
        Command::BatchBufferStart(f) => {
            batch_buffer::encode::<3>(&BATCH_BUFFER_START, f).words().to_vec()
        }
        Command::SemaphoreWait(f) => semaphore::encode::<5>(&SEMAPHORE_WAIT, f).words().to_vec(),
        Command::StateBaseAddress(f) => {
            state_base_address::encode::<22>(&STATE_BASE_ADDRESS, f).words().to_vec()
        }
        Command::FrontEndState(f) => front_end::encode::<6>(&CFE_STATE, f).words().to_vec(),
        Command::InterfaceDescriptorLoad(_) => {
            return Err(PacketError::Unsupported {
                command: CommandKind::InterfaceDescriptorLoad.name(),
                family: "XeHPC",
            });
        }
        Command::Walker(f) => walker::encode::<39>(&COMPUTE_WALKER, f).words().to_vec(),
        Command::PipeControl(f) => pipe_control::encode::<6>(&PIPE_CONTROL, f).words().to_vec(),
    };
    Ok(words)
}

pub(crate) fn decode(words: &[u32]) -> Result<Option<(Command, usize)>, PacketError> {
    let header = words[0];
    let decoded = if MI_NOOP.matches(header) {
        (Command::Noop, 1)
    } else if MI_BATCH_BUFFER_END.matches(header) {
        (Command::BatchBufferEnd, 1)
    } else if BATCH_BUFFER_START.opcode.matches(header) {
        let packet = read_packet::<3>(words, BATCH_BUFFER_START.opcode, CommandKind::BatchBufferStart)?;
        (Command::BatchBufferStart(batch_buffer::decode(&BATCH_BUFFER_START, &packet)), 3)
    } else if SEMAPHORE_WAIT.opcode.matches(header) {
        let packet = read_packet::<5>(words, SEMAPHORE_WAIT.opcode, CommandKind::SemaphoreWait)?;
        (Command::SemaphoreWait(semaphore::decode(&SEMAPHORE_WAIT, &packet)), 5)
    } else if STATE_BASE_ADDRESS.opcode.matches(header) {
        let packet = read_packet::<22>(words, STATE_BASE_ADDRESS.opcode, CommandKind::StateBaseAddress)?;
        (
            Command::StateBaseAddress(state_base_address::decode(&STATE_BASE_ADDRESS, &packet)),
            22,
        )
    } else if CFE_STATE.opcode.matches(header) {
        let packet = read_packet::<6>(words, CFE_STATE.opcode, CommandKind::FrontEndState)?;
        (Command::FrontEndState(front_end::decode(&CFE_STATE, &packet)), 6)
    } else if COMPUTE_WALKER.opcode.matches(header) {
        let packet = read_packet::<39>(words, COMPUTE_WALKER.opcode, CommandKind::Walker)?;
        (Command::Walker(Box::new(walker::decode(&COMPUTE_WALKER, &packet))), 39)
    } else if PIPE_CONTROL.opcode.matches(header) {
        let packet = read_packet::<6>(words, PIPE_CONTROL.opcode, CommandKind::PipeControl)?;
        (Command::PipeControl(pipe_control::decode(&PIPE_CONTROL, &packet)), 6)
    } else {
        return Ok(None);
    };
    Ok(Some(decoded))
}
