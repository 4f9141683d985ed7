//! Gen9 packet layouts

use crate::commands::batch_buffer::{self, BatchBufferStartLayout};
use crate::commands::front_end::{self, FrontEndLayout};
use crate::commands::interface_descriptor::{
    self, INTERFACE_DESCRIPTOR_DWORDS, InterfaceDescriptorLayout, InterfaceDescriptorLoadLayout,
};
use crate::commands::pipe_control::{self, PipeControlLayout};
use crate::commands::semaphore::{self, SemaphoreWaitLayout};
use crate::commands::state_base_address::{self, BaseField, SizeField, StateBaseAddressLayout};
use crate::commands::surface_state::{SURFACE_STATE_DWORDS, SurfaceStateLayout};
use crate::commands::walker::{self, WalkerLayout};
use crate::commands::{Command, CommandKind, MI_BATCH_BUFFER_END, MI_NOOP, Opcode, read_packet};
use crate::error::PacketError;
use crate::field::{AddressField, Field, Packet};

pub type StateBaseAddress = Packet<19>;
pub type MediaVfeState = Packet<9>;
pub type InterfaceDescriptorLoad = Packet<4>;
pub type GpgpuWalker = Packet<15>;
pub type PipeControl = Packet<6>;
pub type SemaphoreWait = Packet<4>;
pub type BatchBufferStart = Packet<3>;
pub type InterfaceDescriptorData = Packet<INTERFACE_DESCRIPTOR_DWORDS>;
pub type SurfaceState = Packet<SURFACE_STATE_DWORDS>;

const _: () = assert!(StateBaseAddress::SIZE_BYTES == 76);
const _: () = assert!(MediaVfeState::SIZE_BYTES == 36);
const _: () = assert!(InterfaceDescriptorLoad::SIZE_BYTES == 16);
const _: () = assert!(GpgpuWalker::SIZE_BYTES == 60);
const _: () = assert!(PipeControl::SIZE_BYTES == 24);
const _: () = assert!(SemaphoreWait::SIZE_BYTES == 16);
const _: () = assert!(BatchBufferStart::SIZE_BYTES == 12);
const _: () = assert!(InterfaceDescriptorData::SIZE_BYTES == 32);
const _: () = assert!(SurfaceState::SIZE_BYTES == 64);

pub const STATE_BASE_ADDRESS: StateBaseAddressLayout = StateBaseAddressLayout {
    opcode: Opcode::Gfx {
        pipeline: 0,
        opcode: 1,
        sub_opcode: 1,
    },
    mocs: Field::new(1, 4, 7),
    stateless_mocs: Field::new(3, 16, 7),
    general_state: BaseField::at(1),
    surface_state: BaseField::at(4),
    dynamic_state: BaseField::at(6),
    indirect_object: BaseField::at(8),
    instruction: BaseField::at(10),
    general_state_size: SizeField::at(12),
    dynamic_state_size: SizeField::at(13),
    indirect_object_size: SizeField::at(14),
    instruction_size: SizeField::at(15),
    bindless_surface_state: BaseField::at(16),
    bindless_surface_state_size: Field::new(18, 12, 20),
    bindless_sampler_state: None,
};

pub const MEDIA_VFE_STATE: FrontEndLayout = FrontEndLayout {
    opcode: Opcode::Gfx {
        pipeline: 2,
        opcode: 0,
        sub_opcode: 0,
    },
    scratch_base: AddressField::new(Field::new(1, 10, 38), 10),
    per_thread_scratch: Field::new(1, 0, 4),
    scratch_granule: 1024,
    max_threads: Field::new(3, 16, 16),
    urb_entries: Some(Field::new(3, 8, 8)),
    curbe_allocation_size: Some(Field::new(5, 0, 16)),
    overdispatch_disable: None,
};

pub const INTERFACE_DESCRIPTOR: InterfaceDescriptorLayout = InterfaceDescriptorLayout {
    kernel_start_pointer: AddressField::new(Field::new(0, 6, 42), 6),
    denorm_retain: Field::bit(2, 19),
    single_program_flow: Field::bit(2, 18),
    sampler_count: Field::new(3, 2, 3),
    sampler_state_pointer: AddressField::new(Field::new(3, 5, 27), 5),
    binding_table_entry_count: Field::new(4, 0, 5),
    binding_table_pointer: AddressField::new(Field::new(4, 5, 11), 5),
    constant_read_length: Some(Field::new(5, 16, 16)),
    threads_in_group: Field::new(6, 0, 10),
    shared_local_memory: Field::new(6, 16, 5),
    slm_granule: 4096,
    barrier_enable: Field::bit(6, 21),
    cross_thread_read_length: Field::new(7, 0, 8),
};

pub const INTERFACE_DESCRIPTOR_LOAD: InterfaceDescriptorLoadLayout = InterfaceDescriptorLoadLayout {
    opcode: Opcode::Gfx {
        pipeline: 2,
        opcode: 0,
        sub_opcode: 2,
    },
    total_length: Field::new(2, 0, 17),
    data_start: AddressField::new(Field::new(3, 6, 26), 6),
};

pub const GPGPU_WALKER: WalkerLayout = WalkerLayout {
    opcode: Opcode::Gfx {
        pipeline: 2,
        opcode: 1,
        sub_opcode: 5,
    },
    predicate_enable: Field::bit(0, 8),
    interface_descriptor_offset: Some(Field::new(1, 0, 6)),
    indirect_data_length: Field::new(2, 0, 17),
    indirect_data_start: AddressField::new(Field::new(3, 6, 26), 6),
    threads_per_group: Some(Field::new(4, 0, 6)),
    simd_size: Field::new(4, 30, 2),
    emit_local_id: None,
    local_size: None,
    thread_group_start: [Field::dword(5), Field::dword(8), Field::dword(11)],
    thread_group_count: [Field::dword(7), Field::dword(10), Field::dword(12)],
    right_execution_mask: Field::dword(13),
    bottom_execution_mask: Some(Field::dword(14)),
    interface_descriptor: None,
    post_sync: None,
};

pub const PIPE_CONTROL: PipeControlLayout = PipeControlLayout::base(
    Opcode::Gfx {
        pipeline: 3,
        opcode: 2,
        sub_opcode: 0,
    },
    AddressField::new(Field::new(2, 3, 45), 3),
);

pub const SEMAPHORE_WAIT: SemaphoreWaitLayout = SemaphoreWaitLayout {
    opcode: Opcode::Mi(0x1C),
    compare: Field::new(0, 12, 3),
    polling: Field::bit(0, 15),
    data: Field::dword(1),
    address: AddressField::new(Field::new(2, 2, 46), 2),
};

pub const BATCH_BUFFER_START: BatchBufferStartLayout = BatchBufferStartLayout {
    opcode: Opcode::Mi(0x31),
    ppgtt: Field::bit(0, 8),
    predication: Field::bit(0, 15),
    second_level: Field::bit(0, 22),
    nested_level: None,
    address: AddressField::new(Field::new(1, 2, 46), 2),
};

pub const SURFACE_STATE: SurfaceStateLayout = SurfaceStateLayout::with_coherency_bit(Field::bit(5, 14));

pub(crate) fn command_dwords(kind: CommandKind) -> Option<usize> {
    match kind {
        CommandKind::Noop | CommandKind::BatchBufferEnd => Some(1),
        CommandKind::BatchBufferStart => Some(BatchBufferStart::DWORDS),
        CommandKind::SemaphoreWait => Some(SemaphoreWait::DWORDS),
        CommandKind::StateBaseAddress => Some(StateBaseAddress::DWORDS),
        CommandKind::FrontEndState => Some(MediaVfeState::DWORDS),
        CommandKind::InterfaceDescriptorLoad => Some(InterfaceDescriptorLoad::DWORDS),
        CommandKind::Walker => Some(GpgpuWalker::DWORDS),
        CommandKind::PipeControl => Some(PipeControl::DWORDS),
    }
}

pub(crate) fn encode(command: &Command) -> Result<Vec<u32>, PacketError> {
    let words = match command {
        Command::BatchBufferStart(f) => {
            batch_buffer::encode::<3>(&BATCH_BUFFER_START, f).words().to_vec()
        }
        Command::SemaphoreWait(f) => semaphore::encode::<4>(&SEMAPHORE_WAIT, f).words().to_vec(),
        Command::StateBaseAddress(f) => {
            state_base_address::encode::<19>(&STATE_BASE_ADDRESS, f).words().to_vec()
        }
        Command::FrontEndState(f) => front_end::encode::<9>(&MEDIA_VFE_STATE, f).words().to_vec(),
        Command::InterfaceDescriptorLoad(f) => {
            interface_descriptor::encode_load::<4>(&INTERFACE_DESCRIPTOR_LOAD, f).words().to_vec()
        }
        Command::Walker(f) => walker::encode::<15>(&GPGPU_WALKER, f).words().to_vec(),
        Command::PipeControl(f) => pipe_control::encode::<6>(&PIPE_CONTROL, f).words().to_vec(),
        Command::Noop => vec![MI_NOOP.header(1)],
        Command::BatchBufferEnd => vec![MI_BATCH_BUFFER_END.header(1)],
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
        let packet = read_packet::<4>(words, SEMAPHORE_WAIT.opcode, CommandKind::SemaphoreWait)?;
        (Command::SemaphoreWait(semaphore::decode(&SEMAPHORE_WAIT, &packet)), 4)
    } else if STATE_BASE_ADDRESS.opcode.matches(header) {
        let packet = read_packet::<19>(words, STATE_BASE_ADDRESS.opcode, CommandKind::StateBaseAddress)?;
        (
            Command::StateBaseAddress(state_base_address::decode(&STATE_BASE_ADDRESS, &packet)),
            19,
        )
    } else if MEDIA_VFE_STATE.opcode.matches(header) {
        let packet = read_packet::<9>(words, MEDIA_VFE_STATE.opcode, CommandKind::FrontEndState)?;
        (Command::FrontEndState(front_end::decode(&MEDIA_VFE_STATE, &packet)), 9)
    } else if INTERFACE_DESCRIPTOR_LOAD.opcode.matches(header) {
        let packet = read_packet::<4>(
            words,
            INTERFACE_DESCRIPTOR_LOAD.opcode,
            CommandKind::InterfaceDescriptorLoad,
        )?;
        (
            Command::InterfaceDescriptorLoad(interface_descriptor::decode_load(
                &INTERFACE_DESCRIPTOR_LOAD,
                &packet,
            )),
            4,
        )
    } else if GPGPU_WALKER.opcode.matches(header) {
        let packet = read_packet::<15>(words, GPGPU_WALKER.opcode, CommandKind::Walker)?;
        (Command::Walker(Box::new(walker::decode(&GPGPU_WALKER, &packet))), 15)
    } else if PIPE_CONTROL.opcode.matches(header) {
        let packet = read_packet::<6>(words, PIPE_CONTROL.opcode, CommandKind::PipeControl)?;
        (Command::PipeControl(pipe_control::decode(&PIPE_CONTROL, &packet)), 6)
    } else {
        return Ok(None);
    };
    Ok(Some(decoded))
}
