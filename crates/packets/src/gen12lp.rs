//! Gen12LP packet layouts
//!
//! Mostly Gen9 with a few additions: a bindless sampler heap in
//! STATE_BASE_ADDRESS, a five-dword semaphore, 1K shared-memory steps, the
//! HDC pipeline flush bit and a nested batch-buffer level.

use crate::commands::batch_buffer::{self, BatchBufferStartLayout};
use crate::commands::front_end::{self, FrontEndLayout};
use crate::commands::interface_descriptor::{
    self, INTERFACE_DESCRIPTOR_DWORDS, InterfaceDescriptorLayout, InterfaceDescriptorLoadLayout,
};
use crate::commands::pipe_control::{self, PipeControlLayout};
use crate::commands::semaphore::{self, SemaphoreWaitLayout};
use crate::commands::state_base_address::{self, BaseField, StateBaseAddressLayout};
use crate::commands::surface_state::{SURFACE_STATE_DWORDS, SurfaceStateLayout};
use crate::commands::walker::{self, WalkerLayout};
use crate::commands::{Command, CommandKind, MI_BATCH_BUFFER_END, MI_NOOP, read_packet};
use crate::error::PacketError;
use crate::field::{Field, Packet};
use crate::gen9;

pub type StateBaseAddress = Packet<22>;
pub type MediaVfeState = Packet<9>;
pub type InterfaceDescriptorLoad = Packet<4>;
pub type GpgpuWalker = Packet<15>;
pub type PipeControl = Packet<6>;
pub type SemaphoreWait = Packet<5>;
pub type BatchBufferStart = Packet<3>;
pub type InterfaceDescriptorData = Packet<INTERFACE_DESCRIPTOR_DWORDS>;
pub type SurfaceState = Packet<SURFACE_STATE_DWORDS>;

const _: () = assert!(StateBaseAddress::SIZE_BYTES == 88);
const _: () = assert!(MediaVfeState::SIZE_BYTES == 36);
const _: () = assert!(InterfaceDescriptorLoad::SIZE_BYTES == 16);
const _: () = assert!(GpgpuWalker::SIZE_BYTES == 60);
const _: () = assert!(PipeControl::SIZE_BYTES == 24);
const _: () = assert!(SemaphoreWait::SIZE_BYTES == 20);
const _: () = assert!(BatchBufferStart::SIZE_BYTES == 12);
const _: () = assert!(InterfaceDescriptorData::SIZE_BYTES == 32);
const _: () = assert!(SurfaceState::SIZE_BYTES == 64);

pub const STATE_BASE_ADDRESS: StateBaseAddressLayout = StateBaseAddressLayout {
    bindless_sampler_state: Some((BaseField::at(19), Field::new(21, 12, 20))),
    ..gen9::STATE_BASE_ADDRESS
};

pub const MEDIA_VFE_STATE: FrontEndLayout = gen9::MEDIA_VFE_STATE;

pub const INTERFACE_DESCRIPTOR: InterfaceDescriptorLayout = InterfaceDescriptorLayout {
    slm_granule: 1024,
    ..gen9::INTERFACE_DESCRIPTOR
};

pub const INTERFACE_DESCRIPTOR_LOAD: InterfaceDescriptorLoadLayout = gen9::INTERFACE_DESCRIPTOR_LOAD;

pub const GPGPU_WALKER: WalkerLayout = gen9::GPGPU_WALKER;

pub const PIPE_CONTROL: PipeControlLayout = PipeControlLayout {
    hdc_pipeline_flush: Some(Field::bit(0, 9)),
    ..gen9::PIPE_CONTROL
};

pub const SEMAPHORE_WAIT: SemaphoreWaitLayout = gen9::SEMAPHORE_WAIT;

pub const BATCH_BUFFER_START: BatchBufferStartLayout = BatchBufferStartLayout {
    nested_level: Some(Field::bit(0, 19)),
    ..gen9::BATCH_BUFFER_START
};

pub const SURFACE_STATE: SurfaceStateLayout = SurfaceStateLayout::with_coherency_bit(Field::bit(1, 16));

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
        Command::Noop => vec![MI_NOOP.header(1)],
        Command::BatchBufferEnd => vec![MI_BATCH_BUFFER_END.header(1)],
        Command::BatchBufferStart(f) => {
            batch_buffer::encode::<3>(&BATCH_BUFFER_START, f).words().to_vec()
        }
        Command::SemaphoreWait(f) => semaphore::encode::<5>(&SEMAPHORE_WAIT, f).words().to_vec(),
        Command::StateBaseAddress(f) => {
            state_base_address::encode::<22>(&STATE_BASE_ADDRESS, f).words().to_vec()
        }
        Command::FrontEndState(f) => front_end::encode::<9>(&MEDIA_VFE_STATE, f).words().to_vec(),
        Command::InterfaceDescriptorLoad(f) => {
            interface_descriptor::encode_load::<4>(&INTERFACE_DESCRIPTOR_LOAD, f).words().to_vec()
        }
        Command::Walker(f) => walker::encode::<15>(&GPGPU_WALKER, f).words().to_vec(),
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
