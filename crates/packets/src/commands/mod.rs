//! Logical command definitions
//!
//! Each submodule declares the generation-agnostic field set of one command
//! together with a layout table type and generic encode/decode routines. The
//! generation modules (`gen9`, `gen12lp`, `xe_hpc`) provide the concrete
//! layout tables.

pub mod batch_buffer;
pub mod front_end;
pub mod interface_descriptor;
pub mod pipe_control;
pub mod sampler_state;
pub mod semaphore;
pub mod state_base_address;
pub mod surface_state;
pub mod walker;

use crate::error::PacketError;
use crate::field::Packet;

pub use batch_buffer::BatchBufferStartFields;
pub use front_end::FrontEndStateFields;
pub use interface_descriptor::{InterfaceDescriptorFields, InterfaceDescriptorLoadFields};
pub use pipe_control::{PipeControlFields, PostSyncOperation};
pub use sampler_state::{FilterMode, SamplerStateFields, TextureAddressMode};
pub use semaphore::{SemaphoreCompare, SemaphoreWaitFields};
pub use state_base_address::StateBaseAddressFields;
pub use surface_state::{SURFACE_FORMAT_RAW, SurfaceStateFields, SurfaceType};
pub use walker::{PostSyncFields, SimdSize, WalkerFields};

/// Command identification bits carried in dword 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Memory-interface command (command type 0)
    Mi(u32),
    /// Graphics/compute pipeline command (command type 3)
    Gfx {
        pipeline: u32,
        opcode: u32,
        sub_opcode: u32,
    },
}

impl Opcode {
    const MI_MASK: u32 = 0xFF80_0000;
    const GFX_MASK: u32 = 0xFFFF_0000;

    /// Header dword for a packet of `dwords` length
    pub const fn header(self, dwords: usize) -> u32 {
        match self {
            Opcode::Mi(opcode) => {
                let length = if dwords > 1 { dwords as u32 - 2 } else { 0 };
                (opcode << 23) | length
            }
            Opcode::Gfx {
                pipeline,
                opcode,
                sub_opcode,
            } => (3 << 29) | (pipeline << 27) | (opcode << 24) | (sub_opcode << 16) | (dwords as u32 - 2),
        }
    }

    /// Whether `header` carries this opcode
    pub const fn matches(self, header: u32) -> bool {
        match self {
            Opcode::Mi(_) => header & Self::MI_MASK == self.header(1) & Self::MI_MASK,
            Opcode::Gfx { .. } => header & Self::GFX_MASK == self.header(2) & Self::GFX_MASK,
        }
    }

    /// Total dword count declared by `header`, if the command has a length field
    pub const fn declared_dwords(self, header: u32, expected: usize) -> usize {
        match self {
            Opcode::Mi(_) if expected == 1 => 1,
            _ => (header & 0xFF) as usize + 2,
        }
    }
}

/// Kinds of command that may appear in a command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Noop,
    BatchBufferEnd,
    BatchBufferStart,
    SemaphoreWait,
    StateBaseAddress,
    FrontEndState,
    InterfaceDescriptorLoad,
    Walker,
    PipeControl,
}

impl CommandKind {
    pub const ALL: [CommandKind; 9] = [
        CommandKind::Noop,
        CommandKind::BatchBufferEnd,
        CommandKind::BatchBufferStart,
        CommandKind::SemaphoreWait,
        CommandKind::StateBaseAddress,
        CommandKind::FrontEndState,
        CommandKind::InterfaceDescriptorLoad,
        CommandKind::Walker,
        CommandKind::PipeControl,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Noop => "MI_NOOP",
            CommandKind::BatchBufferEnd => "MI_BATCH_BUFFER_END",
            CommandKind::BatchBufferStart => "MI_BATCH_BUFFER_START",
            CommandKind::SemaphoreWait => "MI_SEMAPHORE_WAIT",
            CommandKind::StateBaseAddress => "STATE_BASE_ADDRESS",
            CommandKind::FrontEndState => "FRONT_END_STATE",
            CommandKind::InterfaceDescriptorLoad => "MEDIA_INTERFACE_DESCRIPTOR_LOAD",
            CommandKind::Walker => "WALKER",
            CommandKind::PipeControl => "PIPE_CONTROL",
        }
    }
}

/// A decoded (or to-be-encoded) command with its logical fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Noop,
    BatchBufferEnd,
    BatchBufferStart(BatchBufferStartFields),
    SemaphoreWait(SemaphoreWaitFields),
    StateBaseAddress(StateBaseAddressFields),
    FrontEndState(FrontEndStateFields),
    InterfaceDescriptorLoad(InterfaceDescriptorLoadFields),
    Walker(Box<WalkerFields>),
    PipeControl(PipeControlFields),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Noop => CommandKind::Noop,
            Command::BatchBufferEnd => CommandKind::BatchBufferEnd,
            Command::BatchBufferStart(_) => CommandKind::BatchBufferStart,
            Command::SemaphoreWait(_) => CommandKind::SemaphoreWait,
            Command::StateBaseAddress(_) => CommandKind::StateBaseAddress,
            Command::FrontEndState(_) => CommandKind::FrontEndState,
            Command::InterfaceDescriptorLoad(_) => CommandKind::InterfaceDescriptorLoad,
            Command::Walker(_) => CommandKind::Walker,
            Command::PipeControl(_) => CommandKind::PipeControl,
        }
    }
}

pub(crate) const MI_NOOP: Opcode = Opcode::Mi(0x00);
pub(crate) const MI_BATCH_BUFFER_END: Opcode = Opcode::Mi(0x0A);

/// Read an `N`-dword packet whose header has already matched `opcode`
pub(crate) fn read_packet<const N: usize>(
    words: &[u32],
    opcode: Opcode,
    kind: CommandKind,
) -> Result<Packet<N>, PacketError> {
    let packet = Packet::<N>::from_slice(words)?;
    let declared = opcode.declared_dwords(packet.header(), N);
    if declared != N {
        return Err(PacketError::LengthMismatch {
            command: kind.name(),
            declared,
            expected: N,
        });
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gfx_header() {
        let walker = Opcode::Gfx {
            pipeline: 2,
            opcode: 1,
            sub_opcode: 5,
        };
        assert_eq!(walker.header(15), 0x7105_000D);
        assert!(walker.matches(0x7105_000D));
        assert!(!walker.matches(0x7A00_0004));
        assert_eq!(walker.declared_dwords(0x7105_000D, 15), 15);
    }

    #[test]
    fn test_mi_header() {
        assert_eq!(MI_BATCH_BUFFER_END.header(1), 0x0500_0000);
        assert_eq!(MI_NOOP.header(1), 0);
        let bb_start = Opcode::Mi(0x31);
        assert_eq!(bb_start.header(3), 0x1880_0001);
        assert!(bb_start.matches(0x1880_0101));
        assert_eq!(bb_start.declared_dwords(0x1880_0001, 3), 3);
    }
}
