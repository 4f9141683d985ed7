//! MI_BATCH_BUFFER_START: jump into (or chain to) another command buffer

use super::Opcode;
use crate::field::{AddressField, Field, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBufferStartLayout {
    pub opcode: Opcode,
    pub ppgtt: Field,
    pub predication: Field,
    pub second_level: Field,
    pub nested_level: Option<Field>,
    pub address: AddressField,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchBufferStartFields {
    /// Target command buffer (4-byte aligned)
    pub address: u64,
    pub ppgtt: bool,
    pub predication: bool,
    pub second_level: bool,
    pub nested_level: bool,
}

pub fn encode<const N: usize>(
    layout: &BatchBufferStartLayout,
    fields: &BatchBufferStartFields,
) -> Packet<N> {
    let mut packet = Packet::with_header(layout.opcode.header(N));
    packet.set_flag(layout.ppgtt, fields.ppgtt);
    packet.set_flag(layout.predication, fields.predication);
    packet.set_flag(layout.second_level, fields.second_level);
    if let Some(field) = layout.nested_level {
        packet.set_flag(field, fields.nested_level);
    }
    packet.set_address(layout.address, fields.address);
    packet
}

pub fn decode<const N: usize>(layout: &BatchBufferStartLayout, packet: &Packet<N>) -> BatchBufferStartFields {
    BatchBufferStartFields {
        address: packet.address(layout.address),
        ppgtt: packet.flag(layout.ppgtt),
        predication: packet.flag(layout.predication),
        second_level: packet.flag(layout.second_level),
        nested_level: layout.nested_level.is_some_and(|f| packet.flag(f)),
    }
}
