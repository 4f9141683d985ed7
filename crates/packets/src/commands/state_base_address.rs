//! STATE_BASE_ADDRESS: heap base pointers for the compute pipeline

use super::Opcode;
use crate::field::{AddressField, Field, Packet};

/// One modifiable heap base (enable bit plus 4K-aligned address)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseField {
    pub modify: Field,
    pub address: AddressField,
}

impl BaseField {
    pub const fn at(dword: usize) -> Self {
        Self {
            modify: Field::bit(dword, 0),
            address: AddressField::new(Field::new(dword, 12, 52), 12),
        }
    }
}

/// Heap upper bound in 4K pages, with its own enable bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeField {
    pub modify: Field,
    pub pages: Field,
}

impl SizeField {
    pub const fn at(dword: usize) -> Self {
        Self {
            modify: Field::bit(dword, 0),
            pages: Field::new(dword, 12, 20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateBaseAddressLayout {
    pub opcode: Opcode,
    pub mocs: Field,
    pub stateless_mocs: Field,
    pub general_state: BaseField,
    pub surface_state: BaseField,
    pub dynamic_state: BaseField,
    pub indirect_object: BaseField,
    pub instruction: BaseField,
    pub general_state_size: SizeField,
    pub dynamic_state_size: SizeField,
    pub indirect_object_size: SizeField,
    pub instruction_size: SizeField,
    pub bindless_surface_state: BaseField,
    pub bindless_surface_state_size: Field,
    pub bindless_sampler_state: Option<(BaseField, Field)>,
}

/// Logical STATE_BASE_ADDRESS contents
///
/// A base of `None` leaves the corresponding modify-enable bit clear, so the
/// hardware keeps whatever base was programmed before.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateBaseAddressFields {
    pub mocs: u32,
    pub stateless_mocs: u32,
    pub general_state_base: Option<u64>,
    pub surface_state_base: Option<u64>,
    pub dynamic_state_base: Option<u64>,
    pub indirect_object_base: Option<u64>,
    pub instruction_base: Option<u64>,
    pub general_state_size_pages: Option<u32>,
    pub dynamic_state_size_pages: Option<u32>,
    pub indirect_object_size_pages: Option<u32>,
    pub instruction_size_pages: Option<u32>,
    pub bindless_surface_state_base: Option<u64>,
    pub bindless_surface_state_size: u32,
    pub bindless_sampler_state_base: Option<u64>,
    pub bindless_sampler_state_size: u32,
}

fn put_base<const N: usize>(packet: &mut Packet<N>, field: BaseField, base: Option<u64>) {
    if let Some(address) = base {
        packet.set_flag(field.modify, true);
        packet.set_address(field.address, address);
    }
}

fn take_base<const N: usize>(packet: &Packet<N>, field: BaseField) -> Option<u64> {
    packet.flag(field.modify).then(|| packet.address(field.address))
}

fn put_size<const N: usize>(packet: &mut Packet<N>, field: SizeField, pages: Option<u32>) {
    if let Some(pages) = pages {
        packet.set_flag(field.modify, true);
        packet.set(field.pages, pages as u64);
    }
}

fn take_size<const N: usize>(packet: &Packet<N>, field: SizeField) -> Option<u32> {
    packet.flag(field.modify).then(|| packet.get(field.pages) as u32)
}

pub fn encode<const N: usize>(
    layout: &StateBaseAddressLayout,
    fields: &StateBaseAddressFields,
) -> Packet<N> {
    let mut packet = Packet::with_header(layout.opcode.header(N));
    packet.set(layout.mocs, fields.mocs as u64);
    packet.set(layout.stateless_mocs, fields.stateless_mocs as u64);
    put_base(&mut packet, layout.general_state, fields.general_state_base);
    put_base(&mut packet, layout.surface_state, fields.surface_state_base);
    put_base(&mut packet, layout.dynamic_state, fields.dynamic_state_base);
    put_base(&mut packet, layout.indirect_object, fields.indirect_object_base);
    put_base(&mut packet, layout.instruction, fields.instruction_base);
    put_size(&mut packet, layout.general_state_size, fields.general_state_size_pages);
    put_size(&mut packet, layout.dynamic_state_size, fields.dynamic_state_size_pages);
    put_size(&mut packet, layout.indirect_object_size, fields.indirect_object_size_pages);
    put_size(&mut packet, layout.instruction_size, fields.instruction_size_pages);
    put_base(
        &mut packet,
        layout.bindless_surface_state,
        fields.bindless_surface_state_base,
    );
    packet.set(
        layout.bindless_surface_state_size,
        fields.bindless_surface_state_size as u64,
    );
    if let Some((base, size)) = layout.bindless_sampler_state {
        put_base(&mut packet, base, fields.bindless_sampler_state_base);
        packet.set(size, fields.bindless_sampler_state_size as u64);
    }
    packet
}

pub fn decode<const N: usize>(
    layout: &StateBaseAddressLayout,
    packet: &Packet<N>,
) -> StateBaseAddressFields {
    let (bindless_sampler_state_base, bindless_sampler_state_size) = match layout.bindless_sampler_state {
        Some((base, size)) => (take_base(packet, base), packet.get(size) as u32),
        None => (None, 0),
    };
    StateBaseAddressFields {
        mocs: packet.get(layout.mocs) as u32,
        stateless_mocs: packet.get(layout.stateless_mocs) as u32,
        general_state_base: take_base(packet, layout.general_state),
        surface_state_base: take_base(packet, layout.surface_state),
        dynamic_state_base: take_base(packet, layout.dynamic_state),
        indirect_object_base: take_base(packet, layout.indirect_object),
        instruction_base: take_base(packet, layout.instruction),
        general_state_size_pages: take_size(packet, layout.general_state_size),
        dynamic_state_size_pages: take_size(packet, layout.dynamic_state_size),
        indirect_object_size_pages: take_size(packet, layout.indirect_object_size),
        instruction_size_pages: take_size(packet, layout.instruction_size),
        bindless_surface_state_base: take_base(packet, layout.bindless_surface_state),
        bindless_surface_state_size: packet.get(layout.bindless_surface_state_size) as u32,
        bindless_sampler_state_base,
        bindless_sampler_state_size,
    }
}
