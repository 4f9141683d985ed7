//! Interface descriptor data and MEDIA_INTERFACE_DESCRIPTOR_LOAD
//!
//! The interface descriptor tells the thread dispatcher where the kernel's
//! instructions, binding table and samplers live. Gen9 and Gen12LP keep it in
//! dynamic state and load it with a separate command; XeHPC embeds it in the
//! walker, so the same layout type is relocated with [`InterfaceDescriptorLayout::at`].

use super::Opcode;
use super::front_end::{decode_pow2_size, encode_pow2_size};
use crate::field::{AddressField, Field, Packet};

/// Size of one interface descriptor record
pub const INTERFACE_DESCRIPTOR_DWORDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptorLayout {
    pub kernel_start_pointer: AddressField,
    pub denorm_retain: Field,
    pub single_program_flow: Field,
    pub sampler_count: Field,
    pub sampler_state_pointer: AddressField,
    pub binding_table_entry_count: Field,
    pub binding_table_pointer: AddressField,
    pub constant_read_length: Option<Field>,
    pub threads_in_group: Field,
    pub shared_local_memory: Field,
    /// Bytes represented by shared-memory encoding 1
    pub slm_granule: u32,
    pub barrier_enable: Field,
    pub cross_thread_read_length: Field,
}

impl InterfaceDescriptorLayout {
    /// The same layout embedded `base` dwords into an enclosing packet
    pub const fn at(self, base: usize) -> Self {
        Self {
            kernel_start_pointer: self.kernel_start_pointer.at(base),
            denorm_retain: self.denorm_retain.at(base),
            single_program_flow: self.single_program_flow.at(base),
            sampler_count: self.sampler_count.at(base),
            sampler_state_pointer: self.sampler_state_pointer.at(base),
            binding_table_entry_count: self.binding_table_entry_count.at(base),
            binding_table_pointer: self.binding_table_pointer.at(base),
            constant_read_length: match self.constant_read_length {
                Some(field) => Some(field.at(base)),
                None => None,
            },
            threads_in_group: self.threads_in_group.at(base),
            shared_local_memory: self.shared_local_memory.at(base),
            slm_granule: self.slm_granule,
            barrier_enable: self.barrier_enable.at(base),
            cross_thread_read_length: self.cross_thread_read_length.at(base),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDescriptorFields {
    /// Offset of the kernel ISA from the instruction base (64-byte aligned)
    pub kernel_start_pointer: u64,
    pub denorm_retain: bool,
    pub single_program_flow: bool,
    pub sampler_count: u32,
    pub sampler_state_pointer: u64,
    pub binding_table_entry_count: u32,
    /// Offset of the binding table from the surface state base (32-byte aligned)
    pub binding_table_pointer: u64,
    pub constant_read_length: u32,
    pub threads_in_group: u32,
    /// Shared local memory in bytes, as allocated by the hardware
    pub shared_local_memory_size: u32,
    pub barrier_enable: bool,
    /// Per-thread cross-thread data length in 32-byte registers
    pub cross_thread_read_length: u32,
}

pub fn write<const N: usize>(
    layout: &InterfaceDescriptorLayout,
    packet: &mut Packet<N>,
    fields: &InterfaceDescriptorFields,
) {
    packet.set_address(layout.kernel_start_pointer, fields.kernel_start_pointer);
    packet.set_flag(layout.denorm_retain, fields.denorm_retain);
    packet.set_flag(layout.single_program_flow, fields.single_program_flow);
    packet.set(layout.sampler_count, fields.sampler_count as u64);
    packet.set_address(layout.sampler_state_pointer, fields.sampler_state_pointer);
    packet.set(
        layout.binding_table_entry_count,
        fields.binding_table_entry_count as u64,
    );
    packet.set_address(layout.binding_table_pointer, fields.binding_table_pointer);
    if let Some(field) = layout.constant_read_length {
        packet.set(field, fields.constant_read_length as u64);
    }
    packet.set(layout.threads_in_group, fields.threads_in_group as u64);
    packet.set(
        layout.shared_local_memory,
        encode_pow2_size(fields.shared_local_memory_size, layout.slm_granule),
    );
    packet.set_flag(layout.barrier_enable, fields.barrier_enable);
    packet.set(
        layout.cross_thread_read_length,
        fields.cross_thread_read_length as u64,
    );
}

pub fn read<const N: usize>(
    layout: &InterfaceDescriptorLayout,
    packet: &Packet<N>,
) -> InterfaceDescriptorFields {
    InterfaceDescriptorFields {
        kernel_start_pointer: packet.address(layout.kernel_start_pointer),
        denorm_retain: packet.flag(layout.denorm_retain),
        single_program_flow: packet.flag(layout.single_program_flow),
        sampler_count: packet.get(layout.sampler_count) as u32,
        sampler_state_pointer: packet.address(layout.sampler_state_pointer),
        binding_table_entry_count: packet.get(layout.binding_table_entry_count) as u32,
        binding_table_pointer: packet.address(layout.binding_table_pointer),
        constant_read_length: layout
            .constant_read_length
            .map_or(0, |f| packet.get(f) as u32),
        threads_in_group: packet.get(layout.threads_in_group) as u32,
        shared_local_memory_size: decode_pow2_size(
            packet.get(layout.shared_local_memory),
            layout.slm_granule,
        ),
        barrier_enable: packet.flag(layout.barrier_enable),
        cross_thread_read_length: packet.get(layout.cross_thread_read_length) as u32,
    }
}

/// Standalone interface descriptor record for the dynamic-state heap
pub fn encode(layout: &InterfaceDescriptorLayout, fields: &InterfaceDescriptorFields) -> Packet<INTERFACE_DESCRIPTOR_DWORDS> {
    let mut packet = Packet::zeroed();
    write(layout, &mut packet, fields);
    packet
}

pub fn decode(
    layout: &InterfaceDescriptorLayout,
    packet: &Packet<INTERFACE_DESCRIPTOR_DWORDS>,
) -> InterfaceDescriptorFields {
    read(layout, packet)
}

// ============================================================================
// MEDIA_INTERFACE_DESCRIPTOR_LOAD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptorLoadLayout {
    pub opcode: Opcode,
    pub total_length: Field,
    pub data_start: AddressField,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDescriptorLoadFields {
    /// Bytes of descriptor data to load
    pub total_length: u32,
    /// Offset from the dynamic state base (64-byte aligned)
    pub data_start: u64,
}

pub fn encode_load<const N: usize>(
    layout: &InterfaceDescriptorLoadLayout,
    fields: &InterfaceDescriptorLoadFields,
) -> Packet<N> {
    let mut packet = Packet::with_header(layout.opcode.header(N));
    packet.set(layout.total_length, fields.total_length as u64);
    packet.set_address(layout.data_start, fields.data_start);
    packet
}

pub fn decode_load<const N: usize>(
    layout: &InterfaceDescriptorLoadLayout,
    packet: &Packet<N>,
) -> InterfaceDescriptorLoadFields {
    InterfaceDescriptorLoadFields {
        total_length: packet.get(layout.total_length) as u32,
        data_start: packet.address(layout.data_start),
    }
}
