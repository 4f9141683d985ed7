//! GPGPU_WALKER / COMPUTE_WALKER: the dispatch command itself

use super::Opcode;
use super::interface_descriptor::{self, InterfaceDescriptorFields, InterfaceDescriptorLayout};
use super::pipe_control::PostSyncOperation;
use crate::field::{AddressField, Field, Packet};

/// SIMD width a kernel was compiled for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SimdSize {
    #[default]
    Simd8,
    Simd16,
    Simd32,
}

impl SimdSize {
    pub const fn width(self) -> u32 {
        match self {
            SimdSize::Simd8 => 8,
            SimdSize::Simd16 => 16,
            SimdSize::Simd32 => 32,
        }
    }

    pub const fn from_width(width: u32) -> Option<Self> {
        match width {
            8 => Some(SimdSize::Simd8),
            16 => Some(SimdSize::Simd16),
            32 => Some(SimdSize::Simd32),
            _ => None,
        }
    }

    pub const fn bits(self) -> u64 {
        match self {
            SimdSize::Simd8 => 0,
            SimdSize::Simd16 => 1,
            SimdSize::Simd32 => 2,
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        match bits {
            1 => SimdSize::Simd16,
            2 => SimdSize::Simd32,
            _ => SimdSize::Simd8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostSyncLayout {
    pub operation: Field,
    pub address: AddressField,
    pub immediate: Field,
}

/// Post-sync write carried by COMPUTE_WALKER
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostSyncFields {
    pub operation: PostSyncOperation,
    pub address: u64,
    pub immediate: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerLayout {
    pub opcode: Opcode,
    pub predicate_enable: Field,
    pub interface_descriptor_offset: Option<Field>,
    pub indirect_data_length: Field,
    pub indirect_data_start: AddressField,
    pub threads_per_group: Option<Field>,
    pub simd_size: Field,
    pub emit_local_id: Option<Field>,
    pub local_size: Option<[Field; 3]>,
    pub thread_group_start: [Field; 3],
    pub thread_group_count: [Field; 3],
    pub right_execution_mask: Field,
    pub bottom_execution_mask: Option<Field>,
    pub interface_descriptor: Option<InterfaceDescriptorLayout>,
    pub post_sync: Option<PostSyncLayout>,
}

/// Logical walker contents
///
/// `threads_per_group` is used by generations that program the thread count
/// directly; `local_size`, `emit_local_id`, `interface_descriptor` and
/// `post_sync` only exist on generations with an inline descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkerFields {
    pub simd_size: SimdSize,
    pub threads_per_group: u32,
    pub local_size: [u32; 3],
    pub thread_group_start: [u32; 3],
    pub thread_group_count: [u32; 3],
    /// Parameter block offset from the indirect object base (64-byte aligned)
    pub indirect_data_start: u64,
    pub indirect_data_length: u32,
    pub right_execution_mask: u32,
    pub bottom_execution_mask: u32,
    pub interface_descriptor_offset: u32,
    /// Bit mask of dimensions (x = 1, y = 2, z = 4) for hardware-generated local IDs
    pub emit_local_id: u32,
    pub interface_descriptor: InterfaceDescriptorFields,
    pub post_sync: PostSyncFields,
    pub predicate_enable: bool,
}

impl Default for WalkerFields {
    fn default() -> Self {
        Self {
            simd_size: SimdSize::default(),
            threads_per_group: 1,
            local_size: [1, 1, 1],
            thread_group_start: [0; 3],
            thread_group_count: [1, 1, 1],
            indirect_data_start: 0,
            indirect_data_length: 0,
            right_execution_mask: 0,
            bottom_execution_mask: 0,
            interface_descriptor_offset: 0,
            emit_local_id: 0,
            interface_descriptor: InterfaceDescriptorFields::default(),
            post_sync: PostSyncFields::default(),
            predicate_enable: false,
        }
    }
}

pub fn encode<const N: usize>(layout: &WalkerLayout, fields: &WalkerFields) -> Packet<N> {
    let mut packet = Packet::with_header(layout.opcode.header(N));
    packet.set_flag(layout.predicate_enable, fields.predicate_enable);
    if let Some(field) = layout.interface_descriptor_offset {
        packet.set(field, fields.interface_descriptor_offset as u64);
    }
    packet.set(layout.indirect_data_length, fields.indirect_data_length as u64);
    packet.set_address(layout.indirect_data_start, fields.indirect_data_start);
    if let Some(field) = layout.threads_per_group {
        packet.set_count(field, fields.threads_per_group as u64);
    }
    packet.set(layout.simd_size, fields.simd_size.bits());
    if let Some(field) = layout.emit_local_id {
        packet.set(field, fields.emit_local_id as u64);
    }
    if let Some(fields_xyz) = layout.local_size {
        for (field, size) in fields_xyz.iter().zip(fields.local_size) {
            packet.set_count(*field, size as u64);
        }
    }
    for dim in 0..3 {
        packet.set(layout.thread_group_start[dim], fields.thread_group_start[dim] as u64);
        packet.set(layout.thread_group_count[dim], fields.thread_group_count[dim] as u64);
    }
    packet.set(layout.right_execution_mask, fields.right_execution_mask as u64);
    if let Some(field) = layout.bottom_execution_mask {
        packet.set(field, fields.bottom_execution_mask as u64);
    }
    if let Some(idd) = &layout.interface_descriptor {
        interface_descriptor::write(idd, &mut packet, &fields.interface_descriptor);
    }
    if let Some(post_sync) = &layout.post_sync {
        packet.set(post_sync.operation, fields.post_sync.operation.bits());
        packet.set_address(post_sync.address, fields.post_sync.address);
        packet.set(post_sync.immediate, fields.post_sync.immediate);
    }
    packet
}

pub fn decode<const N: usize>(layout: &WalkerLayout, packet: &Packet<N>) -> WalkerFields {
    let mut fields = WalkerFields {
        simd_size: SimdSize::from_bits(packet.get(layout.simd_size)),
        indirect_data_start: packet.address(layout.indirect_data_start),
        indirect_data_length: packet.get(layout.indirect_data_length) as u32,
        right_execution_mask: packet.get(layout.right_execution_mask) as u32,
        predicate_enable: packet.flag(layout.predicate_enable),
        ..WalkerFields::default()
    };
    for dim in 0..3 {
        fields.thread_group_start[dim] = packet.get(layout.thread_group_start[dim]) as u32;
        fields.thread_group_count[dim] = packet.get(layout.thread_group_count[dim]) as u32;
    }
    if let Some(field) = layout.interface_descriptor_offset {
        fields.interface_descriptor_offset = packet.get(field) as u32;
    }
    if let Some(field) = layout.threads_per_group {
        fields.threads_per_group = packet.count(field) as u32;
    }
    if let Some(field) = layout.emit_local_id {
        fields.emit_local_id = packet.get(field) as u32;
    }
    if let Some(fields_xyz) = layout.local_size {
        for (dim, field) in fields_xyz.iter().enumerate() {
            fields.local_size[dim] = packet.count(*field) as u32;
        }
    }
    if let Some(field) = layout.bottom_execution_mask {
        fields.bottom_execution_mask = packet.get(field) as u32;
    }
    if let Some(idd) = &layout.interface_descriptor {
        fields.interface_descriptor = interface_descriptor::read(idd, packet);
    }
    if let Some(post_sync) = &layout.post_sync {
        fields.post_sync = PostSyncFields {
            operation: PostSyncOperation::from_bits(packet.get(post_sync.operation)),
            address: packet.address(post_sync.address),
            immediate: packet.get(post_sync.immediate),
        };
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simd_size_encoding() {
        for simd in [SimdSize::Simd8, SimdSize::Simd16, SimdSize::Simd32] {
            assert_eq!(SimdSize::from_bits(simd.bits()), simd);
            assert_eq!(SimdSize::from_width(simd.width()), Some(simd));
        }
        assert_eq!(SimdSize::from_width(4), None);
    }
}
