//! PIPE_CONTROL: cache flushes, stalls and post-sync writes

use super::Opcode;
use crate::field::{AddressField, Field, Packet};

/// Write performed by the hardware once the preceding work has drained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PostSyncOperation {
    #[default]
    NoWrite,
    WriteImmediate,
    WriteDepthCount,
    WriteTimestamp,
}

impl PostSyncOperation {
    pub const fn bits(self) -> u64 {
        match self {
            PostSyncOperation::NoWrite => 0,
            PostSyncOperation::WriteImmediate => 1,
            PostSyncOperation::WriteDepthCount => 2,
            PostSyncOperation::WriteTimestamp => 3,
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            1 => PostSyncOperation::WriteImmediate,
            2 => PostSyncOperation::WriteDepthCount,
            3 => PostSyncOperation::WriteTimestamp,
            _ => PostSyncOperation::NoWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeControlLayout {
    pub opcode: Opcode,
    pub hdc_pipeline_flush: Option<Field>,
    pub untyped_dataport_cache_flush: Option<Field>,
    pub state_cache_invalidate: Field,
    pub constant_cache_invalidate: Field,
    pub dc_flush: Field,
    pub notify_enable: Field,
    pub texture_cache_invalidate: Field,
    pub instruction_cache_invalidate: Field,
    pub render_target_cache_flush: Field,
    pub post_sync_operation: Field,
    pub command_streamer_stall: Field,
    pub address: AddressField,
    pub immediate: Field,
}

impl PipeControlLayout {
    /// Bits shared by every generation; extras are filled in per generation
    pub const fn base(opcode: Opcode, address: AddressField) -> Self {
        Self {
            opcode,
            hdc_pipeline_flush: None,
            untyped_dataport_cache_flush: None,
            state_cache_invalidate: Field::bit(1, 2),
            constant_cache_invalidate: Field::bit(1, 3),
            dc_flush: Field::bit(1, 5),
            notify_enable: Field::bit(1, 8),
            texture_cache_invalidate: Field::bit(1, 10),
            instruction_cache_invalidate: Field::bit(1, 11),
            render_target_cache_flush: Field::bit(1, 12),
            post_sync_operation: Field::new(1, 14, 2),
            command_streamer_stall: Field::bit(1, 20),
            address,
            immediate: Field::new(4, 0, 64),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipeControlFields {
    pub command_streamer_stall: bool,
    pub dc_flush: bool,
    pub hdc_pipeline_flush: bool,
    pub untyped_dataport_cache_flush: bool,
    pub state_cache_invalidate: bool,
    pub constant_cache_invalidate: bool,
    pub texture_cache_invalidate: bool,
    pub instruction_cache_invalidate: bool,
    pub render_target_cache_flush: bool,
    pub notify_enable: bool,
    pub post_sync: PostSyncOperation,
    /// Post-sync destination (8-byte aligned)
    pub address: u64,
    pub immediate: u64,
}

impl PipeControlFields {
    /// Stall-and-flush barrier between dispatches
    pub fn barrier() -> Self {
        Self {
            command_streamer_stall: true,
            dc_flush: true,
            hdc_pipeline_flush: true,
            untyped_dataport_cache_flush: true,
            ..Self::default()
        }
    }

    /// Barrier followed by a 64-bit immediate write of `value` to `address`
    pub fn write_immediate(address: u64, value: u64) -> Self {
        Self {
            post_sync: PostSyncOperation::WriteImmediate,
            address,
            immediate: value,
            ..Self::barrier()
        }
    }

    /// Invalidate read-only caches before new state is consumed
    pub fn state_invalidate() -> Self {
        Self {
            command_streamer_stall: true,
            state_cache_invalidate: true,
            constant_cache_invalidate: true,
            texture_cache_invalidate: true,
            instruction_cache_invalidate: true,
            ..Self::default()
        }
    }
}

pub fn encode<const N: usize>(layout: &PipeControlLayout, fields: &PipeControlFields) -> Packet<N> {
    let mut packet = Packet::with_header(layout.opcode.header(N));
    if let Some(field) = layout.hdc_pipeline_flush {
        packet.set_flag(field, fields.hdc_pipeline_flush);
    }
    if let Some(field) = layout.untyped_dataport_cache_flush {
        packet.set_flag(field, fields.untyped_dataport_cache_flush);
    }
    packet.set_flag(layout.state_cache_invalidate, fields.state_cache_invalidate);
    packet.set_flag(layout.constant_cache_invalidate, fields.constant_cache_invalidate);
    packet.set_flag(layout.dc_flush, fields.dc_flush);
    packet.set_flag(layout.notify_enable, fields.notify_enable);
    packet.set_flag(layout.texture_cache_invalidate, fields.texture_cache_invalidate);
    packet.set_flag(
        layout.instruction_cache_invalidate,
        fields.instruction_cache_invalidate,
    );
    packet.set_flag(layout.render_target_cache_flush, fields.render_target_cache_flush);
    packet.set(layout.post_sync_operation, fields.post_sync.bits());
    packet.set_flag(layout.command_streamer_stall, fields.command_streamer_stall);
    packet.set_address(layout.address, fields.address);
    packet.set(layout.immediate, fields.immediate);
    packet
}

pub fn decode<const N: usize>(layout: &PipeControlLayout, packet: &Packet<N>) -> PipeControlFields {
    PipeControlFields {
        command_streamer_stall: packet.flag(layout.command_streamer_stall),
        dc_flush: packet.flag(layout.dc_flush),
        hdc_pipeline_flush: layout.hdc_pipeline_flush.is_some_and(|f| packet.flag(f)),
        untyped_dataport_cache_flush: layout
            .untyped_dataport_cache_flush
            .is_some_and(|f| packet.flag(f)),
        state_cache_invalidate: packet.flag(layout.state_cache_invalidate),
        constant_cache_invalidate: packet.flag(layout.constant_cache_invalidate),
        texture_cache_invalidate: packet.flag(layout.texture_cache_invalidate),
        instruction_cache_invalidate: packet.flag(layout.instruction_cache_invalidate),
        render_target_cache_flush: packet.flag(layout.render_target_cache_flush),
        notify_enable: packet.flag(layout.notify_enable),
        post_sync: PostSyncOperation::from_bits(packet.get(layout.post_sync_operation)),
        address: packet.address(layout.address),
        immediate: packet.get(layout.immediate),
    }
}
