//! RENDER_SURFACE_STATE: descriptor-table record for buffers and images

use crate::field::{Field, Packet};

pub const SURFACE_STATE_DWORDS: usize = 16;

/// Surface format used for untyped (raw) buffer access
pub const SURFACE_FORMAT_RAW: u32 = 0x1FF;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SurfaceType {
    Surface1D,
    Surface2D,
    Surface3D,
    Cube,
    Buffer,
    #[default]
    Null,
}

impl SurfaceType {
    pub const fn bits(self) -> u64 {
        match self {
            SurfaceType::Surface1D => 0,
            SurfaceType::Surface2D => 1,
            SurfaceType::Surface3D => 2,
            SurfaceType::Cube => 3,
            SurfaceType::Buffer => 4,
            SurfaceType::Null => 7,
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        match bits {
            0 => SurfaceType::Surface1D,
            1 => SurfaceType::Surface2D,
            2 => SurfaceType::Surface3D,
            3 => SurfaceType::Cube,
            4 => SurfaceType::Buffer,
            _ => SurfaceType::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceStateLayout {
    pub surface_type: Field,
    pub is_array: Field,
    pub format: Field,
    pub mocs: Field,
    pub coherent: Field,
    pub width: Field,
    pub height: Field,
    pub depth: Field,
    pub pitch: Field,
    pub mip_count: Field,
    pub base_address: Field,
}

impl SurfaceStateLayout {
    /// Layout shared by every generation apart from the coherency bit
    pub const fn with_coherency_bit(coherent: Field) -> Self {
        Self {
            surface_type: Field::new(0, 29, 3),
            is_array: Field::bit(0, 28),
            format: Field::new(0, 18, 9),
            mocs: Field::new(1, 24, 7),
            coherent,
            width: Field::new(2, 0, 14),
            height: Field::new(2, 16, 14),
            depth: Field::new(3, 21, 11),
            pitch: Field::new(3, 0, 18),
            mip_count: Field::new(5, 0, 4),
            base_address: Field::new(8, 0, 64),
        }
    }
}

/// Logical surface state; `width`, `height`, `depth` and `pitch` are counts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceStateFields {
    pub surface_type: SurfaceType,
    pub is_array: bool,
    pub format: u32,
    pub mocs: u32,
    pub coherent: bool,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub pitch: u32,
    pub mip_count: u32,
    pub base_address: u64,
}

impl Default for SurfaceStateFields {
    fn default() -> Self {
        Self {
            surface_type: SurfaceType::Null,
            is_array: false,
            format: 0,
            mocs: 0,
            coherent: false,
            width: 1,
            height: 1,
            depth: 1,
            pitch: 1,
            mip_count: 0,
            base_address: 0,
        }
    }
}

impl SurfaceStateFields {
    /// Raw buffer surface covering `size` bytes at `address`
    ///
    /// The hardware stores `size - 1` split across width (7 bits), height
    /// (14 bits) and depth (11 bits).
    pub fn buffer(address: u64, size: u64, coherent: bool) -> Self {
        let encoded = size.clamp(1, 1 << 32) - 1;
        Self {
            surface_type: SurfaceType::Buffer,
            format: SURFACE_FORMAT_RAW,
            coherent,
            width: (encoded & 0x7F) as u32 + 1,
            height: ((encoded >> 7) & 0x3FFF) as u32 + 1,
            depth: ((encoded >> 21) & 0x7FF) as u32 + 1,
            base_address: address,
            ..Self::default()
        }
    }

    /// Null surface: accesses are discarded (reads return zero)
    pub fn null() -> Self {
        Self::default()
    }

    /// Byte size of a buffer surface
    pub fn buffer_size(&self) -> u64 {
        let encoded = (self.width as u64 - 1)
            | ((self.height as u64 - 1) << 7)
            | ((self.depth as u64 - 1) << 21);
        encoded + 1
    }
}

pub fn encode(layout: &SurfaceStateLayout, fields: &SurfaceStateFields) -> Packet<SURFACE_STATE_DWORDS> {
    let mut packet = Packet::zeroed();
    packet.set(layout.surface_type, fields.surface_type.bits());
    packet.set_flag(layout.is_array, fields.is_array);
    packet.set(layout.format, fields.format as u64);
    packet.set(layout.mocs, fields.mocs as u64);
    packet.set_flag(layout.coherent, fields.coherent);
    packet.set_count(layout.width, fields.width as u64);
    packet.set_count(layout.height, fields.height as u64);
    packet.set_count(layout.depth, fields.depth as u64);
    packet.set_count(layout.pitch, fields.pitch as u64);
    packet.set(layout.mip_count, fields.mip_count as u64);
    packet.set(layout.base_address, fields.base_address);
    packet
}

pub fn decode(layout: &SurfaceStateLayout, packet: &Packet<SURFACE_STATE_DWORDS>) -> SurfaceStateFields {
    SurfaceStateFields {
        surface_type: SurfaceType::from_bits(packet.get(layout.surface_type)),
        is_array: packet.flag(layout.is_array),
        format: packet.get(layout.format) as u32,
        mocs: packet.get(layout.mocs) as u32,
        coherent: packet.flag(layout.coherent),
        width: packet.count(layout.width) as u32,
        height: packet.count(layout.height) as u32,
        depth: packet.count(layout.depth) as u32,
        pitch: packet.count(layout.pitch) as u32,
        mip_count: packet.get(layout.mip_count) as u32,
        base_address: packet.get(layout.base_address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1)]
    #[case(64)]
    #[case(128)]
    #[case(4096)]
    #[case(3 << 20)]
    #[case(1 << 32)]
    fn test_buffer_size_split(#[case] size: u64) {
        let fields = SurfaceStateFields::buffer(0x1000, size, false);
        assert!(fields.width <= 128);
        assert!(fields.height <= 1 << 14);
        assert!(fields.depth <= 1 << 11);
        assert_eq!(fields.buffer_size(), size);
    }

    #[test]
    fn test_null_surface_encoding() {
        let layout = SurfaceStateLayout::with_coherency_bit(Field::bit(1, 16));
        let packet = encode(&layout, &SurfaceStateFields::null());
        assert_eq!(packet.words()[0] >> 29, 7);
        assert_eq!(decode(&layout, &packet), SurfaceStateFields::null());
    }
}
