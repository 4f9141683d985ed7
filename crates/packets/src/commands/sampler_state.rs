//! SAMPLER_STATE records

use crate::field::{Field, Packet};

pub const SAMPLER_STATE_DWORDS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

impl FilterMode {
    pub const fn bits(self) -> u64 {
        match self {
            FilterMode::Nearest => 0,
            FilterMode::Linear => 1,
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        if bits == 1 { FilterMode::Linear } else { FilterMode::Nearest }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TextureAddressMode {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    ClampBorder,
    MirrorOnce,
}

impl TextureAddressMode {
    pub const fn bits(self) -> u64 {
        match self {
            TextureAddressMode::Wrap => 0,
            TextureAddressMode::Mirror => 1,
            TextureAddressMode::Clamp => 2,
            TextureAddressMode::ClampBorder => 4,
            TextureAddressMode::MirrorOnce => 5,
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        match bits {
            1 => TextureAddressMode::Mirror,
            2 => TextureAddressMode::Clamp,
            4 => TextureAddressMode::ClampBorder,
            5 => TextureAddressMode::MirrorOnce,
            _ => TextureAddressMode::Wrap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerStateLayout {
    pub min_filter: Field,
    pub mag_filter: Field,
    pub address_r: Field,
    pub address_v: Field,
    pub address_u: Field,
    pub non_normalized: Field,
}

pub const SAMPLER_STATE: SamplerStateLayout = SamplerStateLayout {
    min_filter: Field::new(0, 14, 3),
    mag_filter: Field::new(0, 17, 3),
    address_r: Field::new(3, 0, 3),
    address_v: Field::new(3, 3, 3),
    address_u: Field::new(3, 6, 3),
    non_normalized: Field::bit(3, 10),
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerStateFields {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub address_u: TextureAddressMode,
    pub address_v: TextureAddressMode,
    pub address_r: TextureAddressMode,
    pub normalized_coordinates: bool,
}

impl Default for SamplerStateFields {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Nearest,
            mag_filter: FilterMode::Nearest,
            address_u: TextureAddressMode::Wrap,
            address_v: TextureAddressMode::Wrap,
            address_r: TextureAddressMode::Wrap,
            normalized_coordinates: true,
        }
    }
}

pub fn encode(layout: &SamplerStateLayout, fields: &SamplerStateFields) -> Packet<SAMPLER_STATE_DWORDS> {
    let mut packet = Packet::zeroed();
    packet.set(layout.min_filter, fields.min_filter.bits());
    packet.set(layout.mag_filter, fields.mag_filter.bits());
    packet.set(layout.address_u, fields.address_u.bits());
    packet.set(layout.address_v, fields.address_v.bits());
    packet.set(layout.address_r, fields.address_r.bits());
    // hardware bit means "non-normalized"
    packet.set_flag(layout.non_normalized, !fields.normalized_coordinates);
    packet
}

pub fn decode(layout: &SamplerStateLayout, packet: &Packet<SAMPLER_STATE_DWORDS>) -> SamplerStateFields {
    SamplerStateFields {
        min_filter: FilterMode::from_bits(packet.get(layout.min_filter)),
        mag_filter: FilterMode::from_bits(packet.get(layout.mag_filter)),
        address_u: TextureAddressMode::from_bits(packet.get(layout.address_u)),
        address_v: TextureAddressMode::from_bits(packet.get(layout.address_v)),
        address_r: TextureAddressMode::from_bits(packet.get(layout.address_r)),
        normalized_coordinates: !packet.flag(layout.non_normalized),
    }
}
