//! Front-end (thread dispatcher) state: MEDIA_VFE_STATE / CFE_STATE

use super::Opcode;
use crate::field::{AddressField, Field, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontEndLayout {
    pub opcode: Opcode,
    pub scratch_base: AddressField,
    pub per_thread_scratch: Field,
    /// Bytes represented by the smallest non-zero scratch encoding
    pub scratch_granule: u32,
    pub max_threads: Field,
    pub urb_entries: Option<Field>,
    pub curbe_allocation_size: Option<Field>,
    pub overdispatch_disable: Option<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontEndStateFields {
    pub scratch_base: u64,
    /// Per-thread scratch in bytes; zero disables scratch
    pub per_thread_scratch_size: u32,
    pub max_threads: u32,
    pub urb_entries: u32,
    pub curbe_allocation_size: u32,
    pub overdispatch_disable: bool,
}

impl Default for FrontEndStateFields {
    fn default() -> Self {
        Self {
            scratch_base: 0,
            per_thread_scratch_size: 0,
            max_threads: 1,
            urb_entries: 0,
            curbe_allocation_size: 0,
            overdispatch_disable: false,
        }
    }
}

/// Encode a power-of-two size as `log2(size / granule) + 1` (zero stays zero)
///
/// Sizes that are not a power-of-two multiple of `granule` round up to the
/// next representable size.
pub fn encode_pow2_size(size: u32, granule: u32) -> u64 {
    if size == 0 {
        return 0;
    }
    let rounded = (size.max(granule) as u64).next_power_of_two();
    (rounded / granule as u64).trailing_zeros() as u64 + 1
}

pub fn decode_pow2_size(encoded: u64, granule: u32) -> u32 {
    if encoded == 0 {
        0
    } else {
        granule << (encoded - 1)
    }
}

impl FrontEndLayout {
    /// Per-thread scratch the hardware is told about for a request of `size`
    ///
    /// Returns `None` when the rounded size does not fit the scratch field.
    pub fn programmed_scratch_size(&self, size: u32) -> Option<u32> {
        let encoded = encode_pow2_size(size, self.scratch_granule);
        if encoded > self.per_thread_scratch.max_value() {
            return None;
        }
        Some(decode_pow2_size(encoded, self.scratch_granule))
    }

    /// Largest per-thread scratch the field can describe
    pub fn max_scratch_size(&self) -> u32 {
        decode_pow2_size(self.per_thread_scratch.max_value(), self.scratch_granule)
    }

    /// Largest thread count the count-minus-one field can describe
    pub fn max_thread_count(&self) -> u32 {
        (self.max_threads.max_value() + 1).min(u32::MAX as u64) as u32
    }
}

pub fn encode<const N: usize>(layout: &FrontEndLayout, fields: &FrontEndStateFields) -> Packet<N> {
    let mut packet = Packet::with_header(layout.opcode.header(N));
    packet.set_address(layout.scratch_base, fields.scratch_base);
    packet.set(
        layout.per_thread_scratch,
        encode_pow2_size(fields.per_thread_scratch_size, layout.scratch_granule),
    );
    packet.set_count(layout.max_threads, fields.max_threads as u64);
    if let Some(field) = layout.urb_entries {
        packet.set(field, fields.urb_entries as u64);
    }
    if let Some(field) = layout.curbe_allocation_size {
        packet.set(field, fields.curbe_allocation_size as u64);
    }
    if let Some(field) = layout.overdispatch_disable {
        packet.set_flag(field, fields.overdispatch_disable);
    }
    packet
}

pub fn decode<const N: usize>(layout: &FrontEndLayout, packet: &Packet<N>) -> FrontEndStateFields {
    let defaults = FrontEndStateFields::default();
    FrontEndStateFields {
        scratch_base: packet.address(layout.scratch_base),
        per_thread_scratch_size: decode_pow2_size(
            packet.get(layout.per_thread_scratch),
            layout.scratch_granule,
        ),
        max_threads: packet.count(layout.max_threads) as u32,
        urb_entries: layout
            .urb_entries
            .map_or(defaults.urb_entries, |f| packet.get(f) as u32),
        curbe_allocation_size: layout
            .curbe_allocation_size
            .map_or(defaults.curbe_allocation_size, |f| packet.get(f) as u32),
        overdispatch_disable: layout
            .overdispatch_disable
            .is_some_and(|f| packet.flag(f)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1024, 0)]
    #[case(1024, 1024, 1)]
    #[case(2048, 1024, 2)]
    #[case(1500, 1024, 2)]
    #[case(64, 1024, 1)]
    #[case(65536, 4096, 5)]
    #[case(64, 64, 1)]
    fn test_pow2_size_encoding(#[case] size: u32, #[case] granule: u32, #[case] expected: u64) {
        assert_eq!(encode_pow2_size(size, granule), expected);
    }

    #[test]
    fn test_pow2_size_encoding_large_sizes() {
        assert_eq!(encode_pow2_size(u32::MAX, 1024), 23);
        assert_eq!(encode_pow2_size(1 << 31, 1024), 22);
    }

    const LAYOUT: FrontEndLayout = FrontEndLayout {
        opcode: Opcode::Gfx {
            pipeline: 2,
            opcode: 0,
            sub_opcode: 0,
        },
        scratch_base: AddressField::new(Field::new(1, 10, 22), 10),
        per_thread_scratch: Field::new(1, 0, 4),
        scratch_granule: 1024,
        max_threads: Field::new(3, 16, 16),
        urb_entries: None,
        curbe_allocation_size: None,
        overdispatch_disable: None,
    };

    #[rstest]
    #[case(0, Some(0))]
    #[case(1, Some(1024))]
    #[case(1500, Some(2048))]
    #[case(16 << 20, Some(16 << 20))]
    #[case((16 << 20) + 1, None)]
    #[case(u32::MAX, None)]
    fn test_programmed_scratch_size(#[case] size: u32, #[case] expected: Option<u32>) {
        assert_eq!(LAYOUT.programmed_scratch_size(size), expected);
    }

    #[test]
    fn test_layout_limits() {
        assert_eq!(LAYOUT.max_scratch_size(), 16 << 20);
        assert_eq!(LAYOUT.max_thread_count(), 65536);
    }

    #[test]
    fn test_pow2_size_decoding() {
        assert_eq!(decode_pow2_size(0, 1024), 0);
        assert_eq!(decode_pow2_size(1, 1024), 1024);
        assert_eq!(decode_pow2_size(7, 1024), 65536);
        assert_eq!(decode_pow2_size(5, 4096), 65536);
    }
}
