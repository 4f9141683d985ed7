//! Bit-field primitives shared by every packet layout
//!
//! Hardware commands are described as bit ranges over a sequence of 32-bit
//! words. Nothing here relies on native bit-field layout: every accessor
//! computes its shift and mask from the declared range.

use crate::error::PacketError;
use std::fmt;

/// A bit range inside a packet
///
/// `lsb` is counted from bit 0 of `dword`. A range may run past bit 31 into
/// the following dword (up to 64 bits in total), which is how the hardware
/// lays out 48- and 64-bit addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field {
    pub dword: usize,
    pub lsb: u32,
    pub width: u32,
}

impl Field {
    /// Declare a bit range; invalid ranges fail const evaluation
    pub const fn new(dword: usize, lsb: u32, width: u32) -> Self {
        assert!(width >= 1 && width <= 64, "field width must be 1..=64");
        assert!(lsb + width <= 64, "field must fit in two dwords");
        Self { dword, lsb, width }
    }

    /// Single-bit flag
    pub const fn bit(dword: usize, bit: u32) -> Self {
        Self::new(dword, bit, 1)
    }

    /// Whole dword
    pub const fn dword(dword: usize) -> Self {
        Self::new(dword, 0, 32)
    }

    /// Same range, relocated by `base` dwords (for structures embedded in a larger packet)
    pub const fn at(self, base: usize) -> Self {
        Self {
            dword: self.dword + base,
            lsb: self.lsb,
            width: self.width,
        }
    }

    /// Largest value the range can hold
    pub const fn max_value(self) -> u64 {
        if self.width == 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    const fn spans_two_dwords(self) -> bool {
        self.lsb + self.width > 32
    }
}

/// A pointer-valued field with an alignment contract
///
/// The stored value is `address >> shift`; decoding re-appends `shift` zero
/// bits. A field aligned to 64 bytes therefore has `shift == 6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressField {
    pub field: Field,
    pub shift: u32,
}

impl AddressField {
    pub const fn new(field: Field, shift: u32) -> Self {
        assert!(shift < 32, "alignment shift out of range");
        Self { field, shift }
    }

    pub const fn at(self, base: usize) -> Self {
        Self {
            field: self.field.at(base),
            shift: self.shift,
        }
    }

    /// Required alignment in bytes
    pub const fn alignment(self) -> u64 {
        1u64 << self.shift
    }
}

/// Fixed-size command packet backed by `N` little-endian dwords
///
/// Setters are only meant to be used while a packet is being built; once a
/// packet is written into a command stream it is copied and never touched
/// again.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Packet<const N: usize> {
    words: [u32; N],
}

impl<const N: usize> Packet<N> {
    /// Number of dwords in this packet type
    pub const DWORDS: usize = N;
    /// Size of this packet type in bytes (part of the hardware ABI)
    pub const SIZE_BYTES: usize = N * 4;

    pub const fn zeroed() -> Self {
        Self { words: [0; N] }
    }

    /// Zeroed packet with dword 0 set to `header`
    pub fn with_header(header: u32) -> Self {
        let mut packet = Self::zeroed();
        if N > 0 {
            packet.words[0] = header;
        }
        packet
    }

    pub const fn from_words(words: [u32; N]) -> Self {
        Self { words }
    }

    /// Copy the first `N` dwords of `words`
    pub fn from_slice(words: &[u32]) -> Result<Self, PacketError> {
        if words.len() < N {
            return Err(PacketError::Truncated {
                expected: N,
                found: words.len(),
            });
        }
        let mut packet = Self::zeroed();
        packet.words.copy_from_slice(&words[..N]);
        Ok(packet)
    }

    pub fn words(&self) -> &[u32; N] {
        &self.words
    }

    pub fn header(&self) -> u32 {
        self.words.first().copied().unwrap_or(0)
    }

    /// Little-endian byte image
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn read_window(&self, field: Field) -> u64 {
        let low = self.words[field.dword] as u64;
        if field.spans_two_dwords() {
            low | ((self.words[field.dword + 1] as u64) << 32)
        } else {
            low
        }
    }

    fn write_window(&mut self, field: Field, window: u64) {
        self.words[field.dword] = window as u32;
        if field.spans_two_dwords() {
            self.words[field.dword + 1] = (window >> 32) as u32;
        }
    }

    /// Place `value` at `field`
    ///
    /// A value wider than the field is a defect in the caller: it panics in
    /// debug builds and is truncated to the field width otherwise.
    pub fn set(&mut self, field: Field, value: u64) {
        debug_assert!(
            value <= field.max_value(),
            "value {value:#x} does not fit in {}-bit field at dword {} bit {}",
            field.width,
            field.dword,
            field.lsb
        );
        let mask = field.max_value() << field.lsb;
        let window = self.read_window(field);
        let window = (window & !mask) | ((value << field.lsb) & mask);
        self.write_window(field, window);
    }

    pub fn get(&self, field: Field) -> u64 {
        (self.read_window(field) >> field.lsb) & field.max_value()
    }

    pub fn set_flag(&mut self, field: Field, value: bool) {
        self.set(field, value as u64);
    }

    pub fn flag(&self, field: Field) -> bool {
        self.get(field) != 0
    }

    /// Store an aligned address; the low `shift` bits are dropped
    pub fn set_address(&mut self, field: AddressField, address: u64) {
        debug_assert!(
            address & (field.alignment() - 1) == 0,
            "address {address:#x} violates {}-byte alignment",
            field.alignment()
        );
        self.set(field.field, address >> field.shift);
    }

    pub fn address(&self, field: AddressField) -> u64 {
        self.get(field.field) << field.shift
    }

    /// Store a "count minus one" value
    ///
    /// A count of zero has no encoding: it panics in debug builds and is
    /// encoded as a count of one otherwise.
    pub fn set_count(&mut self, field: Field, count: u64) {
        debug_assert!(count >= 1, "count field at dword {} cannot encode 0", field.dword);
        self.set(field, count.max(1) - 1);
    }

    pub fn count(&self, field: Field) -> u64 {
        self.get(field) + 1
    }
}

impl<const N: usize> Default for Packet<N> {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl<const N: usize> fmt::Debug for Packet<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.words.iter().map(|w| format!("{w:#010x}")))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Field::new(0, 0, 8), 0xAB)]
    #[case(Field::new(1, 12, 20), 0xF_FFFF)]
    #[case(Field::new(0, 31, 1), 1)]
    #[case(Field::new(2, 2, 46), 0x3FFF_FFFF_FFFF)]
    #[case(Field::new(1, 0, 64), u64::MAX)]
    fn test_set_get(#[case] field: Field, #[case] value: u64) {
        let mut packet = Packet::<4>::zeroed();
        packet.set(field, value);
        assert_eq!(packet.get(field), value);
    }

    #[test]
    fn test_set_preserves_neighbouring_bits() {
        let mut packet = Packet::<2>::from_words([0xFFFF_FFFF, 0xFFFF_FFFF]);
        packet.set(Field::new(0, 8, 8), 0);
        assert_eq!(packet.words()[0], 0xFFFF_00FF);
        assert_eq!(packet.words()[1], 0xFFFF_FFFF);
    }

    #[test]
    fn test_straddling_field_layout() {
        let mut packet = Packet::<3>::zeroed();
        // bits [47:2] starting at dword 1
        packet.set(Field::new(1, 2, 46), 0x1234_5678_9ABC >> 2);
        assert_eq!(packet.words()[1], 0x5678_9ABC);
        assert_eq!(packet.words()[2], 0x1234);
    }

    #[test]
    fn test_address_alignment_shift() {
        let field = AddressField::new(Field::new(0, 6, 26), 6);
        let mut packet = Packet::<1>::zeroed();
        packet.set_address(field, 0x1_0040);
        assert_eq!(packet.get(field.field), 0x1_0040 >> 6);
        assert_eq!(packet.address(field), 0x1_0040);
        assert_eq!(packet.words()[0], 0x1_0040);
    }

    #[rstest]
    #[case(1)]
    #[case(17)]
    #[case(64)]
    fn test_count_minus_one(#[case] count: u64) {
        let field = Field::new(0, 0, 6);
        let mut packet = Packet::<1>::zeroed();
        packet.set_count(field, count);
        assert_eq!(packet.get(field), count - 1);
        assert_eq!(packet.count(field), count);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit")]
    fn test_oversized_value_panics_in_debug() {
        let mut packet = Packet::<1>::zeroed();
        packet.set(Field::new(0, 0, 4), 16);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "cannot encode 0")]
    fn test_zero_count_panics_in_debug() {
        let mut packet = Packet::<1>::zeroed();
        packet.set_count(Field::new(0, 0, 6), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "alignment")]
    fn test_misaligned_address_panics_in_debug() {
        let mut packet = Packet::<1>::zeroed();
        packet.set_address(AddressField::new(Field::new(0, 6, 26), 6), 0x41);
    }

    #[test]
    fn test_from_slice_truncated() {
        let err = Packet::<4>::from_slice(&[0, 1]).unwrap_err();
        assert_eq!(
            err,
            PacketError::Truncated {
                expected: 4,
                found: 2
            }
        );
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Packet::<15>::DWORDS, 15);
        assert_eq!(Packet::<15>::SIZE_BYTES, 60);
    }
}
