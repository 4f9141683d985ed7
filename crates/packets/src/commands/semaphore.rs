//! MI_SEMAPHORE_WAIT: stall the command streamer on a memory comparison

use super::Opcode;
use crate::field::{AddressField, Field, Packet};

/// Comparison applied as `memory <op> data`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SemaphoreCompare {
    GreaterThan,
    #[default]
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl SemaphoreCompare {
    pub const fn bits(self) -> u64 {
        match self {
            SemaphoreCompare::GreaterThan => 0,
            SemaphoreCompare::GreaterOrEqual => 1,
            SemaphoreCompare::LessThan => 2,
            SemaphoreCompare::LessOrEqual => 3,
            SemaphoreCompare::Equal => 4,
            SemaphoreCompare::NotEqual => 5,
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        match bits {
            0 => SemaphoreCompare::GreaterThan,
            2 => SemaphoreCompare::LessThan,
            3 => SemaphoreCompare::LessOrEqual,
            4 => SemaphoreCompare::Equal,
            5 => SemaphoreCompare::NotEqual,
            _ => SemaphoreCompare::GreaterOrEqual,
        }
    }

    /// Whether a wait with this comparison is satisfied
    pub fn satisfied(self, memory: u32, data: u32) -> bool {
        match self {
            SemaphoreCompare::GreaterThan => memory > data,
            SemaphoreCompare::GreaterOrEqual => memory >= data,
            SemaphoreCompare::LessThan => memory < data,
            SemaphoreCompare::LessOrEqual => memory <= data,
            SemaphoreCompare::Equal => memory == data,
            SemaphoreCompare::NotEqual => memory != data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWaitLayout {
    pub opcode: Opcode,
    pub compare: Field,
    pub polling: Field,
    pub data: Field,
    pub address: AddressField,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SemaphoreWaitFields {
    pub compare: SemaphoreCompare,
    /// Poll memory instead of waiting for a signal message
    pub polling: bool,
    pub data: u32,
    /// Semaphore location (4-byte aligned)
    pub address: u64,
}

pub fn encode<const N: usize>(layout: &SemaphoreWaitLayout, fields: &SemaphoreWaitFields) -> Packet<N> {
    let mut packet = Packet::with_header(layout.opcode.header(N));
    packet.set(layout.compare, fields.compare.bits());
    packet.set_flag(layout.polling, fields.polling);
    packet.set(layout.data, fields.data as u64);
    packet.set_address(layout.address, fields.address);
    packet
}

pub fn decode<const N: usize>(layout: &SemaphoreWaitLayout, packet: &Packet<N>) -> SemaphoreWaitFields {
    SemaphoreWaitFields {
        compare: SemaphoreCompare::from_bits(packet.get(layout.compare)),
        polling: packet.flag(layout.polling),
        data: packet.get(layout.data) as u32,
        address: packet.address(layout.address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SemaphoreCompare::GreaterThan, 5, 4, true)]
    #[case(SemaphoreCompare::GreaterThan, 4, 4, false)]
    #[case(SemaphoreCompare::GreaterOrEqual, 4, 4, true)]
    #[case(SemaphoreCompare::LessThan, 3, 4, true)]
    #[case(SemaphoreCompare::LessOrEqual, 5, 4, false)]
    #[case(SemaphoreCompare::Equal, 7, 7, true)]
    #[case(SemaphoreCompare::NotEqual, 7, 7, false)]
    fn test_compare(
        #[case] compare: SemaphoreCompare,
        #[case] memory: u32,
        #[case] data: u32,
        #[case] expected: bool,
    ) {
        assert_eq!(compare.satisfied(memory, data), expected);
        assert_eq!(SemaphoreCompare::from_bits(compare.bits()), compare);
    }
}
