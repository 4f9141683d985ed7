//! Error types for command stream decoding

use thiserror::Error;

/// Errors raised while reading packets back out of a command stream
///
/// Encoding never fails: out-of-range values are caller defects caught by
/// debug assertions. Decoding is used by tooling and by the simulated
/// transport, which need to report malformed streams instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Fewer dwords remain than the packet layout requires
    #[error("packet truncated: expected {expected} dwords, found {found}")]
    Truncated { expected: usize, found: usize },

    /// Header does not identify any command known to this generation
    #[error("unknown command header {header:#010x} at dword {offset}")]
    UnknownHeader { header: u32, offset: usize },

    /// Header length field disagrees with the layout
    #[error("{command}: header declares {declared} dwords, layout has {expected}")]
    LengthMismatch {
        command: &'static str,
        declared: usize,
        expected: usize,
    },

    /// The generation has no encoding for this command
    #[error("{command} is not available on {family}")]
    Unsupported {
        command: &'static str,
        family: &'static str,
    },

    /// Stream byte length is not a whole number of dwords
    #[error("command stream length {0} is not a multiple of 4 bytes")]
    UnalignedStream(usize),
}

impl PacketError {
    /// Rebase a packet-relative error onto its position in a stream
    pub fn at_offset(self, base: usize) -> Self {
        match self {
            PacketError::UnknownHeader { header, offset } => PacketError::UnknownHeader {
                header,
                offset: offset + base,
            },
            other => other,
        }
    }
}
