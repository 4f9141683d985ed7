//! Command stream writer and reader

use crate::commands::Command;
use crate::error::PacketError;
use crate::family::HardwareFamily;
use crate::field::Packet;

/// Append-only command stream for one generation
///
/// [`CommandStream::finish`] consumes the stream, so a buffer that has been
/// handed off for submission can no longer be mutated.
#[derive(Debug, Clone)]
pub struct CommandStream {
    family: HardwareFamily,
    words: Vec<u32>,
}

impl CommandStream {
    pub fn new(family: HardwareFamily) -> Self {
        Self {
            family,
            words: Vec::new(),
        }
    }

    pub fn family(&self) -> HardwareFamily {
        self.family
    }

    /// Encode and append a command
    pub fn emit(&mut self, command: &Command) -> Result<(), PacketError> {
        let encoded = self.family.encode(command)?;
        log::trace!(
            "emit {} ({} dwords) at dword {}",
            command.kind().name(),
            encoded.len(),
            self.words.len()
        );
        self.words.extend_from_slice(&encoded);
        Ok(())
    }

    /// Append an already encoded packet
    pub fn emit_packet<const N: usize>(&mut self, packet: &Packet<N>) {
        self.words.extend_from_slice(packet.words());
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Little-endian byte image of the stream
    pub fn finish(self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// A command decoded from a stream, with its dword offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub offset: usize,
    pub command: Command,
}

/// Iterates the commands of a byte image
///
/// Iteration stops after the first error.
pub struct StreamReader {
    family: HardwareFamily,
    words: Vec<u32>,
    position: usize,
    failed: bool,
}

impl StreamReader {
    pub fn new(family: HardwareFamily, bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() % 4 != 0 {
            return Err(PacketError::UnalignedStream(bytes.len()));
        }
        let words = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self::from_words(family, words))
    }

    pub fn from_words(family: HardwareFamily, words: Vec<u32>) -> Self {
        Self {
            family,
            words,
            position: 0,
            failed: false,
        }
    }
}

impl Iterator for StreamReader {
    type Item = Result<DecodedCommand, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.words.len() {
            return None;
        }
        let offset = self.position;
        match self.family.decode(&self.words[offset..]) {
            Ok((command, dwords)) => {
                self.position += dwords;
                Some(Ok(DecodedCommand { offset, command }))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err.at_offset(offset)))
            }
        }
    }
}

/// Decode an entire byte image
pub fn decode_all(family: HardwareFamily, bytes: &[u8]) -> Result<Vec<DecodedCommand>, PacketError> {
    StreamReader::new(family, bytes)?.collect()
}
