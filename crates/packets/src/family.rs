//! Hardware generations and the generation-agnostic codec entry points
//!
//! Callers hold a [`HardwareFamily`] chosen once at device initialisation and
//! go through it for every encode/decode; each method matches once and routes
//! to the generation's layout tables.

use std::fmt;
use std::str::FromStr;

use crate::commands::front_end::FrontEndLayout;
use crate::commands::interface_descriptor::{
    self, INTERFACE_DESCRIPTOR_DWORDS, InterfaceDescriptorFields, InterfaceDescriptorLayout,
};
use crate::commands::sampler_state::{self, SAMPLER_STATE, SAMPLER_STATE_DWORDS, SamplerStateFields};
use crate::commands::surface_state::{self, SURFACE_STATE_DWORDS, SurfaceStateFields, SurfaceStateLayout};
use crate::commands::{Command, CommandKind};
use crate::error::PacketError;
use crate::field::{AddressField, Field, Packet};
use crate::{gen9, gen12lp, xe_hpc};

/// Binding-table entries hold a 64-byte aligned surface-state offset
const BINDING_TABLE_ENTRY: AddressField = AddressField::new(Field::new(0, 6, 26), 6);

/// Binding-table entry pointing at a 64-byte aligned surface-state offset
///
/// The entry format is shared by every supported generation.
pub fn binding_table_entry(surface_state_offset: u64) -> u32 {
    let mut packet = Packet::<1>::zeroed();
    packet.set_address(BINDING_TABLE_ENTRY, surface_state_offset);
    packet.words()[0]
}

/// Closed set of supported hardware generations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HardwareFamily {
    Gen9,
    #[default]
    Gen12Lp,
    XeHpc,
}

impl HardwareFamily {
    pub const ALL: [HardwareFamily; 3] = [
        HardwareFamily::Gen9,
        HardwareFamily::Gen12Lp,
        HardwareFamily::XeHpc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HardwareFamily::Gen9 => "Gen9",
            HardwareFamily::Gen12Lp => "Gen12LP",
            HardwareFamily::XeHpc => "XeHPC",
        }
    }

    /// Whether the interface descriptor is carried inside the walker
    pub fn has_inline_interface_descriptor(self) -> bool {
        matches!(self, HardwareFamily::XeHpc)
    }

    /// Whether the walker can generate local IDs in hardware
    pub fn generates_local_ids(self) -> bool {
        matches!(self, HardwareFamily::XeHpc)
    }

    /// Allocation granularity for shared local memory
    pub fn shared_memory_granularity(self) -> u32 {
        match self {
            HardwareFamily::Gen9 => 4096,
            HardwareFamily::Gen12Lp | HardwareFamily::XeHpc => 1024,
        }
    }

    pub fn max_shared_memory(self) -> u32 {
        64 * 1024
    }

    /// Hardware threads a single work-group may occupy
    pub fn max_threads_per_group(self) -> u32 {
        64
    }

    /// Bytes per general register (the unit of cross-thread read lengths)
    pub fn grf_size(self) -> u32 {
        match self {
            HardwareFamily::XeHpc => 64,
            HardwareFamily::Gen9 | HardwareFamily::Gen12Lp => 32,
        }
    }

    fn front_end_layout(self) -> FrontEndLayout {
        match self {
            HardwareFamily::Gen9 => gen9::MEDIA_VFE_STATE,
            HardwareFamily::Gen12Lp => gen12lp::MEDIA_VFE_STATE,
            HardwareFamily::XeHpc => xe_hpc::CFE_STATE,
        }
    }

    /// Per-thread scratch the front end is programmed with for `size` bytes,
    /// or `None` if the size has no encoding on this generation
    pub fn programmed_scratch_size(self, size: u32) -> Option<u32> {
        self.front_end_layout().programmed_scratch_size(size)
    }

    pub fn max_scratch_size(self) -> u32 {
        self.front_end_layout().max_scratch_size()
    }

    /// Largest hardware thread count the front-end state can carry
    pub fn max_hw_threads(self) -> u32 {
        self.front_end_layout().max_thread_count()
    }

    fn interface_descriptor_layout(self) -> InterfaceDescriptorLayout {
        match self {
            HardwareFamily::Gen9 => gen9::INTERFACE_DESCRIPTOR,
            HardwareFamily::Gen12Lp => gen12lp::INTERFACE_DESCRIPTOR,
            HardwareFamily::XeHpc => xe_hpc::INTERFACE_DESCRIPTOR,
        }
    }

    fn surface_state_layout(self) -> SurfaceStateLayout {
        match self {
            HardwareFamily::Gen9 => gen9::SURFACE_STATE,
            HardwareFamily::Gen12Lp => gen12lp::SURFACE_STATE,
            HardwareFamily::XeHpc => xe_hpc::SURFACE_STATE,
        }
    }

    /// Dword count of `kind`, or `None` if the generation lacks the command
    pub fn command_dwords(self, kind: CommandKind) -> Option<usize> {
        match self {
            HardwareFamily::Gen9 => gen9::command_dwords(kind),
            HardwareFamily::Gen12Lp => gen12lp::command_dwords(kind),
            HardwareFamily::XeHpc => xe_hpc::command_dwords(kind),
        }
    }

    pub fn supports(self, kind: CommandKind) -> bool {
        self.command_dwords(kind).is_some()
    }

    /// Encode one command into its dword image
    pub fn encode(self, command: &Command) -> Result<Vec<u32>, PacketError> {
        match self {
            HardwareFamily::Gen9 => gen9::encode(command),
            HardwareFamily::Gen12Lp => gen12lp::encode(command),
            HardwareFamily::XeHpc => xe_hpc::encode(command),
        }
    }

    /// Decode the command at the start of `words`, returning it with its length
    pub fn decode(self, words: &[u32]) -> Result<(Command, usize), PacketError> {
        let Some(&header) = words.first() else {
            return Err(PacketError::Truncated {
                expected: 1,
                found: 0,
            });
        };
        let decoded = match self {
            HardwareFamily::Gen9 => gen9::decode(words)?,
            HardwareFamily::Gen12Lp => gen12lp::decode(words)?,
            HardwareFamily::XeHpc => xe_hpc::decode(words)?,
        };
        decoded.ok_or(PacketError::UnknownHeader { header, offset: 0 })
    }

    /// Identify the command kind at the start of `words` without decoding it
    pub fn identify(self, words: &[u32]) -> Option<CommandKind> {
        self.decode(words).ok().map(|(command, _)| command.kind())
    }

    // ========================================================================
    // Heap records
    // ========================================================================

    pub fn encode_interface_descriptor(
        self,
        fields: &InterfaceDescriptorFields,
    ) -> Packet<INTERFACE_DESCRIPTOR_DWORDS> {
        interface_descriptor::encode(&self.interface_descriptor_layout(), fields)
    }

    pub fn decode_interface_descriptor(
        self,
        packet: &Packet<INTERFACE_DESCRIPTOR_DWORDS>,
    ) -> InterfaceDescriptorFields {
        interface_descriptor::decode(&self.interface_descriptor_layout(), packet)
    }

    pub fn encode_surface_state(self, fields: &SurfaceStateFields) -> Packet<SURFACE_STATE_DWORDS> {
        surface_state::encode(&self.surface_state_layout(), fields)
    }

    pub fn decode_surface_state(self, packet: &Packet<SURFACE_STATE_DWORDS>) -> SurfaceStateFields {
        surface_state::decode(&self.surface_state_layout(), packet)
    }

    pub fn encode_sampler_state(self, fields: &SamplerStateFields) -> Packet<SAMPLER_STATE_DWORDS> {
        sampler_state::encode(&SAMPLER_STATE, fields)
    }

    pub fn decode_sampler_state(self, packet: &Packet<SAMPLER_STATE_DWORDS>) -> SamplerStateFields {
        sampler_state::decode(&SAMPLER_STATE, packet)
    }

    pub fn encode_binding_table_entry(self, surface_state_offset: u64) -> u32 {
        binding_table_entry(surface_state_offset)
    }

    pub fn decode_binding_table_entry(self, entry: u32) -> u64 {
        Packet::from_words([entry]).address(BINDING_TABLE_ENTRY)
    }
}

impl fmt::Display for HardwareFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HardwareFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "gen9" | "skl" | "skylake" => Ok(HardwareFamily::Gen9),
            "gen12lp" | "gen12" | "tgl" | "tigerlake" => Ok(HardwareFamily::Gen12Lp),
            "xehpc" | "pvc" | "pontevecchio" => Ok(HardwareFamily::XeHpc),
            other => Err(format!("unknown hardware family: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("gen9", HardwareFamily::Gen9)]
    #[case("Gen12LP", HardwareFamily::Gen12Lp)]
    #[case("gen12-lp", HardwareFamily::Gen12Lp)]
    #[case("xe_hpc", HardwareFamily::XeHpc)]
    #[case("PVC", HardwareFamily::XeHpc)]
    fn test_parse_family(#[case] input: &str, #[case] expected: HardwareFamily) {
        assert_eq!(input.parse::<HardwareFamily>().unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown_family() {
        assert!("gen3".parse::<HardwareFamily>().is_err());
    }

    #[rstest]
    #[case(HardwareFamily::Gen9, CommandKind::StateBaseAddress, Some(19))]
    #[case(HardwareFamily::Gen12Lp, CommandKind::StateBaseAddress, Some(22))]
    #[case(HardwareFamily::XeHpc, CommandKind::Walker, Some(39))]
    #[case(HardwareFamily::Gen9, CommandKind::Walker, Some(15))]
    #[case(HardwareFamily::Gen9, CommandKind::SemaphoreWait, Some(4))]
    #[case(HardwareFamily::Gen12Lp, CommandKind::SemaphoreWait, Some(5))]
    #[case(HardwareFamily::XeHpc, CommandKind::InterfaceDescriptorLoad, None)]
    #[case(HardwareFamily::XeHpc, CommandKind::FrontEndState, Some(6))]
    fn test_command_dwords(
        #[case] family: HardwareFamily,
        #[case] kind: CommandKind,
        #[case] expected: Option<usize>,
    ) {
        assert_eq!(family.command_dwords(kind), expected);
    }

    #[test]
    fn test_encoded_length_matches_declared_size() {
        for family in HardwareFamily::ALL {
            for kind in CommandKind::ALL {
                let Some(dwords) = family.command_dwords(kind) else {
                    continue;
                };
                let command = default_command(kind);
                let words = family.encode(&command).unwrap();
                assert_eq!(words.len(), dwords, "{family} {}", kind.name());
                let (decoded, consumed) = family.decode(&words).unwrap();
                assert_eq!(consumed, dwords);
                assert_eq!(decoded.kind(), kind);
            }
        }
    }

    fn default_command(kind: CommandKind) -> Command {
        match kind {
            CommandKind::Noop => Command::Noop,
            CommandKind::BatchBufferEnd => Command::BatchBufferEnd,
            CommandKind::BatchBufferStart => Command::BatchBufferStart(Default::default()),
            CommandKind::SemaphoreWait => Command::SemaphoreWait(Default::default()),
            CommandKind::StateBaseAddress => Command::StateBaseAddress(Default::default()),
            CommandKind::FrontEndState => Command::FrontEndState(Default::default()),
            CommandKind::InterfaceDescriptorLoad => {
                Command::InterfaceDescriptorLoad(Default::default())
            }
            CommandKind::Walker => Command::Walker(Box::default()),
            CommandKind::PipeControl => Command::PipeControl(Default::default()),
        }
    }

    #[test]
    fn test_unsupported_command() {
        let err = HardwareFamily::XeHpc
            .encode(&Command::InterfaceDescriptorLoad(Default::default()))
            .unwrap_err();
        assert!(matches!(err, PacketError::Unsupported { .. }));
    }

    #[test]
    fn test_unknown_header() {
        let err = HardwareFamily::Gen9.decode(&[0x7FFF_0000]).unwrap_err();
        assert_eq!(
            err,
            PacketError::UnknownHeader {
                header: 0x7FFF_0000,
                offset: 0
            }
        );
    }

    #[test]
    fn test_binding_table_entry() {
        let family = HardwareFamily::Gen12Lp;
        let entry = family.encode_binding_table_entry(0x1C0);
        assert_eq!(entry, 0x1C0);
        assert_eq!(family.decode_binding_table_entry(entry), 0x1C0);
    }

    #[rstest]
    #[case(HardwareFamily::Gen9, 1500, Some(2048))]
    #[case(HardwareFamily::Gen12Lp, 1500, Some(2048))]
    #[case(HardwareFamily::XeHpc, 1500, Some(2048))]
    #[case(HardwareFamily::XeHpc, 40, Some(64))]
    #[case(HardwareFamily::XeHpc, (1 << 20) + 1, None)]
    #[case(HardwareFamily::Gen12Lp, 0, Some(0))]
    fn test_programmed_scratch_size(
        #[case] family: HardwareFamily,
        #[case] size: u32,
        #[case] expected: Option<u32>,
    ) {
        assert_eq!(family.programmed_scratch_size(size), expected);
    }

    #[test]
    fn test_front_end_limits() {
        for family in HardwareFamily::ALL {
            assert_eq!(family.max_hw_threads(), 65536);
            let max = family.max_scratch_size();
            assert_eq!(family.programmed_scratch_size(max), Some(max));
            assert_eq!(family.programmed_scratch_size(max + 1), None);
        }
    }

    #[test]
    fn test_shared_memory_encoding_differs() {
        let fields = InterfaceDescriptorFields {
            shared_local_memory_size: 4096,
            ..Default::default()
        };
        let gen9 = HardwareFamily::Gen9.encode_interface_descriptor(&fields);
        let gen12 = HardwareFamily::Gen12Lp.encode_interface_descriptor(&fields);
        assert_eq!((gen9.words()[6] >> 16) & 0x1F, 1);
        assert_eq!((gen12.words()[6] >> 16) & 0x1F, 3);
    }
}
