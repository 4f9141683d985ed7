//! Anvil Packets: hardware command packet codec
//!
//! Compute dispatch commands are fixed-size sequences of 32-bit words whose
//! bit-field layout changes from one hardware generation to the next. This
//! crate describes each command once as a plain field struct, keeps one
//! layout table per generation, and routes through [`HardwareFamily`] so that
//! callers can write generation-agnostic dispatch logic.
//!
//! ```
//! use anvil_packets::prelude::*;
//!
//! let family = HardwareFamily::Gen12Lp;
//! let mut stream = CommandStream::new(family);
//! stream.emit(&Command::PipeControl(PipeControlFields::barrier())).unwrap();
//! stream.emit(&Command::BatchBufferEnd).unwrap();
//!
//! let decoded = decode_all(family, &stream.finish()).unwrap();
//! assert_eq!(decoded.len(), 2);
//! ```

pub mod commands;
pub mod error;
pub mod family;
pub mod field;
pub mod gen12lp;
pub mod gen9;
pub mod stream;
pub mod xe_hpc;

pub use commands::{Command, CommandKind, Opcode};
pub use error::PacketError;
pub use family::{HardwareFamily, binding_table_entry};
pub use field::{AddressField, Field, Packet};
pub use stream::{CommandStream, DecodedCommand, StreamReader, decode_all};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::commands::{
        BatchBufferStartFields, Command, CommandKind, FilterMode, FrontEndStateFields,
        InterfaceDescriptorFields, InterfaceDescriptorLoadFields, PipeControlFields,
        PostSyncFields, PostSyncOperation, SURFACE_FORMAT_RAW, SamplerStateFields,
        SemaphoreCompare, SemaphoreWaitFields, SimdSize, StateBaseAddressFields,
        SurfaceStateFields, SurfaceType, TextureAddressMode, WalkerFields,
    };
    pub use crate::error::PacketError;
    pub use crate::family::HardwareFamily;
    pub use crate::field::Packet;
    pub use crate::stream::{CommandStream, DecodedCommand, StreamReader, decode_all};
}
