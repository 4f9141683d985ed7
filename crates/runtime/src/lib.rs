//! Anvil Runtime: compute dispatch on top of the packet codec
//!
//! The runtime turns a compiled kernel plus its arguments into a command
//! buffer the hardware front end can execute:
//!
//! - [`kernel`] binds arguments into a kernel instance's parameter block and
//!   descriptor table
//! - [`memory`] owns device allocations and tracks which submissions keep
//!   them resident
//! - [`dispatch`] validates work geometry and splits it into walker regions
//! - [`queue`] builds, submits and retires command buffers
//! - [`instrumentation`] lets a profiling tool rewrite binaries and observe
//!   dispatches
//!
//! ```
//! use anvil_runtime::prelude::*;
//!
//! let (device, _transport) = Device::simulated(DeviceConfig::default()).unwrap();
//! let context = device.create_context();
//! let buffer = context.create_buffer(64, MemoryAccess::ReadWrite).unwrap();
//! buffer.write(0, &[7; 64]).unwrap();
//!
//! let mut queue = context.create_queue().unwrap();
//! let token = queue.enqueue_fill_buffer(&buffer, &[1, 2], 0, 64, &[], true).unwrap();
//! assert!(token.is_complete());
//! assert_eq!(buffer.read(0, 4).unwrap(), vec![1, 2, 1, 2]);
//! ```

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod instrumentation;
pub mod kernel;
pub mod memory;
pub mod queue;

pub use config::DeviceConfig;
pub use device::{Context, Device};
pub use error::{
    AllocationError, BindError, ConfigError, DescriptorError, DispatchError, EnqueueError,
    TransportError,
};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::config::DeviceConfig;
    pub use crate::device::{Context, Device};
    pub use crate::dispatch::{DeviceLimits, DispatchInfo, DispatchRegion};
    pub use crate::error::{
        AllocationError, BindError, ConfigError, DescriptorError, DispatchError, EnqueueError,
        TransportError,
    };
    pub use crate::instrumentation::{InstrumentationHook, InstrumentationResource, KernelExecution};
    pub use crate::kernel::{
        AccessQualifier, AddressSpace, ArgDescriptor, ArgKind, ArgValue, DispatchTraits,
        ImplicitSurfaces, KernelDescriptor, KernelFlags, KernelInstance, PatchLocation,
    };
    pub use crate::memory::{
        Allocation, AllocationKind, AllocationRegistry, AllocationState, Buffer, ContextId, Image,
        ImageDescriptor, MemoryAccess, Sampler, SubmissionId, SvmRegion,
    };
    pub use crate::queue::{
        CommandQueue, CompletionToken, Dependency, NdRange, QueueId, SimulatedTransport,
        SubmissionTransport, TokenStatus, UserEvent,
    };
    pub use anvil_packets::HardwareFamily;
}
