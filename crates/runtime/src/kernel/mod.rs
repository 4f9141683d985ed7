//! Kernels: compiler metadata, per-instance argument state and binding

pub mod binder;
pub mod descriptor;
pub mod instance;

pub use binder::ArgValue;
pub use descriptor::{
    AccessQualifier, AddressSpace, ArgDescriptor, ArgKind, DispatchTraits, ImagePatches,
    ImplicitSurfaces, KernelDescriptor, KernelDescriptorBuilder, KernelFlags, PatchLocation,
    SAMPLER_STATE_SIZE, SURFACE_STATE_SIZE, ValueElement,
};
pub use instance::{ArgBinding, BoundKind, KernelInstance, KernelResources, PatchBuffer};
