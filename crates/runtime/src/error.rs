//! Error types for the dispatch runtime

use std::time::Duration;

use anvil_packets::PacketError;
use thiserror::Error;

use crate::kernel::ArgKind;
use crate::memory::AllocationId;

/// Kernel metadata rejected while building a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("argument '{arg}': patch at {offset}+{size} exceeds parameter block of {limit} bytes")]
    PatchOutOfBounds {
        arg: String,
        offset: u32,
        size: u32,
        limit: u32,
    },

    #[error("argument '{arg}': pointer patch must be 4 or 8 bytes, got {size}")]
    InvalidPointerSize { arg: String, size: u32 },

    #[error("argument '{arg}': descriptor-table offset {offset:#x} is not 64-byte aligned")]
    MisalignedDescriptorOffset { arg: String, offset: u32 },

    #[error("argument '{arg}': descriptor-table offset {offset:#x} exceeds table of {limit} bytes")]
    DescriptorOffsetOutOfBounds { arg: String, offset: u32, limit: u32 },

    #[error("argument '{arg}': value element exceeds declared size {size}")]
    InvalidValueElement { arg: String, size: u32 },

    #[error("argument '{arg}': alignment {alignment} is not a power of two")]
    InvalidAlignment { arg: String, alignment: u32 },

    #[error("binding table offset {0:#x} is not 32-byte aligned")]
    MisalignedBindingTable(u32),

    #[error("binding table at {offset:#x} with {count} entries exceeds table of {limit} bytes")]
    BindingTableOutOfBounds { offset: u32, count: u32, limit: u32 },

    #[error("descriptor-table template is {found} bytes, table is {expected}")]
    TemplateSizeMismatch { expected: usize, found: usize },

    #[error("required work-group size {0:?} is invalid")]
    InvalidRequiredWorkGroupSize([u32; 3]),

    #[error("SIMD width {0} is not supported")]
    InvalidSimdWidth(u32),

    #[error("built-in patch '{name}' at {offset} exceeds parameter block of {limit} bytes")]
    TraitOutOfBounds {
        name: &'static str,
        offset: u32,
        limit: u32,
    },

    #[error("per-thread scratch of {size} bytes exceeds the {limit} byte limit")]
    ScratchTooLarge { size: u32, limit: u32 },
}

/// Argument binding failures; the kernel instance is left unchanged
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("argument index {index} out of range ({count} arguments)")]
    InvalidIndex { index: usize, count: usize },

    #[error("argument {index}: expected {expected:?}, got {found}")]
    KindMismatch {
        index: usize,
        expected: ArgKind,
        found: &'static str,
    },

    #[error("argument {index}: expected {expected} bytes, got {found}")]
    SizeMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("argument {index}: null object is not allowed")]
    NullObject { index: usize },

    #[error("argument {index}: object belongs to a different context")]
    ContextMismatch { index: usize },

    #[error("argument {index}: {supplied} object cannot be bound to a {declared} parameter")]
    AccessMismatch {
        index: usize,
        declared: &'static str,
        supplied: &'static str,
    },

    #[error("argument {index}: local memory size must be non-zero")]
    ZeroLocalSize { index: usize },

    #[error("shared local memory of {requested} bytes exceeds limit of {limit}")]
    SharedMemoryExceeded { requested: u32, limit: u32 },

    #[error("write at {offset}+{size} exceeds region of {limit} bytes")]
    PatchOutOfBounds {
        offset: usize,
        size: usize,
        limit: usize,
    },

    #[error("argument {index}: address {address:#x} does not fit a 4-byte pointer")]
    PointerTooWide { index: usize, address: u64 },

    #[error("argument {index}: SVM offset {offset:#x} lies outside the allocation")]
    InvalidSvmOffset { index: usize, offset: u64 },

    #[error("argument {index}: object memory has been released")]
    Released { index: usize },
}

/// Work geometry rejected by the dispatch builder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("work dimension {0} is not in 1..=3")]
    InvalidWorkDimension(u32),

    #[error("global size {size} in dimension {dim} is zero or exceeds 32 bits")]
    InvalidGlobalWorkSize { dim: usize, size: u64 },

    #[error("global offset plus size in dimension {dim} exceeds the 32-bit id range")]
    InvalidGlobalOffset { dim: usize },

    #[error("invalid work-group size: {0}")]
    InvalidWorkGroupSize(&'static str),

    #[error("local size {size} in dimension {dim} exceeds limit {limit}")]
    InvalidWorkItemSize { dim: usize, size: u32, limit: u32 },
}

/// Device memory and registry failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("allocation size must be non-zero")]
    InvalidSize,

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u64),

    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("allocation {0:?} is not registered")]
    NotRegistered(AllocationId),

    #[error("allocation {0:?} has already been released")]
    AlreadyReleased(AllocationId),

    #[error("access at {offset}+{len} exceeds allocation of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("allocation {0:?} has no host-visible mapping")]
    NotHostVisible(AllocationId),
}

/// Device configuration the front end cannot be programmed with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{threads} hardware threads is outside 1..={limit}")]
    InvalidHwThreads { threads: u32, limit: u32 },

    #[error("{name} must be non-zero")]
    ZeroLimit { name: &'static str },

    #[error("{name}={value} is not a valid value")]
    InvalidValue { name: &'static str, value: String },
}

/// Failures reported by the submission transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("device lost")]
    DeviceLost,
}

/// Errors returned from command-queue operations
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("kernel '{kernel}' is not ready: arguments {missing:?} are unbound")]
    NotDispatchReady { kernel: String, missing: Vec<usize> },

    #[error("argument {index} refers to released memory")]
    ArgumentReleased { index: usize },

    #[error("a dependency failed")]
    DependencyFailed,

    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),

    #[error("object belongs to a different context")]
    ContextMismatch,

    #[error("copy of {size} bytes at offset {offset} exceeds buffer of {limit} bytes")]
    InvalidCopyRange { offset: u64, size: u64, limit: u64 },

    #[error("fill pattern of {0} bytes is not a power of two up to 128")]
    InvalidFillPattern(usize),

    #[error("instrumentation: {0}")]
    Instrumentation(String),
}
