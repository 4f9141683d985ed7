//! Built-in copy and fill kernels
//!
//! Both kernels move one byte per work-item. Their binaries are fixed tags
//! the simulated command streamer recognizes and emulates.

use std::sync::Arc;

use super::transport::{KernelEmulator, Launch, SimulatedTransport};
use crate::error::DescriptorError;
use crate::kernel::{AddressSpace, ArgDescriptor, DispatchTraits, KernelDescriptor, PatchLocation};

pub const COPY_ISA: &[u8] = b"anvil.builtin.copy_bytes";
pub const FILL_ISA: &[u8] = b"anvil.builtin.fill_pattern";

/// `copy_bytes(src, dst)`: `dst[gid] = src[gid]`
pub fn copy_kernel() -> Result<Arc<KernelDescriptor>, DescriptorError> {
    KernelDescriptor::builder("copy_bytes")
        .with_parameter_block_size(32)
        .with_simd_width(16)
        .with_arg(ArgDescriptor::buffer("src", AddressSpace::Global, PatchLocation::new(0, 8)))
        .with_arg(ArgDescriptor::buffer("dst", AddressSpace::Global, PatchLocation::new(8, 8)))
        .with_dispatch_traits(DispatchTraits {
            global_offset: [Some(16), None, None],
            local_size: [Some(20), None, None],
            enqueued_local_size: [Some(24), None, None],
            ..Default::default()
        })
        .allow_non_uniform_work_groups()
        .with_isa(COPY_ISA.to_vec(), 0x636f_7079)
        .build()
}

/// `fill_pattern(dst, pattern, pattern_size)`: `dst[gid] = pattern[gid % pattern_size]`
pub fn fill_kernel() -> Result<Arc<KernelDescriptor>, DescriptorError> {
    KernelDescriptor::builder("fill_pattern")
        .with_parameter_block_size(32)
        .with_simd_width(16)
        .with_arg(ArgDescriptor::buffer("dst", AddressSpace::Global, PatchLocation::new(0, 8)))
        .with_arg(ArgDescriptor::buffer("pattern", AddressSpace::Constant, PatchLocation::new(8, 8)))
        .with_arg(ArgDescriptor::scalar("pattern_size", PatchLocation::new(16, 4)))
        .with_dispatch_traits(DispatchTraits {
            global_offset: [Some(20), None, None],
            local_size: [Some(24), None, None],
            enqueued_local_size: [Some(28), None, None],
            ..Default::default()
        })
        .allow_non_uniform_work_groups()
        .with_isa(FILL_ISA.to_vec(), 0x6669_6c6c)
        .build()
}

/// Global IDs covered by one walker of a 1-D byte kernel
fn work_items(launch: &Launch<'_>, traits_at: usize) -> Result<std::ops::Range<u64>, String> {
    let offset = launch.param_u32(traits_at)? as u64;
    let local = launch.param_u32(traits_at + 4)? as u64;
    let enqueued = launch.param_u32(traits_at + 8)? as u64;
    let first_group = launch.thread_group_start[0] as u64;
    let groups = launch.thread_group_count[0] as u64;
    let start = first_group * enqueued;
    // the last group of a partial region is `local` wide
    let end = start + (groups - 1) * enqueued + local;
    Ok(offset + start..offset + end)
}

fn emulate_copy(launch: &Launch<'_>) -> Result<(), String> {
    let src = launch.param_u64(0)?;
    let dst = launch.param_u64(8)?;
    let items = work_items(launch, 16)?;
    let len = items.end - items.start;
    let bytes = launch.read(src + items.start, len)?;
    launch.write(dst + items.start, &bytes)
}

fn emulate_fill(launch: &Launch<'_>) -> Result<(), String> {
    let dst = launch.param_u64(0)?;
    let pattern_address = launch.param_u64(8)?;
    let pattern_size = launch.param_u32(16)? as u64;
    if pattern_size == 0 {
        return Err("fill with an empty pattern".to_string());
    }
    let pattern = launch.read(pattern_address, pattern_size)?;
    let items = work_items(launch, 20)?;
    let bytes: Vec<u8> = items
        .clone()
        .map(|gid| pattern[(gid % pattern_size) as usize])
        .collect();
    launch.write(dst + items.start, &bytes)
}

/// Teach the simulator the built-in kernels
pub fn register_emulators(transport: &SimulatedTransport) {
    transport.register_kernel(COPY_ISA, Box::new(emulate_copy) as KernelEmulator);
    transport.register_kernel(FILL_ISA, Box::new(emulate_fill) as KernelEmulator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_descriptors_build() {
        let copy = copy_kernel().unwrap();
        assert_eq!(copy.arg_count(), 2);
        assert_eq!(copy.isa, COPY_ISA);
        let fill = fill_kernel().unwrap();
        assert_eq!(fill.arg_count(), 3);
        assert!(fill.flags.allows_non_uniform_work_groups);
    }
}
