//! Shared fixtures: a byte-store kernel and a simulated device that runs it

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anvil_runtime::prelude::*;
use anvil_runtime::queue::transport::{KernelEmulator, Launch};

pub const STORE_ISA: &[u8] = b"test.store_byte";

/// Descriptor table: one surface record at 0, binding table at 128
pub const BINDING_TABLE_OFFSET: u32 = 128;
pub const BINDING_TABLE_ENTRIES: u32 = 4;
pub const DESCRIPTOR_TABLE_SIZE: u32 = 192;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `store_byte(dst, value)`: `dst[gid] = value`
pub fn store_kernel() -> Arc<KernelDescriptor> {
    KernelDescriptor::builder("store_byte")
        .with_parameter_block_size(32)
        .with_simd_width(16)
        .with_arg(
            ArgDescriptor::buffer("dst", AddressSpace::Global, PatchLocation::new(0, 8))
                .with_descriptor_offset(0),
        )
        .with_arg(ArgDescriptor::scalar("value", PatchLocation::new(8, 4)))
        .with_descriptor_table(DESCRIPTOR_TABLE_SIZE, BINDING_TABLE_OFFSET, BINDING_TABLE_ENTRIES)
        .with_dispatch_traits(DispatchTraits {
            global_offset: [Some(12), None, None],
            local_size: [Some(16), None, None],
            enqueued_local_size: [Some(20), None, None],
            ..Default::default()
        })
        .allow_non_uniform_work_groups()
        .with_isa(STORE_ISA.to_vec(), 0x5354_4f52)
        .build()
        .unwrap()
}

fn emulate_store(launch: &Launch<'_>) -> Result<(), String> {
    let dst = launch.param_u64(0)?;
    let value = launch.param_u32(8)? as u8;
    let offset = launch.param_u32(12)? as u64;
    let local = launch.param_u32(16)? as u64;
    let enqueued = launch.param_u32(20)? as u64;
    let start = offset + launch.thread_group_start[0] as u64 * enqueued;
    let end = start + (launch.thread_group_count[0] as u64 - 1) * enqueued + local;
    launch.write(dst + start, &vec![value; (end - start) as usize])
}

pub fn store_emulator() -> KernelEmulator {
    Box::new(emulate_store)
}

pub fn config(family: HardwareFamily) -> DeviceConfig {
    DeviceConfig::new(family).with_wait_timeout(Duration::from_millis(500))
}

pub fn simulated(family: HardwareFamily) -> (Device, Arc<SimulatedTransport>) {
    init_logger();
    let (device, transport) = Device::simulated(config(family)).unwrap();
    transport.register_kernel(STORE_ISA, store_emulator());
    (device, transport)
}

/// A store kernel bound to `dst` and `value`
pub fn bound_store(context: &Context, dst: &Buffer, value: u8) -> KernelInstance {
    let mut kernel = context.create_kernel(&store_kernel()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(dst))).unwrap();
    kernel.set_arg(1, ArgValue::Value(&(value as u32).to_le_bytes())).unwrap();
    kernel
}

/// Commands of `batch` as kinds, for order checks
pub fn kinds(batch: &anvil_runtime::queue::ExecutedBatch) -> Vec<anvil_packets::CommandKind> {
    batch.commands.iter().map(|c| c.command.kind()).collect()
}
