//! Encode/decode round trips for every generation

use anvil_packets::prelude::*;
use anvil_packets::{gen9, xe_hpc};
use rstest::rstest;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn round_trip(family: HardwareFamily, command: Command) {
    init_logger();
    let words = family.encode(&command).unwrap();
    assert_eq!(Some(words.len()), family.command_dwords(command.kind()));
    let (decoded, consumed) = family.decode(&words).unwrap();
    assert_eq!(consumed, words.len());
    assert_eq!(decoded, command, "{family}");
}

fn is_gen9(family: HardwareFamily) -> bool {
    family == HardwareFamily::Gen9
}

fn is_xe(family: HardwareFamily) -> bool {
    family == HardwareFamily::XeHpc
}

#[rstest]
fn test_state_base_address(
    #[values(HardwareFamily::Gen9, HardwareFamily::Gen12Lp, HardwareFamily::XeHpc)]
    family: HardwareFamily,
) {
    let mut fields = StateBaseAddressFields {
        mocs: 2,
        stateless_mocs: 3,
        general_state_base: Some(0),
        surface_state_base: Some(0x0000_7FFF_0000_0000),
        dynamic_state_base: Some(0x1_2345_6000),
        indirect_object_base: Some(0x8000_0000),
        instruction_base: None,
        general_state_size_pages: Some(0xF_FFFF),
        dynamic_state_size_pages: Some(16),
        indirect_object_size_pages: None,
        instruction_size_pages: Some(1),
        bindless_surface_state_base: Some(0x4000_0000),
        bindless_surface_state_size: 1023,
        ..Default::default()
    };
    if !is_gen9(family) {
        fields.bindless_sampler_state_base = Some(0x5000_0000);
        fields.bindless_sampler_state_size = 7;
    }
    round_trip(family, Command::StateBaseAddress(fields));
}

#[rstest]
fn test_front_end_state(
    #[values(HardwareFamily::Gen9, HardwareFamily::Gen12Lp, HardwareFamily::XeHpc)]
    family: HardwareFamily,
) {
    let fields = if is_xe(family) {
        FrontEndStateFields {
            scratch_base: 0x1_0000_0400,
            per_thread_scratch_size: 128,
            max_threads: 1024,
            overdispatch_disable: true,
            ..Default::default()
        }
    } else {
        FrontEndStateFields {
            scratch_base: 0x40_0000,
            per_thread_scratch_size: 2048,
            max_threads: 448,
            urb_entries: 2,
            curbe_allocation_size: 16,
            ..Default::default()
        }
    };
    round_trip(family, Command::FrontEndState(fields));
}

#[rstest]
fn test_interface_descriptor_load(
    #[values(HardwareFamily::Gen9, HardwareFamily::Gen12Lp)] family: HardwareFamily,
) {
    round_trip(
        family,
        Command::InterfaceDescriptorLoad(InterfaceDescriptorLoadFields {
            total_length: 32,
            data_start: 0x2_0040,
        }),
    );
}

#[rstest]
fn test_walker(
    #[values(HardwareFamily::Gen9, HardwareFamily::Gen12Lp, HardwareFamily::XeHpc)]
    family: HardwareFamily,
) {
    let mut fields = WalkerFields {
        simd_size: SimdSize::Simd16,
        thread_group_start: [0, 1, 2],
        thread_group_count: [16, 8, 1],
        indirect_data_start: 0x1C0,
        indirect_data_length: 96,
        right_execution_mask: 0xFFFF,
        predicate_enable: true,
        ..Default::default()
    };
    if is_xe(family) {
        fields.local_size = [32, 2, 1];
        fields.emit_local_id = 0b111;
        fields.interface_descriptor = InterfaceDescriptorFields {
            kernel_start_pointer: 0x1_0000_0040,
            denorm_retain: true,
            sampler_count: 1,
            sampler_state_pointer: 0x80,
            binding_table_entry_count: 4,
            binding_table_pointer: 0x1C0,
            threads_in_group: 4,
            shared_local_memory_size: 64 * 1024,
            barrier_enable: true,
            cross_thread_read_length: 3,
            ..Default::default()
        };
        fields.post_sync = PostSyncFields {
            operation: PostSyncOperation::WriteImmediate,
            address: 0x1000_0008,
            immediate: 42,
        };
    } else {
        fields.threads_per_group = 4;
        fields.bottom_execution_mask = 0xFFFF_FFFF;
        fields.interface_descriptor_offset = 3;
    }
    round_trip(family, Command::Walker(Box::new(fields)));
}

#[rstest]
fn test_pipe_control(
    #[values(HardwareFamily::Gen9, HardwareFamily::Gen12Lp, HardwareFamily::XeHpc)]
    family: HardwareFamily,
) {
    let mut fields = PipeControlFields::write_immediate(0xFFFF_FFF8, u64::MAX - 1);
    fields.notify_enable = true;
    fields.instruction_cache_invalidate = true;
    if is_gen9(family) {
        fields.hdc_pipeline_flush = false;
    }
    if !is_xe(family) {
        fields.untyped_dataport_cache_flush = false;
    }
    round_trip(family, Command::PipeControl(fields));
}

#[rstest]
#[case(HardwareFamily::Gen9, 0xFFFF_FFFF_FFFC)]
#[case(HardwareFamily::Gen12Lp, 0x1234_5678)]
#[case(HardwareFamily::XeHpc, 0x00FF_0000_0000_0004)]
fn test_semaphore_wait(#[case] family: HardwareFamily, #[case] address: u64) {
    round_trip(
        family,
        Command::SemaphoreWait(SemaphoreWaitFields {
            compare: SemaphoreCompare::GreaterOrEqual,
            polling: true,
            data: 0xDEAD_BEEF,
            address,
        }),
    );
}

#[rstest]
fn test_batch_buffer_start(
    #[values(HardwareFamily::Gen9, HardwareFamily::Gen12Lp, HardwareFamily::XeHpc)]
    family: HardwareFamily,
) {
    round_trip(
        family,
        Command::BatchBufferStart(BatchBufferStartFields {
            address: 0x8000_1000,
            ppgtt: true,
            second_level: true,
            nested_level: !is_gen9(family),
            ..Default::default()
        }),
    );
}

#[rstest]
fn test_single_dword_commands(
    #[values(HardwareFamily::Gen9, HardwareFamily::Gen12Lp, HardwareFamily::XeHpc)]
    family: HardwareFamily,
) {
    round_trip(family, Command::Noop);
    round_trip(family, Command::BatchBufferEnd);
}

#[rstest]
fn test_surface_state(
    #[values(HardwareFamily::Gen9, HardwareFamily::Gen12Lp, HardwareFamily::XeHpc)]
    family: HardwareFamily,
) {
    let fields = SurfaceStateFields {
        surface_type: SurfaceType::Surface2D,
        is_array: true,
        format: 0xC6,
        mocs: 2,
        coherent: true,
        width: 640,
        height: 480,
        depth: 6,
        pitch: 2560,
        mip_count: 3,
        base_address: 0xFFFF_0000_1000,
    };
    let packet = family.encode_surface_state(&fields);
    assert_eq!(family.decode_surface_state(&packet), fields);
}

#[test]
fn test_coherency_bit_position() {
    let fields = SurfaceStateFields::buffer(0x1000, 256, true);
    let gen9 = HardwareFamily::Gen9.encode_surface_state(&fields);
    let gen12 = HardwareFamily::Gen12Lp.encode_surface_state(&fields);
    assert_ne!(gen9.words()[5] & (1 << 14), 0);
    assert_eq!(gen9.words()[1] & (1 << 16), 0);
    assert_ne!(gen12.words()[1] & (1 << 16), 0);
    assert_eq!(gen12.words()[5] & (1 << 14), 0);
}

#[test]
fn test_sampler_state() {
    let fields = SamplerStateFields {
        min_filter: FilterMode::Linear,
        mag_filter: FilterMode::Nearest,
        address_u: TextureAddressMode::Clamp,
        address_v: TextureAddressMode::ClampBorder,
        address_r: TextureAddressMode::MirrorOnce,
        normalized_coordinates: false,
    };
    for family in HardwareFamily::ALL {
        let packet = family.encode_sampler_state(&fields);
        assert_eq!(family.decode_sampler_state(&packet), fields);
    }
}

#[test]
fn test_gen9_interface_descriptor_record() {
    let fields = InterfaceDescriptorFields {
        kernel_start_pointer: 0xFFFF_FFFF_FFC0,
        single_program_flow: true,
        binding_table_entry_count: 31,
        binding_table_pointer: 0xFFE0,
        constant_read_length: 2,
        threads_in_group: 64,
        shared_local_memory_size: 16 * 1024,
        cross_thread_read_length: 255,
        ..Default::default()
    };
    let packet = HardwareFamily::Gen9.encode_interface_descriptor(&fields);
    assert_eq!(HardwareFamily::Gen9.decode_interface_descriptor(&packet), fields);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(33)]
#[case(64)]
fn test_threads_per_group_count_field(#[case] threads: u32) {
    let fields = WalkerFields {
        threads_per_group: threads,
        ..Default::default()
    };
    let packet = gen9::GpgpuWalker::from_slice(
        &HardwareFamily::Gen9
            .encode(&Command::Walker(Box::new(fields)))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(packet.words()[4] & 0x3F, threads - 1);
}

#[rstest]
#[case([1, 1, 1])]
#[case([1024, 1, 1])]
#[case([16, 16, 4])]
#[case([7, 3, 1024])]
fn test_local_size_count_fields(#[case] local_size: [u32; 3]) {
    let fields = WalkerFields {
        local_size,
        ..Default::default()
    };
    let words = HardwareFamily::XeHpc
        .encode(&Command::Walker(Box::new(fields)))
        .unwrap();
    let packet = xe_hpc::ComputeWalker::from_slice(&words).unwrap();
    let dw6 = packet.words()[6];
    assert_eq!(dw6 & 0x3FF, local_size[0] - 1);
    assert_eq!((dw6 >> 10) & 0x3FF, local_size[1] - 1);
    assert_eq!((dw6 >> 20) & 0x3FF, local_size[2] - 1);
    let (decoded, _) = HardwareFamily::XeHpc.decode(&words).unwrap();
    let Command::Walker(decoded) = decoded else {
        panic!("expected walker");
    };
    assert_eq!(decoded.local_size, local_size);
}

#[test]
fn test_uncarried_fields_decode_to_default() {
    let fields = WalkerFields {
        local_size: [8, 8, 1],
        emit_local_id: 0b11,
        ..Default::default()
    };
    let words = HardwareFamily::Gen12Lp
        .encode(&Command::Walker(Box::new(fields)))
        .unwrap();
    let (decoded, _) = HardwareFamily::Gen12Lp.decode(&words).unwrap();
    assert_eq!(decoded, Command::Walker(Box::default()));
}

#[test]
fn test_header_length_mismatch() {
    let mut words = HardwareFamily::Gen9
        .encode(&Command::PipeControl(PipeControlFields::default()))
        .unwrap();
    words[0] = (words[0] & !0xFF) | 3;
    let err = HardwareFamily::Gen9.decode(&words).unwrap_err();
    assert_eq!(
        err,
        PacketError::LengthMismatch {
            command: "PIPE_CONTROL",
            declared: 5,
            expected: 6
        }
    );
}
