//! Compiler-produced kernel metadata
//!
//! A [`KernelDescriptor`] is assembled once per kernel with the fluent
//! [`KernelDescriptorBuilder`] and validated by `build()`, which is the only
//! place patch offsets are checked against region sizes. Every instance of
//! the kernel then shares the descriptor through an `Arc`.

use std::sync::Arc;

use anvil_packets::binding_table_entry;
use anvil_packets::commands::sampler_state::SAMPLER_STATE_DWORDS;
use anvil_packets::commands::surface_state::SURFACE_STATE_DWORDS;
use anvil_packets::prelude::{HardwareFamily, SimdSize};

use crate::error::DescriptorError;

/// Size in bytes of one surface-state record in the descriptor table
pub const SURFACE_STATE_SIZE: u32 = (SURFACE_STATE_DWORDS * 4) as u32;
/// Size in bytes of one sampler-state record in the descriptor table
pub const SAMPLER_STATE_SIZE: u32 = (SAMPLER_STATE_DWORDS * 4) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Buffer,
    Image,
    Sampler,
    Local,
    Value,
    Pipe,
    DeviceQueue,
    Accelerator,
    Svm,
}

impl ArgKind {
    pub fn name(self) -> &'static str {
        match self {
            ArgKind::Buffer => "buffer",
            ArgKind::Image => "image",
            ArgKind::Sampler => "sampler",
            ArgKind::Local => "local",
            ArgKind::Value => "value",
            ArgKind::Pipe => "pipe",
            ArgKind::DeviceQueue => "device queue",
            ArgKind::Accelerator => "accelerator",
            ArgKind::Svm => "svm",
        }
    }

    /// Whether the argument's patches receive a device address
    pub fn is_pointer(self) -> bool {
        matches!(
            self,
            ArgKind::Buffer
                | ArgKind::Image
                | ArgKind::Pipe
                | ArgKind::DeviceQueue
                | ArgKind::Accelerator
                | ArgKind::Svm
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Global,
    Constant,
    Local,
    #[default]
    Private,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AccessQualifier {
    #[default]
    None,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessQualifier {
    pub fn name(self) -> &'static str {
        match self {
            AccessQualifier::None => "unqualified",
            AccessQualifier::ReadOnly => "read-only",
            AccessQualifier::WriteOnly => "write-only",
            AccessQualifier::ReadWrite => "read-write",
        }
    }
}

/// Byte range in the parameter block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchLocation {
    pub offset: u32,
    pub size: u32,
}

impl PatchLocation {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// One past the last byte, or `None` if the range wraps
    pub const fn end(self) -> Option<u32> {
        self.offset.checked_add(self.size)
    }
}

/// One piece of a by-value argument: `patch.size` bytes copied from
/// `source_offset` of the caller's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueElement {
    pub source_offset: u32,
    pub patch: PatchLocation,
}

/// Where image metadata is patched for an image argument
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImagePatches {
    pub width: Option<PatchLocation>,
    pub height: Option<PatchLocation>,
    pub depth: Option<PatchLocation>,
    pub channel_order: Option<PatchLocation>,
    pub channel_type: Option<PatchLocation>,
    pub array_size: Option<PatchLocation>,
    pub mip_levels: Option<PatchLocation>,
}

impl ImagePatches {
    fn iter(&self) -> impl Iterator<Item = PatchLocation> + '_ {
        [
            self.width,
            self.height,
            self.depth,
            self.channel_order,
            self.channel_type,
            self.array_size,
            self.mip_levels,
        ]
        .into_iter()
        .flatten()
    }
}

/// Metadata of one kernel argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDescriptor {
    pub name: String,
    pub kind: ArgKind,
    pub address_space: AddressSpace,
    pub access: AccessQualifier,
    /// Optional arguments do not gate dispatch readiness
    pub optional: bool,
    /// Address, sampler value or local offset patches
    pub patches: Vec<PatchLocation>,
    /// By-value arguments: total size and element mapping
    pub value_size: u32,
    pub value_elements: Vec<ValueElement>,
    /// Receives the low bits dropped when the pointer is rounded down to 4 bytes
    pub buffer_offset_patch: Option<PatchLocation>,
    pub image_patches: ImagePatches,
    /// Byte offset of this argument's surface/sampler record in the descriptor table
    pub descriptor_table_offset: Option<u32>,
    /// Local arguments: required alignment of the assigned offset
    pub local_alignment: u32,
}

impl ArgDescriptor {
    fn new(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            address_space: AddressSpace::Private,
            access: AccessQualifier::None,
            optional: false,
            patches: Vec::new(),
            value_size: 0,
            value_elements: Vec::new(),
            buffer_offset_patch: None,
            image_patches: ImagePatches::default(),
            descriptor_table_offset: None,
            local_alignment: 1,
        }
    }

    /// Global or constant pointer
    pub fn buffer(name: impl Into<String>, address_space: AddressSpace, patch: PatchLocation) -> Self {
        Self {
            address_space,
            patches: vec![patch],
            ..Self::new(name, ArgKind::Buffer)
        }
    }

    pub fn image(name: impl Into<String>, access: AccessQualifier, patch: PatchLocation) -> Self {
        Self {
            address_space: AddressSpace::Global,
            access,
            patches: vec![patch],
            ..Self::new(name, ArgKind::Image)
        }
    }

    pub fn sampler(name: impl Into<String>, patch: PatchLocation) -> Self {
        Self {
            patches: vec![patch],
            ..Self::new(name, ArgKind::Sampler)
        }
    }

    /// Dynamically sized shared-memory argument; `patch` receives its offset
    pub fn local(name: impl Into<String>, patch: PatchLocation, alignment: u32) -> Self {
        Self {
            address_space: AddressSpace::Local,
            patches: vec![patch],
            local_alignment: alignment,
            ..Self::new(name, ArgKind::Local)
        }
    }

    /// By-value argument of `size` bytes; add its destinations with [`Self::with_element`]
    pub fn value(name: impl Into<String>, size: u32) -> Self {
        Self {
            value_size: size,
            ..Self::new(name, ArgKind::Value)
        }
    }

    /// By-value argument copied whole to a single location
    pub fn scalar(name: impl Into<String>, patch: PatchLocation) -> Self {
        Self::value(name, patch.size).with_element(0, patch)
    }

    pub fn pipe(name: impl Into<String>, access: AccessQualifier, patch: PatchLocation) -> Self {
        Self {
            address_space: AddressSpace::Global,
            access,
            patches: vec![patch],
            ..Self::new(name, ArgKind::Pipe)
        }
    }

    pub fn device_queue(name: impl Into<String>, patch: PatchLocation) -> Self {
        Self {
            address_space: AddressSpace::Global,
            patches: vec![patch],
            ..Self::new(name, ArgKind::DeviceQueue)
        }
    }

    pub fn accelerator(name: impl Into<String>, patch: PatchLocation) -> Self {
        Self {
            patches: vec![patch],
            ..Self::new(name, ArgKind::Accelerator)
        }
    }

    pub fn svm(name: impl Into<String>, patch: PatchLocation) -> Self {
        Self {
            address_space: AddressSpace::Global,
            patches: vec![patch],
            ..Self::new(name, ArgKind::Svm)
        }
    }

    pub fn with_patch(mut self, patch: PatchLocation) -> Self {
        self.patches.push(patch);
        self
    }

    pub fn with_element(mut self, source_offset: u32, patch: PatchLocation) -> Self {
        self.value_elements.push(ValueElement {
            source_offset,
            patch,
        });
        self
    }

    pub fn with_buffer_offset_patch(mut self, patch: PatchLocation) -> Self {
        self.buffer_offset_patch = Some(patch);
        self
    }

    pub fn with_image_patches(mut self, patches: ImagePatches) -> Self {
        self.image_patches = patches;
        self
    }

    pub fn with_descriptor_offset(mut self, offset: u32) -> Self {
        self.descriptor_table_offset = Some(offset);
        self
    }

    pub fn with_access(mut self, access: AccessQualifier) -> Self {
        self.access = access;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Every parameter-block location this argument writes
    fn all_patches(&self) -> impl Iterator<Item = PatchLocation> + '_ {
        self.patches
            .iter()
            .copied()
            .chain(self.value_elements.iter().map(|e| e.patch))
            .chain(self.buffer_offset_patch)
            .chain(self.image_patches.iter())
    }

    fn record_size(&self) -> u32 {
        match self.kind {
            ArgKind::Sampler => SAMPLER_STATE_SIZE,
            _ => SURFACE_STATE_SIZE,
        }
    }
}

/// Parameter-block offsets of work-item built-ins, one 4-byte value each
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchTraits {
    pub global_offset: [Option<u32>; 3],
    pub global_size: [Option<u32>; 3],
    pub local_size: [Option<u32>; 3],
    pub enqueued_local_size: [Option<u32>; 3],
    pub num_groups: [Option<u32>; 3],
    pub work_dim: Option<u32>,
}

impl DispatchTraits {
    fn named(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        let triples = [
            ("global_offset", &self.global_offset),
            ("global_size", &self.global_size),
            ("local_size", &self.local_size),
            ("enqueued_local_size", &self.enqueued_local_size),
            ("num_groups", &self.num_groups),
        ];
        triples
            .into_iter()
            .flat_map(|(name, offsets)| offsets.iter().flatten().map(move |&o| (name, o)))
            .chain(self.work_dim.map(|o| ("work_dim", o)))
    }
}

/// Pointer patches for driver-allocated surfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImplicitSurfaces {
    pub private_memory: Option<PatchLocation>,
    pub printf_buffer: Option<PatchLocation>,
    pub constant_surface: Option<PatchLocation>,
    pub global_surface: Option<PatchLocation>,
}

impl ImplicitSurfaces {
    fn named(&self) -> impl Iterator<Item = (&'static str, PatchLocation)> {
        [
            ("private_memory", self.private_memory),
            ("printf_buffer", self.printf_buffer),
            ("constant_surface", self.constant_surface),
            ("global_surface", self.global_surface),
        ]
        .into_iter()
        .filter_map(|(name, patch)| patch.map(|p| (name, p)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelFlags {
    pub uses_descriptor_table: bool,
    pub has_device_enqueue: bool,
    pub has_printf: bool,
    pub allows_non_uniform_work_groups: bool,
    pub uses_barriers: bool,
}

/// Immutable description of a compiled kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub name: String,
    pub args: Vec<ArgDescriptor>,
    pub required_work_group_size: Option<[u32; 3]>,
    /// Kernel-specific work-group limit; 0 defers to the device limit
    pub max_work_group_size: u32,
    pub simd: SimdSize,
    /// Cross-thread data size in bytes
    pub parameter_block_size: u32,
    pub descriptor_table_size: u32,
    pub descriptor_table_template: Vec<u8>,
    pub binding_table_offset: u32,
    pub binding_table_count: u32,
    /// Static shared local memory in bytes
    pub shared_memory_size: u32,
    /// Per-thread scratch space in bytes
    pub scratch_size: u32,
    /// Per-work-item private memory in bytes
    pub private_memory_size: u32,
    pub constant_data: Option<Vec<u8>>,
    pub global_data: Option<Vec<u8>>,
    pub isa: Vec<u8>,
    pub shader_hash: u64,
    pub flags: KernelFlags,
    pub traits: DispatchTraits,
    pub implicit: ImplicitSurfaces,
}

impl KernelDescriptor {
    pub fn builder(name: impl Into<String>) -> KernelDescriptorBuilder {
        KernelDescriptorBuilder::new(name)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Number of general registers the parameter block occupies per thread
    pub fn cross_thread_registers(&self, grf_size: u32) -> u32 {
        self.parameter_block_size.div_ceil(grf_size)
    }

    /// Effective work-group limit given the device's
    pub fn work_group_limit(&self, device_limit: u32) -> u32 {
        match self.max_work_group_size {
            0 => device_limit,
            kernel => kernel.min(device_limit),
        }
    }

    pub fn sampler_count(&self) -> u32 {
        self.args.iter().filter(|a| a.kind == ArgKind::Sampler).count() as u32
    }

    /// First binding-table slot not claimed by an argument surface
    pub fn free_binding_table_index(&self) -> u32 {
        self.args
            .iter()
            .filter(|arg| arg.kind != ArgKind::Sampler && arg.descriptor_table_offset.is_some())
            .count() as u32
    }
}

/// Fluent builder for [`KernelDescriptor`]
#[derive(Debug, Clone)]
pub struct KernelDescriptorBuilder {
    descriptor: KernelDescriptor,
    simd_width: u32,
    template: Option<Vec<u8>>,
}

impl KernelDescriptorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: KernelDescriptor {
                name: name.into(),
                args: Vec::new(),
                required_work_group_size: None,
                max_work_group_size: 0,
                simd: SimdSize::Simd8,
                parameter_block_size: 0,
                descriptor_table_size: 0,
                descriptor_table_template: Vec::new(),
                binding_table_offset: 0,
                binding_table_count: 0,
                shared_memory_size: 0,
                scratch_size: 0,
                private_memory_size: 0,
                constant_data: None,
                global_data: None,
                isa: Vec::new(),
                shader_hash: 0,
                flags: KernelFlags::default(),
                traits: DispatchTraits::default(),
                implicit: ImplicitSurfaces::default(),
            },
            simd_width: 8,
            template: None,
        }
    }

    pub fn with_arg(mut self, arg: ArgDescriptor) -> Self {
        self.descriptor.args.push(arg);
        self
    }

    pub fn with_simd_width(mut self, width: u32) -> Self {
        self.simd_width = width;
        self
    }

    pub fn with_parameter_block_size(mut self, size: u32) -> Self {
        self.descriptor.parameter_block_size = size;
        self
    }

    pub fn with_required_work_group_size(mut self, size: [u32; 3]) -> Self {
        self.descriptor.required_work_group_size = Some(size);
        self
    }

    pub fn with_max_work_group_size(mut self, size: u32) -> Self {
        self.descriptor.max_work_group_size = size;
        self
    }

    /// Enable the descriptor table with its total size and binding table placement
    pub fn with_descriptor_table(mut self, size: u32, binding_table_offset: u32, entries: u32) -> Self {
        self.descriptor.flags.uses_descriptor_table = true;
        self.descriptor.descriptor_table_size = size;
        self.descriptor.binding_table_offset = binding_table_offset;
        self.descriptor.binding_table_count = entries;
        self
    }

    /// Initial descriptor-table contents; must match the table size
    pub fn with_descriptor_table_template(mut self, template: Vec<u8>) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_shared_memory_size(mut self, size: u32) -> Self {
        self.descriptor.shared_memory_size = size;
        self
    }

    pub fn with_scratch_size(mut self, size: u32) -> Self {
        self.descriptor.scratch_size = size;
        self
    }

    pub fn with_private_memory_size(mut self, size: u32) -> Self {
        self.descriptor.private_memory_size = size;
        self
    }

    pub fn with_constant_data(mut self, data: Vec<u8>) -> Self {
        self.descriptor.constant_data = Some(data);
        self
    }

    pub fn with_global_data(mut self, data: Vec<u8>) -> Self {
        self.descriptor.global_data = Some(data);
        self
    }

    pub fn with_isa(mut self, isa: Vec<u8>, shader_hash: u64) -> Self {
        self.descriptor.isa = isa;
        self.descriptor.shader_hash = shader_hash;
        self
    }

    pub fn with_flags(mut self, flags: KernelFlags) -> Self {
        let uses_table = self.descriptor.flags.uses_descriptor_table;
        self.descriptor.flags = KernelFlags {
            uses_descriptor_table: flags.uses_descriptor_table || uses_table,
            ..flags
        };
        self
    }

    pub fn allow_non_uniform_work_groups(mut self) -> Self {
        self.descriptor.flags.allows_non_uniform_work_groups = true;
        self
    }

    pub fn with_dispatch_traits(mut self, traits: DispatchTraits) -> Self {
        self.descriptor.traits = traits;
        self
    }

    pub fn with_implicit_surfaces(mut self, implicit: ImplicitSurfaces) -> Self {
        self.descriptor.implicit = implicit;
        self
    }

    /// Validate every offset and freeze the descriptor
    pub fn build(self) -> Result<Arc<KernelDescriptor>, DescriptorError> {
        let mut descriptor = self.descriptor;
        descriptor.simd = SimdSize::from_width(self.simd_width)
            .ok_or(DescriptorError::InvalidSimdWidth(self.simd_width))?;

        if let Some(required) = descriptor.required_work_group_size {
            if required.contains(&0) {
                return Err(DescriptorError::InvalidRequiredWorkGroupSize(required));
            }
        }

        let scratch_limit = HardwareFamily::ALL
            .iter()
            .map(|family| family.max_scratch_size())
            .max()
            .unwrap_or(0);
        if descriptor.scratch_size > scratch_limit {
            return Err(DescriptorError::ScratchTooLarge {
                size: descriptor.scratch_size,
                limit: scratch_limit,
            });
        }

        let limit = descriptor.parameter_block_size;
        for arg in &descriptor.args {
            validate_arg(arg, limit)?;
        }
        for (name, offset) in descriptor.traits.named() {
            if !fits(offset.checked_add(4), limit) {
                return Err(DescriptorError::TraitOutOfBounds { name, offset, limit });
            }
        }
        for (name, patch) in descriptor.implicit.named() {
            if !fits(patch.end(), limit) || !matches!(patch.size, 4 | 8) {
                return Err(DescriptorError::TraitOutOfBounds {
                    name,
                    offset: patch.offset,
                    limit,
                });
            }
        }

        if descriptor.flags.uses_descriptor_table {
            validate_table(&descriptor)?;
            descriptor.descriptor_table_template = match self.template {
                Some(template) => {
                    if template.len() != descriptor.descriptor_table_size as usize {
                        return Err(DescriptorError::TemplateSizeMismatch {
                            expected: descriptor.descriptor_table_size as usize,
                            found: template.len(),
                        });
                    }
                    template
                }
                None => default_template(&descriptor),
            };
        }

        log::debug!(
            "built kernel descriptor '{}': {} args, {} byte parameter block, SIMD{}",
            descriptor.name,
            descriptor.args.len(),
            descriptor.parameter_block_size,
            descriptor.simd.width()
        );
        Ok(Arc::new(descriptor))
    }
}

fn fits(end: Option<u32>, limit: u32) -> bool {
    end.is_some_and(|end| end <= limit)
}

fn validate_arg(arg: &ArgDescriptor, limit: u32) -> Result<(), DescriptorError> {
    for patch in arg.all_patches() {
        if patch.size == 0 || patch.size > 8 || !fits(patch.end(), limit) {
            return Err(DescriptorError::PatchOutOfBounds {
                arg: arg.name.clone(),
                offset: patch.offset,
                size: patch.size,
                limit,
            });
        }
    }
    if arg.kind.is_pointer() {
        if let Some(patch) = arg.patches.iter().find(|p| !matches!(p.size, 4 | 8)) {
            return Err(DescriptorError::InvalidPointerSize {
                arg: arg.name.clone(),
                size: patch.size,
            });
        }
    }
    if arg.kind == ArgKind::Value {
        let overflows = arg
            .value_elements
            .iter()
            .any(|e| !fits(e.source_offset.checked_add(e.patch.size), arg.value_size));
        if overflows {
            return Err(DescriptorError::InvalidValueElement {
                arg: arg.name.clone(),
                size: arg.value_size,
            });
        }
    }
    if arg.kind == ArgKind::Local && !arg.local_alignment.is_power_of_two() {
        return Err(DescriptorError::InvalidAlignment {
            arg: arg.name.clone(),
            alignment: arg.local_alignment,
        });
    }
    Ok(())
}

fn validate_table(descriptor: &KernelDescriptor) -> Result<(), DescriptorError> {
    let table_size = descriptor.descriptor_table_size;
    for arg in &descriptor.args {
        let Some(offset) = arg.descriptor_table_offset else {
            continue;
        };
        if offset % 64 != 0 {
            return Err(DescriptorError::MisalignedDescriptorOffset {
                arg: arg.name.clone(),
                offset,
            });
        }
        if !fits(offset.checked_add(arg.record_size()), table_size) {
            return Err(DescriptorError::DescriptorOffsetOutOfBounds {
                arg: arg.name.clone(),
                offset,
                limit: table_size,
            });
        }
    }

    let bt_offset = descriptor.binding_table_offset;
    if bt_offset % 32 != 0 {
        return Err(DescriptorError::MisalignedBindingTable(bt_offset));
    }
    let bt_end = descriptor
        .binding_table_count
        .checked_mul(4)
        .and_then(|len| bt_offset.checked_add(len));
    if !fits(bt_end, table_size) {
        return Err(DescriptorError::BindingTableOutOfBounds {
            offset: bt_offset,
            count: descriptor.binding_table_count,
            limit: table_size,
        });
    }
    Ok(())
}

/// Zeroed table whose binding table points at each argument's surface record
/// in declaration order
fn default_template(descriptor: &KernelDescriptor) -> Vec<u8> {
    let mut table = vec![0u8; descriptor.descriptor_table_size as usize];
    let surfaces = descriptor
        .args
        .iter()
        .filter(|arg| arg.kind != ArgKind::Sampler)
        .filter_map(|arg| arg.descriptor_table_offset)
        .take(descriptor.binding_table_count as usize);
    for (slot, offset) in surfaces.enumerate() {
        let at = descriptor.binding_table_offset as usize + slot * 4;
        let entry = binding_table_entry(offset as u64);
        table[at..at + 4].copy_from_slice(&entry.to_le_bytes());
    }
    table
}
