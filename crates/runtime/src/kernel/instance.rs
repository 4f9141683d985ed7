//! Kernel instances: per-kernel argument state
//!
//! An instance owns a private parameter block and descriptor table, one
//! binding record per argument, and a shared handle to the kernel's
//! driver-allocated resources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anvil_packets::HardwareFamily;

use super::descriptor::{ArgKind, KernelDescriptor, PatchLocation};
use crate::error::{AllocationError, BindError, EnqueueError};
use crate::memory::{Allocation, AllocationKind, AllocationRegistry, ContextId};

/// Bounds-checked byte region patched by offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBuffer {
    bytes: Vec<u8>,
}

impl PatchBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn check(&self, offset: usize, size: usize) -> Result<(), BindError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(BindError::PatchOutOfBounds {
                offset,
                size,
                limit: self.bytes.len(),
            }),
        }
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), BindError> {
        self.check(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: usize, size: usize) -> Result<&[u8], BindError> {
        self.check(offset, size)?;
        Ok(&self.bytes[offset..offset + size])
    }

    /// Write the low `patch.size` bytes of `value`
    pub fn write_patch(&mut self, patch: PatchLocation, value: u64) -> Result<(), BindError> {
        let bytes = value.to_le_bytes();
        self.write(patch.offset as usize, &bytes[..(patch.size as usize).min(8)])
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, BindError> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, BindError> {
        let bytes = self.read(offset, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Region {
    ParameterBlock,
    DescriptorTable,
}

/// Writes collected by a bind and applied only once all are in bounds
#[derive(Debug, Default)]
pub(crate) struct StagedWrites {
    writes: Vec<(Region, usize, Vec<u8>)>,
}

impl StagedWrites {
    pub(crate) fn push(&mut self, region: Region, offset: usize, bytes: Vec<u8>) {
        self.writes.push((region, offset, bytes));
    }

    pub(crate) fn patch(&mut self, patch: PatchLocation, value: u64) {
        let bytes = value.to_le_bytes()[..(patch.size as usize).min(8)].to_vec();
        self.push(Region::ParameterBlock, patch.offset as usize, bytes);
    }

    fn validate(&self, parameter_block: &PatchBuffer, table: &PatchBuffer) -> Result<(), BindError> {
        for (region, offset, bytes) in &self.writes {
            let target = match region {
                Region::ParameterBlock => parameter_block,
                Region::DescriptorTable => table,
            };
            target.check(*offset, bytes.len())?;
        }
        Ok(())
    }

    fn apply(self, parameter_block: &mut PatchBuffer, table: &mut PatchBuffer) -> Result<(), BindError> {
        for (region, offset, bytes) in self.writes {
            let target = match region {
                Region::ParameterBlock => &mut *parameter_block,
                Region::DescriptorTable => &mut *table,
            };
            target.write(offset, &bytes)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BoundKind {
    #[default]
    None,
    Buffer,
    Image,
    Sampler,
    Local,
    Value,
    SvmPointer,
    SvmAllocation,
    DeviceQueue,
    Pipe,
    Accelerator,
}

/// Binding record of one argument
#[derive(Debug, Clone, Default)]
pub struct ArgBinding {
    pub kind: BoundKind,
    /// Weak reference to the bound object's memory
    pub allocation: Option<Weak<Allocation>>,
    /// Device address, or the assigned offset for local arguments
    pub address: u64,
    pub size: u64,
    pub bound: bool,
}

impl ArgBinding {
    pub fn is_bound(&self) -> bool {
        self.bound
    }
}

static NEXT_KERNEL: AtomicU64 = AtomicU64::new(1);

/// Driver-allocated memory of one kernel, shared by all clones of an instance
#[derive(Debug)]
pub struct KernelResources {
    kernel_id: u64,
    registry: Arc<AllocationRegistry>,
    isa: Arc<Allocation>,
    private_surface: Option<Arc<Allocation>>,
    printf_buffer: Option<Arc<Allocation>>,
    constant_surface: Option<Arc<Allocation>>,
    global_surface: Option<Arc<Allocation>>,
}

impl KernelResources {
    /// Allocate and fill the kernel's ISA and implicit surfaces
    ///
    /// `isa` may differ from the descriptor's when instrumentation replaced it.
    pub(crate) fn create(
        registry: &Arc<AllocationRegistry>,
        descriptor: &KernelDescriptor,
        isa: &[u8],
        hw_threads: u32,
        printf_size: u64,
    ) -> Result<Self, AllocationError> {
        let allocate_with = |data: &[u8], kind| -> Result<Arc<Allocation>, AllocationError> {
            let allocation = registry.allocate((data.len() as u64).max(64), 64, kind)?;
            allocation.write(0, data)?;
            Ok(allocation)
        };

        let isa = allocate_with(isa, AllocationKind::KernelInstructions)?;
        let mut resources = Self {
            kernel_id: NEXT_KERNEL.fetch_add(1, Ordering::Relaxed),
            registry: Arc::clone(registry),
            isa,
            private_surface: None,
            printf_buffer: None,
            constant_surface: None,
            global_surface: None,
        };
        // on early return, Drop releases whatever was allocated so far
        if descriptor.private_memory_size > 0 {
            let size = descriptor.private_memory_size as u64
                * descriptor.simd.width() as u64
                * hw_threads as u64;
            resources.private_surface =
                Some(registry.allocate(size, 4096, AllocationKind::PrivateSurface)?);
        }
        if descriptor.flags.has_printf {
            let printf = registry.allocate(printf_size, 64, AllocationKind::PrintfBuffer)?;
            // first dword holds the write offset, starting past itself
            printf.write(0, &4u32.to_le_bytes())?;
            resources.printf_buffer = Some(printf);
        }
        if let Some(data) = &descriptor.constant_data {
            resources.constant_surface = Some(allocate_with(data, AllocationKind::ConstantSurface)?);
        }
        if let Some(data) = &descriptor.global_data {
            resources.global_surface = Some(allocate_with(data, AllocationKind::GlobalSurface)?);
        }
        Ok(resources)
    }

    pub fn kernel_id(&self) -> u64 {
        self.kernel_id
    }

    pub fn isa(&self) -> &Arc<Allocation> {
        &self.isa
    }

    pub fn private_surface(&self) -> Option<&Arc<Allocation>> {
        self.private_surface.as_ref()
    }

    pub fn printf_buffer(&self) -> Option<&Arc<Allocation>> {
        self.printf_buffer.as_ref()
    }

    pub fn constant_surface(&self) -> Option<&Arc<Allocation>> {
        self.constant_surface.as_ref()
    }

    pub fn global_surface(&self) -> Option<&Arc<Allocation>> {
        self.global_surface.as_ref()
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        std::iter::once(&self.isa)
            .chain(self.private_surface.as_ref())
            .chain(self.printf_buffer.as_ref())
            .chain(self.constant_surface.as_ref())
            .chain(self.global_surface.as_ref())
    }
}

impl Drop for KernelResources {
    fn drop(&mut self) {
        for allocation in self.allocations() {
            if let Err(err) = self.registry.release(allocation) {
                log::warn!("releasing kernel resource {:?}: {err}", allocation.id());
            }
        }
    }
}

/// A kernel with its argument bindings
///
/// Cloning snapshots the argument state; clones share the kernel's
/// resources.
#[derive(Debug, Clone)]
pub struct KernelInstance {
    pub(crate) descriptor: Arc<KernelDescriptor>,
    pub(crate) context: ContextId,
    pub(crate) family: HardwareFamily,
    pub(crate) resources: Arc<KernelResources>,
    pub(crate) parameter_block: PatchBuffer,
    pub(crate) descriptor_table: PatchBuffer,
    pub(crate) bindings: Vec<ArgBinding>,
    pub(crate) shared_memory_size: u32,
    pub(crate) dispatch_ready: bool,
}

impl KernelInstance {
    pub(crate) fn new(
        descriptor: Arc<KernelDescriptor>,
        context: ContextId,
        family: HardwareFamily,
        resources: Arc<KernelResources>,
    ) -> Result<Self, BindError> {
        let mut parameter_block = PatchBuffer::new(descriptor.parameter_block_size as usize);
        let implicit = descriptor.implicit;
        let surfaces = [
            (implicit.private_memory, resources.private_surface()),
            (implicit.printf_buffer, resources.printf_buffer()),
            (implicit.constant_surface, resources.constant_surface()),
            (implicit.global_surface, resources.global_surface()),
        ];
        for (patch, allocation) in surfaces {
            if let (Some(patch), Some(allocation)) = (patch, allocation) {
                parameter_block.write_patch(patch, allocation.gpu_address())?;
            }
        }

        let descriptor_table = if descriptor.flags.uses_descriptor_table {
            PatchBuffer::from_bytes(descriptor.descriptor_table_template.clone())
        } else {
            PatchBuffer::new(0)
        };

        let mut instance = Self {
            bindings: vec![ArgBinding::default(); descriptor.args.len()],
            shared_memory_size: round_up(
                descriptor.shared_memory_size,
                family.shared_memory_granularity(),
            ),
            descriptor,
            context,
            family,
            resources,
            parameter_block,
            descriptor_table,
            dispatch_ready: false,
        };
        instance.update_dispatch_ready();
        Ok(instance)
    }

    pub fn descriptor(&self) -> &Arc<KernelDescriptor> {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn family(&self) -> HardwareFamily {
        self.family
    }

    pub fn resources(&self) -> &Arc<KernelResources> {
        &self.resources
    }

    pub fn kernel_id(&self) -> u64 {
        self.resources.kernel_id()
    }

    pub fn parameter_block(&self) -> &PatchBuffer {
        &self.parameter_block
    }

    pub fn descriptor_table(&self) -> &PatchBuffer {
        &self.descriptor_table
    }

    pub fn binding(&self, index: usize) -> Option<&ArgBinding> {
        self.bindings.get(index)
    }

    /// Total shared local memory per work-group, rounded to the allocation granularity
    pub fn shared_memory_size(&self) -> u32 {
        self.shared_memory_size
    }

    pub fn is_dispatch_ready(&self) -> bool {
        self.dispatch_ready
    }

    /// Indices of required arguments that are not bound
    pub fn missing_args(&self) -> Vec<usize> {
        self.descriptor
            .args
            .iter()
            .zip(&self.bindings)
            .enumerate()
            .filter(|(_, (arg, binding))| !arg.optional && !binding.bound)
            .map(|(index, _)| index)
            .collect()
    }

    pub(crate) fn update_dispatch_ready(&mut self) {
        self.dispatch_ready = self.missing_args().is_empty();
    }

    pub(crate) fn commit(&mut self, staged: StagedWrites) -> Result<(), BindError> {
        staged.validate(&self.parameter_block, &self.descriptor_table)?;
        staged.apply(&mut self.parameter_block, &mut self.descriptor_table)
    }

    /// Every allocation a dispatch of this instance touches
    ///
    /// Fails if a bound object's memory has been released since binding.
    pub fn referenced_allocations(&self) -> Result<Vec<Arc<Allocation>>, EnqueueError> {
        let mut allocations: Vec<Arc<Allocation>> = self.resources.allocations().cloned().collect();
        for (index, binding) in self.bindings.iter().enumerate() {
            let Some(weak) = &binding.allocation else {
                continue;
            };
            match weak.upgrade() {
                Some(allocation) if !allocation.is_released() => {
                    if !allocations.iter().any(|a| a.id() == allocation.id()) {
                        allocations.push(allocation);
                    }
                }
                _ => return Err(EnqueueError::ArgumentReleased { index }),
            }
        }
        Ok(allocations)
    }

    /// Number of local arguments currently bound
    pub fn bound_locals(&self) -> usize {
        self.descriptor
            .args
            .iter()
            .zip(&self.bindings)
            .filter(|(arg, binding)| arg.kind == ArgKind::Local && binding.bound)
            .count()
    }
}

pub(crate) fn round_up(value: u32, granularity: u32) -> u32 {
    if granularity == 0 {
        value
    } else {
        value.div_ceil(granularity) * granularity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::descriptor::{AddressSpace, ArgDescriptor, ImplicitSurfaces};

    #[test]
    fn test_patch_buffer_bounds() {
        let mut block = PatchBuffer::new(16);
        block.write_patch(PatchLocation::new(12, 4), 0xDEAD_BEEF).unwrap();
        assert_eq!(block.read_u32(12).unwrap(), 0xDEAD_BEEF);
        assert_eq!(
            block.write(14, &[0; 4]).unwrap_err(),
            BindError::PatchOutOfBounds {
                offset: 14,
                size: 4,
                limit: 16
            }
        );
    }

    #[test]
    fn test_staged_writes_are_atomic() {
        let mut block = PatchBuffer::new(8);
        let mut table = PatchBuffer::new(0);
        let mut staged = StagedWrites::default();
        staged.push(Region::ParameterBlock, 0, vec![1; 4]);
        staged.push(Region::DescriptorTable, 0, vec![1; 4]);
        assert!(staged.validate(&block, &table).is_err());
        assert_eq!(block.as_bytes(), &[0; 8]);

        let mut staged = StagedWrites::default();
        staged.patch(PatchLocation::new(4, 4), 7);
        staged.validate(&block, &table).unwrap();
        staged.apply(&mut block, &mut table).unwrap();
        assert_eq!(block.read_u32(4).unwrap(), 7);
    }

    #[test]
    fn test_implicit_surfaces_patched_at_creation() {
        let registry = Arc::new(AllocationRegistry::with_address_space(0x1_0000, 0x100_0000));
        let descriptor = KernelDescriptor::builder("k")
            .with_parameter_block_size(32)
            .with_arg(ArgDescriptor::buffer("a", AddressSpace::Global, PatchLocation::new(0, 8)))
            .with_private_memory_size(16)
            .with_constant_data(vec![1, 2, 3, 4])
            .with_implicit_surfaces(ImplicitSurfaces {
                private_memory: Some(PatchLocation::new(16, 8)),
                constant_surface: Some(PatchLocation::new(24, 8)),
                ..Default::default()
            })
            .build()
            .unwrap();
        let resources = Arc::new(
            KernelResources::create(&registry, &descriptor, &[0xAB; 16], 4, 1024).unwrap(),
        );
        let instance = KernelInstance::new(
            Arc::clone(&descriptor),
            ContextId(1),
            HardwareFamily::Gen12Lp,
            Arc::clone(&resources),
        )
        .unwrap();

        let private = resources.private_surface().unwrap();
        assert_eq!(private.size(), 16 * 8 * 4);
        assert_eq!(instance.parameter_block().read_u64(16).unwrap(), private.gpu_address());
        let constant = resources.constant_surface().unwrap();
        assert_eq!(constant.read(0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(instance.parameter_block().read_u64(24).unwrap(), constant.gpu_address());
        assert_eq!(resources.isa().read(0, 2).unwrap(), vec![0xAB, 0xAB]);

        assert!(!instance.is_dispatch_ready());
        assert_eq!(instance.missing_args(), vec![0]);

        drop(instance);
        let live_before = registry.stats().live_allocations;
        drop(resources);
        assert_eq!(registry.stats().live_allocations, live_before - 3);
    }
}
