//! Argument binding
//!
//! `set_arg` validates the supplied object against the argument's metadata,
//! stages every parameter-block and descriptor-table write, checks them all,
//! and only then commits. A failed bind therefore changes nothing.

use std::sync::Arc;

use anvil_packets::prelude::SurfaceStateFields;

use super::descriptor::{AccessQualifier, AddressSpace, ArgDescriptor, ArgKind, PatchLocation};
use super::instance::{ArgBinding, BoundKind, KernelInstance, Region, StagedWrites, round_up};
use crate::error::BindError;
use crate::memory::objects::buffer_surface;
use crate::memory::{
    Accelerator, Allocation, Buffer, ContextId, DeviceQueue, Image, MemoryAccess, Pipe, Sampler,
    SvmRegion,
};

/// Value supplied for one kernel argument
#[derive(Debug, Clone, Copy)]
pub enum ArgValue<'a> {
    /// Buffer object; `None` binds a null pointer
    Buffer(Option<&'a Buffer>),
    Image(&'a Image),
    Sampler(&'a Sampler),
    /// Size in bytes of a dynamically sized shared-memory argument
    Local(u32),
    /// Raw bytes of a by-value argument
    Value(&'a [u8]),
    Pipe(&'a Pipe),
    DeviceQueue(&'a DeviceQueue),
    Accelerator(&'a Accelerator),
    /// Pointer into an SVM region
    SvmPointer { region: &'a SvmRegion, offset: u64 },
    /// Whole SVM region
    SvmAllocation(&'a SvmRegion),
}

impl ArgValue<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            ArgValue::Buffer(_) => "buffer",
            ArgValue::Image(_) => "image",
            ArgValue::Sampler(_) => "sampler",
            ArgValue::Local(_) => "local",
            ArgValue::Value(_) => "value",
            ArgValue::Pipe(_) => "pipe",
            ArgValue::DeviceQueue(_) => "device queue",
            ArgValue::Accelerator(_) => "accelerator",
            ArgValue::SvmPointer { .. } => "svm pointer",
            ArgValue::SvmAllocation(_) => "svm allocation",
        }
    }
}

/// Memory-backed object resolved for binding
struct Target<'a> {
    context: ContextId,
    allocation: &'a Arc<Allocation>,
    address: u64,
    size: u64,
    kind: BoundKind,
}

impl KernelInstance {
    /// Bind `value` to argument `index`
    pub fn set_arg(&mut self, index: usize, value: ArgValue<'_>) -> Result<(), BindError> {
        let descriptor = Arc::clone(&self.descriptor);
        let count = descriptor.args.len();
        let arg = descriptor
            .args
            .get(index)
            .ok_or(BindError::InvalidIndex { index, count })?;

        let mismatch = || BindError::KindMismatch {
            index,
            expected: arg.kind,
            found: value.name(),
        };

        let mut staged = StagedWrites::default();
        let binding = match (arg.kind, value) {
            (ArgKind::Local, ArgValue::Local(size)) => {
                return self.bind_local(index, size);
            }
            (ArgKind::Value, ArgValue::Value(bytes)) => {
                self.stage_value(index, arg, bytes, &mut staged)?
            }
            (ArgKind::Sampler, ArgValue::Sampler(sampler)) => {
                self.stage_sampler(index, arg, sampler, &mut staged)?
            }
            (ArgKind::Buffer | ArgKind::Svm, ArgValue::Buffer(None)) => {
                self.stage_null_buffer(index, arg, &mut staged)?
            }
            (ArgKind::Buffer | ArgKind::Svm, ArgValue::Buffer(Some(buffer))) => {
                let target = Target {
                    context: buffer.context(),
                    allocation: buffer.allocation(),
                    address: buffer.gpu_address(),
                    size: buffer.size(),
                    kind: BoundKind::Buffer,
                };
                self.stage_pointer(index, arg, target, &mut staged)?
            }
            (ArgKind::Buffer | ArgKind::Svm, ArgValue::SvmPointer { region, offset }) => {
                if offset >= region.size() {
                    return Err(BindError::InvalidSvmOffset { index, offset });
                }
                let target = Target {
                    context: region.context(),
                    allocation: region.allocation(),
                    address: region.gpu_address() + offset,
                    size: region.size() - offset,
                    kind: BoundKind::SvmPointer,
                };
                self.stage_pointer(index, arg, target, &mut staged)?
            }
            (ArgKind::Buffer | ArgKind::Svm, ArgValue::SvmAllocation(region)) => {
                let target = Target {
                    context: region.context(),
                    allocation: region.allocation(),
                    address: region.gpu_address(),
                    size: region.size(),
                    kind: BoundKind::SvmAllocation,
                };
                self.stage_pointer(index, arg, target, &mut staged)?
            }
            (ArgKind::Image, ArgValue::Image(image)) => {
                self.stage_image(index, arg, image, &mut staged)?
            }
            (ArgKind::Pipe, ArgValue::Pipe(pipe)) => {
                check_access(index, arg.access, pipe.access())?;
                let target = Target {
                    context: pipe.context(),
                    allocation: pipe.allocation(),
                    address: pipe.gpu_address(),
                    size: pipe.allocation().size(),
                    kind: BoundKind::Pipe,
                };
                self.stage_pointer(index, arg, target, &mut staged)?
            }
            (ArgKind::DeviceQueue, ArgValue::DeviceQueue(queue)) => {
                let target = Target {
                    context: queue.context(),
                    allocation: queue.allocation(),
                    address: queue.gpu_address(),
                    size: queue.allocation().size(),
                    kind: BoundKind::DeviceQueue,
                };
                self.stage_pointer(index, arg, target, &mut staged)?
            }
            (ArgKind::Accelerator, ArgValue::Accelerator(accelerator)) => {
                let target = Target {
                    context: accelerator.context(),
                    allocation: accelerator.allocation(),
                    address: accelerator.gpu_address(),
                    size: accelerator.allocation().size(),
                    kind: BoundKind::Accelerator,
                };
                self.stage_pointer(index, arg, target, &mut staged)?
            }
            _ => return Err(mismatch()),
        };

        self.commit(staged)?;
        log::trace!(
            "kernel '{}': bound arg {index} ({}) as {:?} at {:#x}",
            descriptor.name,
            arg.name,
            binding.kind,
            binding.address
        );
        self.bindings[index] = binding;
        self.update_dispatch_ready();
        Ok(())
    }

    /// Clear the binding of argument `index`
    pub fn unset_arg(&mut self, index: usize) -> Result<(), BindError> {
        let count = self.bindings.len();
        if index >= count {
            return Err(BindError::InvalidIndex { index, count });
        }
        if self.descriptor.args[index].kind == ArgKind::Local {
            let layout = self.local_walk(index, None)?;
            self.apply_local_layout(layout)?;
        }
        self.bindings[index] = ArgBinding::default();
        self.update_dispatch_ready();
        Ok(())
    }

    /// Bind a driver-owned allocation to a pointer argument
    pub(crate) fn set_arg_allocation(&mut self, index: usize, allocation: &Arc<Allocation>) -> Result<(), BindError> {
        let descriptor = Arc::clone(&self.descriptor);
        let count = descriptor.args.len();
        let arg = descriptor
            .args
            .get(index)
            .ok_or(BindError::InvalidIndex { index, count })?;
        if !matches!(arg.kind, ArgKind::Buffer | ArgKind::Svm) {
            return Err(BindError::KindMismatch {
                index,
                expected: arg.kind,
                found: "allocation",
            });
        }
        let target = Target {
            context: self.context,
            allocation,
            address: allocation.gpu_address(),
            size: allocation.size(),
            kind: BoundKind::Buffer,
        };
        let mut staged = StagedWrites::default();
        let binding = self.stage_pointer(index, arg, target, &mut staged)?;
        self.commit(staged)?;
        self.bindings[index] = binding;
        self.update_dispatch_ready();
        Ok(())
    }

    fn check_context(&self, index: usize, context: ContextId) -> Result<(), BindError> {
        if context != self.context {
            return Err(BindError::ContextMismatch { index });
        }
        Ok(())
    }

    fn uses_table(&self, arg: &ArgDescriptor) -> Option<u32> {
        if self.descriptor.flags.uses_descriptor_table {
            arg.descriptor_table_offset
        } else {
            None
        }
    }

    fn stage_value(
        &self,
        index: usize,
        arg: &ArgDescriptor,
        bytes: &[u8],
        staged: &mut StagedWrites,
    ) -> Result<ArgBinding, BindError> {
        if bytes.len() != arg.value_size as usize {
            return Err(BindError::SizeMismatch {
                index,
                expected: arg.value_size as usize,
                found: bytes.len(),
            });
        }
        for element in &arg.value_elements {
            let start = element.source_offset as usize;
            let end = start + element.patch.size as usize;
            staged.push(
                Region::ParameterBlock,
                element.patch.offset as usize,
                bytes[start..end].to_vec(),
            );
        }
        Ok(ArgBinding {
            kind: BoundKind::Value,
            allocation: None,
            address: 0,
            size: bytes.len() as u64,
            bound: true,
        })
    }

    fn stage_sampler(
        &self,
        index: usize,
        arg: &ArgDescriptor,
        sampler: &Sampler,
        staged: &mut StagedWrites,
    ) -> Result<ArgBinding, BindError> {
        self.check_context(index, sampler.context())?;
        for &patch in &arg.patches {
            staged.patch(patch, sampler.packed() as u64);
        }
        if let Some(offset) = self.uses_table(arg) {
            let record = self.family.encode_sampler_state(&sampler.sampler_state());
            staged.push(Region::DescriptorTable, offset as usize, record.to_bytes());
        }
        Ok(ArgBinding {
            kind: BoundKind::Sampler,
            allocation: None,
            address: sampler.packed() as u64,
            size: 0,
            bound: true,
        })
    }

    fn stage_pointer(
        &self,
        index: usize,
        arg: &ArgDescriptor,
        target: Target<'_>,
        staged: &mut StagedWrites,
    ) -> Result<ArgBinding, BindError> {
        self.check_context(index, target.context)?;
        if target.allocation.is_released() {
            return Err(BindError::Released { index });
        }
        stage_address(index, arg, target.address, staged)?;
        if let Some(offset) = self.uses_table(arg) {
            let surface = buffer_surface(
                target.address,
                target.size,
                target.allocation.is_coherent(),
            );
            let record = self.family.encode_surface_state(&surface);
            staged.push(Region::DescriptorTable, offset as usize, record.to_bytes());
        }
        Ok(ArgBinding {
            kind: target.kind,
            allocation: Some(Arc::downgrade(target.allocation)),
            address: target.address,
            size: target.size,
            bound: true,
        })
    }

    fn stage_image(
        &self,
        index: usize,
        arg: &ArgDescriptor,
        image: &Image,
        staged: &mut StagedWrites,
    ) -> Result<ArgBinding, BindError> {
        check_access(index, arg.access, image.access())?;
        self.check_context(index, image.context())?;
        if image.allocation().is_released() {
            return Err(BindError::Released { index });
        }
        for &patch in &arg.patches {
            stage_pointer_patch(index, patch, image.gpu_address(), staged)?;
        }
        let desc = image.descriptor();
        let patches = &arg.image_patches;
        let metadata = [
            (patches.width, desc.width),
            (patches.height, desc.height),
            (patches.depth, desc.depth),
            (patches.channel_order, desc.channel_order),
            (patches.channel_type, desc.channel_type),
            (patches.array_size, desc.array_size),
            (patches.mip_levels, desc.mip_levels),
        ];
        for (patch, value) in metadata {
            if let Some(patch) = patch {
                staged.patch(patch, value as u64);
            }
        }
        if let Some(offset) = self.uses_table(arg) {
            let record = self.family.encode_surface_state(&image.surface_state());
            staged.push(Region::DescriptorTable, offset as usize, record.to_bytes());
        }
        Ok(ArgBinding {
            kind: BoundKind::Image,
            allocation: Some(Arc::downgrade(image.allocation())),
            address: image.gpu_address(),
            size: image.allocation().size(),
            bound: true,
        })
    }

    fn bind_local(&mut self, index: usize, size: u32) -> Result<(), BindError> {
        if size == 0 {
            return Err(BindError::ZeroLocalSize { index });
        }
        let layout = self.local_walk(index, Some(size))?;
        self.apply_local_layout(layout)?;
        self.bindings[index].kind = BoundKind::Local;
        self.bindings[index].bound = true;
        self.update_dispatch_ready();
        log::trace!(
            "kernel '{}': local arg {index} = {size} bytes at {}, shared memory {}",
            self.descriptor.name,
            self.bindings[index].address,
            self.shared_memory_size
        );
        Ok(())
    }

    /// Lay out local arguments in declaration order
    ///
    /// Offsets before `changed` are kept; from `changed` onward every bound
    /// local is re-aligned and re-patched. `new_size` is the size for
    /// `changed` (`None` unbinds it).
    fn local_walk(&self, changed: usize, new_size: Option<u32>) -> Result<LocalLayout, BindError> {
        let mut layout = LocalLayout::default();
        let mut cursor = self.descriptor.shared_memory_size as u64;

        for (index, arg) in self.descriptor.args.iter().enumerate() {
            if arg.kind != ArgKind::Local {
                continue;
            }
            let binding = &self.bindings[index];
            let size = if index == changed {
                new_size.map(u64::from)
            } else {
                binding.bound.then_some(binding.size)
            };
            let Some(size) = size else {
                continue;
            };

            let offset = if index < changed {
                binding.address
            } else {
                let alignment = arg.local_alignment.max(1) as u64;
                let offset = cursor.div_ceil(alignment) * alignment;
                for &patch in &arg.patches {
                    layout.staged.patch(patch, offset);
                }
                layout.placed.push((index, offset, size));
                offset
            };
            cursor = offset + size;
        }

        let limit = self.family.max_shared_memory();
        if cursor > limit as u64 {
            return Err(BindError::SharedMemoryExceeded {
                requested: cursor.min(u32::MAX as u64) as u32,
                limit,
            });
        }
        layout.total = round_up(cursor as u32, self.family.shared_memory_granularity());
        Ok(layout)
    }

    fn apply_local_layout(&mut self, layout: LocalLayout) -> Result<(), BindError> {
        self.commit(layout.staged)?;
        for (index, offset, size) in layout.placed {
            let binding = &mut self.bindings[index];
            binding.address = offset;
            binding.size = size;
        }
        self.shared_memory_size = layout.total;
        Ok(())
    }

    fn stage_null_buffer(
        &self,
        index: usize,
        arg: &ArgDescriptor,
        staged: &mut StagedWrites,
    ) -> Result<ArgBinding, BindError> {
        if !matches!(arg.address_space, AddressSpace::Global | AddressSpace::Constant) {
            return Err(BindError::NullObject { index });
        }
        stage_address(index, arg, 0, staged)?;
        if let Some(offset) = self.uses_table(arg) {
            let record = self.family.encode_surface_state(&SurfaceStateFields::null());
            staged.push(Region::DescriptorTable, offset as usize, record.to_bytes());
        }
        Ok(ArgBinding {
            kind: BoundKind::Buffer,
            allocation: None,
            address: 0,
            size: 0,
            bound: true,
        })
    }
}

/// Result of a local-argument walk
#[derive(Default)]
struct LocalLayout {
    staged: StagedWrites,
    /// `(index, offset, size)` of every re-placed local
    placed: Vec<(usize, u64, u64)>,
    total: u32,
}

/// Stage the pointer patches of `arg`, splitting off the low bits when the
/// argument declares a buffer-offset patch
fn stage_address(
    index: usize,
    arg: &ArgDescriptor,
    address: u64,
    staged: &mut StagedWrites,
) -> Result<(), BindError> {
    let (pointer, remainder) = match arg.buffer_offset_patch {
        Some(_) => (address & !3, address & 3),
        None => (address, 0),
    };
    for &patch in &arg.patches {
        stage_pointer_patch(index, patch, pointer, staged)?;
    }
    if let Some(patch) = arg.buffer_offset_patch {
        staged.patch(patch, remainder);
    }
    Ok(())
}

fn stage_pointer_patch(
    index: usize,
    patch: PatchLocation,
    address: u64,
    staged: &mut StagedWrites,
) -> Result<(), BindError> {
    if patch.size == 4 && address > u32::MAX as u64 {
        return Err(BindError::PointerTooWide { index, address });
    }
    staged.patch(patch, address);
    Ok(())
}

fn check_access(index: usize, declared: AccessQualifier, supplied: MemoryAccess) -> Result<(), BindError> {
    let compatible = match declared {
        AccessQualifier::None => true,
        AccessQualifier::ReadOnly => supplied.can_read(),
        AccessQualifier::WriteOnly => supplied.can_write(),
        AccessQualifier::ReadWrite => supplied == MemoryAccess::ReadWrite,
    };
    if compatible {
        Ok(())
    } else {
        Err(BindError::AccessMismatch {
            index,
            declared: declared.name(),
            supplied: supplied.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::descriptor::KernelDescriptor;
    use crate::kernel::instance::KernelResources;
    use crate::memory::AllocationRegistry;
    use anvil_packets::HardwareFamily;
    use rstest::rstest;

    const CONTEXT: ContextId = ContextId(7);

    fn registry() -> Arc<AllocationRegistry> {
        Arc::new(AllocationRegistry::with_address_space(0x10_0000, 0x100_0000))
    }

    fn instance(registry: &Arc<AllocationRegistry>, descriptor: Arc<KernelDescriptor>) -> KernelInstance {
        let resources = KernelResources::create(registry, &descriptor, &[0; 16], 4, 256).unwrap();
        KernelInstance::new(descriptor, CONTEXT, HardwareFamily::Gen12Lp, Arc::new(resources)).unwrap()
    }

    fn buffer(registry: &Arc<AllocationRegistry>, context: ContextId, access: MemoryAccess) -> Buffer {
        Buffer::allocate(registry, context, 256, access).unwrap()
    }

    fn locals() -> Arc<KernelDescriptor> {
        KernelDescriptor::builder("locals")
            .with_parameter_block_size(16)
            .with_shared_memory_size(100)
            .with_arg(ArgDescriptor::local("a", PatchLocation::new(0, 4), 16))
            .with_arg(ArgDescriptor::local("b", PatchLocation::new(4, 4), 64))
            .build()
            .unwrap()
    }

    #[rstest]
    #[case::declaration_order([0, 1])]
    #[case::reverse_order([1, 0])]
    fn test_local_layout_independent_of_bind_order(#[case] order: [usize; 2]) {
        let registry = registry();
        let mut kernel = instance(&registry, locals());
        let sizes = [10, 20];
        for index in order {
            kernel.set_arg(index, ArgValue::Local(sizes[index])).unwrap();
        }
        // a: 100 aligned to 16, b: 122 aligned to 64
        assert_eq!(kernel.parameter_block().read_u32(0).unwrap(), 112);
        assert_eq!(kernel.parameter_block().read_u32(4).unwrap(), 128);
        assert_eq!(kernel.shared_memory_size(), 1024);
        assert_eq!(kernel.bound_locals(), 2);
        assert!(kernel.is_dispatch_ready());
    }

    #[test]
    fn test_resizing_local_moves_later_locals() {
        let registry = registry();
        let mut kernel = instance(&registry, locals());
        kernel.set_arg(0, ArgValue::Local(10)).unwrap();
        kernel.set_arg(1, ArgValue::Local(20)).unwrap();
        kernel.set_arg(0, ArgValue::Local(100)).unwrap();
        assert_eq!(kernel.parameter_block().read_u32(0).unwrap(), 112);
        assert_eq!(kernel.parameter_block().read_u32(4).unwrap(), 256);

        kernel.unset_arg(0).unwrap();
        assert_eq!(kernel.parameter_block().read_u32(4).unwrap(), 128);
        assert_eq!(kernel.missing_args(), vec![0]);
    }

    #[test]
    fn test_local_rejects_zero_and_oversize() {
        let registry = registry();
        let mut kernel = instance(&registry, locals());
        assert_eq!(
            kernel.set_arg(0, ArgValue::Local(0)).unwrap_err(),
            BindError::ZeroLocalSize { index: 0 }
        );
        let err = kernel.set_arg(1, ArgValue::Local(64 * 1024)).unwrap_err();
        assert!(matches!(err, BindError::SharedMemoryExceeded { limit: 65536, .. }));
        assert_eq!(kernel.bound_locals(), 0);
    }

    fn pointers() -> Arc<KernelDescriptor> {
        KernelDescriptor::builder("pointers")
            .with_parameter_block_size(32)
            .with_arg(
                ArgDescriptor::buffer("global", AddressSpace::Global, PatchLocation::new(0, 8))
                    .with_buffer_offset_patch(PatchLocation::new(8, 4))
                    .with_descriptor_offset(0),
            )
            .with_arg(ArgDescriptor::buffer("private", AddressSpace::Private, PatchLocation::new(16, 8)))
            .with_arg(ArgDescriptor::scalar("n", PatchLocation::new(24, 4)))
            .with_descriptor_table(128, 64, 2)
            .build()
            .unwrap()
    }

    #[test]
    fn test_buffer_offset_patch_and_surface() {
        let registry = registry();
        let mut kernel = instance(&registry, pointers());
        let parent = buffer(&registry, CONTEXT, MemoryAccess::ReadWrite);
        let view = parent.sub_buffer(3, 16, MemoryAccess::ReadWrite).unwrap();
        kernel.set_arg(0, ArgValue::Buffer(Some(&view))).unwrap();

        let block = kernel.parameter_block();
        assert_eq!(block.read_u64(0).unwrap(), parent.gpu_address());
        assert_eq!(block.read_u32(8).unwrap(), 3);

        let expected = HardwareFamily::Gen12Lp
            .encode_surface_state(&buffer_surface(view.gpu_address(), 16, false))
            .to_bytes();
        assert_eq!(&kernel.descriptor_table().as_bytes()[..expected.len()], expected.as_slice());
        let binding = kernel.binding(0).unwrap();
        assert_eq!(binding.kind, BoundKind::Buffer);
        assert_eq!(binding.address, view.gpu_address());
    }

    #[test]
    fn test_null_buffer_only_for_global_and_constant() {
        let registry = registry();
        let mut kernel = instance(&registry, pointers());
        kernel.set_arg(0, ArgValue::Buffer(None)).unwrap();
        assert_eq!(kernel.parameter_block().read_u64(0).unwrap(), 0);
        assert!(kernel.binding(0).unwrap().is_bound());
        assert_eq!(
            kernel.set_arg(1, ArgValue::Buffer(None)).unwrap_err(),
            BindError::NullObject { index: 1 }
        );
    }

    #[test]
    fn test_failed_bind_leaves_instance_unchanged() {
        let registry = registry();
        let mut kernel = instance(&registry, pointers());
        let before = kernel.clone();
        let foreign = buffer(&registry, ContextId(8), MemoryAccess::ReadWrite);

        assert_eq!(
            kernel.set_arg(0, ArgValue::Buffer(Some(&foreign))).unwrap_err(),
            BindError::ContextMismatch { index: 0 }
        );
        assert_eq!(
            kernel.set_arg(2, ArgValue::Value(&[1, 2])).unwrap_err(),
            BindError::SizeMismatch {
                index: 2,
                expected: 4,
                found: 2
            }
        );
        assert_eq!(
            kernel.set_arg(2, ArgValue::Local(4)).unwrap_err(),
            BindError::KindMismatch {
                index: 2,
                expected: ArgKind::Value,
                found: "local"
            }
        );
        assert_eq!(
            kernel.set_arg(5, ArgValue::Local(4)).unwrap_err(),
            BindError::InvalidIndex { index: 5, count: 3 }
        );
        assert_eq!(kernel.parameter_block(), before.parameter_block());
        assert_eq!(kernel.descriptor_table(), before.descriptor_table());
        assert_eq!(kernel.missing_args(), vec![0, 1, 2]);
    }

    #[test]
    fn test_scalar_and_readiness() {
        let registry = registry();
        let mut kernel = instance(&registry, pointers());
        let a = buffer(&registry, CONTEXT, MemoryAccess::ReadWrite);
        let b = buffer(&registry, CONTEXT, MemoryAccess::ReadOnly);
        kernel.set_arg(0, ArgValue::Buffer(Some(&a))).unwrap();
        kernel.set_arg(1, ArgValue::Buffer(Some(&b))).unwrap();
        assert!(!kernel.is_dispatch_ready());
        kernel.set_arg(2, ArgValue::Value(&42u32.to_le_bytes())).unwrap();
        assert!(kernel.is_dispatch_ready());
        assert_eq!(kernel.parameter_block().read_u32(24).unwrap(), 42);

        let referenced = kernel.referenced_allocations().unwrap();
        assert!(referenced.iter().any(|r| r.id() == a.allocation().id()));
        assert!(referenced.iter().any(|r| r.id() == b.allocation().id()));

        kernel.unset_arg(2).unwrap();
        assert!(!kernel.is_dispatch_ready());
    }

    #[test]
    fn test_pipe_access_qualifier() {
        let registry = registry();
        let descriptor = KernelDescriptor::builder("pipes")
            .with_parameter_block_size(8)
            .with_arg(ArgDescriptor::pipe("out", AccessQualifier::WriteOnly, PatchLocation::new(0, 8)))
            .build()
            .unwrap();
        let mut kernel = instance(&registry, descriptor);
        let read_only = Pipe::allocate(&registry, CONTEXT, 16, 4, MemoryAccess::ReadOnly).unwrap();
        let err = kernel.set_arg(0, ArgValue::Pipe(&read_only)).unwrap_err();
        assert!(matches!(err, BindError::AccessMismatch { index: 0, .. }));

        let writable = Pipe::allocate(&registry, CONTEXT, 16, 4, MemoryAccess::WriteOnly).unwrap();
        kernel.set_arg(0, ArgValue::Pipe(&writable)).unwrap();
        assert_eq!(kernel.parameter_block().read_u64(0).unwrap(), writable.gpu_address());
    }

    #[test]
    fn test_svm_pointer_offset() {
        let registry = registry();
        let descriptor = KernelDescriptor::builder("svm")
            .with_parameter_block_size(8)
            .with_arg(ArgDescriptor::svm("p", PatchLocation::new(0, 8)))
            .build()
            .unwrap();
        let mut kernel = instance(&registry, descriptor);
        let region = SvmRegion::allocate(&registry, CONTEXT, 128).unwrap();
        kernel
            .set_arg(0, ArgValue::SvmPointer { region: &region, offset: 32 })
            .unwrap();
        assert_eq!(kernel.parameter_block().read_u64(0).unwrap(), region.gpu_address() + 32);
        assert_eq!(
            kernel
                .set_arg(0, ArgValue::SvmPointer { region: &region, offset: 128 })
                .unwrap_err(),
            BindError::InvalidSvmOffset { index: 0, offset: 128 }
        );
        assert_eq!(kernel.binding(0).unwrap().kind, BoundKind::SvmPointer);
    }

    #[test]
    fn test_released_memory_is_reported() {
        let registry = registry();
        let mut kernel = instance(&registry, pointers());
        let a = buffer(&registry, CONTEXT, MemoryAccess::ReadWrite);
        kernel.set_arg(0, ArgValue::Buffer(Some(&a))).unwrap();
        drop(a);
        assert!(matches!(
            kernel.referenced_allocations(),
            Err(crate::error::EnqueueError::ArgumentReleased { index: 0 })
        ));
    }
}
