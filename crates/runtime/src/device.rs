//! Device and context: the entry points that create every other object

use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::dispatch::DeviceLimits;
use crate::error::{AllocationError, ConfigError, EnqueueError};
use crate::instrumentation::{Instrumentation, InstrumentationHook, KernelExecution};
use crate::kernel::{KernelDescriptor, KernelInstance, KernelResources};
use crate::memory::{
    Accelerator, AddressingMode, AllocationRegistry, Buffer, ContextId, DeviceQueue, Image,
    ImageDescriptor, MemoryAccess, Pipe, Sampler, SamplerFilter, SvmRegion,
};
use crate::queue::builtins;
use crate::queue::transport::{SimulatedTransport, SubmissionTransport};
use crate::queue::CommandQueue;

/// State shared by every context and queue of a device
pub(crate) struct DeviceShared {
    pub(crate) config: DeviceConfig,
    pub(crate) limits: DeviceLimits,
    pub(crate) registry: Arc<AllocationRegistry>,
    pub(crate) transport: Arc<dyn SubmissionTransport>,
    pub(crate) instrumentation: Option<Arc<Instrumentation>>,
}

impl std::fmt::Debug for DeviceShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceShared")
            .field("family", &self.config.family)
            .field("registry", &self.registry)
            .field("instrumented", &self.instrumentation.is_some())
            .finish_non_exhaustive()
    }
}

/// A GPU as seen by the runtime
#[derive(Debug)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Fails if `config` does not pass [`DeviceConfig::validate`]
    pub fn new(
        config: DeviceConfig,
        transport: Arc<dyn SubmissionTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(AllocationRegistry::with_address_space(
            config.address_space_base,
            config.address_space_size,
        ));
        log::debug!(
            "device {}: {} hardware threads, {:#x}+{:#x} address space",
            config.family,
            config.hw_threads,
            config.address_space_base,
            config.address_space_size
        );
        Ok(Self {
            shared: Arc::new(DeviceShared {
                limits: DeviceLimits::from_config(&config),
                config,
                registry,
                transport,
                instrumentation: None,
            }),
        })
    }

    /// Device backed by the in-process command streamer, with the built-in
    /// kernels' emulators registered
    pub fn simulated(config: DeviceConfig) -> Result<(Self, Arc<SimulatedTransport>), ConfigError> {
        let transport = Arc::new(SimulatedTransport::new());
        builtins::register_emulators(&transport);
        let device = Self::new(config, Arc::clone(&transport) as Arc<dyn SubmissionTransport>)?;
        Ok((device, transport))
    }

    /// Attach a profiling tool; contexts created earlier are not instrumented
    pub fn with_instrumentation(self, hook: impl InstrumentationHook + 'static) -> Self {
        let shared = &self.shared;
        Self {
            shared: Arc::new(DeviceShared {
                config: shared.config.clone(),
                limits: shared.limits,
                registry: Arc::clone(&shared.registry),
                transport: Arc::clone(&shared.transport),
                instrumentation: Some(Arc::new(Instrumentation::new(hook))),
            }),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.shared.limits
    }

    pub fn registry(&self) -> &Arc<AllocationRegistry> {
        &self.shared.registry
    }

    pub fn instrumentation(&self) -> Option<&Arc<Instrumentation>> {
        self.shared.instrumentation.as_ref()
    }

    pub fn create_context(&self) -> Context {
        let id = ContextId::next();
        log::debug!("created context {id:?}");
        Context {
            id,
            device: Arc::clone(&self.shared),
        }
    }

    /// Drain instrumentation records the device never saw complete
    pub fn shutdown(&self) -> Vec<KernelExecution> {
        let Some(instrumentation) = &self.shared.instrumentation else {
            return Vec::new();
        };
        let abandoned = instrumentation.drain();
        if !abandoned.is_empty() {
            log::warn!("{} instrumented dispatches never completed", abandoned.len());
        }
        abandoned
    }
}

/// Object namespace: arguments bind only to kernels of the same context
#[derive(Debug, Clone)]
pub struct Context {
    id: ContextId,
    device: Arc<DeviceShared>,
}

impl Context {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn create_buffer(&self, size: u64, access: MemoryAccess) -> Result<Buffer, AllocationError> {
        Buffer::allocate(&self.device.registry, self.id, size, access)
    }

    pub fn create_image(&self, descriptor: ImageDescriptor, access: MemoryAccess) -> Result<Image, AllocationError> {
        Image::allocate(&self.device.registry, self.id, descriptor, access)
    }

    pub fn create_sampler(&self, normalized: bool, addressing: AddressingMode, filter: SamplerFilter) -> Sampler {
        Sampler::new(self.id, normalized, addressing, filter)
    }

    pub fn create_pipe(&self, packet_size: u32, max_packets: u32, access: MemoryAccess) -> Result<Pipe, AllocationError> {
        Pipe::allocate(&self.device.registry, self.id, packet_size, max_packets, access)
    }

    pub fn create_device_queue(&self, size: u64) -> Result<DeviceQueue, AllocationError> {
        DeviceQueue::allocate(&self.device.registry, self.id, size)
    }

    pub fn create_accelerator(&self, descriptor: &[u8]) -> Result<Accelerator, AllocationError> {
        Accelerator::allocate(&self.device.registry, self.id, descriptor)
    }

    pub fn create_svm(&self, size: u64) -> Result<SvmRegion, AllocationError> {
        SvmRegion::allocate(&self.device.registry, self.id, size)
    }

    /// Instantiate a kernel: upload its binary and implicit surfaces
    pub fn create_kernel(&self, descriptor: &Arc<KernelDescriptor>) -> Result<KernelInstance, EnqueueError> {
        instantiate(&self.device, self.id, descriptor)
    }

    pub fn create_queue(&self) -> Result<CommandQueue, AllocationError> {
        CommandQueue::new(Arc::clone(&self.device), self.id)
    }
}

pub(crate) fn instantiate(
    device: &DeviceShared,
    context: ContextId,
    descriptor: &Arc<KernelDescriptor>,
) -> Result<KernelInstance, EnqueueError> {
    let replacement = device.instrumentation.as_ref().and_then(|instrumentation| {
        instrumentation.kernel_created(
            context,
            descriptor.simd.width(),
            &descriptor.isa,
            descriptor.free_binding_table_index(),
            descriptor.shader_hash,
        )
    });
    let isa = replacement.as_deref().unwrap_or(&descriptor.isa);
    let resources = KernelResources::create(
        &device.registry,
        descriptor,
        isa,
        device.config.hw_threads,
        device.config.printf_buffer_size,
    )?;
    let instance = KernelInstance::new(
        Arc::clone(descriptor),
        context,
        device.config.family,
        Arc::new(resources),
    )?;
    log::debug!(
        "created kernel '{}' (id {}) in {context:?}",
        descriptor.name,
        instance.kernel_id()
    );
    Ok(instance)
}
