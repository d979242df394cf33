//! GPU backend abstraction layer.
//!
//! The frame components never talk to a graphics API directly. They record
//! [`RecordedCommand`]s, allocate view-slots and wait on fences, and a
//! [`GpuBackend`] turns that into real work.
//!
//! # Available Backends
//!
//! - `dummy` (always built): Full simulation for tests and headless runs
//! - `vulkan-backend`: Native Vulkan backend using ash
//!
//! # Architecture
//!
//! Each backend implements the [`GpuBackend`] trait, which provides:
//! - View tables backing the view-slot pools
//! - Resource creation (textures, fullscreen pipelines)
//! - A timeline fence signalled by the queue
//! - Command submission and presentation

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "vulkan-backend")]
use ash::vk;
#[cfg(feature = "vulkan-backend")]
use gpu_allocator::vulkan::{Allocation, Allocator};
#[cfg(feature = "vulkan-backend")]
use parking_lot::Mutex;

use crate::commands::RecordedCommand;
use crate::device::{BackendType, DeviceParameters};
use crate::error::FrameError;
use crate::shader::ShaderBinary;
use crate::slots::{SlotCategory, ViewHandle, ViewTableLayout};
use crate::surface::SurfaceConfiguration;
use crate::types::{TextureDescriptor, TextureFormat};

pub use dummy::{DummyBackend, DummyCounters};

/// Largest push-constant block a fullscreen pipeline may declare.
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 64;

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`GpuTexture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(u64);

impl TextureId {
    fn next() -> Self {
        Self(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Backend-specific texture payload.
#[allow(clippy::large_enum_variant)]
pub(crate) enum RawTexture {
    /// Dummy backend (no GPU allocation)
    Dummy,
    /// Vulkan image with its own memory
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        image: vk::Image,
        allocation: Mutex<Option<Allocation>>,
        allocator: Arc<Mutex<Allocator>>,
    },
    /// Vulkan image owned by the swapchain
    #[cfg(feature = "vulkan-backend")]
    VulkanSwapchainImage { image: vk::Image },
}

/// Handle to a GPU texture.
pub struct GpuTexture {
    id: TextureId,
    descriptor: TextureDescriptor,
    pub(crate) raw: RawTexture,
}

impl GpuTexture {
    pub(crate) fn new(descriptor: TextureDescriptor, raw: RawTexture) -> Self {
        Self {
            id: TextureId::next(),
            descriptor,
            raw,
        }
    }

    /// Unique identity of this texture.
    pub fn id(&self) -> TextureId {
        self.id
    }

    /// Descriptor the texture was created from.
    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    /// Texture format.
    pub fn format(&self) -> TextureFormat {
        self.descriptor.format
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        self.descriptor.label_or_default()
    }

    /// Raw Vulkan image.
    #[cfg(feature = "vulkan-backend")]
    pub(crate) fn vk_image(&self) -> Option<vk::Image> {
        match &self.raw {
            RawTexture::Dummy => None,
            RawTexture::Vulkan { image, .. } | RawTexture::VulkanSwapchainImage { image } => {
                Some(*image)
            }
        }
    }
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.raw {
            RawTexture::Dummy => "dummy",
            #[cfg(feature = "vulkan-backend")]
            RawTexture::Vulkan { .. } => "vulkan",
            #[cfg(feature = "vulkan-backend")]
            RawTexture::VulkanSwapchainImage { .. } => "vulkan-swapchain",
        };
        f.debug_struct("GpuTexture")
            .field("id", &self.id)
            .field("label", &self.label())
            .field("size", &self.descriptor.size)
            .field("format", &self.descriptor.format)
            .field("backend", &backend)
            .finish()
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuTexture {
    fn drop(&mut self) {
        if let RawTexture::Vulkan {
            device,
            image,
            allocation,
            allocator,
        } = &self.raw
        {
            if let Some(allocation) = allocation.lock().take()
                && let Err(e) = allocator.lock().free(allocation)
            {
                log::warn!("Failed to free texture memory: {e}");
            }
            unsafe {
                device.destroy_image(*image, None);
            }
        }
    }
}

/// Handle to a GPU timeline fence.
pub enum GpuTimeline {
    /// Dummy backend timeline (condition variable)
    Dummy(Arc<dummy::DummyTimeline>),
    /// Vulkan timeline semaphore
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        semaphore: vk::Semaphore,
    },
}

impl std::fmt::Debug for GpuTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(timeline) => f.debug_tuple("GpuTimeline::Dummy").field(timeline).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { semaphore, .. } => f
                .debug_struct("GpuTimeline::Vulkan")
                .field("semaphore", semaphore)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuTimeline {
    fn drop(&mut self) {
        if let GpuTimeline::Vulkan { device, semaphore } = self {
            unsafe {
                device.destroy_semaphore(*semaphore, None);
            }
        }
    }
}

/// Backend-specific pipeline payload.
pub(crate) enum RawPipeline {
    Dummy,
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pipeline: vk::Pipeline,
    },
}

/// Handle to a compiled fullscreen graphics pipeline.
pub struct GpuPipeline {
    label: String,
    push_constant_size: u32,
    // Only the GPU backends read the handle back when binding.
    #[cfg_attr(not(feature = "vulkan-backend"), allow(dead_code))]
    pub(crate) raw: RawPipeline,
}

impl GpuPipeline {
    pub(crate) fn new(label: &str, push_constant_size: u32, raw: RawPipeline) -> Self {
        Self {
            label: label.to_string(),
            push_constant_size,
            raw,
        }
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size of the push-constant block the pipeline expects.
    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }
}

impl std::fmt::Debug for GpuPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuPipeline")
            .field("label", &self.label)
            .field("push_constant_size", &self.push_constant_size)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuPipeline {
    fn drop(&mut self) {
        if let RawPipeline::Vulkan { device, pipeline } = &self.raw {
            unsafe {
                device.destroy_pipeline(*pipeline, None);
            }
        }
    }
}

/// Handle to the presentation swapchain.
pub enum GpuSwapchain {
    /// Dummy backend swapchain
    Dummy(dummy::DummySwapchain),
    /// Vulkan swapchain
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::swapchain::VulkanSwapchain),
}

impl std::fmt::Debug for GpuSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(swapchain) => f.debug_tuple("GpuSwapchain::Dummy").field(swapchain).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(_) => f.debug_tuple("GpuSwapchain::Vulkan").finish_non_exhaustive(),
        }
    }
}

/// Descriptor for a fullscreen graphics pipeline.
///
/// Every pipeline shares one binding layout: set 0 holds the color input at
/// binding 0, the depth input at binding 1 and a linear sampler at binding 2.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDescriptor<'a> {
    /// Debug label.
    pub label: &'a str,
    /// Compiled vertex stage.
    pub vertex: &'a ShaderBinary,
    /// Compiled fragment stage.
    pub fragment: &'a ShaderBinary,
    /// Format of the single color attachment.
    pub color_format: TextureFormat,
    /// Depth attachment format, for pipelines that depth-test.
    pub depth_format: Option<TextureFormat>,
    /// Push-constant block size in bytes.
    pub push_constant_size: u32,
}

/// One frame's worth of commands handed to the queue.
pub struct Submission<'a> {
    /// Frame-in-flight slot whose backend resources may be reused.
    pub frame_slot: usize,
    /// Commands in execution order.
    pub commands: &'a [RecordedCommand],
    /// Swapchain whose acquired image this submission renders to.
    pub swapchain: Option<&'a mut GpuSwapchain>,
}

/// GPU backend trait for abstracting different GPU APIs.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create the view table backing one slot pool.
    fn create_view_table(
        &self,
        category: SlotCategory,
        capacity: u32,
    ) -> Result<ViewTableLayout, FrameError>;

    /// Write a view of `texture` into a table slot.
    fn write_view(&self, view: ViewHandle, texture: &GpuTexture) -> Result<(), FrameError>;

    /// Clear a table slot before it returns to its pool.
    fn clear_view(&self, view: ViewHandle);

    /// Create a 2D texture.
    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, FrameError>;

    /// Create a fullscreen graphics pipeline.
    fn create_pipeline(
        &self,
        descriptor: &PipelineDescriptor<'_>,
    ) -> Result<GpuPipeline, FrameError>;

    /// Create a timeline fence starting at `initial_value`.
    fn create_timeline(&self, initial_value: u64) -> Result<GpuTimeline, FrameError>;

    /// Read the value the GPU has completed so far (non-blocking).
    fn timeline_value(&self, timeline: &GpuTimeline) -> Result<u64, FrameError>;

    /// Block until the timeline reaches `value`.
    fn wait_timeline(&self, timeline: &GpuTimeline, value: u64) -> Result<(), FrameError>;

    /// Ask the queue to write `value` once all previously submitted work completes.
    fn signal_timeline(&self, timeline: &GpuTimeline, value: u64) -> Result<(), FrameError>;

    /// Submit recorded commands to the queue.
    fn submit(&self, submission: Submission<'_>) -> Result<(), FrameError>;

    /// Create a double-buffered swapchain and its two images.
    fn create_swapchain(
        &self,
        config: &SurfaceConfiguration,
    ) -> Result<(GpuSwapchain, [GpuTexture; 2]), FrameError>;

    /// Recreate the swapchain images at a new size.
    fn resize_swapchain(
        &self,
        swapchain: &mut GpuSwapchain,
        config: &SurfaceConfiguration,
    ) -> Result<[GpuTexture; 2], FrameError>;

    /// Acquire the index of the next image to render into.
    fn acquire_image(&self, swapchain: &mut GpuSwapchain) -> Result<u32, FrameError>;

    /// Queue the acquired image for display. Does not block.
    fn present(&self, swapchain: &mut GpuSwapchain, index: u32) -> Result<(), FrameError>;

    /// Give back an acquired image that will not go through [`present`].
    ///
    /// Afterwards the next acquire may report [`FrameError::SurfaceOutdated`]
    /// until the swapchain is recreated.
    ///
    /// [`present`]: GpuBackend::present
    fn release_image(&self, swapchain: &mut GpuSwapchain, index: u32) -> Result<(), FrameError>;

    /// Wait until the queue is idle.
    fn wait_idle(&self) -> Result<(), FrameError>;
}

/// Selects and creates the backend requested by the device parameters.
pub fn create_backend(parameters: &DeviceParameters) -> Result<Arc<dyn GpuBackend>, FrameError> {
    match parameters.backend {
        BackendType::Dummy => {
            log::info!("Using dummy backend");
            Ok(Arc::new(DummyBackend::with_latency(
                parameters.simulated_gpu_latency,
            )))
        }
        #[cfg(feature = "vulkan-backend")]
        BackendType::Vulkan => {
            let backend = vulkan::VulkanBackend::new(parameters)?;
            log::info!("Using Vulkan backend (ash)");
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "vulkan-backend"))]
        BackendType::Vulkan => Err(FrameError::InitializationFailed(
            "Vulkan backend requested but the `vulkan-backend` feature is disabled".into(),
        )),
        BackendType::Auto => {
            #[cfg(feature = "vulkan-backend")]
            {
                if parameters.window.is_some() {
                    match vulkan::VulkanBackend::new(parameters) {
                        Ok(backend) => {
                            log::info!("Using Vulkan backend (ash)");
                            return Ok(Arc::new(backend));
                        }
                        Err(e) => {
                            log::warn!("Failed to create Vulkan backend: {}", e);
                        }
                    }
                }
            }

            log::info!("Using dummy backend");
            Ok(Arc::new(DummyBackend::with_latency(
                parameters.simulated_gpu_latency,
            )))
        }
    }
}

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(feature = "vulkan-backend")
}
