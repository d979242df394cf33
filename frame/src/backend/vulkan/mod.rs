//! Native Vulkan backend implementation using ash.
//!
//! This backend translates the recorded command list of a frame into a
//! Vulkan command buffer at submit time:
//! - Validation layers routed into `log` when enabled
//! - gpu-allocator for texture memory
//! - Dynamic rendering (VK_KHR_dynamic_rendering)
//! - A timeline semaphore per frame fence
//! - Per-category view tables of image views
//!
//! Each frame-in-flight slot owns a command buffer and a descriptor pool.
//! Both are reset when the slot is submitted again, which the submission
//! pipeline only does after the slot's previous frame has retired.

mod allocator;
mod barriers;
mod conversion;
mod debug;
mod device;
mod encoder;
mod instance;
mod layout;
mod pipeline;
pub mod swapchain;

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use parking_lot::Mutex;

use crate::commands::MAX_FRAMES_IN_FLIGHT;
use crate::device::DeviceParameters;
use crate::error::FrameError;
use crate::shader::ShaderStage;
use crate::slots::{SlotCategory, ViewHandle, ViewTableLayout};
use crate::surface::SurfaceConfiguration;
use crate::types::{Extent2d, TextureDescriptor, TextureUsage};

use super::{
    GpuBackend, GpuPipeline, GpuSwapchain, GpuTexture, GpuTimeline, MAX_PUSH_CONSTANT_SIZE,
    PipelineDescriptor, RawPipeline, RawTexture, Submission,
};

use self::conversion::{aspect_mask, convert_texture_format, convert_texture_usage, map_vk_error};
use self::encoder::CommandEncoder;
use self::pipeline::FullscreenLayout;
use self::swapchain::VulkanSwapchain;

/// Descriptor sets one frame slot can allocate.
const DESCRIPTOR_SETS_PER_FRAME: u32 = 256;

/// An image view written into a view-table slot.
pub(crate) struct VulkanView {
    pub view: vk::ImageView,
}

pub(crate) type ViewTables = HashMap<SlotCategory, Vec<Option<VulkanView>>>;

struct FrameResources {
    command_buffer: vk::CommandBuffer,
    descriptor_pool: vk::DescriptorPool,
}

struct Presentation {
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
}

/// Vulkan-based GPU backend using ash.
pub struct VulkanBackend {
    /// Vulkan entry points; must outlive the instance.
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    /// Graphics queue. Queue access must be externally synchronized.
    queue: Mutex<vk::Queue>,
    allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    command_pool: vk::CommandPool,
    frames: Mutex<Vec<FrameResources>>,
    layout: ManuallyDrop<FullscreenLayout>,
    dynamic_rendering: ash::khr::dynamic_rendering::Device,
    presentation: Option<Presentation>,
    views: Mutex<ViewTables>,
    validation_enabled: bool,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("validation_enabled", &self.validation_enabled)
            .field("presents", &self.presentation.is_some())
            .finish_non_exhaustive()
    }
}

impl VulkanBackend {
    /// Create the backend: instance, window surface, device, queue,
    /// allocator and per-frame resources.
    pub fn new(parameters: &DeviceParameters) -> Result<Self, FrameError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            FrameError::InitializationFailed(format!("Failed to load Vulkan: {e}"))
        })?;

        let bundle = instance::create_instance(
            &entry,
            &parameters.application_name,
            parameters.validation,
            parameters.window.map(|w| w.display),
        )?;
        let instance = bundle.instance;
        let destroy_instance = |instance: &ash::Instance| unsafe {
            if let (Some(debug_utils), Some(messenger)) = (&bundle.debug_utils, bundle.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
        };

        let surface = match parameters.window {
            Some(window) => {
                let loader = ash::khr::surface::Instance::new(&entry, &instance);
                match unsafe {
                    ash_window::create_surface(&entry, &instance, window.display, window.window, None)
                } {
                    Ok(surface) => Some((loader, surface)),
                    Err(e) => {
                        destroy_instance(&instance);
                        return Err(FrameError::InitializationFailed(format!(
                            "Failed to create window surface: {e:?}"
                        )));
                    }
                }
            }
            None => None,
        };
        let destroy_surface = || {
            if let Some((loader, surface)) = &surface {
                unsafe { loader.destroy_surface(*surface, None) };
            }
        };

        let selection = device::select_adapter(
            &instance,
            surface.as_ref().map(|(loader, surface)| (loader, *surface)),
        )
        .and_then(|selection| {
            device::create_logical_device(&instance, selection, surface.is_some())
                .map(|device| (selection, device))
        });
        let (selection, device) = match selection {
            Ok(result) => result,
            Err(e) => {
                destroy_surface();
                destroy_instance(&instance);
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(selection.queue_family, 0) };

        let resources = Self::create_device_resources(&instance, &device, selection);
        let (allocator, command_pool, frames, layout) = match resources {
            Ok(resources) => resources,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                destroy_surface();
                destroy_instance(&instance);
                return Err(e);
            }
        };

        let dynamic_rendering = ash::khr::dynamic_rendering::Device::new(&instance, &device);
        let presentation = surface.map(|(surface_loader, surface)| Presentation {
            surface,
            surface_loader,
            swapchain_loader: ash::khr::swapchain::Device::new(&instance, &device),
        });

        log::info!(
            "Vulkan device ready (validation: {}, presentation: {})",
            bundle.debug_messenger.is_some(),
            presentation.is_some()
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils: bundle.debug_utils,
            debug_messenger: bundle.debug_messenger,
            physical_device: selection.physical_device,
            device,
            queue: Mutex::new(queue),
            allocator: ManuallyDrop::new(Arc::new(Mutex::new(allocator))),
            command_pool,
            frames: Mutex::new(frames),
            layout: ManuallyDrop::new(layout),
            dynamic_rendering,
            presentation,
            views: Mutex::new(HashMap::new()),
            validation_enabled: parameters.validation,
        })
    }

    #[allow(clippy::type_complexity)]
    fn create_device_resources(
        instance: &ash::Instance,
        device: &ash::Device,
        selection: device::AdapterSelection,
    ) -> Result<(Allocator, vk::CommandPool, Vec<FrameResources>, FullscreenLayout), FrameError>
    {
        let allocator =
            allocator::create_allocator(instance, selection.physical_device, device.clone())?;
        let layout = FullscreenLayout::new(device)?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(selection.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
            FrameError::InitializationFailed(format!("Failed to create command pool: {e:?}"))
        })?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_FRAMES_IN_FLIGHT as u32);
        let command_buffers = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(FrameError::InitializationFailed(format!(
                    "Failed to allocate command buffers: {e:?}"
                )));
            }
        };

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: DESCRIPTOR_SETS_PER_FRAME * 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: DESCRIPTOR_SETS_PER_FRAME,
            },
        ];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(DESCRIPTOR_SETS_PER_FRAME)
            .pool_sizes(&pool_sizes);

        let mut frames = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for command_buffer in command_buffers {
            match unsafe { device.create_descriptor_pool(&descriptor_pool_info, None) } {
                Ok(descriptor_pool) => frames.push(FrameResources {
                    command_buffer,
                    descriptor_pool,
                }),
                Err(e) => {
                    unsafe {
                        for frame in frames {
                            device.destroy_descriptor_pool(frame.descriptor_pool, None);
                        }
                        device.destroy_command_pool(command_pool, None);
                    }
                    return Err(FrameError::InitializationFailed(format!(
                        "Failed to create descriptor pool: {e:?}"
                    )));
                }
            }
        }

        Ok((allocator, command_pool, frames, layout))
    }

    /// Get the logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Window surface and swapchain loader, if the backend presents.
    pub(crate) fn presentation(
        &self,
    ) -> Result<(vk::SurfaceKHR, &ash::khr::swapchain::Device), FrameError> {
        self.presentation
            .as_ref()
            .map(|p| (p.surface, &p.swapchain_loader))
            .ok_or_else(|| {
                FrameError::InitializationFailed(
                    "the Vulkan device was created without a window".into(),
                )
            })
    }

    fn surface_loader(&self) -> Result<&ash::khr::surface::Instance, FrameError> {
        self.presentation
            .as_ref()
            .map(|p| &p.surface_loader)
            .ok_or_else(|| {
                FrameError::InitializationFailed(
                    "the Vulkan device was created without a window".into(),
                )
            })
    }

    /// Query surface capabilities for a given surface.
    pub(crate) fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, FrameError> {
        unsafe {
            self.surface_loader()?
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }
        .map_err(|e| map_vk_error("Failed to get surface capabilities", e))
    }

    /// Query surface formats for a given surface.
    pub(crate) fn surface_formats(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, FrameError> {
        unsafe {
            self.surface_loader()?
                .get_physical_device_surface_formats(self.physical_device, surface)
        }
        .map_err(|e| map_vk_error("Failed to get surface formats", e))
    }

    /// Query present modes for a given surface.
    pub(crate) fn surface_present_modes(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, FrameError> {
        unsafe {
            self.surface_loader()?
                .get_physical_device_surface_present_modes(self.physical_device, surface)
        }
        .map_err(|e| map_vk_error("Failed to get present modes", e))
    }

    fn swapchain_textures(
        swapchain: &VulkanSwapchain,
        config: &SurfaceConfiguration,
    ) -> [GpuTexture; 2] {
        let extent = swapchain.extent();
        let images = swapchain.images();
        std::array::from_fn(|i| {
            let descriptor = TextureDescriptor::new_2d(
                Extent2d::new(extent.width, extent.height),
                config.format,
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::PRESENT,
            )
            .with_label(format!("swapchain image {i}"));
            GpuTexture::new(descriptor, RawTexture::VulkanSwapchainImage { image: images[i] })
        })
    }

    fn vulkan_timeline(timeline: &GpuTimeline) -> Result<vk::Semaphore, FrameError> {
        match timeline {
            GpuTimeline::Vulkan { semaphore, .. } => Ok(*semaphore),
            GpuTimeline::Dummy(_) => Err(FrameError::InvalidParameter(
                "timeline belongs to another backend".into(),
            )),
        }
    }

    fn vulkan_swapchain(swapchain: &mut GpuSwapchain) -> Result<&mut VulkanSwapchain, FrameError> {
        match swapchain {
            GpuSwapchain::Vulkan(swapchain) => Ok(swapchain),
            GpuSwapchain::Dummy(_) => Err(FrameError::InvalidParameter(
                "swapchain belongs to another backend".into(),
            )),
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device_wait_idle failed during shutdown: {e:?}");
            }

            for table in self.views.get_mut().values_mut() {
                for view in table.drain(..).flatten() {
                    self.device.destroy_image_view(view.view, None);
                }
            }

            for frame in self.frames.get_mut().drain(..) {
                self.device
                    .destroy_descriptor_pool(frame.descriptor_pool, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);

            // Both hold device handles and must go before the device.
            ManuallyDrop::drop(&mut self.layout);
            if Arc::strong_count(&self.allocator) > 1 {
                log::warn!("Textures outlive the Vulkan backend; their memory is leaked");
            }
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some(presentation) = &self.presentation {
                presentation
                    .surface_loader
                    .destroy_surface(presentation.surface, None);
            }

            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_view_table(
        &self,
        category: SlotCategory,
        capacity: u32,
    ) -> Result<ViewTableLayout, FrameError> {
        log::trace!("Vulkan: creating {category} view table ({capacity} slots)");
        self.views
            .lock()
            .insert(category, (0..capacity).map(|_| None).collect());

        // Image views have no addresses of their own; slots are addressed
        // by table and index scaled by the handle size.
        let base = (category.table_index() as u64 + 1) << 32;
        Ok(ViewTableLayout {
            cpu_base: base,
            gpu_base: category.is_shader_visible().then_some(base << 16),
            stride: std::mem::size_of::<vk::ImageView>() as u32,
        })
    }

    fn write_view(&self, view: ViewHandle, texture: &GpuTexture) -> Result<(), FrameError> {
        let descriptor = texture.descriptor();
        let is_depth = descriptor.format.is_depth_stencil();
        let compatible = match view.category() {
            SlotCategory::RenderTarget => {
                !is_depth && descriptor.usage.contains(TextureUsage::RENDER_ATTACHMENT)
            }
            SlotCategory::DepthStencil => {
                is_depth && descriptor.usage.contains(TextureUsage::RENDER_ATTACHMENT)
            }
            SlotCategory::ShaderResource => descriptor.usage.contains(TextureUsage::TEXTURE_BINDING),
        };
        if !compatible {
            return Err(FrameError::InvalidParameter(format!(
                "texture '{}' ({:?}, {:?}) cannot be viewed as {}",
                texture.label(),
                descriptor.format,
                descriptor.usage,
                view.category()
            )));
        }
        let image = texture.vk_image().ok_or_else(|| {
            FrameError::InvalidParameter(format!(
                "texture '{}' was not created by the Vulkan backend",
                texture.label()
            ))
        })?;

        // Sampling reads the depth aspect only.
        let aspect = match view.category() {
            SlotCategory::ShaderResource if is_depth => vk::ImageAspectFlags::DEPTH,
            _ => aspect_mask(descriptor.format),
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert_texture_format(descriptor.format))
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let mut tables = self.views.lock();
        let slot = tables
            .get_mut(&view.category())
            .and_then(|table| table.get_mut(view.index() as usize))
            .ok_or_else(|| {
                FrameError::InvalidParameter(format!(
                    "{} slot {} is outside its table",
                    view.category(),
                    view.index()
                ))
            })?;

        let image_view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| map_vk_error("Failed to create image view", e))?;
        if let Some(old) = slot.replace(VulkanView { view: image_view }) {
            unsafe { self.device.destroy_image_view(old.view, None) };
        }
        log::trace!(
            "Vulkan: {} slot {} -> '{}'",
            view.category(),
            view.index(),
            texture.label()
        );
        Ok(())
    }

    fn clear_view(&self, view: ViewHandle) {
        let old = self
            .views
            .lock()
            .get_mut(&view.category())
            .and_then(|table| table.get_mut(view.index() as usize))
            .and_then(Option::take);
        if let Some(old) = old {
            unsafe { self.device.destroy_image_view(old.view, None) };
        }
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, FrameError> {
        if descriptor.size.is_empty() {
            return Err(FrameError::InvalidParameter(format!(
                "texture '{}' has zero size",
                descriptor.label_or_default()
            )));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert_texture_format(descriptor.format))
            .extent(vk::Extent3D {
                width: descriptor.size.width,
                height: descriptor.size.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_texture_usage(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| map_vk_error("Failed to create image", e))?;

        let name = descriptor.label_or_default();
        let allocation = match allocator::allocate_image(&self.allocator, &self.device, image, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            if let Err(free) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free memory of '{name}': {free}");
            }
            unsafe { self.device.destroy_image(image, None) };
            return Err(map_vk_error("Failed to bind image memory", e));
        }

        // From here on GpuTexture's Drop releases both image and memory.
        let texture = GpuTexture::new(
            descriptor.clone(),
            RawTexture::Vulkan {
                device: self.device.clone(),
                image,
                allocation: Mutex::new(Some(allocation)),
                allocator: Arc::clone(&self.allocator),
            },
        );

        log::trace!(
            "Vulkan: created texture '{}' ({}, {:?})",
            descriptor.label_or_default(),
            descriptor.size,
            descriptor.format
        );
        Ok(texture)
    }

    fn create_pipeline(
        &self,
        descriptor: &PipelineDescriptor<'_>,
    ) -> Result<GpuPipeline, FrameError> {
        if descriptor.vertex.stage() != ShaderStage::Vertex
            || descriptor.fragment.stage() != ShaderStage::Fragment
        {
            return Err(FrameError::InvalidParameter(format!(
                "pipeline '{}' has mismatched shader stages",
                descriptor.label
            )));
        }
        if descriptor.push_constant_size > MAX_PUSH_CONSTANT_SIZE {
            return Err(FrameError::InvalidParameter(format!(
                "pipeline '{}' needs {} bytes of push constants, limit is {MAX_PUSH_CONSTANT_SIZE}",
                descriptor.label, descriptor.push_constant_size
            )));
        }

        let pipeline = self.layout.create_pipeline(descriptor)?;
        log::debug!("Vulkan: created pipeline '{}'", descriptor.label);
        Ok(GpuPipeline::new(
            descriptor.label,
            descriptor.push_constant_size,
            RawPipeline::Vulkan {
                device: self.device.clone(),
                pipeline,
            },
        ))
    }

    fn create_timeline(&self, initial_value: u64) -> Result<GpuTimeline, FrameError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }.map_err(|e| {
            FrameError::InitializationFailed(format!("Failed to create timeline semaphore: {e:?}"))
        })?;
        Ok(GpuTimeline::Vulkan {
            device: self.device.clone(),
            semaphore,
        })
    }

    fn timeline_value(&self, timeline: &GpuTimeline) -> Result<u64, FrameError> {
        let semaphore = Self::vulkan_timeline(timeline)?;
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
            .map_err(|e| map_vk_error("Failed to read timeline semaphore", e))
    }

    fn wait_timeline(&self, timeline: &GpuTimeline, value: u64) -> Result<(), FrameError> {
        let semaphores = [Self::vulkan_timeline(timeline)?];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) }
            .map_err(|e| map_vk_error("Failed to wait on timeline semaphore", e))
    }

    fn signal_timeline(&self, timeline: &GpuTimeline, value: u64) -> Result<(), FrameError> {
        let semaphores = [Self::vulkan_timeline(timeline)?];
        let values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        let queue = self.queue.lock();
        unsafe {
            self.device
                .queue_submit(*queue, &[submit_info], vk::Fence::null())
        }
        .map_err(|e| map_vk_error("Failed to signal timeline semaphore", e))
    }

    fn submit(&self, submission: Submission<'_>) -> Result<(), FrameError> {
        let frames = self.frames.lock();
        let frame = frames.get(submission.frame_slot).ok_or_else(|| {
            FrameError::InvalidParameter(format!(
                "frame slot {} exceeds {MAX_FRAMES_IN_FLIGHT}",
                submission.frame_slot
            ))
        })?;

        let swapchain = match submission.swapchain {
            Some(swapchain) => Some(Self::vulkan_swapchain(swapchain)?),
            None => None,
        };
        let acquired = match swapchain.as_deref() {
            Some(swapchain) => {
                let acquired = swapchain.acquired().ok_or_else(|| {
                    FrameError::InvalidParameter(
                        "submission targets a swapchain without an acquired image".into(),
                    )
                })?;
                Some((acquired.available, swapchain.render_finished(acquired.index)))
            }
            None => None,
        };

        let cmd = frame.command_buffer;
        unsafe {
            self.device
                .reset_descriptor_pool(frame.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(|e| map_vk_error("Failed to reset descriptor pool", e))?;
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| map_vk_error("Failed to reset command buffer", e))?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| map_vk_error("Failed to begin command buffer", e))?;
        }

        {
            let views = self.views.lock();
            let mut encoder = CommandEncoder {
                device: &self.device,
                dynamic_rendering: &self.dynamic_rendering,
                layout: &self.layout,
                views: &views,
                descriptor_pool: frame.descriptor_pool,
                cmd,
                barriers: barriers::BarrierBatch::new(),
            };
            for command in submission.commands {
                encoder.encode(command)?;
            }
            encoder.finish();
        }

        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| map_vk_error("Failed to end command buffer", e))?;

        let command_buffers = [cmd];
        let wait_semaphores: Vec<vk::Semaphore> = acquired.iter().map(|(wait, _)| *wait).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = acquired
            .iter()
            .map(|_| vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .collect();
        let signal_semaphores: Vec<vk::Semaphore> =
            acquired.iter().map(|(_, signal)| *signal).collect();
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);

        let queue = self.queue.lock();
        unsafe {
            self.device
                .queue_submit(*queue, &[submit_info], vk::Fence::null())
        }
        .map_err(|e| map_vk_error("Failed to submit command buffer", e))?;
        if let Some(swapchain) = swapchain {
            swapchain.mark_submitted();
        }

        log::trace!(
            "Vulkan: submitted {} commands from frame slot {}",
            submission.commands.len(),
            submission.frame_slot
        );
        Ok(())
    }

    fn create_swapchain(
        &self,
        config: &SurfaceConfiguration,
    ) -> Result<(GpuSwapchain, [GpuTexture; 2]), FrameError> {
        let swapchain = VulkanSwapchain::new(self, config)?;
        let textures = Self::swapchain_textures(&swapchain, config);
        Ok((GpuSwapchain::Vulkan(swapchain), textures))
    }

    fn resize_swapchain(
        &self,
        swapchain: &mut GpuSwapchain,
        config: &SurfaceConfiguration,
    ) -> Result<[GpuTexture; 2], FrameError> {
        let swapchain = Self::vulkan_swapchain(swapchain)?;
        self.wait_idle()?;
        swapchain.recreate(self, config)?;
        Ok(Self::swapchain_textures(swapchain, config))
    }

    fn acquire_image(&self, swapchain: &mut GpuSwapchain) -> Result<u32, FrameError> {
        Self::vulkan_swapchain(swapchain)?.acquire()
    }

    fn present(&self, swapchain: &mut GpuSwapchain, index: u32) -> Result<(), FrameError> {
        let swapchain = Self::vulkan_swapchain(swapchain)?;
        let queue = self.queue.lock();
        swapchain.present(*queue, index)
    }

    fn release_image(&self, swapchain: &mut GpuSwapchain, index: u32) -> Result<(), FrameError> {
        let swapchain = Self::vulkan_swapchain(swapchain)?;
        let queue = self.queue.lock();
        swapchain.release(&self.device, *queue, index)
    }

    fn wait_idle(&self) -> Result<(), FrameError> {
        // vkDeviceWaitIdle needs every queue externally synchronized.
        let _queue = self.queue.lock();
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| map_vk_error("Failed to wait for device idle", e))
    }
}
