//! Double-buffered Vulkan swapchain.
//!
//! The presentation surface always owns exactly two images; a surface whose
//! capabilities cannot provide that is rejected at creation. Each acquire
//! takes a semaphore from a small ring (the submission that renders to the
//! image waits on it), and each image has its own render-finished semaphore
//! that presentation waits on.

use ash::vk;

use super::VulkanBackend;
use super::conversion::{convert_present_mode, convert_texture_format, map_vk_error};
use crate::commands::MAX_FRAMES_IN_FLIGHT;
use crate::error::FrameError;
use crate::surface::{SURFACE_IMAGE_COUNT, SurfaceConfiguration};

/// Acquire semaphores in the ring. One more than the deepest pipelining so
/// a semaphore is never reused while a submission may still wait on it.
const ACQUIRE_SEMAPHORE_COUNT: usize = MAX_FRAMES_IN_FLIGHT + 1;

/// Image currently acquired from the presentation engine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcquiredImage {
    pub index: u32,
    pub available: vk::Semaphore,
    /// A submission already waited on `available` and will signal the
    /// image's render-finished semaphore.
    pub submitted: bool,
}

/// Vulkan swapchain resources.
pub struct VulkanSwapchain {
    device: ash::Device,
    loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: [vk::Image; SURFACE_IMAGE_COUNT],
    extent: vk::Extent2D,
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    next_semaphore: usize,
    acquired: Option<AcquiredImage>,
    outdated: bool,
}

impl VulkanSwapchain {
    /// Create a swapchain for the backend's window surface.
    pub(crate) fn new(
        backend: &VulkanBackend,
        config: &SurfaceConfiguration,
    ) -> Result<Self, FrameError> {
        let (surface, loader) = backend.presentation()?;
        let device = backend.device().clone();

        let mut swapchain = Self {
            device: device.clone(),
            loader: loader.clone(),
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: [vk::Image::null(); SURFACE_IMAGE_COUNT],
            extent: vk::Extent2D::default(),
            image_available: Vec::with_capacity(ACQUIRE_SEMAPHORE_COUNT),
            render_finished: Vec::with_capacity(SURFACE_IMAGE_COUNT),
            next_semaphore: 0,
            acquired: None,
            outdated: false,
        };

        // Pushed as created so Drop cleans up after a partial failure.
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let create_semaphore = || {
            unsafe { device.create_semaphore(&semaphore_info, None) }.map_err(|e| {
                FrameError::ResourceCreationFailed(format!("Failed to create semaphore: {e:?}"))
            })
        };
        for _ in 0..ACQUIRE_SEMAPHORE_COUNT {
            swapchain.image_available.push(create_semaphore()?);
        }
        for _ in 0..SURFACE_IMAGE_COUNT {
            swapchain.render_finished.push(create_semaphore()?);
        }

        swapchain.recreate(backend, config)?;
        Ok(swapchain)
    }

    /// Raw images in index order.
    pub(crate) fn images(&self) -> [vk::Image; SURFACE_IMAGE_COUNT] {
        self.images
    }

    /// Actual extent chosen for the images.
    pub(crate) fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub(crate) fn acquired(&self) -> Option<AcquiredImage> {
        self.acquired
    }

    /// Semaphore signalled by the submission that renders into `index`.
    pub(crate) fn render_finished(&self, index: u32) -> vk::Semaphore {
        self.render_finished[index as usize]
    }

    /// Rebuild the swapchain for `config`, retiring the previous one.
    ///
    /// The caller must ensure the device is idle.
    pub(crate) fn recreate(
        &mut self,
        backend: &VulkanBackend,
        config: &SurfaceConfiguration,
    ) -> Result<(), FrameError> {
        if let Some(acquired) = self.acquired {
            return Err(FrameError::contract(format!(
                "swapchain recreated while image {} is acquired",
                acquired.index
            )));
        }

        let capabilities = backend.surface_capabilities(self.surface)?;
        let image_count = SURFACE_IMAGE_COUNT as u32;
        if capabilities.min_image_count > image_count
            || (capabilities.max_image_count != 0 && capabilities.max_image_count < image_count)
        {
            return Err(FrameError::InitializationFailed(format!(
                "surface supports {}..={} images, double buffering needs exactly {image_count}",
                capabilities.min_image_count, capabilities.max_image_count
            )));
        }

        let format = convert_texture_format(config.format);
        let surface_format = backend
            .surface_formats(self.surface)?
            .into_iter()
            .find(|f| f.format == format)
            .ok_or_else(|| {
                FrameError::InitializationFailed(format!(
                    "surface does not support {:?}",
                    config.format
                ))
            })?;

        let present_mode = convert_present_mode(config.present_mode);
        let present_mode = if backend.surface_present_modes(self.surface)?.contains(&present_mode) {
            present_mode
        } else {
            log::warn!(
                "Present mode {:?} unsupported, falling back to FIFO",
                config.present_mode
            );
            vk::PresentModeKHR::FIFO
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: config.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: config.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };
        if extent.width != config.width || extent.height != config.height {
            log::debug!(
                "Surface extent {}x{} differs from requested {}x{}",
                extent.width,
                extent.height,
                config.width,
                config.height
            );
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(|e| map_vk_error("Failed to create swapchain", e))?;
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        let images = unsafe { self.loader.get_swapchain_images(swapchain) }
            .map_err(|e| map_vk_error("Failed to get swapchain images", e))?;
        self.images = images.try_into().map_err(|images: Vec<vk::Image>| {
            FrameError::InitializationFailed(format!(
                "driver created {} swapchain images, expected {image_count}",
                images.len()
            ))
        })?;
        self.extent = extent;
        self.outdated = false;

        log::info!(
            "Created Vulkan swapchain: {}x{} {:?} ({:?})",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );
        Ok(())
    }

    /// Acquire the next image.
    pub(crate) fn acquire(&mut self) -> Result<u32, FrameError> {
        if let Some(acquired) = self.acquired {
            return Err(FrameError::contract(format!(
                "swapchain image {} acquired twice",
                acquired.index
            )));
        }
        if self.outdated {
            return Err(FrameError::SurfaceOutdated);
        }

        let available = self.image_available[self.next_semaphore];
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, available, vk::Fence::null())
        }
        .map_err(|e| map_vk_error("Failed to acquire swapchain image", e))?;
        if suboptimal {
            log::debug!("Swapchain is suboptimal for the surface");
        }

        self.next_semaphore = (self.next_semaphore + 1) % self.image_available.len();
        self.acquired = Some(AcquiredImage {
            index,
            available,
            submitted: false,
        });
        Ok(index)
    }

    /// Record that a queue submission consumed the acquire semaphore.
    pub(crate) fn mark_submitted(&mut self) {
        if let Some(acquired) = &mut self.acquired {
            acquired.submitted = true;
        }
    }

    /// Give up the acquired image without rendering a frame into it.
    ///
    /// A submitted image is presented as usual. Otherwise the acquire
    /// semaphore is consumed by an empty submission and the swapchain is
    /// marked outdated: core Vulkan has no way to hand an unpresented image
    /// back, so it stays acquired until the swapchain is recreated.
    pub(crate) fn release(
        &mut self,
        device: &ash::Device,
        queue: vk::Queue,
        index: u32,
    ) -> Result<(), FrameError> {
        let acquired = match self.acquired {
            Some(acquired) if acquired.index == index => acquired,
            Some(_) | None => return Ok(()),
        };
        if acquired.submitted {
            return self.present(queue, index);
        }

        let wait_semaphores = [acquired.available];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        self.acquired = None;
        self.outdated = true;
        log::debug!("Released unpresented swapchain image {index}, swapchain needs recreation");
        unsafe { device.queue_submit(queue, &[submit_info], vk::Fence::null()) }
            .map_err(|e| map_vk_error("Failed to consume acquire semaphore", e))
    }

    /// Queue the acquired image for presentation.
    ///
    /// An out-of-date surface still consumes the image; the next acquire
    /// reports [`FrameError::SurfaceOutdated`].
    pub(crate) fn present(&mut self, queue: vk::Queue, index: u32) -> Result<(), FrameError> {
        match self.acquired {
            Some(acquired) if acquired.index == index => {}
            other => {
                return Err(FrameError::contract(format!(
                    "presenting image {index} which is not acquired ({:?})",
                    other.map(|a| a.index)
                )));
            }
        }

        let wait_semaphores = [self.render_finished(index)];
        let swapchains = [self.swapchain];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        self.acquired = None;
        match result {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date after presenting image {index}");
                self.outdated = true;
                Ok(())
            }
            Err(e) => Err(map_vk_error("Failed to present", e)),
        }
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device_wait_idle failed while dropping swapchain: {e:?}");
            }
            for semaphore in self
                .image_available
                .drain(..)
                .chain(self.render_finished.drain(..))
            {
                self.device.destroy_semaphore(semaphore, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
            }
        }
    }
}
