//! Presentation surface.
//!
//! [`PresentationSurface`] owns the double-buffered swapchain: two color
//! targets, their tracked [`ResourceState`]s and one render-target view-slot
//! each. A frame uses it in three steps:
//!
//! 1. [`acquire_writable_index`](PresentationSurface::acquire_writable_index)
//!    takes the next image from the presentation engine and moves it to
//!    `RenderTarget`.
//! 2. [`release_to_presentable`](PresentationSurface::release_to_presentable)
//!    moves it to `Present` once drawing into it is recorded.
//! 3. [`present`](PresentationSurface::present) queues it for display. It
//!    never blocks; pacing belongs to the frame fence.
//!
//! At most one of the two targets is writable at any time.

use std::fmt;
use std::sync::Arc;

use crate::backend::{GpuSwapchain, GpuTexture};
use crate::commands::CommandRecorder;
use crate::device::{GraphicsDevice, OwnedView};
use crate::error::FrameError;
use crate::resource::{GpuResource, ResourceState, StateSnapshot};
use crate::slots::{SlotCategory, ViewHandle};
use crate::types::{Extent2d, TextureFormat};

/// Number of swapchain images a surface owns.
pub const SURFACE_IMAGE_COUNT: usize = 2;

/// Presentation mode for the swapchain.
///
/// Controls how frames are synchronized with the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    /// No synchronization. May cause tearing but has lowest latency.
    Immediate,
    /// Replace the queued image. Low latency without tearing.
    Mailbox,
    /// VSync enabled. No tearing, but may have higher latency.
    #[default]
    Fifo,
    /// VSync with relaxed timing. May tear if a frame is late.
    FifoRelaxed,
}

/// Configuration for a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceConfiguration {
    /// The texture format for the swapchain.
    pub format: TextureFormat,
    /// Width of the surface in pixels.
    pub width: u32,
    /// Height of the surface in pixels.
    pub height: u32,
    /// Presentation mode (vsync behavior).
    pub present_mode: PresentMode,
}

impl SurfaceConfiguration {
    /// Create a new surface configuration.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            format: TextureFormat::Bgra8Unorm,
            width,
            height,
            present_mode: PresentMode::default(),
        }
    }

    /// Set the texture format.
    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the present mode.
    pub fn with_present_mode(mut self, present_mode: PresentMode) -> Self {
        self.present_mode = present_mode;
        self
    }

    /// Size of the swapchain images.
    pub fn extent(&self) -> Extent2d {
        Extent2d::new(self.width, self.height)
    }
}

/// The target handed out for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceTarget {
    /// Swapchain image index (0 or 1).
    pub index: u32,
    /// Render-target view of the image.
    pub view: ViewHandle,
    /// Image size.
    pub extent: Extent2d,
    /// Image format.
    pub format: TextureFormat,
}

/// Double-buffered presentation surface.
pub struct PresentationSurface {
    // Field order is drop order: views go before the images they view.
    views: Vec<OwnedView>,
    targets: [GpuResource; SURFACE_IMAGE_COUNT],
    swapchain: GpuSwapchain,
    device: Arc<GraphicsDevice>,
    config: SurfaceConfiguration,
    writable: Option<u32>,
    released: bool,
    last_presented: Option<u32>,
}

impl PresentationSurface {
    /// Create the swapchain and a render-target view-slot for each image.
    ///
    /// Slot exhaustion here is fatal: the surface cannot exist without its
    /// targets.
    pub fn new(device: Arc<GraphicsDevice>, config: SurfaceConfiguration) -> Result<Self, FrameError> {
        if config.extent().is_empty() {
            return Err(FrameError::InvalidParameter(format!(
                "surface size must be non-zero, got {}",
                config.extent()
            )));
        }

        let (swapchain, images) = device.backend().create_swapchain(&config)?;

        let views = images
            .iter()
            .map(|image| device.create_owned_view(SlotCategory::RenderTarget, image))
            .collect::<Result<Vec<_>, _>>()?;
        let targets = images.map(GpuResource::new);

        log::info!(
            "Created presentation surface {} ({:?}, {:?})",
            config.extent(),
            config.format,
            config.present_mode
        );

        Ok(Self {
            device,
            config,
            swapchain,
            targets,
            views,
            writable: None,
            released: false,
            last_presented: None,
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &SurfaceConfiguration {
        &self.config
    }

    /// Size of the swapchain images.
    pub fn extent(&self) -> Extent2d {
        self.config.extent()
    }

    /// Format of the swapchain images.
    pub fn format(&self) -> TextureFormat {
        self.config.format
    }

    /// Take the next image from the presentation engine and make it writable.
    ///
    /// Must be paired with [`release_to_presentable`](Self::release_to_presentable).
    pub fn acquire_writable_index(
        &mut self,
        recorder: &mut CommandRecorder,
    ) -> Result<SurfaceTarget, FrameError> {
        if let Some(index) = self.writable {
            return Err(FrameError::contract(format!(
                "surface image {index} acquired again before it was presented"
            )));
        }

        let index = self.device.backend().acquire_image(&mut self.swapchain)?;
        if let Err(e) = self.check_acquired_index(index) {
            if let Err(release) = self.device.backend().release_image(&mut self.swapchain, index) {
                log::warn!("Failed to release surface image {index}: {release}");
            }
            return Err(e);
        }

        if let Err(e) = self.targets[index as usize].transition(ResourceState::RenderTarget, recorder) {
            if let Err(release) = self.device.backend().release_image(&mut self.swapchain, index) {
                log::warn!("Failed to release surface image {index}: {release}");
            }
            return Err(e);
        }
        self.writable = Some(index);
        self.released = false;
        log::trace!("Acquired surface image {index}");

        Ok(self.target(index))
    }

    // Strict alternation is what keeps the image being written distinct from
    // the one on screen. An engine that hands the same image back forces a
    // swapchain rebuild.
    fn check_acquired_index(&self, index: u32) -> Result<(), FrameError> {
        if index as usize >= SURFACE_IMAGE_COUNT {
            return Err(FrameError::Internal(format!(
                "swapchain image index {index} out of range"
            )));
        }
        if self.last_presented == Some(index) {
            log::warn!(
                "Presentation engine returned image {index} twice in a row, surface needs recreation"
            );
            return Err(FrameError::SurfaceOutdated);
        }
        Ok(())
    }

    /// Move the writable image to the presentable state.
    pub fn release_to_presentable(&mut self, recorder: &mut CommandRecorder) -> Result<(), FrameError> {
        let Some(index) = self.writable else {
            return Err(FrameError::contract(
                "release_to_presentable without an acquired surface image",
            ));
        };
        if self.released {
            return Err(FrameError::contract(format!(
                "surface image {index} released twice"
            )));
        }
        self.targets[index as usize].transition(ResourceState::Present, recorder)?;
        self.released = true;
        Ok(())
    }

    /// Hand the released image to the display and flip to the other one.
    ///
    /// Does not block.
    pub fn present(&mut self) -> Result<(), FrameError> {
        let index = match self.writable {
            Some(index) if self.released => index,
            Some(index) => {
                return Err(FrameError::contract(format!(
                    "surface image {index} presented while still writable"
                )));
            }
            None => {
                return Err(FrameError::contract("present without an acquired surface image"));
            }
        };

        self.device.backend().present(&mut self.swapchain, index)?;
        self.writable = None;
        self.released = false;
        self.last_presented = Some(index);
        log::trace!("Presented surface image {index}");
        Ok(())
    }

    /// Whether the acquired image has been released and can be presented.
    pub fn is_ready_to_present(&self) -> bool {
        self.writable.is_some() && self.released
    }

    /// Index of the image currently acquired for writing.
    pub fn writable_index(&self) -> Option<u32> {
        self.writable
    }

    /// The target acquired for this frame, if any.
    pub fn writable_target(&self) -> Option<SurfaceTarget> {
        self.writable.map(|index| self.target(index))
    }

    /// Index most recently handed to [`present`](Self::present).
    pub fn last_presented(&self) -> Option<u32> {
        self.last_presented
    }

    /// Tracked state of one image.
    pub fn target_state(&self, index: u32) -> Option<ResourceState> {
        self.targets.get(index as usize).map(GpuResource::state)
    }

    /// Render-target view of one image.
    pub fn target_view(&self, index: u32) -> Option<ViewHandle> {
        self.views.get(index as usize).map(OwnedView::view)
    }

    /// Texture of one image.
    pub fn texture(&self, index: u32) -> Option<&Arc<GpuTexture>> {
        self.targets.get(index as usize).map(GpuResource::texture)
    }

    /// Recreate both images at a new size. Their view-slots are kept.
    ///
    /// The caller must make sure the GPU no longer uses the old images.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        if let Some(index) = self.writable {
            return Err(FrameError::contract(format!(
                "surface resized while image {index} is acquired"
            )));
        }
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidParameter(format!(
                "surface size must be non-zero, got {width}x{height}"
            )));
        }

        let mut config = self.config.clone();
        config.width = width;
        config.height = height;
        let images = self
            .device
            .backend()
            .resize_swapchain(&mut self.swapchain, &config)?;
        // The old images are gone once the backend returns, so the new size
        // is committed before any view is rewritten. A failed rewrite leaves
        // the surface at the new size and a retried resize rewrites again.
        self.config = config;
        self.last_presented = None;
        for (target, image) in self.targets.iter_mut().zip(images) {
            target.replace_texture(image);
        }
        for (view, target) in self.views.iter().zip(&self.targets) {
            view.rewrite(target.texture())?;
        }

        log::debug!("Resized presentation surface to {}", self.config.extent());
        Ok(())
    }

    /// Give the acquired image back without presenting it.
    ///
    /// Used when a frame is abandoned after acquisition. The next acquire
    /// may report [`FrameError::SurfaceOutdated`].
    pub(crate) fn discard_writable(&mut self) -> Result<(), FrameError> {
        let Some(index) = self.writable.take() else {
            return Ok(());
        };
        self.released = false;
        log::debug!("Discarding surface image {index}");
        self.device.backend().release_image(&mut self.swapchain, index)
    }

    pub(crate) fn rewind(&mut self, snapshot: &StateSnapshot) {
        for target in &mut self.targets {
            target.rewind(snapshot);
        }
    }

    pub(crate) fn swapchain_mut(&mut self) -> &mut GpuSwapchain {
        &mut self.swapchain
    }

    fn target(&self, index: u32) -> SurfaceTarget {
        SurfaceTarget {
            index,
            view: self.views[index as usize].view(),
            extent: self.config.extent(),
            format: self.config.format,
        }
    }
}

impl fmt::Debug for PresentationSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationSurface")
            .field("config", &self.config)
            .field("targets", &self.targets)
            .field("writable", &self.writable)
            .field("last_presented", &self.last_presented)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BackendType, DeviceParameters};

    fn create_test_device() -> Arc<GraphicsDevice> {
        GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Dummy)).unwrap()
    }

    fn run_frame(surface: &mut PresentationSurface) -> u32 {
        let mut recorder = CommandRecorder::new();
        let target = surface.acquire_writable_index(&mut recorder).unwrap();
        surface.release_to_presentable(&mut recorder).unwrap();
        surface.present().unwrap();
        target.index
    }

    #[test]
    fn test_indices_alternate() {
        let device = create_test_device();
        let mut surface =
            PresentationSurface::new(device, SurfaceConfiguration::new(64, 48)).unwrap();

        let indices: Vec<u32> = (0..6).map(|_| run_frame(&mut surface)).collect();
        assert_eq!(indices, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(surface.last_presented(), Some(1));
    }

    #[test]
    fn test_states_follow_frame() {
        let device = create_test_device();
        let mut surface =
            PresentationSurface::new(device, SurfaceConfiguration::new(16, 16)).unwrap();
        let mut recorder = CommandRecorder::new();

        assert_eq!(surface.target_state(0), Some(ResourceState::Undefined));
        let target = surface.acquire_writable_index(&mut recorder).unwrap();
        assert_eq!(surface.target_state(target.index), Some(ResourceState::RenderTarget));
        assert_eq!(surface.writable_target(), Some(target));

        surface.release_to_presentable(&mut recorder).unwrap();
        assert_eq!(surface.target_state(target.index), Some(ResourceState::Present));
        assert!(surface.is_ready_to_present());
        assert_eq!(recorder.transition_count(), 1);

        surface.present().unwrap();
        assert_eq!(surface.writable_index(), None);
    }

    #[test]
    fn test_second_acquire_is_contract_violation() {
        let device = create_test_device();
        let mut surface =
            PresentationSurface::new(device, SurfaceConfiguration::new(16, 16)).unwrap();
        let mut recorder = CommandRecorder::new();

        surface.acquire_writable_index(&mut recorder).unwrap();
        assert!(matches!(
            surface.acquire_writable_index(&mut recorder),
            Err(FrameError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_present_requires_release() {
        let device = create_test_device();
        let mut surface =
            PresentationSurface::new(device, SurfaceConfiguration::new(16, 16)).unwrap();
        let mut recorder = CommandRecorder::new();

        assert!(surface.present().is_err());
        surface.acquire_writable_index(&mut recorder).unwrap();
        assert!(matches!(surface.present(), Err(FrameError::ContractViolation(_))));
        assert!(surface.release_to_presentable(&mut recorder).is_ok());
        assert!(surface.release_to_presentable(&mut recorder).is_err());
    }

    #[test]
    fn test_resize_keeps_view_slots() {
        let device = create_test_device();
        let mut surface =
            PresentationSurface::new(device.clone(), SurfaceConfiguration::new(32, 32)).unwrap();
        run_frame(&mut surface);
        let views_before = [surface.target_view(0), surface.target_view(1)];

        surface.resize(128, 64).unwrap();
        assert_eq!(surface.extent(), Extent2d::new(128, 64));
        assert_eq!([surface.target_view(0), surface.target_view(1)], views_before);
        assert_eq!(surface.target_state(0), Some(ResourceState::Undefined));
        assert_eq!(run_frame(&mut surface), 0);
        assert_eq!(device.slots().stats(SlotCategory::RenderTarget).in_use, 2);
    }

    #[test]
    fn test_resize_while_acquired_fails() {
        let device = create_test_device();
        let mut surface =
            PresentationSurface::new(device, SurfaceConfiguration::new(32, 32)).unwrap();
        let mut recorder = CommandRecorder::new();
        surface.acquire_writable_index(&mut recorder).unwrap();
        assert!(surface.resize(64, 64).is_err());
    }

    #[test]
    fn test_drop_releases_slots() {
        let device = create_test_device();
        let surface =
            PresentationSurface::new(device.clone(), SurfaceConfiguration::new(8, 8)).unwrap();
        assert_eq!(device.slots().stats(SlotCategory::RenderTarget).in_use, 2);
        drop(surface);
        assert_eq!(device.slots().stats(SlotCategory::RenderTarget).in_use, 0);
    }

    #[test]
    fn test_zero_sized_surface_rejected() {
        let device = create_test_device();
        assert!(PresentationSurface::new(device, SurfaceConfiguration::new(0, 8)).is_err());
    }
}
