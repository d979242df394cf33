//! Offscreen render target.
//!
//! A color + depth pair sized independently of the presentation surface.
//! The scene is drawn into it between
//! [`begin_pass`](OffscreenRenderTarget::begin_pass) and
//! [`end_pass`](OffscreenRenderTarget::end_pass); afterwards its color
//! shader-resource view feeds the post-process chain.
//!
//! Four view-slots are owned: render-target and shader-resource views of the
//! color texture, and depth-stencil and shader-resource views of the depth
//! texture. The depth texture is only sampled when a depth-aware effect asks
//! for it through [`depth_view_for_effects`](OffscreenRenderTarget::depth_view_for_effects).

use std::fmt;
use std::sync::Arc;

use crate::backend::GpuTexture;
use crate::commands::{ColorAttachment, CommandRecorder, DepthAttachment};
use crate::device::{GraphicsDevice, OwnedView};
use crate::error::FrameError;
use crate::resource::{GpuResource, ResourceState, StateSnapshot};
use crate::slots::{SlotCategory, ViewHandle};
use crate::types::{
    ClearValues, Extent2d, ScissorRect, TextureDescriptor, TextureFormat, TextureUsage, Viewport,
};

/// Descriptor for an [`OffscreenRenderTarget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffscreenDescriptor {
    /// Debug label used for both textures.
    pub label: String,
    /// Size of both textures.
    pub extent: Extent2d,
    /// Color texture format.
    pub color_format: TextureFormat,
    /// Depth texture format.
    pub depth_format: TextureFormat,
}

impl OffscreenDescriptor {
    /// HDR color with 32-bit float depth.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            label: "offscreen".to_string(),
            extent: Extent2d::new(width, height),
            color_format: TextureFormat::Rgba16Float,
            depth_format: TextureFormat::Depth32Float,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the color format.
    pub fn with_color_format(mut self, format: TextureFormat) -> Self {
        self.color_format = format;
        self
    }

    /// Set the depth format.
    pub fn with_depth_format(mut self, format: TextureFormat) -> Self {
        self.depth_format = format;
        self
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.extent.is_empty() {
            return Err(FrameError::InvalidParameter(format!(
                "offscreen target '{}' must have a non-zero size, got {}",
                self.label, self.extent
            )));
        }
        if self.color_format.is_depth_stencil() {
            return Err(FrameError::InvalidParameter(format!(
                "offscreen color format {:?} is a depth format",
                self.color_format
            )));
        }
        if !self.depth_format.is_depth_stencil() {
            return Err(FrameError::InvalidParameter(format!(
                "offscreen depth format {:?} is not a depth format",
                self.depth_format
            )));
        }
        Ok(())
    }

    fn color_texture(&self) -> TextureDescriptor {
        TextureDescriptor::new_2d(
            self.extent,
            self.color_format,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC,
        )
        .with_label(format!("{} color", self.label))
    }

    fn depth_texture(&self) -> TextureDescriptor {
        TextureDescriptor::new_2d(
            self.extent,
            self.depth_format,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )
        .with_label(format!("{} depth", self.label))
    }
}

/// Color + depth target pair for scene rendering.
pub struct OffscreenRenderTarget {
    color_rtv: OwnedView,
    color_srv: OwnedView,
    depth_dsv: OwnedView,
    depth_srv: OwnedView,
    color: GpuResource,
    depth: GpuResource,
    device: Arc<GraphicsDevice>,
    descriptor: OffscreenDescriptor,
    in_pass: bool,
}

impl OffscreenRenderTarget {
    /// Create both textures and allocate their four view-slots.
    pub fn new(device: Arc<GraphicsDevice>, descriptor: OffscreenDescriptor) -> Result<Self, FrameError> {
        descriptor.validate()?;

        let color = device.create_texture(&descriptor.color_texture())?;
        let depth = device.create_texture(&descriptor.depth_texture())?;

        let color_rtv = device.create_owned_view(SlotCategory::RenderTarget, &color)?;
        let color_srv = device.create_owned_view(SlotCategory::ShaderResource, &color)?;
        let depth_dsv = device.create_owned_view(SlotCategory::DepthStencil, &depth)?;
        let depth_srv = device.create_owned_view(SlotCategory::ShaderResource, &depth)?;

        log::debug!(
            "Created offscreen target '{}' {} ({:?} + {:?})",
            descriptor.label,
            descriptor.extent,
            descriptor.color_format,
            descriptor.depth_format
        );

        Ok(Self {
            color_rtv,
            color_srv,
            depth_dsv,
            depth_srv,
            color: GpuResource::new(color),
            depth: GpuResource::new(depth),
            device,
            descriptor,
            in_pass: false,
        })
    }

    /// The descriptor the target was created from, with the current size.
    pub fn descriptor(&self) -> &OffscreenDescriptor {
        &self.descriptor
    }

    /// Size of both textures.
    pub fn extent(&self) -> Extent2d {
        self.descriptor.extent
    }

    /// Whether a pass is open.
    pub fn in_pass(&self) -> bool {
        self.in_pass
    }

    /// Make both textures writable, bind them, clear and set viewport/scissor.
    pub fn begin_pass(
        &mut self,
        recorder: &mut CommandRecorder,
        clear: ClearValues,
    ) -> Result<(), FrameError> {
        if self.in_pass {
            return Err(FrameError::contract(format!(
                "offscreen pass '{}' begun twice",
                self.descriptor.label
            )));
        }

        self.color.transition(ResourceState::RenderTarget, recorder)?;
        self.depth.transition(ResourceState::DepthWrite, recorder)?;

        let extent = self.descriptor.extent;
        recorder.begin_rendering(
            &self.descriptor.label,
            Some(ColorAttachment {
                view: self.color_rtv.view(),
                clear: clear.color,
            }),
            Some(DepthAttachment {
                view: self.depth_dsv.view(),
                clear: clear.depth,
            }),
            extent,
        )?;
        recorder.set_viewport(Viewport::from_extent(extent));
        recorder.set_scissor(ScissorRect::from_extent(extent));

        self.in_pass = true;
        Ok(())
    }

    /// Close the pass and make the color texture shader-readable.
    ///
    /// Returns the color shader-resource view.
    pub fn end_pass(&mut self, recorder: &mut CommandRecorder) -> Result<ViewHandle, FrameError> {
        if !self.in_pass {
            return Err(FrameError::contract(format!(
                "offscreen pass '{}' ended without being begun",
                self.descriptor.label
            )));
        }
        recorder.end_rendering()?;
        self.in_pass = false;
        self.color.transition(ResourceState::ShaderRead, recorder)?;
        Ok(self.color_srv.view())
    }

    /// Make the depth texture sampleable and return its shader-resource view.
    pub fn depth_view_for_effects(
        &mut self,
        recorder: &mut CommandRecorder,
    ) -> Result<ViewHandle, FrameError> {
        if self.in_pass {
            return Err(FrameError::contract(
                "offscreen depth sampled while its pass is open",
            ));
        }
        self.depth.transition(ResourceState::DepthRead, recorder)?;
        Ok(self.depth_srv.view())
    }

    /// Shader-resource view of the color texture.
    pub fn color_handle(&self) -> ViewHandle {
        self.color_srv.view()
    }

    /// Shader-resource view of the depth texture.
    pub fn depth_handle(&self) -> ViewHandle {
        self.depth_srv.view()
    }

    /// Render-target view of the color texture.
    pub fn render_target_view(&self) -> ViewHandle {
        self.color_rtv.view()
    }

    /// Depth-stencil view of the depth texture.
    pub fn depth_stencil_view(&self) -> ViewHandle {
        self.depth_dsv.view()
    }

    /// Tracked state of the color texture.
    pub fn color_state(&self) -> ResourceState {
        self.color.state()
    }

    /// Tracked state of the depth texture.
    pub fn depth_state(&self) -> ResourceState {
        self.depth.state()
    }

    /// The color texture.
    pub fn color_texture(&self) -> &Arc<GpuTexture> {
        self.color.texture()
    }

    /// The depth texture.
    pub fn depth_texture(&self) -> &Arc<GpuTexture> {
        self.depth.texture()
    }

    /// Recreate both textures at a new size, keeping the view-slots.
    ///
    /// The caller must make sure the GPU no longer uses the old textures.
    // Point the first `count` views, in resize order, back at the current textures.
    fn restore_views(&self, count: usize) {
        let views = [
            (&self.color_rtv, self.color.texture()),
            (&self.color_srv, self.color.texture()),
            (&self.depth_dsv, self.depth.texture()),
            (&self.depth_srv, self.depth.texture()),
        ];
        for (view, texture) in views.iter().take(count) {
            if let Err(e) = view.rewrite(texture) {
                log::error!(
                    "Failed to restore view {:?} of offscreen target '{}': {e}",
                    view.view(),
                    self.descriptor.label
                );
            }
        }
    }

    pub(crate) fn rewind(&mut self, snapshot: &StateSnapshot) {
        self.color.rewind(snapshot);
        self.depth.rewind(snapshot);
        self.in_pass = false;
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        if self.in_pass {
            return Err(FrameError::contract(
                "offscreen target resized while its pass is open",
            ));
        }
        let extent = Extent2d::new(width, height);
        if extent == self.descriptor.extent {
            return Ok(());
        }

        let mut descriptor = self.descriptor.clone();
        descriptor.extent = extent;
        descriptor.validate()?;

        let color = self.device.create_texture(&descriptor.color_texture())?;
        let depth = self.device.create_texture(&descriptor.depth_texture())?;
        let views = [
            (&self.color_rtv, &color),
            (&self.color_srv, &color),
            (&self.depth_dsv, &depth),
            (&self.depth_srv, &depth),
        ];
        for (rewritten, (view, texture)) in views.iter().enumerate() {
            if let Err(e) = view.rewrite(texture) {
                self.restore_views(rewritten + 1);
                return Err(e);
            }
        }
        self.color.replace_texture(color);
        self.depth.replace_texture(depth);
        self.descriptor = descriptor;

        log::debug!(
            "Resized offscreen target '{}' to {}",
            self.descriptor.label,
            extent
        );
        Ok(())
    }
}

impl fmt::Debug for OffscreenRenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffscreenRenderTarget")
            .field("descriptor", &self.descriptor)
            .field("color", &self.color)
            .field("depth", &self.depth)
            .field("in_pass", &self.in_pass)
            .finish()
    }
}
