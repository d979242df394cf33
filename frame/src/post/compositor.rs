//! Final blit of the post-processed image onto the presentation surface.

use crate::commands::{ColorAttachment, CommandRecorder};
use crate::device::GraphicsDevice;
use crate::error::FrameError;
use crate::slots::ViewHandle;
use crate::surface::SurfaceTarget;
use crate::types::{ScissorRect, TextureFormat, Viewport};

use super::EffectInput;
use super::fullscreen::FullscreenPass;

const BLIT_WGSL: &str = include_str!("../../shaders/blit.wgsl");

/// Draws a shader-resource view over the whole surface target.
#[derive(Debug)]
pub struct Compositor {
    pass: FullscreenPass,
    format: TextureFormat,
}

impl Compositor {
    /// Build the blit pipeline for surfaces of `format`.
    pub fn new(device: &GraphicsDevice, format: TextureFormat) -> Result<Self, FrameError> {
        let mut pass = FullscreenPass::new("composite", BLIT_WGSL, 0);
        pass.prepare(device, format)?;
        Ok(Self { pass, format })
    }

    /// Surface format the pipeline was built for.
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Blit `source` onto the acquired surface target.
    ///
    /// `source` must be shader-readable and `target` writable.
    pub fn composite(
        &self,
        recorder: &mut CommandRecorder,
        source: ViewHandle,
        target: &SurfaceTarget,
    ) -> Result<(), FrameError> {
        if target.format != self.format {
            return Err(FrameError::InvalidParameter(format!(
                "compositor built for {:?} cannot draw into a {:?} target",
                self.format, target.format
            )));
        }

        recorder.begin_rendering(
            "composite",
            Some(ColorAttachment {
                view: target.view,
                clear: Some([0.0, 0.0, 0.0, 1.0]),
            }),
            None,
            target.extent,
        )?;
        recorder.set_viewport(Viewport::from_extent(target.extent));
        recorder.set_scissor(ScissorRect::from_extent(target.extent));
        self.pass.draw(
            recorder,
            &EffectInput {
                color: source,
                depth: None,
                extent: target.extent,
            },
            &[],
        )?;
        recorder.end_rendering()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::RecordedCommand;
    use crate::device::{BackendType, DeviceParameters};
    use crate::slots::SlotCategory;
    use crate::surface::{PresentationSurface, SurfaceConfiguration};

    #[test]
    fn test_composite_draws_into_surface_target() {
        let device =
            GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Dummy)).unwrap();
        let mut surface =
            PresentationSurface::new(device.clone(), SurfaceConfiguration::new(40, 30)).unwrap();
        let compositor = Compositor::new(&device, surface.format()).unwrap();
        let source = device.allocate_view(SlotCategory::ShaderResource).unwrap();

        let mut recorder = CommandRecorder::new();
        let target = surface.acquire_writable_index(&mut recorder).unwrap();
        compositor
            .composite(&mut recorder, source.view(), &target)
            .unwrap();

        assert_eq!(recorder.draw_count(), 1);
        assert!(recorder.commands().iter().any(|c| matches!(
            c,
            RecordedCommand::BindInputs { color, depth: None } if *color == source.view()
        )));
        assert!(!recorder.in_render_pass());
        device.release_view(source);
    }

    #[test]
    fn test_format_mismatch_rejected() {
        let device =
            GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Dummy)).unwrap();
        let mut surface = PresentationSurface::new(
            device.clone(),
            SurfaceConfiguration::new(8, 8).with_format(TextureFormat::Rgba8Unorm),
        )
        .unwrap();
        let compositor = Compositor::new(&device, TextureFormat::Bgra8Unorm).unwrap();
        let source = device.allocate_view(SlotCategory::ShaderResource).unwrap();

        let mut recorder = CommandRecorder::new();
        let target = surface.acquire_writable_index(&mut recorder).unwrap();
        assert!(compositor.composite(&mut recorder, source.view(), &target).is_err());
        device.release_view(source);
    }
}
