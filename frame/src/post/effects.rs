//! Built-in effects.

use bytemuck::{Pod, Zeroable};

use crate::commands::CommandRecorder;
use crate::device::GraphicsDevice;
use crate::error::FrameError;
use crate::types::TextureFormat;

use super::fullscreen::FullscreenPass;
use super::{EffectInput, PostEffect};

const TONEMAP_WGSL: &str = include_str!("../../shaders/tonemap.wgsl");
const VIGNETTE_WGSL: &str = include_str!("../../shaders/vignette.wgsl");
const DEPTH_FOG_WGSL: &str = include_str!("../../shaders/depth_fog.wgsl");

// ============================================================================
// Tone mapping
// ============================================================================

/// Push constants of [`ToneMapEffect`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ToneMapParams {
    /// Linear exposure multiplier.
    pub exposure: f32,
    /// Luminance mapped to white.
    pub white_point: f32,
    _pad: [f32; 2],
}

impl Default for ToneMapParams {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            white_point: 4.0,
            _pad: [0.0; 2],
        }
    }
}

/// Extended Reinhard tone mapping. Depth-agnostic.
#[derive(Debug)]
pub struct ToneMapEffect {
    params: ToneMapParams,
    pass: FullscreenPass,
}

impl ToneMapEffect {
    /// Tone mapping with exposure 1 and white point 4.
    pub fn new() -> Self {
        Self {
            params: ToneMapParams::default(),
            pass: FullscreenPass::new(
                "tonemap",
                TONEMAP_WGSL,
                std::mem::size_of::<ToneMapParams>() as u32,
            ),
        }
    }

    /// Set the exposure multiplier.
    pub fn with_exposure(mut self, exposure: f32) -> Self {
        self.params.exposure = exposure;
        self
    }

    /// Set the white point.
    pub fn with_white_point(mut self, white_point: f32) -> Self {
        self.params.white_point = white_point;
        self
    }

    /// Current parameters.
    pub fn params(&self) -> &ToneMapParams {
        &self.params
    }
}

impl Default for ToneMapEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl PostEffect for ToneMapEffect {
    fn name(&self) -> &str {
        "tonemap"
    }

    fn prepare(&mut self, device: &GraphicsDevice, output_format: TextureFormat) -> Result<(), FrameError> {
        self.pass.prepare(device, output_format)
    }

    fn record(&self, recorder: &mut CommandRecorder, input: &EffectInput) -> Result<(), FrameError> {
        self.pass.draw(recorder, input, bytemuck::bytes_of(&self.params))
    }
}

// ============================================================================
// Vignette
// ============================================================================

/// Push constants of [`VignetteEffect`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VignetteParams {
    /// Blend between the original and darkened color, 0 to 1.
    pub intensity: f32,
    /// Distance from the center where darkening ends.
    pub radius: f32,
    /// Width of the falloff band.
    pub softness: f32,
    _pad: f32,
}

impl Default for VignetteParams {
    fn default() -> Self {
        Self {
            intensity: 0.6,
            radius: 0.75,
            softness: 0.45,
            _pad: 0.0,
        }
    }
}

/// Darkens the image towards its corners. Depth-agnostic.
#[derive(Debug)]
pub struct VignetteEffect {
    params: VignetteParams,
    pass: FullscreenPass,
}

impl VignetteEffect {
    /// Vignette with default falloff.
    pub fn new() -> Self {
        Self {
            params: VignetteParams::default(),
            pass: FullscreenPass::new(
                "vignette",
                VIGNETTE_WGSL,
                std::mem::size_of::<VignetteParams>() as u32,
            ),
        }
    }

    /// Set the intensity, clamped to `[0, 1]`.
    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.params.intensity = intensity.clamp(0.0, 1.0);
        self
    }

    /// Set the radius and falloff width.
    pub fn with_falloff(mut self, radius: f32, softness: f32) -> Self {
        self.params.radius = radius;
        self.params.softness = softness;
        self
    }

    /// Current parameters.
    pub fn params(&self) -> &VignetteParams {
        &self.params
    }
}

impl Default for VignetteEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl PostEffect for VignetteEffect {
    fn name(&self) -> &str {
        "vignette"
    }

    fn prepare(&mut self, device: &GraphicsDevice, output_format: TextureFormat) -> Result<(), FrameError> {
        self.pass.prepare(device, output_format)
    }

    fn record(&self, recorder: &mut CommandRecorder, input: &EffectInput) -> Result<(), FrameError> {
        self.pass.draw(recorder, input, bytemuck::bytes_of(&self.params))
    }
}

// ============================================================================
// Depth fog
// ============================================================================

/// Push constants of [`DepthFogEffect`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FogParams {
    /// Fog color; alpha scales the final blend.
    pub color: [f32; 4],
    /// Camera near plane.
    pub near: f32,
    /// Camera far plane.
    pub far: f32,
    /// Exponential density.
    pub density: f32,
    _pad: f32,
}

impl Default for FogParams {
    fn default() -> Self {
        Self {
            color: [0.6, 0.65, 0.7, 1.0],
            near: 0.1,
            far: 100.0,
            density: 0.02,
            _pad: 0.0,
        }
    }
}

/// Exponential distance fog reconstructed from scene depth.
#[derive(Debug)]
pub struct DepthFogEffect {
    params: FogParams,
    pass: FullscreenPass,
}

impl DepthFogEffect {
    /// Fog with default color and density.
    pub fn new() -> Self {
        Self {
            params: FogParams::default(),
            pass: FullscreenPass::new(
                "depth_fog",
                DEPTH_FOG_WGSL,
                std::mem::size_of::<FogParams>() as u32,
            ),
        }
    }

    /// Set the fog color.
    pub fn with_color(mut self, color: [f32; 4]) -> Self {
        self.params.color = color;
        self
    }

    /// Set the density.
    pub fn with_density(mut self, density: f32) -> Self {
        self.params.density = density;
        self
    }

    /// Set the camera clip planes used to linearize depth.
    pub fn with_clip_planes(mut self, near: f32, far: f32) -> Self {
        self.params.near = near;
        self.params.far = far;
        self
    }

    /// Current parameters.
    pub fn params(&self) -> &FogParams {
        &self.params
    }
}

impl Default for DepthFogEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl PostEffect for DepthFogEffect {
    fn name(&self) -> &str {
        "depth_fog"
    }

    fn requires_depth(&self) -> bool {
        true
    }

    fn prepare(&mut self, device: &GraphicsDevice, output_format: TextureFormat) -> Result<(), FrameError> {
        if !(self.params.near > 0.0 && self.params.far > self.params.near) {
            return Err(FrameError::InvalidParameter(format!(
                "depth fog clip planes must satisfy 0 < near < far, got {} and {}",
                self.params.near, self.params.far
            )));
        }
        self.pass.prepare(device, output_format)
    }

    fn record(&self, recorder: &mut CommandRecorder, input: &EffectInput) -> Result<(), FrameError> {
        if input.depth.is_none() {
            return Err(FrameError::contract("depth fog recorded without a depth view"));
        }
        self.pass.draw(recorder, input, bytemuck::bytes_of(&self.params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MAX_PUSH_CONSTANT_SIZE;
    use crate::commands::{ColorAttachment, RecordedCommand};
    use crate::device::{BackendType, DeviceParameters};
    use crate::slots::SlotCategory;
    use crate::types::Extent2d;
    use rstest::rstest;
    use std::sync::Arc;

    fn create_test_device() -> Arc<GraphicsDevice> {
        GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Dummy)).unwrap()
    }

    #[rstest]
    #[case::tonemap(Box::new(ToneMapEffect::new()) as Box<dyn PostEffect>, false)]
    #[case::vignette(Box::new(VignetteEffect::new()) as Box<dyn PostEffect>, false)]
    #[case::depth_fog(Box::new(DepthFogEffect::new()) as Box<dyn PostEffect>, true)]
    fn test_builtin_effect_records_fullscreen_draw(
        #[case] mut effect: Box<dyn PostEffect>,
        #[case] requires_depth: bool,
    ) {
        let device = create_test_device();
        effect.prepare(&device, TextureFormat::Rgba16Float).unwrap();
        assert_eq!(effect.requires_depth(), requires_depth);

        let color = device.allocate_view(SlotCategory::ShaderResource).unwrap();
        let depth = device.allocate_view(SlotCategory::ShaderResource).unwrap();
        let target = device.allocate_view(SlotCategory::RenderTarget).unwrap();

        let mut recorder = CommandRecorder::new();
        recorder
            .begin_rendering(
                effect.name(),
                Some(ColorAttachment {
                    view: target.view(),
                    clear: None,
                }),
                None,
                Extent2d::new(16, 16),
            )
            .unwrap();
        let input = EffectInput {
            color: color.view(),
            depth: requires_depth.then(|| depth.view()),
            extent: Extent2d::new(16, 16),
        };
        effect.record(&mut recorder, &input).unwrap();
        recorder.end_rendering().unwrap();

        assert_eq!(recorder.draw_count(), 1);
        let push = recorder.commands().iter().find_map(|c| match c {
            RecordedCommand::PushConstants(data) => Some(data.len()),
            _ => None,
        });
        assert!(push.is_some_and(|len| len as u32 <= MAX_PUSH_CONSTANT_SIZE));

        device.release_view(color);
        device.release_view(depth);
        device.release_view(target);
    }

    #[test]
    fn test_record_before_prepare_fails() {
        let device = create_test_device();
        let color = device.allocate_view(SlotCategory::ShaderResource).unwrap();
        let mut recorder = CommandRecorder::new();
        let input = EffectInput {
            color: color.view(),
            depth: None,
            extent: Extent2d::new(4, 4),
        };
        assert!(ToneMapEffect::new().record(&mut recorder, &input).is_err());
        device.release_view(color);
    }

    #[test]
    fn test_fog_rejects_bad_clip_planes() {
        let device = create_test_device();
        let mut fog = DepthFogEffect::new().with_clip_planes(10.0, 1.0);
        assert!(matches!(
            fog.prepare(&device, TextureFormat::Rgba16Float),
            Err(FrameError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_vignette_intensity_clamped() {
        assert_eq!(VignetteEffect::new().with_intensity(3.0).params().intensity, 1.0);
    }

    #[test]
    fn test_params_layout_matches_shaders() {
        assert_eq!(std::mem::size_of::<ToneMapParams>(), 16);
        assert_eq!(std::mem::size_of::<VignetteParams>(), 16);
        assert_eq!(std::mem::size_of::<FogParams>(), 32);
    }
}
