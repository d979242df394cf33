//! End-to-end frame loop tests on the dummy backend.
//!
//! These drive [`FrameRenderer`] the way an application does and check the
//! observable behaviour: counters on the simulated GPU, fence values, surface
//! alternation, and that every view-slot comes back at teardown.

mod common;

use std::time::Duration;

use rstest::rstest;

use common::TestContext;
use redlilium_frame::{
    CommandRecorder, DepthFogEffect, EffectInput, Extent2d, FrameError, FrameRendererDescriptor,
    GraphicsDevice, PostEffect, ResourceState, SlotCapacities, SlotCategory, SyncState,
    TextureFormat, ToneMapEffect,
};

/// Draws without binding a pipeline, which the recorder rejects.
struct UnboundDrawEffect;

impl PostEffect for UnboundDrawEffect {
    fn name(&self) -> &str {
        "unbound-draw"
    }

    fn prepare(&mut self, _: &GraphicsDevice, _: TextureFormat) -> Result<(), FrameError> {
        Ok(())
    }

    fn record(&self, recorder: &mut CommandRecorder, _: &EffectInput) -> Result<(), FrameError> {
        recorder.draw(3, 1)
    }
}

#[test]
fn test_frame_loop_counts_gpu_work() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(64, 48));

    for expected_fence in 1..=10 {
        renderer.begin_frame().unwrap();
        assert_eq!(renderer.end_frame().unwrap(), expected_fence);
    }

    let counters = ctx.counters();
    assert_eq!(counters.submissions, 10);
    assert_eq!(counters.presents, 10);
    // Offscreen pass plus composite pass, one draw for the composite.
    assert_eq!(counters.passes, 20);
    assert_eq!(counters.draws, 10);
    assert_eq!(renderer.frame_count(), 10);
}

#[test]
fn test_effects_add_one_pass_each() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(32, 32));
    renderer
        .chain_mut()
        .add_effect(Box::new(ToneMapEffect::new()), 0)
        .unwrap();
    renderer
        .chain_mut()
        .add_effect(Box::new(DepthFogEffect::new()), 1)
        .unwrap();

    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();

    let counters = ctx.counters();
    assert_eq!(counters.passes, 4);
    assert_eq!(counters.draws, 3);
    assert!(renderer.chain().last_diagnostics().is_empty());
    assert_eq!(renderer.presentable_output_handle(), renderer.chain().buffer_view(1));
}

#[test]
fn test_surface_alternates_between_two_images() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(16, 16));

    let mut presented = Vec::new();
    for _ in 0..6 {
        renderer.begin_frame().unwrap();
        let writable = renderer.surface().writable_index().unwrap();
        assert_ne!(Some(writable), renderer.surface().last_presented());
        renderer.end_frame().unwrap();
        presented.push(renderer.surface().last_presented().unwrap());
    }

    assert_eq!(presented, vec![0, 1, 0, 1, 0, 1]);
    assert_eq!(renderer.surface().target_state(0), Some(ResourceState::Present));
    assert_eq!(renderer.surface().target_state(1), Some(ResourceState::Present));
}

#[test]
fn test_end_frame_twice_reports_contract_violation() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(16, 16));

    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();
    let before = ctx.counters();

    let result = renderer.end_frame();
    assert!(matches!(result, Err(FrameError::ContractViolation(_))));

    // Nothing was submitted or presented by the rejected call.
    assert_eq!(ctx.counters(), before);
    assert_eq!(renderer.frame_count(), 1);

    // The loop carries on normally afterwards.
    renderer.begin_frame().unwrap();
    assert_eq!(renderer.end_frame().unwrap(), 2);
}

#[test]
fn test_begin_frame_twice_reports_contract_violation() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(16, 16));

    renderer.begin_frame().unwrap();
    assert!(matches!(
        renderer.begin_frame(),
        Err(FrameError::ContractViolation(_))
    ));
    renderer.end_frame().unwrap();
}

#[rstest]
#[case::single(1)]
#[case::double(2)]
#[case::triple(3)]
fn test_end_frame_paces_against_gpu(#[case] frames_in_flight: usize) {
    let ctx = TestContext::with_latency(Duration::from_millis(2));
    let mut renderer = ctx.renderer(
        FrameRendererDescriptor::new(16, 16).with_frames_in_flight(frames_in_flight),
    );
    let lag = frames_in_flight as u64 - 1;

    for _ in 0..8 {
        renderer.begin_frame().unwrap();
        let fence = renderer.end_frame().unwrap();

        let completed = renderer
            .pipeline()
            .synchronizer()
            .completed_value()
            .unwrap();
        // Never more than frames_in_flight - 1 frames outstanding.
        assert!(
            completed + lag >= fence,
            "fence {fence} returned with only {completed} retired"
        );
    }

    renderer.wait_idle().unwrap();
    assert_eq!(
        renderer.pipeline().synchronizer().state().unwrap(),
        SyncState::Idle
    );
}

#[test]
fn test_too_many_frames_in_flight_rejected() {
    let ctx = TestContext::new();
    let result = redlilium_frame::FrameRenderer::new(
        ctx.device.clone(),
        FrameRendererDescriptor::new(16, 16)
            .with_frames_in_flight(redlilium_frame::MAX_FRAMES_IN_FLIGHT + 1),
    );
    assert!(matches!(result, Err(FrameError::InvalidParameter(_))));
}

#[test]
fn test_teardown_returns_every_slot() {
    let ctx = TestContext::new();
    {
        let mut renderer = ctx.renderer(FrameRendererDescriptor::new(16, 16));
        renderer
            .chain_mut()
            .add_effect(Box::new(ToneMapEffect::new()), 0)
            .unwrap();
        renderer.chain_mut().add_buffer().unwrap();

        assert!(ctx.device.slots().stats(SlotCategory::RenderTarget).in_use > 0);
        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
    }

    for category in SlotCategory::ALL {
        assert_eq!(
            ctx.device.slots().stats(category).in_use,
            0,
            "{category} slots leaked"
        );
    }
}

#[test]
fn test_optional_buffer_exhaustion_is_recoverable() {
    // Surface 2 + offscreen 1 + chain 2 render targets fill the pool exactly.
    let ctx = TestContext::with_capacities(SlotCapacities {
        render_target: 5,
        ..SlotCapacities::default()
    });
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(16, 16));

    let result = renderer.chain_mut().add_buffer();
    assert!(matches!(
        result,
        Err(FrameError::SlotExhausted {
            category: SlotCategory::RenderTarget,
            capacity: 5
        })
    ));
    assert_eq!(renderer.chain().buffer_count(), 2);

    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();
}

#[test]
fn test_mandatory_exhaustion_is_fatal() {
    let ctx = TestContext::with_capacities(SlotCapacities {
        render_target: 2,
        ..SlotCapacities::default()
    });
    let result =
        redlilium_frame::FrameRenderer::new(ctx.device.clone(), FrameRendererDescriptor::new(16, 16));
    assert!(matches!(result, Err(FrameError::SlotExhausted { .. })));

    // Partially built components gave their slots back.
    assert_eq!(ctx.device.slots().stats(SlotCategory::RenderTarget).in_use, 0);
}

#[test]
fn test_resize_between_frames_keeps_slots() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(32, 32));
    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();

    let color = renderer.offscreen_color_handle();
    let in_use: Vec<_> = SlotCategory::ALL
        .iter()
        .map(|&category| ctx.device.slots().stats(category).in_use)
        .collect();

    renderer.resize(48, 20).unwrap();
    assert_eq!(renderer.offscreen_color_handle(), color);
    assert_eq!(renderer.surface().extent().width, 48);
    let after: Vec<_> = SlotCategory::ALL
        .iter()
        .map(|&category| ctx.device.slots().stats(category).in_use)
        .collect();
    assert_eq!(in_use, after);

    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();
    assert_eq!(ctx.counters().presents, 2);
}

#[test]
fn test_failed_end_frame_drops_only_that_frame() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(32, 32));
    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();
    let color_state = renderer.offscreen().color_state();
    let broken = renderer
        .chain_mut()
        .add_effect(Box::new(UnboundDrawEffect), 0)
        .unwrap();

    renderer.begin_frame().unwrap();
    let result = renderer.end_frame();
    assert!(matches!(result, Err(FrameError::ContractViolation(_))));

    // Nothing of the dropped frame was submitted or presented.
    assert_eq!(renderer.frame_count(), 1);
    assert_eq!(ctx.counters().submissions, 1);
    assert_eq!(ctx.counters().presents, 1);
    assert_eq!(renderer.surface().writable_index(), None);
    assert_eq!(renderer.surface().target_state(1), Some(ResourceState::Undefined));
    assert_eq!(renderer.offscreen().color_state(), color_state);

    renderer.chain_mut().set_enabled(broken, false).unwrap();
    renderer.begin_frame().unwrap();
    assert_eq!(renderer.end_frame().unwrap(), 2);
    assert_eq!(renderer.surface().last_presented(), Some(1));

    renderer.resize(40, 24).unwrap();
    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();
    assert_eq!(ctx.counters().presents, 3);
}

#[test]
fn test_repeated_surface_image_requires_resize() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(32, 32));
    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();

    ctx.backend.repeat_next_image();
    assert!(matches!(renderer.begin_frame(), Err(FrameError::SurfaceOutdated)));
    assert_eq!(renderer.surface().writable_index(), None);
    assert!(renderer.recorder().is_err());

    // The image went back to the backend, so recreation is allowed.
    renderer.resize(32, 32).unwrap();
    for _ in 0..3 {
        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
    }
    assert_eq!(ctx.counters().presents, 4);
}

#[test]
fn test_resize_points_every_view_at_the_new_textures() {
    let ctx = TestContext::new();
    let mut renderer = ctx.renderer(FrameRendererDescriptor::new(32, 32));
    renderer
        .chain_mut()
        .add_effect(Box::new(ToneMapEffect::new()), 0)
        .unwrap();
    renderer.begin_frame().unwrap();
    renderer.end_frame().unwrap();
    let old_color = renderer.offscreen().color_texture().id();

    renderer.resize(64, 40).unwrap();
    assert!(renderer.resize(0, 40).is_err());

    let view_texture = |view| ctx.backend.view_texture(view);
    let offscreen = renderer.offscreen();
    let color = offscreen.color_texture().id();
    let depth = offscreen.depth_texture().id();
    assert_ne!(color, old_color);
    assert_eq!(offscreen.extent(), Extent2d::new(64, 40));
    assert_eq!(view_texture(offscreen.render_target_view()), Some(color));
    assert_eq!(view_texture(offscreen.color_handle()), Some(color));
    assert_eq!(view_texture(offscreen.depth_stencil_view()), Some(depth));
    assert_eq!(view_texture(offscreen.depth_handle()), Some(depth));

    let surface = renderer.surface();
    for index in 0..2 {
        let view = surface.target_view(index).unwrap();
        assert_eq!(view_texture(view), surface.texture(index).map(|t| t.id()));
    }

    let chain = renderer.chain();
    assert_eq!(chain.extent(), Extent2d::new(64, 40));
    for index in 0..chain.buffer_count() {
        let view = chain.buffer_view(index).unwrap();
        assert_eq!(view_texture(view), chain.buffer_texture(index).map(|t| t.id()));
    }
}
