//! Headless run on the simulated GPU.

use std::time::{Duration, Instant};

use redlilium_frame::{
    BackendType, DeviceParameters, FrameError, FrameRenderer, FrameRendererDescriptor,
    GraphicsDevice, SurfaceConfiguration,
};

use crate::args::AppArgs;
use crate::scene::GradientScene;

/// Frames rendered when `--max-frames` is not given.
const DEFAULT_HEADLESS_FRAMES: u64 = 240;

pub fn run(args: &AppArgs) -> Result<(), FrameError> {
    let mut parameters = DeviceParameters::new().with_backend(BackendType::Dummy);
    if args.gpu_latency_ms > 0 {
        parameters =
            parameters.with_simulated_gpu_latency(Duration::from_millis(args.gpu_latency_ms));
    }
    let device = GraphicsDevice::new(parameters)?;
    log::info!("Running headless on the {} backend", device.name());

    let descriptor = FrameRendererDescriptor::new(args.width, args.height)
        .with_surface(
            SurfaceConfiguration::new(args.width, args.height)
                .with_present_mode(args.present_mode()),
        )
        .with_frames_in_flight(args.frames_in_flight as usize);
    let scene = GradientScene::new(&device, &descriptor.offscreen)?;
    let mut renderer = FrameRenderer::new(device, descriptor)?;
    for (priority, effect) in args.effects.iter().enumerate() {
        renderer.chain_mut().add_effect(effect.build(), priority as i32)?;
    }

    let frames = args.max_frames.unwrap_or(DEFAULT_HEADLESS_FRAMES);
    let start = Instant::now();
    for _ in 0..frames {
        let extent = renderer.offscreen_extent();
        let time = start.elapsed().as_secs_f32();
        let recorder = renderer.begin_frame()?;
        scene.record(recorder, extent, time)?;
        renderer.end_frame()?;
    }
    renderer.wait_idle()?;

    let elapsed = start.elapsed();
    log::info!(
        "Rendered {} frames in {:.2?} ({:.1} fps)",
        renderer.frame_count(),
        elapsed,
        renderer.frame_count() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    for diagnostic in renderer.chain().last_diagnostics() {
        log::warn!("{diagnostic}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_headless_run_completes() {
        let args = AppArgs::parse_from([
            "redlilium-app",
            "--backend",
            "dummy",
            "--max-frames",
            "5",
            "--frames-in-flight",
            "2",
            "--effects",
            "tonemap,fog,vignette",
            "--width",
            "64",
            "--height",
            "48",
        ]);
        run(&args).unwrap();
    }
}
