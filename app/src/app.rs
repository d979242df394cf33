//! Windowed run: winit event loop driving the frame renderer on Vulkan.

use std::time::Instant;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::{Window, WindowId};

use redlilium_frame::resize::DEFAULT_DEBOUNCE;
use redlilium_frame::{
    DeviceParameters, Extent2d, FrameError, FrameRenderer, FrameRendererDescriptor,
    GraphicsDevice, ResizeManager, SurfaceConfiguration,
};

use crate::args::AppArgs;
use crate::scene::GradientScene;

/// Renderer state that exists once the window does.
struct WindowState {
    // Dropped before the window its surface presents to.
    renderer: FrameRenderer,
    scene: GradientScene,
    resize: ResizeManager,
    window: Window,
}

pub struct App {
    args: AppArgs,
    state: Option<WindowState>,
    start_time: Instant,
    error: Option<FrameError>,
}

impl App {
    pub fn new(args: AppArgs) -> Self {
        Self {
            args,
            state: None,
            start_time: Instant::now(),
            error: None,
        }
    }

    /// Run the event loop until the window closes or a fatal error occurs.
    pub fn run(args: AppArgs) -> Result<(), FrameError> {
        let event_loop = EventLoop::new().map_err(|e| {
            FrameError::InitializationFailed(format!("failed to create event loop: {e}"))
        })?;
        let mut app = Self::new(args);
        event_loop
            .run_app(&mut app)
            .map_err(|e| FrameError::InitializationFailed(format!("event loop error: {e}")))?;

        match app.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn init(&self, event_loop: &ActiveEventLoop) -> Result<WindowState, FrameError> {
        let attributes = Window::default_attributes()
            .with_title("RedLilium Frame")
            .with_inner_size(winit::dpi::LogicalSize::new(self.args.width, self.args.height));
        let window = event_loop.create_window(attributes).map_err(|e| {
            FrameError::InitializationFailed(format!("failed to create window: {e}"))
        })?;

        let display = window
            .display_handle()
            .map_err(|e| FrameError::InitializationFailed(format!("no display handle: {e}")))?
            .as_raw();
        let handle = window
            .window_handle()
            .map_err(|e| FrameError::InitializationFailed(format!("no window handle: {e}")))?
            .as_raw();

        let device = GraphicsDevice::new(
            DeviceParameters::new()
                .with_backend(self.args.backend.into())
                .with_validation(self.args.validation)
                .with_application_name("RedLilium Frame")
                .with_window(display, handle),
        )?;

        let size = window.inner_size();
        let (width, height) = (size.width.max(1), size.height.max(1));
        let descriptor = FrameRendererDescriptor::new(width, height)
            .with_surface(
                SurfaceConfiguration::new(width, height)
                    .with_present_mode(self.args.present_mode()),
            )
            .with_frames_in_flight(self.args.frames_in_flight as usize);
        let scene = GradientScene::new(&device, &descriptor.offscreen)?;
        let mut renderer = FrameRenderer::new(device, descriptor)?;
        for (priority, effect) in self.args.effects.iter().enumerate() {
            renderer.chain_mut().add_effect(effect.build(), priority as i32)?;
        }

        log::info!(
            "Window ready: {}x{} physical, scale factor {}",
            width,
            height,
            window.scale_factor()
        );

        Ok(WindowState {
            renderer,
            scene,
            resize: ResizeManager::new(Extent2d::new(width, height), DEFAULT_DEBOUNCE),
            window,
        })
    }

    /// Render one frame. `Ok(false)` ends the loop.
    fn render_frame(&mut self) -> Result<bool, FrameError> {
        let Some(state) = &mut self.state else {
            return Ok(true);
        };

        if let Some(event) = state.resize.update() {
            log::debug!("Applying resize {} -> {}", event.previous, event.extent);
            state.renderer.resize(event.extent.width, event.extent.height)?;
        }
        if state.resize.is_minimized() {
            return Ok(true);
        }

        let extent = state.renderer.offscreen_extent();
        let time = self.start_time.elapsed().as_secs_f32();
        let recorder = match state.renderer.begin_frame() {
            Ok(recorder) => recorder,
            Err(FrameError::SurfaceOutdated) => {
                let size = state.window.inner_size();
                if size.width > 0 && size.height > 0 {
                    log::debug!("Surface outdated, recreating at {}x{}", size.width, size.height);
                    state.renderer.resize(size.width, size.height)?;
                }
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        state.scene.record(recorder, extent, time)?;
        match state.renderer.end_frame() {
            Ok(_) => {}
            // The renderer already dropped the frame; the next one recovers.
            Err(e) if e.is_recoverable() => log::warn!("Frame dropped: {e}"),
            Err(e) => return Err(e),
        }

        if let Some(max_frames) = self.args.max_frames
            && state.renderer.frame_count() >= max_frames
        {
            log::info!("Reached max frames limit ({max_frames}), exiting");
            return Ok(false);
        }
        Ok(true)
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            if let Err(e) = state.renderer.wait_idle() {
                log::error!("Failed to drain GPU work on exit: {e}");
            }
            log::info!("Rendered {} frames", state.renderer.frame_count());
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match self.init(event_loop) {
            Ok(state) => {
                state.window.request_redraw();
                self.state = Some(state);
            }
            Err(e) => {
                log::error!("Failed to initialize renderer: {e}");
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.shutdown(event_loop),
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.resize.on_resize_event(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => {
                    if let Some(state) = &self.state {
                        state.window.request_redraw();
                    }
                }
                Ok(false) => self.shutdown(event_loop),
                Err(e) => {
                    log::error!("Frame failed: {e}");
                    self.error = Some(e);
                    self.shutdown(event_loop);
                }
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}
