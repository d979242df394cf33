//! Graphics device.
//!
//! The [`GraphicsDevice`] is the explicitly constructed service every frame
//! component receives by reference. It owns the backend (device and queue),
//! the three view-slot pools and the shader compiler. There is no global
//! instance: the application creates one device and passes it down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::backend::{self, GpuBackend, GpuPipeline, GpuTexture, PipelineDescriptor};
use crate::error::FrameError;
use crate::shader::{ShaderCompiler, ShaderSource, ShaderStage, WgslCompiler};
use crate::slots::{SlotCapacities, SlotCategory, SlotHandle, ViewHandle, ViewSlotAllocator};
use crate::types::{TextureDescriptor, TextureFormat};

/// Which backend to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendType {
    /// Vulkan when available and a window is provided, dummy otherwise.
    #[default]
    Auto,
    /// Simulated backend.
    Dummy,
    /// Native Vulkan (requires the `vulkan-backend` feature).
    Vulkan,
}

/// Raw handles of the window the device presents to.
#[derive(Debug, Clone, Copy)]
pub struct WindowHandles {
    /// Display connection.
    pub display: RawDisplayHandle,
    /// Window.
    pub window: RawWindowHandle,
}

/// Parameters for creating a [`GraphicsDevice`].
#[derive(Debug, Clone)]
pub struct DeviceParameters {
    /// Backend selection.
    pub backend: BackendType,
    /// Enable API validation layers.
    pub validation: bool,
    /// Capacity of each view-slot pool.
    pub slot_capacities: SlotCapacities,
    /// Latency of each fence signal on the dummy backend.
    pub simulated_gpu_latency: Option<Duration>,
    /// Window to present to, required by the Vulkan backend.
    pub window: Option<WindowHandles>,
    /// Application name reported to the driver.
    pub application_name: String,
}

impl Default for DeviceParameters {
    fn default() -> Self {
        Self {
            backend: BackendType::Auto,
            validation: cfg!(debug_assertions),
            slot_capacities: SlotCapacities::default(),
            simulated_gpu_latency: None,
            window: None,
            application_name: "RedLilium".to_string(),
        }
    }
}

impl DeviceParameters {
    /// Default parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the backend.
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set view-slot pool capacities.
    pub fn with_slot_capacities(mut self, capacities: SlotCapacities) -> Self {
        self.slot_capacities = capacities;
        self
    }

    /// Delay every dummy fence signal by `latency`.
    pub fn with_simulated_gpu_latency(mut self, latency: Duration) -> Self {
        self.simulated_gpu_latency = Some(latency);
        self
    }

    /// Present to the given window.
    pub fn with_window(mut self, display: RawDisplayHandle, window: RawWindowHandle) -> Self {
        self.window = Some(WindowHandles { display, window });
        self
    }

    /// Set the application name.
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }
}

/// Descriptor for a fullscreen pipeline compiled from WGSL.
#[derive(Debug, Clone)]
pub struct FullscreenPipelineDescriptor {
    /// Debug label.
    pub label: String,
    /// Source containing both entry points.
    pub source: ShaderSource,
    /// Vertex entry point (default `vs_main`).
    pub vertex_entry: String,
    /// Fragment entry point (default `fs_main`).
    pub fragment_entry: String,
    /// Color attachment format.
    pub color_format: TextureFormat,
    /// Depth attachment format, if the pipeline depth-tests.
    pub depth_format: Option<TextureFormat>,
    /// Push-constant block size in bytes.
    pub push_constant_size: u32,
}

impl FullscreenPipelineDescriptor {
    /// Create a descriptor with `vs_main`/`fs_main` entry points.
    pub fn new(label: impl Into<String>, source: ShaderSource, color_format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            source,
            vertex_entry: "vs_main".to_string(),
            fragment_entry: "fs_main".to_string(),
            color_format,
            depth_format: None,
            push_constant_size: 0,
        }
    }

    /// Depth-test against an attachment of this format.
    pub fn with_depth(mut self, format: TextureFormat) -> Self {
        self.depth_format = Some(format);
        self
    }

    /// Declare a push-constant block.
    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

/// The device service shared by all frame components.
///
/// # Thread Safety
///
/// `GraphicsDevice` is `Send + Sync`; slot pools use interior locking.
pub struct GraphicsDevice {
    backend: Arc<dyn GpuBackend>,
    slots: ViewSlotAllocator,
    compiler: Arc<dyn ShaderCompiler>,
}

impl GraphicsDevice {
    /// Create the backend selected by `parameters` and the slot pools.
    ///
    /// Failure is fatal: there is no usable partial device.
    pub fn new(parameters: DeviceParameters) -> Result<Arc<Self>, FrameError> {
        let backend = backend::create_backend(&parameters)?;
        Self::from_parts(
            backend,
            parameters.slot_capacities,
            Arc::new(WgslCompiler::new()),
        )
    }

    /// Build a device around an existing backend and compiler.
    pub fn from_parts(
        backend: Arc<dyn GpuBackend>,
        capacities: SlotCapacities,
        compiler: Arc<dyn ShaderCompiler>,
    ) -> Result<Arc<Self>, FrameError> {
        let mut layouts = Vec::with_capacity(SlotCategory::ALL.len());
        for category in SlotCategory::ALL {
            let layout = backend
                .create_view_table(category, capacities.get(category))
                .map_err(|e| {
                    FrameError::InitializationFailed(format!(
                        "failed to create {category} view table: {e}"
                    ))
                })?;
            layouts.push(layout);
        }
        let layouts = [layouts[0], layouts[1], layouts[2]];

        log::info!(
            "Created graphics device on {} backend (slots: {} RTV, {} DSV, {} SRV)",
            backend.name(),
            capacities.render_target,
            capacities.depth_stencil,
            capacities.shader_resource
        );

        Ok(Arc::new(Self {
            backend,
            slots: ViewSlotAllocator::new(capacities, layouts),
            compiler,
        }))
    }

    /// Backend name.
    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// The view-slot pools.
    pub fn slots(&self) -> &ViewSlotAllocator {
        &self.slots
    }

    /// The shader compiler service.
    pub fn compiler(&self) -> &dyn ShaderCompiler {
        self.compiler.as_ref()
    }

    /// Create a 2D texture.
    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, FrameError> {
        self.backend.create_texture(descriptor)
    }

    /// Allocate an empty view-slot.
    pub fn allocate_view(&self, category: SlotCategory) -> Result<SlotHandle, FrameError> {
        self.slots.allocate(category)
    }

    /// Allocate a view-slot and write a view of `texture` into it.
    pub fn create_view(
        &self,
        category: SlotCategory,
        texture: &GpuTexture,
    ) -> Result<SlotHandle, FrameError> {
        let slot = self.slots.allocate(category)?;
        if let Err(e) = self.backend.write_view(slot.view(), texture) {
            self.slots.release(slot);
            return Err(e);
        }
        Ok(slot)
    }

    /// Allocate a view-slot for `texture` that is released when dropped.
    pub fn create_owned_view(
        self: &Arc<Self>,
        category: SlotCategory,
        texture: &GpuTexture,
    ) -> Result<OwnedView, FrameError> {
        let slot = self.create_view(category, texture)?;
        Ok(OwnedView {
            device: Arc::clone(self),
            view: slot.view(),
            slot: Some(slot),
        })
    }

    /// Point an owned slot at a different texture.
    pub fn rewrite_view(&self, slot: &SlotHandle, texture: &GpuTexture) -> Result<(), FrameError> {
        self.backend.write_view(slot.view(), texture)
    }

    /// Clear a slot and return it to its pool.
    pub fn release_view(&self, slot: SlotHandle) {
        self.backend.clear_view(slot.view());
        self.slots.release(slot);
    }

    /// Compile a fullscreen pipeline.
    pub fn create_fullscreen_pipeline(
        &self,
        descriptor: &FullscreenPipelineDescriptor,
    ) -> Result<Arc<GpuPipeline>, FrameError> {
        let vertex = self.compiler.compile(
            &descriptor.source,
            ShaderStage::Vertex,
            &descriptor.vertex_entry,
        )?;
        let fragment = self.compiler.compile(
            &descriptor.source,
            ShaderStage::Fragment,
            &descriptor.fragment_entry,
        )?;

        let pipeline = self.backend.create_pipeline(&PipelineDescriptor {
            label: &descriptor.label,
            vertex: &vertex,
            fragment: &fragment,
            color_format: descriptor.color_format,
            depth_format: descriptor.depth_format,
            push_constant_size: descriptor.push_constant_size,
        })?;
        log::debug!("Created pipeline '{}'", descriptor.label);
        Ok(Arc::new(pipeline))
    }

    /// Wait until the queue is idle.
    pub fn wait_idle(&self) -> Result<(), FrameError> {
        self.backend.wait_idle()
    }
}

impl fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("backend", &self.backend.name())
            .field("slots", &self.slots)
            .finish()
    }
}

static_assertions::assert_impl_all!(GraphicsDevice: Send, Sync);

/// A view-slot holding a written view, returned to its pool on drop.
pub struct OwnedView {
    device: Arc<GraphicsDevice>,
    view: ViewHandle,
    slot: Option<SlotHandle>,
}

impl OwnedView {
    /// The view handle.
    pub fn view(&self) -> ViewHandle {
        self.view
    }

    /// Point the slot at a recreated texture.
    pub fn rewrite(&self, texture: &GpuTexture) -> Result<(), FrameError> {
        self.device.backend().write_view(self.view, texture)
    }
}

impl fmt::Debug for OwnedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedView").field(&self.view).finish()
    }
}

impl Drop for OwnedView {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.device.release_view(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::types::{Extent2d, TextureUsage};

    fn create_test_device() -> Arc<GraphicsDevice> {
        GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Dummy)).unwrap()
    }

    #[test]
    fn test_auto_without_window_uses_dummy() {
        let device = GraphicsDevice::new(DeviceParameters::new()).unwrap();
        assert_eq!(device.name(), "Dummy");
    }

    #[cfg(not(feature = "vulkan-backend"))]
    #[test]
    fn test_vulkan_without_feature_fails() {
        let result = GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Vulkan));
        assert!(matches!(result, Err(FrameError::InitializationFailed(_))));
    }

    #[test]
    fn test_create_and_release_view() {
        let backend = Arc::new(DummyBackend::new());
        let device = GraphicsDevice::from_parts(
            backend.clone(),
            SlotCapacities::default(),
            Arc::new(WgslCompiler::new()),
        )
        .unwrap();

        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                Extent2d::new(32, 32),
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            ))
            .unwrap();
        let srv = device
            .create_view(SlotCategory::ShaderResource, &texture)
            .unwrap();
        assert_eq!(backend.view_texture(srv.view()), Some(texture.id()));
        assert_eq!(device.slots().stats(SlotCategory::ShaderResource).in_use, 1);

        let view = srv.view();
        device.release_view(srv);
        assert_eq!(backend.view_texture(view), None);
        assert_eq!(device.slots().stats(SlotCategory::ShaderResource).in_use, 0);
    }

    #[test]
    fn test_owned_view_released_on_drop() {
        let device = create_test_device();
        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                Extent2d::new(8, 8),
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT,
            ))
            .unwrap();
        let view = device
            .create_owned_view(SlotCategory::RenderTarget, &texture)
            .unwrap();
        assert_eq!(view.view().category(), SlotCategory::RenderTarget);
        assert_eq!(device.slots().stats(SlotCategory::RenderTarget).in_use, 1);
        drop(view);
        assert_eq!(device.slots().stats(SlotCategory::RenderTarget).in_use, 0);
    }

    #[test]
    fn test_failed_view_write_returns_slot() {
        let device = create_test_device();
        let depth = device
            .create_texture(&TextureDescriptor::new_2d(
                Extent2d::new(8, 8),
                TextureFormat::Depth32Float,
                TextureUsage::RENDER_ATTACHMENT,
            ))
            .unwrap();
        assert!(device.create_view(SlotCategory::RenderTarget, &depth).is_err());
        assert_eq!(device.slots().stats(SlotCategory::RenderTarget).in_use, 0);
    }

    #[test]
    fn test_pipeline_compile_error_is_reported() {
        let device = create_test_device();
        let descriptor = FullscreenPipelineDescriptor::new(
            "broken",
            ShaderSource::wgsl("broken", "this is not wgsl"),
            TextureFormat::Rgba8Unorm,
        );
        assert!(matches!(
            device.create_fullscreen_pipeline(&descriptor),
            Err(FrameError::ShaderCompilationFailed(_))
        ));
    }
}
