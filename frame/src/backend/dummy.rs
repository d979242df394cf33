//! Dummy GPU backend for testing and headless runs.
//!
//! This backend doesn't touch a GPU but simulates every observable piece of
//! one: view tables remember which texture each slot views, the timeline
//! fence is a real blocking primitive, the swapchain alternates between two
//! images, and submissions are validated and counted. An optional worker
//! thread delays fence signals to model GPU latency.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::commands::RecordedCommand;
use crate::error::FrameError;
use crate::resource::ResourceState;
use crate::shader::ShaderStage;
use crate::slots::{SlotCategory, ViewHandle, ViewTableLayout};
use crate::surface::SurfaceConfiguration;
use crate::types::{Extent2d, TextureDescriptor, TextureUsage};

use super::{
    GpuBackend, GpuPipeline, GpuSwapchain, GpuTexture, GpuTimeline, MAX_PUSH_CONSTANT_SIZE,
    PipelineDescriptor, RawPipeline, RawTexture, Submission, TextureId,
};

/// Distance between two slots of a dummy view table.
const VIEW_STRIDE: u32 = 32;

/// Timeline fence of the dummy backend.
#[derive(Debug)]
pub struct DummyTimeline {
    value: Mutex<u64>,
    signalled: Condvar,
}

impl DummyTimeline {
    fn new(initial_value: u64) -> Self {
        Self {
            value: Mutex::new(initial_value),
            signalled: Condvar::new(),
        }
    }

    /// Current completed value.
    pub fn value(&self) -> u64 {
        *self.value.lock()
    }

    fn signal(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
        }
        self.signalled.notify_all();
    }

    fn wait(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.signalled.wait(&mut current);
        }
    }
}

/// Swapchain of the dummy backend.
#[derive(Debug)]
pub struct DummySwapchain {
    extent: Extent2d,
    next: u32,
    acquired: Option<u32>,
}

/// Running totals of what the dummy backend has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DummyCounters {
    /// Queue submissions.
    pub submissions: u64,
    /// Commands executed across all submissions.
    pub commands: u64,
    /// Transition commands executed.
    pub transitions: u64,
    /// Render passes executed.
    pub passes: u64,
    /// Draw commands executed.
    pub draws: u64,
    /// Images presented.
    pub presents: u64,
    /// Textures created.
    pub textures_created: u64,
}

struct GpuWorker {
    sender: mpsc::Sender<(Arc<DummyTimeline>, u64)>,
    handle: JoinHandle<()>,
}

/// Dummy GPU backend.
pub struct DummyBackend {
    latency: Option<Duration>,
    worker: Mutex<Option<GpuWorker>>,
    view_tables: Mutex<HashMap<SlotCategory, Vec<Option<TextureId>>>>,
    counters: Mutex<DummyCounters>,
    repeat_next_image: AtomicBool,
}

impl DummyBackend {
    /// Create a dummy backend whose GPU completes work instantly.
    pub fn new() -> Self {
        Self::with_latency(None)
    }

    /// Create a dummy backend whose fence signals lag by `latency` each.
    pub fn with_latency(latency: Option<Duration>) -> Self {
        let worker = latency.and_then(|latency| match Self::spawn_worker(latency) {
            Ok(worker) => Some(worker),
            Err(e) => {
                log::warn!("DummyBackend: failed to spawn GPU worker, signalling inline: {e}");
                None
            }
        });
        Self {
            latency,
            worker: Mutex::new(worker),
            view_tables: Mutex::new(HashMap::new()),
            counters: Mutex::new(DummyCounters::default()),
            repeat_next_image: AtomicBool::new(false),
        }
    }

    fn spawn_worker(latency: Duration) -> std::io::Result<GpuWorker> {
        let (sender, receiver) = mpsc::channel::<(Arc<DummyTimeline>, u64)>();
        let handle = std::thread::Builder::new()
            .name("dummy-gpu-queue".into())
            .spawn(move || {
                for (timeline, value) in receiver {
                    std::thread::sleep(latency);
                    timeline.signal(value);
                }
            })?;
        Ok(GpuWorker { sender, handle })
    }

    /// Simulated latency of each fence signal.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Snapshot of the execution counters.
    pub fn counters(&self) -> DummyCounters {
        *self.counters.lock()
    }

    /// Make the next acquire hand out the most recently presented image
    /// again, as a mailbox-mode presentation engine may.
    pub fn repeat_next_image(&self) {
        self.repeat_next_image.store(true, Ordering::Relaxed);
    }

    fn dummy_swapchain(swapchain: &mut GpuSwapchain) -> Result<&mut DummySwapchain, FrameError> {
        match swapchain {
            GpuSwapchain::Dummy(swapchain) => Ok(swapchain),
            #[cfg(feature = "vulkan-backend")]
            _ => Err(FrameError::InvalidParameter(
                "swapchain belongs to another backend".into(),
            )),
        }
    }

    /// Texture currently written into a view-slot, if any.
    pub fn view_texture(&self, view: ViewHandle) -> Option<TextureId> {
        self.view_tables
            .lock()
            .get(&view.category())
            .and_then(|table| table.get(view.index() as usize).copied().flatten())
    }

    fn check_view(&self, view: ViewHandle, category: SlotCategory) -> Result<(), FrameError> {
        if view.category() != category {
            return Err(FrameError::InvalidParameter(format!(
                "expected a {category} view, got a {} view",
                view.category()
            )));
        }
        if self.view_texture(view).is_none() {
            return Err(FrameError::InvalidParameter(format!(
                "{} slot {} is empty",
                view.category(),
                view.index()
            )));
        }
        Ok(())
    }

    fn execute(&self, command: &RecordedCommand, counters: &mut DummyCounters) -> Result<(), FrameError> {
        log::trace!("DummyBackend: {command:?}");
        counters.commands += 1;
        match command {
            RecordedCommand::Transition(record) => {
                debug_assert_ne!(record.before, record.after);
                if record.after == ResourceState::Undefined {
                    return Err(FrameError::InvalidParameter(format!(
                        "texture '{}' transitioned to undefined",
                        record.texture.label()
                    )));
                }
                counters.transitions += 1;
            }
            RecordedCommand::BeginRendering { color, depth, .. } => {
                if let Some(color) = color {
                    self.check_view(color.view, SlotCategory::RenderTarget)?;
                }
                if let Some(depth) = depth {
                    self.check_view(depth.view, SlotCategory::DepthStencil)?;
                }
                counters.passes += 1;
            }
            RecordedCommand::BindInputs { color, depth } => {
                self.check_view(*color, SlotCategory::ShaderResource)?;
                if let Some(depth) = depth {
                    self.check_view(*depth, SlotCategory::ShaderResource)?;
                }
            }
            RecordedCommand::PushConstants(data) => {
                if data.len() as u32 > MAX_PUSH_CONSTANT_SIZE {
                    return Err(FrameError::InvalidParameter(format!(
                        "push constants of {} bytes exceed {MAX_PUSH_CONSTANT_SIZE}",
                        data.len()
                    )));
                }
            }
            RecordedCommand::Draw { .. } => counters.draws += 1,
            RecordedCommand::SetViewport(_)
            | RecordedCommand::SetScissor(_)
            | RecordedCommand::BindPipeline(_)
            | RecordedCommand::EndRendering => {}
        }
        Ok(())
    }

    fn swapchain_images(config: &SurfaceConfiguration) -> [GpuTexture; 2] {
        std::array::from_fn(|i| {
            let descriptor = TextureDescriptor::new_2d(
                Extent2d::new(config.width, config.height),
                config.format,
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::PRESENT,
            )
            .with_label(format!("swapchain image {i}"));
            GpuTexture::new(descriptor, RawTexture::Dummy)
        })
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DummyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyBackend")
            .field("latency", &self.latency)
            .field("counters", &self.counters())
            .finish()
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        if let Some(GpuWorker { sender, handle }) = self.worker.lock().take() {
            drop(sender);
            if handle.join().is_err() {
                log::warn!("DummyBackend: GPU worker panicked");
            }
        }
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_view_table(
        &self,
        category: SlotCategory,
        capacity: u32,
    ) -> Result<ViewTableLayout, FrameError> {
        log::trace!("DummyBackend: creating {category} view table ({capacity} slots)");
        self.view_tables
            .lock()
            .insert(category, vec![None; capacity as usize]);

        let base = (category.table_index() as u64 + 1) << 32;
        Ok(ViewTableLayout {
            cpu_base: base,
            gpu_base: category.is_shader_visible().then_some(base << 16),
            stride: VIEW_STRIDE,
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
            SlotCategory::ShaderResource => {
                descriptor.usage.contains(TextureUsage::TEXTURE_BINDING)
            }
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

        let mut tables = self.view_tables.lock();
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
        *slot = Some(texture.id());
        log::trace!(
            "DummyBackend: {} slot {} -> '{}'",
            view.category(),
            view.index(),
            texture.label()
        );
        Ok(())
    }

    fn clear_view(&self, view: ViewHandle) {
        if let Some(slot) = self
            .view_tables
            .lock()
            .get_mut(&view.category())
            .and_then(|table| table.get_mut(view.index() as usize))
        {
            *slot = None;
        }
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, FrameError> {
        if descriptor.size.is_empty() {
            return Err(FrameError::InvalidParameter(format!(
                "texture '{}' has zero size",
                descriptor.label_or_default()
            )));
        }
        log::trace!(
            "DummyBackend: creating texture {:?} ({})",
            descriptor.label,
            descriptor.size
        );
        self.counters.lock().textures_created += 1;
        Ok(GpuTexture::new(descriptor.clone(), RawTexture::Dummy))
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
        log::trace!("DummyBackend: creating pipeline '{}'", descriptor.label);
        Ok(GpuPipeline::new(
            descriptor.label,
            descriptor.push_constant_size,
            RawPipeline::Dummy,
        ))
    }

    fn create_timeline(&self, initial_value: u64) -> Result<GpuTimeline, FrameError> {
        Ok(GpuTimeline::Dummy(Arc::new(DummyTimeline::new(
            initial_value,
        ))))
    }

    fn timeline_value(&self, timeline: &GpuTimeline) -> Result<u64, FrameError> {
        match timeline {
            GpuTimeline::Dummy(timeline) => Ok(timeline.value()),
            #[cfg(feature = "vulkan-backend")]
            _ => Err(FrameError::InvalidParameter(
                "timeline belongs to another backend".into(),
            )),
        }
    }

    fn wait_timeline(&self, timeline: &GpuTimeline, value: u64) -> Result<(), FrameError> {
        match timeline {
            GpuTimeline::Dummy(timeline) => {
                timeline.wait(value);
                Ok(())
            }
            #[cfg(feature = "vulkan-backend")]
            _ => Err(FrameError::InvalidParameter(
                "timeline belongs to another backend".into(),
            )),
        }
    }

    fn signal_timeline(&self, timeline: &GpuTimeline, value: u64) -> Result<(), FrameError> {
        let timeline = match timeline {
            GpuTimeline::Dummy(timeline) => Arc::clone(timeline),
            #[cfg(feature = "vulkan-backend")]
            _ => {
                return Err(FrameError::InvalidParameter(
                    "timeline belongs to another backend".into(),
                ));
            }
        };

        let worker = self.worker.lock();
        match worker.as_ref() {
            Some(worker) => worker
                .sender
                .send((timeline, value))
                .map_err(|_| FrameError::DeviceLost),
            None => {
                timeline.signal(value);
                Ok(())
            }
        }
    }

    fn submit(&self, submission: Submission<'_>) -> Result<(), FrameError> {
        if let Some(GpuSwapchain::Dummy(swapchain)) = submission.swapchain.as_deref()
            && swapchain.acquired.is_none()
        {
            return Err(FrameError::InvalidParameter(
                "submission targets a swapchain without an acquired image".into(),
            ));
        }

        let mut counters = self.counters.lock();
        for command in submission.commands {
            self.execute(command, &mut counters)?;
        }
        counters.submissions += 1;
        log::trace!(
            "DummyBackend: submitted {} commands from frame slot {}",
            submission.commands.len(),
            submission.frame_slot
        );
        Ok(())
    }

    fn create_swapchain(
        &self,
        config: &SurfaceConfiguration,
    ) -> Result<(GpuSwapchain, [GpuTexture; 2]), FrameError> {
        log::trace!(
            "DummyBackend: creating swapchain {}x{} ({:?})",
            config.width,
            config.height,
            config.format
        );
        let swapchain = DummySwapchain {
            extent: Extent2d::new(config.width, config.height),
            next: 0,
            acquired: None,
        };
        Ok((
            GpuSwapchain::Dummy(swapchain),
            Self::swapchain_images(config),
        ))
    }

    fn resize_swapchain(
        &self,
        swapchain: &mut GpuSwapchain,
        config: &SurfaceConfiguration,
    ) -> Result<[GpuTexture; 2], FrameError> {
        let swapchain = Self::dummy_swapchain(swapchain)?;
        if swapchain.acquired.is_some() {
            return Err(FrameError::contract(
                "swapchain resized while an image is acquired",
            ));
        }
        swapchain.extent = Extent2d::new(config.width, config.height);
        swapchain.next = 0;
        log::trace!("DummyBackend: resized swapchain to {}", swapchain.extent);
        Ok(Self::swapchain_images(config))
    }

    fn acquire_image(&self, swapchain: &mut GpuSwapchain) -> Result<u32, FrameError> {
        let swapchain = Self::dummy_swapchain(swapchain)?;
        if let Some(index) = swapchain.acquired {
            return Err(FrameError::contract(format!(
                "swapchain image {index} acquired twice"
            )));
        }
        let index = if self.repeat_next_image.swap(false, Ordering::Relaxed) {
            (swapchain.next + 1) % 2
        } else {
            swapchain.next
        };
        swapchain.acquired = Some(index);
        Ok(index)
    }

    fn present(&self, swapchain: &mut GpuSwapchain, index: u32) -> Result<(), FrameError> {
        let swapchain = Self::dummy_swapchain(swapchain)?;
        if swapchain.acquired != Some(index) {
            return Err(FrameError::contract(format!(
                "presenting image {index} which is not acquired ({:?})",
                swapchain.acquired
            )));
        }
        swapchain.acquired = None;
        swapchain.next = (index + 1) % 2;
        self.counters.lock().presents += 1;
        log::trace!("DummyBackend: presented image {index}");
        Ok(())
    }

    fn release_image(&self, swapchain: &mut GpuSwapchain, index: u32) -> Result<(), FrameError> {
        let swapchain = Self::dummy_swapchain(swapchain)?;
        if swapchain.acquired == Some(index) {
            swapchain.acquired = None;
            log::trace!("DummyBackend: released image {index}");
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), FrameError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextureFormat;

    #[test]
    fn test_dummy_backend_name() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy");
    }

    #[test]
    fn test_swapchain_alternates() {
        let backend = DummyBackend::new();
        let (mut swapchain, images) = backend
            .create_swapchain(&SurfaceConfiguration::new(64, 32))
            .unwrap();
        assert_ne!(images[0].id(), images[1].id());

        let mut sequence = Vec::new();
        for _ in 0..4 {
            let index = backend.acquire_image(&mut swapchain).unwrap();
            backend.present(&mut swapchain, index).unwrap();
            sequence.push(index);
        }
        assert_eq!(sequence, vec![0, 1, 0, 1]);
        assert_eq!(backend.counters().presents, 4);
    }

    #[test]
    fn test_released_image_is_acquired_again() {
        let backend = DummyBackend::new();
        let (mut swapchain, _images) = backend
            .create_swapchain(&SurfaceConfiguration::new(8, 8))
            .unwrap();
        let index = backend.acquire_image(&mut swapchain).unwrap();
        backend.release_image(&mut swapchain, index).unwrap();
        assert_eq!(backend.acquire_image(&mut swapchain).unwrap(), index);
        assert_eq!(backend.counters().presents, 0);
    }

    #[test]
    fn test_repeat_next_image() {
        let backend = DummyBackend::new();
        let (mut swapchain, _images) = backend
            .create_swapchain(&SurfaceConfiguration::new(8, 8))
            .unwrap();
        let first = backend.acquire_image(&mut swapchain).unwrap();
        backend.present(&mut swapchain, first).unwrap();
        backend.repeat_next_image();
        assert_eq!(backend.acquire_image(&mut swapchain).unwrap(), first);
    }

    #[test]
    fn test_double_acquire_rejected() {
        let backend = DummyBackend::new();
        let (mut swapchain, _images) = backend
            .create_swapchain(&SurfaceConfiguration::new(8, 8))
            .unwrap();
        backend.acquire_image(&mut swapchain).unwrap();
        assert!(backend.acquire_image(&mut swapchain).is_err());
    }

    #[test]
    fn test_write_view_checks_compatibility() {
        let backend = DummyBackend::new();
        let layout = backend
            .create_view_table(SlotCategory::DepthStencil, 2)
            .unwrap();
        let mut pool = crate::slots::ViewSlotPool::new(SlotCategory::DepthStencil, 2, layout);
        let slot = pool.allocate().unwrap();

        let color = backend
            .create_texture(&TextureDescriptor::new_2d(
                Extent2d::new(4, 4),
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT,
            ))
            .unwrap();
        assert!(backend.write_view(slot.view(), &color).is_err());

        let depth = backend
            .create_texture(&TextureDescriptor::new_2d(
                Extent2d::new(4, 4),
                TextureFormat::Depth32Float,
                TextureUsage::RENDER_ATTACHMENT,
            ))
            .unwrap();
        backend.write_view(slot.view(), &depth).unwrap();
        assert_eq!(backend.view_texture(slot.view()), Some(depth.id()));

        backend.clear_view(slot.view());
        assert_eq!(backend.view_texture(slot.view()), None);
        pool.release(slot);
    }

    #[test]
    fn test_zero_sized_texture_rejected() {
        let backend = DummyBackend::new();
        let result = backend.create_texture(&TextureDescriptor::new_2d(
            Extent2d::new(0, 4),
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT,
        ));
        assert!(matches!(result, Err(FrameError::InvalidParameter(_))));
    }

    #[test]
    fn test_latency_worker_signals_in_order() {
        let backend = DummyBackend::with_latency(Some(Duration::from_millis(1)));
        let timeline = backend.create_timeline(0).unwrap();
        for value in 1..=4 {
            backend.signal_timeline(&timeline, value).unwrap();
        }
        backend.wait_timeline(&timeline, 4).unwrap();
        assert_eq!(backend.timeline_value(&timeline).unwrap(), 4);
    }
}
