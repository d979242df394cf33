//! Texture memory.
//!
//! Every image this backend creates is a device-local render target or
//! sampled texture, so only `GpuOnly` memory is requested. Attachments at
//! surface size are recreated on every resize; the large ones get a
//! dedicated allocation so the memory goes straight back to the driver
//! instead of leaving holes in the shared blocks.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationSizes, AllocatorDebugSettings, MemoryLocation};
use parking_lot::Mutex;

use crate::error::FrameError;

/// Images at least this large skip the shared memory blocks.
const DEDICATED_IMAGE_BYTES: vk::DeviceSize = 16 * 1024 * 1024;

/// Create the allocator. Leaks are reported when it is dropped.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> Result<Allocator, FrameError> {
    let debug_settings = AllocatorDebugSettings {
        log_memory_information: log::log_enabled!(log::Level::Debug),
        log_leaks_on_shutdown: true,
        ..Default::default()
    };
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings,
        buffer_device_address: false,
        allocation_sizes: AllocationSizes::default(),
    })
    .map_err(|e| {
        FrameError::InitializationFailed(format!("Failed to create memory allocator: {e}"))
    })
}

fn image_scheme(image: vk::Image, requirements: &vk::MemoryRequirements) -> AllocationScheme {
    if requirements.size >= DEDICATED_IMAGE_BYTES {
        AllocationScheme::DedicatedImage(image)
    } else {
        AllocationScheme::GpuAllocatorManaged
    }
}

/// Allocate device-local memory for `image`. Binding is left to the caller.
pub(crate) fn allocate_image(
    allocator: &Mutex<Allocator>,
    device: &ash::Device,
    image: vk::Image,
    name: &str,
) -> Result<Allocation, FrameError> {
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let allocation_scheme = image_scheme(image, &requirements);
    log::trace!(
        "Vulkan: allocating {} bytes for '{name}' ({})",
        requirements.size,
        match allocation_scheme {
            AllocationScheme::GpuAllocatorManaged => "shared block",
            _ => "dedicated",
        }
    );
    allocator
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme,
        })
        .map_err(|e| {
            FrameError::ResourceCreationFailed(format!(
                "Failed to allocate {} bytes for '{name}': {e}",
                requirements.size
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_images_get_dedicated_memory() {
        let image = vk::Image::null();
        let small = vk::MemoryRequirements {
            size: 1024 * 1024,
            ..Default::default()
        };
        let large = vk::MemoryRequirements {
            size: DEDICATED_IMAGE_BYTES,
            ..Default::default()
        };
        assert!(matches!(
            image_scheme(image, &small),
            AllocationScheme::GpuAllocatorManaged
        ));
        assert!(matches!(
            image_scheme(image, &large),
            AllocationScheme::DedicatedImage(_)
        ));
    }
}
