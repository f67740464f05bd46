// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Queue family resolution against the window surface
// - Logical device + graphics/present queue creation
// - Feature chain (anisotropy, ray tracing)
// - Memory allocator setup

use ash::{extensions::khr, vk};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::c_char;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::error::{RenderError, RenderResult, VkResultExt};
use super::instance::GpuInstance;

/// Graphics and presentation queue families, resolved against one surface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// First-match resolution: the lowest graphics-capable family and the
    /// lowest family that can present, picked independently. Stops scanning
    /// once both are known.
    pub fn resolve(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> RenderResult<bool>,
    ) -> RenderResult<Self> {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(i);
            }
            if indices.present.is_none() && supports_present(i)? {
                indices.present = Some(i);
            }
            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut unique: Vec<u32> = self.graphics.into_iter().collect();
        if let Some(present) = self.present {
            if !unique.contains(&present) {
                unique.push(present);
            }
        }
        unique
    }
}

/// Logical device, its queues and the memory allocator.
pub struct Device {
    pub device: ash::Device,
    pub instance: Arc<GpuInstance>,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub graphics_family: u32,
    pub present_family: u32,

    pub ray_tracing: bool,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    allocator: ManuallyDrop<Mutex<Allocator>>,
}

impl Device {
    /// Create the logical device for a presentation surface.
    pub fn new(
        instance: Arc<GpuInstance>,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> RenderResult<Arc<Self>> {
        let physical_device = instance.physical_device;

        let families = unsafe {
            instance
                .instance
                .get_physical_device_queue_family_properties(physical_device)
        };
        let indices = QueueFamilyIndices::resolve(&families, |i| unsafe {
            surface_loader
                .get_physical_device_surface_support(physical_device, i, surface)
                .fatal("get_physical_device_surface_support")
        })?;

        let (Some(graphics_family), Some(present_family)) = (indices.graphics, indices.present)
        else {
            return Err(RenderError::fatal(
                "create_logical_device",
                format!("not all queue families have been found ({indices:?})"),
            ));
        };

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = indices
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const c_char> =
            instance.device_extensions.iter().map(|e| e.as_ptr()).collect();

        let mut buffer_address = vk::PhysicalDeviceBufferDeviceAddressFeatures::builder()
            .buffer_device_address(true)
            .build();
        let mut acceleration = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true)
            .build();
        let mut rt_pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
            .ray_tracing_pipeline(true)
            .build();

        let base_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .build();
        let mut features = vk::PhysicalDeviceFeatures2::builder().features(base_features);
        if instance.ray_tracing {
            features = features
                .push_next(&mut rt_pipeline)
                .push_next(&mut acceleration)
                .push_next(&mut buffer_address);
        }

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .fatal("create_logical_device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        log::info!("Selected GPU: {}", instance.device_name());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(instance.properties.api_version),
            vk::api_version_minor(instance.properties.api_version),
            vk::api_version_patch(instance.properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}",
            graphics_family,
            present_family
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: instance.ray_tracing,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::fatal("create_allocator", e))?;

        Ok(Arc::new(Self {
            device,
            ray_tracing: instance.ray_tracing,
            instance,
            graphics_queue,
            present_queue,
            graphics_family,
            present_family,
            memory_properties,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
        }))
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics: Some(self.graphics_family),
            present: Some(self.present_family),
        }
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Block until every queue is idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.fatal("device_wait_idle")
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // Allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn single_family_serves_both_roles() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let indices = QueueFamilyIndices::resolve(&families, |_| Ok(true)).unwrap();

        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(0));
        assert_eq!(indices.unique(), vec![0]);
    }

    #[test]
    fn lowest_index_wins_for_each_role_independently() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
        ];
        let present = [false, false, true, true];

        for _ in 0..3 {
            let indices =
                QueueFamilyIndices::resolve(&families, |i| Ok(present[i as usize])).unwrap();
            assert_eq!(indices.graphics, Some(1));
            assert_eq!(indices.present, Some(2));
        }
    }

    #[test]
    fn asymmetric_families_are_both_kept() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
        ];
        let indices = QueueFamilyIndices::resolve(&families, |i| Ok(i == 2)).unwrap();

        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(2));
        assert_eq!(indices.unique(), vec![0, 2]);
    }

    #[test]
    fn scanning_stops_once_complete() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let mut queried = Vec::new();
        let indices = QueueFamilyIndices::resolve(&families, |i| {
            queried.push(i);
            Ok(true)
        })
        .unwrap();

        assert!(indices.is_complete());
        assert_eq!(queried, vec![0]);
    }

    #[test]
    fn missing_present_support_is_incomplete() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::resolve(&families, |_| Ok(false)).unwrap();

        assert!(!indices.is_complete());
        assert_eq!(indices.present, None);
    }
}
