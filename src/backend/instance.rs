// Vulkan Instance - backend entry point
//
// Responsibilities:
// - Verify required instance extensions / validation layers
// - Instance creation + debug messenger (validation builds only)
// - Physical device selection (first device with the required extensions)

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

use super::error::{RenderError, RenderResult, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions the renderer cannot run without.
pub fn required_device_extensions(ray_tracing: bool) -> Vec<&'static CStr> {
    let mut extensions = vec![khr::Swapchain::name()];
    if ray_tracing {
        extensions.extend([
            khr::DeferredHostOperations::name(),
            khr::AccelerationStructure::name(),
            khr::RayTracingPipeline::name(),
            vk::KhrBufferDeviceAddressFn::name(),
        ]);
    }
    extensions
}

/// Names from `requested` that are absent from `available`, in request order.
pub fn missing_names(requested: &[&CStr], available: &[&CStr]) -> Vec<String> {
    requested
        .iter()
        .filter(|name| !available.contains(name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Loaded Vulkan instance and the physical device chosen for rendering.
pub struct GpuInstance {
    pub entry: Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub device_extensions: Vec<&'static CStr>,
    pub layers: Vec<&'static CStr>,
    pub ray_tracing: bool,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl GpuInstance {
    /// Create the instance and pick a GPU.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Enable Khronos validation + debug messenger
    /// * `ray_tracing` - Require acceleration-structure / ray-tracing extensions
    /// * `display` - Window-system display, decides the surface extensions
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        ray_tracing: bool,
        display: RawDisplayHandle,
    ) -> RenderResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| RenderError::fatal("load_vulkan", e))?;

        if let Ok(Some(version)) = entry.try_enumerate_instance_version() {
            log::info!(
                "System supports Vulkan variant {}, {}.{}.{}",
                vk::api_version_variant(version),
                vk::api_version_major(version),
                vk::api_version_minor(version),
                vk::api_version_patch(version)
            );
        }

        let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
            .fatal("enumerate_required_extensions")?
            .to_vec();
        let layers = if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            vec![VALIDATION_LAYER]
        } else {
            Vec::new()
        };

        Self::check_instance_support(&entry, &extensions, &layers)?;

        let instance = Self::create_instance(&entry, app_name, &extensions, &layers)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let device_extensions = required_device_extensions(ray_tracing);
        let physical_device = Self::pick_physical_device(&instance, &device_extensions)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        Ok(Self {
            entry,
            instance,
            physical_device,
            properties,
            device_extensions,
            layers,
            ray_tracing,
            debug_utils,
        })
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn check_instance_support(
        entry: &Entry,
        extensions: &[*const c_char],
        layers: &[&CStr],
    ) -> RenderResult<()> {
        let supported_extensions = entry
            .enumerate_instance_extension_properties(None)
            .fatal("enumerate_instance_extension_properties")?;
        let supported_layers = entry
            .enumerate_instance_layer_properties()
            .fatal("enumerate_instance_layer_properties")?;

        let extension_names: Vec<&CStr> = supported_extensions
            .iter()
            .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) })
            .collect();
        let layer_names: Vec<&CStr> = supported_layers
            .iter()
            .map(|p| unsafe { CStr::from_ptr(p.layer_name.as_ptr()) })
            .collect();

        if cfg!(debug_assertions) {
            log::debug!("Supported instance extensions:");
            for name in &extension_names {
                log::debug!("\t{}", name.to_string_lossy());
            }
            log::debug!("Supported layers:");
            for name in &layer_names {
                log::debug!("\t{}", name.to_string_lossy());
            }
        }

        let requested: Vec<&CStr> = extensions
            .iter()
            .map(|&p| unsafe { CStr::from_ptr(p) })
            .collect();

        let mut missing = missing_names(&requested, &extension_names);
        missing.extend(missing_names(layers, &layer_names));
        if !missing.is_empty() {
            return Err(RenderError::fatal(
                "check_instance_support",
                format!("unsupported extensions/layers: {}", missing.join(", ")),
            ));
        }
        Ok(())
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        extensions: &[*const c_char],
        layers: &[&CStr],
    ) -> RenderResult<ash::Instance> {
        let app_name_cstr =
            CString::new(app_name).map_err(|e| RenderError::fatal("create_instance", e))?;
        let engine_name = c"Photon";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(extensions)
            .enabled_layer_names(&layer_ptrs);

        unsafe { entry.create_instance(&create_info, None) }.fatal("create_instance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> RenderResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .fatal("create_debug_utils_messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        required: &[&CStr],
    ) -> RenderResult<vk::PhysicalDevice> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .fatal("enumerate_physical_devices")?;

        log::info!("Devices:");
        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
            log::info!("\tDevice name: {}", name.to_string_lossy());

            let available = unsafe { instance.enumerate_device_extension_properties(device) }
                .fatal("enumerate_device_extension_properties")?;
            let available: Vec<&CStr> = available
                .iter()
                .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) })
                .collect();

            if missing_names(required, &available).is_empty() {
                log::info!("\tSelected physical device: {}", name.to_string_lossy());
                return Ok(device);
            }
        }

        Err(RenderError::fatal(
            "pick_physical_device",
            "no physical device supports the required extensions",
        ))
    }
}

impl Drop for GpuInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Error-severity messages abort the process.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {:?}] {}", message_type, message);
            std::process::abort();
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan {:?}] {}", message_type, message);
        }
        _ => {
            log::trace!("[Vulkan {:?}] {}", message_type, message);
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_is_always_required() {
        let raster = required_device_extensions(false);
        assert_eq!(raster, vec![khr::Swapchain::name()]);

        let rt = required_device_extensions(true);
        assert_eq!(rt[0], khr::Swapchain::name());
        assert!(rt.contains(&khr::AccelerationStructure::name()));
        assert!(rt.contains(&khr::RayTracingPipeline::name()));
        assert!(rt.contains(&khr::DeferredHostOperations::name()));
    }

    #[test]
    fn missing_names_reports_only_absent_entries() {
        let available = [c"VK_KHR_surface", c"VK_KHR_xcb_surface"];
        assert!(missing_names(&[c"VK_KHR_surface"], &available).is_empty());

        let missing = missing_names(
            &[c"VK_KHR_surface", c"VK_EXT_debug_utils", VALIDATION_LAYER],
            &available,
        );
        assert_eq!(missing, vec!["VK_EXT_debug_utils", "VK_LAYER_KHRONOS_validation"]);
    }
}
