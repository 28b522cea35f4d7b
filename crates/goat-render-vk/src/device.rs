// SPDX-License-Identifier: CEPL-1.0
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::vk::{self, Handle};
use bitflags::bitflags;
use goat_render::RenderError;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_void, CStr};
use tracing::{debug, error, info, trace, warn};

pub(crate) const DISCRETE_GPU_BONUS: u64 = 10_000;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

bitflags! {
    /// What a physical device offers for presenting to our surface.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct DeviceSupport: u8 {
        const GRAPHICS_QUEUE = 1 << 0;
        const PRESENT_QUEUE = 1 << 1;
        const SWAPCHAIN_EXTENSION = 1 << 2;
        const SURFACE_FORMATS = 1 << 3;
        const PRESENT_MODES = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub(crate) fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub(crate) fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct QueueCaps {
    pub graphics: bool,
    pub present: bool,
}

/// Prefers one family that does both; otherwise the first of each.
pub(crate) fn pick_queue_families(caps: &[QueueCaps]) -> (Option<u32>, Option<u32>) {
    if let Some(i) = caps.iter().position(|c| c.graphics && c.present) {
        return (Some(i as u32), Some(i as u32));
    }
    let graphics = caps.iter().position(|c| c.graphics).map(|i| i as u32);
    let present = caps.iter().position(|c| c.present).map(|i| i as u32);
    (graphics, present)
}

#[derive(Clone, Debug)]
pub(crate) struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub support: DeviceSupport,
    pub families: Option<QueueFamilies>,
}

/// Zero means unusable.
pub(crate) fn score_device(c: &DeviceCandidate) -> u64 {
    if !c.support.contains(DeviceSupport::all()) || c.families.is_none() {
        return 0;
    }
    let mut score = 0;
    if c.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += DISCRETE_GPU_BONUS;
    }
    score + u64::from(c.max_image_dimension_2d)
}

/// Index of the highest-scoring candidate. The first one wins ties.
pub(crate) fn select_device(candidates: &[DeviceCandidate]) -> Result<usize, RenderError> {
    if candidates.is_empty() {
        return Err(RenderError::NoDevice);
    }
    let mut best: Option<(usize, u64)> = None;
    for (i, c) in candidates.iter().enumerate() {
        let score = score_device(c);
        debug!(device = %c.name, score, support = ?c.support, "scored physical device");
        if score > best.map_or(0, |(_, s)| s) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i).ok_or(RenderError::UnsuitableDevice)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", "{msg}");
    } else {
        trace!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

/// Instance-scoped objects. Dropped after the logical device.
struct InstanceParts {
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
}

impl Drop for InstanceParts {
    fn drop(&mut self) {
        unsafe {
            if self.surface.as_raw() != 0 {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance, surface, chosen physical device, logical device and its queues.
pub(crate) struct DeviceContext {
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    parts: InstanceParts,
}

impl DeviceContext {
    pub(crate) fn instance(&self) -> &ash::Instance {
        &self.parts.instance
    }

    pub(crate) fn surface(&self) -> vk::SurfaceKHR {
        self.parts.surface
    }

    pub(crate) fn surface_loader(&self) -> &surface::Instance {
        &self.parts.surface_loader
    }

    /// # Safety
    /// The handles must refer to a live window for the lifetime of the context.
    pub(crate) unsafe fn create(
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self, RenderError> {
        // STRICT ORDER: instance, debug messenger, surface, then the device
        // chosen against that surface.
        let entry = ash::Entry::load()
            .map_err(|e| RenderError::InstanceCreation(format!("loading Vulkan: {e}")))?;
        let validation = cfg!(debug_assertions) && has_validation_layer(&entry);
        let instance = create_instance(&entry, display, validation)?;

        let mut parts = InstanceParts {
            surface_loader: surface::Instance::new(&entry, &instance),
            debug: None,
            surface: vk::SurfaceKHR::null(),
            entry,
            instance,
        };
        if validation {
            parts.debug = create_debug_messenger(&parts.entry, &parts.instance);
        }
        parts.surface =
            ash_window::create_surface(&parts.entry, &parts.instance, display, window, None)
                .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?;

        let (phys, candidate) = pick_physical_device(&parts)?;
        let families = candidate
            .families
            .ok_or(RenderError::UnsuitableDevice)?;
        info!(
            device = %candidate.name,
            kind = ?candidate.device_type,
            graphics_family = families.graphics,
            present_family = families.present,
            "selected physical device"
        );

        let device = create_logical_device(&parts.instance, phys, families)?;
        let graphics_queue = device.get_device_queue(families.graphics, 0);
        let present_queue = device.get_device_queue(families.present, 0);
        let memory_properties = parts.instance.get_physical_device_memory_properties(phys);

        Ok(Self {
            phys,
            device,
            families,
            graphics_queue,
            present_queue,
            memory_properties,
            parts,
        })
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // Device first; `parts` then drops surface, messenger and instance.
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
    }
}

unsafe fn has_validation_layer(entry: &ash::Entry) -> bool {
    let found = entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
    if !found {
        warn!("validation layer not installed, continuing without it");
    }
    found
}

unsafe fn create_instance(
    entry: &ash::Entry,
    display: RawDisplayHandle,
    validation: bool,
) -> Result<ash::Instance, RenderError> {
    let app_name = c"GoatEditor";
    let engine_name = c"GoatEngine";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app_name.as_ptr(),
        application_version: vk::make_api_version(0, 0, 1, 0),
        p_engine_name: engine_name.as_ptr(),
        engine_version: vk::make_api_version(0, 0, 1, 0),
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display)
        .map_err(|e| RenderError::InstanceCreation(format!("required extensions: {e}")))?
        .to_vec();
    let layers = [VALIDATION_LAYER.as_ptr()];
    if validation {
        extensions.push(ext_debug::NAME.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: if validation { layers.len() as u32 } else { 0 },
        pp_enabled_layer_names: if validation {
            layers.as_ptr()
        } else {
            std::ptr::null()
        },
        ..Default::default()
    };

    entry
        .create_instance(&create_info, None)
        .map_err(|e| RenderError::InstanceCreation(e.to_string()))
}

/// Validation output is optional; failure only costs diagnostics.
unsafe fn create_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match loader.create_debug_utils_messenger(&ci, None) {
        Ok(m) => Some((loader, m)),
        Err(e) => {
            warn!("debug messenger unavailable: {e}");
            None
        }
    }
}

unsafe fn describe_device(parts: &InstanceParts, phys: vk::PhysicalDevice) -> DeviceCandidate {
    let instance = &parts.instance;
    let props = instance.get_physical_device_properties(phys);
    let name = CStr::from_ptr(props.device_name.as_ptr())
        .to_string_lossy()
        .into_owned();

    let caps: Vec<QueueCaps> = instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .enumerate()
        .map(|(i, q)| QueueCaps {
            graphics: q.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            present: parts
                .surface_loader
                .get_physical_device_surface_support(phys, i as u32, parts.surface)
                .unwrap_or(false),
        })
        .collect();
    let (graphics, present) = pick_queue_families(&caps);

    let mut support = DeviceSupport::empty();
    support.set(DeviceSupport::GRAPHICS_QUEUE, graphics.is_some());
    support.set(DeviceSupport::PRESENT_QUEUE, present.is_some());

    let has_swapchain = instance
        .enumerate_device_extension_properties(phys)
        .unwrap_or_default()
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);
    support.set(DeviceSupport::SWAPCHAIN_EXTENSION, has_swapchain);

    // Surface queries only make sense once the extension is there.
    if has_swapchain {
        let formats = parts
            .surface_loader
            .get_physical_device_surface_formats(phys, parts.surface)
            .unwrap_or_default();
        let modes = parts
            .surface_loader
            .get_physical_device_surface_present_modes(phys, parts.surface)
            .unwrap_or_default();
        support.set(DeviceSupport::SURFACE_FORMATS, !formats.is_empty());
        support.set(DeviceSupport::PRESENT_MODES, !modes.is_empty());
    }

    DeviceCandidate {
        name,
        device_type: props.device_type,
        max_image_dimension_2d: props.limits.max_image_dimension2_d,
        support,
        families: graphics
            .zip(present)
            .map(|(graphics, present)| QueueFamilies { graphics, present }),
    }
}

unsafe fn pick_physical_device(
    parts: &InstanceParts,
) -> Result<(vk::PhysicalDevice, DeviceCandidate), RenderError> {
    let devices = parts
        .instance
        .enumerate_physical_devices()
        .map_err(|e| RenderError::DeviceCreation(format!("enumerating devices: {e}")))?;
    let candidates: Vec<DeviceCandidate> = devices
        .iter()
        .map(|&phys| describe_device(parts, phys))
        .collect();
    let idx = select_device(&candidates)?;
    Ok((devices[idx], candidates[idx].clone()))
}

unsafe fn create_logical_device(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
) -> Result<ash::Device, RenderError> {
    let priorities = [1.0f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let extensions = [swapchain::NAME.as_ptr()];
    let features = vk::PhysicalDeviceFeatures::default();
    let create_info = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };

    instance
        .create_device(phys, &create_info, None)
        .map_err(|e| RenderError::DeviceCreation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        dim: u32,
        support: DeviceSupport,
    ) -> DeviceCandidate {
        DeviceCandidate {
            name: name.into(),
            device_type,
            max_image_dimension_2d: dim,
            support,
            families: Some(QueueFamilies {
                graphics: 0,
                present: 0,
            }),
        }
    }

    #[test]
    fn discrete_gpu_outscores_integrated() {
        let integrated = candidate(
            "igpu",
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            16384,
            DeviceSupport::all(),
        );
        let discrete = candidate(
            "dgpu",
            vk::PhysicalDeviceType::DISCRETE_GPU,
            8192,
            DeviceSupport::all(),
        );
        assert_eq!(score_device(&integrated), 16384);
        assert_eq!(score_device(&discrete), 18192);
        assert_eq!(select_device(&[integrated, discrete]), Ok(1));
    }

    #[test]
    fn lacking_swapchain_scores_zero() {
        let c = candidate(
            "no-swapchain",
            vk::PhysicalDeviceType::DISCRETE_GPU,
            4096,
            DeviceSupport::all() - DeviceSupport::SWAPCHAIN_EXTENSION,
        );
        assert_eq!(score_device(&c), 0);
    }

    #[test]
    fn missing_queue_families_score_zero() {
        let mut c = candidate(
            "headless",
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            4096,
            DeviceSupport::all(),
        );
        c.families = None;
        assert_eq!(score_device(&c), 0);
    }

    #[test]
    fn all_unsuitable_is_an_error() {
        let a = candidate(
            "a",
            vk::PhysicalDeviceType::DISCRETE_GPU,
            8192,
            DeviceSupport::GRAPHICS_QUEUE,
        );
        let b = candidate(
            "b",
            vk::PhysicalDeviceType::CPU,
            4096,
            DeviceSupport::empty(),
        );
        let err = select_device(&[a, b]).unwrap_err();
        assert_eq!(err, RenderError::UnsuitableDevice);
        assert_eq!(err.to_string(), "all devices found were unsuitable");
    }

    #[test]
    fn no_devices_is_an_error() {
        let err = select_device(&[]).unwrap_err();
        assert_eq!(err, RenderError::NoDevice);
        assert_eq!(err.to_string(), "no physical devices found");
    }

    #[test]
    fn ties_keep_the_first_device() {
        let a = candidate(
            "first",
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            4096,
            DeviceSupport::all(),
        );
        let b = candidate(
            "second",
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            4096,
            DeviceSupport::all(),
        );
        assert_eq!(select_device(&[a, b]), Ok(0));
    }

    #[test]
    fn prefers_a_family_that_does_both() {
        let caps = [
            QueueCaps {
                graphics: true,
                present: false,
            },
            QueueCaps {
                graphics: false,
                present: true,
            },
            QueueCaps {
                graphics: true,
                present: true,
            },
        ];
        assert_eq!(pick_queue_families(&caps), (Some(2), Some(2)));
    }

    #[test]
    fn falls_back_to_separate_families() {
        let caps = [
            QueueCaps {
                graphics: false,
                present: true,
            },
            QueueCaps {
                graphics: true,
                present: false,
            },
        ];
        assert_eq!(pick_queue_families(&caps), (Some(1), Some(0)));
        let fam = QueueFamilies {
            graphics: 1,
            present: 0,
        };
        assert!(!fam.is_shared());
        assert_eq!(fam.unique(), vec![1, 0]);
    }

    #[test]
    fn no_present_queue() {
        let caps = [QueueCaps {
            graphics: true,
            present: false,
        }];
        assert_eq!(pick_queue_families(&caps), (Some(0), None));
        assert_eq!(pick_queue_families(&[]), (None, None));
    }
}
