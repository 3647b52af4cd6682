// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{c_void, CStr, CString};

use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use ember_render::{RenderError, RenderResult};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, error, info, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback struct for the duration of the call.
    let p_message = unsafe { (*data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

/// Loader entry, instance, surface and the optional debug messenger.
/// Dropping destroys messenger, surface and instance, in that order.
pub struct InstanceBundle {
    entry: Entry,
    instance: Instance,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

fn layer_available(entry: &Entry, name: &CStr) -> bool {
    // SAFETY: plain enumeration on a loaded entry.
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    layers
        .iter()
        .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == name)
}

unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
    validation: bool,
) -> RenderResult<Instance> {
    let app = c"ember";
    let app_info = vk::ApplicationInfo::default()
        .application_name(app)
        .engine_name(app)
        .api_version(vk::API_VERSION_1_0);

    let mut extensions = ash_window::enumerate_required_extensions(display_raw)
        .map_err(|e| RenderError::InstanceCreation(format!("required extensions: {e}")))?
        .to_vec();
    let layers: Vec<*const std::ffi::c_char> = if validation {
        extensions.push(debug_utils::NAME.as_ptr());
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| RenderError::InstanceCreation(e.to_string()))
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> RenderResult<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }?;
    Ok((loader, messenger))
}

impl InstanceBundle {
    /// Loads the Vulkan loader at runtime, then creates instance, debug
    /// messenger (when `validation` is set and the layer exists) and surface.
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        validation: bool,
    ) -> RenderResult<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?
            .as_raw();

        // SAFETY: the loaded library outlives every object created from it;
        // `entry` is stored next to them and dropped last.
        let entry = unsafe { Entry::load() }.map_err(|e| RenderError::Loader(e.to_string()))?;

        let validation = validation && {
            let ok = layer_available(&entry, VALIDATION_LAYER);
            if !ok {
                warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
            }
            ok
        };

        let instance = unsafe { create_instance(&entry, dh, validation) }?;
        let surface_loader = surface::Instance::new(&entry, &instance);
        // Assemble early so a failure below still tears the instance down.
        let mut bundle = InstanceBundle {
            entry,
            instance,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
            debug: None,
        };

        if validation {
            bundle.debug = Some(unsafe { create_debug_messenger(&bundle.entry, &bundle.instance) }?);
        }
        bundle.surface = unsafe {
            ash_window::create_surface(&bundle.entry, &bundle.instance, dh, wh, None)
        }
        .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?;

        info!(
            "Vulkan instance ready (validation {})",
            if validation { "on" } else { "off" }
        );
        Ok(bundle)
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }
}

impl Drop for InstanceBundle {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Device extension names as owned C strings, ready for create infos.
pub(crate) fn c_names(names: &[String]) -> RenderResult<Vec<CString>> {
    names
        .iter()
        .map(|n| {
            CString::new(n.as_str())
                .map_err(|_| RenderError::Config(format!("extension name {n:?} contains NUL")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_names_convert() {
        let names = c_names(&["VK_KHR_swapchain".to_owned()]).unwrap();
        assert_eq!(names[0].as_c_str(), ash::khr::swapchain::NAME);
        assert!(c_names(&["bad\0name".to_owned()]).is_err());
    }
}
