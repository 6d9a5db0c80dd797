//! Vulkan initialization: instance, device, queue, command pool and the
//! process-wide managers (memory, descriptors, shaders).
//!
//! Ray queries are enabled when requested and available; everything else
//! degrades to the rasterization-only path.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use log::{info, warn};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::path::PathBuf;

use crate::config::RenderConfig;
use crate::descriptors::DescriptorPool;
use crate::memory_manager::MemoryManager;
use crate::render_helpers::{self, SamplerDescription};
use crate::shader_manager::ShaderManager;

const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    c"VK_KHR_acceleration_structure",
    c"VK_KHR_ray_query",
    c"VK_KHR_deferred_host_operations",
];

/// Holds all core Vulkan state of the renderer.
///
/// `destroy` tears everything down in reverse creation order; the swapchain
/// and the render stages must be destroyed before it runs.
pub struct VulkanContext {
    pub memory_manager: MemoryManager,
    pub descriptor_pool: DescriptorPool,
    pub shader_manager: ShaderManager,
    /// Trilinear repeating sampler shared by material textures and IBL inputs.
    pub default_sampler: vk::Sampler,
    /// Nearest, clamped, unnormalized sampler for exact depth reads.
    pub texel_sampler: vk::Sampler,

    accel_struct_loader: Option<ash::khr::acceleration_structure::Device>,
    min_scratch_offset_alignment: u64,

    pub command_pool: vk::CommandPool,
    pub graphics_queue: vk::Queue,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    // Surface (windowed mode only)
    pub surface_loader: Option<ash::khr::surface::Instance>,
    pub swapchain_loader: Option<ash::khr::swapchain::Device>,
    pub surface: vk::SurfaceKHR,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    pub instance: ash::Instance,
    // Loader library; must outlive the instance.
    _entry: ash::Entry,

    destroyed: bool,
}

struct SelectedDevice {
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    ray_tracing_available: bool,
}

fn device_extension_names(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Vec<CString> {
    let extensions = unsafe {
        instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
    };
    extensions
        .iter()
        .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
        .collect()
}

fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> Result<SelectedDevice, String> {
    let physical_devices = unsafe {
        instance
            .enumerate_physical_devices()
            .map_err(|e| format!("Failed to enumerate physical devices: {:?}", e))?
    };

    if physical_devices.is_empty() {
        return Err("No Vulkan-capable GPUs found".to_string());
    }

    let mut selected: Option<(SelectedDevice, bool)> = None;

    for &phys_dev in &physical_devices {
        let props = unsafe { instance.get_physical_device_properties(phys_dev) };
        let api_version = props.api_version;

        if vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 2 {
            continue;
        }

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(phys_dev) };
        let graphics_family = queue_families.iter().enumerate().find(|(index, props)| {
            let presentable = match surface {
                Some((loader, surface)) => unsafe {
                    loader
                        .get_physical_device_surface_support(phys_dev, *index as u32, surface)
                        .unwrap_or(false)
                },
                None => true,
            };
            presentable
                && props
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        });

        let Some((family_idx, _)) = graphics_family else {
            continue;
        };

        let ext_names = device_extension_names(instance, phys_dev);
        let has_rt = RAY_TRACING_EXTENSIONS
            .iter()
            .all(|required| ext_names.iter().any(|name| name.as_c_str() == *required));
        let is_discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;

        let better = match &selected {
            None => true,
            Some((current, current_discrete)) => {
                (is_discrete && !current_discrete)
                    || (is_discrete == *current_discrete
                        && has_rt
                        && !current.ray_tracing_available)
            }
        };

        if better {
            let dev_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
            info!(
                "Candidate GPU: {} (Vulkan {}.{}, RT: {})",
                dev_name.to_string_lossy(),
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                if has_rt { "yes" } else { "no" }
            );
            selected = Some((
                SelectedDevice {
                    physical_device: phys_dev,
                    queue_family: family_idx as u32,
                    ray_tracing_available: has_rt,
                },
                is_discrete,
            ));
        }
    }

    selected
        .map(|(device, _)| device)
        .ok_or_else(|| "No suitable GPU found (need Vulkan 1.2+ with a graphics+compute queue)".to_string())
}

impl VulkanContext {
    /// Create the context. With `window` set, a surface is created and the
    /// selected queue family must be able to present to it.
    pub fn new(
        config: &RenderConfig,
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
    ) -> Result<Self, String> {
        let entry = unsafe {
            ash::Entry::load().map_err(|e| format!("Failed to load Vulkan: {}", e))?
        };

        // --- Instance ---
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"hybrid-renderer")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"hybrid-renderer")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 2, 0));

        let mut extension_names: Vec<*const c_char> = match window {
            Some((display_handle, _)) => ash_window::enumerate_required_extensions(display_handle)
                .map_err(|e| format!("Failed to enumerate surface extensions: {:?}", e))?
                .to_vec(),
            None => Vec::new(),
        };

        let mut layer_names: Vec<&CStr> = Vec::new();
        let enable_validation = cfg!(debug_assertions);
        let mut debug_utils_enabled = false;
        if enable_validation {
            let validation_layer = c"VK_LAYER_KHRONOS_validation";
            let available_layers = unsafe {
                entry
                    .enumerate_instance_layer_properties()
                    .unwrap_or_default()
            };
            let has_validation = available_layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == validation_layer
            });
            if has_validation {
                layer_names.push(validation_layer);
                extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
                debug_utils_enabled = true;
                info!("Validation layers enabled");
            } else {
                warn!("Validation layers requested but not available");
            }
        }

        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_name_ptrs)
            .enabled_extension_names(&extension_names);

        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|e| format!("Failed to create Vulkan instance: {:?}", e))?
        };

        // --- Debug messenger ---
        let (debug_utils_loader, debug_messenger) = if debug_utils_enabled {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));

            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&messenger_info, None)
                    .ok()
            };

            (Some(loader), messenger)
        } else {
            (None, None)
        };

        // --- Surface ---
        let (surface_loader, surface) = match window {
            Some((display_handle, window_handle)) => {
                let loader = ash::khr::surface::Instance::new(&entry, &instance);
                let surface = unsafe {
                    ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
                        .map_err(|e| format!("Failed to create surface: {:?}", e))?
                };
                (Some(loader), surface)
            }
            None => (None, vk::SurfaceKHR::null()),
        };

        // --- Physical device selection ---
        let selected = select_physical_device(
            &instance,
            surface_loader.as_ref().map(|loader| (loader, surface)),
        )?;
        let physical_device = selected.physical_device;

        let enable_rt = config.ray_tracing_enabled && selected.ray_tracing_available;
        if config.ray_tracing_enabled && !selected.ray_tracing_available {
            warn!("Ray tracing requested but the GPU lacks VK_KHR_acceleration_structure/VK_KHR_ray_query");
        }

        // --- Device creation ---
        let queue_priority = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(selected.queue_family)
            .queue_priorities(&queue_priority);
        let queue_create_infos = [queue_create_info];

        let mut device_extensions: Vec<*const c_char> = Vec::new();
        if surface_loader.is_some() {
            device_extensions.push(ash::khr::swapchain::NAME.as_ptr());
        }
        if enable_rt {
            device_extensions.extend(RAY_TRACING_EXTENSIONS.iter().map(|name| name.as_ptr()));
        }

        // Hit shading indexes per-mesh buffers and textures with divergent indices.
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .shader_sampled_image_array_non_uniform_indexing(enable_rt)
            .shader_storage_buffer_array_non_uniform_indexing(enable_rt);

        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true);

        let mut ray_query_features =
            vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(
                vk::PhysicalDeviceFeatures::default()
                    .shader_storage_image_write_without_format(true)
                    .fill_mode_non_solid(true),
            )
            .push_next(&mut vulkan_12_features);

        if enable_rt {
            features2 = features2
                .push_next(&mut accel_features)
                .push_next(&mut ray_query_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| format!("Failed to create logical device: {:?}", e))?
        };

        let graphics_queue = unsafe { device.get_device_queue(selected.queue_family, 0) };

        // --- Command pool ---
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(selected.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| format!("Failed to create command pool: {:?}", e))?
        };

        // --- gpu-allocator ---
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings::default(),
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| format!("Failed to create GPU allocator: {:?}", e))?;

        // --- Acceleration structure loader and properties ---
        let (accel_struct_loader, min_scratch_offset_alignment) = if enable_rt {
            let as_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);

            let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut as_props);
            unsafe {
                instance.get_physical_device_properties2(physical_device, &mut props2);
            }

            info!(
                "Acceleration structure properties: scratch_alignment={}, max_instances={}",
                as_props.min_acceleration_structure_scratch_offset_alignment,
                as_props.max_instance_count
            );

            (
                Some(as_loader),
                as_props.min_acceleration_structure_scratch_offset_alignment as u64,
            )
        } else {
            (None, 1)
        };

        let swapchain_loader = surface_loader
            .as_ref()
            .map(|_| ash::khr::swapchain::Device::new(&instance, &device));

        let descriptor_pool = DescriptorPool::new(device.clone(), enable_rt)?;
        let shader_manager = ShaderManager::new(
            device.clone(),
            PathBuf::from(&config.shader_dir),
            PathBuf::from(&config.shader_cache_dir),
        );
        let default_sampler = render_helpers::create_sampler(&device, &SamplerDescription::DEFAULT)?;
        let texel_sampler = render_helpers::create_sampler(&device, &SamplerDescription::TEXEL)?;

        info!("Vulkan context initialized successfully");

        Ok(VulkanContext {
            memory_manager: MemoryManager::new(device.clone(), allocator),
            descriptor_pool,
            shader_manager,
            default_sampler,
            texel_sampler,
            accel_struct_loader,
            min_scratch_offset_alignment,
            command_pool,
            graphics_queue,
            physical_device,
            device,
            surface_loader,
            swapchain_loader,
            surface,
            debug_utils_loader,
            debug_messenger,
            instance,
            _entry: entry,
            destroyed: false,
        })
    }

    /// Returns true if acceleration structures and ray queries are enabled.
    pub fn supports_rt(&self) -> bool {
        self.accel_struct_loader.is_some()
    }

    pub fn acceleration_structure_loader(
        &self,
    ) -> Result<&ash::khr::acceleration_structure::Device, String> {
        self.accel_struct_loader
            .as_ref()
            .ok_or_else(|| "Acceleration structures are not enabled on this device".to_string())
    }

    pub fn min_scratch_offset_alignment(&self) -> u64 {
        self.min_scratch_offset_alignment
    }

    /// GPU address of an acceleration structure, referenced by TLAS instances.
    pub fn acceleration_structure_address(
        &self,
        handle: vk::AccelerationStructureKHR,
    ) -> Result<vk::DeviceAddress, String> {
        let loader = self.acceleration_structure_loader()?;
        let info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        Ok(unsafe { loader.get_acceleration_structure_device_address(&info) })
    }

    pub fn wait_idle(&self) -> Result<(), String> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| format!("Failed to wait for device idle: {:?}", e))
        }
    }

    /// Allocate a primary command buffer from the shared pool.
    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>, String> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| format!("Failed to allocate command buffer: {:?}", e))
        }
    }

    /// Record commands into a one-shot command buffer, submit them and block
    /// until the GPU finishes. The command buffer and fence are released on
    /// every path, including a failing `record`.
    pub fn execute_one_time_commands<F>(&self, record: F) -> Result<(), String>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<(), String>,
    {
        let cmd = self.allocate_command_buffers(1)?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let result = unsafe {
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| format!("Failed to begin command buffer: {:?}", e))
        }
        .and_then(|()| record(cmd))
        .and_then(|()| self.submit_and_wait(cmd));

        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }

    fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<(), String> {
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| format!("Failed to end command buffer: {:?}", e))?;
        }

        let cmd_bufs = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_bufs);

        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe {
            self.device
                .create_fence(&fence_info, None)
                .map_err(|e| format!("Failed to create fence: {:?}", e))?
        };

        let result = unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
                .map_err(|e| format!("Failed to submit command buffer: {:?}", e))
                .and_then(|()| {
                    self.device
                        .wait_for_fences(&[fence], true, u64::MAX)
                        .map_err(|e| format!("Failed to wait for fence: {:?}", e))
                })
        };

        unsafe { self.device.destroy_fence(fence, None) };
        result
    }

    /// Explicitly destroy all Vulkan resources in reverse creation order.
    ///
    /// The Drop impl also calls this if it hasn't been called yet.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        unsafe {
            let _ = self.device.device_wait_idle();
        }

        unsafe {
            self.device.destroy_sampler(self.texel_sampler, None);
            self.device.destroy_sampler(self.default_sampler, None);
        }
        self.descriptor_pool.destroy();
        // Frees anything still alive and drops the allocator (needs device alive)
        self.memory_manager.destroy();

        if self.command_pool != vk::CommandPool::null() {
            unsafe {
                self.device.destroy_command_pool(self.command_pool, None);
            }
            self.command_pool = vk::CommandPool::null();
        }

        unsafe {
            self.device.destroy_device(None);

            if let Some(surface_loader) = &self.surface_loader {
                if self.surface != vk::SurfaceKHR::null() {
                    surface_loader.destroy_surface(self.surface, None);
                    self.surface = vk::SurfaceKHR::null();
                }
            }

            if let (Some(loader), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger.take())
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }

        info!("Vulkan context destroyed");
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Vulkan debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let msg = if callback_data.is_null() {
        "Unknown validation message".to_string()
    } else {
        let data = unsafe { &*callback_data };
        if data.p_message.is_null() {
            "Empty validation message".to_string()
        } else {
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {}", msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {}", msg);
    } else {
        log::info!("[Vulkan] {}", msg);
    }

    vk::FALSE
}
