// SPDX-License-Identifier: CEPL-1.0
//! `DeviceContext`: the root owner of every Vulkan object, and the ash
//! implementation of the device seam.

use std::ffi::CStr;
use std::time::Duration;

use ash::khr::swapchain;
use ash::vk;
use ember_render::device::{select_device, AdapterSource, QueueFamilyIndices};
use ember_render::gpu::{
    timeout_ns, AcquireOutcome, BufferAllocation, FenceStatus, Gpu, ImageSharing, PresentOutcome,
    QueueRole, Submission, SurfaceSupport, SwapchainDesc,
};
use ember_render::{RenderConfig, RenderError, RenderResult};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};

use crate::instance::{c_names, InstanceBundle};

/// First memory type allowed by `type_bits` that has every flag in `flags`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    (0..props.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize].property_flags.contains(flags)
        })
        .ok_or(RenderError::NoSuitableMemoryType { type_bits, flags })
}

/// Adapters of one instance, judged against one surface.
struct SurfaceAdapters<'a> {
    bundle: &'a InstanceBundle,
}

impl AdapterSource for SurfaceAdapters<'_> {
    type Adapter = vk::PhysicalDevice;

    fn adapters(&self) -> RenderResult<Vec<vk::PhysicalDevice>> {
        Ok(unsafe { self.bundle.instance().enumerate_physical_devices() }?)
    }

    fn adapter_name(&self, adapter: vk::PhysicalDevice) -> String {
        let props = unsafe { self.bundle.instance().get_physical_device_properties(adapter) };
        unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn graphics_families(&self, adapter: vk::PhysicalDevice) -> Vec<bool> {
        unsafe {
            self.bundle
                .instance()
                .get_physical_device_queue_family_properties(adapter)
        }
        .iter()
        .map(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .collect()
    }

    fn supports_present(&self, adapter: vk::PhysicalDevice, family: u32) -> RenderResult<bool> {
        Ok(unsafe {
            self.bundle.surface_loader().get_physical_device_surface_support(
                adapter,
                family,
                self.bundle.surface(),
            )
        }?)
    }

    fn extensions(&self, adapter: vk::PhysicalDevice) -> RenderResult<Vec<String>> {
        let props = unsafe {
            self.bundle
                .instance()
                .enumerate_device_extension_properties(adapter)
        }?;
        Ok(props
            .iter()
            .map(|e| {
                unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect())
    }

    fn surface_support(&self, adapter: vk::PhysicalDevice) -> RenderResult<SurfaceSupport> {
        query_surface(self.bundle, adapter)
    }
}

fn query_surface(bundle: &InstanceBundle, adapter: vk::PhysicalDevice) -> RenderResult<SurfaceSupport> {
    let loader = bundle.surface_loader();
    let surface = bundle.surface();
    unsafe {
        Ok(SurfaceSupport {
            capabilities: loader.get_physical_device_surface_capabilities(adapter, surface)?,
            formats: loader.get_physical_device_surface_formats(adapter, surface)?,
            present_modes: loader.get_physical_device_surface_present_modes(adapter, surface)?,
        })
    }
}

/// One queue per unique family, the given extensions enabled. Returns the
/// device with its graphics and present queues.
pub fn create_logical_device(
    instance: &ash::Instance,
    adapter: vk::PhysicalDevice,
    families: QueueFamilyIndices,
    extensions: &[String],
) -> RenderResult<(ash::Device, vk::Queue, vk::Queue)> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<_> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let names = c_names(extensions)?;
    let name_ptrs: Vec<_> = names.iter().map(|n| n.as_ptr()).collect();
    let features = vk::PhysicalDeviceFeatures::default();
    let info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&name_ptrs)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(adapter, &info, None) }
        .map_err(|e| RenderError::DeviceCreation(e.to_string()))?;
    let graphics = unsafe { device.get_device_queue(families.graphics, 0) };
    let present = unsafe { device.get_device_queue(families.present, 0) };
    Ok((device, graphics, present))
}

pub struct DeviceContext {
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    physical: vk::PhysicalDevice,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    families: QueueFamilyIndices,
    memory: vk::PhysicalDeviceMemoryProperties,
    adapter_name: String,
    // Dropped after `device` is destroyed in `Drop`.
    bundle: InstanceBundle,
}

impl DeviceContext {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        config: &RenderConfig,
    ) -> RenderResult<Self> {
        let bundle = InstanceBundle::new(window, display, config.validation)?;

        let source = SurfaceAdapters { bundle: &bundle };
        let selected = select_device(&source, &config.device_extensions)?;
        let adapter_name = source.adapter_name(selected.adapter);

        let (device, graphics_queue, present_queue) = create_logical_device(
            bundle.instance(),
            selected.adapter,
            selected.families,
            &config.device_extensions,
        )?;
        let swapchain_loader = swapchain::Device::new(bundle.instance(), &device);
        let memory = unsafe {
            bundle
                .instance()
                .get_physical_device_memory_properties(selected.adapter)
        };
        info!(
            "device ready on {adapter_name} ({} queue famil{})",
            selected.families.unique().len(),
            if selected.families.is_shared() { "y" } else { "ies" }
        );

        Ok(Self {
            device,
            swapchain_loader,
            physical: selected.adapter,
            graphics_queue,
            present_queue,
            families: selected.families,
            memory,
            adapter_name,
            bundle,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn queue(&self, role: QueueRole) -> vk::Queue {
        match role {
            QueueRole::Graphics => self.graphics_queue,
            QueueRole::Present => self.present_queue,
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
        debug!("logical device destroyed");
        // `bundle` drops next: messenger, surface, instance.
    }
}

impl Gpu for DeviceContext {
    fn queue_families(&self) -> QueueFamilyIndices {
        self.families
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None) }?)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None) }?)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> RenderResult<FenceStatus> {
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns(timeout)) } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RenderResult<()> {
        Ok(unsafe { self.device.reset_fences(fences) }?)
    }

    fn device_wait_idle(&self) -> RenderResult<()> {
        Ok(unsafe { self.device.device_wait_idle() }?)
    }

    fn create_command_pool(&self) -> RenderResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(unsafe { self.device.create_command_pool(&info, None) }?)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&info) }?)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        Ok(unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }?)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> RenderResult<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        Ok(unsafe { self.device.begin_command_buffer(cmd, &info) }?)
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        Ok(unsafe { self.device.end_command_buffer(cmd) }?)
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region))
        }
    }

    fn submit(&self, queue: QueueRole, submission: &Submission) -> RenderResult<()> {
        let cmds = [submission.command_buffer];
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
            submission.wait.into_iter().unzip();
        let signal: Vec<_> = submission.signal.into_iter().collect();
        let info = vk::SubmitInfo::default()
            .command_buffers(&cmds)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal);
        let fence = submission.fence.unwrap_or_else(vk::Fence::null);
        Ok(unsafe {
            self.device
                .queue_submit(self.queue(queue), std::slice::from_ref(&info), fence)
        }?)
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> RenderResult<BufferAllocation> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }?;

        let bind = || -> RenderResult<vk::DeviceMemory> {
            let req = unsafe { self.device.get_buffer_memory_requirements(buffer) };
            let type_index = find_memory_type(&self.memory, req.memory_type_bits, memory)?;
            let alloc = vk::MemoryAllocateInfo::default()
                .allocation_size(req.size)
                .memory_type_index(type_index);
            let mem = unsafe { self.device.allocate_memory(&alloc, None) }?;
            if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, mem, 0) } {
                unsafe { self.device.free_memory(mem, None) };
                return Err(e.into());
            }
            Ok(mem)
        };
        match bind() {
            Ok(mem) => Ok(BufferAllocation {
                buffer,
                memory: mem,
                size,
            }),
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    fn destroy_buffer(&self, allocation: BufferAllocation) {
        unsafe {
            self.device.destroy_buffer(allocation.buffer, None);
            self.device.free_memory(allocation.memory, None);
        }
    }

    fn write_mapped(&self, allocation: &BufferAllocation, bytes: &[u8]) -> RenderResult<()> {
        if bytes.len() as vk::DeviceSize > allocation.size {
            return Err(RenderError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        unsafe {
            let ptr = self.device.map_memory(
                allocation.memory,
                0,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(allocation.memory);
        }
        Ok(())
    }

    fn read_mapped(&self, allocation: &BufferAllocation, len: usize) -> RenderResult<Vec<u8>> {
        if len as vk::DeviceSize > allocation.size {
            return Err(RenderError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let mut out = vec![0u8; len];
        unsafe {
            let ptr = self.device.map_memory(
                allocation.memory,
                0,
                len as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), len);
            self.device.unmap_memory(allocation.memory);
        }
        Ok(out)
    }

    fn surface_support(&self) -> RenderResult<SurfaceSupport> {
        query_surface(&self.bundle, self.physical)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR> {
        let concurrent = match desc.sharing {
            ImageSharing::Concurrent(families) => Some(families),
            ImageSharing::Exclusive => None,
        };
        let families = concurrent.unwrap_or_default();

        let mut info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.bundle.surface())
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);
        info = if concurrent.is_some() {
            info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        Ok(unsafe { self.swapchain_loader.create_swapchain(&info, None) }?)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?)
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> RenderResult<vk::ImageView> {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(range);
        Ok(unsafe { self.device.create_image_view(&info, None) }?)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> RenderResult<vk::Framebuffer> {
        let attachments = [view];
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        Ok(unsafe { self.device.create_framebuffer(&info, None) }?)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> RenderResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                timeout_ns(timeout),
                signal,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                Err(RenderError::FenceTimeout(timeout))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let waits = [wait];
        let swapchains = [swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.swapchain_loader.queue_present(self.present_queue, &info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in p.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        p
    }

    #[test]
    fn memory_type_respects_bits_and_flags() {
        use vk::MemoryPropertyFlags as F;
        let p = props(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE,
            F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);
        assert_eq!(find_memory_type(&p, 0b111, F::DEVICE_LOCAL).unwrap(), 0);
        assert_eq!(
            find_memory_type(&p, 0b111, F::HOST_VISIBLE | F::HOST_COHERENT).unwrap(),
            2
        );
        // type 1 is host-visible but excluded by the requirement bits
        assert_eq!(find_memory_type(&p, 0b100, F::HOST_VISIBLE).unwrap(), 2);
        assert!(matches!(
            find_memory_type(&p, 0b010, F::DEVICE_LOCAL),
            Err(RenderError::NoSuitableMemoryType { type_bits: 0b010, .. })
        ));
    }
}
