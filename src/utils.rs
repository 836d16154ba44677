//! Host-side support for the demos, benches and integration tests.
//!
//! The sorter itself never allocates memory, creates a device or submits
//! work; that split is part of its contract. Everything in here exists so
//! the surrounding harnesses don't have to repeat the same ash boilerplate:
//! a one-queue device honoring a target's requirements, host-visible buffers
//! with device addresses, and blocking submit/readback.

use std::ffi::c_char;
use std::slice;

use ash::{vk, Device, Entry, Instance};
use log::debug;

use crate::{BufferInfo, Target};

/// A buffer with bound host-visible memory and a queried device address.
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub devaddr: vk::DeviceAddress,
    pub size: vk::DeviceSize,
}

/// Minimal compute context: one physical device, one queue, one command
/// pool. Only used by tests and demos; real integrations bring their own.
pub struct Context {
    _entry: Entry,
    instance: Instance,
    #[allow(dead_code)]
    physical_device: vk::PhysicalDevice,
    device: Device,
    queue_family_index: u32,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    timestamp_period: f32,
}

impl Context {
    /// Creates a device with everything `target` requires enabled.
    ///
    /// Returns `None` when no Vulkan runtime is installed or no device
    /// offers the required capabilities, so harnesses can skip instead of
    /// fail on machines without a suitable GPU.
    pub fn new(target: &Target<'_>) -> Option<Self> {
        let requirements = target.requirements();

        unsafe {
            let entry = match Entry::load() {
                Ok(entry) => entry,
                Err(err) => {
                    debug!("no Vulkan runtime: {err}");
                    return None;
                }
            };

            let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_2);
            let instance = entry
                .create_instance(
                    &vk::InstanceCreateInfo::default().application_info(&app_info),
                    None,
                )
                .ok()?;

            let Some((physical_device, queue_family_index)) =
                pick_device(&instance, &requirements.ext_names)
            else {
                debug!("no physical device offers the target's capabilities");
                instance.destroy_instance(None);
                return None;
            };

            let properties = instance.get_physical_device_properties(physical_device);
            let memory_properties = instance.get_physical_device_memory_properties(physical_device);

            let mut features11 = requirements.features11;
            let mut features12 = requirements.features12;
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .features(requirements.features)
                .push_next(&mut features11)
                .push_next(&mut features12);

            let ext_ptrs: Vec<*const c_char> =
                requirements.ext_names.iter().map(|name| name.as_ptr()).collect();
            let queue_priorities = [1.0];
            let queue_info = vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family_index)
                .queue_priorities(&queue_priorities);

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(slice::from_ref(&queue_info))
                .enabled_extension_names(&ext_ptrs)
                .push_next(&mut features2);

            let device = match instance.create_device(physical_device, &device_info, None) {
                Ok(device) => device,
                Err(err) => {
                    debug!("device creation failed: {err}");
                    instance.destroy_instance(None);
                    return None;
                }
            };

            let queue = device.get_device_queue(queue_family_index, 0);
            let command_pool = device
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                        .queue_family_index(queue_family_index),
                    None,
                )
                .unwrap();

            debug!(
                "sorting on {:?}",
                std::ffi::CStr::from_ptr(properties.device_name.as_ptr())
            );

            Some(Self {
                _entry: entry,
                instance,
                physical_device,
                device,
                queue_family_index,
                queue,
                command_pool,
                memory_properties,
                timestamp_period: properties.limits.timestamp_period,
            })
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// nanoseconds per timestamp tick
    pub fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    /// Allocates a host-visible storage buffer with a device address.
    /// `usage` adds to the storage/address/transfer-dst baseline every sort
    /// extent needs anyway.
    pub fn alloc(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> DeviceBuffer {
        unsafe {
            let buffer = self
                .device
                .create_buffer(
                    &vk::BufferCreateInfo::default()
                        .size(size)
                        .usage(
                            usage
                                | vk::BufferUsageFlags::STORAGE_BUFFER
                                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                                | vk::BufferUsageFlags::TRANSFER_DST,
                        )
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    None,
                )
                .unwrap();

            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let memory_type_index = self
                .find_memory_type(
                    requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
                .expect("no host-visible memory type");

            let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
                .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
            let memory = self
                .device
                .allocate_memory(
                    &vk::MemoryAllocateInfo::default()
                        .allocation_size(requirements.size)
                        .memory_type_index(memory_type_index)
                        .push_next(&mut flags_info),
                    None,
                )
                .unwrap();
            self.device.bind_buffer_memory(buffer, memory, 0).unwrap();

            let devaddr = self
                .device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer));

            DeviceBuffer {
                buffer,
                memory,
                devaddr,
                size,
            }
        }
    }

    /// descriptor for handing a whole [`DeviceBuffer`] to the sorter
    pub fn buffer_info(&self, buffer: &DeviceBuffer) -> BufferInfo {
        BufferInfo {
            buffer: buffer.buffer,
            offset: 0,
            devaddr: buffer.devaddr,
        }
    }

    pub fn upload<T: bytemuck::Pod>(&self, buffer: &DeviceBuffer, values: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        assert!(bytes.len() as u64 <= buffer.size);
        unsafe {
            let pointer = self
                .device
                .map_memory(buffer.memory, 0, bytes.len() as u64, vk::MemoryMapFlags::empty())
                .unwrap();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), pointer.cast(), bytes.len());
            self.device.unmap_memory(buffer.memory);
        }
    }

    pub fn download<T: bytemuck::Pod + Clone>(&self, buffer: &DeviceBuffer, count: usize) -> Vec<T> {
        let bytes = count * std::mem::size_of::<T>();
        assert!(bytes as u64 <= buffer.size);
        unsafe {
            let pointer = self
                .device
                .map_memory(buffer.memory, 0, bytes as u64, vk::MemoryMapFlags::empty())
                .unwrap();
            let values = slice::from_raw_parts(pointer.cast::<T>(), count).to_vec();
            self.device.unmap_memory(buffer.memory);
            return values;
        }
    }

    /// Records one command buffer, submits it and waits for the queue to
    /// drain. Good enough for tests; real integrations fence instead.
    pub fn onetime_submit(&self, record: impl FnOnce(vk::CommandBuffer)) {
        unsafe {
            let cmd = self
                .device
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(self.command_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )
                .unwrap()[0];

            self.device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .unwrap();
            record(cmd);
            self.device.end_command_buffer(cmd).unwrap();

            self.device
                .queue_submit(
                    self.queue,
                    slice::from_ref(&vk::SubmitInfo::default().command_buffers(slice::from_ref(&cmd))),
                    vk::Fence::null(),
                )
                .unwrap();
            self.device.queue_wait_idle(self.queue).unwrap();
            self.device
                .free_command_buffers(self.command_pool, slice::from_ref(&cmd));
        }
    }

    pub fn create_timestamp_pool(&self, capacity: u32) -> vk::QueryPool {
        unsafe {
            self.device
                .create_query_pool(
                    &vk::QueryPoolCreateInfo::default()
                        .query_type(vk::QueryType::TIMESTAMP)
                        .query_count(capacity),
                    None,
                )
                .unwrap()
        }
    }

    pub fn read_timestamps(&self, pool: vk::QueryPool, count: u32) -> Vec<u64> {
        let mut ticks = vec![0u64; count as usize];
        unsafe {
            self.device
                .get_query_pool_results(
                    pool,
                    0,
                    &mut ticks,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .unwrap();
        }
        return ticks;
    }

    pub fn destroy_timestamp_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    pub fn destroy_buffer(&self, buffer: DeviceBuffer) {
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
            self.device.free_memory(buffer.memory, None);
        }
    }

    fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_filter & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// first physical device with a compute queue, Vulkan 1.2 and all requested
/// extensions
unsafe fn pick_device(
    instance: &Instance,
    ext_names: &[&'static std::ffi::CStr],
) -> Option<(vk::PhysicalDevice, u32)> {
    for physical_device in instance.enumerate_physical_devices().ok()? {
        let properties = instance.get_physical_device_properties(physical_device);
        if properties.api_version < vk::API_VERSION_1_2 {
            continue;
        }

        let available = match instance.enumerate_device_extension_properties(physical_device) {
            Ok(available) => available,
            Err(_) => continue,
        };
        let has_all = ext_names.iter().all(|needed| {
            available.iter().any(|ext| {
                std::ffi::CStr::from_ptr(ext.extension_name.as_ptr()) == *needed
            })
        });
        if !has_all {
            debug!(
                "skipping {:?}: missing extensions",
                std::ffi::CStr::from_ptr(properties.device_name.as_ptr())
            );
            continue;
        }

        let queue_family = instance
            .get_physical_device_queue_family_properties(physical_device)
            .iter()
            .enumerate()
            .find(|(_, family)| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|(index, _)| index as u32);

        if let Some(queue_family_index) = queue_family {
            return Some((physical_device, queue_family_index));
        }
    }
    None
}
