// GPU buffers backed by gpu-allocator
//
// GpuBuffer owns a VkBuffer and its allocation and frees both on drop.
// StagedUpload batches host -> device copies into one single-use command
// buffer and keeps the staging buffers alive until the copy has completed.

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::command::{CommandPool, SingleUseCommands};
use super::device::Device;
use super::error::{RenderError, RenderResult, VkResultExt};

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    address: vk::DeviceAddress,
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl GpuBuffer {
    pub fn new(
        device: &Arc<Device>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RenderResult<Self> {
        if size == 0 {
            return Err(RenderError::fatal("create_buffer", format!("{name} is empty")));
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer =
            unsafe { device.device.create_buffer(&buffer_info, None) }.fatal("create_buffer")?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { device.device.destroy_buffer(buffer, None) };
                RenderError::fatal("allocate_buffer_memory", e)
            })?;

        // Partially built buffers are released by Drop from here on.
        let mut gpu_buffer = Self {
            buffer,
            size,
            address: 0,
            allocation: None,
            device: Arc::clone(device),
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .fatal("bind_buffer_memory");
        if let Err(e) = bound {
            if let Err(free_err) = device.allocator().free(allocation) {
                log::error!("Failed to free GPU allocation: {free_err}");
            }
            return Err(e);
        }
        gpu_buffer.allocation = Some(allocation);

        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
            gpu_buffer.address = unsafe { device.device.get_buffer_device_address(&info) };
        }

        Ok(gpu_buffer)
    }

    /// Device address, 0 unless created with `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// Copy `data` into a host-visible buffer.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> RenderResult<()> {
        self.write_bytes(bytemuck::cast_slice(data))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> RenderResult<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| RenderError::fatal("write_buffer", "allocation is not host-mapped"))?;

        if bytes.len() > mapped.len() {
            return Err(RenderError::fatal(
                "write_buffer",
                format!("{} bytes exceed buffer of {} bytes", bytes.len(), mapped.len()),
            ));
        }
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free GPU allocation: {e}");
            }
        }
    }
}

/// A batch of staged uploads sharing one single-use command buffer.
///
/// Dropping the batch without `finish` throws the recorded commands away.
pub struct StagedUpload<'a> {
    pool: &'a CommandPool,
    commands: Option<SingleUseCommands>,
    staging: Vec<GpuBuffer>,
    device: Arc<Device>,
}

impl<'a> StagedUpload<'a> {
    pub fn begin(device: &Arc<Device>, pool: &'a CommandPool) -> RenderResult<Self> {
        Ok(Self {
            pool,
            commands: Some(pool.begin_single_use()?),
            staging: Vec::new(),
            device: Arc::clone(device),
        })
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands
            .as_ref()
            .map_or(vk::CommandBuffer::null(), |c| c.command_buffer)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Create a device-local buffer and record a copy of `data` into it.
    /// `TRANSFER_DST` is added to `usage`.
    pub fn buffer<T: Pod>(
        &mut self,
        name: &str,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<GpuBuffer> {
        self.bytes(name, bytemuck::cast_slice(data), usage)
    }

    pub fn bytes(
        &mut self,
        name: &str,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<GpuBuffer> {
        let size = data.len() as vk::DeviceSize;
        let src = self.staging(&format!("{name} (staging)"), data)?;

        let buffer = GpuBuffer::new(
            &self.device,
            name,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device.device.cmd_copy_buffer(
                self.command_buffer(),
                src,
                buffer.buffer,
                &[region],
            )
        };

        Ok(buffer)
    }

    /// Create a host-visible buffer holding `data` whose lifetime ends with the batch.
    pub fn staging(&mut self, name: &str, data: &[u8]) -> RenderResult<vk::Buffer> {
        let mut staging = GpuBuffer::new(
            &self.device,
            name,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        staging.write_bytes(data)?;
        let buffer = staging.buffer;
        self.staging.push(staging);
        Ok(buffer)
    }

    /// Submit, wait for the queue to drain, then release the staging buffers.
    pub fn finish(mut self) -> RenderResult<()> {
        let commands = self
            .commands
            .take()
            .ok_or_else(|| RenderError::fatal("finish_upload", "upload already submitted"))?;
        // Staging buffers are released with `self`, after the queue drained.
        self.pool.submit_and_end(commands)
    }
}

impl Drop for StagedUpload<'_> {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            log::debug!("Discarding unfinished upload batch");
            self.pool.discard(commands);
        }
    }
}
