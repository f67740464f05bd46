// Scene builder - geometry upload and acceleration structures
//
// Order of use: load_model (any number) -> build_blas -> build_tlas ->
// upload_descriptors. Every step submits and waits for the graphics queue, so
// results are complete when the call returns.

use ash::{extensions::khr, vk};
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use super::scene::{MeshData, ObjDesc, ObjInstance, VertexObj};
use super::texture::Texture;
use crate::backend::buffer::{GpuBuffer, StagedUpload};
use crate::backend::command::CommandPool;
use crate::backend::device::Device;
use crate::backend::error::{RenderError, RenderResult, VkResultExt};

/// Device buffers of one loaded model.
pub struct ModelBuffers {
    pub vertex_count: u32,
    pub index_count: u32,
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub materials: GpuBuffer,
    pub material_indices: GpuBuffer,
}

/// Geometry and build range for one bottom-level structure.
pub struct BlasInput {
    pub geometry: vk::AccelerationStructureGeometryKHR,
    pub range: vk::AccelerationStructureBuildRangeInfoKHR,
}

impl BlasInput {
    /// One opaque triangle geometry over the model's vertex and index buffers.
    pub fn from_model(model: &ModelBuffers) -> Self {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: model.vertices.device_address(),
            })
            .vertex_stride(std::mem::size_of::<VertexObj>() as vk::DeviceSize)
            .max_vertex(model.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: model.indices.device_address(),
            })
            .build();

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build();

        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: model.index_count / 3,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        Self { geometry, range }
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two, or 0 for none).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Orders the instance buffer copy before the top-level build reads it.
pub fn instance_upload_barrier() -> vk::MemoryBarrier {
    vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::SHADER_READ,
        )
        .build()
}

/// Scratch memory for one build. `address` honors the device's scratch
/// offset alignment and lies inside `buffer`.
struct Scratch {
    address: vk::DeviceAddress,
    _buffer: GpuBuffer,
}

pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    pub buffer: GpuBuffer,
}

pub struct SceneBuilder {
    device: Arc<Device>,
    loader: khr::AccelerationStructure,
    scratch_alignment: u64,
    models: Vec<ModelBuffers>,
    instances: Vec<ObjInstance>,
    descs: Vec<ObjDesc>,
    textures: Vec<Texture>,
    blas: Vec<AccelerationStructure>,
    tlas: Option<AccelerationStructure>,
    instance_buffer: Option<GpuBuffer>,
    desc_buffer: Option<GpuBuffer>,
}

impl SceneBuilder {
    pub fn new(device: Arc<Device>) -> RenderResult<Self> {
        if !device.ray_tracing {
            return Err(RenderError::fatal(
                "create_scene_builder",
                "device was created without ray tracing support",
            ));
        }
        let loader = khr::AccelerationStructure::new(&device.instance.instance, &device.device);

        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties = vk::PhysicalDeviceProperties2::builder().push_next(&mut as_properties);
        unsafe {
            device
                .instance
                .instance
                .get_physical_device_properties2(device.instance.physical_device, &mut properties)
        };
        let scratch_alignment =
            u64::from(as_properties.min_acceleration_structure_scratch_offset_alignment);
        log::debug!("Acceleration structure scratch alignment: {scratch_alignment}");

        Ok(Self {
            device,
            loader,
            scratch_alignment,
            models: Vec::new(),
            instances: Vec::new(),
            descs: Vec::new(),
            textures: Vec::new(),
            blas: Vec::new(),
            tlas: None,
            instance_buffer: None,
            desc_buffer: None,
        })
    }

    pub fn models(&self) -> &[ModelBuffers] {
        &self.models
    }

    pub fn instances(&self) -> &[ObjInstance] {
        &self.instances
    }

    pub fn textures(&self) -> &[Texture] {
        &self.textures
    }

    pub fn tlas(&self) -> Option<vk::AccelerationStructureKHR> {
        self.tlas.as_ref().map(|t| t.handle)
    }

    /// Device address of the uploaded `ObjDesc` array.
    pub fn descriptors_address(&self) -> Option<vk::DeviceAddress> {
        self.desc_buffer.as_ref().map(GpuBuffer::device_address)
    }

    /// Load an OBJ file, upload its buffers and place one instance of it.
    pub fn load_model(
        &mut self,
        pool: &CommandPool,
        path: &Path,
        transform: Mat4,
    ) -> RenderResult<()> {
        log::info!("Loading file: {}", path.display());

        let file = File::open(path).map_err(|source| RenderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let (models, materials) = tobj::load_obj_buf(
            &mut BufReader::new(file),
            &tobj::GPU_LOAD_OPTIONS,
            |mtl| tobj::load_mtl(dir.join(mtl)),
        )
        .map_err(|e| RenderError::scene(format!("{}: {e}", path.display())))?;
        let materials = materials.unwrap_or_else(|e| {
            log::warn!("No materials for {}: {e}", path.display());
            Vec::new()
        });

        let mesh = MeshData::from_obj(&models, &materials)?;
        if !mesh.textures.is_empty() {
            return Err(RenderError::scene(format!(
                "{}: textured models are not supported",
                path.display()
            )));
        }

        let n = self.models.len();
        let address = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let build_input = address
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::STORAGE_BUFFER;

        let mut upload = StagedUpload::begin(&self.device, pool)?;
        let model = ModelBuffers {
            vertex_count: mesh.vertex_count(),
            index_count: mesh.index_count(),
            vertices: upload.buffer(
                &format!("vertex_{n}"),
                &mesh.vertices,
                vk::BufferUsageFlags::VERTEX_BUFFER | build_input,
            )?,
            indices: upload.buffer(
                &format!("index_{n}"),
                &mesh.indices,
                vk::BufferUsageFlags::INDEX_BUFFER | build_input,
            )?,
            materials: upload.buffer(
                &format!("mat_{n}"),
                &mesh.materials,
                vk::BufferUsageFlags::STORAGE_BUFFER | address,
            )?,
            material_indices: upload.buffer(
                &format!("matIdx_{n}"),
                &mesh.material_indices,
                vk::BufferUsageFlags::STORAGE_BUFFER | address,
            )?,
        };

        let txt_offset = self.textures.len() as i32;
        if self.textures.is_empty() {
            self.textures.push(Texture::dummy(&mut upload)?);
        }
        upload.finish()?;

        self.instances.push(ObjInstance {
            transform,
            obj_index: n as u32,
        });
        self.descs.push(ObjDesc::new(
            txt_offset,
            model.vertices.device_address(),
            model.indices.device_address(),
            model.materials.device_address(),
            model.material_indices.device_address(),
        ));

        log::info!(
            "Loaded model {}: {} vertices, {} triangles",
            n,
            model.vertex_count,
            model.index_count / 3
        );
        self.models.push(model);
        Ok(())
    }

    /// One bottom-level structure per loaded model, built in one batch.
    pub fn build_blas(&mut self, pool: &CommandPool) -> RenderResult<()> {
        if self.models.is_empty() {
            return Err(RenderError::scene("build_blas called with no models loaded"));
        }

        let inputs: Vec<BlasInput> = self.models.iter().map(BlasInput::from_model).collect();
        let mut built: Vec<AccelerationStructure> = Vec::with_capacity(inputs.len());
        let mut scratch = Vec::with_capacity(inputs.len());
        let mut infos = Vec::with_capacity(inputs.len());

        for (i, input) in inputs.iter().enumerate() {
            let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(std::slice::from_ref(&input.geometry))
                .build();

            let allocated = self.allocate_for_build(
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                &info,
                input.range.primitive_count,
                &format!("blas_{i}"),
            );
            let (structure, scratch_buffer) = match allocated {
                Ok(pair) => pair,
                Err(e) => {
                    for structure in built {
                        unsafe {
                            self.loader
                                .destroy_acceleration_structure(structure.handle, None)
                        };
                    }
                    return Err(e);
                }
            };

            info.dst_acceleration_structure = structure.handle;
            info.scratch_data = vk::DeviceOrHostAddressKHR {
                device_address: scratch_buffer.address,
            };

            infos.push(info);
            built.push(structure);
            scratch.push(scratch_buffer);
        }

        let ranges: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> = inputs
            .iter()
            .map(|input| std::slice::from_ref(&input.range))
            .collect();

        let commands = pool.begin_single_use()?;
        unsafe {
            self.loader.cmd_build_acceleration_structures(
                commands.command_buffer,
                &infos,
                &ranges,
            )
        };
        let submitted = pool.submit_and_end(commands);

        // Keep what was created so destroy() can release it even on failure.
        self.destroy_blas();
        self.blas = built;
        drop(scratch);
        submitted?;

        log::info!("Built {} bottom-level acceleration structures", self.blas.len());
        Ok(())
    }

    /// One top-level structure over every instance.
    pub fn build_tlas(&mut self, pool: &CommandPool) -> RenderResult<()> {
        if self.blas.len() != self.models.len() || self.blas.is_empty() {
            return Err(RenderError::scene("build_tlas called before build_blas"));
        }

        let instances: Vec<vk::AccelerationStructureInstanceKHR> = self
            .instances
            .iter()
            .map(|inst| inst.to_acceleration_instance(self.blas[inst.obj_index as usize].address))
            .collect();

        // SAFETY: AccelerationStructureInstanceKHR is a plain #[repr(C)] struct
        // with no padding.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                instances.as_ptr() as *const u8,
                std::mem::size_of_val(instances.as_slice()),
            )
        };

        let mut upload = StagedUpload::begin(&self.device, pool)?;
        let instance_buffer = upload.bytes(
            "tlas_instances",
            bytes,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.device_address(),
            })
            .build();
        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();

        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry))
            .build();

        let count = instances.len() as u32;
        let (structure, scratch) = self.allocate_for_build(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &info,
            count,
            "tlas",
        )?;
        info.dst_acceleration_structure = structure.handle;
        info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch.address,
        };

        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        let barrier = instance_upload_barrier();

        let cmd = upload.command_buffer();
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
            self.loader
                .cmd_build_acceleration_structures(cmd, &[info], &[&[range]]);
        }
        let submitted = upload.finish();

        self.destroy_tlas();
        self.tlas = Some(structure);
        self.instance_buffer = Some(instance_buffer);
        drop(scratch);
        submitted?;

        log::info!("Built top-level acceleration structure over {count} instances");
        Ok(())
    }

    /// Upload the per-model `ObjDesc` array for shader access.
    pub fn upload_descriptors(&mut self, pool: &CommandPool) -> RenderResult<()> {
        if self.descs.is_empty() {
            return Err(RenderError::scene("no models loaded"));
        }

        let mut upload = StagedUpload::begin(&self.device, pool)?;
        let buffer = upload.buffer(
            "obj_desc",
            &self.descs,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        upload.finish()?;

        self.desc_buffer = Some(buffer);
        Ok(())
    }

    /// Release every buffer, texture and acceleration structure.
    /// The device must be idle.
    pub fn destroy(&mut self) {
        self.destroy_tlas();
        self.destroy_blas();
        self.desc_buffer = None;
        self.textures.clear();
        self.descs.clear();
        self.instances.clear();
        self.models.clear();
    }

    fn destroy_tlas(&mut self) {
        if let Some(tlas) = self.tlas.take() {
            unsafe { self.loader.destroy_acceleration_structure(tlas.handle, None) };
        }
        self.instance_buffer = None;
    }

    fn destroy_blas(&mut self) {
        for blas in self.blas.drain(..) {
            unsafe { self.loader.destroy_acceleration_structure(blas.handle, None) };
        }
    }

    /// Size the structure for `info`, then create it and a scratch buffer.
    fn allocate_for_build(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        primitive_count: u32,
        name: &str,
    ) -> RenderResult<(AccelerationStructure, Scratch)> {
        let sizes = unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                info,
                &[primitive_count],
            )
        };

        let buffer = GpuBuffer::new(
            &self.device,
            name,
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .ty(ty)
            .size(sizes.acceleration_structure_size)
            .buffer(buffer.buffer);
        let handle = unsafe { self.loader.create_acceleration_structure(&create_info, None) }
            .fatal("create_acceleration_structure")?;

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
        let address =
            unsafe { self.loader.get_acceleration_structure_device_address(&address_info) };

        // Padded so the aligned start still leaves build_scratch_size bytes.
        let scratch = GpuBuffer::new(
            &self.device,
            &format!("{name} (scratch)"),
            sizes.build_scratch_size + self.scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        );
        let scratch = match scratch {
            Ok(buffer) => Scratch {
                address: align_up(buffer.device_address(), self.scratch_alignment),
                _buffer: buffer,
            },
            Err(e) => {
                unsafe { self.loader.destroy_acceleration_structure(handle, None) };
                return Err(e);
            }
        };

        Ok((
            AccelerationStructure {
                handle,
                address,
                buffer,
            },
            scratch,
        ))
    }
}

impl Drop for SceneBuilder {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_addresses_round_up_to_alignment() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
        assert_eq!(align_up(0x1_0000_0040, 256), 0x1_0000_0100);
        assert_eq!(align_up(77, 0), 77);
        assert_eq!(align_up(77, 1), 77);
    }

    #[test]
    fn aligned_scratch_fits_padded_buffer() {
        let alignment = 256;
        let needed = 1000;
        for base in [0u64, 4, 255, 256, 4097] {
            let start = align_up(base, alignment);
            assert!(start >= base);
            assert!(start - base < alignment);
            assert!(start + needed <= base + needed + alignment);
        }
    }

    #[test]
    fn instance_copy_is_visible_to_the_top_level_build() {
        let barrier = instance_upload_barrier();
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert!(barrier
            .dst_access_mask
            .contains(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR));
        assert!(!barrier
            .dst_access_mask
            .contains(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR));
    }
}
