// Host-side scene data
//
// Layouts here are read by shaders through buffer device addresses, so every
// struct is #[repr(C)] and padding is spelled out.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::backend::error::{RenderError, RenderResult};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct VertexObj {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialObj {
    pub ambient: [f32; 3],
    pub diffuse: [f32; 3],
    pub specular: [f32; 3],
    pub transmittance: [f32; 3],
    pub emission: [f32; 3],
    pub shininess: f32,
    pub ior: f32,
    pub dissolve: f32,
    pub illum: i32,
    /// Index into the scene texture list, -1 when untextured.
    pub texture_id: i32,
}

impl Default for MaterialObj {
    fn default() -> Self {
        Self {
            ambient: [0.1; 3],
            diffuse: [0.7; 3],
            specular: [1.0; 3],
            transmittance: [0.0; 3],
            emission: [0.0; 3],
            shininess: 0.0,
            ior: 1.0,
            dissolve: 1.0,
            illum: 0,
            texture_id: -1,
        }
    }
}

impl MaterialObj {
    /// Color terms converted from sRGB to linear.
    pub fn linearized(mut self) -> Self {
        let linear = |c: [f32; 3]| Vec3::from(c).powf(2.2).to_array();
        self.ambient = linear(self.ambient);
        self.diffuse = linear(self.diffuse);
        self.specular = linear(self.specular);
        self
    }
}

/// Device addresses of one model's buffers, as seen by shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ObjDesc {
    pub txt_offset: i32,
    _pad: u32,
    pub vertex_address: u64,
    pub index_address: u64,
    pub material_address: u64,
    pub material_index_address: u64,
}

impl ObjDesc {
    pub fn new(
        txt_offset: i32,
        vertex_address: u64,
        index_address: u64,
        material_address: u64,
        material_index_address: u64,
    ) -> Self {
        Self {
            txt_offset,
            _pad: 0,
            vertex_address,
            index_address,
            material_address,
            material_index_address,
        }
    }
}

/// One placement of a model in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjInstance {
    pub transform: Mat4,
    pub obj_index: u32,
}

impl ObjInstance {
    /// Pack into the layout the TLAS build consumes.
    pub fn to_acceleration_instance(
        &self,
        blas_address: vk::DeviceAddress,
    ) -> vk::AccelerationStructureInstanceKHR {
        vk::AccelerationStructureInstanceKHR {
            transform: transform_matrix(&self.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(self.obj_index, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas_address,
            },
        }
    }
}

/// Row-major 3x4 affine part of a column-major matrix.
pub fn transform_matrix(m: &Mat4) -> vk::TransformMatrixKHR {
    let rows = m.transpose().to_cols_array();
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&rows[..12]);
    vk::TransformMatrixKHR { matrix }
}

/// Triangle mesh flattened out of an OBJ file.
#[derive(Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<VertexObj>,
    pub indices: Vec<u32>,
    pub materials: Vec<MaterialObj>,
    /// One entry per triangle.
    pub material_indices: Vec<i32>,
    /// Diffuse texture names referenced by the materials.
    pub textures: Vec<String>,
}

impl MeshData {
    /// Merge triangulated, single-index `tobj` models into one mesh.
    /// Materials come out linearized; a default material is added when the
    /// file has none.
    pub fn from_obj(models: &[tobj::Model], materials: &[tobj::Material]) -> RenderResult<Self> {
        let mut mesh = MeshData::default();

        for material in materials {
            let mut converted = convert_material(material);
            if let Some(texture) = material.diffuse_texture.as_ref().filter(|t| !t.is_empty()) {
                converted.texture_id = mesh.textures.len() as i32;
                mesh.textures.push(texture.clone());
            }
            mesh.materials.push(converted.linearized());
        }
        if mesh.materials.is_empty() {
            mesh.materials.push(MaterialObj::default().linearized());
        }

        for model in models {
            let m = &model.mesh;
            let base = mesh.vertices.len() as u32;
            let vertex_count = m.positions.len() / 3;

            for i in 0..vertex_count {
                let position = [m.positions[3 * i], m.positions[3 * i + 1], m.positions[3 * i + 2]];
                let normal = m
                    .normals
                    .get(3 * i..3 * i + 3)
                    .map(|n| [n[0], n[1], n[2]])
                    .unwrap_or_default();
                let color = m
                    .vertex_color
                    .get(3 * i..3 * i + 3)
                    .map(|c| [c[0], c[1], c[2]])
                    .unwrap_or([1.0; 3]);
                let tex_coord = m
                    .texcoords
                    .get(2 * i..2 * i + 2)
                    .map(|t| [t[0], 1.0 - t[1]])
                    .unwrap_or_default();

                mesh.vertices.push(VertexObj {
                    position,
                    normal,
                    color,
                    tex_coord,
                });
            }

            mesh.indices.extend(m.indices.iter().map(|&i| base + i));

            let material = m
                .material_id
                .filter(|&id| id < mesh.materials.len())
                .unwrap_or(0) as i32;
            mesh.material_indices
                .extend(std::iter::repeat(material).take(m.indices.len() / 3));

            if m.normals.is_empty() {
                compute_normals(&mut mesh.vertices, &mesh.indices, base as usize);
            }
        }

        if mesh.indices.is_empty() {
            return Err(RenderError::scene("model contains no triangles"));
        }
        if let Some(&bad) = mesh.indices.iter().find(|&&i| i as usize >= mesh.vertices.len()) {
            return Err(RenderError::scene(format!("vertex index {bad} out of range")));
        }

        Ok(mesh)
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

fn convert_material(material: &tobj::Material) -> MaterialObj {
    let defaults = MaterialObj::default();
    let param = |key: &str| material.unknown_param.get(key).and_then(|v| parse_vec3(v));

    MaterialObj {
        ambient: material.ambient.unwrap_or(defaults.ambient),
        diffuse: material.diffuse.unwrap_or(defaults.diffuse),
        specular: material.specular.unwrap_or(defaults.specular),
        transmittance: param("Tf").unwrap_or(defaults.transmittance),
        emission: param("Ke").unwrap_or(defaults.emission),
        shininess: material.shininess.unwrap_or(defaults.shininess),
        ior: material.optical_density.unwrap_or(defaults.ior),
        dissolve: material.dissolve.unwrap_or(defaults.dissolve),
        illum: material.illumination_model.map_or(defaults.illum, i32::from),
        texture_id: -1,
    }
}

fn parse_vec3(value: &str) -> Option<[f32; 3]> {
    let mut parts = value.split_whitespace().map(|p| p.parse::<f32>().ok());
    Some([parts.next()??, parts.next()??, parts.next()??])
}

// Area-weighted face normals accumulated onto the vertices from `first` on.
fn compute_normals(vertices: &mut [VertexObj], indices: &[u32], first: usize) {
    let mut accumulated = vec![Vec3::ZERO; vertices.len() - first];

    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        if a < first || b < first || c < first {
            continue;
        }
        let pa = Vec3::from(vertices[a].position);
        let pb = Vec3::from(vertices[b].position);
        let pc = Vec3::from(vertices[c].position);
        let normal = (pb - pa).cross(pc - pa);
        for i in [a, b, c] {
            accumulated[i - first] += normal;
        }
    }

    for (vertex, normal) in vertices[first..].iter_mut().zip(accumulated) {
        vertex.normal = normal.normalize_or_zero().to_array();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn load(obj: &str, mtl: &'static str) -> MeshData {
        let (models, materials) = tobj::load_obj_buf(
            &mut Cursor::new(obj.as_bytes()),
            &tobj::GPU_LOAD_OPTIONS,
            |_| tobj::load_mtl_buf(&mut Cursor::new(mtl.as_bytes())),
        )
        .unwrap();
        MeshData::from_obj(&models, &materials.unwrap_or_default()).unwrap()
    }

    const QUAD: &str = "mtllib scene.mtl
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
usemtl red
f 1 2 3 4
";

    const RED: &str = "newmtl red
Ka 0 0 0
Kd 0.5 0.25 1.0
Ks 1 1 1
";

    #[test]
    fn quad_becomes_two_triangles_with_linear_material() {
        let mesh = load(QUAD, RED);

        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.index_count(), 6);
        assert_eq!(mesh.material_indices, vec![0, 0]);
        assert_eq!(mesh.materials.len(), 1);
        assert!(mesh.textures.is_empty());

        let red = mesh.materials[0];
        assert!((red.diffuse[0] - 0.5f32.powf(2.2)).abs() < 1e-6);
        assert!((red.diffuse[1] - 0.25f32.powf(2.2)).abs() < 1e-6);
        assert_eq!(red.diffuse[2], 1.0);
        assert_eq!(red.ambient, [0.0; 3]);
        assert_eq!(red.specular, [1.0; 3]);
        assert_eq!(red.texture_id, -1);
    }

    #[test]
    fn missing_normals_are_computed() {
        let mesh = load(QUAD, RED);
        for vertex in &mesh.vertices {
            let n = Vec3::from(vertex.normal);
            assert!((n - Vec3::Z).length() < 1e-5, "normal {n:?}");
            assert_eq!(vertex.color, [1.0; 3]);
        }
    }

    #[test]
    fn models_are_merged_with_offset_indices() {
        let obj = "o first
v 0 0 0
v 1 0 0
v 0 1 0
f 1 2 3
o second
v 0 0 1
v 1 0 1
v 0 1 1
f 4 5 6
";
        let mesh = load(obj, "");

        assert_eq!(mesh.indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(mesh.material_indices, vec![0, 0]);
        assert_eq!(mesh.materials, vec![MaterialObj::default().linearized()]);
    }

    #[test]
    fn diffuse_textures_are_collected() {
        let mtl = "newmtl wood
Kd 1 1 1
map_Kd wood.png
";
        let mesh = load(&QUAD.replace("usemtl red", "usemtl wood"), mtl);

        assert_eq!(mesh.textures, vec!["wood.png".to_string()]);
        assert_eq!(mesh.materials[0].texture_id, 0);
    }

    #[test]
    fn empty_model_is_rejected() {
        let err = MeshData::from_obj(&[], &[]).unwrap_err();
        assert!(matches!(err, RenderError::Scene { .. }));
    }

    #[test]
    fn instance_packing() {
        let instance = ObjInstance {
            transform: Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            obj_index: 5,
        };
        let packed = instance.to_acceleration_instance(0xdead_beef);

        assert_eq!(
            packed.transform.matrix,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
        assert_eq!(packed.instance_custom_index_and_mask.low_24(), 5);
        assert_eq!(packed.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(
            packed.instance_shader_binding_table_record_offset_and_flags.low_24(),
            0
        );
        assert_eq!(
            packed.instance_shader_binding_table_record_offset_and_flags.high_8() as u32,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(
            unsafe { packed.acceleration_structure_reference.device_handle },
            0xdead_beef
        );
    }

    #[test]
    fn obj_desc_layout_matches_shader_struct() {
        assert_eq!(std::mem::size_of::<ObjDesc>(), 40);
        assert_eq!(std::mem::size_of::<VertexObj>(), 44);
        assert_eq!(std::mem::size_of::<MaterialObj>(), 80);
    }
}
