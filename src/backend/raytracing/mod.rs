// Ray tracing scene resources
//
// Geometry upload plus bottom/top-level acceleration structures.

pub mod builder;
pub mod scene;
pub mod texture;

pub use builder::SceneBuilder;
pub use scene::{MeshData, ObjDesc, ObjInstance};
