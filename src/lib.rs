// Photon - Vulkan rendering core
//
// The binary in main.rs drives these modules from a winit event loop.

pub mod backend;
pub mod config;
pub mod events;
pub mod logging;
