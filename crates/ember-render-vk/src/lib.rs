// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan backend: ash implementation of [`ember_render::Gpu`] and the mesh
//! pipeline that records each frame.

mod device;
mod instance;
mod pipeline;

pub use device::{create_logical_device, find_memory_type, DeviceContext};
pub use instance::InstanceBundle;
pub use pipeline::{read_spirv, MeshPipeline};
