// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use ember_math::{AttributeFormat, IndexWidth};

use crate::gpu::{BufferAllocation, Gpu};
use crate::ledger::{Ledger, Owned};

/// Device-local streams of one uploaded mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryBuffer {
    pub positions: BufferAllocation,
    pub attributes: BufferAllocation,
    pub indices: BufferAllocation,
    pub index_count: u32,
    pub index_width: IndexWidth,
    pub attribute_format: AttributeFormat,
}

impl GeometryBuffer {
    /// Hands all three buffers to the ledger, in creation order.
    pub fn register<G: Gpu>(&self, ledger: &mut Ledger<'_, G>) {
        ledger.push(Owned::Buffer(self.positions));
        ledger.push(Owned::Buffer(self.attributes));
        ledger.push(Owned::Buffer(self.indices));
    }

    pub fn vertex_buffers(&self) -> [vk::Buffer; 2] {
        [self.positions.buffer, self.attributes.buffer]
    }
}

pub fn index_type(width: IndexWidth) -> vk::IndexType {
    match width {
        IndexWidth::U16 => vk::IndexType::UINT16,
        IndexWidth::U32 => vk::IndexType::UINT32,
    }
}

pub fn attribute_vk_format(format: AttributeFormat) -> vk::Format {
    match format {
        AttributeFormat::Vec2 => vk::Format::R32G32_SFLOAT,
        AttributeFormat::Vec3 => vk::Format::R32G32B32_SFLOAT,
        AttributeFormat::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

/// Positions are always `vec3`.
pub const POSITION_FORMAT: vk::Format = vk::Format::R32G32B32_SFLOAT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_resolve_to_vulkan_enums() {
        assert_eq!(index_type(IndexWidth::U16), vk::IndexType::UINT16);
        assert_eq!(index_type(IndexWidth::U32), vk::IndexType::UINT32);
        assert_eq!(
            attribute_vk_format(AttributeFormat::Vec2),
            vk::Format::R32G32_SFLOAT
        );
        assert_eq!(
            attribute_vk_format(AttributeFormat::Vec4),
            vk::Format::R32G32B32A32_SFLOAT
        );
    }
}
