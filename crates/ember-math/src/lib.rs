// SPDX-License-Identifier: CEPL-1.0
//! CPU-side mesh data.
//!
//! Meshes are stored struct-of-arrays: positions, one attribute stream and the
//! index list each live in their own vector and are uploaded to their own GPU
//! buffer. Format and index width are runtime tags rather than type
//! parameters so the renderer can resolve them by lookup.

pub use glam::{Vec2, Vec3, Vec4};

/// Width of one element of an index buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexWidth {
    U16,
    U32,
}

impl IndexWidth {
    pub const fn byte_size(self) -> usize {
        match self {
            IndexWidth::U16 => 2,
            IndexWidth::U32 => 4,
        }
    }
}

/// Component layout of a per-vertex attribute stream (all `f32`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeFormat {
    Vec2,
    Vec3,
    Vec4,
}

impl AttributeFormat {
    pub const fn components(self) -> usize {
        match self {
            AttributeFormat::Vec2 => 2,
            AttributeFormat::Vec3 => 3,
            AttributeFormat::Vec4 => 4,
        }
    }

    /// Stride of one element in bytes.
    pub const fn byte_size(self) -> usize {
        self.components() * std::mem::size_of::<f32>()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttributeData {
    Vec2(Vec<Vec2>),
    Vec3(Vec<Vec3>),
    Vec4(Vec<Vec4>),
}

impl AttributeData {
    pub fn format(&self) -> AttributeFormat {
        match self {
            AttributeData::Vec2(_) => AttributeFormat::Vec2,
            AttributeData::Vec3(_) => AttributeFormat::Vec3,
            AttributeData::Vec4(_) => AttributeFormat::Vec4,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AttributeData::Vec2(v) => v.len(),
            AttributeData::Vec3(v) => v.len(),
            AttributeData::Vec4(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeData::Vec2(v) => bytemuck::cast_slice(v),
            AttributeData::Vec3(v) => bytemuck::cast_slice(v),
            AttributeData::Vec4(v) => bytemuck::cast_slice(v),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Indices {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Indices {
    pub fn width(&self) -> IndexWidth {
        match self {
            Indices::U16(_) => IndexWidth::U16,
            Indices::U32(_) => IndexWidth::U32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Indices::U16(v) => v.len(),
            Indices::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Indices::U16(v) => bytemuck::cast_slice(v),
            Indices::U32(v) => bytemuck::cast_slice(v),
        }
    }
}

/// Indexed geometry with separate position and attribute streams.
#[derive(Clone, Debug, PartialEq)]
pub struct Mesh {
    pub positions: Vec<Vec3>,
    pub attributes: AttributeData,
    pub indices: Indices,
}

impl Mesh {
    /// Two triangles forming a quad, one color per corner.
    pub fn quad() -> Self {
        Self {
            positions: vec![
                Vec3::new(0.5, -0.5, 0.0),
                Vec3::new(-0.5, 0.5, 0.0),
                Vec3::new(0.5, 0.5, 0.0),
                Vec3::new(-0.5, -0.5, 0.0),
            ],
            attributes: AttributeData::Vec3(vec![
                Vec3::new(1.0, 1.0, 1.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0),
                Vec3::new(1.0, 0.0, 0.0),
            ]),
            indices: Indices::U32(vec![0, 1, 2, 1, 0, 3]),
        }
    }

    pub fn positions_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.positions)
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Attribute stream must pair one-to-one with positions.
    pub fn is_consistent(&self) -> bool {
        self.positions.len() == self.attributes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_streams_have_expected_sizes() {
        let m = Mesh::quad();
        assert!(m.is_consistent());
        assert_eq!(m.positions_bytes().len(), 4 * 12);
        assert_eq!(m.attributes.as_bytes().len(), 4 * 12);
        assert_eq!(m.indices.as_bytes().len(), 6 * 4);
        assert_eq!(m.index_count(), 6);
    }

    #[test]
    fn index_width_follows_variant() {
        let small = Indices::U16(vec![0, 1, 2]);
        assert_eq!(small.width(), IndexWidth::U16);
        assert_eq!(small.as_bytes(), &[0, 0, 1, 0, 2, 0]);
        assert_eq!(IndexWidth::U32.byte_size(), 4);
    }

    #[test]
    fn attribute_formats_resolve_by_lookup() {
        assert_eq!(AttributeFormat::Vec2.byte_size(), 8);
        assert_eq!(AttributeFormat::Vec4.components(), 4);
        let data = AttributeData::Vec4(vec![Vec4::ONE; 3]);
        assert_eq!(data.format(), AttributeFormat::Vec4);
        assert_eq!(data.as_bytes().len(), 3 * 16);
    }
}
