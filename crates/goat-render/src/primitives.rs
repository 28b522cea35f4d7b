// SPDX-License-Identifier: CEPL-1.0
use crate::Renderable;
use glam::{Mat4, Vec3, Vec4};

/// Flat triangle centred on the origin, wound clockwise on screen (+y down),
/// so it points down.
#[derive(Clone, Debug)]
pub struct Triangle2d {
    vertices: [Vec3; 3],
    indices: [u32; 3],
    colors: [Vec4; 3],
    transform: Mat4,
}

impl Triangle2d {
    pub fn new() -> Self {
        Self {
            vertices: [
                Vec3::new(-0.5, -0.5, 0.0),
                Vec3::new(0.5, -0.5, 0.0),
                Vec3::new(0.0, 0.5, 0.0),
            ],
            indices: [0, 1, 2],
            colors: [Vec4::ONE; 3],
            transform: Mat4::IDENTITY,
        }
    }

    pub fn with_colors(mut self, colors: [Vec4; 3]) -> Self {
        self.colors = colors;
        self
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }
}

impl Default for Triangle2d {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderable for Triangle2d {
    fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    fn indices(&self) -> &[u32] {
        &self.indices
    }

    fn colors(&self) -> &[Vec4] {
        &self.colors
    }

    fn transform(&self) -> &Mat4 {
        &self.transform
    }
}
