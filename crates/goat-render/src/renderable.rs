// SPDX-License-Identifier: CEPL-1.0
use glam::{Mat4, Vec3, Vec4};

/// A drawable shape handed to a render context once per frame.
///
/// `indices` index into `vertices`; `colors` holds one RGBA value per vertex.
pub trait Renderable {
    fn vertices(&self) -> &[Vec3];
    fn indices(&self) -> &[u32];
    fn colors(&self) -> &[Vec4];
    fn transform(&self) -> &Mat4;
}
