// SPDX-License-Identifier: CEPL-1.0
use crate::Renderable;
use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use tracing::warn;

/// Interleaved vertex as uploaded to the GPU by both backends.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

impl Vertex {
    pub const STRIDE: usize = std::mem::size_of::<Vertex>();
    pub const COLOR_OFFSET: usize = std::mem::size_of::<[f32; 3]>();
}

/// Offsets `indices` by `base`, or `None` if one points past `vertex_count`
/// or the result does not fit in `u32`.
fn rebase_indices(base: usize, vertex_count: usize, indices: &[u32]) -> Option<Vec<u32>> {
    if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        warn!("renderable index {bad} is out of range for {vertex_count} vertices; skipped");
        return None;
    }
    let rebased = u32::try_from(base).ok().and_then(|base| {
        indices
            .iter()
            .map(|&i| base.checked_add(i))
            .collect::<Option<Vec<u32>>>()
    });
    if rebased.is_none() {
        warn!("batch of {base} vertices cannot address more; renderable skipped");
    }
    rebased
}

/// Geometry gathered from every renderable submitted during one frame.
///
/// Indices are rebased as they are appended, so each renderable keeps
/// addressing its own vertices after concatenation.
#[derive(Debug, Default)]
pub struct RenderBatch {
    positions: Vec<Vec3>,
    indices: Vec<u32>,
    colors: Vec<Vec4>,
}

impl RenderBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one renderable. A renderable whose indices fall outside its own
    /// vertices, or would not fit in `u32` once rebased, is dropped whole.
    pub fn push(&mut self, renderable: &dyn Renderable) {
        let verts = renderable.vertices();
        let Some(indices) = rebase_indices(self.positions.len(), verts.len(), renderable.indices())
        else {
            return;
        };
        let transform = renderable.transform();

        self.positions
            .extend(verts.iter().map(|&v| transform.transform_point3(v)));
        self.indices.extend(indices);

        let colors = renderable.colors();
        if colors.len() != verts.len() {
            warn!(
                "renderable has {} colours for {} vertices; padding with white",
                colors.len(),
                verts.len()
            );
        }
        self.colors.extend(
            colors
                .iter()
                .copied()
                .chain(std::iter::repeat(Vec4::ONE))
                .take(verts.len()),
        );
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.indices.clear();
        self.colors.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.indices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn colors(&self) -> &[Vec4] {
        &self.colors
    }

    pub fn vertices(&self) -> Vec<Vertex> {
        self.positions
            .iter()
            .zip(&self.colors)
            .map(|(p, c)| Vertex {
                position: p.to_array(),
                color: c.to_array(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::Triangle2d;
    use glam::Mat4;

    struct Quad {
        verts: Vec<Vec3>,
        idx: Vec<u32>,
        cols: Vec<Vec4>,
        xf: Mat4,
    }

    impl Quad {
        fn new(cols: Vec<Vec4>) -> Self {
            Self {
                verts: vec![
                    Vec3::new(0.0, 0.0, 0.0),
                    Vec3::new(1.0, 0.0, 0.0),
                    Vec3::new(1.0, 1.0, 0.0),
                    Vec3::new(0.0, 1.0, 0.0),
                ],
                idx: vec![0, 1, 2, 2, 3, 0],
                cols,
                xf: Mat4::IDENTITY,
            }
        }
    }

    impl Renderable for Quad {
        fn vertices(&self) -> &[Vec3] {
            &self.verts
        }
        fn indices(&self) -> &[u32] {
            &self.idx
        }
        fn colors(&self) -> &[Vec4] {
            &self.cols
        }
        fn transform(&self) -> &Mat4 {
            &self.xf
        }
    }

    #[test]
    fn empty_batch() {
        let batch = RenderBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.vertex_count(), 0);
        assert!(batch.vertices().is_empty());
    }

    #[test]
    fn concatenation_rebases_indices() {
        let mut batch = RenderBatch::new();
        batch.push(&Triangle2d::new());
        batch.push(&Quad::new(vec![Vec4::X; 4]));

        assert_eq!(batch.vertex_count(), 7);
        assert_eq!(batch.indices(), &[0, 1, 2, 3, 4, 5, 5, 6, 3]);
        assert_eq!(batch.colors().len(), 7);
        assert_eq!(batch.colors()[3], Vec4::X);
        assert_eq!(batch.positions()[4], Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn clear_empties_everything() {
        let mut batch = RenderBatch::new();
        batch.push(&Triangle2d::new());
        batch.push(&Triangle2d::new());
        assert!(!batch.is_empty());

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.index_count(), 0);
        assert!(batch.colors().is_empty());

        // Indices start from zero again after a clear.
        batch.push(&Triangle2d::new());
        assert_eq!(batch.indices(), &[0, 1, 2]);
    }

    #[test]
    fn out_of_range_indices_drop_the_renderable() {
        let mut batch = RenderBatch::new();
        batch.push(&Triangle2d::new());

        let mut bad = Quad::new(vec![Vec4::X; 4]);
        bad.idx = vec![0, 1, 7];
        batch.push(&bad);
        bad.idx = vec![0, u32::MAX, 2];
        batch.push(&bad);

        assert_eq!(batch.vertex_count(), 3);
        assert_eq!(batch.colors().len(), 3);
        assert_eq!(batch.indices(), &[0, 1, 2]);
    }

    #[test]
    fn indices_without_vertices_are_rejected() {
        let mut batch = RenderBatch::new();
        let mut empty = Quad::new(Vec::new());
        empty.verts.clear();
        batch.push(&empty);
        assert!(batch.is_empty());
        assert_eq!(batch.index_count(), 0);
    }

    #[test]
    fn rebasing_past_u32_is_rejected() {
        assert_eq!(rebase_indices(4, 3, &[0, 2]), Some(vec![4, 6]));
        assert_eq!(
            rebase_indices(u32::MAX as usize - 1, 3, &[0, 1]),
            Some(vec![u32::MAX - 1, u32::MAX])
        );
        assert_eq!(rebase_indices(u32::MAX as usize, 3, &[0, 1]), None);
        assert_eq!(rebase_indices(u32::MAX as usize + 1, 3, &[0]), None);
        assert_eq!(rebase_indices(0, 3, &[3]), None);
    }

    #[test]
    fn transform_is_applied_to_positions() {
        let tri =
            Triangle2d::new().with_transform(Mat4::from_translation(Vec3::new(1.0, 2.0, 0.0)));
        let mut batch = RenderBatch::new();
        batch.push(&tri);
        assert_eq!(batch.positions()[0], Vec3::new(0.5, 1.5, 0.0));
        assert_eq!(batch.positions()[2], Vec3::new(1.0, 2.5, 0.0));
    }

    #[test]
    fn colours_follow_vertex_count() {
        let mut batch = RenderBatch::new();
        batch.push(&Quad::new(vec![Vec4::X]));
        assert_eq!(batch.colors(), &[Vec4::X, Vec4::ONE, Vec4::ONE, Vec4::ONE]);

        batch.clear();
        batch.push(&Quad::new(vec![Vec4::Y; 6]));
        assert_eq!(batch.colors().len(), 4);
    }

    #[test]
    fn interleaved_vertices() {
        let red = Vec4::new(1.0, 0.0, 0.0, 0.5);
        let mut batch = RenderBatch::new();
        batch.push(&Triangle2d::new().with_colors([red; 3]));

        let verts = batch.vertices();
        assert_eq!(verts.len(), 3);
        assert_eq!(verts[1].position, [0.5, -0.5, 0.0]);
        assert_eq!(verts[1].color, [1.0, 0.0, 0.0, 0.5]);

        let bytes: &[u8] = bytemuck::cast_slice(&verts);
        assert_eq!(bytes.len(), 3 * Vertex::STRIDE);
        assert_eq!(Vertex::STRIDE, 28);
        assert_eq!(Vertex::COLOR_OFFSET, 12);
    }
}
