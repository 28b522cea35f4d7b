// SPDX-License-Identifier: CEPL-1.0
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;

mod batch;
mod error;
pub mod primitives;
mod renderable;

pub use batch::{RenderBatch, Vertex};
pub use error::{ErrorLatch, RenderError};
pub use glam;
pub use renderable::Renderable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Backend-independent knobs handed to a render context at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    /// Upper bound on frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Directory holding `tri.vert.spv` / `tri.frag.spv`. `None` uses the
    /// backend's build-time output directory.
    pub shader_dir: Option<PathBuf>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.20, 0.15, 0.60, 1.0],
            vsync: true,
            frames_in_flight: 2,
            shader_dir: None,
        }
    }
}

/// The per-frame protocol driven by the window layer:
/// `pre_render` → zero or more `submit_renderable` → `render_frame`.
///
/// Errors are sticky. Once `init` or `render_frame` fails, `has_error` stays
/// true and the frame loop is expected to stop.
pub trait RenderContext {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: RenderSettings,
    ) -> Self
    where
        Self: Sized;

    fn backend_name(&self) -> &'static str;

    fn init(&mut self) -> Result<(), RenderError>;
    fn resize_screen(&mut self, size: RenderSize);
    fn pre_render(&mut self);
    fn render_frame(&mut self) -> Result<(), RenderError>;
    fn submit_renderable(&mut self, renderable: &dyn Renderable);

    fn last_error(&self) -> Option<&RenderError>;
    fn has_error(&self) -> bool {
        self.last_error().is_some()
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}
