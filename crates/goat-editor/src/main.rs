// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use anyhow::Result;
use clap::Parser;
use config::{load_cfg, AppCfg, Backend};
use goat_core::init_tracing;
use goat_platform::winit::keyboard::KeyCode;
use goat_platform::winit::window::Window;
use goat_platform::{create_context, ContextFactory, FrameInput, WindowConfig, WindowFunctions};
use goat_render::glam::Vec4;
use goat_render::primitives::Triangle2d;
use goat_render::{RenderContext, RenderSettings, RenderSize};
use goat_render_gl::GlRenderContext;
use goat_render_vk::VkRenderContext;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Renderer backend; overrides the config file
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    #[arg(long, default_value = "goat.toml")]
    config: PathBuf,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
}

fn apply_args(cfg: &mut AppCfg, args: &Args) {
    if let Some(b) = args.backend {
        cfg.render.backend = b;
    }
    if let Some(w) = args.width {
        cfg.window.width = w;
    }
    if let Some(h) = args.height {
        cfg.window.height = h;
    }
}

/// Vulkan first unless GL was asked for; a failed Vulkan init falls back to GL.
fn context_factory(backend: Backend, settings: RenderSettings) -> ContextFactory {
    Box::new(move |window: &Window, size: RenderSize| {
        if backend == Backend::Vk {
            match create_context::<VkRenderContext>(window, size, settings.clone()) {
                Ok(ctx) => return Ok(ctx),
                Err(e) => error!("vk init failed: {e}; falling back to gl"),
            }
        }
        Ok(create_context::<GlRenderContext>(window, size, settings.clone())?)
    })
}

struct EditorWindow {
    triangle: Triangle2d,
    show_triangle: bool,
    vsync: bool,
    vsync_dirty: bool,
    should_close: bool,
}

impl EditorWindow {
    fn new(vsync: bool) -> Self {
        Self {
            triangle: Triangle2d::new().with_colors([
                Vec4::new(1.0, 0.0, 0.0, 1.0),
                Vec4::new(0.0, 1.0, 0.0, 1.0),
                Vec4::new(0.0, 0.0, 1.0, 1.0),
            ]),
            show_triangle: false,
            vsync,
            vsync_dirty: false,
            should_close: false,
        }
    }
}

impl WindowFunctions for EditorWindow {
    fn input(&mut self, input: &FrameInput) {
        if input.was_pressed(KeyCode::KeyT) {
            self.show_triangle = !self.show_triangle;
            info!(visible = self.show_triangle, "triangle toggled");
        }
        if input.was_pressed(KeyCode::KeyV) {
            self.vsync = !self.vsync;
            self.vsync_dirty = true;
        }
        if input.was_pressed(KeyCode::KeyQ) {
            self.should_close = true;
        }
        if input.was_pressed(KeyCode::F1) {
            info!(
                "GOAT engine editor {}: T draws the test triangle, V toggles vsync, Q or Esc quits",
                env!("CARGO_PKG_VERSION")
            );
        }
    }

    fn render(&mut self, ctx: &mut dyn RenderContext) {
        if self.vsync_dirty {
            self.vsync_dirty = false;
            info!(vsync = self.vsync, backend = ctx.backend_name(), "vsync changed");
            ctx.set_vsync(self.vsync);
        }
        if self.show_triangle {
            ctx.submit_renderable(&self.triangle);
        }
    }

    fn should_close(&self) -> bool {
        self.should_close
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config);
    apply_args(&mut cfg, &args);
    if cfg.window_size().is_zero() {
        warn!("window size {}x{} is empty", cfg.window.width, cfg.window.height);
    }
    info!("backend = {:?}", cfg.render.backend);
    info!("vsync cfg = {}", cfg.render.vsync);

    let settings = cfg.render.settings();
    let window = WindowConfig {
        title: cfg.window.title.clone(),
        size: cfg.window_size(),
    };
    let editor = EditorWindow::new(settings.vsync);
    let code = goat_platform::run(
        window,
        editor,
        context_factory(cfg.render.backend, settings),
    )?;
    if code != 0 {
        error!("exiting with code {code}");
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Args {
        Args::parse_from(std::iter::once("goat-editor").chain(list.iter().copied()))
    }

    #[test]
    fn cli_defaults() {
        let a = args(&[]);
        assert_eq!(a.backend, None);
        assert_eq!(a.config, PathBuf::from("goat.toml"));
    }

    #[test]
    fn cli_overrides_config() {
        let mut cfg = AppCfg::default();
        apply_args(&mut cfg, &args(&["--backend", "gl", "--width", "320"]));
        assert_eq!(cfg.render.backend, Backend::Gl);
        assert_eq!(cfg.window.width, 320);
        assert_eq!(cfg.window.height, 720);
    }

    #[test]
    fn unknown_backend_rejected() {
        let parsed = Args::try_parse_from(["goat-editor", "--backend", "metal"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn toggle_keys() {
        let mut ed = EditorWindow::new(true);
        let mut input = FrameInput::default();
        input.press(KeyCode::KeyT);
        input.press(KeyCode::KeyV);
        ed.input(&input);
        assert!(ed.show_triangle);
        assert!(!ed.vsync);
        assert!(ed.vsync_dirty);
        assert!(!ed.should_close());

        input.clear();
        ed.input(&input);
        assert!(ed.show_triangle);

        input.press(KeyCode::KeyT);
        input.press(KeyCode::KeyQ);
        ed.input(&input);
        assert!(!ed.show_triangle);
        assert!(ed.should_close());
    }
}
