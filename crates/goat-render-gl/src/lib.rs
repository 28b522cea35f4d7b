// SPDX-License-Identifier: CEPL-1.0
use glow::HasContext as _;
use goat_render::{
    ErrorLatch, RenderBatch, RenderContext, RenderError, RenderSettings, RenderSize, Renderable,
    Vertex,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use tracing::{debug, info};

use glutin::{
    config::ConfigTemplateBuilder,
    context::{
        ContextApi, ContextAttributesBuilder, NotCurrentContext, PossiblyCurrentContext, Version,
    },
    display::{Display, DisplayApiPreference},
    prelude::*,
    surface::{Surface, SurfaceAttributesBuilder, SwapInterval, WindowSurface},
};

use std::ffi::CString;
use std::num::NonZeroU32;

const VERTEX_SRC: &str = r#"#version 330 core
layout(location = 0) in vec3 inPos;
layout(location = 1) in vec4 inColor;
out vec4 vColor;
void main() {
    vColor = inColor;
    // Same clip-space convention as the Vulkan backend: +y points down.
    gl_Position = vec4(inPos.x, -inPos.y, inPos.z, 1.0);
}"#;

const FRAGMENT_SRC: &str = r#"#version 330 core
in vec4 vColor;
out vec4 outColor;
void main() { outColor = vColor; }"#;

/// With y flipped in the vertex shader, this is the same on-screen winding the
/// Vulkan pipeline treats as front-facing.
const FRONT_FACE: u32 = glow::CW;

/// A current context, its window surface and the loaded function table.
struct GlState {
    context: PossiblyCurrentContext,
    surface: Surface<WindowSurface>,
    gl: glow::Context,
}

/// Created on the first submitted renderable.
struct DrawObjects {
    program: glow::Program,
    vao: glow::VertexArray,
    vbo: glow::Buffer,
    ebo: glow::Buffer,
}

pub struct GlRenderContext {
    display: Option<RawDisplayHandle>,
    window: Option<RawWindowHandle>,
    settings: RenderSettings,
    size: RenderSize,
    batch: RenderBatch,
    errors: ErrorLatch,
    state: Option<GlState>,
    draw: Option<DrawObjects>,
}

fn compile_shader(gl: &glow::Context, kind: u32, src: &str) -> Result<glow::Shader, RenderError> {
    unsafe {
        let shader = gl.create_shader(kind).map_err(RenderError::ShaderModule)?;
        gl.shader_source(shader, src);
        gl.compile_shader(shader);
        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(RenderError::ShaderModule(log));
        }
        Ok(shader)
    }
}

fn compile_program(gl: &glow::Context) -> Result<glow::Program, RenderError> {
    unsafe {
        let vs = compile_shader(gl, glow::VERTEX_SHADER, VERTEX_SRC)?;
        let fs = match compile_shader(gl, glow::FRAGMENT_SHADER, FRAGMENT_SRC) {
            Ok(fs) => fs,
            Err(e) => {
                gl.delete_shader(vs);
                return Err(e);
            }
        };

        let linked = gl.create_program().and_then(|program| {
            gl.attach_shader(program, vs);
            gl.attach_shader(program, fs);
            gl.link_program(program);
            if gl.get_program_link_status(program) {
                gl.detach_shader(program, vs);
                gl.detach_shader(program, fs);
                Ok(program)
            } else {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                Err(log)
            }
        });

        gl.delete_shader(vs);
        gl.delete_shader(fs);
        linked.map_err(RenderError::PipelineCreation)
    }
}

impl DrawObjects {
    fn create(gl: &glow::Context) -> Result<Self, RenderError> {
        let program = compile_program(gl)?;
        unsafe {
            let buffers = gl.create_vertex_array().and_then(|vao| {
                let vbo = gl.create_buffer();
                let ebo = gl.create_buffer();
                match (vbo, ebo) {
                    (Ok(vbo), Ok(ebo)) => Ok((vao, vbo, ebo)),
                    (vbo, ebo) => {
                        for buffer in [vbo.ok(), ebo.ok()].into_iter().flatten() {
                            gl.delete_buffer(buffer);
                        }
                        gl.delete_vertex_array(vao);
                        Err("buffer allocation failed".to_string())
                    }
                }
            });
            let (vao, vbo, ebo) = match buffers {
                Ok(objects) => objects,
                Err(e) => {
                    gl.delete_program(program);
                    return Err(RenderError::BufferCreation(e));
                }
            };

            // The element buffer binding is part of the VAO state.
            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            gl.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, Some(ebo));
            gl.vertex_attrib_pointer_f32(0, 3, glow::FLOAT, false, Vertex::STRIDE as i32, 0);
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(
                1,
                4,
                glow::FLOAT,
                false,
                Vertex::STRIDE as i32,
                Vertex::COLOR_OFFSET as i32,
            );
            gl.enable_vertex_attrib_array(1);
            gl.bind_vertex_array(None);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);

            debug!("gl: draw objects created");
            Ok(Self {
                program,
                vao,
                vbo,
                ebo,
            })
        }
    }

    fn delete(self, gl: &glow::Context) {
        unsafe {
            gl.delete_program(self.program);
            gl.delete_buffer(self.ebo);
            gl.delete_buffer(self.vbo);
            gl.delete_vertex_array(self.vao);
        }
    }
}

fn swap_interval(vsync: bool) -> SwapInterval {
    match NonZeroU32::new(1) {
        Some(one) if vsync => SwapInterval::Wait(one),
        _ => SwapInterval::DontWait,
    }
}

impl GlState {
    fn make_current(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        size: RenderSize,
        vsync: bool,
    ) -> Result<Self, RenderError> {
        let fail = |what: &str, e: glutin::error::Error| {
            RenderError::DeviceCreation(format!("{what}: {e}"))
        };
        let display = unsafe { Display::new(display, DisplayApiPreference::Egl) }
            .map_err(|e| fail("display", e))?;

        let template = ConfigTemplateBuilder::new().build();
        let mut configs =
            unsafe { display.find_configs(template) }.map_err(|e| fail("find_configs", e))?;
        let config = configs
            .next()
            .ok_or_else(|| RenderError::DeviceCreation("no GL configs".into()))?;

        let (w, h) = nonzero_size(size);
        let sattrs = SurfaceAttributesBuilder::<WindowSurface>::new().build(window, w, h);
        let surface = unsafe { display.create_window_surface(&config, &sattrs) }
            .map_err(|e| fail("create_window_surface", e))?;
        let ctx_attrs = ContextAttributesBuilder::new()
            .with_context_api(ContextApi::OpenGl(Some(Version::new(3, 3))))
            .build(Some(window));
        let not_current: NotCurrentContext = unsafe { display.create_context(&config, &ctx_attrs) }
            .map_err(|e| fail("create_context", e))?;
        let context = not_current
            .make_current(&surface)
            .map_err(|e| fail("make_current", e))?;

        let gl = unsafe {
            glow::Context::from_loader_function(|s| {
                CString::new(s)
                    .map(|name| display.get_proc_address(&name))
                    .unwrap_or(std::ptr::null())
            })
        };

        if let Err(e) = surface.set_swap_interval(&context, swap_interval(vsync)) {
            debug!("gl: swap interval not applied: {e}");
        }

        unsafe {
            gl.enable(glow::FRAMEBUFFER_SRGB);
            gl.enable(glow::BLEND);
            gl.blend_func_separate(
                glow::SRC_ALPHA,
                glow::ONE_MINUS_SRC_ALPHA,
                glow::ONE,
                glow::ZERO,
            );
            gl.enable(glow::CULL_FACE);
            gl.front_face(FRONT_FACE);
            gl.cull_face(glow::BACK);
            gl.disable(glow::DEPTH_TEST);
        }

        Ok(Self {
            context,
            surface,
            gl,
        })
    }
}

/// Surfaces cannot be zero-sized; minimised windows get 1x1.
fn nonzero_size(size: RenderSize) -> (NonZeroU32, NonZeroU32) {
    (
        NonZeroU32::new(size.width).unwrap_or(NonZeroU32::MIN),
        NonZeroU32::new(size.height).unwrap_or(NonZeroU32::MIN),
    )
}

impl GlRenderContext {
    fn ensure_draw_objects(&mut self) -> Result<(), RenderError> {
        if self.draw.is_some() {
            return Ok(());
        }
        if let Some(state) = &self.state {
            self.draw = Some(DrawObjects::create(&state.gl)?);
        }
        Ok(())
    }

    fn draw_batch(&self, state: &GlState, draw: &DrawObjects) {
        if self.batch.index_count() == 0 {
            return;
        }
        let gl = &state.gl;
        let vertices = self.batch.vertices();
        unsafe {
            gl.use_program(Some(draw.program));
            gl.bind_vertex_array(Some(draw.vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(draw.vbo));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(&vertices),
                glow::DYNAMIC_DRAW,
            );
            gl.buffer_data_u8_slice(
                glow::ELEMENT_ARRAY_BUFFER,
                bytemuck::cast_slice(self.batch.indices()),
                glow::DYNAMIC_DRAW,
            );
            gl.draw_elements(
                glow::TRIANGLES,
                self.batch.index_count() as i32,
                glow::UNSIGNED_INT,
                0,
            );
            gl.bind_vertex_array(None);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);
            gl.use_program(None);
        }
    }
}

impl RenderContext for GlRenderContext {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: RenderSettings,
    ) -> Self {
        let mut errors = ErrorLatch::default();
        let display = display
            .display_handle()
            .map(|h| h.as_raw())
            .map_err(|e| errors.set(RenderError::WindowHandle(e.to_string())))
            .ok();
        let window = window
            .window_handle()
            .map(|h| h.as_raw())
            .map_err(|e| errors.set(RenderError::WindowHandle(e.to_string())))
            .ok();
        Self {
            display,
            window,
            settings,
            size,
            batch: RenderBatch::new(),
            errors,
            state: None,
            draw: None,
        }
    }

    fn backend_name(&self) -> &'static str {
        "OpenGL"
    }

    fn init(&mut self) -> Result<(), RenderError> {
        self.errors.check()?;
        if self.state.is_some() {
            return Ok(());
        }
        let (Some(display), Some(window)) = (self.display, self.window) else {
            return self.errors.latch(Err(RenderError::WindowHandle(
                "no window to render into".into(),
            )));
        };
        let state = self
            .errors
            .latch(GlState::make_current(display, window, self.size, self.settings.vsync))?;
        info!(
            width = self.size.width,
            height = self.size.height,
            vsync = self.settings.vsync,
            "gl: context initialised"
        );
        self.state = Some(state);
        Ok(())
    }

    fn resize_screen(&mut self, size: RenderSize) {
        self.size = size;
        if size.is_zero() {
            return;
        }
        if let Some(state) = &self.state {
            let (w, h) = nonzero_size(size);
            state.surface.resize(&state.context, w, h);
        }
    }

    fn pre_render(&mut self) {
        let Some(state) = &self.state else {
            return;
        };
        if self.errors.is_set() || self.size.is_zero() {
            return;
        }
        let [r, g, b, a] = self.settings.clear_color;
        unsafe {
            state
                .gl
                .viewport(0, 0, self.size.width as i32, self.size.height as i32);
            state.gl.clear_color(r, g, b, a);
            state.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    fn render_frame(&mut self) -> Result<(), RenderError> {
        if let Err(e) = self.errors.check() {
            self.batch.clear();
            return Err(e);
        }
        let result = match &self.state {
            Some(state) if !self.size.is_zero() => {
                if let Some(draw) = &self.draw {
                    self.draw_batch(state, draw);
                }
                state
                    .surface
                    .swap_buffers(&state.context)
                    .map_err(|e| RenderError::Present(e.to_string()))
            }
            _ => Ok(()),
        };
        self.batch.clear();
        self.errors.latch(result)
    }

    fn submit_renderable(&mut self, renderable: &dyn Renderable) {
        if !self.errors.is_set() {
            let created = self.ensure_draw_objects();
            let _ = self.errors.latch(created);
        }
        self.batch.push(renderable);
    }

    fn last_error(&self) -> Option<&RenderError> {
        self.errors.get()
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.settings.clear_color = rgba;
    }

    fn set_vsync(&mut self, on: bool) {
        self.settings.vsync = on;
        if let Some(state) = &self.state {
            if let Err(e) = state.surface.set_swap_interval(&state.context, swap_interval(on)) {
                debug!("gl: swap interval not applied: {e}");
            }
        }
    }
}

impl Drop for GlRenderContext {
    fn drop(&mut self) {
        if let (Some(state), Some(draw)) = (&self.state, self.draw.take()) {
            draw.delete(&state.gl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_render::primitives::Triangle2d;
    use raw_window_handle::{DisplayHandle, HandleError, WindowHandle};

    struct NoWindow;

    impl HasWindowHandle for NoWindow {
        fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    impl HasDisplayHandle for NoWindow {
        fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    fn headless() -> GlRenderContext {
        GlRenderContext::new(
            &NoWindow,
            &NoWindow,
            RenderSize::new(320, 240),
            RenderSettings::default(),
        )
    }

    #[test]
    fn missing_handles_are_a_sticky_error() {
        let mut ctx = headless();
        assert!(ctx.has_error());
        let err = ctx.init().unwrap_err();
        assert!(matches!(err, RenderError::WindowHandle(_)));
        assert_eq!(ctx.last_error(), Some(&err));
    }

    #[test]
    fn batch_is_cleared_even_on_error() {
        let mut ctx = headless();
        ctx.submit_renderable(&Triangle2d::new());
        assert_eq!(ctx.batch.index_count(), 3);
        assert!(ctx.render_frame().is_err());
        assert!(ctx.batch.is_empty());
    }

    #[test]
    fn frame_without_context_is_a_no_op() {
        let mut ctx = headless();
        ctx.errors = ErrorLatch::default();
        ctx.pre_render();
        ctx.submit_renderable(&Triangle2d::new());
        assert!(ctx.draw.is_none());
        assert!(ctx.render_frame().is_ok());
        assert!(ctx.batch.is_empty());
    }

    #[test]
    fn zero_sizes_are_clamped_for_surfaces() {
        let (w, h) = nonzero_size(RenderSize::new(0, 600));
        assert_eq!((w.get(), h.get()), (1, 600));
    }

    #[test]
    fn clip_space_matches_vulkan() {
        assert!(VERTEX_SRC.contains("vec4(inPos.x, -inPos.y, inPos.z, 1.0)"));
        assert_eq!(FRONT_FACE, glow::CW);
    }

    #[test]
    fn swap_interval_follows_vsync() {
        assert!(matches!(swap_interval(true), SwapInterval::Wait(n) if n.get() == 1));
        assert!(matches!(swap_interval(false), SwapInterval::DontWait));
    }
}
