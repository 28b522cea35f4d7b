// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Window adapter: owns the OS window and the render context and drives the
//! `pre_render → input → render → render_frame` loop.

pub use winit;

use anyhow::{Context, Result};
use goat_render::{RenderContext, RenderError, RenderSettings, RenderSize};
use tracing::{error, info};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

/// Keys pressed since the previous frame.
#[derive(Debug, Default, Clone)]
pub struct FrameInput {
    pressed: Vec<KeyCode>,
}

impl FrameInput {
    pub fn press(&mut self, key: KeyCode) {
        if !self.pressed.contains(&key) {
            self.pressed.push(key);
        }
    }

    pub fn was_pressed(&self, key: KeyCode) -> bool {
        self.pressed.contains(&key)
    }

    pub fn pressed(&self) -> &[KeyCode] {
        &self.pressed
    }

    pub fn clear(&mut self) {
        self.pressed.clear();
    }
}

/// Per-frame hooks supplied by the application.
pub trait WindowFunctions {
    fn input(&mut self, input: &FrameInput);
    /// Submit renderables here; `pre_render` has already run.
    fn render(&mut self, ctx: &mut dyn RenderContext);
    fn should_close(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub title: String,
    pub size: RenderSize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "GOAT".into(),
            size: RenderSize::new(1280, 720),
        }
    }
}

/// Builds an initialised context for a freshly created window.
pub type ContextFactory = Box<dyn FnMut(&Window, RenderSize) -> Result<Box<dyn RenderContext>>>;

/// Constructs a backend and runs its `init`, checking the handle error first.
pub fn create_context<C>(
    window: &Window,
    size: RenderSize,
    settings: RenderSettings,
) -> Result<Box<dyn RenderContext>, RenderError>
where
    C: RenderContext + 'static,
{
    let mut ctx = C::new(window, window, size, settings);
    if let Some(e) = ctx.last_error() {
        return Err(e.clone());
    }
    ctx.init()?;
    info!(backend = ctx.backend_name(), "render context ready");
    Ok(Box::new(ctx))
}

fn to_render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

pub struct WindowInstance<F: WindowFunctions> {
    config: WindowConfig,
    functions: F,
    factory: ContextFactory,
    input: FrameInput,
    // Declared before `window` so the context goes first.
    context: Option<Box<dyn RenderContext>>,
    window: Option<Window>,
    exiting: bool,
    exit_code: i32,
}

impl<F: WindowFunctions> WindowInstance<F> {
    pub fn new(config: WindowConfig, functions: F, factory: ContextFactory) -> Self {
        Self {
            config,
            functions,
            factory,
            input: FrameInput::default(),
            context: None,
            window: None,
            exiting: false,
            exit_code: 0,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop, code: i32) {
        if self.exit_code == 0 {
            self.exit_code = code;
        }
        self.exiting = true;
        self.context = None;
        self.window = None;
        event_loop.exit();
    }

    fn create_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(PhysicalSize::new(
                self.config.size.width.max(1),
                self.config.size.height.max(1),
            ));
        let window = event_loop.create_window(attrs).context("create_window")?;
        let size = to_render_size(window.inner_size());
        let context = (self.factory)(&window, size).context("creating render context")?;
        info!(
            backend = context.backend_name(),
            width = size.width,
            height = size.height,
            "window ready"
        );
        self.context = Some(context);
        self.window = Some(window);
        Ok(())
    }

    fn on_key(&mut self, event_loop: &ActiveEventLoop, event: KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        let PhysicalKey::Code(code) = event.physical_key else {
            return;
        };
        if code == KeyCode::Escape {
            info!("Escape pressed");
            self.shutdown(event_loop, 0);
            return;
        }
        self.input.press(code);
    }

    fn frame(&mut self, event_loop: &ActiveEventLoop) {
        let Some(ctx) = self.context.as_deref_mut() else {
            return;
        };
        ctx.pre_render();
        self.functions.input(&self.input);
        self.input.clear();
        self.functions.render(ctx);

        if let Err(e) = ctx.render_frame() {
            error!("render error: {e}");
            self.shutdown(event_loop, 1);
            return;
        }
        if self.functions.should_close() {
            info!("window functions requested close");
            self.shutdown(event_loop, 0);
        }
    }
}

impl<F: WindowFunctions> ApplicationHandler for WindowInstance<F> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.exiting {
            return;
        }
        if let Err(e) = self.create_window(event_loop) {
            error!("{e:#}");
            self.shutdown(event_loop, 1);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        match &self.window {
            Some(window) if window.id() == window_id => {}
            _ => return,
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop, 0);
            }
            WindowEvent::Resized(new_size) => {
                let size = to_render_size(new_size);
                info!("Resized → {}x{}", size.width, size.height);
                if let Some(ctx) = self.context.as_deref_mut() {
                    ctx.resize_screen(size);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => self.on_key(event_loop, event),
            WindowEvent::RedrawRequested => {
                if !self.exiting {
                    self.frame(event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }
}

/// Runs the event loop until the window closes. Returns the process exit code.
pub fn run<F: WindowFunctions>(
    config: WindowConfig,
    functions: F,
    factory: ContextFactory,
) -> Result<i32> {
    let event_loop: EventLoop<()> = EventLoop::new().context("creating event loop")?;
    let mut instance = WindowInstance::new(config, functions, factory);
    event_loop.run_app(&mut instance)?;
    Ok(instance.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressed_keys_are_deduplicated() {
        let mut input = FrameInput::default();
        input.press(KeyCode::KeyT);
        input.press(KeyCode::KeyT);
        input.press(KeyCode::F1);
        assert_eq!(input.pressed(), &[KeyCode::KeyT, KeyCode::F1]);
        assert!(input.was_pressed(KeyCode::F1));
        assert!(!input.was_pressed(KeyCode::Escape));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut input = FrameInput::default();
        input.press(KeyCode::Space);
        input.clear();
        assert!(input.pressed().is_empty());
        assert!(!input.was_pressed(KeyCode::Space));
    }

    #[test]
    fn physical_sizes_map_directly() {
        assert_eq!(
            to_render_size(PhysicalSize::new(800, 0)),
            RenderSize::new(800, 0)
        );
    }

    #[test]
    fn default_window_config() {
        let cfg = WindowConfig::default();
        assert_eq!(cfg.title, "GOAT");
        assert_eq!(cfg.size, RenderSize::new(1280, 720));
    }
}
