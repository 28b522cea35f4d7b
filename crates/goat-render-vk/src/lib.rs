// SPDX-License-Identifier: CEPL-1.0
//! Vulkan implementation of [`goat_render::RenderContext`].
//!
//! Objects are created in one fixed order by `init` (device, swapchain,
//! render targets, frame resources) and torn down in the reverse order when
//! the context is dropped, even if `init` stopped half way.

mod device;
mod frame;
mod pipeline;
mod resource;
mod swapchain;
mod targets;

pub use frame::FrameState;

use ash::vk::{self, Handle};
use device::DeviceContext;
use frame::{
    frames_in_flight, record_pass, FrameEngine, GeometryBuffers, PassTarget, Recording,
};
use goat_render::{
    ErrorLatch, RenderBatch, RenderContext, RenderError, RenderSettings, RenderSize, Renderable,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::path::PathBuf;
use swapchain::{surface_extent, SwapchainState};
use targets::RenderTargets;
use tracing::{debug, info};

pub struct VkRenderContext {
    display: Option<RawDisplayHandle>,
    window: Option<RawWindowHandle>,
    settings: RenderSettings,
    size: RenderSize,
    pending_resize: Option<RenderSize>,
    paused: bool,
    batch: RenderBatch,
    errors: ErrorLatch,
    state: FrameState,

    // Filled by `init` in this order; `Drop` empties them in reverse.
    device: Option<DeviceContext>,
    swapchain: Option<SwapchainState>,
    targets: Option<RenderTargets>,
    frames: Option<FrameEngine>,
}

impl VkRenderContext {
    pub fn frame_state(&self) -> FrameState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn shader_dir(&self) -> PathBuf {
        self.settings
            .shader_dir
            .clone()
            .unwrap_or_else(pipeline::default_shader_dir)
    }

    unsafe fn init_gpu(&mut self) -> Result<(), RenderError> {
        let (Some(display), Some(window)) = (self.display, self.window) else {
            return Err(RenderError::WindowHandle("no window to render into".into()));
        };
        self.device = Some(DeviceContext::create(display, window)?);
        self.rebuild_swapchain()?;
        info!(
            width = self.size.width,
            height = self.size.height,
            vsync = self.settings.vsync,
            "vk: context initialised"
        );
        Ok(())
    }

    unsafe fn apply_pending_resize(&mut self) -> Result<(), RenderError> {
        let Some(size) = self.pending_resize.take() else {
            return Ok(());
        };
        self.size = size;
        if size.is_zero() {
            if !self.paused {
                info!("vk: resize to 0x0 → paused=true");
            }
            self.paused = true;
            return Ok(());
        }
        if self.paused {
            info!("vk: resize to {}x{} → paused=false", size.width, size.height);
        }
        self.paused = false;
        self.rebuild_swapchain()
    }

    // STRICT RECREATE ORDER:
    // 1) device_wait_idle
    // 2) destroy targets (semaphores, framebuffers, pipeline, layout, render pass)
    // 3) destroy views of the old swapchain
    // 4) create the new swapchain from the old one, then retire the old one
    // 5) rebuild targets against the new format and extent
    // 6) resize command buffers if the image count changed, re-record clears
    unsafe fn rebuild_swapchain(&mut self) -> Result<(), RenderError> {
        let shader_dir = self.shader_dir();
        let Some(ctx) = self.device.as_ref() else {
            return Ok(());
        };
        let device = &ctx.device;

        let extent = surface_extent(ctx, self.size)?;
        if extent.width == 0 || extent.height == 0 {
            if !self.paused {
                info!("vk: surface extent is 0x0 → paused=true");
            }
            self.paused = true;
            return Ok(());
        }

        device.device_wait_idle().ok();
        if let Some(mut targets) = self.targets.take() {
            targets.destroy(device);
        }
        let old = match self.swapchain.as_mut() {
            Some(sc) => {
                sc.destroy_views(device);
                sc.swapchain
            }
            None => vk::SwapchainKHR::null(),
        };
        let fresh = SwapchainState::create(ctx, self.size, self.settings.vsync, old);
        if let Some(mut retired) = self.swapchain.take() {
            retired.destroy(device);
        }
        let swapchain = self.swapchain.insert(fresh?);
        let targets = self
            .targets
            .insert(RenderTargets::build(device, swapchain, &shader_dir)?);

        let image_count = swapchain.image_count();
        match self.frames.as_mut() {
            Some(frames) => frames.resize_command_buffers(device, image_count)?,
            None => {
                self.frames = Some(FrameEngine::create(
                    ctx,
                    image_count,
                    frames_in_flight(self.settings.frames_in_flight, image_count),
                )?)
            }
        }
        if let Some(frames) = self.frames.as_mut() {
            let clear = self.settings.clear_color;
            record_clear_passes(device, frames, targets, swapchain.extent, clear)?;
        }

        self.paused = false;
        debug!(
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            images = image_count,
            present_mode = ?swapchain.present_mode,
            "vk: swapchain rebuilt"
        );
        Ok(())
    }

    // STRICT PER-FRAME ORDER:
    // 1) wait the slot fence, acquire with the slot's image-available semaphore
    // 2) wait whichever slot still owns the image, then reset our fence
    // 3) upload, record, submit (signals the image's render-finished)
    // 4) present waiting on render-finished
    unsafe fn draw_frame(&mut self) -> Result<(), RenderError> {
        self.apply_pending_resize()?;
        if self.paused {
            return Ok(());
        }
        let (Some(ctx), Some(swapchain), Some(targets), Some(frames)) = (
            self.device.as_ref(),
            self.swapchain.as_ref(),
            self.targets.as_mut(),
            self.frames.as_mut(),
        ) else {
            return Ok(());
        };
        let device = &ctx.device;

        self.state.advance(FrameState::Acquiring);
        let slot_index = frames.current;
        let image_available = frames.slot().image_available;
        let in_flight = frames.slot().in_flight;
        device
            .wait_for_fences(&[in_flight], true, u64::MAX)
            .map_err(|e| RenderError::Submit(format!("waiting for frame fence: {e}")))?;

        let image_index = match swapchain.loader.acquire_next_image(
            swapchain.swapchain,
            u64::MAX,
            image_available,
            vk::Fence::null(),
        ) {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // Nothing was submitted, so the slot fence is still signalled.
                debug!("vk: swapchain out of date on acquire");
                self.state = FrameState::Idle;
                return self.rebuild_swapchain();
            }
            Err(e) => return Err(RenderError::Acquire(e.to_string())),
        };
        let image = image_index as usize;

        let owner = targets.images_in_flight[image];
        if owner.as_raw() != 0 && owner != in_flight {
            device
                .wait_for_fences(&[owner], true, u64::MAX)
                .map_err(|e| RenderError::Submit(format!("waiting for image fence: {e}")))?;
        }
        targets.images_in_flight[image] = in_flight;
        device
            .reset_fences(&[in_flight])
            .map_err(|e| RenderError::Submit(format!("resetting frame fence: {e}")))?;
        self.state.advance(FrameState::Recording);

        let cmd = frames.command_buffers[image];
        let slot = &mut frames.slots[slot_index];
        let geometry = if self.batch.index_count() > 0 {
            let buffers = slot.geometry.get_or_insert_with(GeometryBuffers::default);
            let vertices = self.batch.vertices();
            buffers.upload(ctx, bytemuck::cast_slice(&vertices), self.batch.indices())?;
            Some(&*buffers)
        } else {
            None
        };
        let reusable = frames.clear_recorded[image];
        if let Some(recording) = Recording::needed(geometry.is_some(), reusable) {
            let target = PassTarget {
                render_pass: targets.render_pass,
                framebuffer: targets.framebuffers[image],
                extent: swapchain.extent,
                clear: self.settings.clear_color,
                pipeline: targets.pipeline.pipeline,
            };
            frames.clear_recorded[image] = false;
            record_pass(device, cmd, &target, geometry, recording)?;
            frames.clear_recorded[image] = geometry.is_none();
        }

        let render_finished = targets.render_finished[image];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &image_available,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &render_finished,
            ..Default::default()
        };
        device
            .queue_submit(ctx.graphics_queue, std::slice::from_ref(&submit), in_flight)
            .map_err(|e| RenderError::Submit(e.to_string()))?;
        self.state.advance(FrameState::Submitted);

        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &render_finished,
            swapchain_count: 1,
            p_swapchains: &swapchain.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        self.state.advance(FrameState::Presenting);
        let stale = match swapchain.loader.queue_present(ctx.present_queue, &present) {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(RenderError::Present(e.to_string())),
        };

        frames.advance();
        self.state.advance(FrameState::Idle);
        if stale {
            debug!("vk: swapchain stale after present");
            self.rebuild_swapchain()?;
        }
        Ok(())
    }
}

/// Pre-records a reusable clear-only pass into every image's command buffer.
unsafe fn record_clear_passes(
    device: &ash::Device,
    frames: &mut FrameEngine,
    targets: &RenderTargets,
    extent: vk::Extent2D,
    clear: [f32; 4],
) -> Result<(), RenderError> {
    frames.clear_recorded.fill(false);
    for (image, (&cmd, &framebuffer)) in frames
        .command_buffers
        .iter()
        .zip(&targets.framebuffers)
        .enumerate()
    {
        let target = PassTarget {
            render_pass: targets.render_pass,
            framebuffer,
            extent,
            clear,
            pipeline: targets.pipeline.pipeline,
        };
        record_pass(device, cmd, &target, None, Recording::Reusable)?;
        frames.clear_recorded[image] = true;
    }
    Ok(())
}

impl RenderContext for VkRenderContext {
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
            pending_resize: None,
            paused: size.is_zero(),
            batch: RenderBatch::new(),
            errors,
            state: FrameState::Idle,
            device: None,
            swapchain: None,
            targets: None,
            frames: None,
        }
    }

    fn backend_name(&self) -> &'static str {
        "Vulkan"
    }

    fn init(&mut self) -> Result<(), RenderError> {
        self.errors.check()?;
        if self.device.is_some() {
            return Ok(());
        }
        let result = unsafe { self.init_gpu() };
        self.errors.latch(result)
    }

    fn resize_screen(&mut self, size: RenderSize) {
        self.pending_resize = Some(size);
    }

    fn pre_render(&mut self) {
        if self.errors.is_set() {
            return;
        }
        let result = unsafe { self.apply_pending_resize() };
        let _ = self.errors.latch(result);
    }

    fn render_frame(&mut self) -> Result<(), RenderError> {
        self.errors.check()?;
        let result = unsafe { self.draw_frame() };
        self.batch.clear();
        if result.is_err() {
            self.state = FrameState::Idle;
        }
        self.errors.latch(result)
    }

    fn submit_renderable(&mut self, renderable: &dyn Renderable) {
        self.batch.push(renderable);
    }

    fn last_error(&self) -> Option<&RenderError> {
        self.errors.get()
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        if self.settings.clear_color == rgba {
            return;
        }
        self.settings.clear_color = rgba;
        // Recorded clears carry the old colour.
        if let Some(frames) = self.frames.as_mut() {
            frames.clear_recorded.fill(false);
        }
    }

    fn set_vsync(&mut self, on: bool) {
        if self.settings.vsync == on {
            return;
        }
        self.settings.vsync = on;
        // Present mode is fixed per swapchain.
        self.pending_resize.get_or_insert(self.size);
    }
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle
// - frame resources: geometry, slot semaphores/fences, command pool
// - targets: per-image semaphores, framebuffers, pipeline, layout, render pass
// - image views, then the swapchain
// - device, debug messenger, surface, instance (DeviceContext's own Drop)
impl Drop for VkRenderContext {
    fn drop(&mut self) {
        let Some(ctx) = self.device.as_ref() else {
            return;
        };
        unsafe {
            let device = &ctx.device;
            device.device_wait_idle().ok();
            if let Some(mut frames) = self.frames.take() {
                frames.destroy(device);
            }
            if let Some(mut targets) = self.targets.take() {
                targets.destroy(device);
            }
            if let Some(mut swapchain) = self.swapchain.take() {
                swapchain.destroy(device);
            }
        }
        self.device = None;
        info!("vk: context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoWindow;

    impl HasWindowHandle for NoWindow {
        fn window_handle(
            &self,
        ) -> Result<raw_window_handle::WindowHandle<'_>, raw_window_handle::HandleError> {
            Err(raw_window_handle::HandleError::Unavailable)
        }
    }

    impl HasDisplayHandle for NoWindow {
        fn display_handle(
            &self,
        ) -> Result<raw_window_handle::DisplayHandle<'_>, raw_window_handle::HandleError> {
            Err(raw_window_handle::HandleError::Unavailable)
        }
    }

    fn headless() -> VkRenderContext {
        VkRenderContext::new(
            &NoWindow,
            &NoWindow,
            RenderSize::new(640, 480),
            RenderSettings::default(),
        )
    }

    #[test]
    fn missing_handles_latch_before_init() {
        let mut ctx = headless();
        assert!(ctx.has_error());
        assert!(matches!(ctx.last_error(), Some(RenderError::WindowHandle(_))));
        // init and render report the same error without touching Vulkan.
        let first = ctx.init().unwrap_err();
        assert_eq!(ctx.render_frame().unwrap_err(), first);
        assert_eq!(ctx.frame_state(), FrameState::Idle);
    }

    #[test]
    fn zero_resize_pauses_before_init() {
        let mut ctx = headless();
        ctx.errors = ErrorLatch::default();
        ctx.resize_screen(RenderSize::new(0, 0));
        ctx.pre_render();
        assert!(ctx.is_paused());
        ctx.resize_screen(RenderSize::new(800, 600));
        ctx.pre_render();
        assert!(!ctx.is_paused());
        assert_eq!(ctx.size, RenderSize::new(800, 600));
    }

    #[test]
    fn render_frame_drops_the_batch() {
        let mut ctx = headless();
        ctx.errors = ErrorLatch::default();
        ctx.submit_renderable(&goat_render::primitives::Triangle2d::new());
        assert_eq!(ctx.batch.index_count(), 3);
        // No GPU objects yet, so this is a no-op frame.
        assert!(ctx.render_frame().is_ok());
        assert!(ctx.batch.is_empty());
    }

    #[test]
    fn vsync_change_schedules_a_rebuild() {
        let mut ctx = headless();
        ctx.set_vsync(true);
        assert!(ctx.pending_resize.is_none());
        ctx.set_vsync(false);
        assert_eq!(ctx.pending_resize, Some(RenderSize::new(640, 480)));
        assert_eq!(ctx.backend_name(), "Vulkan");
    }
}
