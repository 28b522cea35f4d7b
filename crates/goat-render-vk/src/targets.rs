// SPDX-License-Identifier: CEPL-1.0
use crate::pipeline::{
    create_framebuffers, create_graphics_pipeline, create_render_pass, PipelineState,
};
use crate::resource::ResourceStack;
use crate::swapchain::SwapchainState;
use ash::vk;
use goat_render::RenderError;
use std::path::Path;
use tracing::debug;

/// Everything that has to be rebuilt with the swapchain.
pub(crate) struct RenderTargets {
    pub render_pass: vk::RenderPass,
    pub pipeline: PipelineState,
    pub framebuffers: Vec<vk::Framebuffer>,
    /// Signalled by the submit for image `i`, waited by its present.
    pub render_finished: Vec<vk::Semaphore>,
    /// Fence of the slot that last rendered image `i`; borrowed, not owned.
    pub images_in_flight: Vec<vk::Fence>,
    owned: ResourceStack,
}

impl RenderTargets {
    /// # Safety
    /// The swapchain views must be live. On error nothing is left behind.
    pub(crate) unsafe fn build(
        device: &ash::Device,
        swapchain: &SwapchainState,
        shader_dir: &Path,
    ) -> Result<Self, RenderError> {
        let mut owned = ResourceStack::default();
        let mut framebuffers = Vec::new();
        match Self::build_into(device, swapchain, shader_dir, &mut owned, &mut framebuffers) {
            Ok((render_pass, pipeline, render_finished)) => {
                debug!(
                    framebuffers = framebuffers.len(),
                    objects = owned.len(),
                    "render targets built"
                );
                Ok(Self {
                    render_pass,
                    pipeline,
                    images_in_flight: vec![vk::Fence::null(); swapchain.image_count()],
                    framebuffers,
                    render_finished,
                    owned,
                })
            }
            Err(e) => {
                owned.release(device);
                Err(e)
            }
        }
    }

    unsafe fn build_into(
        device: &ash::Device,
        swapchain: &SwapchainState,
        shader_dir: &Path,
        owned: &mut ResourceStack,
        framebuffers: &mut Vec<vk::Framebuffer>,
    ) -> Result<(vk::RenderPass, PipelineState, Vec<vk::Semaphore>), RenderError> {
        let render_pass = owned.push(create_render_pass(device, swapchain.format.format)?);

        let pipeline = create_graphics_pipeline(device, render_pass, swapchain.extent, shader_dir)?;
        owned.push(pipeline.layout);
        owned.push(pipeline.pipeline);

        let created = create_framebuffers(
            device,
            render_pass,
            &swapchain.views,
            swapchain.extent,
            framebuffers,
        );
        for &fb in framebuffers.iter() {
            owned.push(fb);
        }
        created?;

        let sem_ci = vk::SemaphoreCreateInfo::default();
        let mut render_finished = Vec::with_capacity(swapchain.image_count());
        for _ in 0..swapchain.image_count() {
            let sem = device
                .create_semaphore(&sem_ci, None)
                .map_err(|e| RenderError::SyncObjectCreation(e.to_string()))?;
            render_finished.push(owned.push(sem));
        }
        Ok((render_pass, pipeline, render_finished))
    }

    /// # Safety
    /// Nothing in flight may use these objects.
    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        self.owned.release(device);
        self.framebuffers.clear();
        self.render_finished.clear();
        self.images_in_flight.clear();
        self.pipeline = PipelineState::default();
        self.render_pass = vk::RenderPass::null();
    }
}
