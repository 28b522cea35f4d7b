// SPDX-License-Identifier: CEPL-1.0
use ash::vk::{self, Handle};

/// A device-owned Vulkan object that this crate creates and must destroy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeviceObject {
    ImageView(vk::ImageView),
    RenderPass(vk::RenderPass),
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    Framebuffer(vk::Framebuffer),
    CommandPool(vk::CommandPool),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
}

macro_rules! device_object_from {
    ($($variant:ident),* $(,)?) => {
        $(impl From<vk::$variant> for DeviceObject {
            fn from(h: vk::$variant) -> Self {
                DeviceObject::$variant(h)
            }
        })*
    };
}

device_object_from!(
    ImageView,
    RenderPass,
    PipelineLayout,
    Pipeline,
    Framebuffer,
    CommandPool,
    Semaphore,
    Fence,
);

impl DeviceObject {
    fn raw(&self) -> u64 {
        match *self {
            DeviceObject::ImageView(h) => h.as_raw(),
            DeviceObject::RenderPass(h) => h.as_raw(),
            DeviceObject::PipelineLayout(h) => h.as_raw(),
            DeviceObject::Pipeline(h) => h.as_raw(),
            DeviceObject::Framebuffer(h) => h.as_raw(),
            DeviceObject::CommandPool(h) => h.as_raw(),
            DeviceObject::Semaphore(h) => h.as_raw(),
            DeviceObject::Fence(h) => h.as_raw(),
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        self.raw() == 0
    }

    /// # Safety
    /// The object must belong to `device` and no pending GPU work may use it.
    pub(crate) unsafe fn destroy(self, device: &ash::Device) {
        match self {
            DeviceObject::ImageView(h) => device.destroy_image_view(h, None),
            DeviceObject::RenderPass(h) => device.destroy_render_pass(h, None),
            DeviceObject::PipelineLayout(h) => device.destroy_pipeline_layout(h, None),
            DeviceObject::Pipeline(h) => device.destroy_pipeline(h, None),
            DeviceObject::Framebuffer(h) => device.destroy_framebuffer(h, None),
            // Frees every command buffer allocated from it as well.
            DeviceObject::CommandPool(h) => device.destroy_command_pool(h, None),
            DeviceObject::Semaphore(h) => device.destroy_semaphore(h, None),
            DeviceObject::Fence(h) => device.destroy_fence(h, None),
        }
    }
}

/// Objects in creation order; released newest-first.
#[derive(Debug, Default)]
pub(crate) struct ResourceStack {
    objects: Vec<DeviceObject>,
}

impl ResourceStack {
    pub(crate) fn push<T: Into<DeviceObject> + Copy>(&mut self, handle: T) -> T {
        self.objects.push(handle.into());
        handle
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    /// Pops every object in reverse push order, handing non-null ones to `f`.
    pub(crate) fn release_with(&mut self, mut f: impl FnMut(DeviceObject)) {
        while let Some(obj) = self.objects.pop() {
            if !obj.is_null() {
                f(obj);
            }
        }
    }

    /// # Safety
    /// Every object must belong to `device` and be idle on the GPU.
    pub(crate) unsafe fn release(&mut self, device: &ash::Device) {
        self.release_with(|obj| unsafe { obj.destroy(device) });
    }
}
