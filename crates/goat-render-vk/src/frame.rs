// SPDX-License-Identifier: CEPL-1.0
use crate::device::DeviceContext;
use crate::pipeline::find_memory_type;
use crate::resource::ResourceStack;
use ash::vk::{self, Handle};
use goat_render::RenderError;
use tracing::{debug, trace};

/// Where one frame is in its acquire/record/submit/present cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameState {
    #[default]
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

impl FrameState {
    /// The only state that may follow this one.
    pub fn next(self) -> FrameState {
        match self {
            FrameState::Idle => FrameState::Acquiring,
            FrameState::Acquiring => FrameState::Recording,
            FrameState::Recording => FrameState::Submitted,
            FrameState::Submitted => FrameState::Presenting,
            FrameState::Presenting => FrameState::Idle,
        }
    }

    /// Moves on to the next state, checking the caller meant that one.
    pub(crate) fn advance(&mut self, to: FrameState) {
        debug_assert_eq!(self.next(), to, "frame state skipped from {self:?}");
        *self = to;
    }
}

/// Never more slots than swapchain images, never fewer than one.
pub(crate) fn frames_in_flight(requested: usize, image_count: usize) -> usize {
    requested.min(image_count).max(1)
}

/// Grown geometric so a slowly growing batch does not reallocate every frame.
pub(crate) fn grown_capacity(current: vk::DeviceSize, needed: vk::DeviceSize) -> vk::DeviceSize {
    const MIN_BYTES: vk::DeviceSize = 4096;
    if needed <= current {
        return current;
    }
    needed.max(MIN_BYTES).next_power_of_two()
}

/// A host-visible, coherent buffer that is rewritten every frame.
#[derive(Debug, Default)]
pub(crate) struct HostBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    capacity: vk::DeviceSize,
}

impl HostBuffer {
    unsafe fn create(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, RenderError> {
        let device = &ctx.device;
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = device
            .create_buffer(&info, None)
            .map_err(|e| RenderError::BufferCreation(e.to_string()))?;
        let req = device.get_buffer_memory_requirements(buffer);
        let Some(memory_type_index) = find_memory_type(
            &ctx.memory_properties,
            req.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) else {
            device.destroy_buffer(buffer, None);
            return Err(RenderError::BufferCreation(
                "no host-visible coherent memory type".into(),
            ));
        };
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        let memory = match device.allocate_memory(&alloc, None) {
            Ok(m) => m,
            Err(e) => {
                device.destroy_buffer(buffer, None);
                return Err(RenderError::BufferCreation(e.to_string()));
            }
        };
        if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
            device.destroy_buffer(buffer, None);
            device.free_memory(memory, None);
            return Err(RenderError::BufferCreation(e.to_string()));
        }
        Ok(Self {
            buffer,
            memory,
            capacity: size,
        })
    }

    /// Makes sure at least `needed` bytes fit. The old buffer must be idle.
    unsafe fn reserve(
        &mut self,
        ctx: &DeviceContext,
        needed: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<(), RenderError> {
        // Zero-sized buffers are invalid, so an empty stream still gets one.
        let capacity = grown_capacity(self.capacity, needed.max(1));
        if capacity == self.capacity && self.buffer.as_raw() != 0 {
            return Ok(());
        }
        let fresh = HostBuffer::create(ctx, capacity, usage)?;
        self.destroy(&ctx.device);
        *self = fresh;
        trace!(bytes = capacity, ?usage, "geometry buffer grown");
        Ok(())
    }

    unsafe fn write(&self, device: &ash::Device, bytes: &[u8]) -> Result<(), RenderError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let ptr = device
            .map_memory(
                self.memory,
                0,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
            .map_err(|e| RenderError::BufferCreation(format!("map: {e}")))?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
        device.unmap_memory(self.memory);
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.buffer.as_raw() != 0 {
            device.destroy_buffer(self.buffer, None);
        }
        if self.memory.as_raw() != 0 {
            device.free_memory(self.memory, None);
        }
        *self = HostBuffer::default();
    }
}

/// Per-slot vertex and index storage, created on first use.
#[derive(Debug, Default)]
pub(crate) struct GeometryBuffers {
    pub vertex: HostBuffer,
    pub index: HostBuffer,
    pub index_count: u32,
}

impl GeometryBuffers {
    /// Copies this frame's batch in. The slot's fence must already be signalled.
    pub(crate) unsafe fn upload(
        &mut self,
        ctx: &DeviceContext,
        vertices: &[u8],
        indices: &[u32],
    ) -> Result<(), RenderError> {
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        self.vertex.reserve(
            ctx,
            vertices.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        self.index.reserve(
            ctx,
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        self.vertex.write(&ctx.device, vertices)?;
        self.index.write(&ctx.device, index_bytes)?;
        self.index_count = indices.len() as u32;
        Ok(())
    }

    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        self.index.destroy(device);
        self.vertex.destroy(device);
        self.index_count = 0;
    }
}

/// One frame in flight: its acquire semaphore, its fence and its geometry.
#[derive(Debug)]
pub(crate) struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub geometry: Option<GeometryBuffers>,
}

/// Command pool, one command buffer per swapchain image, and the frame slots.
pub(crate) struct FrameEngine {
    pub pool: vk::CommandPool,
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// `true` while image `i`'s buffer holds a reusable clear-only pass.
    pub clear_recorded: Vec<bool>,
    pub slots: Vec<FrameSlot>,
    pub current: usize,
    owned: ResourceStack,
}

impl FrameEngine {
    /// # Safety
    /// `ctx` must outlive the engine; call [`FrameEngine::destroy`] before it goes.
    pub(crate) unsafe fn create(
        ctx: &DeviceContext,
        image_count: usize,
        frames: usize,
    ) -> Result<Self, RenderError> {
        let mut owned = ResourceStack::default();
        match Self::create_into(ctx, image_count, frames, &mut owned) {
            Ok((pool, command_buffers, slots)) => {
                debug!(
                    command_buffers = command_buffers.len(),
                    frames_in_flight = slots.len(),
                    "frame resources created"
                );
                Ok(Self {
                    pool,
                    clear_recorded: vec![false; command_buffers.len()],
                    command_buffers,
                    slots,
                    current: 0,
                    owned,
                })
            }
            Err(e) => {
                owned.release(&ctx.device);
                Err(e)
            }
        }
    }

    unsafe fn create_into(
        ctx: &DeviceContext,
        image_count: usize,
        frames: usize,
        owned: &mut ResourceStack,
    ) -> Result<(vk::CommandPool, Vec<vk::CommandBuffer>, Vec<FrameSlot>), RenderError> {
        let device = &ctx.device;
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: ctx.families.graphics,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let pool = owned.push(
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| RenderError::CommandBuffer(format!("pool: {e}")))?,
        );
        let command_buffers = allocate_command_buffers(device, pool, image_count)?;

        let sem_ci = vk::SemaphoreCreateInfo::default();
        // Signalled so the first wait on each slot returns at once.
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let mut slots = Vec::with_capacity(frames);
        for _ in 0..frames {
            let image_available = owned.push(
                device
                    .create_semaphore(&sem_ci, None)
                    .map_err(|e| RenderError::SyncObjectCreation(e.to_string()))?,
            );
            let in_flight = owned.push(
                device
                    .create_fence(&fence_ci, None)
                    .map_err(|e| RenderError::SyncObjectCreation(e.to_string()))?,
            );
            slots.push(FrameSlot {
                image_available,
                in_flight,
                geometry: None,
            });
        }
        Ok((pool, command_buffers, slots))
    }

    pub(crate) fn slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub(crate) fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Reallocates command buffers when the swapchain image count changes.
    pub(crate) unsafe fn resize_command_buffers(
        &mut self,
        device: &ash::Device,
        image_count: usize,
    ) -> Result<(), RenderError> {
        if self.command_buffers.len() == image_count {
            return Ok(());
        }
        if !self.command_buffers.is_empty() {
            device.free_command_buffers(self.pool, &self.command_buffers);
            self.command_buffers.clear();
        }
        self.clear_recorded.clear();
        self.command_buffers = allocate_command_buffers(device, self.pool, image_count)?;
        self.clear_recorded = vec![false; image_count];
        Ok(())
    }

    /// # Safety
    /// The device must be idle.
    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in &mut self.slots {
            if let Some(mut geometry) = slot.geometry.take() {
                geometry.destroy(device);
            }
        }
        self.slots.clear();
        // Buffers go with the pool.
        self.command_buffers.clear();
        self.clear_recorded.clear();
        self.owned.release(device);
    }
}

unsafe fn allocate_command_buffers(
    device: &ash::Device,
    pool: vk::CommandPool,
    count: usize,
) -> Result<Vec<vk::CommandBuffer>, RenderError> {
    let info = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: count as u32,
        ..Default::default()
    };
    device
        .allocate_command_buffers(&info)
        .map_err(|e| RenderError::CommandBuffer(format!("allocate: {e}")))
}

/// Whether a recorded buffer can be submitted again without re-recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Recording {
    Reusable,
    OneShot,
}

impl Recording {
    /// How to re-record an image's buffer this frame, or `None` when the clear
    /// pass already in it can be submitted as is.
    pub(crate) fn needed(has_geometry: bool, clear_recorded: bool) -> Option<Recording> {
        match (has_geometry, clear_recorded) {
            (true, _) => Some(Recording::OneShot),
            (false, false) => Some(Recording::Reusable),
            (false, true) => None,
        }
    }

    fn usage(self) -> vk::CommandBufferUsageFlags {
        match self {
            Recording::Reusable => vk::CommandBufferUsageFlags::empty(),
            Recording::OneShot => vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        }
    }
}

/// What one recorded pass needs.
pub(crate) struct PassTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear: [f32; 4],
    pub pipeline: vk::Pipeline,
}

/// Begin, clear, optionally draw the batch, end.
pub(crate) unsafe fn record_pass(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    target: &PassTarget,
    geometry: Option<&GeometryBuffers>,
    recording: Recording,
) -> Result<(), RenderError> {
    let err = |what: &str, e: vk::Result| RenderError::CommandBuffer(format!("{what}: {e}"));
    device
        .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        .map_err(|e| err("reset", e))?;
    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: recording.usage(),
        ..Default::default()
    };
    device
        .begin_command_buffer(cmd, &begin)
        .map_err(|e| err("begin", e))?;

    let clear = vk::ClearValue {
        color: vk::ClearColorValue {
            float32: target.clear,
        },
    };
    let pass = vk::RenderPassBeginInfo {
        s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
        render_pass: target.render_pass,
        framebuffer: target.framebuffer,
        render_area: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        },
        clear_value_count: 1,
        p_clear_values: &clear,
        ..Default::default()
    };
    device.cmd_begin_render_pass(cmd, &pass, vk::SubpassContents::INLINE);

    if let Some(g) = geometry.filter(|g| g.index_count > 0) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline);
        device.cmd_bind_vertex_buffers(cmd, 0, &[g.vertex.buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, g.index.buffer, 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, g.index_count, 1, 0, 0, 0);
    }

    device.cmd_end_render_pass(cmd);
    device.end_command_buffer(cmd).map_err(|e| err("end", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_state_cycles_in_order() {
        let mut state = FrameState::default();
        let order = [
            FrameState::Acquiring,
            FrameState::Recording,
            FrameState::Submitted,
            FrameState::Presenting,
            FrameState::Idle,
        ];
        for to in order {
            state.advance(to);
            assert_eq!(state, to);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "frame state skipped")]
    fn frame_state_rejects_skips() {
        let mut state = FrameState::Idle;
        state.advance(FrameState::Submitted);
    }

    #[test]
    fn empty_frames_reuse_the_recorded_clear() {
        assert_eq!(Recording::needed(false, true), None);
        assert_eq!(Recording::needed(false, false), Some(Recording::Reusable));
        assert_eq!(Recording::needed(true, true), Some(Recording::OneShot));
        assert_eq!(Recording::needed(true, false), Some(Recording::OneShot));
    }

    #[test]
    fn only_clear_passes_are_reusable() {
        assert!(Recording::Reusable.usage().is_empty());
        assert!(Recording::OneShot
            .usage()
            .contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT));
    }

    #[test]
    fn frames_in_flight_is_bounded_by_images() {
        assert_eq!(frames_in_flight(2, 3), 2);
        assert_eq!(frames_in_flight(4, 3), 3);
        assert_eq!(frames_in_flight(0, 3), 1);
        assert_eq!(frames_in_flight(2, 0), 1);
    }

    #[test]
    fn capacity_grows_geometrically() {
        assert_eq!(grown_capacity(0, 84), 4096);
        assert_eq!(grown_capacity(4096, 100), 4096);
        assert_eq!(grown_capacity(4096, 5000), 8192);
        assert_eq!(grown_capacity(0, 0), 0);
    }
}
