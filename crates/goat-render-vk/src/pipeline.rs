// SPDX-License-Identifier: CEPL-1.0
use ash::util::read_spv;
use ash::vk;
use goat_render::{RenderError, Vertex};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub(crate) const VERTEX_SHADER_FILE: &str = "tri.vert.spv";
pub(crate) const FRAGMENT_SHADER_FILE: &str = "tri.frag.spv";

/// Where the build script left the compiled shaders.
pub(crate) fn default_shader_dir() -> PathBuf {
    PathBuf::from(env!("GOAT_SHADER_DIR"))
}

/// Reads one SPIR-V blob. Missing, empty and misaligned files are all load errors.
pub(crate) fn load_spirv(path: &Path) -> Result<Vec<u32>, RenderError> {
    let bytes = goat_core::fs::read_file(path);
    if bytes.is_empty() {
        return Err(RenderError::ShaderLoad(format!(
            "{} is missing or empty",
            path.display()
        )));
    }
    read_spv(&mut Cursor::new(&bytes[..]))
        .map_err(|e| RenderError::ShaderLoad(format!("{}: {e}", path.display())))
}

pub(crate) struct ShaderPair {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

pub(crate) fn load_shader_pair(dir: &Path) -> Result<ShaderPair, RenderError> {
    let vertex = load_spirv(&dir.join(VERTEX_SHADER_FILE))?;
    let fragment = load_spirv(&dir.join(FRAGMENT_SHADER_FILE))?;
    debug!(
        dir = %dir.display(),
        vertex_words = vertex.len(),
        fragment_words = fragment.len(),
        "loaded shaders"
    );
    Ok(ShaderPair { vertex, fragment })
}

/// Destroyed on drop; modules are only needed until the pipeline exists.
pub(crate) struct ShaderModule<'d> {
    device: &'d ash::Device,
    pub raw: vk::ShaderModule,
}

impl<'d> ShaderModule<'d> {
    pub(crate) unsafe fn new(device: &'d ash::Device, code: &[u32]) -> Result<Self, RenderError> {
        let info = vk::ShaderModuleCreateInfo {
            s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
            code_size: std::mem::size_of_val(code),
            p_code: code.as_ptr(),
            ..Default::default()
        };
        let raw = device
            .create_shader_module(&info, None)
            .map_err(|e| RenderError::ShaderModule(e.to_string()))?;
        Ok(Self { device, raw })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.raw, None) };
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PipelineState {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

/// Single color attachment: cleared on load, stored, handed to present.
pub(crate) unsafe fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
) -> Result<vk::RenderPass, RenderError> {
    let attachment = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        ..Default::default()
    };
    // The layout transition must wait for the acquire semaphore.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    };
    let info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &attachment,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    device
        .create_render_pass(&info, None)
        .map_err(|e| RenderError::RenderPassCreation(e.to_string()))
}

/// STRICT: viewport and scissor are baked in, so the pipeline is rebuilt
/// whenever the swapchain extent changes.
pub(crate) unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    shader_dir: &Path,
) -> Result<PipelineState, RenderError> {
    // Shaders first: a bad blob must not leave any pipeline object behind.
    let shaders = load_shader_pair(shader_dir)?;
    let vs = ShaderModule::new(device, &shaders.vertex)?;
    let fs = ShaderModule::new(device, &shaders.fragment)?;
    let entry = c"main";

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs.raw,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs.raw,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
    ];

    // binding 0: Vertex { position, color }
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: Vertex::STRIDE as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: Vertex::COLOR_OFFSET as u32,
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &binding,
        vertex_attribute_description_count: attributes.len() as u32,
        p_vertex_attribute_descriptions: attributes.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        primitive_restart_enable: vk::FALSE,
        ..Default::default()
    };

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        p_viewports: &viewport,
        scissor_count: 1,
        p_scissors: &scissor,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        depth_clamp_enable: vk::FALSE,
        rasterizer_discard_enable: vk::FALSE,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::CLOCKWISE,
        depth_bias_enable: vk::FALSE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        min_sample_shading: 1.0,
        ..Default::default()
    };
    // Straight alpha over the cleared target.
    let blend_attachment = vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::R
            | vk::ColorComponentFlags::G
            | vk::ColorComponentFlags::B
            | vk::ColorComponentFlags::A,
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        logic_op_enable: vk::FALSE,
        attachment_count: 1,
        p_attachments: &blend_attachment,
        ..Default::default()
    };

    // No descriptors or push constants.
    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        ..Default::default()
    };
    let layout = device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| RenderError::PipelineLayout(e.to_string()))?;

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        layout,
        render_pass,
        subpass: 0,
        base_pipeline_index: -1,
        ..Default::default()
    };

    let pipelines = match device.create_graphics_pipelines(
        vk::PipelineCache::null(),
        std::slice::from_ref(&pipeline_info),
        None,
    ) {
        Ok(p) => p,
        Err((_, e)) => {
            device.destroy_pipeline_layout(layout, None);
            return Err(RenderError::PipelineCreation(e.to_string()));
        }
    };

    info!(
        width = extent.width,
        height = extent.height,
        "graphics pipeline created"
    );
    Ok(PipelineState {
        layout,
        pipeline: pipelines[0],
    })
}

/// One framebuffer per view, pushed into `out` as they are made. Stops at
/// the first failure; whatever was created stays in `out` for cleanup.
pub(crate) unsafe fn create_framebuffers(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    views: &[vk::ImageView],
    extent: vk::Extent2D,
    out: &mut Vec<vk::Framebuffer>,
) -> Result<(), RenderError> {
    for view in views {
        let info = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: 1,
            p_attachments: view,
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        let fb = device
            .create_framebuffer(&info, None)
            .map_err(|e| RenderError::FramebufferCreation(e.to_string()))?;
        out.push(fb);
    }
    Ok(())
}

/// First memory type allowed by `type_bits` that has every `required` flag.
pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32)).find(|&i| {
        type_bits & (1 << i) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn spirv_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn empty_vertex_shader_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(VERTEX_SHADER_FILE), b"").unwrap();
        fs::write(
            dir.path().join(FRAGMENT_SHADER_FILE),
            spirv_bytes(&[SPIRV_MAGIC, 0x0001_0000]),
        )
        .unwrap();

        let err = load_shader_pair(dir.path()).err().unwrap();
        match &err {
            RenderError::ShaderLoad(msg) => assert!(msg.contains(VERTEX_SHADER_FILE), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().starts_with("failed to load shader"));
    }

    #[test]
    fn missing_fragment_shader_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(VERTEX_SHADER_FILE),
            spirv_bytes(&[SPIRV_MAGIC, 0x0001_0000]),
        )
        .unwrap();

        let err = load_shader_pair(dir.path()).err().unwrap();
        assert!(
            matches!(&err, RenderError::ShaderLoad(msg) if msg.contains(FRAGMENT_SHADER_FILE)),
            "{err:?}"
        );
    }

    #[test]
    fn misaligned_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.spv");
        fs::write(&path, [0x03u8, 0x02, 0x23, 0x07, 0x00, 0x00]).unwrap();
        assert!(matches!(load_spirv(&path), Err(RenderError::ShaderLoad(_))));
    }

    #[test]
    fn valid_blobs_load_as_words() {
        let dir = tempfile::tempdir().unwrap();
        let words = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        fs::write(dir.path().join(VERTEX_SHADER_FILE), spirv_bytes(&words)).unwrap();
        fs::write(dir.path().join(FRAGMENT_SHADER_FILE), spirv_bytes(&words)).unwrap();

        let pair = load_shader_pair(dir.path()).unwrap();
        assert_eq!(pair.vertex, words);
        assert_eq!(pair.fragment.len(), 5);
    }

    #[test]
    fn build_script_shaders_are_loadable() {
        let pair = load_shader_pair(&default_shader_dir()).unwrap();
        assert_eq!(pair.vertex[0], SPIRV_MAGIC);
        assert_eq!(pair.fragment[0], SPIRV_MAGIC);
    }

    fn memory_props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn memory_type_honours_bits_and_flags() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = memory_props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            host,
            host | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(find_memory_type(&props, 0b1111, host), Some(2));
        assert_eq!(find_memory_type(&props, 0b1000, host), Some(3));
        assert_eq!(find_memory_type(&props, 0b0011, host), None);
        assert_eq!(
            find_memory_type(&props, 0b0001, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }
}
