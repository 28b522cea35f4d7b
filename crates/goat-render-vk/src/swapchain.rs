// SPDX-License-Identifier: CEPL-1.0
use crate::device::{DeviceContext, QueueFamilies};
use ash::khr::swapchain;
use ash::vk::{self, Handle};
use goat_render::{RenderError, RenderSize};
use tracing::{debug, info};

pub(crate) const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// sRGB BGRA if offered, otherwise whatever the driver lists first.
pub(crate) fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
        })
        .or_else(|| formats.first().copied())
}

/// MAILBOX whenever offered. Without vsync IMMEDIATE comes next; FIFO is
/// guaranteed by the WSI, so it is always the last resort.
pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = if vsync {
        &[vk::PresentModeKHR::MAILBOX]
    } else {
        &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
    };
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub(crate) fn extent_from_caps(
    caps: &vk::SurfaceCapabilitiesKHR,
    want: RenderSize,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: want
            .width
            .max(caps.min_image_extent.width)
            .min(caps.max_image_extent.width),
        height: want
            .height
            .max(caps.min_image_extent.height)
            .min(caps.max_image_extent.height),
    }
}

/// One more than the minimum; a max of 0 means unbounded.
pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

pub(crate) fn sharing_mode(families: QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

/// Extent the surface would give us right now. Zero while minimized.
pub(crate) unsafe fn surface_extent(
    ctx: &DeviceContext,
    want: RenderSize,
) -> Result<vk::Extent2D, RenderError> {
    let caps = ctx
        .surface_loader()
        .get_physical_device_surface_capabilities(ctx.phys, ctx.surface())
        .map_err(|e| RenderError::SwapchainCreation(format!("surface capabilities: {e}")))?;
    Ok(extent_from_caps(&caps, want))
}

pub(crate) struct SwapchainState {
    pub loader: swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl SwapchainState {
    /// # Safety
    /// `old` must be null or a swapchain of this surface that is no longer in use.
    pub(crate) unsafe fn create(
        ctx: &DeviceContext,
        want: RenderSize,
        vsync: bool,
        old: vk::SwapchainKHR,
    ) -> Result<Self, RenderError> {
        let loader_surf = ctx.surface_loader();
        let err =
            |what: &str, e: vk::Result| RenderError::SwapchainCreation(format!("{what}: {e}"));
        let caps = loader_surf
            .get_physical_device_surface_capabilities(ctx.phys, ctx.surface())
            .map_err(|e| err("surface capabilities", e))?;
        let formats = loader_surf
            .get_physical_device_surface_formats(ctx.phys, ctx.surface())
            .map_err(|e| err("surface formats", e))?;
        let modes = loader_surf
            .get_physical_device_surface_present_modes(ctx.phys, ctx.surface())
            .map_err(|e| err("present modes", e))?;

        let format = choose_surface_format(&formats)
            .ok_or_else(|| RenderError::SwapchainCreation("surface reports no formats".into()))?;
        let present_mode = choose_present_mode(&modes, vsync);
        let extent = extent_from_caps(&caps, want);
        let min_images = image_count(&caps);
        let (sharing, family_indices) = sharing_mode(ctx.families);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface(),
            min_image_count: min_images,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: if family_indices.is_empty() {
                std::ptr::null()
            } else {
                family_indices.as_ptr()
            },
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };

        let loader = swapchain::Device::new(ctx.instance(), &ctx.device);
        let handle = loader
            .create_swapchain(&info, None)
            .map_err(|e| err("create", e))?;
        let images = match loader.get_swapchain_images(handle) {
            Ok(images) => images,
            Err(e) => {
                loader.destroy_swapchain(handle, None);
                return Err(err("images", e));
            }
        };
        let views = match create_image_views(&ctx.device, &images, format.format) {
            Ok(views) => views,
            Err(e) => {
                loader.destroy_swapchain(handle, None);
                return Err(e);
            }
        };

        info!(
            format = ?format.format,
            color_space = ?format.color_space,
            present_mode = ?present_mode,
            width = extent.width,
            height = extent.height,
            images = images.len(),
            sharing = ?sharing,
            "swapchain created"
        );

        Ok(Self {
            loader,
            swapchain: handle,
            images,
            views,
            format,
            present_mode,
            extent,
        })
    }

    pub(crate) fn image_count(&self) -> usize {
        self.images.len()
    }

    /// # Safety
    /// Nothing in flight may reference the views.
    pub(crate) unsafe fn destroy_views(&mut self, device: &ash::Device) {
        for view in self.views.drain(..).rev() {
            device.destroy_image_view(view, None);
        }
    }

    /// # Safety
    /// Nothing in flight may reference the swapchain or its views.
    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        self.destroy_views(device);
        if self.swapchain.as_raw() != 0 {
            self.loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}

/// One view per image. Views created before a failure are destroyed.
pub(crate) unsafe fn create_image_views(
    device: &ash::Device,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>, RenderError> {
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        let info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            components: vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            },
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        match device.create_image_view(&info, None) {
            Ok(view) => views.push(view),
            Err(e) => {
                debug!(created = views.len(), "image view creation failed, rolling back");
                for view in views.drain(..).rev() {
                    device.destroy_image_view(view, None);
                }
                return Err(RenderError::ImageViewCreation(e.to_string()));
            }
        }
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn extent_clamps_when_surface_is_free_size() {
        let c = caps((u32::MAX, u32::MAX), (1, 1), (1920, 1080));
        let e = extent_from_caps(&c, RenderSize::new(5000, 200));
        assert_eq!((e.width, e.height), (1920, 200));
        let e = extent_from_caps(&c, RenderSize::new(0, 0));
        assert_eq!((e.width, e.height), (1, 1));
    }

    #[test]
    fn resize_follows_the_window_on_free_size_surfaces() {
        let c = caps((u32::MAX, u32::MAX), (1, 1), (4096, 4096));
        let before = extent_from_caps(&c, RenderSize::new(800, 600));
        assert_eq!((before.width, before.height), (800, 600));
        let after = extent_from_caps(&c, RenderSize::new(1024, 768));
        assert_eq!((after.width, after.height), (1024, 768));
    }

    #[test]
    fn extent_follows_the_surface_when_fixed() {
        let c = caps((800, 600), (1, 1), (4096, 4096));
        let e = extent_from_caps(&c, RenderSize::new(1280, 720));
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn prefers_srgb_bgra() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let picked =
            |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(
            picked(&[unorm, PREFERRED_FORMAT]),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(picked(&[unorm]), Some(vk::Format::R8G8B8A8_UNORM));
        assert_eq!(picked(&[]), None);
    }

    #[test]
    fn present_mode_preferences() {
        use vk::PresentModeKHR as P;
        assert_eq!(choose_present_mode(&[P::FIFO, P::MAILBOX], true), P::MAILBOX);
        assert_eq!(choose_present_mode(&[P::FIFO, P::IMMEDIATE], true), P::FIFO);
        assert_eq!(
            choose_present_mode(&[P::FIFO, P::IMMEDIATE, P::MAILBOX], false),
            P::MAILBOX
        );
        assert_eq!(choose_present_mode(&[P::FIFO, P::IMMEDIATE], false), P::IMMEDIATE);
        assert_eq!(choose_present_mode(&[P::MAILBOX], false), P::MAILBOX);
        assert_eq!(choose_present_mode(&[P::FIFO], false), P::FIFO);
        assert_eq!(choose_present_mode(&[], false), P::FIFO);
    }

    #[test]
    fn image_count_respects_max() {
        let mut c = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(image_count(&c), 2);
        c.max_image_count = 8;
        assert_eq!(image_count(&c), 3);
    }

    #[test]
    fn sharing_mode_follows_families() {
        let shared = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        assert_eq!(sharing_mode(shared), (vk::SharingMode::EXCLUSIVE, vec![]));
        let split = QueueFamilies {
            graphics: 0,
            present: 2,
        };
        assert_eq!(
            sharing_mode(split),
            (vk::SharingMode::CONCURRENT, vec![0, 2])
        );
    }
}
