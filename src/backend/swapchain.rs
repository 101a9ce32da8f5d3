// Swapchain - Window presentation
//
// Owns the chain of images we render to and present, plus everything derived
// from them: one view and one framebuffer per image, and a shared depth
// attachment. All of it is torn down and rebuilt together when the surface
// changes size or the presentation engine reports the chain as stale.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::error::RenderError;
use crate::window::{ResizeSignal, WindowSurface};

/// Surface capabilities, formats and present modes for our device + surface
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Parameters for one swapchain creation call
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    pub min_image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// GPU calls the chain makes. Implemented over ash by `VulkanBackend`.
pub trait ChainBackend {
    /// Auxiliary depth image with its memory and view
    type Depth;

    fn surface_support(&self) -> Result<SurfaceSupport>;
    fn create_swapchain(&self, request: &SwapchainRequest) -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn create_depth(&self, format: vk::Format, extent: vk::Extent2D) -> Result<Self::Depth>;
    fn depth_view(depth: &Self::Depth) -> vk::ImageView;
    fn create_framebuffer(
        &self,
        color: vk::ImageView,
        depth: Option<vk::ImageView>,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn destroy_depth(&self, depth: Self::Depth);
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Block until no submitted work is pending on any queue
    fn wait_idle(&self) -> Result<()>;
}

/// Caller preferences; each falls back to a safe default when not offered
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainConfig {
    pub preferred_format: Option<vk::SurfaceFormatKHR>,
    pub preferred_present_mode: Option<vk::PresentModeKHR>,
    pub depth_format: Option<vk::Format>,
}

#[inline]
fn same_format(a: vk::SurfaceFormatKHR, b: vk::SurfaceFormatKHR) -> bool {
    a.format == b.format && a.color_space == b.color_space
}

/// Caller's format if offered, else 8-bit sRGB, else whatever comes first
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: Option<vk::SurfaceFormatKHR>,
) -> vk::SurfaceFormatKHR {
    preferred
        .and_then(|p| formats.iter().copied().find(|&f| same_format(f, p)))
        .or_else(|| {
            formats.iter().copied().find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
        .unwrap_or_default()
}

/// Caller's mode if offered, else MAILBOX, else FIFO (always supported)
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    preferred
        .filter(|p| modes.contains(p))
        .or_else(|| modes.iter().copied().find(|&m| m == vk::PresentModeKHR::MAILBOX))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// `current_extent` unless the surface leaves it to us (u32::MAX)
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum (0 means no cap)
pub fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

/// Block until the window has a drawable area. `None` if it closes first.
pub fn wait_for_drawable<W: WindowSurface>(window: &mut W) -> Option<(u32, u32)> {
    loop {
        let (width, height) = window.drawable_size();
        if width > 0 && height > 0 {
            return Some((width, height));
        }
        if window.should_close() {
            return None;
        }
        log::trace!("Drawable area is {}x{}, waiting", width, height);
        window.wait_events();
    }
}

/// The live set of presentable images and everything derived from them.
///
/// Invariant while live: `images`, `image_views` and `framebuffers` have the
/// same length, which is whatever the presentation engine actually returned.
pub struct PresentationChain<B: ChainBackend> {
    backend: Arc<B>,
    config: ChainConfig,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth: Option<B::Depth>,
    framebuffers: Vec<vk::Framebuffer>,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

impl<B: ChainBackend> PresentationChain<B> {
    /// Build the chain, waiting first if the window currently has no area
    pub fn new<W: WindowSurface>(backend: Arc<B>, window: &mut W, config: ChainConfig) -> Result<Self> {
        let mut chain = Self {
            backend,
            config,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            depth: None,
            framebuffers: Vec::new(),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
        };

        if let Some((width, height)) = wait_for_drawable(window) {
            chain.build(width, height)?;
        }

        Ok(chain)
    }

    /// Tear down and rebuild for the window's current size.
    ///
    /// Waits out a zero-area window, then for the device to go idle, so no
    /// in-flight work can still reference the old images. `resize` is cleared
    /// once the size is known; resizes reported while waiting are covered by
    /// this rebuild.
    pub fn recreate<W: WindowSurface>(&mut self, window: &mut W, resize: &ResizeSignal) -> Result<()> {
        let Some((width, height)) = wait_for_drawable(window) else {
            log::info!("Window closed while minimized, skipping swapchain rebuild");
            return Ok(());
        };
        resize.clear();

        self.backend.wait_idle().context("Failed to wait for device idle")?;

        log::info!("Recreating swapchain for {}x{}", width, height);
        self.release();
        self.build(width, height)
    }

    /// Resources land in `self` as they are created, so a failure part-way
    /// leaves them for `release` to clean up.
    fn build(&mut self, width: u32, height: u32) -> Result<()> {
        let support = self.backend.surface_support()?;
        if !support.is_adequate() {
            anyhow::bail!("Inadequate swapchain support (no formats or present modes)");
        }

        let surface_format = choose_surface_format(&support.formats, self.config.preferred_format);
        let present_mode = choose_present_mode(&support.present_modes, self.config.preferred_present_mode);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = determine_image_count(&support.capabilities);

        if let Some(preferred) = self.config.preferred_format {
            if !same_format(preferred, surface_format) {
                log::warn!("Preferred surface format {:?} not offered, using {:?}", preferred, surface_format);
            }
        }

        let request = SwapchainRequest {
            min_image_count: image_count,
            surface_format,
            present_mode,
            extent,
            pre_transform: support.capabilities.current_transform,
        };

        self.swapchain = self.backend.create_swapchain(&request)?;
        self.surface_format = surface_format;
        self.present_mode = present_mode;
        self.extent = extent;

        // The engine may hand back more images than we asked for
        self.images = self.backend.swapchain_images(self.swapchain)?;
        if self.images.is_empty() {
            return Err(RenderError::EmptyChain.into());
        }

        for &image in &self.images {
            let view = self.backend.create_image_view(image, surface_format.format)?;
            self.image_views.push(view);
        }

        if let Some(depth_format) = self.config.depth_format {
            self.depth = Some(self.backend.create_depth(depth_format, extent)?);
        }

        let depth_view = self.depth.as_ref().map(B::depth_view);
        for &view in &self.image_views {
            let framebuffer = self.backend.create_framebuffer(view, depth_view, extent)?;
            self.framebuffers.push(framebuffer);
        }

        assert_eq!(self.images.len(), self.image_views.len(), "one view per swapchain image");
        assert_eq!(self.images.len(), self.framebuffers.len(), "one framebuffer per swapchain image");

        log::info!(
            "Created swapchain: {}x{}, {:?}/{:?}, {:?}, {} images (requested {})",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            self.images.len(),
            image_count
        );

        Ok(())
    }

    /// Destroy in reverse creation order: framebuffers, depth, views, swapchain
    fn release(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.backend.destroy_framebuffer(framebuffer);
        }
        if let Some(depth) = self.depth.take() {
            self.backend.destroy_depth(depth);
        }
        for view in self.image_views.drain(..) {
            self.backend.destroy_image_view(view);
        }
        // Images belong to the swapchain
        self.images.clear();
        if self.swapchain != vk::SwapchainKHR::null() {
            self.backend.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    /// False before the first build (window closed while minimized) or after a failed one
    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        self.swapchain != vk::SwapchainKHR::null() && !self.framebuffers.is_empty()
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[cfg(test)]
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    #[cfg(test)]
    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    /// Target binding for an acquired image. Out of range is a logic error.
    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        let index = image_index as usize;
        assert!(
            index < self.framebuffers.len(),
            "image index {} out of range for a chain of {} images",
            index,
            self.framebuffers.len()
        );
        self.framebuffers[index]
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
}

impl<B: ChainBackend> Drop for PresentationChain<B> {
    fn drop(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            log::info!(
                "Destroying swapchain ({}x{}, {} images)",
                self.extent.width,
                self.extent.height,
                self.images.len()
            );
        }
        self.release();
    }
}
