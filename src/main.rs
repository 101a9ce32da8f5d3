// =============================================================================
// FRAME PACER - Vulkan presentation and frame pacing
// =============================================================================
//
// Picks a GPU, keeps a swapchain alive across resizes and minimizes, and
// renders with a fixed number of frames in flight.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  WinitSurface (window, events, resize signal)                   │
// │    └── VulkanDevice (instance, surface, GPU choice, queues)     │
// │          └── PresentationChain (images, views, depth, fbs)     │
// │                └── FrameSlots (semaphores, fences, cmd bufs)   │
// │                      └── FrameLoop (wait/acquire/record/present)│
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

mod backend;
mod config;
mod error;
mod frame_loop;
mod recorder;
mod window;

use anyhow::{Context, Result};
use ash::vk;
use backend::selector::DeviceRequirements;
use backend::{ChainConfig, VulkanBackend, VulkanDevice};
use config::Config;
use frame_loop::FrameLoop;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use recorder::ClearRecorder;
use std::sync::Arc;
use window::{ResizeSignal, WinitSurface};

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml; failures are reported once logging is up
    let (config, config_error) = Config::load();

    init_logging(&config);
    if let Some(e) = config_error {
        log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
    }
    log::info!("Starting frame pacer");
    log::info!(
        "Window: {}x{}, present mode: {}, {} frames in flight",
        config.window.width,
        config.window.height,
        config.graphics.present_mode,
        config.frames_in_flight()
    );

    let result = build_frame_loop(&config).and_then(|mut frame_loop| frame_loop.run());
    if let Err(ref e) = result {
        log::error!("Fatal: {:?}", e);
    }

    log::info!("Shutdown complete");
    result
}

/// `RUST_LOG` wins over the configured level
fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// INITIALIZATION
// =============================================================================

/// Everything is handed to the frame loop, which then owns the only
/// references; dropping it tears the GPU side down before the window.
fn build_frame_loop(config: &Config) -> Result<FrameLoop<VulkanBackend, WinitSurface, ClearRecorder>> {
    // ─────────────────────────────────────────────────────────────────────
    // STEP 1: Window
    // ─────────────────────────────────────────────────────────────────────
    let resize = ResizeSignal::new();
    let window = WinitSurface::new(&config.window, resize.clone())?;
    let (display_handle, window_handle) = {
        let handle = window.window().context("Window was not created")?;
        (handle.raw_display_handle(), handle.raw_window_handle())
    };

    // ─────────────────────────────────────────────────────────────────────
    // STEP 2: Device, surface and GPU selection
    // ─────────────────────────────────────────────────────────────────────
    let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
    let requirements = DeviceRequirements {
        sampler_anisotropy: config.graphics.require_anisotropy,
        ..Default::default()
    };
    let device = VulkanDevice::new(
        &config.window.title,
        enable_validation,
        display_handle,
        window_handle,
        &requirements,
    )?;

    // ─────────────────────────────────────────────────────────────────────
    // STEP 3: Render pass, command pool and the demo recorder
    // ─────────────────────────────────────────────────────────────────────
    let depth_format = config.graphics.depth_buffer.then_some(DEPTH_FORMAT);
    let backend = Arc::new(VulkanBackend::new(device.clone(), depth_format)?);

    let recorder = ClearRecorder::new(
        device,
        backend.render_pass(),
        config.graphics.clear_color,
        depth_format.is_some(),
        config.frames_in_flight(),
    )?;

    // ─────────────────────────────────────────────────────────────────────
    // STEP 4: Swapchain and frame slots
    // ─────────────────────────────────────────────────────────────────────
    let chain_config = ChainConfig {
        preferred_format: Some(backend.surface_format()),
        preferred_present_mode: Some(config.present_mode()),
        depth_format,
    };

    FrameLoop::new(
        backend,
        window,
        recorder,
        chain_config,
        config.frames_in_flight(),
        resize,
    )
}
