// Fatal render errors
//
// Everything here ends the process. Stale-swapchain conditions never show up
// as one of these: the frame loop absorbs them by rebuilding the chain.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    /// No enumerated GPU met the requirements
    #[error("No suitable GPU found ({0} device(s) inspected)")]
    NoSuitableDevice(usize),

    /// A wait that is sized to never expire did expire
    #[error("Timed out waiting for {stage}; the GPU is likely lost")]
    Timeout { stage: &'static str },

    #[error("Waiting for {stage} failed: {result}")]
    Wait { stage: &'static str, result: vk::Result },

    #[error("Failed to acquire swapchain image: {0}")]
    Acquire(vk::Result),

    #[error("Queue submission failed: {0}")]
    Submit(vk::Result),

    #[error("Presentation failed: {0}")]
    Present(vk::Result),

    /// The presentation engine handed back a chain without images
    #[error("Swapchain returned no images")]
    EmptyChain,
}

impl RenderError {
    /// Map a failed blocking wait, splitting timeouts out of the rest
    pub fn from_wait(stage: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::Timeout { stage },
            result => Self::Wait { stage, result },
        }
    }
}
