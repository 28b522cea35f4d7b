// SPDX-License-Identifier: CEPL-1.0
use thiserror::Error;
use tracing::error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("window handle unavailable: {0}")]
    WindowHandle(String),
    #[error("failed to create graphics instance: {0}")]
    InstanceCreation(String),
    #[error("failed to create window surface: {0}")]
    SurfaceCreation(String),
    #[error("no physical devices found")]
    NoDevice,
    #[error("all devices found were unsuitable")]
    UnsuitableDevice,
    #[error("failed to create logical device: {0}")]
    DeviceCreation(String),
    #[error("failed to create swapchain: {0}")]
    SwapchainCreation(String),
    #[error("failed to create image views: {0}")]
    ImageViewCreation(String),
    #[error("failed to load shader: {0}")]
    ShaderLoad(String),
    #[error("failed to create shader module: {0}")]
    ShaderModule(String),
    #[error("failed to create render pass: {0}")]
    RenderPassCreation(String),
    #[error("failed to create pipeline layout: {0}")]
    PipelineLayout(String),
    #[error("failed to create graphics pipeline: {0}")]
    PipelineCreation(String),
    #[error("failed to create framebuffer: {0}")]
    FramebufferCreation(String),
    #[error("failed to record command buffer: {0}")]
    CommandBuffer(String),
    #[error("failed to create sync objects: {0}")]
    SyncObjectCreation(String),
    #[error("failed to create geometry buffer: {0}")]
    BufferCreation(String),
    #[error("failed to acquire swapchain image: {0}")]
    Acquire(String),
    #[error("failed to submit draw command buffer: {0}")]
    Submit(String),
    #[error("failed to present swapchain image: {0}")]
    Present(String),
}

/// Holds the first error a render context hits. Later calls see the same error
/// until the context is dropped.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    error: Option<RenderError>,
}

impl ErrorLatch {
    pub fn get(&self) -> Option<&RenderError> {
        self.error.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.error.is_some()
    }

    /// `Err` with the latched error, if any.
    pub fn check(&self) -> Result<(), RenderError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn set(&mut self, e: RenderError) {
        if self.error.is_none() {
            error!("{e}");
            self.error = Some(e);
        }
    }

    /// Passes `result` through, latching its error on the way.
    pub fn latch<T>(&mut self, result: Result<T, RenderError>) -> Result<T, RenderError> {
        if let Err(e) = &result {
            self.set(e.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_keeps_first_error() {
        let mut latch = ErrorLatch::default();
        assert!(latch.check().is_ok());

        let r: Result<(), _> = latch.latch(Err(RenderError::NoDevice));
        assert_eq!(r, Err(RenderError::NoDevice));
        latch.set(RenderError::Present("lost".into()));

        assert!(latch.is_set());
        assert_eq!(latch.get(), Some(&RenderError::NoDevice));
        assert_eq!(latch.check(), Err(RenderError::NoDevice));
    }

    #[test]
    fn ok_results_pass_through() {
        let mut latch = ErrorLatch::default();
        assert_eq!(latch.latch(Ok::<_, RenderError>(7)), Ok(7));
        assert!(!latch.is_set());
    }

    #[test]
    fn messages_are_human_readable() {
        let e = RenderError::ShaderLoad("shaders/tri.vert.spv is empty".into());
        assert_eq!(
            e.to_string(),
            "failed to load shader: shaders/tri.vert.spv is empty"
        );
        assert_eq!(
            RenderError::UnsuitableDevice.to_string(),
            "all devices found were unsuitable"
        );
    }
}
