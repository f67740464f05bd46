// Backend error taxonomy
//
// Fatal setup/recording failures stop the process, submission failures drop a
// frame, a stale swapchain is a rebuild request and never reaches the user.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Environment or driver rejected a setup/recording step. No recovery.
    #[error("fatal error in {op}: {reason}")]
    Fatal { op: &'static str, reason: String },

    /// Queue submission failed. The frame is dropped, the loop keeps going.
    #[error("queue submission failed: {reason}")]
    Submission { reason: String },

    /// Acquire or present reported the surface changed.
    #[error("swapchain is out of date")]
    SwapchainStale,

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scene error: {reason}")]
    Scene { reason: String },
}

impl RenderError {
    pub fn fatal(op: &'static str, reason: impl ToString) -> Self {
        Self::Fatal {
            op,
            reason: reason.to_string(),
        }
    }

    pub fn scene(reason: impl ToString) -> Self {
        Self::Scene {
            reason: reason.to_string(),
        }
    }

    /// Everything except a dropped submission and a stale swapchain ends the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Submission { .. } | Self::SwapchainStale)
    }
}

/// Attach an operation name to a raw `VkResult`, turning it into a fatal error.
pub trait VkResultExt<T> {
    fn fatal(self, op: &'static str) -> RenderResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn fatal(self, op: &'static str) -> RenderResult<T> {
        self.map_err(|e| RenderError::fatal(op, format!("{e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_and_submission_are_recoverable() {
        assert!(!RenderError::SwapchainStale.is_fatal());
        assert!(!RenderError::Submission {
            reason: "ERROR_DEVICE_LOST".into()
        }
        .is_fatal());
        assert!(RenderError::fatal("create_swapchain", vk::Result::ERROR_INITIALIZATION_FAILED).is_fatal());
    }

    #[test]
    fn fatal_message_names_operation_and_reason() {
        let err: RenderResult<()> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).fatal("create_device");
        let text = err.unwrap_err().to_string();
        assert!(text.contains("create_device"));
        assert!(text.contains("ERROR_OUT_OF_DEVICE_MEMORY"));
    }
}
