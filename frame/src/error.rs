//! Frame orchestration error types.

use std::fmt;

use crate::slots::SlotCategory;

/// Errors that can occur while driving frames on the GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Failed to initialize the device, queue, surface or a fence.
    InitializationFailed(String),
    /// Failed to create a GPU resource.
    ResourceCreationFailed(String),
    /// A shader failed to parse, validate or translate.
    ShaderCompilationFailed(String),
    /// A view-slot pool has no free slots left.
    SlotExhausted {
        /// The exhausted pool.
        category: SlotCategory,
        /// Fixed capacity of the pool.
        capacity: u32,
    },
    /// An operation was called in a state that does not allow it.
    ContractViolation(String),
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// Out of GPU memory.
    OutOfMemory,
    /// The GPU device was lost.
    DeviceLost,
    /// The surface is outdated and needs to be reconfigured.
    SurfaceOutdated,
    /// An internal error occurred.
    Internal(String),
}

impl FrameError {
    /// Build a contract violation and log it at error level.
    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("Contract violation: {msg}");
        Self::ContractViolation(msg)
    }

    /// Whether this error leaves the session usable with degraded output.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SlotExhausted { .. } | Self::SurfaceOutdated)
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::ShaderCompilationFailed(msg) => write!(f, "shader compilation failed: {msg}"),
            Self::SlotExhausted { category, capacity } => {
                write!(f, "{category} slot pool exhausted ({capacity} slots)")
            }
            Self::ContractViolation(msg) => write!(f, "contract violation: {msg}"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::SurfaceOutdated => write!(f, "surface outdated, needs reconfiguration"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = FrameError::InitializationFailed("no GPU found".to_string());
        assert_eq!(err.to_string(), "initialization failed: no GPU found");

        let err = FrameError::SlotExhausted {
            category: SlotCategory::ShaderResource,
            capacity: 8,
        };
        assert_eq!(err.to_string(), "shader-resource slot pool exhausted (8 slots)");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(
            FrameError::SlotExhausted {
                category: SlotCategory::RenderTarget,
                capacity: 1,
            }
            .is_recoverable()
        );
        assert!(!FrameError::ContractViolation("twice".into()).is_recoverable());
        assert!(!FrameError::DeviceLost.is_recoverable());
    }
}
