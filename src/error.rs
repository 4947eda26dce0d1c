//! Error types for the rendering layer.
//!
//! Library code returns [`GfxError`]. The demo binary and config loading use
//! `anyhow` on top of it.

use ash::vk;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = GfxError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum GfxError {
    /// The host platform cannot run the requested backend at all.
    #[error("Backend not supported on this platform: {0}")]
    Unsupported(String),

    /// Programmer error, e.g. creating a second control surface.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `draw` was called with no pipeline bound.
    #[error("No pipeline is bound")]
    NoPipelineBound,

    /// The object was created before the last device reset.
    #[error("Stale {kind}: created for device generation {created}, current generation is {current}")]
    StaleResource {
        kind: &'static str,
        created: u64,
        current: u64,
    },

    /// The handle does not refer to a live object.
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),

    #[error("Pipeline declares no uniform named `{0}`")]
    UnknownUniform(String),

    #[error("Texture interop is not available")]
    InteropUnavailable,

    /// Device resources are gone (a reset failed part way).
    #[error("Device resources are unavailable")]
    DeviceUnavailable,

    #[error("GPU device lost")]
    DeviceLost,

    /// The surface no longer matches its window and must be resized.
    #[error("Surface out of date")]
    SurfaceOutOfDate,

    #[error("Presentation error: {0}")]
    Presentation(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("GPU allocation failed: {0}")]
    Allocation(String),
}

impl GfxError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, GfxError::DeviceLost)
    }
}

impl From<vk::Result> for GfxError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GfxError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                GfxError::SurfaceOutOfDate
            }
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                GfxError::Allocation(format!("{:?}", result))
            }
            other => GfxError::Driver(format!("{:?}", other)),
        }
    }
}

impl From<gpu_allocator::AllocationError> for GfxError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        GfxError::Allocation(err.to_string())
    }
}
