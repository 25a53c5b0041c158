//! Error types for the Nabla core.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for device, build, blit and material operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Usage-flag combination the device cannot honour
    #[error("Invalid usage flags {usage}: {reason}")]
    InvalidUsage { usage: String, reason: String },

    /// Resource lacks a usage flag the operation requires
    #[error("{resource} is missing required usage {required}")]
    MissingUsage { resource: String, required: String },

    /// Offset/size outside the bound resource or misaligned
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Handle does not refer to a live object
    #[error("Invalid {kind} handle {index}:{generation}")]
    InvalidHandle { kind: &'static str, index: u32, generation: u32 },

    /// Backing range smaller than the queried structure size
    #[error("Acceleration structure needs {required} bytes, range has {actual}")]
    StructureTooSmall { required: u64, actual: u64 },

    /// Scratch range smaller than the queried build scratch size
    #[error("Build scratch needs {required} bytes, range has {actual}")]
    ScratchTooSmall { required: u64, actual: u64 },

    /// Top-level build references a structure that is not built yet
    #[error("Build of {structure} references unbuilt bottom-level structure {dependency}")]
    UnbuiltDependency { structure: String, dependency: String },

    /// Command uses data written earlier without an intervening barrier
    #[error("Missing barrier before command {command} in '{label}': {detail}")]
    MissingBarrier { command: usize, label: String, detail: String },

    /// Tap window does not fit the workgroup shared-memory budget
    #[error("Window of {texels} texels needs {required} bytes of shared memory, budget is {budget}")]
    SharedMemoryBudget { texels: u32, required: u32, budget: u32 },

    /// Workgroup dimension exceeds a device limit
    #[error("Workgroup {what} {requested} exceeds device limit {limit}")]
    WorkgroupLimit { what: String, requested: u32, limit: u32 },

    /// Filter state is inconsistent
    #[error("Invalid filter state: {0}")]
    InvalidFilter(String),

    /// Shader text failed to preprocess or compile
    #[error("Shader '{name}': {reason}")]
    Shader { name: String, reason: String },

    /// Feature not provided by this device or not modelled
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Fence did not signal within the timeout
    #[error("Fence wait timed out after {timeout_ms} ms")]
    FenceTimeout { timeout_ms: u64 },

    /// Repeated fence timeouts, the device is treated as hung
    #[error("Device hang: fence not signalled after {attempts} waits of {timeout_ms} ms")]
    DeviceHang { attempts: u32, timeout_ms: u64 },

    /// Asset path does not exist
    #[error("Asset not found: {0}")]
    AssetNotFound(PathBuf),

    /// Loader succeeded but produced nothing usable
    #[error("Asset load produced no content: {0}")]
    EmptyAsset(PathBuf),

    /// BSDF element kind the IR compiler cannot translate
    #[error("Unsupported BSDF '{kind}' in element '{element}'")]
    UnsupportedBsdf { element: String, kind: String },

    /// BSDF element with wrong child count or out-of-graph reference
    #[error("Malformed BSDF element '{element}': {reason}")]
    MalformedBsdf { element: String, reason: String },

    /// Backend device error
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Image decode/encode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid range error.
    pub fn range(msg: impl Into<String>) -> Self {
        Self::InvalidRange(msg.into())
    }

    /// Create an invalid filter error.
    pub fn filter(msg: impl Into<String>) -> Self {
        Self::InvalidFilter(msg.into())
    }

    /// Whether the error is a GPU timeout (fence timeout or hang).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::FenceTimeout { .. } | Self::DeviceHang { .. })
    }
}

impl From<shader_defines::PreprocessError> for Error {
    fn from(e: shader_defines::PreprocessError) -> Self {
        Self::Shader { name: "<preprocess>".into(), reason: e.to_string() }
    }
}

/// Result type alias for Nabla operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::SharedMemoryBudget { texels: 2048, required: 32768, budget: 16384 };
        assert!(e.to_string().contains("32768"));
        assert!(e.to_string().contains("16384"));

        let e = Error::UnsupportedBsdf { element: "mat0".into(), kind: "phong".into() };
        assert!(e.to_string().contains("mat0"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_timeout_classification() {
        assert!(Error::FenceTimeout { timeout_ms: 1 }.is_timeout());
        assert!(Error::DeviceHang { attempts: 3, timeout_ms: 1 }.is_timeout());
        assert!(!Error::other("x").is_timeout());
    }
}
