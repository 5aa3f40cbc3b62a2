use thiserror::Error;

use crate::backend::ShaderStage;

/// A compile or program-creation failure reported by the shader backend.
///
/// These are absorbed by the cache: the entry stays uncompiled and the next fetch retries.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("{stage:?} stage rejected by the backend: {message}")]
    Rejected { stage: ShaderStage, message: String },
    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),
    #[error("stored binary is not usable by this backend")]
    InvalidBinary,
    #[error("a {0:?} stage this pipeline depends on is not available")]
    MissingStage(ShaderStage),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("out of device memory allocating {width}x{height}x{layers} surface")]
    OutOfMemory {
        width: u32,
        height: u32,
        layers: u32,
    },
    #[error("unsupported surface configuration: {0}")]
    Unsupported(String),
}

/// Raised by framebuffer initialization. Fatal for the video session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("failed to create EFB {surface} surface")]
    Surface {
        surface: &'static str,
        #[source]
        source: DeviceError,
    },
    #[error("failed to create EFB readback staging buffer")]
    Staging(#[source] DeviceError),
    #[error("failed to prepare EFB utility passes")]
    UtilityPasses(#[source] DeviceError),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,
    #[error("snapshot is for device {found:?}, expected {expected:?}")]
    InvalidDeviceId { found: [u8; 4], expected: [u8; 4] },
    #[error("unsupported snapshot major version {found} (expected {expected})")]
    UnsupportedDeviceMajorVersion { found: u16, expected: u16 },
    #[error("duplicate snapshot field tag {0}")]
    DuplicateFieldTag(u16),
    #[error("invalid encoding for snapshot field {0}")]
    InvalidFieldEncoding(&'static str),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;
