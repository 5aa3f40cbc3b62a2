//! `flipper-video` holds the host-GPU side of the emulated graphics pipeline.
//!
//! Currently this crate provides:
//! - A shader and pipeline cache keyed by program identity, with synchronous and background
//!   compilation and on-disk persistence (see [`shader_cache::ShaderCache`]).
//! - Emulation of the CPU-addressable embedded framebuffer on top of scaled, multisampled host
//!   surfaces (see [`efb::FramebufferManager`]).
//! - A residency heuristic for texture memory (see [`tmem::Tmem`]).
//!
//! Graphics APIs plug in through [`backend::ShaderBackend`] and [`efb::EfbDevice`]; headless
//! implementations of both ship with the crate.

mod error;

pub mod async_compiler;
pub mod backend;
pub mod caps;
pub mod config;
pub mod driver_bugs;
pub mod efb;
pub mod shader_cache;
pub mod snapshot;
pub mod stats;
pub mod tmem;
pub mod uid;

pub use caps::{ApiType, Capabilities, HostConfig};
pub use config::{ShaderCompilationMode, VideoConfig};
pub use error::{CompileError, DeviceError, InitError, SnapshotError, SnapshotResult};
pub use shader_cache::{PipelineStatus, ShaderCache};
pub use stats::{ShaderCacheStats, ShaderCacheStatsSnapshot};
