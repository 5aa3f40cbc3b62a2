//! User-facing video settings.
//!
//! Loaded by the host (typically from JSON) and then adjusted with `FLIPPER_*` environment
//! overrides, which CI uses to force conservative paths.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::caps::Capabilities;
use crate::driver_bugs::DriverBugs;

pub const SHADER_CACHE_ENV: &str = "FLIPPER_SHADER_CACHE";
pub const COMPILER_THREADS_ENV: &str = "FLIPPER_SHADER_COMPILER_THREADS";
pub const PRECOMPILER_THREADS_ENV: &str = "FLIPPER_SHADER_PRECOMPILER_THREADS";
pub const WAIT_FOR_SHADERS_ENV: &str = "FLIPPER_WAIT_FOR_SHADERS";
pub const EFB_TILE_SIZE_ENV: &str = "FLIPPER_EFB_ACCESS_TILE_SIZE";

fn env_var_truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShaderCompilationMode {
    /// Compile exact-state programs on demand and stall the draw until they are ready.
    #[default]
    Synchronous,
    /// Draw everything with über programs.
    SynchronousUberShaders,
    /// Draw with über programs until the exact-state program finishes in the background.
    AsynchronousUberShaders,
    /// Skip draws whose exact-state program is still compiling.
    AsynchronousSkipRendering,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub shader_cache: bool,
    pub cache_dir: PathBuf,
    /// Game-specific cache files are only written when this is set.
    pub game_id: Option<String>,
    pub shader_compilation_mode: ShaderCompilationMode,
    /// Negative means pick automatically.
    pub shader_compiler_threads: i32,
    pub shader_precompiler_threads: i32,
    pub wait_for_shaders_before_starting: bool,

    pub efb_scale: u32,
    pub msaa_samples: u32,
    pub ssaa: bool,
    pub stereo: bool,
    pub wireframe: bool,
    pub per_pixel_lighting: bool,
    pub bounding_box: bool,
    pub prefer_vs_for_line_point_expansion: bool,

    /// Edge length of a peek-cache tile in native pixels; 0 caches the whole EFB as one tile.
    pub efb_access_tile_size: u32,
    /// Keeps peek-cache tiles readable until the end of the frame instead of dropping them on
    /// every draw or clear. Peeks may then return contents from before a clear or draw in the
    /// same frame.
    pub efb_access_defer_invalidation: bool,
    pub emulate_efb_format_changes: bool,
    pub save_efb_to_state: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            shader_cache: true,
            cache_dir: PathBuf::from("cache"),
            game_id: None,
            shader_compilation_mode: ShaderCompilationMode::Synchronous,
            shader_compiler_threads: 1,
            shader_precompiler_threads: -1,
            wait_for_shaders_before_starting: false,
            efb_scale: 1,
            msaa_samples: 1,
            ssaa: false,
            stereo: false,
            wireframe: false,
            per_pixel_lighting: false,
            bounding_box: true,
            prefer_vs_for_line_point_expansion: false,
            efb_access_tile_size: 64,
            efb_access_defer_invalidation: false,
            emulate_efb_format_changes: false,
            save_efb_to_state: true,
        }
    }
}

impl VideoConfig {
    /// Applies `FLIPPER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(SHADER_CACHE_ENV) {
            self.shader_cache = env_var_truthy(&raw);
        }
        if let Some(raw) = lookup(WAIT_FOR_SHADERS_ENV) {
            self.wait_for_shaders_before_starting = env_var_truthy(&raw);
        }
        for (name, slot) in [
            (COMPILER_THREADS_ENV, &mut self.shader_compiler_threads),
            (PRECOMPILER_THREADS_ENV, &mut self.shader_precompiler_threads),
        ] {
            if let Some(raw) = lookup(name) {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => tracing::warn!(name, value = %raw, "ignoring non-numeric override"),
                }
            }
        }
        if let Some(raw) = lookup(EFB_TILE_SIZE_ENV) {
            match raw.trim().parse() {
                Ok(value) => self.efb_access_tile_size = value,
                Err(_) => tracing::warn!(name = EFB_TILE_SIZE_ENV, value = %raw, "ignoring non-numeric override"),
            }
        }
    }

    pub fn uses_uber_shaders(&self) -> bool {
        matches!(
            self.shader_compilation_mode,
            ShaderCompilationMode::SynchronousUberShaders
                | ShaderCompilationMode::AsynchronousUberShaders
        )
    }

    /// Bulk über compilation at startup. Without background compiling it runs on the calling
    /// thread, which is only acceptable when startup is already blocking on shaders.
    pub fn can_precompile_uber_shaders(&self, caps: &Capabilities) -> bool {
        self.uses_uber_shaders()
            && (caps.supports_background_compiling || self.wait_for_shaders_before_starting)
    }

    pub fn shader_compiler_thread_count(&self, caps: &Capabilities, bugs: DriverBugs) -> usize {
        if !caps.supports_background_compiling {
            return 0;
        }
        // Asynchronous modes need at least one worker to make progress off the draw thread.
        let minimum = match self.shader_compilation_mode {
            ShaderCompilationMode::AsynchronousUberShaders
            | ShaderCompilationMode::AsynchronousSkipRendering => 1,
            _ => 0,
        };
        resolve_thread_count(self.shader_compiler_threads, bugs).max(minimum)
    }

    pub fn shader_precompiler_thread_count(&self, caps: &Capabilities, bugs: DriverBugs) -> usize {
        if !caps.supports_background_compiling {
            return 0;
        }
        let count = resolve_thread_count(self.shader_precompiler_threads, bugs);
        if bugs.contains(DriverBugs::BROKEN_MULTITHREADED_SHADER_PRECOMPILATION) {
            count.min(1)
        } else {
            count
        }
    }
}

fn resolve_thread_count(configured: i32, bugs: DriverBugs) -> usize {
    if configured >= 0 {
        return configured as usize;
    }
    if bugs.contains(DriverBugs::BROKEN_MULTITHREADED_SHADER_PRECOMPILATION) {
        return 1;
    }
    // Leave one core for the emulated CPU and one for the GPU thread.
    let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    cores.saturating_sub(2).clamp(1, 8)
}
