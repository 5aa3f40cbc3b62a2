//! Headless backend: "compiles" by hashing source text.
//!
//! Used by tests and by hosts running without a GPU adapter. Binaries and pipeline cache data
//! round-trip, and counters expose whether an object came from the compiler or from disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use super::{PipelineConfig, PipelineUsage, ShaderBackend, ShaderGenerator, ShaderStage, StageUid};
use crate::caps::{ApiType, Capabilities, HostConfig};
use crate::error::CompileError;
use crate::uid::FixedCodec;

const SHADER_MAGIC: [u8; 4] = *b"NSHD";
const PIPELINE_MAGIC: [u8; 4] = *b"NPIP";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NullShader {
    pub stage: ShaderStage,
    pub digest: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NullPipeline {
    pub usage: PipelineUsage,
    pub digest: u64,
    /// Created from cache data rather than from scratch.
    pub from_cache: bool,
}

type RejectFn = Box<dyn Fn(ShaderStage, &str) -> bool + Send + Sync>;

#[derive(Default)]
pub struct NullShaderBackend {
    reject: Option<RejectFn>,
    compile_delay: Option<Duration>,
    shader_compiles: AtomicU64,
    shader_binary_loads: AtomicU64,
    pipelines_created: AtomicU64,
    pipelines_from_cache: AtomicU64,
}

impl NullShaderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities of a headless session that can export binaries and compile in the
    /// background.
    pub fn capabilities() -> Capabilities {
        Capabilities {
            supports_shader_binaries: true,
            supports_pipeline_cache_data: true,
            supports_background_compiling: true,
            supports_geometry_shaders: true,
            supports_dual_source_blend: true,
            supports_logic_op: true,
            supports_early_z: true,
            supports_primitive_restart: true,
            supports_depth_readback: true,
            supports_partial_depth_copies: true,
            max_samples: 4,
            ..Capabilities::minimal(ApiType::Null)
        }
    }

    /// Fails every compile for which `reject` returns true.
    pub fn rejecting(mut self, reject: impl Fn(ShaderStage, &str) -> bool + Send + Sync + 'static) -> Self {
        self.reject = Some(Box::new(reject));
        self
    }

    /// Makes each source compile take at least `delay`.
    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = Some(delay);
        self
    }

    pub fn shader_compiles(&self) -> u64 {
        self.shader_compiles.load(Ordering::Relaxed)
    }

    pub fn shader_binary_loads(&self) -> u64 {
        self.shader_binary_loads.load(Ordering::Relaxed)
    }

    pub fn pipelines_created(&self) -> u64 {
        self.pipelines_created.load(Ordering::Relaxed)
    }

    pub fn pipelines_from_cache(&self) -> u64 {
        self.pipelines_from_cache.load(Ordering::Relaxed)
    }

    fn pipeline_digest(config: &PipelineConfig<NullShader>) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(&[config.usage as u8]);
        hasher.update(&config.vertex_shader.digest.to_le_bytes());
        if let Some(gs) = &config.geometry_shader {
            hasher.update(&gs.digest.to_le_bytes());
        }
        hasher.update(&config.pixel_shader.digest.to_le_bytes());
        if let Some(layout) = &config.vertex_layout {
            hasher.update(&layout.to_bytes());
        }
        hasher.update(&config.rasterization.to_bytes());
        hasher.update(&config.depth.to_bytes());
        hasher.update(&config.blending.to_bytes());
        hasher.update(&config.framebuffer.samples.to_le_bytes());
        hasher.digest()
    }
}

impl ShaderBackend for NullShaderBackend {
    type Shader = NullShader;
    type Pipeline = NullPipeline;

    fn compile_shader(&self, stage: ShaderStage, source: &str) -> Result<NullShader, CompileError> {
        if let Some(delay) = self.compile_delay {
            std::thread::sleep(delay);
        }
        self.shader_compiles.fetch_add(1, Ordering::Relaxed);
        if self.reject.as_ref().is_some_and(|reject| reject(stage, source)) {
            return Err(CompileError::Rejected {
                stage,
                message: "rejected by test predicate".into(),
            });
        }
        Ok(NullShader {
            stage,
            digest: xxh3_64(source.as_bytes()),
        })
    }

    fn create_shader_from_binary(
        &self,
        stage: ShaderStage,
        binary: &[u8],
    ) -> Result<NullShader, CompileError> {
        let [m0, m1, m2, m3, tag, digest @ ..] = binary else {
            return Err(CompileError::InvalidBinary);
        };
        let digest: [u8; 8] = digest.try_into().map_err(|_| CompileError::InvalidBinary)?;
        if [*m0, *m1, *m2, *m3] != SHADER_MAGIC || *tag != stage.tag() {
            return Err(CompileError::InvalidBinary);
        }
        self.shader_binary_loads.fetch_add(1, Ordering::Relaxed);
        Ok(NullShader {
            stage,
            digest: u64::from_le_bytes(digest),
        })
    }

    fn shader_binary(&self, shader: &NullShader) -> Option<Vec<u8>> {
        let mut out = SHADER_MAGIC.to_vec();
        out.push(shader.stage.tag());
        out.extend_from_slice(&shader.digest.to_le_bytes());
        Some(out)
    }

    fn create_pipeline(
        &self,
        config: &PipelineConfig<NullShader>,
        cache_data: Option<&[u8]>,
    ) -> Result<NullPipeline, CompileError> {
        let digest = Self::pipeline_digest(config);
        let from_cache = match cache_data {
            None => false,
            Some(data) => {
                let expected = [&PIPELINE_MAGIC[..], &digest.to_le_bytes()].concat();
                if data != expected.as_slice() {
                    return Err(CompileError::InvalidBinary);
                }
                true
            }
        };
        if from_cache {
            self.pipelines_from_cache.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pipelines_created.fetch_add(1, Ordering::Relaxed);
        }
        Ok(NullPipeline {
            usage: config.usage,
            digest,
            from_cache,
        })
    }

    fn pipeline_cache_data(&self, pipeline: &NullPipeline) -> Option<Vec<u8>> {
        Some([&PIPELINE_MAGIC[..], &pipeline.digest.to_le_bytes()].concat())
    }
}

/// Emits a textual dump of the identity. Deterministic, which is all the cache relies on.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullShaderGenerator;

impl ShaderGenerator for NullShaderGenerator {
    fn generate(&self, api: ApiType, host: &HostConfig, uid: &StageUid) -> String {
        format!("// {} host={:08x}\n// {uid:?}\n", api.tag(), host.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_binaries_round_trip_and_check_the_stage() {
        let backend = NullShaderBackend::new();
        let shader = backend.compile_shader(ShaderStage::Pixel, "void main() {}").unwrap();
        let binary = backend.shader_binary(&shader).unwrap();

        let loaded = backend
            .create_shader_from_binary(ShaderStage::Pixel, &binary)
            .unwrap();
        assert_eq!(loaded, shader);
        assert_eq!(backend.shader_binary_loads(), 1);
        assert_eq!(
            backend.create_shader_from_binary(ShaderStage::Vertex, &binary),
            Err(CompileError::InvalidBinary)
        );
        assert_eq!(
            backend.create_shader_from_binary(ShaderStage::Pixel, &binary[..5]),
            Err(CompileError::InvalidBinary)
        );
    }

    #[test]
    fn rejection_predicate_fails_matching_sources() {
        let backend = NullShaderBackend::new().rejecting(|stage, _| stage == ShaderStage::Geometry);
        assert!(backend.compile_shader(ShaderStage::Vertex, "a").is_ok());
        assert!(matches!(
            backend.compile_shader(ShaderStage::Geometry, "a"),
            Err(CompileError::Rejected { stage: ShaderStage::Geometry, .. })
        ));
        assert_eq!(backend.shader_compiles(), 2);
    }
}
