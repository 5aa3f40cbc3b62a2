//! Contracts for the collaborators the shader cache drives.
//!
//! The cache never generates shader source or touches a graphics API itself. It asks a
//! [`ShaderGenerator`] for source text and a [`ShaderBackend`] for compiled objects, and both
//! are shared with the background compile workers.

mod null;

use std::sync::Arc;

pub use null::{NullPipeline, NullShader, NullShaderBackend, NullShaderGenerator};

use crate::caps::{ApiType, HostConfig};
use crate::error::CompileError;
use crate::uid::{
    BlendingState, DepthState, GeometryShaderUid, PixelShaderUid, RasterizationState,
    UberPixelShaderUid, UberVertexShaderUid, VertexLayout, VertexShaderUid,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Geometry,
    Pixel,
}

impl ShaderStage {
    pub fn tag(self) -> u8 {
        match self {
            Self::Vertex => 0,
            Self::Geometry => 1,
            Self::Pixel => 2,
        }
    }
}

/// Any stage-level identity the generator knows how to turn into source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageUid {
    Vertex(VertexShaderUid),
    Pixel(PixelShaderUid),
    Geometry(GeometryShaderUid),
    UberVertex(UberVertexShaderUid),
    UberPixel(UberPixelShaderUid),
}

impl StageUid {
    pub fn stage(&self) -> ShaderStage {
        match self {
            Self::Vertex(_) | Self::UberVertex(_) => ShaderStage::Vertex,
            Self::Pixel(_) | Self::UberPixel(_) => ShaderStage::Pixel,
            Self::Geometry(_) => ShaderStage::Geometry,
        }
    }
}

/// Deterministic, side-effect-free source generation.
pub trait ShaderGenerator: Send + Sync {
    fn generate(&self, api: ApiType, host: &HostConfig, uid: &StageUid) -> String;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineUsage {
    /// Exact-state program.
    Specialized,
    /// Über program that branches on uniforms.
    Uber,
    /// Internal passes (clears, resolves, conversions).
    Utility,
}

/// Render-target shape pipelines are created against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferState {
    pub color_format: wgpu::TextureFormat,
    pub depth_format: wgpu::TextureFormat,
    pub samples: u32,
    pub per_sample_shading: bool,
}

impl Default for FramebufferState {
    fn default() -> Self {
        Self {
            color_format: wgpu::TextureFormat::Rgba8Unorm,
            depth_format: wgpu::TextureFormat::Depth32Float,
            samples: 1,
            per_sample_shading: false,
        }
    }
}

/// Everything a backend needs to create one pipeline object.
pub struct PipelineConfig<S> {
    pub usage: PipelineUsage,
    pub vertex_layout: Option<VertexLayout>,
    pub vertex_shader: Arc<S>,
    pub geometry_shader: Option<Arc<S>>,
    pub pixel_shader: Arc<S>,
    pub rasterization: RasterizationState,
    pub depth: DepthState,
    pub blending: BlendingState,
    pub framebuffer: FramebufferState,
}

impl<S> Clone for PipelineConfig<S> {
    fn clone(&self) -> Self {
        Self {
            usage: self.usage,
            vertex_layout: self.vertex_layout,
            vertex_shader: Arc::clone(&self.vertex_shader),
            geometry_shader: self.geometry_shader.clone(),
            pixel_shader: Arc::clone(&self.pixel_shader),
            rasterization: self.rasterization,
            depth: self.depth,
            blending: self.blending,
            framebuffer: self.framebuffer,
        }
    }
}

/// The graphics-API side of compilation.
///
/// Methods are called from worker threads as well as the GPU thread, so implementations must
/// not depend on thread-local API state for compilation.
pub trait ShaderBackend: Send + Sync + 'static {
    type Shader: Send + Sync + 'static;
    type Pipeline: Send + Sync + 'static;

    fn compile_shader(&self, stage: ShaderStage, source: &str) -> Result<Self::Shader, CompileError>;

    /// Recreates a shader from bytes previously returned by [`Self::shader_binary`].
    fn create_shader_from_binary(
        &self,
        stage: ShaderStage,
        binary: &[u8],
    ) -> Result<Self::Shader, CompileError>;

    /// `None` (or empty) when the backend cannot export binaries.
    fn shader_binary(&self, shader: &Self::Shader) -> Option<Vec<u8>>;

    /// `cache_data` is a blob previously returned by [`Self::pipeline_cache_data`] for an
    /// identical configuration.
    fn create_pipeline(
        &self,
        config: &PipelineConfig<Self::Shader>,
        cache_data: Option<&[u8]>,
    ) -> Result<Self::Pipeline, CompileError>;

    fn pipeline_cache_data(&self, pipeline: &Self::Pipeline) -> Option<Vec<u8>>;
}
