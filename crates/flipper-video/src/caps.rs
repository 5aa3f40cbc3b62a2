//! What the active graphics backend can do.
//!
//! [`Capabilities`] is captured once per backend session and only replaced on a full backend
//! reload. [`HostConfig`] folds the capability bits and user settings that change generated
//! shader source into one packed value used in cache file names and as a reload trigger.

use serde::{Deserialize, Serialize};

use crate::config::VideoConfig;
use crate::driver_bugs::{DriverBugs, DriverIdentity};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiType {
    Null,
    OpenGl,
    Vulkan,
    D3D,
    Metal,
    WebGpu,
}

impl ApiType {
    /// Short tag used in cache file names.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::OpenGl => "ogl",
            Self::Vulkan => "vk",
            Self::D3D => "d3d",
            Self::Metal => "mtl",
            Self::WebGpu => "wgpu",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub api: ApiType,
    pub driver: DriverIdentity,

    pub supports_dual_source_blend: bool,
    pub supports_logic_op: bool,
    pub supports_framebuffer_fetch: bool,
    pub supports_geometry_shaders: bool,
    pub supports_vs_line_point_expand: bool,
    pub supports_early_z: bool,
    pub supports_bbox: bool,

    pub supports_shader_binaries: bool,
    pub supports_pipeline_cache_data: bool,
    pub supports_background_compiling: bool,

    pub supports_partial_multisample_resolve: bool,
    pub supports_depth_readback: bool,
    pub supports_partial_depth_copies: bool,
    pub supports_large_points: bool,
    pub supports_primitive_restart: bool,
    pub supports_dynamic_vertex_loader: bool,
    pub supports_reversed_depth_range: bool,
    pub uses_lower_left_origin: bool,

    pub max_texture_size: u32,
    pub max_samples: u32,
}

impl Capabilities {
    /// The most conservative descriptor: every optional path disabled.
    pub fn minimal(api: ApiType) -> Self {
        Self {
            api,
            driver: DriverIdentity::unknown(api),
            supports_dual_source_blend: false,
            supports_logic_op: false,
            supports_framebuffer_fetch: false,
            supports_geometry_shaders: false,
            supports_vs_line_point_expand: false,
            supports_early_z: false,
            supports_bbox: false,
            supports_shader_binaries: false,
            supports_pipeline_cache_data: false,
            supports_background_compiling: false,
            supports_partial_multisample_resolve: false,
            supports_depth_readback: false,
            supports_partial_depth_copies: false,
            supports_large_points: false,
            supports_primitive_restart: false,
            supports_dynamic_vertex_loader: false,
            supports_reversed_depth_range: false,
            uses_lower_left_origin: false,
            max_texture_size: 2048,
            max_samples: 1,
        }
    }

    /// Maps what a `wgpu` adapter reports onto the descriptor.
    ///
    /// WebGPU has no logic ops, framebuffer fetch, geometry stage or pipeline binaries, so
    /// those stay off regardless of the underlying native API.
    pub fn from_wgpu(
        backend: wgpu::Backend,
        features: wgpu::Features,
        limits: &wgpu::Limits,
    ) -> Self {
        let api = match backend {
            wgpu::Backend::Vulkan => ApiType::Vulkan,
            wgpu::Backend::Metal => ApiType::Metal,
            wgpu::Backend::Dx12 => ApiType::D3D,
            wgpu::Backend::Gl => ApiType::OpenGl,
            wgpu::Backend::BrowserWebGpu => ApiType::WebGpu,
            _ => ApiType::Null,
        };

        Self {
            supports_dual_source_blend: features.contains(wgpu::Features::DUAL_SOURCE_BLENDING),
            supports_vs_line_point_expand: true,
            supports_early_z: true,
            supports_background_compiling: backend != wgpu::Backend::Gl,
            supports_depth_readback: true,
            supports_primitive_restart: true,
            supports_partial_multisample_resolve: false,
            // Depth copies out of a texture must cover the whole subresource.
            supports_partial_depth_copies: false,
            uses_lower_left_origin: false,
            max_texture_size: limits.max_texture_dimension_2d,
            // Four samples is the only count every WebGPU implementation must offer.
            max_samples: 4,
            ..Self::minimal(api)
        }
    }

    /// blake3 over every field; disk logs written under a different fingerprint are discarded.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.api.tag().as_bytes());
        hasher.update(&[self.driver.vendor as u8, self.driver.driver as u8]);
        hasher.update(&self.driver.version.to_le_bytes());
        for flag in [
            self.supports_dual_source_blend,
            self.supports_logic_op,
            self.supports_framebuffer_fetch,
            self.supports_geometry_shaders,
            self.supports_vs_line_point_expand,
            self.supports_early_z,
            self.supports_bbox,
            self.supports_shader_binaries,
            self.supports_pipeline_cache_data,
            self.supports_background_compiling,
            self.supports_partial_multisample_resolve,
            self.supports_depth_readback,
            self.supports_partial_depth_copies,
            self.supports_large_points,
            self.supports_primitive_restart,
            self.supports_dynamic_vertex_loader,
            self.supports_reversed_depth_range,
            self.uses_lower_left_origin,
        ] {
            hasher.update(&[flag as u8]);
        }
        hasher.update(&self.max_texture_size.to_le_bytes());
        hasher.update(&self.max_samples.to_le_bytes());
        *hasher.finalize().as_bytes()
    }

    pub fn driver_bugs(&self) -> DriverBugs {
        DriverBugs::detect(&self.driver)
    }
}

/// Settings and capability bits that change generated shader source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HostConfig {
    pub msaa: bool,
    pub ssaa: bool,
    pub stereo: bool,
    pub wireframe: bool,
    pub per_pixel_lighting: bool,
    pub bounding_box: bool,
    pub backend_dual_source_blend: bool,
    pub backend_geometry_shaders: bool,
    pub backend_logic_op: bool,
    pub backend_framebuffer_fetch: bool,
    pub backend_bbox: bool,
    pub backend_dynamic_vertex_loader: bool,
    pub backend_vs_expand: bool,
    pub backend_reversed_depth_range: bool,
    pub efb_scale_above_one: bool,
}

impl HostConfig {
    pub fn new(caps: &Capabilities, config: &VideoConfig) -> Self {
        Self {
            msaa: config.msaa_samples > 1,
            ssaa: config.msaa_samples > 1 && config.ssaa,
            stereo: config.stereo,
            wireframe: config.wireframe,
            per_pixel_lighting: config.per_pixel_lighting,
            bounding_box: config.bounding_box,
            backend_dual_source_blend: caps.supports_dual_source_blend,
            backend_geometry_shaders: caps.supports_geometry_shaders,
            backend_logic_op: caps.supports_logic_op,
            backend_framebuffer_fetch: caps.supports_framebuffer_fetch,
            backend_bbox: caps.supports_bbox,
            backend_dynamic_vertex_loader: caps.supports_dynamic_vertex_loader,
            backend_vs_expand: config.prefer_vs_for_line_point_expansion
                && caps.supports_vs_line_point_expand,
            backend_reversed_depth_range: caps.supports_reversed_depth_range,
            efb_scale_above_one: config.efb_scale > 1,
        }
    }

    pub fn bits(&self) -> u32 {
        [
            self.msaa,
            self.ssaa,
            self.stereo,
            self.wireframe,
            self.per_pixel_lighting,
            self.bounding_box,
            self.backend_dual_source_blend,
            self.backend_geometry_shaders,
            self.backend_logic_op,
            self.backend_framebuffer_fetch,
            self.backend_bbox,
            self.backend_dynamic_vertex_loader,
            self.backend_vs_expand,
            self.backend_reversed_depth_range,
            self.efb_scale_above_one,
        ]
        .iter()
        .enumerate()
        .fold(0, |bits, (index, &flag)| bits | (u32::from(flag) << index))
    }
}
