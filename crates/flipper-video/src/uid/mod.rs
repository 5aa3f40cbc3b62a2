//! Program identities.
//!
//! A [`PipelineUid`] names one exact-state program; an [`UberPipelineUid`] names a program that
//! branches at draw time to cover many exact states. Both hash and compare structurally and
//! serialize to a fixed-width little-endian form for the disk logs.

pub mod codec;
mod render_state;
mod stages;
mod vertex;

pub use codec::{FixedCodec, UidDecodeError, UidReader, UidWriter};
pub use render_state::{
    BlendFactor, BlendingState, CompareMode, CullMode, DepthState, LogicOp, PrimitiveType,
    RasterizationState,
};
pub use stages::{
    enumerate_geometry_shader_uids, enumerate_uber_pixel_shader_uids,
    enumerate_uber_vertex_shader_uids, EmulatedZ, GeometryShaderUid, PixelShaderUid,
    UberPixelShaderUid, UberVertexShaderUid, VertexShaderUid, VsExpand, MAX_TEXGENS,
};
pub use vertex::{AttributeFormat, ComponentFormat, VertexLayout};

/// Bumped whenever the serialized form of any identity changes.
pub const UID_SCHEMA_VERSION: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineUid {
    /// `None` once point/line expansion moves vertex fetching into the vertex stage.
    pub vertex_layout: Option<VertexLayout>,
    pub vs_uid: VertexShaderUid,
    pub gs_uid: GeometryShaderUid,
    pub ps_uid: PixelShaderUid,
    pub rasterization: RasterizationState,
    pub depth: DepthState,
    pub blending: BlendingState,
}

impl FixedCodec for PipelineUid {
    const SERIALIZED_LEN: usize = 1
        + VertexLayout::SERIALIZED_LEN
        + VertexShaderUid::SERIALIZED_LEN
        + GeometryShaderUid::SERIALIZED_LEN
        + PixelShaderUid::SERIALIZED_LEN
        + RasterizationState::SERIALIZED_LEN
        + DepthState::SERIALIZED_LEN
        + BlendingState::SERIALIZED_LEN;

    fn encode(&self, w: &mut UidWriter) {
        w.optional(self.vertex_layout.as_ref());
        self.vs_uid.encode(w);
        self.gs_uid.encode(w);
        self.ps_uid.encode(w);
        self.rasterization.encode(w);
        self.depth.encode(w);
        self.blending.encode(w);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            vertex_layout: r.optional("vertex_layout")?,
            vs_uid: VertexShaderUid::decode(r)?,
            gs_uid: GeometryShaderUid::decode(r)?,
            ps_uid: PixelShaderUid::decode(r)?,
            rasterization: RasterizationState::decode(r)?,
            depth: DepthState::decode(r)?,
            blending: BlendingState::decode(r)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UberPipelineUid {
    /// `None` when the backend fetches vertices dynamically.
    pub vertex_layout: Option<VertexLayout>,
    pub vs_uid: UberVertexShaderUid,
    pub gs_uid: GeometryShaderUid,
    pub ps_uid: UberPixelShaderUid,
    pub rasterization: RasterizationState,
    pub depth: DepthState,
    pub blending: BlendingState,
}

impl FixedCodec for UberPipelineUid {
    const SERIALIZED_LEN: usize = 1
        + VertexLayout::SERIALIZED_LEN
        + UberVertexShaderUid::SERIALIZED_LEN
        + GeometryShaderUid::SERIALIZED_LEN
        + UberPixelShaderUid::SERIALIZED_LEN
        + RasterizationState::SERIALIZED_LEN
        + DepthState::SERIALIZED_LEN
        + BlendingState::SERIALIZED_LEN;

    fn encode(&self, w: &mut UidWriter) {
        w.optional(self.vertex_layout.as_ref());
        self.vs_uid.encode(w);
        self.gs_uid.encode(w);
        self.ps_uid.encode(w);
        self.rasterization.encode(w);
        self.depth.encode(w);
        self.blending.encode(w);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            vertex_layout: r.optional("vertex_layout")?,
            vs_uid: UberVertexShaderUid::decode(r)?,
            gs_uid: GeometryShaderUid::decode(r)?,
            ps_uid: UberPixelShaderUid::decode(r)?,
            rasterization: RasterizationState::decode(r)?,
            depth: DepthState::decode(r)?,
            blending: BlendingState::decode(r)?,
        })
    }
}
