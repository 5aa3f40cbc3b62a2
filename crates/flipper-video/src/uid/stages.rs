//! Stage-level identities. Stages are cached independently of whole programs so one compiled
//! vertex or pixel stage can serve many pipelines.

use super::codec::{wire_enum, FixedCodec, UidDecodeError, UidReader, UidWriter};
use super::render_state::{BlendFactor, LogicOp, PrimitiveType};
use crate::caps::{ApiType, HostConfig};

pub const MAX_TEXGENS: u8 = 8;

wire_enum! {
    /// How the pixel stage emulates the depth test.
    pub enum EmulatedZ {
        Disabled = 0,
        Early = 1,
        Late = 2,
        ForcedEarly = 3,
        EarlyWithFbFetch = 4,
        EarlyWithZComplocHack = 5,
    }
}

wire_enum! {
    /// Point/line expansion performed in the vertex stage instead of a geometry stage.
    pub enum VsExpand {
        None = 0,
        Point = 1,
        Line = 2,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexShaderUid {
    pub num_texgens: u8,
    /// Vertex attribute presence mask reported by the vertex loader.
    pub components: u32,
    pub vs_expand: VsExpand,
    pub position_has_3_elems: bool,
    /// Two bits per texture coordinate: number of components when expanding in the vertex stage.
    pub texcoord_elem_count: u16,
    /// Packed transform-unit configuration (lighting channels, texgen sources).
    pub transform: u64,
}

impl Default for VertexShaderUid {
    fn default() -> Self {
        Self {
            num_texgens: 0,
            components: 0,
            vs_expand: VsExpand::None,
            position_has_3_elems: false,
            texcoord_elem_count: 0,
            transform: 0,
        }
    }
}

impl FixedCodec for VertexShaderUid {
    const SERIALIZED_LEN: usize = 17;

    fn encode(&self, w: &mut UidWriter) {
        w.u8(self.num_texgens);
        w.u32(self.components);
        w.enumeration(self.vs_expand);
        w.bool(self.position_has_3_elems);
        w.u16(self.texcoord_elem_count);
        w.u64(self.transform);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            num_texgens: r.u8()?,
            components: r.u32()?,
            vs_expand: r.enumeration("vs.vs_expand")?,
            position_has_3_elems: r.bool("vs.position_has_3_elems")?,
            texcoord_elem_count: r.u16()?,
            transform: r.u64()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PixelShaderUid {
    pub num_texgens: u8,
    pub num_stages: u8,
    pub ztest: EmulatedZ,
    pub zfreeze: bool,
    pub per_pixel_lighting: bool,
    pub per_pixel_depth: bool,
    pub bounding_box: bool,
    pub uint_output: bool,
    pub no_dual_src: bool,
    pub emulate_logic_op_with_blend: bool,
    pub logic_op_enable: bool,
    pub logic_op_mode: LogicOp,
    pub blend_enable: bool,
    pub blend_src_factor: BlendFactor,
    pub blend_dst_factor: BlendFactor,
    pub blend_src_factor_alpha: BlendFactor,
    pub blend_dst_factor_alpha: BlendFactor,
    pub blend_subtract: bool,
    pub blend_subtract_alpha: bool,
    /// Packed colour combiner configuration for all active stages.
    pub combiners: u64,
}

impl Default for PixelShaderUid {
    fn default() -> Self {
        Self {
            num_texgens: 0,
            num_stages: 1,
            ztest: EmulatedZ::Late,
            zfreeze: false,
            per_pixel_lighting: false,
            per_pixel_depth: false,
            bounding_box: false,
            uint_output: false,
            no_dual_src: false,
            emulate_logic_op_with_blend: false,
            logic_op_enable: false,
            logic_op_mode: LogicOp::Copy,
            blend_enable: false,
            blend_src_factor: BlendFactor::One,
            blend_dst_factor: BlendFactor::Zero,
            blend_src_factor_alpha: BlendFactor::One,
            blend_dst_factor_alpha: BlendFactor::Zero,
            blend_subtract: false,
            blend_subtract_alpha: false,
            combiners: 0,
        }
    }
}

impl PixelShaderUid {
    /// Drops state the active host can never use so equivalent requests share one stage.
    pub fn clear_unused_bits(&mut self, api: ApiType, host: &HostConfig) {
        // Only D3D with hardware logic ops needs an integer render target view.
        if api != ApiType::D3D || !host.backend_logic_op {
            self.uint_output = false;
        }
        self.bounding_box &= host.bounding_box && host.backend_bbox;
    }
}

impl FixedCodec for PixelShaderUid {
    const SERIALIZED_LEN: usize = 27;

    fn encode(&self, w: &mut UidWriter) {
        w.u8(self.num_texgens);
        w.u8(self.num_stages);
        w.enumeration(self.ztest);
        w.bool(self.zfreeze);
        w.bool(self.per_pixel_lighting);
        w.bool(self.per_pixel_depth);
        w.bool(self.bounding_box);
        w.bool(self.uint_output);
        w.bool(self.no_dual_src);
        w.bool(self.emulate_logic_op_with_blend);
        w.bool(self.logic_op_enable);
        w.enumeration(self.logic_op_mode);
        w.bool(self.blend_enable);
        w.enumeration(self.blend_src_factor);
        w.enumeration(self.blend_dst_factor);
        w.enumeration(self.blend_src_factor_alpha);
        w.enumeration(self.blend_dst_factor_alpha);
        w.bool(self.blend_subtract);
        w.bool(self.blend_subtract_alpha);
        w.u64(self.combiners);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            num_texgens: r.u8()?,
            num_stages: r.u8()?,
            ztest: r.enumeration("ps.ztest")?,
            zfreeze: r.bool("ps.zfreeze")?,
            per_pixel_lighting: r.bool("ps.per_pixel_lighting")?,
            per_pixel_depth: r.bool("ps.per_pixel_depth")?,
            bounding_box: r.bool("ps.bounding_box")?,
            uint_output: r.bool("ps.uint_output")?,
            no_dual_src: r.bool("ps.no_dual_src")?,
            emulate_logic_op_with_blend: r.bool("ps.emulate_logic_op_with_blend")?,
            logic_op_enable: r.bool("ps.logic_op_enable")?,
            logic_op_mode: r.enumeration("ps.logic_op_mode")?,
            blend_enable: r.bool("ps.blend_enable")?,
            blend_src_factor: r.enumeration("ps.blend_src_factor")?,
            blend_dst_factor: r.enumeration("ps.blend_dst_factor")?,
            blend_src_factor_alpha: r.enumeration("ps.blend_src_factor_alpha")?,
            blend_dst_factor_alpha: r.enumeration("ps.blend_dst_factor_alpha")?,
            blend_subtract: r.bool("ps.blend_subtract")?,
            blend_subtract_alpha: r.bool("ps.blend_subtract_alpha")?,
            combiners: r.u64()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeometryShaderUid {
    pub primitive: PrimitiveType,
    pub num_texgens: u8,
}

impl GeometryShaderUid {
    /// Triangles need no geometry stage unless stereo or wireframe output has to be synthesized.
    pub fn is_passthrough(&self, host: &HostConfig) -> bool {
        self.primitive.is_triangles() && !host.stereo && !host.wireframe
    }
}

impl Default for GeometryShaderUid {
    fn default() -> Self {
        Self {
            primitive: PrimitiveType::Triangles,
            num_texgens: 0,
        }
    }
}

impl FixedCodec for GeometryShaderUid {
    const SERIALIZED_LEN: usize = 2;

    fn encode(&self, w: &mut UidWriter) {
        w.enumeration(self.primitive);
        w.u8(self.num_texgens);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            primitive: r.enumeration("gs.primitive")?,
            num_texgens: r.u8()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UberVertexShaderUid {
    pub num_texgens: u8,
    pub vs_expand: VsExpand,
}

impl FixedCodec for UberVertexShaderUid {
    const SERIALIZED_LEN: usize = 2;

    fn encode(&self, w: &mut UidWriter) {
        w.u8(self.num_texgens);
        w.enumeration(self.vs_expand);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            num_texgens: r.u8()?,
            vs_expand: r.enumeration("uber_vs.vs_expand")?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UberPixelShaderUid {
    pub num_texgens: u8,
    pub early_depth: bool,
    pub per_pixel_depth: bool,
    pub uint_output: bool,
    pub no_dual_src: bool,
    pub bounding_box: bool,
}

impl UberPixelShaderUid {
    pub fn clear_unused_bits(&mut self, api: ApiType, host: &HostConfig) {
        if api != ApiType::D3D || !host.backend_logic_op {
            self.uint_output = false;
        }
        self.bounding_box &= host.bounding_box && host.backend_bbox;
    }
}

impl FixedCodec for UberPixelShaderUid {
    const SERIALIZED_LEN: usize = 6;

    fn encode(&self, w: &mut UidWriter) {
        w.u8(self.num_texgens);
        w.bool(self.early_depth);
        w.bool(self.per_pixel_depth);
        w.bool(self.uint_output);
        w.bool(self.no_dual_src);
        w.bool(self.bounding_box);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            num_texgens: r.u8()?,
            early_depth: r.bool("uber_ps.early_depth")?,
            per_pixel_depth: r.bool("uber_ps.per_pixel_depth")?,
            uint_output: r.bool("uber_ps.uint_output")?,
            no_dual_src: r.bool("uber_ps.no_dual_src")?,
            bounding_box: r.bool("uber_ps.bounding_box")?,
        })
    }
}

pub fn enumerate_uber_vertex_shader_uids() -> impl Iterator<Item = UberVertexShaderUid> {
    (0..=MAX_TEXGENS).flat_map(|num_texgens| {
        VsExpand::ALL.iter().map(move |&vs_expand| UberVertexShaderUid {
            num_texgens,
            vs_expand,
        })
    })
}

pub fn enumerate_uber_pixel_shader_uids() -> impl Iterator<Item = UberPixelShaderUid> {
    (0..=MAX_TEXGENS).flat_map(|num_texgens| {
        [(false, false), (false, true), (true, false)]
            .into_iter()
            .flat_map(move |(early_depth, per_pixel_depth)| {
                // Early depth and a shader-written depth value are mutually exclusive.
                [false, true]
                    .into_iter()
                    .map(move |uint_output| UberPixelShaderUid {
                        num_texgens,
                        early_depth,
                        per_pixel_depth,
                        uint_output,
                        no_dual_src: false,
                        bounding_box: false,
                    })
            })
    })
}

pub fn enumerate_geometry_shader_uids(
    supports_primitive_restart: bool,
) -> impl Iterator<Item = GeometryShaderUid> {
    let triangles = if supports_primitive_restart {
        PrimitiveType::TriangleStrip
    } else {
        PrimitiveType::Triangles
    };
    [triangles, PrimitiveType::Lines, PrimitiveType::Points]
        .into_iter()
        .flat_map(|primitive| {
            (0..=MAX_TEXGENS).map(move |num_texgens| GeometryShaderUid {
                primitive,
                num_texgens,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn uber_enumerations_have_the_expected_cardinality() {
        let vs: HashSet<_> = enumerate_uber_vertex_shader_uids().collect();
        assert_eq!(vs.len(), 9 * 3);

        let ps: Vec<_> = enumerate_uber_pixel_shader_uids().collect();
        assert_eq!(ps.len(), 9 * 3 * 2);
        assert!(ps.iter().all(|uid| !(uid.early_depth && uid.per_pixel_depth)));

        let gs: HashSet<_> = enumerate_geometry_shader_uids(true).collect();
        assert_eq!(gs.len(), 3 * 9);
        assert!(gs
            .iter()
            .all(|uid| uid.primitive != PrimitiveType::Triangles));
    }

    #[test]
    fn clearing_unused_bits_depends_on_the_api() {
        let host = HostConfig {
            backend_logic_op: true,
            ..HostConfig::default()
        };
        let mut uid = PixelShaderUid {
            uint_output: true,
            bounding_box: true,
            ..PixelShaderUid::default()
        };

        let mut d3d = uid;
        d3d.clear_unused_bits(ApiType::D3D, &host);
        assert!(d3d.uint_output);
        assert!(!d3d.bounding_box);

        uid.clear_unused_bits(ApiType::Vulkan, &host);
        assert!(!uid.uint_output);
    }
}
