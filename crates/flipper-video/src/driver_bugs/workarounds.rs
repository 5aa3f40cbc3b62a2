use super::DriverBugs;
use crate::caps::{Capabilities, HostConfig};
use crate::uid::{
    BlendingState, EmulatedZ, PipelineUid, PrimitiveType, UberPipelineUid, VsExpand,
};

/// The capability bits and bug flags the identity rewrites look at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkaroundContext {
    pub supports_logic_op: bool,
    pub supports_framebuffer_fetch: bool,
    pub supports_dual_source_blend: bool,
    pub supports_early_z: bool,
    pub supports_primitive_restart: bool,
    pub supports_dynamic_vertex_loader: bool,
    pub use_vs_for_line_point_expand: bool,
    pub bugs: DriverBugs,
}

impl WorkaroundContext {
    pub fn new(caps: &Capabilities, host: &HostConfig) -> Self {
        let bugs = caps.driver_bugs();
        Self {
            supports_logic_op: caps.supports_logic_op && !bugs.contains(DriverBugs::BROKEN_LOGIC_OP),
            supports_framebuffer_fetch: caps.supports_framebuffer_fetch,
            supports_dual_source_blend: caps.supports_dual_source_blend,
            supports_early_z: caps.supports_early_z,
            supports_primitive_restart: caps.supports_primitive_restart,
            supports_dynamic_vertex_loader: caps.supports_dynamic_vertex_loader,
            use_vs_for_line_point_expand: host.backend_vs_expand,
            bugs,
        }
    }

    fn expanded_primitive(&self) -> PrimitiveType {
        if self.supports_primitive_restart {
            PrimitiveType::TriangleStrip
        } else {
            PrimitiveType::Triangles
        }
    }
}

/// Rewrites an exact-state identity into the one that is actually compiled and bound.
///
/// Idempotent: applying it to its own output changes nothing.
pub fn apply_driver_bugs(uid: &PipelineUid, ctx: &WorkaroundContext) -> PipelineUid {
    let mut out = *uid;
    let ps = &mut out.ps_uid;
    let blend = &mut out.blending;

    // Forcing early depth only matters when depth is written.
    if ps.ztest == EmulatedZ::ForcedEarly && !out.depth.update_enable {
        ps.ztest = EmulatedZ::Early;
    }

    // With framebuffer fetch the pixel stage can do the logic op itself (below).
    if blend.logic_op_enable && !ctx.supports_logic_op && !ctx.supports_framebuffer_fetch {
        if blend.logic_op_approximation_wants_shader_help() {
            ps.emulate_logic_op_with_blend = true;
            ps.logic_op_mode = blend.logic_mode;
        }
        blend.approximate_logic_op_with_blending();
    }

    let prefers_single_source = (!ctx.supports_dual_source_blend
        && ctx.supports_framebuffer_fetch)
        || ctx.bugs.contains(DriverBugs::BROKEN_DUAL_SOURCE_BLENDING);
    if prefers_single_source && !blend.requires_dual_src() {
        ps.no_dual_src = true;
        blend.use_dual_src = false;
    }

    if ctx.supports_framebuffer_fetch {
        let mut blend_in_shader = false;
        if ps.ztest == EmulatedZ::ForcedEarly
            && (ctx.bugs.contains(DriverBugs::BROKEN_DISCARD_WITH_EARLY_Z) || !ctx.supports_early_z)
        {
            ps.ztest = EmulatedZ::EarlyWithFbFetch;
            blend_in_shader |= blend.blend_enable;
            ps.no_dual_src = true;
        }
        blend_in_shader |= blend.logic_op_enable && !ctx.supports_logic_op;
        blend_in_shader |= blend.use_dual_src && !ctx.supports_dual_source_blend;

        if blend_in_shader {
            ps.no_dual_src = true;
            if blend.logic_op_enable {
                ps.logic_op_enable = true;
                ps.logic_op_mode = blend.logic_mode;
                blend.logic_op_enable = false;
            }
            if blend.blend_enable {
                ps.blend_enable = true;
                ps.blend_src_factor = blend.src_factor;
                ps.blend_src_factor_alpha = blend.src_factor_alpha;
                ps.blend_dst_factor = blend.dst_factor;
                ps.blend_dst_factor_alpha = blend.dst_factor_alpha;
                ps.blend_subtract = blend.subtract;
                ps.blend_subtract_alpha = blend.subtract_alpha;
                blend.blend_enable = false;
            }
        }
    }

    if !ctx.supports_dual_source_blend {
        ps.no_dual_src = true;
        blend.use_dual_src = false;
    }

    // Without early depth support the only option left is to make alpha test always pass so
    // depth is still written.
    if ps.ztest == EmulatedZ::ForcedEarly && !ctx.supports_early_z {
        ps.ztest = EmulatedZ::EarlyWithZComplocHack;
    }

    let primitive = out.rasterization.primitive;
    if ctx.use_vs_for_line_point_expand
        && matches!(primitive, PrimitiveType::Points | PrimitiveType::Lines)
    {
        let vs = &mut out.vs_uid;
        vs.vs_expand = if primitive == PrimitiveType::Points {
            VsExpand::Point
        } else {
            VsExpand::Line
        };
        if let Some(layout) = out.vertex_layout.take() {
            vs.position_has_3_elems = layout.position.components >= 3;
            vs.texcoord_elem_count = layout
                .texcoords
                .iter()
                .enumerate()
                .filter(|(_, texcoord)| texcoord.enable)
                .fold(0, |count, (index, texcoord)| {
                    count | (u16::from(texcoord.components.min(3)) << (index * 2))
                });
        }
        out.rasterization.primitive = ctx.expanded_primitive();
    }

    out
}

/// Über-family counterpart of [`apply_driver_bugs`]. Also idempotent.
pub fn apply_uber_driver_bugs(uid: &UberPipelineUid, ctx: &WorkaroundContext) -> UberPipelineUid {
    let mut out = *uid;

    if ctx.supports_dynamic_vertex_loader {
        out.vertex_layout = None;
    }

    if out.blending.logic_op_enable && !ctx.supports_logic_op && !ctx.supports_framebuffer_fetch
    {
        out.blending.approximate_logic_op_with_blending();
    }

    if ctx.supports_framebuffer_fetch {
        // All blending happens in the pixel stage; only the write masks stay fixed-function.
        out.blending =
            BlendingState::write_mask_only(out.blending.color_update, out.blending.alpha_update);
        out.ps_uid.no_dual_src = true;
    } else if !ctx.supports_dual_source_blend
        || (ctx.bugs.contains(DriverBugs::BROKEN_DUAL_SOURCE_BLENDING)
            && !out.blending.requires_dual_src())
    {
        out.blending.use_dual_src = false;
        out.ps_uid.no_dual_src = true;
    }

    if ctx.use_vs_for_line_point_expand {
        match out.rasterization.primitive {
            PrimitiveType::Points => out.vs_uid.vs_expand = VsExpand::Point,
            PrimitiveType::Lines => out.vs_uid.vs_expand = VsExpand::Line,
            PrimitiveType::Triangles | PrimitiveType::TriangleStrip => {}
        }
        out.rasterization.primitive = ctx.expanded_primitive();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uid::{
        BlendFactor, DepthState, GeometryShaderUid, LogicOp, PixelShaderUid, RasterizationState,
        UberPixelShaderUid, UberVertexShaderUid, VertexLayout, VertexShaderUid,
    };
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn full_ctx() -> WorkaroundContext {
        WorkaroundContext {
            supports_logic_op: true,
            supports_framebuffer_fetch: false,
            supports_dual_source_blend: true,
            supports_early_z: true,
            supports_primitive_restart: true,
            supports_dynamic_vertex_loader: false,
            use_vs_for_line_point_expand: false,
            bugs: DriverBugs::empty(),
        }
    }

    fn base_uid() -> PipelineUid {
        PipelineUid {
            vertex_layout: Some(VertexLayout::position_only()),
            vs_uid: VertexShaderUid::default(),
            gs_uid: GeometryShaderUid::default(),
            ps_uid: PixelShaderUid::default(),
            rasterization: RasterizationState::cull_back(PrimitiveType::Triangles),
            depth: DepthState::always_write(),
            blending: BlendingState::no_blending(),
        }
    }

    #[test]
    fn fully_capable_backend_leaves_identities_alone() {
        let uid = base_uid();
        assert_eq!(apply_driver_bugs(&uid, &full_ctx()), uid);
    }

    #[test]
    fn logic_op_is_approximated_without_hardware_support() {
        let mut uid = base_uid();
        uid.blending.logic_op_enable = true;
        uid.blending.logic_mode = LogicOp::Invert;
        let ctx = WorkaroundContext {
            supports_logic_op: false,
            ..full_ctx()
        };

        let out = apply_driver_bugs(&uid, &ctx);
        assert!(!out.blending.logic_op_enable);
        assert!(out.ps_uid.emulate_logic_op_with_blend);
        assert_eq!(out.ps_uid.logic_op_mode, LogicOp::Invert);
    }

    #[test]
    fn broken_dual_source_is_only_kept_when_required() {
        let ctx = WorkaroundContext {
            bugs: DriverBugs::BROKEN_DUAL_SOURCE_BLENDING,
            ..full_ctx()
        };

        let mut optional = base_uid();
        optional.blending.use_dual_src = true;
        let out = apply_driver_bugs(&optional, &ctx);
        assert!(out.ps_uid.no_dual_src);
        assert!(!out.blending.use_dual_src);

        let mut required = optional;
        required.blending.blend_enable = true;
        required.blending.src_factor = BlendFactor::SrcAlpha;
        required.blending.dst_factor = BlendFactor::InvSrcAlpha;
        let out = apply_driver_bugs(&required, &ctx);
        assert!(!out.ps_uid.no_dual_src);
        assert!(out.blending.use_dual_src);
    }

    #[test]
    fn forced_early_depth_folds_into_the_pixel_stage() {
        let mut uid = base_uid();
        uid.ps_uid.ztest = EmulatedZ::ForcedEarly;

        let no_early_z = WorkaroundContext {
            supports_early_z: false,
            ..full_ctx()
        };
        assert_eq!(
            apply_driver_bugs(&uid, &no_early_z).ps_uid.ztest,
            EmulatedZ::EarlyWithZComplocHack
        );

        let fbfetch = WorkaroundContext {
            supports_framebuffer_fetch: true,
            bugs: DriverBugs::BROKEN_DISCARD_WITH_EARLY_Z,
            ..full_ctx()
        };
        uid.blending.blend_enable = true;
        let out = apply_driver_bugs(&uid, &fbfetch);
        assert_eq!(out.ps_uid.ztest, EmulatedZ::EarlyWithFbFetch);
        assert!(out.ps_uid.blend_enable);
        assert!(!out.blending.blend_enable);

        uid.depth.update_enable = false;
        assert_eq!(
            apply_driver_bugs(&uid, &no_early_z).ps_uid.ztest,
            EmulatedZ::Early
        );
    }

    #[test]
    fn points_expand_in_the_vertex_stage() {
        let mut uid = base_uid();
        uid.rasterization.primitive = PrimitiveType::Points;
        uid.vertex_layout = Some(VertexLayout {
            texcoords: {
                let mut texcoords = VertexLayout::default().texcoords;
                texcoords[1] = crate::uid::AttributeFormat::float(2, 16);
                texcoords
            },
            ..VertexLayout::position_only()
        });
        let ctx = WorkaroundContext {
            use_vs_for_line_point_expand: true,
            supports_primitive_restart: false,
            ..full_ctx()
        };

        let out = apply_driver_bugs(&uid, &ctx);
        assert_eq!(out.vs_uid.vs_expand, VsExpand::Point);
        assert_eq!(out.vertex_layout, None);
        assert!(out.vs_uid.position_has_3_elems);
        assert_eq!(out.vs_uid.texcoord_elem_count, 2 << 2);
        assert_eq!(out.rasterization.primitive, PrimitiveType::Triangles);
    }

    #[test]
    fn uber_framebuffer_fetch_keeps_only_write_masks() {
        let uid = UberPipelineUid {
            vertex_layout: Some(VertexLayout::position_only()),
            vs_uid: UberVertexShaderUid {
                num_texgens: 1,
                vs_expand: VsExpand::None,
            },
            gs_uid: GeometryShaderUid::default(),
            ps_uid: UberPixelShaderUid {
                num_texgens: 1,
                early_depth: false,
                per_pixel_depth: false,
                uint_output: false,
                no_dual_src: false,
                bounding_box: false,
            },
            rasterization: RasterizationState::cull_back(PrimitiveType::Triangles),
            depth: DepthState::no_depth_testing(),
            blending: BlendingState {
                blend_enable: true,
                alpha_update: false,
                ..BlendingState::no_blending()
            },
        };
        let ctx = WorkaroundContext {
            supports_framebuffer_fetch: true,
            supports_dynamic_vertex_loader: true,
            ..full_ctx()
        };

        let out = apply_uber_driver_bugs(&uid, &ctx);
        assert_eq!(out.vertex_layout, None);
        assert_eq!(out.blending, BlendingState::write_mask_only(true, false));
        assert!(out.ps_uid.no_dual_src);
    }

    fn arb_ctx() -> impl Strategy<Value = WorkaroundContext> {
        (any::<[bool; 7]>(), 0u32..16).prop_map(|(flags, bugs)| WorkaroundContext {
            supports_logic_op: flags[0],
            supports_framebuffer_fetch: flags[1],
            supports_dual_source_blend: flags[2],
            supports_early_z: flags[3],
            supports_primitive_restart: flags[4],
            supports_dynamic_vertex_loader: flags[5],
            use_vs_for_line_point_expand: flags[6],
            bugs: DriverBugs::from_bits_truncate(bugs),
        })
    }

    fn arb_uid() -> impl Strategy<Value = PipelineUid> {
        (
            prop::sample::select(PrimitiveType::ALL),
            prop::sample::select(EmulatedZ::ALL),
            prop::sample::select(LogicOp::ALL),
            prop::sample::select(BlendFactor::ALL),
            any::<[bool; 5]>(),
        )
            .prop_map(|(primitive, ztest, logic_mode, factor, flags)| {
                let mut uid = base_uid();
                uid.rasterization.primitive = primitive;
                uid.ps_uid.ztest = ztest;
                uid.depth.update_enable = flags[0];
                uid.blending.logic_op_enable = flags[1];
                uid.blending.logic_mode = logic_mode;
                uid.blending.blend_enable = flags[2];
                uid.blending.use_dual_src = flags[3];
                uid.blending.src_factor = factor;
                if flags[4] {
                    uid.vertex_layout = None;
                }
                uid
            })
    }

    proptest! {
        #[test]
        fn specific_normalization_is_idempotent(uid in arb_uid(), ctx in arb_ctx()) {
            let once = apply_driver_bugs(&uid, &ctx);
            prop_assert_eq!(apply_driver_bugs(&once, &ctx), once);
        }

        #[test]
        fn uber_normalization_is_idempotent(uid in arb_uid(), ctx in arb_ctx()) {
            let uber = UberPipelineUid {
                vertex_layout: uid.vertex_layout,
                vs_uid: UberVertexShaderUid { num_texgens: 0, vs_expand: VsExpand::None },
                gs_uid: uid.gs_uid,
                ps_uid: UberPixelShaderUid {
                    num_texgens: 0,
                    early_depth: false,
                    per_pixel_depth: false,
                    uint_output: false,
                    no_dual_src: false,
                    bounding_box: false,
                },
                rasterization: uid.rasterization,
                depth: uid.depth,
                blending: uid.blending,
            };
            let once = apply_uber_driver_bugs(&uber, &ctx);
            prop_assert_eq!(apply_uber_driver_bugs(&once, &ctx), once);
        }
    }
}
