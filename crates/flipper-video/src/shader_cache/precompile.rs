//! Bulk compilation: every über pipeline at startup, plus every pipeline identity recorded by
//! earlier sessions.

use tracing::info;

use super::{EntryState, PipelineKey, ShaderCache};
use crate::async_compiler::WorkPriority;
use crate::backend::ShaderBackend;
use crate::uid::{
    enumerate_geometry_shader_uids, enumerate_uber_pixel_shader_uids,
    enumerate_uber_vertex_shader_uids, BlendFactor, BlendingState, DepthState, GeometryShaderUid,
    LogicOp, PipelineUid, PrimitiveType, RasterizationState, UberPipelineUid, UberPixelShaderUid,
    UberVertexShaderUid, VertexLayout, VsExpand,
};

impl<B: ShaderBackend> ShaderCache<B> {
    /// Queues one über pipeline per compatible (vertex, geometry, pixel) combination.
    ///
    /// With a dynamic vertex loader, the blend variants drivers commonly bake into compiled
    /// code are queued too.
    pub fn queue_uber_shader_pipelines(&mut self) {
        let gs_uids: Vec<_> = enumerate_geometry_shader_uids(self.caps.supports_primitive_restart)
            .filter(|gs| self.host.backend_geometry_shaders || gs.is_passthrough(&self.host))
            .collect();
        let vs_uids: Vec<_> = enumerate_uber_vertex_shader_uids().collect();
        let ps_uids: Vec<_> = enumerate_uber_pixel_shader_uids()
            .map(|mut ps| {
                ps.clear_unused_bits(self.caps.api, &self.host);
                ps
            })
            .collect();

        let before = self.uber_pipelines.map.len();
        for gs in &gs_uids {
            for vs in &vs_uids {
                if vs.num_texgens != gs.num_texgens || !self.vs_expand_matches(vs, gs) {
                    continue;
                }
                for ps in ps_uids.iter().filter(|ps| ps.num_texgens == vs.num_texgens) {
                    self.queue_uber_variants(*vs, *gs, *ps);
                }
            }
        }
        info!(
            queued = self.uber_pipelines.map.len() - before,
            "queued uber shader pipelines"
        );
    }

    /// Vertex-stage expansion replaces the point and line geometry stages, so each expansion
    /// mode only pairs with its own primitive.
    fn vs_expand_matches(&self, vs: &UberVertexShaderUid, gs: &GeometryShaderUid) -> bool {
        match vs.vs_expand {
            VsExpand::None => {
                !self.host.backend_vs_expand
                    || !matches!(gs.primitive, PrimitiveType::Points | PrimitiveType::Lines)
            }
            VsExpand::Point => self.host.backend_vs_expand && gs.primitive == PrimitiveType::Points,
            VsExpand::Line => self.host.backend_vs_expand && gs.primitive == PrimitiveType::Lines,
        }
    }

    fn queue_uber_variants(
        &mut self,
        vs: UberVertexShaderUid,
        gs: GeometryShaderUid,
        ps: UberPixelShaderUid,
    ) {
        let mut blend = BlendingState::no_blending();
        self.queue_uber_pipeline(vs, gs, ps, blend);

        if !self.caps.supports_dynamic_vertex_loader {
            return;
        }
        blend.alpha_update = false;
        self.queue_uber_pipeline(vs, gs, ps, blend);
        blend.alpha_update = true;
        blend.color_update = false;
        self.queue_uber_pipeline(vs, gs, ps, blend);
        blend.color_update = true;

        if !ps.no_dual_src && !ps.uint_output {
            blend.blend_enable = true;
            blend.use_dual_src = true;
            blend.src_factor = BlendFactor::SrcAlpha;
            blend.dst_factor = BlendFactor::InvSrcAlpha;
            self.queue_uber_pipeline(vs, gs, ps, blend);
        }
    }

    fn queue_uber_pipeline(
        &mut self,
        vs: UberVertexShaderUid,
        gs: GeometryShaderUid,
        ps: UberPixelShaderUid,
        mut blending: BlendingState,
    ) {
        if ps.uint_output {
            blending.logic_op_enable = true;
            blending.logic_mode = LogicOp::And;
        }
        let uid = UberPipelineUid {
            vertex_layout: Some(VertexLayout::position_only()),
            vs_uid: vs,
            gs_uid: gs,
            ps_uid: ps,
            rasterization: RasterizationState::cull_back(gs.primitive),
            depth: DepthState::no_depth_testing(),
            blending,
        };
        let key = self.normalize(&uid);
        if UberPipelineUid::entries(self).map.contains_key(&key) {
            return;
        }
        self.queue_pipeline_compile(key, WorkPriority::UberShader);
    }

    /// Queues every pipeline identity seen so far (including those replayed from the identity
    /// log) that is not already compiled or compiling.
    pub fn compile_missing_pipelines(&mut self) {
        let missing: Vec<PipelineUid> = self
            .known_pipeline_uids
            .iter()
            .map(|uid| self.normalize(uid))
            .filter(|key| {
                matches!(
                    self.pipelines.state(key),
                    EntryState::Absent | EntryState::Failed
                )
            })
            .collect();
        if missing.is_empty() {
            return;
        }

        info!(count = missing.len(), "compiling pipelines from previous sessions");
        for key in missing {
            // Several raw identities can normalize to the same key.
            if matches!(self.pipelines.state(&key), EntryState::Pending | EntryState::Ready) {
                continue;
            }
            self.forget_failed_stages(&key);
            self.queue_pipeline_compile(key, WorkPriority::ShaderCache);
        }
    }
}
