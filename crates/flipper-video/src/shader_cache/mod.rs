//! Shader and pipeline cache.
//!
//! Owns every compiled stage and pipeline for one backend session. Stages are cached by their
//! own identities so one compiled vertex or pixel stage serves many pipelines. Pipelines are
//! keyed by the *normalized* identity (driver-bug workarounds applied, unused bits cleared), so
//! the key always describes exactly what gets bound.
//!
//! Two fetch paths exist. [`ShaderCache::get_pipeline_for_uid`] compiles whatever is missing
//! on the calling thread. [`ShaderCache::get_pipeline_for_uid_async`] never blocks: it queues
//! work on the [`AsyncShaderCompiler`] and reports [`PipelineStatus::Pending`]. Results are
//! integrated only in [`ShaderCache::retrieve_async_shaders`], on the owning thread.
//!
//! Compile failures leave a `Failed` slot that the next fetch retries. They are never written
//! to disk.

mod persist;
mod precompile;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use flipper_cache_log::{LinearLog, UidLog};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

pub use persist::{cache_file_name, uid_log_file_name, CacheCategory};

use crate::async_compiler::{AsyncShaderCompiler, Retrieve, WorkPriority};
use crate::backend::{
    FramebufferState, PipelineConfig, PipelineUsage, ShaderBackend, ShaderGenerator, ShaderStage,
    StageUid,
};
use crate::caps::{ApiType, Capabilities, HostConfig};
use crate::config::VideoConfig;
use crate::driver_bugs::{apply_driver_bugs, apply_uber_driver_bugs, WorkaroundContext};
use crate::error::CompileError;
use crate::stats::{ShaderCacheStats, ShaderCacheStatsSnapshot};
use crate::uid::{
    BlendingState, DepthState, FixedCodec, GeometryShaderUid, PipelineUid, PixelShaderUid,
    RasterizationState, UberPipelineUid, UberPixelShaderUid, UberVertexShaderUid, VertexLayout,
    VertexShaderUid, VsExpand,
};

/// Result of a non-blocking fetch.
#[derive(Debug)]
pub enum PipelineStatus<P> {
    Ready(Arc<P>),
    /// Compiling in the background; ask again after the next retrieval.
    Pending,
}

impl<P> PipelineStatus<P> {
    pub fn ready(self) -> Option<Arc<P>> {
        match self {
            Self::Ready(pipeline) => Some(pipeline),
            Self::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Observable state of one cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Absent,
    Pending,
    Ready,
    Failed,
}

enum Slot<T> {
    Pending,
    Ready(Arc<T>),
    Failed,
}

impl<T> Slot<T> {
    fn state(&self) -> EntryState {
        match self {
            Self::Pending => EntryState::Pending,
            Self::Ready(_) => EntryState::Ready,
            Self::Failed => EntryState::Failed,
        }
    }
}

pub(crate) struct EntryMap<K, T> {
    map: HashMap<K, Slot<T>>,
    log: Option<LinearLog>,
}

impl<K, T> Default for EntryMap<K, T> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            log: None,
        }
    }
}

impl<K: Eq + Hash, T> EntryMap<K, T> {
    fn ready(&self, key: &K) -> Option<Arc<T>> {
        match self.map.get(key) {
            Some(Slot::Ready(object)) => Some(Arc::clone(object)),
            _ => None,
        }
    }

    fn state(&self, key: &K) -> EntryState {
        self.map.get(key).map_or(EntryState::Absent, Slot::state)
    }

    fn forget_failed(&mut self, key: &K) {
        if matches!(self.map.get(key), Some(Slot::Failed)) {
            self.map.remove(key);
        }
    }

    fn ready_count(&self) -> usize {
        self.map
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.log = None;
    }
}

/// A stage identity with its own entry map and disk category.
pub(crate) trait StageKey: Copy + Eq + Hash + Debug + FixedCodec + Send + 'static {
    const STAGE: ShaderStage;
    const CATEGORY: CacheCategory;

    fn stage_uid(self) -> StageUid;
    fn entries<B: ShaderBackend>(cache: &ShaderCache<B>) -> &EntryMap<Self, B::Shader>;
    fn entries_mut<B: ShaderBackend>(cache: &mut ShaderCache<B>) -> &mut EntryMap<Self, B::Shader>;
}

macro_rules! stage_key {
    ($uid:ty, $variant:ident, $stage:ident, $category:ident, $field:ident) => {
        impl StageKey for $uid {
            const STAGE: ShaderStage = ShaderStage::$stage;
            const CATEGORY: CacheCategory = CacheCategory::$category;

            fn stage_uid(self) -> StageUid {
                StageUid::$variant(self)
            }

            fn entries<B: ShaderBackend>(cache: &ShaderCache<B>) -> &EntryMap<Self, B::Shader> {
                &cache.$field
            }

            fn entries_mut<B: ShaderBackend>(
                cache: &mut ShaderCache<B>,
            ) -> &mut EntryMap<Self, B::Shader> {
                &mut cache.$field
            }
        }
    };
}

stage_key!(VertexShaderUid, Vertex, Vertex, SpecializedVertex, vs);
stage_key!(PixelShaderUid, Pixel, Pixel, SpecializedPixel, ps);
stage_key!(GeometryShaderUid, Geometry, Geometry, Geometry, gs);
stage_key!(UberVertexShaderUid, UberVertex, Vertex, UberVertex, uber_vs);
stage_key!(UberPixelShaderUid, UberPixel, Pixel, UberPixel, uber_ps);

/// The parts shared by specialized and über pipeline identities.
pub(crate) trait PipelineKey: Copy + Eq + Hash + Debug + FixedCodec + Send + 'static {
    type Vs: StageKey;
    type Ps: StageKey;
    const USAGE: PipelineUsage;
    const CATEGORY: CacheCategory;

    fn normalize(&self, ctx: &WorkaroundContext, api: ApiType, host: &HostConfig) -> Self;
    fn vs(&self) -> Self::Vs;
    fn ps(&self) -> Self::Ps;
    fn gs(&self) -> GeometryShaderUid;
    fn vs_expand(&self) -> VsExpand;
    fn vertex_layout(&self) -> Option<VertexLayout>;
    fn rasterization(&self) -> RasterizationState;
    fn depth(&self) -> DepthState;
    fn blending(&self) -> BlendingState;
    fn entries<B: ShaderBackend>(cache: &ShaderCache<B>) -> &EntryMap<Self, B::Pipeline>;
    fn entries_mut<B: ShaderBackend>(cache: &mut ShaderCache<B>)
        -> &mut EntryMap<Self, B::Pipeline>;
}

macro_rules! pipeline_key_accessors {
    ($field:ident) => {
        fn gs(&self) -> GeometryShaderUid {
            self.gs_uid
        }

        fn vs_expand(&self) -> VsExpand {
            self.vs_uid.vs_expand
        }

        fn vertex_layout(&self) -> Option<VertexLayout> {
            self.vertex_layout
        }

        fn rasterization(&self) -> RasterizationState {
            self.rasterization
        }

        fn depth(&self) -> DepthState {
            self.depth
        }

        fn blending(&self) -> BlendingState {
            self.blending
        }

        fn entries<B: ShaderBackend>(cache: &ShaderCache<B>) -> &EntryMap<Self, B::Pipeline> {
            &cache.$field
        }

        fn entries_mut<B: ShaderBackend>(
            cache: &mut ShaderCache<B>,
        ) -> &mut EntryMap<Self, B::Pipeline> {
            &mut cache.$field
        }
    };
}

impl PipelineKey for PipelineUid {
    type Vs = VertexShaderUid;
    type Ps = PixelShaderUid;
    const USAGE: PipelineUsage = PipelineUsage::Specialized;
    const CATEGORY: CacheCategory = CacheCategory::SpecializedPipeline;

    fn normalize(&self, ctx: &WorkaroundContext, api: ApiType, host: &HostConfig) -> Self {
        let mut key = apply_driver_bugs(self, ctx);
        key.ps_uid.clear_unused_bits(api, host);
        key
    }

    fn vs(&self) -> VertexShaderUid {
        self.vs_uid
    }

    fn ps(&self) -> PixelShaderUid {
        self.ps_uid
    }

    pipeline_key_accessors!(pipelines);
}

impl PipelineKey for UberPipelineUid {
    type Vs = UberVertexShaderUid;
    type Ps = UberPixelShaderUid;
    const USAGE: PipelineUsage = PipelineUsage::Uber;
    const CATEGORY: CacheCategory = CacheCategory::UberPipeline;

    fn normalize(&self, ctx: &WorkaroundContext, api: ApiType, host: &HostConfig) -> Self {
        let mut key = apply_uber_driver_bugs(self, ctx);
        key.ps_uid.clear_unused_bits(api, host);
        key
    }

    fn vs(&self) -> UberVertexShaderUid {
        self.vs_uid
    }

    fn ps(&self) -> UberPixelShaderUid {
        self.ps_uid
    }

    pipeline_key_accessors!(uber_pipelines);
}

enum Availability<S> {
    Ready(Arc<S>),
    Waiting,
    Failed,
}

fn uid_digest<K: FixedCodec>(uid: &K) -> u64 {
    xxh3_64(&uid.to_bytes())
}

pub struct ShaderCache<B: ShaderBackend> {
    backend: Arc<B>,
    generator: Arc<dyn ShaderGenerator>,
    caps: Capabilities,
    config: VideoConfig,
    host: HostConfig,
    workarounds: WorkaroundContext,
    framebuffer: FramebufferState,
    compiler: AsyncShaderCompiler<ShaderCache<B>>,
    stats: Arc<ShaderCacheStats>,

    vs: EntryMap<VertexShaderUid, B::Shader>,
    ps: EntryMap<PixelShaderUid, B::Shader>,
    gs: EntryMap<GeometryShaderUid, B::Shader>,
    uber_vs: EntryMap<UberVertexShaderUid, B::Shader>,
    uber_ps: EntryMap<UberPixelShaderUid, B::Shader>,
    pipelines: EntryMap<PipelineUid, B::Pipeline>,
    uber_pipelines: EntryMap<UberPipelineUid, B::Pipeline>,

    /// Raw identities ever requested or loaded from the identity log.
    known_pipeline_uids: HashSet<PipelineUid>,
    uid_log: Option<UidLog>,
}

impl<B: ShaderBackend> ShaderCache<B> {
    /// Creates an empty cache. Nothing is loaded or compiled until [`Self::initialize`].
    pub fn new(
        backend: Arc<B>,
        generator: Arc<dyn ShaderGenerator>,
        caps: Capabilities,
        config: VideoConfig,
    ) -> Self {
        let host = HostConfig::new(&caps, &config);
        let workarounds = WorkaroundContext::new(&caps, &host);
        let framebuffer = FramebufferState {
            samples: config.msaa_samples.max(1),
            per_sample_shading: config.ssaa && config.msaa_samples > 1,
            ..FramebufferState::default()
        };
        Self {
            backend,
            generator,
            caps,
            config,
            host,
            workarounds,
            framebuffer,
            compiler: AsyncShaderCompiler::new(),
            stats: Arc::new(ShaderCacheStats::new()),
            vs: EntryMap::default(),
            ps: EntryMap::default(),
            gs: EntryMap::default(),
            uber_vs: EntryMap::default(),
            uber_ps: EntryMap::default(),
            pipelines: EntryMap::default(),
            uber_pipelines: EntryMap::default(),
            known_pipeline_uids: HashSet::new(),
            uid_log: None,
        }
    }

    /// Loads disk caches, queues precompilation and switches to the runtime worker count.
    pub fn initialize(&mut self) {
        let bugs = self.caps.driver_bugs();
        self.compiler
            .resize_worker_threads(self.config.shader_precompiler_thread_count(&self.caps, bugs));

        if self.config.shader_cache {
            self.load_caches();
            self.load_uid_log();
        }

        if self.config.can_precompile_uber_shaders(&self.caps) {
            self.queue_uber_shader_pipelines();
        }

        self.compile_missing_pipelines();
        if self.config.wait_for_shaders_before_starting {
            self.wait_for_async_compiler(|_, _| {});
        }

        self.compiler
            .resize_worker_threads(self.config.shader_compiler_thread_count(&self.caps, bugs));
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn host_config(&self) -> HostConfig {
        self.host
    }

    pub fn framebuffer_state(&self) -> FramebufferState {
        self.framebuffer
    }

    pub fn config(&self) -> &VideoConfig {
        &self.config
    }

    pub fn stats(&self) -> ShaderCacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn compiler_worker_count(&self) -> usize {
        self.compiler.worker_count()
    }

    pub fn has_pending_work(&self) -> bool {
        self.compiler.has_pending_work() || self.compiler.has_completed_work()
    }

    pub fn known_pipeline_uid_count(&self) -> usize {
        self.known_pipeline_uids.len()
    }

    pub fn ready_pipeline_count(&self) -> usize {
        self.pipelines.ready_count()
    }

    pub fn ready_uber_pipeline_count(&self) -> usize {
        self.uber_pipelines.ready_count()
    }

    /// State of the entry `uid` maps to after normalization.
    pub fn pipeline_state(&self, uid: &PipelineUid) -> EntryState {
        let key = self.normalize(uid);
        self.pipelines.state(&key)
    }

    pub fn uber_pipeline_state(&self, uid: &UberPipelineUid) -> EntryState {
        let key = self.normalize(uid);
        self.uber_pipelines.state(&key)
    }

    /// Driver-bug workarounds plus unused-bit clearing: the identity actually compiled.
    pub fn normalize_uid(&self, uid: &PipelineUid) -> PipelineUid {
        self.normalize(uid)
    }

    fn normalize<P: PipelineKey>(&self, uid: &P) -> P {
        uid.normalize(&self.workarounds, self.caps.api, &self.host)
    }

    /// Returns the pipeline for `uid`, compiling anything missing on this thread.
    ///
    /// `None` only if a stage or the pipeline itself failed to compile.
    pub fn get_pipeline_for_uid(&mut self, uid: &PipelineUid) -> Option<Arc<B::Pipeline>> {
        let key = self.normalize(uid);
        self.note_pipeline_uid(uid);
        self.fetch_sync(key)
    }

    /// Returns the pipeline if it is ready, otherwise queues it and returns
    /// [`PipelineStatus::Pending`] without blocking.
    pub fn get_pipeline_for_uid_async(&mut self, uid: &PipelineUid) -> PipelineStatus<B::Pipeline> {
        let key = self.normalize(uid);
        self.note_pipeline_uid(uid);
        self.fetch_async(key, WorkPriority::OnDemand)
    }

    pub fn get_uber_pipeline_for_uid(&mut self, uid: &UberPipelineUid) -> Option<Arc<B::Pipeline>> {
        let key = self.normalize(uid);
        self.fetch_sync(key)
    }

    pub fn get_uber_pipeline_for_uid_async(
        &mut self,
        uid: &UberPipelineUid,
    ) -> PipelineStatus<B::Pipeline> {
        let key = self.normalize(uid);
        self.fetch_async(key, WorkPriority::OnDemand)
    }

    /// Integrates finished background work. Call once per frame on the owning thread.
    pub fn retrieve_async_shaders(&mut self) {
        for retrieve in self.compiler.take_completed() {
            retrieve(self);
        }
    }

    /// Blocks until all background work, including work queued by retrieval, has finished and
    /// been integrated.
    pub fn wait_for_async_compiler(&mut self, mut progress: impl FnMut(usize, usize)) {
        while self.compiler.has_pending_work() || self.compiler.has_completed_work() {
            self.compiler.wait_until_completion(&mut progress);
            self.retrieve_async_shaders();
        }
    }

    /// Drops everything and rebuilds from disk with the current settings.
    pub fn reload(&mut self) {
        self.wait_for_async_compiler(|_, _| {});
        self.close_uid_log();
        self.clear_caches();
        self.initialize();
    }

    /// Switches to new generated-source settings, reloading if anything changed.
    pub fn set_host_config(&mut self, host: HostConfig) {
        if host == self.host {
            return;
        }
        debug!(from = self.host.bits(), to = host.bits(), "host config changed, reloading shaders");
        self.host = host;
        self.workarounds = WorkaroundContext::new(&self.caps, &self.host);
        self.reload();
    }

    pub fn set_framebuffer_state(&mut self, framebuffer: FramebufferState) {
        if framebuffer == self.framebuffer {
            return;
        }
        self.framebuffer = framebuffer;
        self.reload();
    }

    /// Stops background compilation without waiting for queued work.
    pub fn shutdown(&mut self) {
        self.compiler.stop_worker_threads();
        self.compiler.clear_pending_work();
        drop(self.compiler.take_completed());
        self.close_uid_log();
        for log in self.open_logs_mut() {
            if let Err(err) = log.sync() {
                warn!(path = %log.path().display(), error = %err, "failed to sync shader cache log");
            }
        }
    }

    fn clear_caches(&mut self) {
        self.compiler.stop_worker_threads();
        self.compiler.clear_pending_work();
        drop(self.compiler.take_completed());

        self.vs.clear();
        self.ps.clear();
        self.gs.clear();
        self.uber_vs.clear();
        self.uber_ps.clear();
        self.pipelines.clear();
        self.uber_pipelines.clear();
    }

    fn open_logs_mut(&mut self) -> impl Iterator<Item = &mut LinearLog> {
        [
            self.vs.log.as_mut(),
            self.ps.log.as_mut(),
            self.gs.log.as_mut(),
            self.uber_vs.log.as_mut(),
            self.uber_ps.log.as_mut(),
            self.pipelines.log.as_mut(),
            self.uber_pipelines.log.as_mut(),
        ]
        .into_iter()
        .flatten()
    }

    fn note_pipeline_uid(&mut self, uid: &PipelineUid) {
        if !self.known_pipeline_uids.insert(*uid) {
            return;
        }
        if let Some(log) = self.uid_log.as_mut() {
            if let Err(err) = log.append(&uid.to_bytes()) {
                warn!(path = %log.path().display(), error = %err, "failed to append pipeline uid");
            }
        }
    }

    fn needs_geometry_stage<P: PipelineKey>(&self, key: &P) -> bool {
        self.host.backend_geometry_shaders
            && key.vs_expand() == VsExpand::None
            && !key.gs().is_passthrough(&self.host)
    }

    fn forget_failed_stages<P: PipelineKey>(&mut self, key: &P) {
        P::Vs::entries_mut(self).forget_failed(&key.vs());
        P::Ps::entries_mut(self).forget_failed(&key.ps());
        self.gs.forget_failed(&key.gs());
    }

    fn fetch_sync<P: PipelineKey>(&mut self, key: P) -> Option<Arc<B::Pipeline>> {
        if let Some(pipeline) = P::entries(self).ready(&key) {
            self.stats.inc_hits();
            return Some(pipeline);
        }
        self.stats.inc_misses();

        self.forget_failed_stages(&key);
        let result = self
            .pipeline_config_sync(&key)
            .and_then(|config| self.backend.create_pipeline(&config, None));
        self.insert_pipeline(key, result)
    }

    fn fetch_async<P: PipelineKey>(
        &mut self,
        key: P,
        priority: WorkPriority,
    ) -> PipelineStatus<B::Pipeline> {
        match P::entries(self).map.get(&key) {
            Some(Slot::Ready(pipeline)) => {
                self.stats.inc_hits();
                return PipelineStatus::Ready(Arc::clone(pipeline));
            }
            Some(Slot::Pending) => return PipelineStatus::Pending,
            Some(Slot::Failed) | None => {}
        }
        self.stats.inc_misses();
        self.forget_failed_stages(&key);
        self.queue_pipeline_compile(key, priority);
        PipelineStatus::Pending
    }

    fn shader_sync<K: StageKey>(&mut self, uid: K) -> Option<Arc<B::Shader>> {
        if let Some(shader) = K::entries(self).ready(&uid) {
            return Some(shader);
        }
        let source = self
            .generator
            .generate(self.caps.api, &self.host, &uid.stage_uid());
        let result = self.backend.compile_shader(K::STAGE, &source);
        self.insert_shader(uid, result)
    }

    /// Compiles any missing stage now and assembles the pipeline description.
    fn pipeline_config_sync<P: PipelineKey>(
        &mut self,
        key: &P,
    ) -> Result<PipelineConfig<B::Shader>, CompileError> {
        let vs = self
            .shader_sync(key.vs())
            .ok_or(CompileError::MissingStage(ShaderStage::Vertex))?;
        let gs = if self.needs_geometry_stage(key) {
            Some(
                self.shader_sync(key.gs())
                    .ok_or(CompileError::MissingStage(ShaderStage::Geometry))?,
            )
        } else {
            None
        };
        let ps = self
            .shader_sync(key.ps())
            .ok_or(CompileError::MissingStage(ShaderStage::Pixel))?;
        Ok(self.make_config(key, vs, gs, ps))
    }

    fn make_config<P: PipelineKey>(
        &self,
        key: &P,
        vertex_shader: Arc<B::Shader>,
        geometry_shader: Option<Arc<B::Shader>>,
        pixel_shader: Arc<B::Shader>,
    ) -> PipelineConfig<B::Shader> {
        PipelineConfig {
            usage: P::USAGE,
            vertex_layout: key.vertex_layout(),
            vertex_shader,
            geometry_shader,
            pixel_shader,
            rasterization: key.rasterization(),
            depth: key.depth(),
            blending: key.blending(),
            framebuffer: self.framebuffer,
        }
    }

    fn insert_shader<K: StageKey>(
        &mut self,
        uid: K,
        result: Result<B::Shader, CompileError>,
    ) -> Option<Arc<B::Shader>> {
        let shader = match result {
            Ok(shader) => shader,
            Err(err) => {
                warn!(stage = ?K::STAGE, uid = uid_digest(&uid), error = %err, "shader compile failed");
                self.stats.inc_compile_failures();
                let entries = K::entries_mut(self);
                if let Some(existing) = entries.ready(&uid) {
                    return Some(existing);
                }
                entries.map.insert(uid, Slot::Failed);
                return None;
            }
        };

        self.stats.inc_shader_compiles();
        let binary = if self.caps.supports_shader_binaries {
            self.backend.shader_binary(&shader)
        } else {
            None
        };

        let entries = K::entries_mut(self);
        if let Some(existing) = entries.ready(&uid) {
            return Some(existing);
        }
        if let (Some(log), Some(binary)) = (entries.log.as_mut(), binary) {
            if !binary.is_empty() {
                if let Err(err) = log.append(&uid.to_bytes(), &binary) {
                    warn!(path = %log.path().display(), error = %err, "failed to append shader binary");
                }
            }
        }
        let shader = Arc::new(shader);
        entries.map.insert(uid, Slot::Ready(Arc::clone(&shader)));
        Some(shader)
    }

    fn insert_pipeline<P: PipelineKey>(
        &mut self,
        key: P,
        result: Result<B::Pipeline, CompileError>,
    ) -> Option<Arc<B::Pipeline>> {
        let pipeline = match result {
            Ok(pipeline) => pipeline,
            Err(err) => {
                warn!(usage = ?P::USAGE, uid = uid_digest(&key), error = %err, "pipeline compile failed");
                self.stats.inc_compile_failures();
                let entries = P::entries_mut(self);
                if let Some(existing) = entries.ready(&key) {
                    return Some(existing);
                }
                entries.map.insert(key, Slot::Failed);
                return None;
            }
        };

        self.stats.inc_pipeline_compiles();
        let cache_data = if self.caps.supports_pipeline_cache_data {
            self.backend.pipeline_cache_data(&pipeline)
        } else {
            None
        };

        let entries = P::entries_mut(self);
        if let Some(existing) = entries.ready(&key) {
            return Some(existing);
        }
        if let (Some(log), Some(data)) = (entries.log.as_mut(), cache_data) {
            if !data.is_empty() {
                if let Err(err) = log.append(&key.to_bytes(), &data) {
                    warn!(path = %log.path().display(), error = %err, "failed to append pipeline cache data");
                }
            }
        }
        let pipeline = Arc::new(pipeline);
        entries.map.insert(key, Slot::Ready(Arc::clone(&pipeline)));
        Some(pipeline)
    }

    fn shader_async<K: StageKey>(&mut self, uid: K, priority: WorkPriority) -> Availability<B::Shader> {
        let availability = match K::entries(self).map.get(&uid) {
            Some(Slot::Ready(shader)) => Some(Availability::Ready(Arc::clone(shader))),
            Some(Slot::Pending) => Some(Availability::Waiting),
            Some(Slot::Failed) => Some(Availability::Failed),
            None => None,
        };
        availability.unwrap_or_else(|| {
            self.queue_shader_compile(uid, priority);
            Availability::Waiting
        })
    }

    fn queue_shader_compile<K: StageKey>(&mut self, uid: K, priority: WorkPriority) {
        K::entries_mut(self).map.insert(uid, Slot::Pending);

        let backend = Arc::clone(&self.backend);
        let generator = Arc::clone(&self.generator);
        let api = self.caps.api;
        let host = self.host;
        self.compiler.queue_work_item(
            Box::new(move || -> Retrieve<Self> {
                let source = generator.generate(api, &host, &uid.stage_uid());
                let result = backend.compile_shader(K::STAGE, &source);
                Box::new(move |cache: &mut Self| {
                    cache.insert_shader(uid, result);
                })
            }),
            priority,
        );
    }

    /// Queues `key` once its stages are available.
    ///
    /// Missing stages are queued first and the pipeline retries after the next retrieval; it
    /// never waits on a worker. A stage that failed fails the pipeline instead of retrying, so
    /// a broken stage cannot keep the queue busy.
    fn queue_pipeline_compile<P: PipelineKey>(&mut self, key: P, priority: WorkPriority) {
        P::entries_mut(self).map.insert(key, Slot::Pending);

        let vs = self.shader_async(key.vs(), priority);
        let gs = if self.needs_geometry_stage(&key) {
            Some(self.shader_async(key.gs(), priority))
        } else {
            None
        };
        let ps = self.shader_async(key.ps(), priority);

        let failed_stage = match (&vs, &gs, &ps) {
            (Availability::Failed, _, _) => Some(ShaderStage::Vertex),
            (_, Some(Availability::Failed), _) => Some(ShaderStage::Geometry),
            (_, _, Availability::Failed) => Some(ShaderStage::Pixel),
            _ => None,
        };
        if let Some(stage) = failed_stage {
            self.insert_pipeline(key, Err(CompileError::MissingStage(stage)));
            return;
        }

        let stages = match (vs, gs, ps) {
            (Availability::Ready(vs), None, Availability::Ready(ps)) => Some((vs, None, ps)),
            (Availability::Ready(vs), Some(Availability::Ready(gs)), Availability::Ready(ps)) => {
                Some((vs, Some(gs), ps))
            }
            _ => None,
        };
        let Some((vs, gs, ps)) = stages else {
            self.compiler.queue_work_item(
                Box::new(move || -> Retrieve<Self> {
                    Box::new(move |cache: &mut Self| cache.retry_pipeline_compile(key, priority))
                }),
                priority,
            );
            return;
        };

        let config = self.make_config(&key, vs, gs, ps);
        let backend = Arc::clone(&self.backend);
        self.compiler.queue_work_item(
            Box::new(move || -> Retrieve<Self> {
                let result = backend.create_pipeline(&config, None);
                Box::new(move |cache: &mut Self| {
                    cache.insert_pipeline(key, result);
                })
            }),
            priority,
        );
    }

    fn retry_pipeline_compile<P: PipelineKey>(&mut self, key: P, priority: WorkPriority) {
        // A synchronous fetch may have produced the pipeline in the meantime.
        if P::entries(self).state(&key) == EntryState::Pending {
            self.queue_pipeline_compile(key, priority);
        }
    }
}

impl<B: ShaderBackend> Drop for ShaderCache<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
