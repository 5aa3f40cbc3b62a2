//! Disk logs for compiled stages, pipeline cache data and requested pipeline identities.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use flipper_cache_log::{DiscardReason, LinearLog, LogHeader, OpenOutcome, UidLog};
use tracing::{debug, info, warn};

use super::{EntryMap, PipelineKey, ShaderCache, Slot, StageKey};
use crate::backend::ShaderBackend;
use crate::caps::{ApiType, HostConfig};
use crate::uid::{
    FixedCodec, GeometryShaderUid, PipelineUid, PixelShaderUid, UberPipelineUid,
    UberPixelShaderUid, UberVertexShaderUid, VertexShaderUid, UID_SCHEMA_VERSION,
};

/// One on-disk log per category and host configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    UberVertex,
    UberPixel,
    Geometry,
    SpecializedVertex,
    SpecializedPixel,
    SpecializedPipeline,
    UberPipeline,
}

impl CacheCategory {
    pub const ALL: [Self; 7] = [
        Self::UberVertex,
        Self::UberPixel,
        Self::Geometry,
        Self::SpecializedVertex,
        Self::SpecializedPixel,
        Self::SpecializedPipeline,
        Self::UberPipeline,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::UberVertex => "uber-vs",
            Self::UberPixel => "uber-ps",
            Self::Geometry => "gs",
            Self::SpecializedVertex => "specialized-vs",
            Self::SpecializedPixel => "specialized-ps",
            Self::SpecializedPipeline => "specialized-pipeline",
            Self::UberPipeline => "ubershader-pipeline",
        }
    }

    /// Specialized programs depend on what a particular game draws; über programs do not.
    pub fn is_game_specific(self) -> bool {
        matches!(
            self,
            Self::SpecializedVertex | Self::SpecializedPixel | Self::SpecializedPipeline
        )
    }

    pub fn holds_pipelines(self) -> bool {
        matches!(self, Self::SpecializedPipeline | Self::UberPipeline)
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `{api}-{game}-{category}-{host bits}.cache`, or `None` for a game-specific category
/// without a game.
pub fn cache_file_name(
    api: ApiType,
    game_id: Option<&str>,
    category: CacheCategory,
    host: &HostConfig,
) -> Option<String> {
    let bits = host.bits();
    if category.is_game_specific() {
        let game_id = game_id?;
        Some(format!("{}-{game_id}-{category}-{bits:08x}.cache", api.tag()))
    } else {
        Some(format!("{}-{category}-{bits:08x}.cache", api.tag()))
    }
}

pub fn uid_log_file_name(game_id: &str) -> String {
    format!("{game_id}.uidcache")
}

impl<B: ShaderBackend> ShaderCache<B> {
    fn category_enabled(&self, category: CacheCategory) -> bool {
        if !self.config.shader_cache {
            return false;
        }
        match category {
            CacheCategory::SpecializedPipeline | CacheCategory::UberPipeline => {
                self.caps.supports_pipeline_cache_data
            }
            CacheCategory::Geometry => {
                self.caps.supports_shader_binaries && self.host.backend_geometry_shaders
            }
            _ => self.caps.supports_shader_binaries,
        }
    }

    fn category_path(&self, category: CacheCategory) -> Option<PathBuf> {
        if !self.category_enabled(category) {
            return None;
        }
        let name = cache_file_name(
            self.caps.api,
            self.config.game_id.as_deref(),
            category,
            &self.host,
        )?;
        Some(self.config.cache_dir.join(name))
    }

    fn open_category_log(&self, category: CacheCategory) -> Option<(LinearLog, Vec<(Vec<u8>, Vec<u8>)>)> {
        let path = self.category_path(category)?;
        let header = LogHeader::new(UID_SCHEMA_VERSION, self.caps.fingerprint());
        let opened = match LinearLog::open(&path, header) {
            Ok(opened) => opened,
            Err(err) => {
                warn!(%category, path = %path.display(), error = %err, "shader cache disabled for category");
                return None;
            }
        };
        if let OpenOutcome::Discarded(reason) = opened.outcome {
            info!(%category, %reason, "stale shader cache discarded");
            self.stats.inc_discarded_logs();
        }
        let records = opened
            .records
            .into_iter()
            .map(|record| (record.key, record.value))
            .collect();
        Some((opened.log, records))
    }

    /// Opens every enabled category log and replays it into memory.
    pub(super) fn load_caches(&mut self) {
        self.load_stage_log::<UberVertexShaderUid>();
        self.load_stage_log::<UberPixelShaderUid>();
        self.load_stage_log::<GeometryShaderUid>();
        self.load_stage_log::<VertexShaderUid>();
        self.load_stage_log::<PixelShaderUid>();
        self.load_pipeline_log::<UberPipelineUid>();
        self.load_pipeline_log::<PipelineUid>();
    }

    /// All-or-nothing: a single undecodable key or rejected binary discards the whole log, so
    /// nothing from a half-valid file ever reaches the maps.
    fn load_stage_log<K: StageKey>(&mut self) {
        let Some((mut log, records)) = self.open_category_log(K::CATEGORY) else {
            return;
        };

        let mut loaded = Vec::with_capacity(records.len());
        let mut rejected = false;
        for (key, binary) in &records {
            let shader = K::from_bytes(key)
                .map_err(|err| err.to_string())
                .and_then(|uid| {
                    self.backend
                        .create_shader_from_binary(K::STAGE, binary)
                        .map(|shader| (uid, shader))
                        .map_err(|err| err.to_string())
                });
            match shader {
                Ok(entry) => loaded.push(entry),
                Err(err) => {
                    warn!(category = %K::CATEGORY, error = %err, "rejecting shader cache record");
                    rejected = true;
                    break;
                }
            }
        }

        if rejected {
            self.discard_log(&mut log, K::CATEGORY);
            K::entries_mut(self).log = Some(log);
            return;
        }

        let count = loaded.len();
        let entries = K::entries_mut(self);
        for (uid, shader) in loaded {
            entries.map.insert(uid, Slot::Ready(Arc::new(shader)));
        }
        entries.log = Some(log);
        self.stats.add_disk_loads(count as u64);
        debug!(category = %K::CATEGORY, count, "loaded shader cache");
    }

    fn load_pipeline_log<P: PipelineKey>(&mut self) {
        let Some((mut log, records)) = self.open_category_log(P::CATEGORY) else {
            return;
        };

        let mut loaded = Vec::with_capacity(records.len());
        let mut rejected = false;
        for (key, data) in &records {
            let pipeline = P::from_bytes(key)
                .map_err(|err| err.to_string())
                .and_then(|raw| {
                    let key = self.normalize(&raw);
                    self.pipeline_config_sync(&key)
                        .and_then(|config| self.backend.create_pipeline(&config, Some(data)))
                        .map(|pipeline| (key, pipeline))
                        .map_err(|err| err.to_string())
                });
            match pipeline {
                Ok(entry) => loaded.push(entry),
                Err(err) => {
                    warn!(category = %P::CATEGORY, error = %err, "rejecting pipeline cache record");
                    rejected = true;
                    break;
                }
            }
        }

        if rejected {
            self.discard_log(&mut log, P::CATEGORY);
            P::entries_mut(self).log = Some(log);
            return;
        }

        let count = loaded.len();
        let entries: &mut EntryMap<P, B::Pipeline> = P::entries_mut(self);
        for (key, pipeline) in loaded {
            entries.map.insert(key, Slot::Ready(Arc::new(pipeline)));
        }
        entries.log = Some(log);
        self.stats.add_disk_loads(count as u64);
        debug!(category = %P::CATEGORY, count, "loaded pipeline cache");
    }

    fn discard_log(&self, log: &mut LinearLog, category: CacheCategory) {
        self.stats.inc_discarded_logs();
        if let Err(err) = log.discard(DiscardReason::Rejected) {
            warn!(%category, path = %log.path().display(), error = %err, "failed to reset shader cache log");
        }
    }

    /// Replays the identity log so pipelines requested in earlier sessions are compiled ahead
    /// of their first use.
    pub(super) fn load_uid_log(&mut self) {
        let Some(game_id) = self.config.game_id.as_deref() else {
            return;
        };
        let path = self.config.cache_dir.join(uid_log_file_name(game_id));
        let opened = match UidLog::open(&path, UID_SCHEMA_VERSION, PipelineUid::SERIALIZED_LEN) {
            Ok(opened) => opened,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "pipeline identity log disabled");
                return;
            }
        };
        if let OpenOutcome::Discarded(reason) = opened.outcome {
            info!(%reason, "stale pipeline identity log discarded");
            self.stats.inc_discarded_logs();
        }

        let mut skipped = 0usize;
        for record in &opened.records {
            match PipelineUid::from_bytes(record) {
                Ok(uid) => {
                    self.known_pipeline_uids.insert(uid);
                }
                Err(err) => {
                    skipped += 1;
                    debug!(error = %err, "skipping undecodable pipeline identity");
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, path = %path.display(), "pipeline identity log held undecodable records");
        }
        self.uid_log = Some(opened.log);
    }

    pub(super) fn close_uid_log(&mut self) {
        if let Some(mut log) = self.uid_log.take() {
            if let Err(err) = log.sync() {
                warn!(path = %log.path().display(), error = %err, "failed to sync pipeline identity log");
            }
        }
    }
}
