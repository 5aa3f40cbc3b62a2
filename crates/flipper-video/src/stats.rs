use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of shader cache counters, suitable for profiling/telemetry.
/// Serializes to JSON for hosts that forward telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShaderCacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub shader_compiles: u64,
    pub pipeline_compiles: u64,
    pub compile_failures: u64,
    pub disk_loads: u64,
    pub discarded_logs: u64,
}

/// Counters updated by the shader cache.
///
/// Cheap to bump from the GPU thread and readable from any thread.
#[derive(Debug, Default)]
pub struct ShaderCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    shader_compiles: AtomicU64,
    pipeline_compiles: AtomicU64,
    compile_failures: AtomicU64,
    disk_loads: AtomicU64,
    discarded_logs: AtomicU64,
}

impl ShaderCacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_shader_compiles(&self) {
        self.shader_compiles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pipeline_compiles(&self) {
        self.pipeline_compiles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_compile_failures(&self) {
        self.compile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_disk_loads(&self, count: u64) {
        self.disk_loads.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_discarded_logs(&self) {
        self.discarded_logs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ShaderCacheStatsSnapshot {
        ShaderCacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            shader_compiles: self.shader_compiles.load(Ordering::Relaxed),
            pipeline_compiles: self.pipeline_compiles.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            disk_loads: self.disk_loads.load(Ordering::Relaxed),
            discarded_logs: self.discarded_logs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_json_contains_counters() {
        let stats = ShaderCacheStats::new();
        stats.inc_hits();
        stats.inc_hits();
        stats.add_disk_loads(5);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"hits\":2"));
        assert!(json.contains("\"disk_loads\":5"));
        assert!(json.contains("\"misses\":0"));
    }
}
