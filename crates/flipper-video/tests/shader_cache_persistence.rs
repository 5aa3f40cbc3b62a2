use std::fs;
use std::path::Path;
use std::sync::Arc;

use flipper_video::backend::{NullShaderBackend, NullShaderGenerator};
use flipper_video::shader_cache::EntryState;
use flipper_video::uid::{
    BlendingState, DepthState, GeometryShaderUid, PipelineUid, PixelShaderUid, PrimitiveType,
    RasterizationState, VertexLayout, VertexShaderUid,
};
use flipper_video::{ShaderCache, VideoConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn disk_config(dir: &Path) -> VideoConfig {
    VideoConfig {
        shader_cache: true,
        cache_dir: dir.to_path_buf(),
        game_id: Some("GFLP01".to_string()),
        shader_compiler_threads: 0,
        shader_precompiler_threads: 0,
        ..VideoConfig::default()
    }
}

fn open(backend: &Arc<NullShaderBackend>, config: VideoConfig) -> ShaderCache<NullShaderBackend> {
    let mut cache = ShaderCache::new(
        Arc::clone(backend),
        Arc::new(NullShaderGenerator),
        NullShaderBackend::capabilities(),
        config,
    );
    cache.initialize();
    cache
}

fn uid(combiners: u64) -> PipelineUid {
    PipelineUid {
        vertex_layout: Some(VertexLayout::position_only()),
        vs_uid: VertexShaderUid {
            num_texgens: 2,
            ..VertexShaderUid::default()
        },
        gs_uid: GeometryShaderUid {
            num_texgens: 2,
            ..GeometryShaderUid::default()
        },
        ps_uid: PixelShaderUid {
            num_texgens: 2,
            combiners,
            ..PixelShaderUid::default()
        },
        rasterization: RasterizationState::cull_back(PrimitiveType::Triangles),
        depth: DepthState::always_write(),
        blending: BlendingState::no_blending(),
    }
}

fn cache_files(dir: &Path, suffix: &str) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.to_string_lossy().ends_with(suffix))
        .collect();
    files.sort();
    files
}

#[test]
fn pipelines_reload_from_disk_without_compiling() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let first = Arc::new(NullShaderBackend::new());
    {
        let mut cache = open(&first, disk_config(dir.path()));
        let pipeline = cache.get_pipeline_for_uid(&uid(7)).unwrap();
        assert!(!pipeline.from_cache);
        assert_eq!(first.shader_compiles(), 2);
    }
    assert_eq!(cache_files(dir.path(), ".uidcache").len(), 1);

    let second = Arc::new(NullShaderBackend::new());
    let mut cache = open(&second, disk_config(dir.path()));
    assert_eq!(cache.pipeline_state(&uid(7)), EntryState::Ready);
    let pipeline = cache.get_pipeline_for_uid(&uid(7)).unwrap();
    assert!(pipeline.from_cache);
    assert_eq!(second.shader_compiles(), 0);
    assert_eq!(second.shader_binary_loads(), 2);
    assert_eq!(second.pipelines_created(), 0);
    assert_eq!(cache.stats().disk_loads, 3);
}

#[test]
fn corrupted_logs_are_discarded_and_rebuilt() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let first = Arc::new(NullShaderBackend::new());
    {
        let mut cache = open(&first, disk_config(dir.path()));
        cache.get_pipeline_for_uid(&uid(1)).unwrap();
    }

    for path in cache_files(dir.path(), ".cache") {
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
    }

    let second = Arc::new(NullShaderBackend::new());
    let mut cache = open(&second, disk_config(dir.path()));
    cache.wait_for_async_compiler(|_, _| {});
    assert!(cache.stats().discarded_logs >= 3);
    assert_eq!(second.shader_binary_loads(), 0);
    assert_eq!(second.pipelines_from_cache(), 0);

    // The identity log survived, so the pipeline was rebuilt from source during startup.
    let pipeline = cache.get_pipeline_for_uid(&uid(1)).unwrap();
    assert!(!pipeline.from_cache);
    assert_eq!(second.shader_compiles(), 2);
}

#[test]
fn identity_log_prewarms_pipelines_at_startup() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let first = Arc::new(NullShaderBackend::new());
    {
        let mut cache = open(&first, disk_config(dir.path()));
        for combiners in 0..4 {
            cache.get_pipeline_for_uid(&uid(combiners)).unwrap();
        }
        assert_eq!(cache.known_pipeline_uid_count(), 4);
    }
    for path in cache_files(dir.path(), ".cache") {
        fs::remove_file(path).unwrap();
    }

    let second = Arc::new(NullShaderBackend::new());
    let config = VideoConfig {
        wait_for_shaders_before_starting: true,
        ..disk_config(dir.path())
    };
    let cache = open(&second, config);
    assert_eq!(cache.known_pipeline_uid_count(), 4);
    assert_eq!(cache.ready_pipeline_count(), 4);
    assert_eq!(second.pipelines_created(), 4);
    assert!(!cache.has_pending_work());
}

#[test]
fn disabled_shader_cache_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(NullShaderBackend::new());
    let config = VideoConfig {
        shader_cache: false,
        ..disk_config(dir.path())
    };
    let mut cache = open(&backend, config);
    cache.get_pipeline_for_uid(&uid(3)).unwrap();
    drop(cache);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn stats_serialize_for_telemetry() {
    let backend = Arc::new(NullShaderBackend::new());
    let dir = tempfile::tempdir().unwrap();
    let mut cache = open(&backend, disk_config(dir.path()));
    cache.get_pipeline_for_uid(&uid(9)).unwrap();
    cache.get_pipeline_for_uid(&uid(9)).unwrap();

    let json = serde_json::to_value(cache.stats()).unwrap();
    assert_eq!(json["pipeline_compiles"], 1);
    assert_eq!(json["shader_compiles"], 2);
    assert!(json["hits"].as_u64().unwrap() >= 1);
}
