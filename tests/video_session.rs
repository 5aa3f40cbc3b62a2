//! A video session wires the shader cache, the EFB and TMEM together the way a backend does at
//! startup, across a settings change and through a save state.

use std::fs;
use std::sync::Arc;

use flipper_cache_log::UidLog;
use flipper_video::backend::{NullShaderBackend, NullShaderGenerator};
use flipper_video::efb::{EfbSettings, FramebufferManager, SoftwareEfbDevice};
use flipper_video::tmem::{TextureUnits, Tmem, TmemRegister};
use flipper_video::uid::{
    BlendingState, DepthState, FixedCodec, GeometryShaderUid, PipelineUid, PixelShaderUid,
    PrimitiveType, RasterizationState, VertexLayout, VertexShaderUid, UID_SCHEMA_VERSION,
};
use flipper_video::{ShaderCache, VideoConfig};
use pretty_assertions::assert_eq;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn uid(combiners: u64) -> PipelineUid {
    PipelineUid {
        vertex_layout: Some(VertexLayout::position_only()),
        vs_uid: VertexShaderUid::default(),
        gs_uid: GeometryShaderUid::default(),
        ps_uid: PixelShaderUid {
            combiners,
            ..PixelShaderUid::default()
        },
        rasterization: RasterizationState::cull_back(PrimitiveType::Triangles),
        depth: DepthState::always_write(),
        blending: BlendingState::no_blending(),
    }
}

fn session_config(cache_dir: &std::path::Path) -> VideoConfig {
    let json = serde_json::json!({
        "shader_cache": true,
        "cache_dir": cache_dir,
        "game_id": "GFLP01",
        "shader_compiler_threads": 0,
        "shader_precompiler_threads": 0,
        "msaa_samples": 4,
        "ssaa": true,
    });
    serde_json::from_value(json).unwrap()
}

#[test]
fn pipelines_follow_the_efb_shape_across_a_settings_change() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(dir.path());
    let caps = NullShaderBackend::capabilities();

    let mut efb = FramebufferManager::new(
        SoftwareEfbDevice::new(caps.uses_lower_left_origin),
        caps.clone(),
        EfbSettings::from(&config),
    )
    .unwrap();
    let backend = Arc::new(NullShaderBackend::new());
    let mut cache = ShaderCache::new(
        Arc::clone(&backend),
        Arc::new(NullShaderGenerator),
        caps,
        config,
    );
    cache.initialize();
    assert_eq!(cache.framebuffer_state(), efb.framebuffer_state());

    let multisampled = cache.get_pipeline_for_uid(&uid(1)).unwrap();

    efb.recreate(1, 1).unwrap();
    cache.set_framebuffer_state(efb.framebuffer_state());
    cache.wait_for_async_compiler(|_, _| {});
    assert!(!cache.framebuffer_state().per_sample_shading);

    let single = cache.get_pipeline_for_uid(&uid(1)).unwrap();
    assert_ne!(multisampled.digest, single.digest);
    cache.get_pipeline_for_uid(&uid(2)).unwrap();
    drop(cache);

    let opened = UidLog::open(
        dir.path().join("GFLP01.uidcache"),
        UID_SCHEMA_VERSION,
        PipelineUid::SERIALIZED_LEN,
    )
    .unwrap();
    let mut logged: Vec<_> = opened
        .records
        .iter()
        .map(|record| PipelineUid::from_bytes(record).unwrap().ps_uid.combiners)
        .collect();
    logged.sort();
    assert_eq!(logged, vec![1, 2]);
}

#[test]
fn save_state_restores_efb_and_tmem() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = VideoConfig {
        shader_cache: false,
        ..VideoConfig::default()
    };
    let caps = NullShaderBackend::capabilities();
    let new_efb = || {
        FramebufferManager::new(
            SoftwareEfbDevice::new(false),
            caps.clone(),
            EfbSettings::from(&config),
        )
        .unwrap()
    };

    let mut efb = new_efb();
    efb.poke_color(320, 240, 0xFF33_6699);
    let mut tmem = Tmem::new();
    tmem.write_register(TmemRegister::SetImage1.address(6), (3 << 15) | (3 << 18));
    tmem.bind(6, 8, 8, false, false);
    tmem.finalize_binds(TextureUnits::UNIT6);

    let efb_path = dir.path().join("efb.state");
    let tmem_path = dir.path().join("tmem.state");
    fs::write(&efb_path, efb.save_state()).unwrap();
    fs::write(&tmem_path, tmem.save_state()).unwrap();

    let mut restored_efb = new_efb();
    restored_efb.load_state(&fs::read(&efb_path).unwrap()).unwrap();
    let mut restored_tmem = Tmem::new();
    restored_tmem.load_state(&fs::read(&tmem_path).unwrap()).unwrap();

    assert_eq!(restored_efb.peek_color(320, 240), 0xFF33_6699);
    assert!(restored_tmem.is_cached(6));
    assert_eq!(restored_tmem, tmem);

    // Each state blob belongs to exactly one device.
    assert!(restored_tmem.load_state(&fs::read(&efb_path).unwrap()).is_err());
}
