//! Benchmarks for the cache hot paths.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use multi_layer_cache::cache::codec::Codec;
use multi_layer_cache::config::{Config, MemoryLayerConfig};
use multi_layer_cache::layers::memory::MemoryLayer;
use multi_layer_cache::layers::{Layer, WriteOptions};
use multi_layer_cache::{CacheManager, CacheOptions};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_memory_layer(c: &mut Criterion) {
    let rt = runtime();
    let layer = MemoryLayer::new(MemoryLayerConfig::default(), Codec::default());
    let opts = WriteOptions::default();
    let value = Bytes::from(vec![b'v'; 1024]);

    rt.block_on(async {
        for i in 0..1000 {
            layer.set(&format!("k{i}"), value.clone(), &opts).await.unwrap();
        }
    });

    c.bench_function("memory_set_1kb", |b| {
        b.iter(|| {
            rt.block_on(layer.set(black_box("bench"), value.clone(), &opts))
                .unwrap();
        })
    });

    c.bench_function("memory_get_hit", |b| {
        b.iter(|| {
            let hit = rt.block_on(layer.get(black_box("k500"))).unwrap();
            black_box(hit);
        })
    });
}

fn bench_lru_eviction(c: &mut Criterion) {
    let rt = runtime();
    // Every insert past the first 1000 evicts the least recent entry.
    let layer = MemoryLayer::new(
        MemoryLayerConfig {
            max_size: 100 * 1024 * 1024,
            max_items: 1000,
        },
        Codec::default(),
    );
    let opts = WriteOptions::default();
    let value = Bytes::from_static(b"payload");
    let mut i = 0u64;

    c.bench_function("memory_set_with_eviction", |b| {
        b.iter(|| {
            i += 1;
            rt.block_on(layer.set(&format!("k{i}"), value.clone(), &opts))
                .unwrap();
        })
    });
}

fn bench_codec(c: &mut Criterion) {
    let codec = Codec::default();
    let data = Bytes::from(
        serde_json::to_vec(&json!({"rows": vec!["lorem ipsum dolor sit amet"; 2048]})).unwrap(),
    );

    c.bench_function("zstd_encode_json_50kb", |b| {
        b.iter(|| {
            let payload = codec.encode(black_box(data.clone()), true).unwrap();
            black_box(payload);
        })
    });

    let payload = codec.encode(data.clone(), true).unwrap();
    c.bench_function("zstd_decode_json_50kb", |b| {
        b.iter(|| {
            let raw = codec.decode(black_box(&payload));
            black_box(raw);
        })
    });
}

fn bench_manager_get(c: &mut Criterion) {
    let rt = runtime();
    let mut config = Config::default();
    config.file.enabled = false;
    let manager = rt
        .block_on(CacheManager::from_config(config, None))
        .unwrap();
    let opts = CacheOptions::default();
    rt.block_on(manager.set("user:1", &json!({"name": "ada", "roles": ["admin"]}), &opts))
        .unwrap();

    c.bench_function("manager_get_memory_hit", |b| {
        b.iter(|| {
            let value = rt.block_on(manager.get(black_box("user:1"), &opts)).unwrap();
            black_box(value);
        })
    });
}

criterion_group!(
    benches,
    bench_memory_layer,
    bench_lru_eviction,
    bench_codec,
    bench_manager_get
);
criterion_main!(benches);
