//! Warming scheduler tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use multi_layer_cache::{loader, new_shared_manager, CacheManager, CacheOptions, Config};

fn memory_only() -> Config {
    let mut config = Config::default();
    config.file.enabled = false;
    config
}

async fn unavailable() -> anyhow::Result<Value> {
    anyhow::bail!("upstream timed out")
}

async fn explode() -> anyhow::Result<Value> {
    panic!("loader bug")
}

#[tokio::test]
async fn test_failing_loader_isolated() {
    let manager = CacheManager::from_config(memory_only(), None).await.unwrap();

    for i in 0..5 {
        let item = if i == 2 {
            loader(unavailable)
        } else {
            loader(move || async move { Ok(json!({"id": i})) })
        };
        manager.add_to_warming_queue(format!("item:{i}"), item, CacheOptions::default());
    }

    let report = manager.run_warming_batch().await.unwrap();
    assert_eq!(report.attempted, 5);
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 1);

    let opts = CacheOptions::default();
    let stats = manager.get_stats(&opts).await.unwrap();
    assert_eq!(stats.global.sets, 4);
    assert_eq!(manager.get("item:2", &opts).await.unwrap(), None);
    assert_eq!(manager.get("item:4", &opts).await.unwrap(), Some(json!({"id": 4})));
}

#[tokio::test]
async fn test_panicking_loader_isolated() {
    let manager = CacheManager::from_config(memory_only(), None).await.unwrap();

    manager.add_to_warming_queue(
        "boom",
        loader(explode),
        CacheOptions::default(),
    );
    manager.add_to_warming_queue(
        "fine",
        loader(|| async { Ok(json!("ok")) }),
        CacheOptions::default(),
    );

    let report = manager.run_warming_batch().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(
        manager.get("fine", &CacheOptions::default()).await.unwrap(),
        Some(json!("ok"))
    );
}

#[tokio::test]
async fn test_batches_drain_fifo() {
    let mut config = memory_only();
    config.warming.batch_size = 2;
    let manager = CacheManager::from_config(config, None).await.unwrap();

    for i in 0..3 {
        manager.add_to_warming_queue(
            format!("k{i}"),
            loader(move || async move { Ok(json!(i)) }),
            CacheOptions::default(),
        );
    }

    let first = manager.run_warming_batch().await.unwrap();
    assert_eq!(first.attempted, 2);
    assert_eq!(manager.warming_queue_len(), 1);
    assert!(manager.get("k2", &CacheOptions::default()).await.unwrap().is_none());

    let second = manager.run_warming_batch().await.unwrap();
    assert_eq!(second.attempted, 1);
    assert_eq!(manager.warming_queue_len(), 0);

    let empty = manager.run_warming_batch().await.unwrap();
    assert_eq!(empty.attempted, 0);
}

#[tokio::test]
async fn test_item_options_respected() {
    let manager = CacheManager::from_config(memory_only(), None).await.unwrap();

    manager.add_to_warming_queue(
        "bad",
        loader(|| async { Ok(json!(1)) }),
        CacheOptions::new().layers(["nowhere"]),
    );

    let report = manager.run_warming_batch().await.unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_background_timer_warms() {
    let mut config = memory_only();
    config.warming.interval_ms = 20;
    let manager = new_shared_manager(CacheManager::from_config(config, None).await.unwrap());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    manager.add_to_warming_queue(
        "hot",
        loader(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!("fresh")) }
        }),
        CacheOptions::default(),
    );

    let mut warmed = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        warmed = manager.get("hot", &CacheOptions::default()).await.unwrap();
        if warmed.is_some() {
            break;
        }
    }
    assert_eq!(warmed, Some(json!("fresh")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    manager.close().await;
}
