//! Queue durability across downloader restarts

mod common;

use chapter_dl::{Database, Event, ItemId};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

#[tokio::test]
async fn test_paused_queue_survives_restart() {
    let server = MockServer::start().await;
    let chapters = vec![
        mount_chapter(&server, "title", "1", 2).await,
        mount_chapter(&server, "title", "2", 2).await,
    ];
    let catalog = Arc::new(catalog("title", chapters));
    let dir = tempfile::tempdir().unwrap();

    let downloader = start_downloader(test_config(&dir), catalog.clone()).await;
    downloader.queue().pause().await.unwrap();
    downloader
        .batch()
        .start_batch_download("title", None)
        .await
        .unwrap();
    downloader.shutdown().await.unwrap();

    let downloader = start_downloader(test_config(&dir), catalog).await;
    let snapshot = downloader.queue().snapshot().await.unwrap();
    assert!(snapshot.paused);
    let pending: Vec<&str> = snapshot.pending.iter().map(|i| i.unit_key.as_str()).collect();
    assert_eq!(pending, vec!["1", "2"]);

    let mut events = downloader.subscribe();
    downloader.queue().resume().await.unwrap();
    assert!(
        wait_for_completions(
            &mut events,
            &[ItemId::for_unit("title", "1"), ItemId::for_unit("title", "2")]
        )
        .await
    );
    assert_eq!(count_images(downloader.library().root()), 4);

    downloader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_download_is_resumed() {
    let server = MockServer::start().await;
    let chapter =
        mount_chapter_with_delay(&server, "title", "1", 2, Duration::from_secs(2)).await;
    let catalog = Arc::new(catalog("title", vec![chapter]));
    let dir = tempfile::tempdir().unwrap();

    let downloader = start_downloader(test_config(&dir), catalog.clone()).await;
    let mut events = downloader.subscribe();
    downloader
        .batch()
        .start_batch_download("title", None)
        .await
        .unwrap();
    assert!(wait_for_event(&mut events, |e| matches!(e, Event::Started { .. })).await.is_some());
    downloader.shutdown().await.unwrap();
    assert!(!downloader.library().manifest_path("title", "1").exists());

    let downloader = start_downloader(test_config(&dir), catalog).await;
    let mut events = downloader.subscribe();
    let snapshot = downloader.queue().snapshot().await.unwrap();
    assert!(snapshot.processing);

    assert!(wait_for_completions(&mut events, &[ItemId::for_unit("title", "1")]).await);
    assert!(downloader.library().manifest_path("title", "1").exists());

    downloader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unclean_shutdown_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("chapter-dl.db");

    let downloader = start_downloader(test_config(&dir), Arc::new(catalog("title", vec![]))).await;
    downloader.shutdown().await.unwrap();
    let db = Database::new(&db_path).await.unwrap();
    assert!(!db.was_unclean_shutdown().await.unwrap());
    db.close().await;

    // dropped without shutdown
    let downloader = start_downloader(test_config(&dir), Arc::new(catalog("title", vec![]))).await;
    drop(downloader);
    let db = Database::new(&db_path).await.unwrap();
    assert!(db.was_unclean_shutdown().await.unwrap());
}
