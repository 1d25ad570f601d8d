//! Shared test helpers: a scripted executor, queue wiring and library fixtures.

use crate::config::{QueueConfig, RetryConfig};
use crate::error::{DownloadError, FailureKind, Result};
use crate::executor::{DownloadContext, DownloadExecutor};
use crate::library::{ChapterLibrary, ChapterManifest, PieceRecord, piece_file_name};
use crate::queue::{QueueActor, QueueHandle};
use crate::settings::SettingsProvider;
use crate::store::{MemoryQueueStore, QueueStore};
use crate::types::{Event, FailureReport, ItemId};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Executor that records what it was asked to start and never finishes
/// anything on its own; tests drive completion through the queue handle.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    started: Mutex<Vec<DownloadContext>>,
    reject: Mutex<HashSet<ItemId>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `start_download` fail for this id
    pub fn reject(&self, id: impl Into<ItemId>) {
        self.reject.lock().unwrap().insert(id.into());
    }

    /// Ids in the order they were started
    pub fn started_ids(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.id.to_string())
            .collect()
    }

    pub fn started(&self) -> Vec<DownloadContext> {
        self.started.lock().unwrap().clone()
    }
}

impl DownloadExecutor for RecordingExecutor {
    fn start_download(&self, ctx: DownloadContext, _queue: QueueHandle) -> Result<()> {
        if self.reject.lock().unwrap().contains(&ctx.id) {
            return Err(DownloadError::DispatchRejected {
                id: ctx.id.to_string(),
                reason: "scripted rejection".into(),
            }
            .into());
        }
        self.started.lock().unwrap().push(ctx);
        Ok(())
    }
}

/// Queue config with no settle delay so dispatch after callbacks is immediate
pub(crate) fn instant_queue_config() -> QueueConfig {
    QueueConfig {
        dispatch_settle_delay: Duration::ZERO,
        ..QueueConfig::default()
    }
}

/// Per-request retry config that does not slow tests down
pub(crate) fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// A running queue over an in-memory store
pub(crate) struct TestQueue {
    pub handle: QueueHandle,
    pub store: Arc<MemoryQueueStore>,
    pub events: broadcast::Receiver<Event>,
    pub event_tx: broadcast::Sender<Event>,
}

pub(crate) async fn spawn_queue(
    executor: Arc<dyn DownloadExecutor>,
    settings: Arc<dyn SettingsProvider>,
) -> TestQueue {
    spawn_queue_with_store(executor, settings, Arc::new(MemoryQueueStore::new())).await
}

pub(crate) async fn spawn_queue_with_store(
    executor: Arc<dyn DownloadExecutor>,
    settings: Arc<dyn SettingsProvider>,
    store: Arc<MemoryQueueStore>,
) -> TestQueue {
    let (event_tx, events) = broadcast::channel(1000);
    let (handle, _task) = QueueActor::spawn(
        &instant_queue_config(),
        store.clone() as Arc<dyn QueueStore>,
        executor,
        settings,
        event_tx.clone(),
    )
    .await;

    TestQueue {
        handle,
        store,
        events,
        event_tx,
    }
}

/// Wait until an event matching `pred` arrives, panicking after a timeout
pub(crate) async fn wait_for_event<F>(events: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll the queue until `pred` holds for its snapshot
pub(crate) async fn wait_for_snapshot<F>(handle: &QueueHandle, mut pred: F)
where
    F: FnMut(&crate::types::QueueSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = handle.snapshot().await.unwrap();
            if pred(&snapshot) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for queue state");
}

/// Encode a patterned PNG of the given size (noisy enough to stay well
/// above any minimum piece size after compression)
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        let v = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503) ^ (x * y);
        image::Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
    });
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Write a healthy unit of `pieces` 32x24 PNGs plus its manifest
pub(crate) async fn write_unit(
    library: &ChapterLibrary,
    owner_id: &str,
    unit_key: &str,
    pieces: u32,
) -> ChapterManifest {
    let mut manifest = ChapterManifest {
        owner_id: owner_id.into(),
        unit_key: unit_key.into(),
        source_url: format!("https://x.test/{}/{}", owner_id, unit_key),
        display_name: format!("Ch. {}", unit_key),
        pieces: vec![],
        completed_at: 1,
    };
    for index in 0..pieces {
        let bytes = png_bytes(32, 24);
        let file_name = piece_file_name(index, "png");
        library
            .write_piece(owner_id, unit_key, &file_name, &bytes)
            .await
            .unwrap();
        manifest.pieces.push(PieceRecord {
            index,
            file_name,
            source_url: format!("https://x.test/{}/{}/{}.png", owner_id, unit_key, index),
            size: bytes.len() as u64,
            sha256: format!("{:x}", Sha256::digest(&bytes)),
            width: 32,
            height: 24,
        });
    }
    library.write_manifest(&manifest).await.unwrap();
    manifest
}

/// Answer every `Started` event: fail `failing` terminally, complete the rest
pub(crate) fn settle_started(q: &TestQueue, failing: Option<ItemId>) {
    let handle = q.handle.clone();
    let mut events = q.event_tx.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Event::Started { id, .. } = event {
                if Some(&id) == failing.as_ref() {
                    handle.on_failed(FailureReport {
                        id,
                        kind: FailureKind::TerminalInput,
                        message: "HTTP 404".into(),
                        item: None,
                        retry_count: 0,
                    });
                } else {
                    handle.on_complete(id);
                }
            }
        }
    });
}
