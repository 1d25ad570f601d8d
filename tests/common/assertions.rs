//! Custom test assertions for end-to-end tests

use chapter_dl::{BatchProgress, ChapterDownloader, Event, ItemId};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default time to wait for anything network-bound
pub const WAIT: Duration = Duration::from_secs(20);

/// Wait for the first event matching `pred`
///
/// Returns `None` on timeout or if the channel closes.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<Event>, mut pred: F) -> Option<Event>
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Wait until every id in `ids` has completed
pub async fn wait_for_completions(events: &mut broadcast::Receiver<Event>, ids: &[ItemId]) -> bool {
    let mut remaining: Vec<ItemId> = ids.to_vec();
    while !remaining.is_empty() {
        let done = wait_for_event(events, |e| {
            matches!(e, Event::Completed { item } if remaining.contains(&item.id))
        })
        .await;
        match done {
            Some(Event::Completed { item }) => remaining.retain(|id| *id != item.id),
            _ => return false,
        }
    }
    true
}

/// Wait until the title's batch satisfies `pred`
pub async fn wait_for_batch<F>(downloader: &ChapterDownloader, owner_id: &str, mut pred: F) -> BatchProgress
where
    F: FnMut(&BatchProgress) -> bool,
{
    let mut view = downloader.batch().subscribe();
    let progress = tokio::time::timeout(
        WAIT,
        view.wait_for(|v| v.get(owner_id).is_some_and(&mut pred)),
    )
    .await
    .expect("Timed out waiting for batch progress")
    .expect("Batch tracker stopped");
    progress[owner_id].clone()
}

/// Wait until the startup background validation has recorded its run
pub async fn wait_for_initial_validation(downloader: &ChapterDownloader) {
    tokio::time::timeout(WAIT, async {
        while downloader
            .db
            .last_full_validation()
            .await
            .expect("Failed to read validation marker")
            .is_none()
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Startup validation never ran");
}

/// Number of image files under `dir`
pub fn count_images(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "png"))
        .count()
}
