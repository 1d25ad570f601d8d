//! HTTP executor: fetches chapter pages into the chapter library.

use super::{DownloadContext, DownloadExecutor, JsonPageSource, PageSource};
use crate::config::{DownloadConfig, RetryConfig};
use crate::error::{DownloadError, Error, FailureKind, Result};
use crate::library::{ChapterLibrary, ChapterManifest, PieceRecord, piece_file_name};
use crate::queue::QueueHandle;
use crate::retry::download_with_retry;
use crate::types::{FailureReport, ItemId, ItemScope, ProgressInfo};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Downloads units and single pieces over HTTP
///
/// Each item runs in its own task. Pieces of a unit are fetched with bounded
/// concurrency, retried with backoff on transient errors, checked to be
/// decodable images and written atomically. The unit's manifest is written
/// last, so a unit without a manifest never counts as complete.
#[derive(Clone)]
pub struct HttpExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    library: ChapterLibrary,
    source: Arc<dyn PageSource>,
    retry: RetryConfig,
    piece_concurrency: usize,
    tokens: Mutex<HashMap<ItemId, CancellationToken>>,
}

impl Inner {
    fn tokens(&self) -> MutexGuard<'_, HashMap<ItemId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HttpExecutor {
    /// Create an executor that resolves page lists with [`JsonPageSource`]
    pub fn new(config: &DownloadConfig, retry: RetryConfig, library: ChapterLibrary) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let source = Arc::new(JsonPageSource::new(client.clone()));
        Ok(Self::with_parts(
            client,
            library,
            source,
            retry,
            config.piece_concurrency,
        ))
    }

    /// Create an executor from explicit parts
    pub fn with_parts(
        client: reqwest::Client,
        library: ChapterLibrary,
        source: Arc<dyn PageSource>,
        retry: RetryConfig,
        piece_concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                library,
                source,
                retry,
                piece_concurrency: piece_concurrency.max(1),
                tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of items currently running
    pub fn running(&self) -> usize {
        self.inner.tokens().len()
    }
}

impl DownloadExecutor for HttpExecutor {
    fn start_download(&self, ctx: DownloadContext, queue: QueueHandle) -> Result<()> {
        if let ItemScope::Piece { .. } = ctx.item.scope {
            // a piece can only be patched into an existing unit
            if !self
                .inner
                .library
                .manifest_path(&ctx.owner_id, &ctx.unit_key)
                .exists()
            {
                return Err(DownloadError::ManifestMissing {
                    id: ctx.id.to_string(),
                }
                .into());
            }
        }

        let token = CancellationToken::new();
        {
            let mut tokens = self.inner.tokens();
            if tokens.contains_key(&ctx.id) {
                return Err(DownloadError::DispatchRejected {
                    id: ctx.id.to_string(),
                    reason: "already running".to_string(),
                }
                .into());
            }
            tokens.insert(ctx.id.clone(), token.clone());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                result = run_item(&inner, &ctx, &queue) => result,
            };
            inner.tokens().remove(&ctx.id);

            match result {
                Ok(()) => queue.on_complete(ctx.id),
                Err(e) => {
                    let kind = FailureKind::from(&e);
                    tracing::warn!(item_id = %ctx.id, kind = %kind, error = %e, "Download failed");
                    queue.on_failed(FailureReport {
                        id: ctx.id.clone(),
                        kind,
                        message: e.to_string(),
                        retry_count: ctx.item.retry_count,
                        item: Some(ctx.item),
                    });
                }
            }
        });

        Ok(())
    }

    fn cancel(&self, id: &ItemId) -> bool {
        match self.inner.tokens().remove(id) {
            Some(token) => {
                tracing::info!(item_id = %id, "Cancelling download");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        let tokens: Vec<_> = self.inner.tokens().drain().collect();
        if !tokens.is_empty() {
            tracing::info!(count = tokens.len(), "Cancelling all downloads");
        }
        for (_, token) in tokens {
            token.cancel();
        }
    }
}

async fn run_item(inner: &Inner, ctx: &DownloadContext, queue: &QueueHandle) -> Result<()> {
    match &ctx.item.scope {
        ItemScope::Unit => run_unit(inner, ctx, queue).await,
        ItemScope::Piece { index, file_name } => {
            run_piece(inner, ctx, queue, *index, file_name).await
        }
    }
}

async fn run_unit(inner: &Inner, ctx: &DownloadContext, queue: &QueueHandle) -> Result<()> {
    let pages = download_with_retry(&inner.retry, || {
        inner.source.resolve_pages(&ctx.source_url)
    })
    .await?;
    if pages.is_empty() {
        return Err(DownloadError::NoPages {
            id: ctx.id.to_string(),
        }
        .into());
    }

    let total = pages.len();
    tracing::debug!(item_id = %ctx.id, pages = total, "Resolved page list");
    queue.report_progress(ctx.id.clone(), ProgressInfo::at(0.0));

    let started = Instant::now();
    let finished = AtomicUsize::new(0);
    let bytes = AtomicU64::new(0);

    let results: Vec<Result<PieceRecord>> = futures::stream::iter(pages.into_iter().enumerate())
        .map(|(index, url)| {
            let finished = &finished;
            let bytes = &bytes;
            async move {
                let index = index as u32;
                let fetched = fetch_piece(inner, &url, ctx, index).await?;
                let file_name = piece_file_name(index, fetched.extension);
                let record =
                    store_piece(inner, ctx, index, &file_name, &url, &fetched).await?;

                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                let total_bytes = bytes.fetch_add(record.size, Ordering::SeqCst) + record.size;
                queue.report_progress(
                    ctx.id.clone(),
                    progress_after(done, total, total_bytes, started),
                );
                Ok(record)
            }
        })
        .buffer_unordered(inner.piece_concurrency)
        .collect()
        .await;

    let mut pieces = results.into_iter().collect::<Result<Vec<_>>>()?;
    pieces.sort_by_key(|p| p.index);

    let manifest = ChapterManifest {
        owner_id: ctx.owner_id.clone(),
        unit_key: ctx.unit_key.clone(),
        source_url: ctx.source_url.clone(),
        display_name: ctx.item.display_name.clone(),
        pieces,
        completed_at: chrono::Utc::now().timestamp_millis(),
    };
    inner.library.write_manifest(&manifest).await?;

    tracing::info!(
        item_id = %ctx.id,
        pieces = total,
        bytes = bytes.load(Ordering::SeqCst),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Chapter downloaded"
    );
    Ok(())
}

async fn run_piece(
    inner: &Inner,
    ctx: &DownloadContext,
    queue: &QueueHandle,
    index: u32,
    file_name: &str,
) -> Result<()> {
    let mut manifest = match inner.library.read_manifest(&ctx.owner_id, &ctx.unit_key).await {
        Ok(m) => m,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DownloadError::ManifestMissing {
                id: ctx.id.to_string(),
            }
            .into());
        }
        Err(e) => return Err(e),
    };

    let fetched = fetch_piece(inner, &ctx.source_url, ctx, index).await?;
    let record = store_piece(inner, ctx, index, file_name, &ctx.source_url, &fetched).await?;
    manifest.upsert_piece(record);
    inner.library.write_manifest(&manifest).await?;

    queue.report_progress(ctx.id.clone(), ProgressInfo::at(100.0));
    tracing::info!(item_id = %ctx.id, index, "Piece re-downloaded");
    Ok(())
}

struct FetchedPiece {
    bytes: Vec<u8>,
    extension: &'static str,
    width: u32,
    height: u32,
}

async fn fetch_piece(
    inner: &Inner,
    url: &str,
    ctx: &DownloadContext,
    index: u32,
) -> Result<FetchedPiece> {
    let bytes = download_with_retry(&inner.retry, || fetch_bytes(&inner.client, url)).await?;
    inspect_image(bytes).ok_or_else(|| {
        DownloadError::UnsupportedPiece {
            id: ctx.id.to_string(),
            index,
        }
        .into()
    })
}

async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    Ok(response.bytes().await?.to_vec())
}

/// Sniff the format and read the dimensions; `None` if not a usable image
fn inspect_image(bytes: Vec<u8>) -> Option<FetchedPiece> {
    let format = image::guess_format(&bytes).ok()?;
    let extension = format.extensions_str().first().copied().unwrap_or("img");
    let (width, height) = image::ImageReader::with_format(std::io::Cursor::new(&bytes), format)
        .into_dimensions()
        .ok()?;
    Some(FetchedPiece {
        bytes,
        extension,
        width,
        height,
    })
}

async fn store_piece(
    inner: &Inner,
    ctx: &DownloadContext,
    index: u32,
    file_name: &str,
    url: &str,
    fetched: &FetchedPiece,
) -> Result<PieceRecord> {
    inner
        .library
        .write_piece(&ctx.owner_id, &ctx.unit_key, file_name, &fetched.bytes)
        .await?;

    Ok(PieceRecord {
        index,
        file_name: file_name.to_string(),
        source_url: url.to_string(),
        size: fetched.bytes.len() as u64,
        sha256: format!("{:x}", Sha256::digest(&fetched.bytes)),
        width: fetched.width,
        height: fetched.height,
    })
}

fn progress_after(done: usize, total: usize, bytes: u64, started: Instant) -> ProgressInfo {
    let elapsed = started.elapsed().as_secs_f64();
    let mut progress = ProgressInfo::at(done as f32 / total as f32 * 100.0);
    if elapsed > 0.0 {
        progress.bytes_per_second = Some((bytes as f64 / elapsed) as u64);
        let per_piece = elapsed / done as f64;
        progress.estimated_seconds_remaining =
            Some((per_piece * (total - done) as f64).round() as u64);
    }
    progress
}
