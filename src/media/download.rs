//! Producer side of the media cache: fetches external assets referenced by
//! posts into the media directory, deduplicating by content hash.
//!
//! Runs as its own sequential stage before any rendering; render workers
//! only ever read what this stage recorded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::TryStreamExt;

use super::{cache_filename, canonical_url, urls_in_post, AttemptOutcome, MediaCache, Result};
use crate::storage::ContentStore;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:140.0) Gecko/20100101 Firefox/140.0";

/// Counters reported at the end of the download stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownloadReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deduplicated: u64,
    pub skipped: u64,
}

pub struct Downloader {
    store: ContentStore,
    cache: MediaCache,
    client: reqwest::Client,
    media_dir: PathBuf,
    sleep: Duration,
}

impl Downloader {
    pub fn new(store: ContentStore, media_dir: impl Into<PathBuf>, sleep_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            cache: MediaCache::new(store.clone()),
            store,
            client,
            media_dir: media_dir.into(),
            sleep: Duration::from_millis(sleep_ms),
        })
    }

    /// Walk every post and download each referenced URL not yet attempted.
    pub async fn download_all(&self) -> Result<DownloadReport> {
        tokio::fs::create_dir_all(&self.media_dir).await?;
        let total = self.store.count_posts().await?;
        tracing::info!("Downloader: scanning {} posts for media URLs", total);

        let mut report = DownloadReport::default();
        let mut scanned = 0u64;
        let mut posts = self.store.stream_posts();
        while let Some(post) = posts.try_next().await.map_err(crate::storage::StorageError::from)? {
            scanned += 1;
            for url in urls_in_post(&post) {
                if canonical_url(&url).is_err() {
                    continue;
                }
                if self.cache.has_attempted(&url).await? {
                    report.skipped += 1;
                    continue;
                }
                report.attempted += 1;
                match self.download_one(&url).await {
                    Ok(Downloaded::Stored) => report.succeeded += 1,
                    Ok(Downloaded::Duplicate) => {
                        report.succeeded += 1;
                        report.deduplicated += 1;
                    }
                    Ok(Downloaded::Failed) => report.failed += 1,
                    Err(e) => return Err(e),
                }
                if !self.sleep.is_zero() {
                    tokio::time::sleep(self.sleep).await;
                }
            }
            if scanned % 10_000 == 0 {
                tracing::info!("Downloader: {}/{} posts scanned", scanned, total);
            }
        }

        tracing::info!(
            "Downloader: done, {} attempted, {} succeeded ({} deduplicated), {} failed, {} skipped",
            report.attempted,
            report.succeeded,
            report.deduplicated,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    /// Fetch one URL and record the attempt. Network and HTTP failures are
    /// absorbed into a negative cache entry; local IO failures propagate.
    async fn download_one(&self, url: &str) -> Result<Downloaded> {
        let canonical = canonical_url(url)?;
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Downloader: request for {} failed: {}", url, e);
                self.cache.record_attempt(url, AttemptOutcome::Failure).await?;
                return Ok(Downloaded::Failed);
            }
        };
        if !response.status().is_success() {
            tracing::debug!("Downloader: {} returned {}", url, response.status());
            self.cache.record_attempt(url, AttemptOutcome::Failure).await?;
            return Ok(Downloaded::Failed);
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!("Downloader: body read for {} failed: {}", url, e);
                self.cache.record_attempt(url, AttemptOutcome::Failure).await?;
                return Ok(Downloaded::Failed);
            }
        };

        let content_hash = blake3::hash(&bytes).to_hex().to_string();
        let path = self.media_dir.join(cache_filename(&canonical));
        tokio::fs::write(&path, &bytes).await?;

        let recorded = self
            .cache
            .record_attempt(
                url,
                AttemptOutcome::Success {
                    content_hash,
                    mime_type,
                    size: bytes.len() as i64,
                },
            )
            .await?;

        if recorded.primary_id.is_some() {
            // Identical bytes already stored under the primary entry.
            tokio::fs::remove_file(&path).await?;
            return Ok(Downloaded::Duplicate);
        }
        Ok(Downloaded::Stored)
    }
}

enum Downloaded {
    Stored,
    Duplicate,
    Failed,
}

/// Path of the physical bytes for a primary entry.
pub fn media_file_path(media_dir: &Path, canonical: &str) -> PathBuf {
    media_dir.join(cache_filename(canonical))
}
