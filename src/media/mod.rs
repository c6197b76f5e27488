//! Content-addressable media cache.
//!
//! External assets are keyed by their canonical URL. The download stage
//! (see [`download`]) populates entries; render workers consult them through
//! [`MediaRewriter`] to swap external references for archive-internal paths.
//! Content-identical downloads from different URLs converge onto a single
//! primary entry that owns the bytes.

pub mod download;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::models::{MediaEntry, Post};
use crate::storage::ContentStore;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;

// ---------------------------------------------------------------------------
// Canonical URLs
// ---------------------------------------------------------------------------

/// Reduce a URL to its canonical form, the identity test for "same resource".
///
/// The scheme is forced to `http`, query parameters are sorted and deduped,
/// the path is percent-decoded until it stops changing, and the fragment is
/// dropped. The result is a cache key, not necessarily a fetchable URL.
pub fn canonical_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw).map_err(|_| MediaError::InvalidUrl(raw.to_string()))?;
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let port = match parsed.port() {
        Some(p) => format!(":{}", p),
        None => String::new(),
    };

    let mut path = parsed.path().to_string();
    loop {
        let decoded = match urlencoding::decode(&path) {
            Ok(d) => d.into_owned(),
            Err(_) => break,
        };
        if decoded == path {
            break;
        }
        path = decoded;
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    pairs.dedup();
    let query = if pairs.is_empty() {
        String::new()
    } else {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            ser.append_pair(k, v);
        }
        format!("?{}", ser.finish())
    };

    Ok(format!("http://{}{}{}{}", host, port, path, query))
}

/// On-disk filename for the bytes of a canonical URL inside the media
/// directory.
pub fn cache_filename(canonical: &str) -> String {
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).expect("static regex"));

/// Find all http(s) URLs mentioned in a text body.
pub fn extract_urls(text: &str) -> Vec<String> {
    url_spans(text)
        .into_iter()
        .map(|(start, end)| text[start..end].to_string())
        .collect()
}

/// Byte spans of every URL in a text body, trailing punctuation trimmed.
pub fn url_spans(text: &str) -> Vec<(usize, usize)> {
    URL_RE
        .find_iter(text)
        .map(|m| {
            let trimmed = m.as_str().trim_end_matches(['.', ',', ';']);
            (m.start(), m.start() + trimmed.len())
        })
        .collect()
}

/// All external URLs a post references: its link target plus anything in
/// the body.
pub fn urls_in_post(post: &Post) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(url) = &post.url {
        if !url.is_empty() {
            urls.push(url.clone());
        }
    }
    if let Some(body) = &post.body {
        urls.extend(extract_urls(body));
    }
    urls
}

// ---------------------------------------------------------------------------
// Cache operations
// ---------------------------------------------------------------------------

/// Result of one download attempt, as reported to [`MediaCache::record_attempt`].
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success {
        content_hash: String,
        mime_type: Option<String>,
        size: i64,
    },
    Failure,
}

/// What `record_attempt` decided about the downloaded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedAttempt {
    pub id: i64,
    /// Set when the bytes duplicate an existing primary entry; the caller
    /// must discard its copy.
    pub primary_id: Option<i64>,
}

/// Deduplicating view over the `media_files` table.
#[derive(Clone)]
pub struct MediaCache {
    store: ContentStore,
}

impl MediaCache {
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }

    /// Look up the entry for a URL, keyed by canonical form.
    pub async fn lookup(&self, url: &str) -> Result<Option<MediaEntry>> {
        let canonical = canonical_url(url)?;
        Ok(self.store.media_lookup(&canonical).await?)
    }

    /// Whether a download of this URL has been attempted this run,
    /// successfully or not.
    pub async fn has_attempted(&self, url: &str) -> Result<bool> {
        Ok(self.lookup(url).await?.is_some())
    }

    /// Record the outcome of one download attempt.
    ///
    /// On success, if another primary entry already owns bytes with the same
    /// content hash, the new entry is created pointing at it and the caller's
    /// bytes are redundant. Failures produce a negative entry so the URL is
    /// not retried within the run.
    pub async fn record_attempt(
        &self,
        url: &str,
        outcome: AttemptOutcome,
    ) -> Result<RecordedAttempt> {
        let canonical = canonical_url(url)?;
        match outcome {
            AttemptOutcome::Success {
                content_hash,
                mime_type,
                size,
            } => {
                let existing = self.store.media_find_primary_by_hash(&content_hash).await?;
                match existing {
                    Some(primary) => {
                        let id = self
                            .store
                            .media_insert(
                                &canonical,
                                Some(&content_hash),
                                mime_type.as_deref(),
                                true,
                                0,
                                Some(primary.id),
                            )
                            .await?;
                        Ok(RecordedAttempt {
                            id,
                            primary_id: Some(primary.id),
                        })
                    }
                    None => {
                        let id = self
                            .store
                            .media_insert(
                                &canonical,
                                Some(&content_hash),
                                mime_type.as_deref(),
                                true,
                                size,
                                None,
                            )
                            .await?;
                        Ok(RecordedAttempt {
                            id,
                            primary_id: None,
                        })
                    }
                }
            }
            AttemptOutcome::Failure => {
                let id = self
                    .store
                    .media_insert(&canonical, None, None, false, 0, None)
                    .await?;
                Ok(RecordedAttempt {
                    id,
                    primary_id: None,
                })
            }
        }
    }

    /// Follow `primary_id` to the entry that owns physical bytes. At most one
    /// hop by construction.
    pub async fn resolve_for_serving(&self, entry: &MediaEntry) -> Result<Option<MediaEntry>> {
        match entry.primary_id {
            Some(primary_id) => Ok(self.store.media_get(primary_id).await?),
            None => Ok(Some(entry.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

/// Which asset classes the archive is allowed to serve.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RewritePolicy {
    pub images: bool,
    pub videos: bool,
    pub other: bool,
}

impl Default for RewritePolicy {
    fn default() -> Self {
        Self {
            images: true,
            videos: true,
            other: true,
        }
    }
}

impl RewritePolicy {
    fn admits(&self, mime_type: Option<&str>) -> bool {
        match mime_type {
            Some(m) if m.starts_with("image/") => self.images,
            Some(m) if m.starts_with("video/") => self.videos,
            _ => self.other,
        }
    }
}

/// Swaps external URLs for archive-internal paths.
///
/// Operates on a snapshot of the media table loaded once per worker; the
/// download stage strictly precedes rendering, so the snapshot is complete.
/// `rewrite` performs no I/O.
pub struct MediaRewriter {
    enabled: bool,
    policy: RewritePolicy,
    by_url: HashMap<String, MediaEntry>,
    by_id: HashMap<i64, MediaEntry>,
    referenced: Vec<i64>,
}

impl MediaRewriter {
    /// Load the current cache contents from the backing store.
    pub async fn load(store: &ContentStore, enabled: bool, policy: RewritePolicy) -> Result<Self> {
        let entries = if enabled {
            store.media_all().await?
        } else {
            Vec::new()
        };
        Ok(Self::from_entries(entries, enabled, policy))
    }

    pub fn from_entries(entries: Vec<MediaEntry>, enabled: bool, policy: RewritePolicy) -> Self {
        let mut by_url = HashMap::with_capacity(entries.len());
        let mut by_id = HashMap::with_capacity(entries.len());
        for entry in entries {
            by_id.insert(entry.id, entry.clone());
            by_url.insert(entry.canonical_url.clone(), entry);
        }
        Self {
            enabled,
            policy,
            by_url,
            by_id,
            referenced: Vec::new(),
        }
    }

    /// Rewrite one URL. Returns an internal `{to_root}/media/{id}` path when
    /// the asset is cached, downloaded and admitted by policy; otherwise the
    /// original URL unchanged.
    pub fn rewrite(&mut self, raw_url: &str, to_root: &str) -> String {
        if !self.enabled {
            return raw_url.to_string();
        }
        let Ok(canonical) = canonical_url(raw_url) else {
            return raw_url.to_string();
        };
        let Some(entry) = self.by_url.get(&canonical) else {
            return raw_url.to_string();
        };
        let owner = match entry.primary_id {
            Some(primary_id) => match self.by_id.get(&primary_id) {
                Some(primary) => primary,
                None => return raw_url.to_string(),
            },
            None => entry,
        };
        if !owner.downloaded || !self.policy.admits(owner.mime_type.as_deref()) {
            return raw_url.to_string();
        }
        self.referenced.push(owner.id);
        format!("{}/media/{}", to_root, owner.id)
    }

    /// Drain the entry ids referenced since the last call.
    pub fn take_references(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.referenced)
    }
}
