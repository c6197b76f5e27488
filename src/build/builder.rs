//! Run orchestration: stages in sequence, then the single-threaded media
//! phase, then finalization and the end-of-run report.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::stage::{run_stage, StageKind, StageSpec};
use super::{BuildStats, Result, StatsSnapshot};
use crate::archive::{ArchiveSink, ArchiveSummary};
use crate::config::BuildOptions;
use crate::media::download::media_file_path;
use crate::media::MediaCache;
use crate::storage::sqlite::StoreConfig;
use crate::storage::ContentStore;

/// End-of-run totals.
#[derive(Debug, Clone, Copy)]
pub struct BuildReport {
    pub stats: StatsSnapshot,
    pub archive: ArchiveSummary,
    pub elapsed_secs: f64,
}

pub struct ArchiveBuilder {
    store: ContentStore,
    store_config: StoreConfig,
    options: BuildOptions,
    media_dir: PathBuf,
}

impl ArchiveBuilder {
    pub fn new(
        store: ContentStore,
        store_config: StoreConfig,
        options: BuildOptions,
        media_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            store_config,
            options,
            media_dir: media_dir.into(),
        }
    }

    fn stage_specs(&self) -> Vec<StageSpec> {
        let spec = |kind| StageSpec {
            kind,
            batch_size: self.options.batch_size,
            with_stats: self.options.with_stats,
        };
        let mut specs = vec![spec(StageKind::Misc), spec(StageKind::Boards)];
        if self.options.with_users {
            specs.push(spec(StageKind::Users));
        }
        specs.push(spec(StageKind::Posts));
        specs
    }

    /// Build the whole archive into `sink`. Stages run strictly one after
    /// another; the media phase runs last, single-threaded, once every
    /// reference is known.
    pub async fn build<S: ArchiveSink + 'static>(&self, mut sink: S) -> Result<BuildReport> {
        let started = Instant::now();
        let stats = Arc::new(BuildStats::default());
        let mut referenced: HashSet<i64> = HashSet::new();

        sink.add_structured_data(
            "data/archive.json",
            "Archive metadata",
            &serde_json::json!({
                "generator": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "created_utc": chrono::Utc::now().to_rfc3339(),
                "language": "en",
            }),
        )?;
        stats.data_entries.fetch_add(1, Ordering::Relaxed);

        for spec in self.stage_specs() {
            let (next_sink, outcome) = run_stage(
                &self.store,
                &self.store_config,
                &spec,
                &self.options,
                sink,
                stats.clone(),
            )
            .await?;
            sink = next_sink;
            referenced.extend(outcome.referenced_media);
        }

        let media_added = self.add_referenced_media(&mut sink, &referenced).await?;
        stats.media_files.fetch_add(media_added, Ordering::Relaxed);

        let archive = sink.finalize()?;
        let snapshot = stats.snapshot();
        let elapsed_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            "Builder: archive complete in {:.1}s: {} pages, {} redirects, {} data entries, {} scripts, {} media files, {} soft failures, {} bytes",
            elapsed_secs,
            snapshot.pages,
            snapshot.redirects,
            snapshot.data_entries,
            snapshot.scripts,
            snapshot.media_files,
            snapshot.soft_failures,
            archive.bytes,
        );
        Ok(BuildReport {
            stats: snapshot,
            archive,
            elapsed_secs,
        })
    }

    /// Copy exactly the assets that rendered markup ended up referencing.
    async fn add_referenced_media<S: ArchiveSink>(
        &self,
        sink: &mut S,
        referenced: &HashSet<i64>,
    ) -> Result<u64> {
        let cache = MediaCache::new(self.store.clone());
        let mut ids: Vec<i64> = referenced.iter().copied().collect();
        ids.sort_unstable();
        let mut seen_owners: HashSet<i64> = HashSet::new();
        let mut added = 0u64;
        for id in ids {
            let Some(entry) = self.store.media_get(id).await? else {
                continue;
            };
            // Duplicates never own bytes; serve whatever entry does.
            let Some(owner) = cache.resolve_for_serving(&entry).await? else {
                continue;
            };
            if !owner.downloaded || !seen_owners.insert(owner.id) {
                continue;
            }
            let file = media_file_path(&self.media_dir, &owner.canonical_url);
            let path = format!("media/{}", owner.id);
            sink.add_media(&path, &file, owner.mime_type.as_deref())?;
            added += 1;
        }
        if added > 0 {
            tracing::info!("Builder: added {} media files", added);
        }
        Ok(added)
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MemorySink, SinkRecord};
    use crate::storage::sqlite::tests::{
        insert_board, insert_comment, insert_post, insert_user, open_test_store,
    };

    fn small_options() -> BuildOptions {
        BuildOptions {
            worker_count: 2,
            batch_size: 2,
            ..BuildOptions::default()
        }
    }

    #[tokio::test]
    async fn test_full_build_covers_every_page_kind() {
        let (store, _temp) = open_test_store().await;
        insert_board(&store, "rust", 100).await;
        insert_user(&store, "alice").await;
        for i in 0..5 {
            insert_post(&store, &format!("p{}", i), "rust", "alice", i, i).await;
        }
        insert_comment(&store, "c1", "p0", None, "rust", "alice").await;

        let builder = ArchiveBuilder::new(
            store,
            StoreConfig::new(":memory:"),
            small_options(),
            "/nonexistent-media",
        );
        let report = builder.build(MemorySink::new()).await.unwrap();

        assert_eq!(report.stats.soft_failures, 0);
        // 5 posts + board top/new + board stats + user pages + 5 misc.
        assert!(report.stats.pages >= 15);
        assert!(report.stats.redirects >= 5);
        assert!(report.stats.scripts >= 1);
        // Batch size 2 over 5 posts: 3 batch tasks worth of progress plus
        // one unit per section and misc task.
        assert!(report.stats.progress >= 6);
    }

    #[tokio::test]
    async fn test_build_without_users_skips_user_stage() {
        let (store, _temp) = open_test_store().await;
        insert_board(&store, "rust", 1).await;
        insert_user(&store, "alice").await;
        insert_post(&store, "p0", "rust", "alice", 1, 1).await;

        let options = BuildOptions {
            with_users: false,
            ..small_options()
        };
        let builder = ArchiveBuilder::new(
            store,
            StoreConfig::new(":memory:"),
            options,
            "/nonexistent-media",
        );
        let report = builder.build(MemorySink::new()).await.unwrap();
        assert_eq!(report.stats.soft_failures, 0);
        assert!(report.stats.pages >= 1);
    }

    #[tokio::test]
    async fn test_media_phase_copies_only_referenced_primaries() {
        let (store, _temp) = open_test_store().await;
        let media_dir = tempfile::TempDir::new().unwrap();
        let canonical = "http://img.example.com/cat.png";
        let id = store
            .media_insert(canonical, Some("h1"), Some("image/png"), true, 3, None)
            .await
            .unwrap();
        let file = media_file_path(media_dir.path(), canonical);
        std::fs::write(&file, b"png").unwrap();

        let builder = ArchiveBuilder::new(
            store,
            StoreConfig::new(":memory:"),
            small_options(),
            media_dir.path(),
        );
        let mut sink = MemorySink::new();
        let added = builder
            .add_referenced_media(&mut sink, &HashSet::from([id]))
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            sink.records,
            vec![SinkRecord::Media {
                path: format!("media/{}", id),
                mime_type: Some("image/png".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_media_phase_resolves_duplicates_to_their_primary() {
        let (store, _temp) = open_test_store().await;
        let media_dir = tempfile::TempDir::new().unwrap();
        let canonical = "http://img.example.com/cat.png";
        let primary = store
            .media_insert(canonical, Some("h1"), Some("image/png"), true, 3, None)
            .await
            .unwrap();
        let duplicate = store
            .media_insert(
                "http://mirror.example.com/cat.png",
                Some("h1"),
                Some("image/png"),
                true,
                0,
                Some(primary),
            )
            .await
            .unwrap();
        let file = media_file_path(media_dir.path(), canonical);
        std::fs::write(&file, b"png").unwrap();

        let builder = ArchiveBuilder::new(
            store,
            StoreConfig::new(":memory:"),
            small_options(),
            media_dir.path(),
        );
        let mut sink = MemorySink::new();
        // Referencing both the duplicate and the primary yields one copy of
        // the primary's bytes.
        let added = builder
            .add_referenced_media(&mut sink, &HashSet::from([duplicate, primary]))
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            sink.records,
            vec![SinkRecord::Media {
                path: format!("media/{}", primary),
                mime_type: Some("image/png".into()),
            }]
        );
    }
}
