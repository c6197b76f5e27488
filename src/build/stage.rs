//! Stage coordinator: owns the lifecycle of one pipeline stage.
//!
//! Creates fresh bounded queues, spawns the worker pool and the writer, then
//! runs the dispatcher inline so a full task queue throttles it. Stages never
//! overlap; the sink is threaded through sequentially.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::dispatch::{self, dispatch_stage};
use super::task::Task;
use super::worker::Worker;
use super::writer::{run_writer, StageOutcome};
use super::{BuildStats, Result, ResultMessage, RESULT_QUEUE_CAPACITY, TASK_QUEUE_CAPACITY};
use crate::archive::ArchiveSink;
use crate::config::BuildOptions;
use crate::media::MediaRewriter;
use crate::render::HtmlRenderer;
use crate::storage::sqlite::StoreConfig;
use crate::storage::ContentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Posts,
    Boards,
    Users,
    Misc,
}

/// What one stage renders and how its work is partitioned.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub kind: StageKind,
    pub batch_size: usize,
    pub with_stats: bool,
}

impl StageSpec {
    pub fn name(&self) -> &'static str {
        match self.kind {
            StageKind::Posts => "posts",
            StageKind::Boards => "boards",
            StageKind::Users => "users",
            StageKind::Misc => "misc",
        }
    }

    /// Progress units one `TaskCompleted` marker is worth. A post batch
    /// advances by its size; section and misc tasks advance by one.
    pub fn progress_weight(&self) -> u64 {
        match self.kind {
            StageKind::Posts => self.batch_size as u64,
            _ => 1,
        }
    }
}

/// Run one stage to completion and hand the sink back.
pub async fn run_stage<S: ArchiveSink + 'static>(
    store: &ContentStore,
    store_config: &StoreConfig,
    spec: &StageSpec,
    options: &BuildOptions,
    sink: S,
    stats: Arc<BuildStats>,
) -> Result<(S, StageOutcome)> {
    let worker_count = options.worker_count.max(1);
    tracing::info!(
        "Stage '{}': starting with {} workers",
        spec.name(),
        worker_count
    );

    let (task_tx, task_rx) = mpsc::channel::<Task>(TASK_QUEUE_CAPACITY);
    let (result_tx, result_rx) = mpsc::channel::<ResultMessage>(RESULT_QUEUE_CAPACITY);
    let task_rx = Arc::new(Mutex::new(task_rx));

    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let worker_store = if options.isolate_workers {
            ContentStore::open(store_config).await?
        } else {
            store.clone()
        };
        // Each worker carries its own media snapshot; rewrite stays free of
        // I/O during rendering.
        let rewriter =
            MediaRewriter::load(&worker_store, options.rewrite_media, options.media_policy)
                .await?;
        let renderer = HtmlRenderer::new(options.render_options(), rewriter);
        let worker = Worker::new(
            id,
            worker_store,
            Box::new(renderer),
            options.posts_per_page,
            stats.clone(),
        );
        workers.push(tokio::spawn(worker.run(task_rx.clone(), result_tx.clone())));
    }
    drop(result_tx);

    let writer = tokio::spawn(run_writer(
        sink,
        result_rx,
        worker_count,
        spec.progress_weight(),
        stats.clone(),
    ));

    // Dispatcher runs inline; the bounded task queue is its backpressure.
    dispatch_stage(store, spec, &task_tx).await?;
    for _ in 0..worker_count {
        dispatch::send(&task_tx, Task::Stop).await?;
    }
    drop(task_tx);

    let (sink, outcome) = writer.await??;
    for worker in workers {
        worker.await??;
    }
    tracing::info!(
        "Stage '{}': done, {} tasks completed, progress {}",
        spec.name(),
        outcome.tasks_completed,
        outcome.progress
    );
    Ok((sink, outcome))
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MemorySink, SinkRecord};
    use crate::storage::sqlite::tests::{insert_board, insert_post, open_test_store};

    fn options(worker_count: usize, batch_size: usize) -> BuildOptions {
        BuildOptions {
            worker_count,
            batch_size,
            ..BuildOptions::default()
        }
    }

    // Workers share the pool in these tests; the path is never opened.
    fn store_config() -> StoreConfig {
        StoreConfig::new(":memory:")
    }

    #[tokio::test]
    async fn test_progress_reconciliation() {
        let (store, _temp) = open_test_store().await;
        for i in 0..640 {
            insert_post(&store, &format!("p{}", i), "rust", "alice", i, i).await;
        }
        let spec = StageSpec {
            kind: StageKind::Posts,
            batch_size: 64,
            with_stats: true,
        };
        let config = store_config();
        let stats = Arc::new(BuildStats::default());
        let (_sink, outcome) = run_stage(
            &store,
            &config,
            &spec,
            &options(4, 64),
            MemorySink::new(),
            stats,
        )
        .await
        .unwrap();

        // 640 ids at batch size 64: exactly 10 task markers, 4 stop markers.
        assert_eq!(outcome.tasks_completed, 10);
        assert_eq!(outcome.workers_stopped, 4);
        assert_eq!(outcome.progress, 640);
    }

    #[tokio::test]
    async fn test_misc_stage_writes_singleton_pages() {
        let (store, _temp) = open_test_store().await;
        insert_board(&store, "rust", 3).await;
        let spec = StageSpec {
            kind: StageKind::Misc,
            batch_size: 64,
            with_stats: true,
        };
        let config = store_config();
        let stats = Arc::new(BuildStats::default());
        let (sink, outcome) = run_stage(
            &store,
            &config,
            &spec,
            &options(2, 64),
            MemorySink::new(),
            stats,
        )
        .await
        .unwrap();

        assert_eq!(outcome.tasks_completed, 5);
        // Finalization belongs to the builder, not a stage.
        assert!(!sink.finalized);
        let paths = sink.paths();
        for expected in ["index.html", "boards.html", "stats.html", "about.html"] {
            assert!(paths.contains(&expected), "missing {}", expected);
        }
        assert!(sink
            .records
            .iter()
            .any(|r| matches!(r, SinkRecord::Script { .. })));
    }

    #[tokio::test]
    async fn test_sink_failure_aborts_stage() {
        use crate::archive::{ArchiveError, ArchiveSink, ArchiveSummary};
        use std::path::Path;

        struct FailingSink;

        impl ArchiveSink for FailingSink {
            fn add_page(&mut self, _: &str, _: &str, _: &str, _: bool) -> crate::archive::Result<()> {
                Err(ArchiveError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )))
            }
            fn add_redirect(
                &mut self,
                _: &str,
                _: &str,
                _: &str,
                _: bool,
            ) -> crate::archive::Result<()> {
                Ok(())
            }
            fn add_structured_data(
                &mut self,
                _: &str,
                _: &str,
                _: &serde_json::Value,
            ) -> crate::archive::Result<()> {
                Ok(())
            }
            fn add_script(&mut self, _: &str, _: &str, _: &str) -> crate::archive::Result<()> {
                Ok(())
            }
            fn add_media(
                &mut self,
                _: &str,
                _: &Path,
                _: Option<&str>,
            ) -> crate::archive::Result<()> {
                Ok(())
            }
            fn finalize(&mut self) -> crate::archive::Result<ArchiveSummary> {
                Ok(ArchiveSummary::default())
            }
        }

        let (store, _temp) = open_test_store().await;
        for i in 0..64 {
            insert_post(&store, &format!("p{}", i), "rust", "alice", i, i).await;
        }
        let spec = StageSpec {
            kind: StageKind::Posts,
            batch_size: 1,
            with_stats: true,
        };
        let config = store_config();
        let stats = Arc::new(BuildStats::default());
        // The writer dies on the first page; the stage must still run the
        // dispatcher to completion and surface the sink error.
        let result = run_stage(&store, &config, &spec, &options(2, 1), FailingSink, stats).await;
        assert!(matches!(result, Err(crate::build::BuildError::Archive(_))));
    }

    #[tokio::test]
    async fn test_task_queue_is_bounded() {
        let (tx, mut rx) = mpsc::channel::<Task>(4);
        for _ in 0..4 {
            tx.try_send(Task::Stop).unwrap();
        }
        // At capacity the producer is refused rather than the queue growing.
        assert!(tx.try_send(Task::Stop).is_err());
        rx.recv().await.unwrap();
        tx.try_send(Task::Stop).unwrap();
    }
}
