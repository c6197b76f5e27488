//! Writer: sole mutator of the archive sink.
//!
//! Consumes the result queue until every worker has checked out, dispatching
//! rendered units exhaustively and keeping the run counters. Sink failures
//! are fatal to the whole run.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::Receiver;

use super::{BuildError, BuildStats, Result, ResultMessage};
use crate::archive::ArchiveSink;
use crate::render::RenderedUnit;

/// What one stage produced, as observed by its writer.
#[derive(Debug, Default)]
pub struct StageOutcome {
    pub tasks_completed: u64,
    pub workers_stopped: usize,
    pub progress: u64,
    /// Media cache entry ids referenced by rendered markup; consumed by the
    /// sequential media phase after all stages.
    pub referenced_media: HashSet<i64>,
}

/// Drain the result queue for one stage. Returns the sink so the next stage
/// (and finalization) can keep using it.
pub async fn run_writer<S: ArchiveSink>(
    mut sink: S,
    mut results: Receiver<ResultMessage>,
    worker_count: usize,
    progress_weight: u64,
    stats: Arc<BuildStats>,
) -> Result<(S, StageOutcome)> {
    let mut outcome = StageOutcome::default();
    while outcome.workers_stopped < worker_count {
        let Some(message) = results.recv().await else {
            // Workers died without emitting their stop markers.
            return Err(BuildError::QueueClosed);
        };
        match message {
            ResultMessage::WorkerStopped => {
                outcome.workers_stopped += 1;
            }
            ResultMessage::TaskCompleted => {
                outcome.tasks_completed += 1;
                outcome.progress += progress_weight;
                stats.progress.fetch_add(progress_weight, Ordering::Relaxed);
                if outcome.tasks_completed % 100 == 0 {
                    tracing::info!(
                        "Writer: {} tasks done, progress {}",
                        outcome.tasks_completed,
                        outcome.progress
                    );
                }
            }
            ResultMessage::Rendered(units) => {
                for unit in units {
                    apply_unit(&mut sink, unit, &stats, &mut outcome)?;
                }
            }
        }
    }
    tracing::debug!(
        "Writer: stage drained, {} tasks, {} workers stopped",
        outcome.tasks_completed,
        outcome.workers_stopped
    );
    Ok((sink, outcome))
}

fn apply_unit<S: ArchiveSink>(
    sink: &mut S,
    unit: RenderedUnit,
    stats: &BuildStats,
    outcome: &mut StageOutcome,
) -> Result<()> {
    match unit {
        RenderedUnit::Page {
            path,
            title,
            html,
            is_front,
        } => {
            sink.add_page(&path, &title, &html, is_front)?;
            stats.pages.fetch_add(1, Ordering::Relaxed);
        }
        RenderedUnit::Redirect {
            source,
            target,
            title,
            is_front,
        } => {
            sink.add_redirect(&source, &target, &title, is_front)?;
            stats.redirects.fetch_add(1, Ordering::Relaxed);
        }
        RenderedUnit::StructuredData {
            path,
            title,
            payload,
        } => {
            sink.add_structured_data(&path, &title, &payload)?;
            stats.data_entries.fetch_add(1, Ordering::Relaxed);
        }
        RenderedUnit::Script {
            path,
            title,
            source,
        } => {
            sink.add_script(&path, &title, &source)?;
            stats.scripts.fetch_add(1, Ordering::Relaxed);
        }
        RenderedUnit::FileReferences { ids } => {
            outcome.referenced_media.extend(ids);
        }
    }
    Ok(())
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemorySink;
    use tokio::sync::mpsc;

    fn page(path: &str) -> RenderedUnit {
        RenderedUnit::Page {
            path: path.to_string(),
            title: "t".into(),
            html: "<html></html>".into(),
            is_front: false,
        }
    }

    #[tokio::test]
    async fn test_writer_drains_until_all_workers_stop() {
        let (tx, rx) = mpsc::channel(64);
        tx.send(ResultMessage::Rendered(vec![page("a.html")]))
            .await
            .unwrap();
        tx.send(ResultMessage::TaskCompleted).await.unwrap();
        tx.send(ResultMessage::WorkerStopped).await.unwrap();
        tx.send(ResultMessage::Rendered(vec![
            page("b.html"),
            RenderedUnit::FileReferences { ids: vec![3, 5] },
        ]))
        .await
        .unwrap();
        tx.send(ResultMessage::TaskCompleted).await.unwrap();
        tx.send(ResultMessage::WorkerStopped).await.unwrap();

        let stats = Arc::new(BuildStats::default());
        let (sink, outcome) = run_writer(MemorySink::new(), rx, 2, 64, stats.clone())
            .await
            .unwrap();

        assert_eq!(outcome.tasks_completed, 2);
        assert_eq!(outcome.workers_stopped, 2);
        assert_eq!(outcome.progress, 128);
        assert_eq!(outcome.referenced_media, HashSet::from([3, 5]));
        assert_eq!(stats.snapshot().pages, 2);
        assert_eq!(sink.paths(), vec!["a.html", "b.html"]);
        // Sender stays alive past the second stop marker; the writer must
        // have returned without needing the channel to close.
        drop(tx);
    }

    #[tokio::test]
    async fn test_writer_errors_when_workers_vanish() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(ResultMessage::TaskCompleted).await.unwrap();
        drop(tx);

        let stats = Arc::new(BuildStats::default());
        let result = run_writer(MemorySink::new(), rx, 1, 1, stats).await;
        assert!(matches!(result, Err(BuildError::QueueClosed)));
    }
}
