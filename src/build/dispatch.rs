//! Dispatcher: enumerates the content store for one stage and partitions it
//! into tasks.
//!
//! Runs inline on the coordinating task; a full task queue blocks it, which
//! is the pipeline's primary backpressure point. Store query failures are
//! fatal to the stage.

use futures::TryStreamExt;
use tokio::sync::mpsc::Sender;

use super::stage::{StageKind, StageSpec};
use super::task::{BucketMaker, MiscTag, Section, Subtask, Task};
use super::{BuildError, Result};
use crate::storage::sqlite::Sort;
use crate::storage::{ContentStore, StorageError};

pub(crate) async fn send(tx: &Sender<Task>, task: Task) -> Result<()> {
    tx.send(task).await.map_err(|_| BuildError::QueueClosed)
}

/// Publish every task for one stage, in order. Returns the task count
/// (`Stop` tasks are pushed separately by the stage coordinator).
pub async fn dispatch_stage(
    store: &ContentStore,
    spec: &StageSpec,
    tx: &Sender<Task>,
) -> Result<u64> {
    let dispatched = match spec.kind {
        StageKind::Posts => dispatch_posts(store, spec.batch_size, tx).await?,
        StageKind::Boards => dispatch_boards(store, spec.with_stats, tx).await?,
        StageKind::Users => dispatch_users(store, spec.with_stats, tx).await?,
        StageKind::Misc => dispatch_misc(spec.with_stats, tx).await?,
    };
    tracing::info!(
        "Dispatcher: stage '{}' published {} tasks",
        spec.name(),
        dispatched
    );
    Ok(dispatched)
}

async fn dispatch_posts(store: &ContentStore, batch_size: usize, tx: &Sender<Task>) -> Result<u64> {
    let mut maker = BucketMaker::new(batch_size);
    let mut dispatched = 0u64;
    let mut ids = store.stream_post_ids();
    while let Some(id) = ids.try_next().await.map_err(StorageError::from)? {
        if let Some(task) = maker.feed(id) {
            send(tx, task).await?;
            dispatched += 1;
        }
    }
    drop(ids);
    if let Some(task) = maker.finish() {
        send(tx, task).await?;
        dispatched += 1;
    }
    Ok(dispatched)
}

async fn dispatch_boards(store: &ContentStore, with_stats: bool, tx: &Sender<Task>) -> Result<u64> {
    let mut dispatched = 0u64;
    for name in store.board_names().await? {
        let mut subtasks = vec![Subtask::Listing(Sort::Top), Subtask::Listing(Sort::New)];
        if with_stats {
            subtasks.push(Subtask::Stats);
        }
        for subtask in subtasks {
            send(
                tx,
                Task::SectionRender {
                    section: Section::Board(name.clone()),
                    subtask,
                },
            )
            .await?;
            dispatched += 1;
        }
    }
    Ok(dispatched)
}

async fn dispatch_users(store: &ContentStore, with_stats: bool, tx: &Sender<Task>) -> Result<u64> {
    let mut dispatched = 0u64;
    for name in store.user_names().await? {
        let mut subtasks = vec![
            Subtask::Listing(Sort::Top),
            Subtask::Listing(Sort::New),
            Subtask::Comments(Sort::Top),
            Subtask::Comments(Sort::New),
        ];
        if with_stats {
            subtasks.push(Subtask::Stats);
        }
        for subtask in subtasks {
            send(
                tx,
                Task::SectionRender {
                    section: Section::User(name.clone()),
                    subtask,
                },
            )
            .await?;
            dispatched += 1;
        }
    }
    Ok(dispatched)
}

async fn dispatch_misc(with_stats: bool, tx: &Sender<Task>) -> Result<u64> {
    let mut tags = vec![
        MiscTag::FrontPage,
        MiscTag::BoardList,
        MiscTag::Scripts,
        MiscTag::InfoPages,
    ];
    if with_stats {
        tags.push(MiscTag::GlobalStats);
    }
    let count = tags.len() as u64;
    for tag in tags {
        send(tx, Task::MiscRender { tag }).await?;
    }
    Ok(count)
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::tests::{insert_board, insert_post, insert_user, open_test_store};
    use tokio::sync::mpsc;

    async fn drain(rx: &mut mpsc::Receiver<Task>) -> Vec<Task> {
        let mut tasks = Vec::new();
        while let Ok(task) = rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    #[tokio::test]
    async fn test_dispatch_posts_buckets_ids() {
        let (store, _temp) = open_test_store().await;
        for i in 0..5 {
            insert_post(&store, &format!("p{}", i), "rust", "alice", i, i).await;
        }
        let spec = StageSpec {
            kind: StageKind::Posts,
            batch_size: 2,
            with_stats: false,
        };
        let (tx, mut rx) = mpsc::channel(64);
        let dispatched = dispatch_stage(&store, &spec, &tx).await.unwrap();
        assert_eq!(dispatched, 3);

        let tasks = drain(&mut rx).await;
        let sizes: Vec<usize> = tasks
            .iter()
            .map(|t| match t {
                Task::ContentBatch { ids } => ids.len(),
                other => panic!("unexpected task {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_dispatch_boards_emits_per_view_tasks() {
        let (store, _temp) = open_test_store().await;
        insert_board(&store, "rust", 10).await;
        insert_board(&store, "cooking", 5).await;
        let spec = StageSpec {
            kind: StageKind::Boards,
            batch_size: 64,
            with_stats: true,
        };
        let (tx, mut rx) = mpsc::channel(64);
        let dispatched = dispatch_stage(&store, &spec, &tx).await.unwrap();
        // Two listings plus stats, per board.
        assert_eq!(dispatched, 6);
        assert_eq!(drain(&mut rx).await.len(), 6);
    }

    #[tokio::test]
    async fn test_dispatch_users_skips_stats_when_disabled() {
        let (store, _temp) = open_test_store().await;
        insert_user(&store, "alice").await;
        let spec = StageSpec {
            kind: StageKind::Users,
            batch_size: 64,
            with_stats: false,
        };
        let (tx, mut rx) = mpsc::channel(64);
        let dispatched = dispatch_stage(&store, &spec, &tx).await.unwrap();
        assert_eq!(dispatched, 4);
        let tasks = drain(&mut rx).await;
        assert!(tasks.iter().all(|t| !matches!(
            t,
            Task::SectionRender {
                subtask: Subtask::Stats,
                ..
            }
        )));
    }
}
