//! The parallel build pipeline: dispatcher, bounded queues, worker pool and
//! a single writer, run stage by stage.
//!
//! Stages never overlap. Within a stage, the dispatcher feeds the task queue
//! inline (its backpressure point), workers render concurrently, and the
//! writer is the only actor that touches the archive sink.

pub mod builder;
pub mod dispatch;
pub mod stage;
pub mod task;
pub mod worker;
pub mod writer;

pub use builder::{ArchiveBuilder, BuildReport};
pub use stage::{run_stage, StageKind, StageSpec};
pub use task::{BucketMaker, MiscTag, Section, Subtask, Task};
pub use writer::StageOutcome;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::render::RenderResult;

/// Task queue capacity. Independent of stage size; the dispatcher blocks
/// once this many tasks are outstanding.
pub const TASK_QUEUE_CAPACITY: usize = 8192;

/// Result queue capacity. Workers block once the writer falls this far
/// behind.
pub const RESULT_QUEUE_CAPACITY: usize = 1024;

/// Maximum post ids per `ContentBatch` task.
pub const POSTS_PER_TASK: usize = 64;

/// Listing row count above which a worker switches from an eager load to a
/// streaming cursor.
pub const STREAM_THRESHOLD: i64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    Media(#[from] crate::media::MediaError),
    #[error(transparent)]
    Archive(#[from] crate::archive::ArchiveError),
    #[error("pipeline queue closed unexpectedly")]
    QueueClosed,
    #[error("pipeline actor panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Everything a worker puts on the result queue. Control markers share the
/// queue with payloads so FIFO ordering makes a task's output visible to the
/// writer before its completion marker.
#[derive(Debug)]
pub enum ResultMessage {
    Rendered(RenderResult),
    TaskCompleted,
    WorkerStopped,
}

/// Run-wide counters, shared across stages. Workers bump `soft_failures`;
/// the writer owns the rest.
#[derive(Debug, Default)]
pub struct BuildStats {
    pub pages: AtomicU64,
    pub redirects: AtomicU64,
    pub data_entries: AtomicU64,
    pub scripts: AtomicU64,
    pub media_files: AtomicU64,
    pub soft_failures: AtomicU64,
    pub progress: AtomicU64,
}

impl BuildStats {
    pub fn soft_failure(&self) {
        self.soft_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pages: self.pages.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            data_entries: self.data_entries.load(Ordering::Relaxed),
            scripts: self.scripts.load(Ordering::Relaxed),
            media_files: self.media_files.load(Ordering::Relaxed),
            soft_failures: self.soft_failures.load(Ordering::Relaxed),
            progress: self.progress.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub pages: u64,
    pub redirects: u64,
    pub data_entries: u64,
    pub scripts: u64,
    pub media_files: u64,
    pub soft_failures: u64,
    pub progress: u64,
}
