//! Task data model and id bucketing.

use crate::storage::sqlite::Sort;

/// An aggregate entity addressed by a `SectionRender` task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Board(String),
    User(String),
}

/// One view of a section. `Listing` is the post listing for both boards and
/// users; `Comments` only applies to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subtask {
    Listing(Sort),
    Comments(Sort),
    Stats,
}

/// Singleton pages not tied to any one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiscTag {
    FrontPage,
    BoardList,
    GlobalStats,
    Scripts,
    InfoPages,
}

/// One immutable unit of work. Carries no identity beyond the label used
/// for logging; tasks are consumed exactly once and discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Terminate the receiving worker.
    Stop,
    /// Render a bounded group of posts.
    ContentBatch { ids: Vec<i64> },
    /// Render one view of one board or user.
    SectionRender { section: Section, subtask: Subtask },
    /// Render a singleton page.
    MiscRender { tag: MiscTag },
}

impl Task {
    /// Human-readable label for log lines.
    pub fn label(&self) -> String {
        match self {
            Task::Stop => "stop".to_string(),
            Task::ContentBatch { ids } => format!("batch of {} posts", ids.len()),
            Task::SectionRender { section, subtask } => {
                let (kind, name) = match section {
                    Section::Board(name) => ("board", name.as_str()),
                    Section::User(name) => ("user", name.as_str()),
                };
                let view = match subtask {
                    Subtask::Listing(sort) => format!("{} listing", sort.as_str()),
                    Subtask::Comments(sort) => format!("{} comments", sort.as_str()),
                    Subtask::Stats => "stats".to_string(),
                };
                format!("{} {} {}", kind, name, view)
            }
            Task::MiscRender { tag } => format!("misc {:?}", tag),
        }
    }
}

/// Accumulates entity ids and emits full `ContentBatch` tasks at the bound.
/// Call [`finish`](Self::finish) at end-of-stream for the trailing partial
/// batch.
pub struct BucketMaker {
    capacity: usize,
    ids: Vec<i64>,
}

impl BucketMaker {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            ids: Vec::with_capacity(capacity),
        }
    }

    pub fn feed(&mut self, id: i64) -> Option<Task> {
        self.ids.push(id);
        if self.ids.len() >= self.capacity {
            let ids = std::mem::replace(&mut self.ids, Vec::with_capacity(self.capacity));
            Some(Task::ContentBatch { ids })
        } else {
            None
        }
    }

    pub fn finish(mut self) -> Option<Task> {
        if self.ids.is_empty() {
            None
        } else {
            Some(Task::ContentBatch {
                ids: std::mem::take(&mut self.ids),
            })
        }
    }
}

// ---- tests ----
