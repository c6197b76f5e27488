//! Worker: executes one task at a time, turning content-store reads into
//! rendered unit chunks.
//!
//! Workers share the task queue receiver behind a mutex and hold the lock
//! only long enough to pop one task. Render and store failures are isolated
//! to the task at hand; only a closed queue tears a worker down.

use std::sync::Arc;

use futures::TryStreamExt;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Mutex;

use super::task::{MiscTag, Section, Subtask, Task};
use super::{BuildError, BuildStats, Result, ResultMessage, STREAM_THRESHOLD};
use crate::models::PostThread;
use crate::render::html::BOARDS_ON_FRONT_PAGE;
use crate::render::{PageRenderer, RenderResult, UnitAccumulator};
use crate::storage::sqlite::Sort;
use crate::storage::{ContentStore, StorageError};

fn page_count(total: usize, page_size: usize) -> usize {
    (total.div_ceil(page_size)).max(1)
}

async fn push(results: &Sender<ResultMessage>, msg: ResultMessage) -> Result<()> {
    results.send(msg).await.map_err(|_| BuildError::QueueClosed)
}

async fn push_chunks(results: &Sender<ResultMessage>, chunks: Vec<RenderResult>) -> Result<()> {
    for chunk in chunks {
        push(results, ResultMessage::Rendered(chunk)).await?;
    }
    Ok(())
}

pub struct Worker {
    id: usize,
    store: ContentStore,
    renderer: Box<dyn PageRenderer>,
    page_size: usize,
    stream_threshold: i64,
    stats: Arc<BuildStats>,
}

impl Worker {
    pub fn new(
        id: usize,
        store: ContentStore,
        renderer: Box<dyn PageRenderer>,
        page_size: usize,
        stats: Arc<BuildStats>,
    ) -> Self {
        Self {
            id,
            store,
            renderer,
            page_size,
            stream_threshold: STREAM_THRESHOLD,
            stats,
        }
    }

    #[cfg(test)]
    fn with_stream_threshold(mut self, threshold: i64) -> Self {
        self.stream_threshold = threshold;
        self
    }

    /// Main loop. Returns when a `Stop` task arrives; a closed queue on
    /// either side is an error since shutdown is strictly cooperative.
    pub async fn run(
        mut self,
        tasks: Arc<Mutex<Receiver<Task>>>,
        results: Sender<ResultMessage>,
    ) -> Result<()> {
        loop {
            let task = {
                let mut rx = tasks.lock().await;
                rx.recv().await
            };
            let Some(task) = task else {
                return Err(BuildError::QueueClosed);
            };
            if matches!(task, Task::Stop) {
                push(&results, ResultMessage::WorkerStopped).await?;
                tracing::debug!("Worker {}: stopped", self.id);
                return Ok(());
            }
            let label = task.label();
            tracing::debug!("Worker {}: running task '{}'", self.id, label);
            match self.execute(task, &results).await {
                Ok(()) => {}
                Err(BuildError::QueueClosed) => return self.drain(&tasks).await,
                Err(e) => {
                    // Isolated to this task; the stage keeps going.
                    tracing::warn!("Worker {}: task '{}' failed: {}", self.id, label, e);
                    self.stats.soft_failure();
                }
            }
            if push(&results, ResultMessage::TaskCompleted).await.is_err() {
                return self.drain(&tasks).await;
            }
        }
    }

    /// The writer is gone, so the run is failing; keep consuming tasks until
    /// our `Stop` arrives. The dispatcher sends over a bounded queue and
    /// would otherwise block forever against a full one.
    async fn drain(&self, tasks: &Arc<Mutex<Receiver<Task>>>) -> Result<()> {
        tracing::warn!(
            "Worker {}: result queue closed, discarding remaining tasks",
            self.id
        );
        loop {
            let task = {
                let mut rx = tasks.lock().await;
                rx.recv().await
            };
            match task {
                Some(Task::Stop) | None => return Err(BuildError::QueueClosed),
                Some(_) => {}
            }
        }
    }

    async fn execute(&mut self, task: Task, results: &Sender<ResultMessage>) -> Result<()> {
        match task {
            Task::Stop => Ok(()),
            Task::ContentBatch { ids } => self.render_posts(&ids, results).await,
            Task::SectionRender { section, subtask } => match (section, subtask) {
                (Section::Board(name), Subtask::Listing(sort)) => {
                    self.render_board_listing(&name, sort, results).await
                }
                (Section::Board(name), Subtask::Stats) => {
                    self.render_board_stats(&name, results).await
                }
                (Section::Board(name), Subtask::Comments(_)) => {
                    tracing::warn!("Worker {}: no comment view for board {}", self.id, name);
                    self.stats.soft_failure();
                    Ok(())
                }
                (Section::User(name), Subtask::Listing(sort)) => {
                    self.render_user_posts(&name, sort, results).await
                }
                (Section::User(name), Subtask::Comments(sort)) => {
                    self.render_user_comments(&name, sort, results).await
                }
                (Section::User(name), Subtask::Stats) => {
                    self.render_user_stats(&name, results).await
                }
            },
            Task::MiscRender { tag } => self.render_misc(tag, results).await,
        }
    }

    async fn render_posts(&mut self, ids: &[i64], results: &Sender<ResultMessage>) -> Result<()> {
        let mut acc = UnitAccumulator::new();
        for &id in ids {
            let Some(post) = self.store.get_post(id).await? else {
                tracing::warn!("Worker {}: post {} vanished, skipping", self.id, id);
                self.stats.soft_failure();
                continue;
            };
            let comments = self.store.comments_for_post(&post.external_id).await?;
            let thread = PostThread { post, comments };
            let chunks = acc.extend(self.renderer.render_post(&thread));
            push_chunks(results, chunks).await?;
        }
        if let Some(chunk) = acc.finish() {
            push(results, ResultMessage::Rendered(chunk)).await?;
        }
        Ok(())
    }

    async fn render_board_listing(
        &mut self,
        name: &str,
        sort: Sort,
        results: &Sender<ResultMessage>,
    ) -> Result<()> {
        let Some(board) = self.store.get_board(name).await? else {
            tracing::warn!("Worker {}: board {} not found, skipping", self.id, name);
            self.stats.soft_failure();
            return Ok(());
        };
        let total = self.store.count_posts_in_board(name).await?;
        let total_pages = page_count(total as usize, self.page_size);
        let mut acc = UnitAccumulator::new();

        if total >= self.stream_threshold {
            // Large boards go through a cursor; only one page of rows is
            // resident at a time.
            let mut page = Vec::with_capacity(self.page_size);
            let mut page_no = 1usize;
            let mut rows = self.store.stream_posts_in_board(name, sort);
            while let Some(post) = rows.try_next().await.map_err(StorageError::from)? {
                page.push(post);
                if page.len() == self.page_size {
                    let units = self
                        .renderer
                        .render_board_page(&board, &page, sort, page_no, total_pages, total);
                    push_chunks(results, acc.extend(units)).await?;
                    page.clear();
                    page_no += 1;
                }
            }
            drop(rows);
            if !page.is_empty() || page_no == 1 {
                let units = self
                    .renderer
                    .render_board_page(&board, &page, sort, page_no, total_pages, total);
                push_chunks(results, acc.extend(units)).await?;
            }
        } else {
            let posts = self.store.posts_in_board(name, sort).await?;
            if posts.is_empty() {
                let units = self
                    .renderer
                    .render_board_page(&board, &[], sort, 1, total_pages, total);
                push_chunks(results, acc.extend(units)).await?;
            } else {
                for (i, page) in posts.chunks(self.page_size).enumerate() {
                    let units = self
                        .renderer
                        .render_board_page(&board, page, sort, i + 1, total_pages, total);
                    push_chunks(results, acc.extend(units)).await?;
                }
            }
        }
        if let Some(chunk) = acc.finish() {
            push(results, ResultMessage::Rendered(chunk)).await?;
        }
        Ok(())
    }

    async fn render_board_stats(
        &mut self,
        name: &str,
        results: &Sender<ResultMessage>,
    ) -> Result<()> {
        let Some(board) = self.store.get_board(name).await? else {
            self.stats.soft_failure();
            return Ok(());
        };
        let stats = self.store.board_stats(name).await?;
        let units = self.renderer.render_board_stats(&board, &stats);
        push(results, ResultMessage::Rendered(units)).await
    }

    async fn render_user_posts(
        &mut self,
        name: &str,
        sort: Sort,
        results: &Sender<ResultMessage>,
    ) -> Result<()> {
        let Some(user) = self.store.get_user(name).await? else {
            tracing::warn!("Worker {}: user {} not found, skipping", self.id, name);
            self.stats.soft_failure();
            return Ok(());
        };
        let total = self.store.count_posts_by_user(name).await?;
        let total_pages = page_count(total as usize, self.page_size);
        let mut acc = UnitAccumulator::new();

        if total >= self.stream_threshold {
            // Prolific authors go through a cursor like large boards.
            let mut page = Vec::with_capacity(self.page_size);
            let mut page_no = 1usize;
            let mut rows = self.store.stream_posts_by_user(name, sort);
            while let Some(post) = rows.try_next().await.map_err(StorageError::from)? {
                page.push(post);
                if page.len() == self.page_size {
                    let units = self
                        .renderer
                        .render_user_posts_page(&user, &page, sort, page_no, total_pages);
                    push_chunks(results, acc.extend(units)).await?;
                    page.clear();
                    page_no += 1;
                }
            }
            drop(rows);
            if !page.is_empty() || page_no == 1 {
                let units = self
                    .renderer
                    .render_user_posts_page(&user, &page, sort, page_no, total_pages);
                push_chunks(results, acc.extend(units)).await?;
            }
        } else {
            let posts = self.store.posts_by_user(name, sort).await?;
            if posts.is_empty() {
                let units = self
                    .renderer
                    .render_user_posts_page(&user, &[], sort, 1, total_pages);
                push_chunks(results, acc.extend(units)).await?;
            } else {
                for (i, page) in posts.chunks(self.page_size).enumerate() {
                    let units = self
                        .renderer
                        .render_user_posts_page(&user, page, sort, i + 1, total_pages);
                    push_chunks(results, acc.extend(units)).await?;
                }
            }
        }
        if let Some(chunk) = acc.finish() {
            push(results, ResultMessage::Rendered(chunk)).await?;
        }
        Ok(())
    }

    async fn render_user_comments(
        &mut self,
        name: &str,
        sort: Sort,
        results: &Sender<ResultMessage>,
    ) -> Result<()> {
        let Some(user) = self.store.get_user(name).await? else {
            self.stats.soft_failure();
            return Ok(());
        };
        let total = self.store.count_comments_by_user(name).await?;
        let total_pages = page_count(total as usize, self.page_size);
        let mut acc = UnitAccumulator::new();

        if total >= self.stream_threshold {
            let mut page = Vec::with_capacity(self.page_size);
            let mut page_no = 1usize;
            let mut rows = self.store.stream_comments_by_user(name, sort);
            while let Some(comment) = rows.try_next().await.map_err(StorageError::from)? {
                page.push(comment);
                if page.len() == self.page_size {
                    let units = self
                        .renderer
                        .render_user_comments_page(&user, &page, sort, page_no, total_pages);
                    push_chunks(results, acc.extend(units)).await?;
                    page.clear();
                    page_no += 1;
                }
            }
            drop(rows);
            if !page.is_empty() || page_no == 1 {
                let units = self
                    .renderer
                    .render_user_comments_page(&user, &page, sort, page_no, total_pages);
                push_chunks(results, acc.extend(units)).await?;
            }
        } else {
            let comments = self.store.comments_by_user(name, sort).await?;
            if comments.is_empty() {
                let units = self
                    .renderer
                    .render_user_comments_page(&user, &[], sort, 1, total_pages);
                push_chunks(results, acc.extend(units)).await?;
            } else {
                for (i, page) in comments.chunks(self.page_size).enumerate() {
                    let units = self
                        .renderer
                        .render_user_comments_page(&user, page, sort, i + 1, total_pages);
                    push_chunks(results, acc.extend(units)).await?;
                }
            }
        }
        if let Some(chunk) = acc.finish() {
            push(results, ResultMessage::Rendered(chunk)).await?;
        }
        Ok(())
    }

    async fn render_user_stats(
        &mut self,
        name: &str,
        results: &Sender<ResultMessage>,
    ) -> Result<()> {
        let Some(user) = self.store.get_user(name).await? else {
            self.stats.soft_failure();
            return Ok(());
        };
        let stats = self.store.user_stats(name).await?;
        let units = self.renderer.render_user_stats(&user, &stats);
        push(results, ResultMessage::Rendered(units)).await
    }

    async fn render_misc(&mut self, tag: MiscTag, results: &Sender<ResultMessage>) -> Result<()> {
        let units = match tag {
            MiscTag::FrontPage => {
                let boards = self.store.top_boards(BOARDS_ON_FRONT_PAGE).await?;
                self.renderer.render_front_page(&boards)
            }
            MiscTag::BoardList => {
                let boards = self.store.board_infos().await?;
                self.renderer.render_board_list(&boards)
            }
            MiscTag::GlobalStats => {
                let stats = self.store.global_stats().await?;
                self.renderer.render_global_stats(&stats)
            }
            MiscTag::Scripts => self.renderer.render_scripts(),
            MiscTag::InfoPages => self.renderer.render_info_pages(),
        };
        push(results, ResultMessage::Rendered(units)).await
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaRewriter, RewritePolicy};
    use crate::render::{HtmlRenderer, RenderOptions, RenderedUnit};
    use crate::storage::sqlite::tests::{
        insert_board, insert_comment, insert_post, insert_user, open_test_store,
    };
    use tokio::sync::mpsc;

    fn test_renderer() -> Box<dyn PageRenderer> {
        Box::new(HtmlRenderer::new(
            RenderOptions::default(),
            MediaRewriter::from_entries(Vec::new(), true, RewritePolicy::default()),
        ))
    }

    async fn run_worker(store: ContentStore, tasks: Vec<Task>) -> (Vec<ResultMessage>, u64) {
        run_worker_with_threshold(store, tasks, STREAM_THRESHOLD).await
    }

    async fn run_worker_with_threshold(
        store: ContentStore,
        tasks: Vec<Task>,
        threshold: i64,
    ) -> (Vec<ResultMessage>, u64) {
        let stats = Arc::new(BuildStats::default());
        let (task_tx, task_rx) = mpsc::channel(64);
        let (result_tx, mut result_rx) = mpsc::channel(1024);
        for task in tasks {
            task_tx.send(task).await.unwrap();
        }
        task_tx.send(Task::Stop).await.unwrap();
        drop(task_tx);

        let worker = Worker::new(0, store, test_renderer(), 20, stats.clone())
            .with_stream_threshold(threshold);
        let handle = tokio::spawn(worker.run(Arc::new(Mutex::new(task_rx)), result_tx));

        let mut messages = Vec::new();
        while let Some(msg) = result_rx.recv().await {
            messages.push(msg);
        }
        handle.await.unwrap().unwrap();
        let failures = stats.snapshot().soft_failures;
        (messages, failures)
    }

    #[tokio::test]
    async fn test_units_precede_completion_marker() {
        let (store, _temp) = open_test_store().await;
        insert_board(&store, "rust", 1).await;
        insert_user(&store, "alice").await;
        let id = insert_post(&store, "p1", "rust", "alice", 5, 100).await;
        insert_comment(&store, "c1", "p1", None, "rust", "alice").await;

        let (messages, failures) =
            run_worker(store, vec![Task::ContentBatch { ids: vec![id] }]).await;
        assert_eq!(failures, 0);
        assert!(matches!(messages[0], ResultMessage::Rendered(_)));
        assert!(matches!(messages[1], ResultMessage::TaskCompleted));
        assert!(matches!(
            messages.last().unwrap(),
            ResultMessage::WorkerStopped
        ));
    }

    #[tokio::test]
    async fn test_missing_post_is_soft_failure() {
        let (store, _temp) = open_test_store().await;
        let id = insert_post(&store, "p1", "rust", "alice", 5, 100).await;

        let (messages, failures) =
            run_worker(store, vec![Task::ContentBatch { ids: vec![id, 9999] }]).await;
        assert_eq!(failures, 1);
        // The surviving post still renders and the task still completes.
        assert!(messages
            .iter()
            .any(|m| matches!(m, ResultMessage::Rendered(_))));
        assert_eq!(
            messages
                .iter()
                .filter(|m| matches!(m, ResultMessage::TaskCompleted))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_board_listing_pages() {
        let (store, _temp) = open_test_store().await;
        insert_board(&store, "rust", 1).await;
        for i in 0..45 {
            insert_post(&store, &format!("p{}", i), "rust", "alice", i, i).await;
        }

        let (messages, failures) = run_worker(
            store,
            vec![Task::SectionRender {
                section: Section::Board("rust".into()),
                subtask: Subtask::Listing(Sort::Top),
            }],
        )
        .await;
        assert_eq!(failures, 0);
        let pages: Vec<String> = messages
            .iter()
            .filter_map(|m| match m {
                ResultMessage::Rendered(units) => Some(units),
                _ => None,
            })
            .flatten()
            .filter_map(|u| match u {
                RenderedUnit::Page { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect();
        // 45 posts at 20 per page.
        assert_eq!(
            pages,
            vec![
                "board/rust/top_1.html",
                "board/rust/top_2.html",
                "board/rust/top_3.html"
            ]
        );
    }

    #[tokio::test]
    async fn test_user_listing_streams_above_threshold() {
        let (store, _temp) = open_test_store().await;
        insert_user(&store, "alice").await;
        for i in 0..45 {
            insert_post(&store, &format!("p{}", i), "rust", "alice", i, i).await;
        }

        // Threshold below the row count forces the cursor path.
        let (messages, failures) = run_worker_with_threshold(
            store,
            vec![Task::SectionRender {
                section: Section::User("alice".into()),
                subtask: Subtask::Listing(Sort::Top),
            }],
            10,
        )
        .await;
        assert_eq!(failures, 0);
        let pages: Vec<String> = messages
            .iter()
            .filter_map(|m| match m {
                ResultMessage::Rendered(units) => Some(units),
                _ => None,
            })
            .flatten()
            .filter_map(|u| match u {
                RenderedUnit::Page { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            pages,
            vec![
                "user/alice/posts_top_1.html",
                "user/alice/posts_top_2.html",
                "user/alice/posts_top_3.html"
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_result_queue_drains_task_queue() {
        let (store, _temp) = open_test_store().await;
        let id = insert_post(&store, "p1", "rust", "alice", 5, 100).await;

        let stats = Arc::new(BuildStats::default());
        let (task_tx, task_rx) = mpsc::channel(64);
        let (result_tx, result_rx) = mpsc::channel::<ResultMessage>(8);
        // The writer is gone before the worker produces anything.
        drop(result_rx);
        for _ in 0..10 {
            task_tx
                .send(Task::ContentBatch { ids: vec![id] })
                .await
                .unwrap();
        }
        task_tx.send(Task::Stop).await.unwrap();

        let tasks = Arc::new(Mutex::new(task_rx));
        let worker = Worker::new(0, store, test_renderer(), 20, stats);
        let result = worker.run(tasks.clone(), result_tx).await;
        assert!(matches!(result, Err(BuildError::QueueClosed)));

        // Every queued task was consumed, so a dispatcher blocked on a full
        // task queue would have been unblocked.
        let mut rx = tasks.lock().await;
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_missing_board_skipped_not_fatal() {
        let (store, _temp) = open_test_store().await;
        let (messages, failures) = run_worker(
            store,
            vec![Task::SectionRender {
                section: Section::Board("ghost".into()),
                subtask: Subtask::Listing(Sort::New),
            }],
        )
        .await;
        assert_eq!(failures, 1);
        assert_eq!(
            messages
                .iter()
                .filter(|m| matches!(m, ResultMessage::TaskCompleted))
                .count(),
            1
        );
    }
}
