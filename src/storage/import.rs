//! JSONL dataset import.
//!
//! Reads line-delimited JSON exports of posts and comments and loads them
//! into the content store. Boards and authors are created on first sight;
//! a board's subscriber count keeps the highest value seen. Malformed lines
//! and comments whose post never made it into the data set are counted and
//! skipped, not fatal.

use std::path::Path;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::sqlite::Result;
use super::ContentStore;

/// Counters for one imported file.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImportReport {
    pub imported: u64,
    /// Rows whose external id was already present.
    pub skipped: u64,
    /// Unparseable lines plus comments with no importable post.
    pub failed: u64,
}

#[derive(Debug, Deserialize)]
struct PostRecord {
    id: String,
    subreddit: String,
    author: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: i64,
    #[serde(default)]
    created_utc: Option<f64>,
    #[serde(default)]
    subreddit_subscribers: i64,
    #[serde(default)]
    author_created_utc: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CommentRecord {
    id: String,
    subreddit: String,
    author: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    created_utc: Option<f64>,
    link_id: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    subreddit_subscribers: i64,
    #[serde(default)]
    author_created_utc: Option<f64>,
}

// Timestamps arrive as integers or floats depending on the dump.
fn epoch(value: Option<f64>) -> i64 {
    value.unwrap_or(0.0) as i64
}

/// Drop a `t3_`-style kind prefix from an external id.
fn strip_kind(id: &str) -> &str {
    match id.split_once('_') {
        Some((kind, rest)) if kind.len() == 2 && kind.starts_with('t') => rest,
        _ => id,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

pub struct Importer {
    store: ContentStore,
}

impl Importer {
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }

    pub async fn import_posts(&self, path: &Path) -> Result<ImportReport> {
        let file = tokio::fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut report = ImportReport::default();
        let mut line_no = 0u64;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: PostRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Importer: bad post on line {}: {}", line_no, e);
                    report.failed += 1;
                    continue;
                }
            };
            self.import_post(&record, &mut report).await?;
            if line_no % 10_000 == 0 {
                tracing::info!("Importer: {} post lines processed", line_no);
            }
        }
        tracing::info!(
            "Importer: posts done, {} imported, {} skipped, {} failed",
            report.imported,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    pub async fn import_comments(&self, path: &Path) -> Result<ImportReport> {
        let file = tokio::fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut report = ImportReport::default();
        let mut line_no = 0u64;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: CommentRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Importer: bad comment on line {}: {}", line_no, e);
                    report.failed += 1;
                    continue;
                }
            };
            self.import_comment(&record, &mut report).await?;
            if line_no % 10_000 == 0 {
                tracing::info!("Importer: {} comment lines processed", line_no);
            }
        }
        tracing::info!(
            "Importer: comments done, {} imported, {} skipped, {} failed",
            report.imported,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    async fn import_post(&self, record: &PostRecord, report: &mut ImportReport) -> Result<()> {
        self.store
            .upsert_board(&record.subreddit, record.subreddit_subscribers)
            .await?;
        self.store
            .upsert_user(&record.author, epoch(record.author_created_utc))
            .await?;
        let created = self
            .store
            .insert_post_row(
                strip_kind(&record.id),
                &record.subreddit,
                &record.author,
                &record.title,
                non_empty(record.url.clone()).as_deref(),
                non_empty(record.selftext.clone()).as_deref(),
                record.score,
                record.num_comments,
                epoch(record.created_utc),
            )
            .await?;
        if created {
            report.imported += 1;
        } else {
            report.skipped += 1;
        }
        Ok(())
    }

    async fn import_comment(
        &self,
        record: &CommentRecord,
        report: &mut ImportReport,
    ) -> Result<()> {
        let post_external_id = strip_kind(&record.link_id);
        if !self.store.post_exists(post_external_id).await? {
            report.failed += 1;
            return Ok(());
        }
        self.store
            .upsert_board(&record.subreddit, record.subreddit_subscribers)
            .await?;
        self.store
            .upsert_user(&record.author, epoch(record.author_created_utc))
            .await?;
        // A `t3_` parent means a direct reply to the post itself; only
        // `t1_` parents form comment chains.
        let parent = record
            .parent_id
            .as_deref()
            .and_then(|p| p.strip_prefix("t1_"));
        let created = self
            .store
            .insert_comment_row(
                strip_kind(&record.id),
                post_external_id,
                parent,
                &record.subreddit,
                &record.author,
                non_empty(record.body.clone()).as_deref(),
                record.score,
                epoch(record.created_utc),
            )
            .await?;
        if created {
            report.imported += 1;
        } else {
            report.skipped += 1;
        }
        Ok(())
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::tests::open_test_store;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn write_lines(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn test_strip_kind() {
        assert_eq!(strip_kind("t3_abc"), "abc");
        assert_eq!(strip_kind("t1_def"), "def");
        assert_eq!(strip_kind("plain"), "plain");
        assert_eq!(strip_kind("weird_name"), "weird_name");
    }

    #[tokio::test]
    async fn test_import_posts_handles_duplicates_and_garbage() {
        let (store, temp) = open_test_store().await;
        let path = write_lines(
            temp.path(),
            "posts.jsonl",
            &[
                r#"{"id":"p1","subreddit":"rust","author":"alice","title":"First","selftext":"hello","url":"","score":4,"num_comments":1,"created_utc":100,"subreddit_subscribers":500,"author_created_utc":50}"#,
                r#"{"id":"p1","subreddit":"rust","author":"alice","title":"First again","score":9,"created_utc":100}"#,
                "this is not json",
                "",
            ],
        );

        let importer = Importer::new(store.clone());
        let report = importer.import_posts(&path).await.unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);

        assert!(store.post_exists("p1").await.unwrap());
        let board = store.get_board("rust").await.unwrap().unwrap();
        assert_eq!(board.subscribers, 500);
        let user = store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(user.created_utc, 50);
        // Empty strings import as absent, not as empty values.
        let post = store.get_post(1).await.unwrap().unwrap();
        assert_eq!(post.url, None);
        assert_eq!(post.body.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_import_comments_links_and_skips_orphans() {
        let (store, temp) = open_test_store().await;
        let posts = write_lines(
            temp.path(),
            "posts.jsonl",
            &[
                r#"{"id":"p1","subreddit":"rust","author":"alice","title":"First","created_utc":100}"#,
            ],
        );
        let comments = write_lines(
            temp.path(),
            "comments.jsonl",
            &[
                // Direct reply to the post: no comment parent.
                r#"{"id":"c1","subreddit":"rust","author":"bob","body":"top level","score":2,"created_utc":110,"link_id":"t3_p1","parent_id":"t3_p1"}"#,
                // Reply to c1.
                r#"{"id":"c2","subreddit":"rust","author":"alice","body":"nested","score":1,"created_utc":120,"link_id":"t3_p1","parent_id":"t1_c1"}"#,
                // Post never imported.
                r#"{"id":"c3","subreddit":"rust","author":"bob","body":"lost","score":0,"created_utc":130,"link_id":"t3_missing","parent_id":"t3_missing"}"#,
            ],
        );

        let importer = Importer::new(store.clone());
        importer.import_posts(&posts).await.unwrap();
        let report = importer.import_comments(&comments).await.unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.failed, 1);

        let thread = store.comments_for_post("p1").await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].external_id, "c1");
        assert_eq!(thread[0].parent_external_id, None);
        assert_eq!(thread[1].parent_external_id.as_deref(), Some("c1"));
        // The commenter became a known user.
        assert!(store.get_user("bob").await.unwrap().is_some());
    }
}
