//! SQLite-backed content store and media cache table access.
//!
//! Every worker opens its own `ContentStore` from a serializable
//! [`StoreConfig`] after spawn; live pools are never passed across the
//! spawn boundary.

use std::path::Path;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::models::{Board, BoardInfo, Comment, ContentStats, MediaEntry, Post, User};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Sort orders offered for post and comment listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sort {
    Top,
    New,
}

impl Sort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sort::Top => "top",
            Sort::New => "new",
        }
    }

    fn post_order_clause(&self) -> &'static str {
        match self {
            Sort::Top => "score DESC, id ASC",
            Sort::New => "created_utc DESC, id ASC",
        }
    }
}

/// Everything a worker needs to open its own store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_path: String,
}

impl StoreConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

/// Read-mostly store of archived entities plus the shared media cache table.
#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
}

impl ContentStore {
    /// Open (or create) the store at the configured path.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = Path::new(&config.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connection_string = format!("sqlite:{}?mode=rwc", config.db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(&connection_string)
            .await?;

        // WAL keeps readers unblocked while the download stage writes.
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Store: migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Quick connectivity check.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // === Counts ===

    pub async fn count_posts(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_boards(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM boards")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_users(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_posts_in_board(&self, board: &str) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE board_name = ?")
            .bind(board)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_posts_by_user(&self, user: &str) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE author_name = ?")
            .bind(user)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_comments_by_user(&self, user: &str) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM comments WHERE author_name = ?")
            .bind(user)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // === Enumeration for the dispatcher ===

    /// Stream all post ids in stable order.
    pub fn stream_post_ids(&self) -> BoxStream<'_, sqlx::Result<i64>> {
        sqlx::query_scalar("SELECT id FROM posts ORDER BY id").fetch(&self.pool)
    }

    /// Stream all posts in stable order; used by the download stage.
    pub fn stream_posts(&self) -> BoxStream<'_, sqlx::Result<Post>> {
        sqlx::query_as::<_, Post>("SELECT * FROM posts ORDER BY id").fetch(&self.pool)
    }

    pub async fn board_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM boards ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    pub async fn user_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM users ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    // === Entity loading for workers ===

    pub async fn get_post(&self, id: i64) -> Result<Option<Post>> {
        let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(post)
    }

    /// Load the comments of a post, oldest first.
    pub async fn comments_for_post(&self, post_external_id: &str) -> Result<Vec<Comment>> {
        let comments = sqlx::query_as::<_, Comment>(
            "SELECT * FROM comments WHERE post_external_id = ? ORDER BY created_utc, id",
        )
        .bind(post_external_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(comments)
    }

    pub async fn get_board(&self, name: &str) -> Result<Option<Board>> {
        let board = sqlx::query_as::<_, Board>("SELECT * FROM boards WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(board)
    }

    pub async fn get_user(&self, name: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Eager variant of the board listing; only for result sets known to be
    /// below the streaming threshold.
    pub async fn posts_in_board(&self, board: &str, sort: Sort) -> Result<Vec<Post>> {
        let query = format!(
            "SELECT * FROM posts WHERE board_name = ? ORDER BY {}",
            sort.post_order_clause()
        );
        let posts = sqlx::query_as::<_, Post>(&query)
            .bind(board.to_owned())
            .fetch_all(&self.pool)
            .await?;
        Ok(posts)
    }

    /// Cursor variant of the board listing; never materializes the full set.
    pub fn stream_posts_in_board<'a>(
        &'a self,
        board: &'a str,
        sort: Sort,
    ) -> BoxStream<'a, sqlx::Result<Post>> {
        let query = match sort {
            Sort::Top => "SELECT * FROM posts WHERE board_name = ? ORDER BY score DESC, id ASC",
            Sort::New => {
                "SELECT * FROM posts WHERE board_name = ? ORDER BY created_utc DESC, id ASC"
            }
        };
        sqlx::query_as::<_, Post>(query).bind(board).fetch(&self.pool)
    }

    pub async fn posts_by_user(&self, user: &str, sort: Sort) -> Result<Vec<Post>> {
        let query = format!(
            "SELECT * FROM posts WHERE author_name = ? ORDER BY {}",
            sort.post_order_clause()
        );
        let posts = sqlx::query_as::<_, Post>(&query)
            .bind(user.to_owned())
            .fetch_all(&self.pool)
            .await?;
        Ok(posts)
    }

    /// Cursor variant of the user post listing, for prolific authors.
    pub fn stream_posts_by_user<'a>(
        &'a self,
        user: &'a str,
        sort: Sort,
    ) -> BoxStream<'a, sqlx::Result<Post>> {
        let query = match sort {
            Sort::Top => "SELECT * FROM posts WHERE author_name = ? ORDER BY score DESC, id ASC",
            Sort::New => {
                "SELECT * FROM posts WHERE author_name = ? ORDER BY created_utc DESC, id ASC"
            }
        };
        sqlx::query_as::<_, Post>(query).bind(user).fetch(&self.pool)
    }

    pub async fn comments_by_user(&self, user: &str, sort: Sort) -> Result<Vec<Comment>> {
        let order = match sort {
            Sort::Top => "score DESC, id ASC",
            Sort::New => "created_utc DESC, id ASC",
        };
        let query = format!(
            "SELECT * FROM comments WHERE author_name = ? ORDER BY {}",
            order
        );
        let comments = sqlx::query_as::<_, Comment>(&query)
            .bind(user.to_owned())
            .fetch_all(&self.pool)
            .await?;
        Ok(comments)
    }

    /// Cursor variant of the user comment listing.
    pub fn stream_comments_by_user<'a>(
        &'a self,
        user: &'a str,
        sort: Sort,
    ) -> BoxStream<'a, sqlx::Result<Comment>> {
        let query = match sort {
            Sort::Top => "SELECT * FROM comments WHERE author_name = ? ORDER BY score DESC, id ASC",
            Sort::New => {
                "SELECT * FROM comments WHERE author_name = ? ORDER BY created_utc DESC, id ASC"
            }
        };
        sqlx::query_as::<_, Comment>(query).bind(user).fetch(&self.pool)
    }

    /// Boards ordered by post count, most active first.
    pub async fn top_boards(&self, limit: i64) -> Result<Vec<BoardInfo>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT board_name, COUNT(*) AS n FROM posts GROUP BY board_name \
             ORDER BY n DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, post_count)| BoardInfo { name, post_count })
            .collect())
    }

    /// All boards with their post counts, alphabetical.
    pub async fn board_infos(&self) -> Result<Vec<BoardInfo>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT board_name, COUNT(*) AS n FROM posts GROUP BY board_name \
             ORDER BY board_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, post_count)| BoardInfo { name, post_count })
            .collect())
    }

    // === Statistics ===

    async fn query_stats(&self, post_where: &str, comment_where: &str, bind: Option<&str>) -> Result<ContentStats> {
        let post_query = format!(
            "SELECT COUNT(*), COALESCE(SUM(score), 0), COALESCE(MIN(score), 0), \
             COALESCE(MAX(score), 0), COALESCE(MIN(created_utc), 0), \
             COALESCE(MAX(created_utc), 0), COUNT(DISTINCT author_name) \
             FROM posts WHERE {}",
            post_where
        );
        let mut q = sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64, i64)>(&post_query);
        if let Some(value) = bind {
            q = q.bind(value.to_owned());
        }
        let (post_count, total_score, min_score, max_score, oldest_utc, newest_utc, poster_count) =
            q.fetch_one(&self.pool).await?;

        let comment_query = format!(
            "SELECT COUNT(*), COUNT(DISTINCT author_name) FROM comments WHERE {}",
            comment_where
        );
        let mut q = sqlx::query_as::<_, (i64, i64)>(&comment_query);
        if let Some(value) = bind {
            q = q.bind(value.to_owned());
        }
        let (comment_count, commenter_count) = q.fetch_one(&self.pool).await?;

        Ok(ContentStats {
            post_count,
            comment_count,
            total_score,
            min_score,
            max_score,
            oldest_utc,
            newest_utc,
            poster_count,
            commenter_count,
        })
    }

    pub async fn global_stats(&self) -> Result<ContentStats> {
        self.query_stats("1 = 1", "1 = 1", None).await
    }

    pub async fn board_stats(&self, board: &str) -> Result<ContentStats> {
        self.query_stats("board_name = ?", "board_name = ?", Some(board))
            .await
    }

    pub async fn user_stats(&self, user: &str) -> Result<ContentStats> {
        self.query_stats("author_name = ?", "author_name = ?", Some(user))
            .await
    }

    // === Media cache ===

    pub async fn media_lookup(&self, canonical_url: &str) -> Result<Option<MediaEntry>> {
        let entry =
            sqlx::query_as::<_, MediaEntry>("SELECT * FROM media_files WHERE canonical_url = ?")
                .bind(canonical_url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(entry)
    }

    pub async fn media_get(&self, id: i64) -> Result<Option<MediaEntry>> {
        let entry = sqlx::query_as::<_, MediaEntry>("SELECT * FROM media_files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Find the entry owning bytes for a content hash, if any.
    pub async fn media_find_primary_by_hash(&self, hash: &str) -> Result<Option<MediaEntry>> {
        let entry = sqlx::query_as::<_, MediaEntry>(
            "SELECT * FROM media_files \
             WHERE content_hash = ? AND downloaded = 1 AND primary_id IS NULL \
             ORDER BY id LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn media_insert(
        &self,
        canonical_url: &str,
        content_hash: Option<&str>,
        mime_type: Option<&str>,
        downloaded: bool,
        size: i64,
        primary_id: Option<i64>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO media_files \
             (canonical_url, content_hash, mime_type, downloaded, size, primary_id) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(canonical_url) DO UPDATE SET canonical_url = canonical_url \
             RETURNING id",
        )
        .bind(canonical_url)
        .bind(content_hash)
        .bind(mime_type)
        .bind(downloaded)
        .bind(size)
        .bind(primary_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Snapshot of the whole media table, used by the per-worker rewriter.
    pub async fn media_all(&self) -> Result<Vec<MediaEntry>> {
        let entries = sqlx::query_as::<_, MediaEntry>("SELECT * FROM media_files ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    // === Import ===

    /// Create a board or raise its subscriber count, whichever is higher.
    pub async fn upsert_board(&self, name: &str, subscribers: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO boards (name, subscribers) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
             subscribers = MAX(subscribers, excluded.subscribers)",
        )
        .bind(name)
        .bind(subscribers)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_user(&self, name: &str, created_utc: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (name, created_utc) VALUES (?, ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a post unless its external id is already present. Returns
    /// whether a row was created.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_post_row(
        &self,
        external_id: &str,
        board_name: &str,
        author_name: &str,
        title: &str,
        url: Option<&str>,
        body: Option<&str>,
        score: i64,
        num_comments: i64,
        created_utc: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO posts \
             (external_id, board_name, author_name, title, url, body, score, num_comments, created_utc) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(external_id) DO NOTHING",
        )
        .bind(external_id)
        .bind(board_name)
        .bind(author_name)
        .bind(title)
        .bind(url)
        .bind(body)
        .bind(score)
        .bind(num_comments)
        .bind(created_utc)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_comment_row(
        &self,
        external_id: &str,
        post_external_id: &str,
        parent_external_id: Option<&str>,
        board_name: &str,
        author_name: &str,
        body: Option<&str>,
        score: i64,
        created_utc: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO comments \
             (external_id, post_external_id, parent_external_id, board_name, author_name, body, score, created_utc) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(external_id) DO NOTHING",
        )
        .bind(external_id)
        .bind(post_external_id)
        .bind(parent_external_id)
        .bind(board_name)
        .bind(author_name)
        .bind(body)
        .bind(score)
        .bind(created_utc)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn post_exists(&self, external_id: &str) -> Result<bool> {
        let row: Option<i64> = sqlx::query_scalar("SELECT 1 FROM posts WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn open_test_store() -> (ContentStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("store.db");
        let store = ContentStore::open(&StoreConfig::new(db_path.to_str().unwrap()))
            .await
            .unwrap();
        store.migrate().await.unwrap();
        (store, temp)
    }

    pub(crate) async fn insert_post(
        store: &ContentStore,
        external_id: &str,
        board: &str,
        author: &str,
        score: i64,
        created_utc: i64,
    ) -> i64 {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO posts (external_id, board_name, author_name, title, url, body, score, num_comments, created_utc) \
             VALUES (?, ?, ?, ?, NULL, NULL, ?, 0, ?) RETURNING id",
        )
        .bind(external_id)
        .bind(board)
        .bind(author)
        .bind(format!("Post {}", external_id))
        .bind(score)
        .bind(created_utc)
        .fetch_one(store.pool())
        .await
        .unwrap()
    }

    pub(crate) async fn insert_board(store: &ContentStore, name: &str, subscribers: i64) {
        sqlx::query("INSERT INTO boards (name, subscribers) VALUES (?, ?)")
            .bind(name)
            .bind(subscribers)
            .execute(store.pool())
            .await
            .unwrap();
    }

    pub(crate) async fn insert_user(store: &ContentStore, name: &str) {
        sqlx::query("INSERT INTO users (name, created_utc) VALUES (?, 0)")
            .bind(name)
            .execute(store.pool())
            .await
            .unwrap();
    }

    pub(crate) async fn insert_comment(
        store: &ContentStore,
        external_id: &str,
        post_external_id: &str,
        parent_external_id: Option<&str>,
        board: &str,
        author: &str,
    ) {
        sqlx::query(
            "INSERT INTO comments (external_id, post_external_id, parent_external_id, board_name, author_name, body, score, created_utc) \
             VALUES (?, ?, ?, ?, ?, 'a comment', 1, 0)",
        )
        .bind(external_id)
        .bind(post_external_id)
        .bind(parent_external_id)
        .bind(board)
        .bind(author)
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_open_and_migrate() {
        let (store, _temp) = open_test_store().await;
        assert!(store.health_check().await.is_ok());
        // Idempotent.
        assert!(store.migrate().await.is_ok());
    }

    #[tokio::test]
    async fn test_counts_and_sorting() {
        let (store, _temp) = open_test_store().await;
        insert_post(&store, "p1", "rust", "alice", 10, 100).await;
        insert_post(&store, "p2", "rust", "bob", 50, 200).await;
        insert_post(&store, "p3", "cooking", "alice", 5, 300).await;

        assert_eq!(store.count_posts().await.unwrap(), 3);
        assert_eq!(store.count_posts_in_board("rust").await.unwrap(), 2);
        assert_eq!(store.count_posts_by_user("alice").await.unwrap(), 2);
        insert_comment(&store, "c1", "p1", None, "rust", "bob").await;
        assert_eq!(store.count_comments_by_user("bob").await.unwrap(), 1);

        let top = store.posts_in_board("rust", Sort::Top).await.unwrap();
        assert_eq!(top[0].external_id, "p2");
        let new = store.posts_in_board("rust", Sort::New).await.unwrap();
        assert_eq!(new[0].external_id, "p2");
        assert_eq!(new[1].external_id, "p1");
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, _temp) = open_test_store().await;
        insert_post(&store, "p1", "rust", "alice", 10, 100).await;
        insert_post(&store, "p2", "rust", "bob", 30, 200).await;

        let stats = store.board_stats("rust").await.unwrap();
        assert_eq!(stats.post_count, 2);
        assert_eq!(stats.total_score, 40);
        assert_eq!(stats.max_score, 30);
        assert_eq!(stats.poster_count, 2);
        assert_eq!(stats.average_score(), Some(20.0));

        let empty = store.board_stats("missing").await.unwrap();
        assert_eq!(empty.post_count, 0);
        assert_eq!(empty.average_score(), None);
    }

    #[tokio::test]
    async fn test_user_streams_follow_sort_order() {
        use futures::TryStreamExt;

        let (store, _temp) = open_test_store().await;
        insert_post(&store, "p1", "rust", "alice", 10, 300).await;
        insert_post(&store, "p2", "rust", "alice", 50, 100).await;
        insert_post(&store, "p3", "rust", "bob", 99, 200).await;
        insert_comment(&store, "c1", "p1", None, "rust", "alice").await;

        let top: Vec<Post> = store
            .stream_posts_by_user("alice", Sort::Top)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].external_id, "p2");

        let new: Vec<Post> = store
            .stream_posts_by_user("alice", Sort::New)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(new[0].external_id, "p1");

        let comments: Vec<Comment> = store
            .stream_comments_by_user("alice", Sort::New)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(comments.len(), 1);
    }

    #[tokio::test]
    async fn test_upserts_and_conflict_handling() {
        let (store, _temp) = open_test_store().await;

        // Subscriber counts only ever move up.
        store.upsert_board("rust", 100).await.unwrap();
        store.upsert_board("rust", 50).await.unwrap();
        store.upsert_board("rust", 200).await.unwrap();
        let board = store.get_board("rust").await.unwrap().unwrap();
        assert_eq!(board.subscribers, 200);

        store.upsert_user("alice", 5).await.unwrap();
        store.upsert_user("alice", 9).await.unwrap();
        let user = store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(user.created_utc, 5);

        let created = store
            .insert_post_row("p1", "rust", "alice", "t", None, None, 1, 0, 0)
            .await
            .unwrap();
        assert!(created);
        let again = store
            .insert_post_row("p1", "rust", "alice", "t", None, None, 1, 0, 0)
            .await
            .unwrap();
        assert!(!again);
        assert!(store.post_exists("p1").await.unwrap());
        assert!(!store.post_exists("p2").await.unwrap());

        let created = store
            .insert_comment_row("c1", "p1", None, "rust", "alice", Some("hi"), 1, 0)
            .await
            .unwrap();
        assert!(created);
        let again = store
            .insert_comment_row("c1", "p1", None, "rust", "alice", Some("hi"), 1, 0)
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn test_media_insert_is_unique_per_url() {
        let (store, _temp) = open_test_store().await;
        let a = store
            .media_insert("http://example.com/a.png", Some("h1"), Some("image/png"), true, 10, None)
            .await
            .unwrap();
        // Conflicting insert returns the existing row id, no duplicate.
        let b = store
            .media_insert("http://example.com/a.png", None, None, false, 0, None)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.media_all().await.unwrap().len(), 1);
    }
}
