//! Row types for the content store and the media cache.

use serde::{Deserialize, Serialize};

/// A board (group) of posts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Board {
    pub name: String,
    pub subscribers: i64,
}

/// A registered author.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub name: String,
    pub created_utc: i64,
}

/// A primary content entity.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub external_id: String,
    pub board_name: String,
    pub author_name: String,
    pub title: String,
    pub url: Option<String>,
    pub body: Option<String>,
    pub score: i64,
    pub num_comments: i64,
    pub created_utc: i64,
}

/// A comment below a post. Parent linkage is expressed through external ids
/// so chains survive partial imports.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
    pub id: i64,
    pub external_id: String,
    pub post_external_id: String,
    pub parent_external_id: Option<String>,
    pub board_name: String,
    pub author_name: String,
    pub body: Option<String>,
    pub score: i64,
    pub created_utc: i64,
}

/// A post together with its comments, as loaded for rendering.
#[derive(Debug, Clone)]
pub struct PostThread {
    pub post: Post,
    pub comments: Vec<Comment>,
}

/// One media cache entry, keyed by canonical URL.
///
/// An entry with a non-null `primary_id` never owns physical bytes; it
/// borrows the primary's.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaEntry {
    pub id: i64,
    pub canonical_url: String,
    pub content_hash: Option<String>,
    pub mime_type: Option<String>,
    pub downloaded: bool,
    pub size: i64,
    pub primary_id: Option<i64>,
}

/// Aggregate statistics over a filtered set of posts and comments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentStats {
    pub post_count: i64,
    pub comment_count: i64,
    pub total_score: i64,
    pub min_score: i64,
    pub max_score: i64,
    pub oldest_utc: i64,
    pub newest_utc: i64,
    pub poster_count: i64,
    pub commenter_count: i64,
}

impl ContentStats {
    pub fn average_score(&self) -> Option<f64> {
        if self.post_count == 0 {
            return None;
        }
        Some(self.total_score as f64 / self.post_count as f64)
    }

    pub fn average_comments(&self) -> Option<f64> {
        if self.post_count == 0 {
            return None;
        }
        Some(self.comment_count as f64 / self.post_count as f64)
    }
}

/// Summary line for board index pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardInfo {
    pub name: String,
    pub post_count: i64,
}
