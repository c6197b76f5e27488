//! Build configuration, loadable from a JSON file and overridable from the
//! command line.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::build::POSTS_PER_TASK;
use crate::media::RewritePolicy;
use crate::render::html::POSTS_PER_PAGE;
use crate::render::RenderOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Render worker count. Defaults to the number of CPUs.
    pub worker_count: usize,
    /// When set, each worker opens its own store connection instead of
    /// sharing the coordinator's pool.
    pub isolate_workers: bool,
    /// Maximum post ids per batch task.
    pub batch_size: usize,
    pub posts_per_page: usize,
    /// Render per-board, per-user and global statistics pages.
    pub with_stats: bool,
    /// Render per-user pages at all.
    pub with_users: bool,
    /// Rewrite external media URLs to archive-internal paths.
    pub rewrite_media: bool,
    pub media_policy: RewritePolicy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            isolate_workers: false,
            batch_size: POSTS_PER_TASK,
            posts_per_page: POSTS_PER_PAGE,
            with_stats: true,
            with_users: true,
            rewrite_media: true,
            media_policy: RewritePolicy::default(),
        }
    }
}

impl BuildOptions {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            with_stats: self.with_stats,
            with_users: self.with_users,
        }
    }
}
