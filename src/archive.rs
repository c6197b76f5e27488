//! Archive output layer.
//!
//! The writer is the only component that touches a sink, so implementations
//! are free to be stateful and non-reentrant. `DirectorySink` produces a
//! browsable directory tree plus a manifest; `MemorySink` records calls for
//! tests.

use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("duplicate archive path: {0}")]
    DuplicatePath(String),
    #[error("invalid archive path: {0}")]
    InvalidPath(String),
    #[error("manifest serialization error: {0}")]
    Manifest(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Totals reported by [`ArchiveSink::finalize`].
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ArchiveSummary {
    pub entries: u64,
    pub bytes: u64,
}

/// Destination for rendered artifacts. Exactly one writer drives a sink;
/// entry paths must be unique across the whole build.
pub trait ArchiveSink: Send {
    fn add_page(&mut self, path: &str, title: &str, html: &str, is_front: bool) -> Result<()>;
    fn add_redirect(&mut self, source: &str, target: &str, title: &str, is_front: bool)
        -> Result<()>;
    fn add_structured_data(
        &mut self,
        path: &str,
        title: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;
    fn add_script(&mut self, path: &str, title: &str, source: &str) -> Result<()>;
    /// Copy a downloaded asset into the archive under `path`.
    fn add_media(&mut self, path: &str, file: &Path, mime_type: Option<&str>) -> Result<()>;
    fn finalize(&mut self) -> Result<ArchiveSummary>;
}

#[derive(Debug, Serialize)]
struct ManifestEntry {
    path: String,
    kind: &'static str,
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_front: bool,
}

/// Writes the archive as a plain directory tree. Redirects become small
/// meta-refresh pages so the tree stays browsable from a file manager.
pub struct DirectorySink {
    root: PathBuf,
    seen: HashSet<String>,
    manifest: Vec<ManifestEntry>,
    bytes: u64,
}

impl DirectorySink {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            seen: HashSet::new(),
            manifest: Vec::new(),
            bytes: 0,
        })
    }

    fn claim(&mut self, path: &str) -> Result<()> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(ArchiveError::InvalidPath(path.to_string()));
        }
        if !self.seen.insert(path.to_string()) {
            return Err(ArchiveError::DuplicatePath(path.to_string()));
        }
        Ok(())
    }

    fn write_bytes(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(full)?;
        file.write_all(bytes)?;
        self.bytes += bytes.len() as u64;
        Ok(())
    }
}

/// Relative prefix from an entry at `source` back to the archive root.
fn to_root_of(source: &str) -> String {
    let depth = source.matches('/').count();
    if depth == 0 {
        ".".to_string()
    } else {
        vec![".."; depth].join("/")
    }
}

impl ArchiveSink for DirectorySink {
    fn add_page(&mut self, path: &str, title: &str, html: &str, is_front: bool) -> Result<()> {
        self.claim(path)?;
        self.write_bytes(path, html.as_bytes())?;
        self.manifest.push(ManifestEntry {
            path: path.to_string(),
            kind: "page",
            title: Some(title.to_string()),
            target: None,
            mime_type: Some("text/html".to_string()),
            is_front,
        });
        Ok(())
    }

    fn add_redirect(
        &mut self,
        source: &str,
        target: &str,
        title: &str,
        is_front: bool,
    ) -> Result<()> {
        self.claim(source)?;
        let href = format!("{}/{}", to_root_of(source), target);
        let html = format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
             <meta http-equiv=\"refresh\" content=\"0; url={href}\">\
             <title>{title}</title></head>\
             <body><a href=\"{href}\">{title}</a></body></html>\n",
        );
        self.write_bytes(source, html.as_bytes())?;
        self.manifest.push(ManifestEntry {
            path: source.to_string(),
            kind: "redirect",
            title: Some(title.to_string()),
            target: Some(target.to_string()),
            mime_type: None,
            is_front,
        });
        Ok(())
    }

    fn add_structured_data(
        &mut self,
        path: &str,
        title: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.claim(path)?;
        let bytes = serde_json::to_vec_pretty(payload)?;
        self.write_bytes(path, &bytes)?;
        self.manifest.push(ManifestEntry {
            path: path.to_string(),
            kind: "data",
            title: Some(title.to_string()),
            target: None,
            mime_type: Some("application/json".to_string()),
            is_front: false,
        });
        Ok(())
    }

    fn add_script(&mut self, path: &str, title: &str, source: &str) -> Result<()> {
        self.claim(path)?;
        self.write_bytes(path, source.as_bytes())?;
        self.manifest.push(ManifestEntry {
            path: path.to_string(),
            kind: "script",
            title: Some(title.to_string()),
            target: None,
            mime_type: Some("text/javascript".to_string()),
            is_front: false,
        });
        Ok(())
    }

    fn add_media(&mut self, path: &str, file: &Path, mime_type: Option<&str>) -> Result<()> {
        self.claim(path)?;
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let copied = fs::copy(file, full)?;
        self.bytes += copied;
        self.manifest.push(ManifestEntry {
            path: path.to_string(),
            kind: "media",
            title: None,
            target: None,
            mime_type: mime_type.map(str::to_string),
            is_front: false,
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<ArchiveSummary> {
        let manifest = serde_json::to_vec_pretty(&self.manifest)?;
        let path = self.root.join("manifest.json");
        fs::write(path, &manifest)?;
        self.bytes += manifest.len() as u64;
        Ok(ArchiveSummary {
            entries: self.manifest.len() as u64,
            bytes: self.bytes,
        })
    }
}

/// In-memory sink recording every call, in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<SinkRecord>,
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    Page {
        path: String,
        title: String,
        html: String,
        is_front: bool,
    },
    Redirect {
        source: String,
        target: String,
    },
    StructuredData {
        path: String,
        payload: serde_json::Value,
    },
    Script {
        path: String,
    },
    Media {
        path: String,
        mime_type: Option<String>,
    },
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.records
            .iter()
            .map(|r| match r {
                SinkRecord::Page { path, .. } => path.as_str(),
                SinkRecord::Redirect { source, .. } => source.as_str(),
                SinkRecord::StructuredData { path, .. } => path.as_str(),
                SinkRecord::Script { path } => path.as_str(),
                SinkRecord::Media { path, .. } => path.as_str(),
            })
            .collect()
    }
}

impl ArchiveSink for MemorySink {
    fn add_page(&mut self, path: &str, title: &str, html: &str, is_front: bool) -> Result<()> {
        self.records.push(SinkRecord::Page {
            path: path.to_string(),
            title: title.to_string(),
            html: html.to_string(),
            is_front,
        });
        Ok(())
    }

    fn add_redirect(
        &mut self,
        source: &str,
        target: &str,
        _title: &str,
        _is_front: bool,
    ) -> Result<()> {
        self.records.push(SinkRecord::Redirect {
            source: source.to_string(),
            target: target.to_string(),
        });
        Ok(())
    }

    fn add_structured_data(
        &mut self,
        path: &str,
        _title: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.records.push(SinkRecord::StructuredData {
            path: path.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    fn add_script(&mut self, path: &str, _title: &str, _source: &str) -> Result<()> {
        self.records.push(SinkRecord::Script {
            path: path.to_string(),
        });
        Ok(())
    }

    fn add_media(&mut self, path: &str, _file: &Path, mime_type: Option<&str>) -> Result<()> {
        self.records.push(SinkRecord::Media {
            path: path.to_string(),
            mime_type: mime_type.map(str::to_string),
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<ArchiveSummary> {
        self.finalized = true;
        Ok(ArchiveSummary {
            entries: self.records.len() as u64,
            bytes: 0,
        })
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_sink_writes_tree_and_manifest() {
        let dir = TempDir::new().unwrap();
        let mut sink = DirectorySink::create(dir.path().join("out")).unwrap();
        sink.add_page("index.html", "Front", "<html>hi</html>", true)
            .unwrap();
        sink.add_page("post/abc.html", "A post", "<html>post</html>", true)
            .unwrap();
        sink.add_redirect("p/abc", "post/abc.html", "A post", false)
            .unwrap();
        let summary = sink.finalize().unwrap();
        assert_eq!(summary.entries, 3);

        let out = dir.path().join("out");
        assert!(out.join("index.html").is_file());
        assert!(out.join("post/abc.html").is_file());
        let redirect = fs::read_to_string(out.join("p/abc")).unwrap();
        assert!(redirect.contains("url=../post/abc.html"));
        let manifest = fs::read_to_string(out.join("manifest.json")).unwrap();
        assert!(manifest.contains("\"post/abc.html\""));
    }

    #[test]
    fn test_directory_sink_rejects_duplicate_and_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let mut sink = DirectorySink::create(dir.path().join("out")).unwrap();
        sink.add_page("a.html", "a", "x", false).unwrap();
        assert!(matches!(
            sink.add_page("a.html", "a", "x", false),
            Err(ArchiveError::DuplicatePath(_))
        ));
        assert!(matches!(
            sink.add_page("../escape.html", "e", "x", false),
            Err(ArchiveError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_to_root_of() {
        assert_eq!(to_root_of("index.html"), ".");
        assert_eq!(to_root_of("p/abc"), "..");
        assert_eq!(to_root_of("board/rust/top_1.html"), "../..");
    }
}
