//! Rendered output model shared between workers and the writer.

pub mod html;

pub use html::{HtmlRenderer, PageRenderer, RenderOptions};

use serde_json::Value;

/// Maximum number of units carried by one `RenderResult` chunk. Large tasks
/// are split at this boundary to bound queue memory.
pub const MAX_UNITS_PER_RESULT: usize = 200;

/// One rendered artifact, dispatched exhaustively by the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedUnit {
    Page {
        path: String,
        title: String,
        html: String,
        is_front: bool,
    },
    Redirect {
        source: String,
        target: String,
        title: String,
        is_front: bool,
    },
    StructuredData {
        path: String,
        title: String,
        payload: Value,
    },
    Script {
        path: String,
        title: String,
        source: String,
    },
    /// Media cache entry ids referenced by the rendered markup.
    FileReferences { ids: Vec<i64> },
}

/// An ordered sequence of rendered units. A single task may yield several of
/// these chunks.
pub type RenderResult = Vec<RenderedUnit>;

/// Bounded accumulator that splits a task's output into
/// [`MAX_UNITS_PER_RESULT`]-sized chunks.
///
/// The flush boundary is explicit so backpressure applies between chunks,
/// not only between tasks.
pub struct UnitAccumulator {
    units: Vec<RenderedUnit>,
    threshold: usize,
}

impl UnitAccumulator {
    pub fn new() -> Self {
        Self::with_threshold(MAX_UNITS_PER_RESULT)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        assert!(threshold > 0);
        Self {
            units: Vec::new(),
            threshold,
        }
    }

    /// Add one unit; returns a full chunk when the threshold is reached.
    pub fn push(&mut self, unit: RenderedUnit) -> Option<RenderResult> {
        self.units.push(unit);
        if self.units.len() >= self.threshold {
            Some(std::mem::take(&mut self.units))
        } else {
            None
        }
    }

    /// Add many units; returns every full chunk produced along the way.
    pub fn extend(&mut self, units: impl IntoIterator<Item = RenderedUnit>) -> Vec<RenderResult> {
        let mut chunks = Vec::new();
        for unit in units {
            if let Some(chunk) = self.push(unit) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Hand out whatever is left; `None` when the task produced an exact
    /// multiple of the threshold (or nothing).
    pub fn finish(mut self) -> Option<RenderResult> {
        if self.units.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.units))
        }
    }
}

impl Default for UnitAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(n: usize) -> RenderedUnit {
        RenderedUnit::Redirect {
            source: format!("s{}", n),
            target: "t".into(),
            title: "r".into(),
            is_front: false,
        }
    }

    #[test]
    fn test_accumulator_flushes_at_threshold() {
        let mut acc = UnitAccumulator::with_threshold(3);
        assert!(acc.push(unit(0)).is_none());
        assert!(acc.push(unit(1)).is_none());
        let chunk = acc.push(unit(2)).expect("third push crosses the threshold");
        assert_eq!(chunk.len(), 3);
        assert!(acc.finish().is_none());
    }

    #[test]
    fn test_accumulator_extend_splits_into_chunks() {
        let mut acc = UnitAccumulator::with_threshold(2);
        let chunks = acc.extend((0..5).map(unit));
        assert_eq!(chunks.len(), 2);
        assert_eq!(acc.finish().map(|c| c.len()), Some(1));
    }
}
