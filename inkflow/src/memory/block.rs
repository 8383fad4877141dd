//! Memory blocks, relations and query filters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage tier of a memory block, from freshest to oldest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Written by the most recent stages.
    Immediate,
    /// Demoted from immediate after its TTL.
    Recent,
    /// Long-term; subject to capacity eviction.
    Archival,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::Immediate
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Recent => write!(f, "recent"),
            Self::Archival => write!(f, "archival"),
        }
    }
}

/// One unit of stored context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    /// Stable id, `{stage}#{n}`.
    pub id: String,
    /// Current tier.
    pub tier: MemoryTier,
    /// The text.
    pub content: String,
    /// Importance in `[0, 1]`.
    pub importance: f64,
    /// Keywords used for relevance scoring.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// The stage that wrote the block.
    pub source_stage: String,
    /// Estimated token cost of including the block in a prompt.
    pub token_estimate: u64,
    /// Store step at which the block entered its current tier.
    pub entered_tier_step: u64,
}

impl MemoryBlock {
    /// Steps spent in the current tier.
    #[must_use]
    pub fn age_in_tier(&self, current_step: u64) -> u64 {
        current_step.saturating_sub(self.entered_tier_step)
    }
}

/// A block a stage wants to store once its output is accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryWrite {
    /// The text.
    pub content: String,
    /// Importance in `[0, 1]`.
    pub importance: f64,
    /// Keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Links from the new block to existing ones: `(target_id, kind)`.
    #[serde(default)]
    pub links: Vec<(String, String)>,
}

impl MemoryWrite {
    /// Creates a write with the given importance.
    #[must_use]
    pub fn new(content: impl Into<String>, importance: f64) -> Self {
        Self {
            content: content.into(),
            importance: importance.clamp(0.0, 1.0),
            keywords: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Sets the keywords.
    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Links the new block to an existing one.
    #[must_use]
    pub fn with_link(mut self, target: impl Into<String>, kind: impl Into<String>) -> Self {
        self.links.push((target.into(), kind.into()));
        self
    }
}

/// A directed relation between two blocks, kept outside the blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    /// Source block id.
    pub from: String,
    /// Target block id.
    pub to: String,
    /// Relation kind, e.g. `continues`.
    pub kind: String,
}

/// Restricts which blocks a query considers and how they are ranked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFilter {
    /// Keywords of the requesting stage.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Only these tiers, if set.
    #[serde(default)]
    pub tiers: Option<Vec<MemoryTier>>,
    /// Skip blocks written by these stages.
    #[serde(default)]
    pub exclude_stages: Vec<String>,
    /// Skip blocks less important than this.
    #[serde(default)]
    pub min_importance: f64,
}

impl MemoryFilter {
    /// A filter ranking by the given keywords.
    #[must_use]
    pub fn for_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Restricts the query to the given tiers.
    #[must_use]
    pub fn with_tiers(mut self, tiers: Vec<MemoryTier>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    /// Skips blocks written by a stage.
    #[must_use]
    pub fn excluding_stage(mut self, stage: impl Into<String>) -> Self {
        self.exclude_stages.push(stage.into());
        self
    }

    /// Sets the minimum importance.
    #[must_use]
    pub fn with_min_importance(mut self, min_importance: f64) -> Self {
        self.min_importance = min_importance;
        self
    }

    pub(crate) fn admits(&self, block: &MemoryBlock) -> bool {
        if block.importance < self.min_importance {
            return false;
        }
        if self.exclude_stages.iter().any(|s| s == &block.source_stage) {
            return false;
        }
        self.tiers
            .as_ref()
            .map_or(true, |tiers| tiers.contains(&block.tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(tier: MemoryTier, importance: f64) -> MemoryBlock {
        MemoryBlock {
            id: "draft#0".into(),
            tier,
            content: "text".into(),
            importance,
            keywords: vec![],
            source_stage: "draft".into(),
            token_estimate: 1,
            entered_tier_step: 3,
        }
    }

    #[test]
    fn test_tier_order_and_display() {
        assert!(MemoryTier::Immediate < MemoryTier::Archival);
        assert_eq!(MemoryTier::Recent.to_string(), "recent");
        assert_eq!(MemoryTier::default(), MemoryTier::Immediate);
    }

    #[test]
    fn test_age_in_tier_saturates() {
        let b = block(MemoryTier::Recent, 0.5);
        assert_eq!(b.age_in_tier(5), 2);
        assert_eq!(b.age_in_tier(1), 0);
    }

    #[test]
    fn test_filter_admits() {
        let b = block(MemoryTier::Recent, 0.5);
        assert!(MemoryFilter::default().admits(&b));
        assert!(!MemoryFilter::default().with_min_importance(0.6).admits(&b));
        assert!(!MemoryFilter::default().excluding_stage("draft").admits(&b));
        assert!(!MemoryFilter::default()
            .with_tiers(vec![MemoryTier::Immediate])
            .admits(&b));
    }

    #[test]
    fn test_write_clamps_importance() {
        let write = MemoryWrite::new("x", 3.0).with_link("outline#0", "expands");
        assert!((write.importance - 1.0).abs() < f64::EPSILON);
        assert_eq!(write.links.len(), 1);
    }
}
