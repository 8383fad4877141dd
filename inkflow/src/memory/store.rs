//! The tiered memory store.

use super::block::{MemoryBlock, MemoryFilter, MemoryTier, MemoryWrite, Relation};
use crate::utils::{estimate_tokens, text};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Tuning for scoring and pruning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Weight of block importance in the score.
    pub w_importance: f64,
    /// Weight of tier recency in the score.
    pub w_recency: f64,
    /// Weight of keyword relevance in the score.
    pub w_relevance: f64,
    /// Recency weight of immediate blocks.
    pub immediate_weight: f64,
    /// Recency weight of recent blocks.
    pub recent_weight: f64,
    /// Recency weight of archival blocks.
    pub archival_weight: f64,
    /// Steps an immediate block lives before demotion.
    pub immediate_ttl_steps: u64,
    /// Steps a recent block lives before demotion.
    pub recent_ttl_steps: u64,
    /// Maximum archival blocks kept.
    pub archival_capacity: usize,
    /// Archival blocks below this importance are evicted first.
    pub eviction_importance_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            w_importance: 0.4,
            w_recency: 0.3,
            w_relevance: 0.3,
            immediate_weight: 1.0,
            recent_weight: 0.6,
            archival_weight: 0.3,
            immediate_ttl_steps: 2,
            recent_ttl_steps: 6,
            archival_capacity: 256,
            eviction_importance_threshold: 0.2,
        }
    }
}

impl MemoryConfig {
    fn tier_weight(&self, tier: MemoryTier) -> f64 {
        match tier {
            MemoryTier::Immediate => self.immediate_weight,
            MemoryTier::Recent => self.recent_weight,
            MemoryTier::Archival => self.archival_weight,
        }
    }
}

/// Serializable image of a store, persisted with each checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Pruning step counter.
    pub step: u64,
    /// All blocks, ordered by id.
    pub blocks: Vec<MemoryBlock>,
    /// All relations.
    pub relations: Vec<Relation>,
}

/// What one `advance_step` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Blocks moved from immediate to recent.
    pub demoted_to_recent: Vec<String>,
    /// Blocks moved from recent to archival.
    pub demoted_to_archival: Vec<String>,
    /// Blocks removed.
    pub evicted: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    step: u64,
    blocks: BTreeMap<String, MemoryBlock>,
    relations: BTreeSet<Relation>,
}

impl MemoryInner {
    fn remove(&mut self, id: &str) {
        self.blocks.remove(id);
        self.relations.retain(|r| r.from != id && r.to != id);
    }
}

/// Tiered, relevance-ranked context store shared by the stages of one run.
///
/// Blocks live in an arena keyed by id; relations are a side index of
/// `(from, to, kind)` triples, so removing a block never leaves a dangling
/// pointer, only relations that are dropped with it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: MemoryConfig,
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(MemoryInner::default()),
        }
    }

    /// Rebuilds a store from a snapshot.
    #[must_use]
    pub fn from_snapshot(config: MemoryConfig, snapshot: MemorySnapshot) -> Self {
        let inner = MemoryInner {
            step: snapshot.step,
            blocks: snapshot
                .blocks
                .into_iter()
                .map(|b| (b.id.clone(), b))
                .collect(),
            relations: snapshot.relations.into_iter().collect(),
        };
        Self {
            config,
            inner: RwLock::new(inner),
        }
    }

    /// Captures the current contents.
    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.read();
        MemorySnapshot {
            step: inner.step,
            blocks: inner.blocks.values().cloned().collect(),
            relations: inner.relations.iter().cloned().collect(),
        }
    }

    /// The scoring and pruning config.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Current pruning step.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.inner.read().step
    }

    /// Number of stored blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// True if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }

    /// Looks up a block.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<MemoryBlock> {
        self.inner.read().blocks.get(id).cloned()
    }

    /// Inserts or replaces a block.
    pub fn write(&self, block: MemoryBlock) {
        debug!(id = %block.id, tier = %block.tier, "Memory write");
        self.inner.write().blocks.insert(block.id.clone(), block);
    }

    /// Replaces every block written by `stage` with `writes`.
    ///
    /// New blocks get ids `{stage}#0`, `{stage}#1`, ... and enter the
    /// immediate tier at the current step, so a re-executed stage yields
    /// the same ids as its first execution. Returns the new ids.
    pub fn commit(&self, stage: &str, writes: Vec<MemoryWrite>) -> Vec<String> {
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .blocks
            .values()
            .filter(|b| b.source_stage == stage)
            .map(|b| b.id.clone())
            .collect();
        for id in &stale {
            inner.remove(id);
        }

        let step = inner.step;
        let mut ids = Vec::with_capacity(writes.len());
        for (n, write) in writes.into_iter().enumerate() {
            let id = format!("{stage}#{n}");
            for (target, kind) in write.links {
                if inner.blocks.contains_key(&target) {
                    inner.relations.insert(Relation {
                        from: id.clone(),
                        to: target,
                        kind,
                    });
                }
            }
            let block = MemoryBlock {
                id: id.clone(),
                tier: MemoryTier::Immediate,
                token_estimate: estimate_tokens(&write.content),
                content: write.content,
                importance: write.importance.clamp(0.0, 1.0),
                keywords: write.keywords,
                source_stage: stage.to_string(),
                entered_tier_step: step,
            };
            inner.blocks.insert(id.clone(), block);
            ids.push(id);
        }

        debug!(stage = %stage, replaced = stale.len(), written = ids.len(), "Memory commit");
        ids
    }

    /// Removes every block written by the given stages.
    pub fn forget_stages(&self, stages: &BTreeSet<String>) {
        let mut inner = self.inner.write();
        let ids: Vec<String> = inner
            .blocks
            .values()
            .filter(|b| stages.contains(&b.source_stage))
            .map(|b| b.id.clone())
            .collect();
        for id in ids {
            inner.remove(&id);
        }
    }

    /// Adds a relation between two existing blocks. Returns false if either
    /// end is missing.
    pub fn link(&self, from: &str, to: &str, kind: impl Into<String>) -> bool {
        let mut inner = self.inner.write();
        if !inner.blocks.contains_key(from) || !inner.blocks.contains_key(to) {
            return false;
        }
        inner.relations.insert(Relation {
            from: from.to_string(),
            to: to.to_string(),
            kind: kind.into(),
        });
        true
    }

    /// Relations touching `id`, in either direction.
    #[must_use]
    pub fn related(&self, id: &str) -> Vec<Relation> {
        self.inner
            .read()
            .relations
            .iter()
            .filter(|r| r.from == id || r.to == id)
            .cloned()
            .collect()
    }

    /// Score of a block for a filter at the current step.
    #[must_use]
    pub fn score(&self, block: &MemoryBlock, filter: &MemoryFilter) -> f64 {
        let step = self.inner.read().step;
        self.score_at(block, filter, step)
    }

    fn score_at(&self, block: &MemoryBlock, filter: &MemoryFilter, step: u64) -> f64 {
        let recency = self.config.tier_weight(block.tier) / (1.0 + block.age_in_tier(step) as f64);
        self.config.w_importance * block.importance
            + self.config.w_recency * recency
            + self.config.w_relevance * keyword_relevance(block, &filter.keywords)
    }

    /// Returns the best-scoring blocks that fit in `budget_tokens`.
    ///
    /// Blocks are taken greedily in descending score order (ties by id); a
    /// block that does not fit is skipped, never truncated.
    #[must_use]
    pub fn query(&self, filter: &MemoryFilter, budget_tokens: u64) -> Vec<MemoryBlock> {
        let inner = self.inner.read();
        let mut ranked: Vec<(f64, &MemoryBlock)> = inner
            .blocks
            .values()
            .filter(|b| filter.admits(b))
            .map(|b| (self.score_at(b, filter, inner.step), b))
            .collect();
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        let mut used = 0u64;
        let mut selected = Vec::new();
        for (_, block) in ranked {
            if used + block.token_estimate > budget_tokens {
                continue;
            }
            used += block.token_estimate;
            selected.push(block.clone());
        }
        selected
    }

    /// Advances the pruning clock by one step, demoting and evicting.
    pub fn advance_step(&self) -> PruneReport {
        let mut inner = self.inner.write();
        inner.step += 1;
        let step = inner.step;
        let mut report = PruneReport::default();

        for block in inner.blocks.values_mut() {
            let age = block.age_in_tier(step);
            match block.tier {
                MemoryTier::Immediate if age > self.config.immediate_ttl_steps => {
                    block.tier = MemoryTier::Recent;
                    block.entered_tier_step = step;
                    report.demoted_to_recent.push(block.id.clone());
                }
                MemoryTier::Recent if age > self.config.recent_ttl_steps => {
                    block.tier = MemoryTier::Archival;
                    block.entered_tier_step = step;
                    report.demoted_to_archival.push(block.id.clone());
                }
                _ => {}
            }
        }

        let mut archival: Vec<&MemoryBlock> = inner
            .blocks
            .values()
            .filter(|b| b.tier == MemoryTier::Archival)
            .collect();
        let mut excess = archival.len().saturating_sub(self.config.archival_capacity);
        if excess > 0 {
            // Below-threshold blocks go first, oldest first; then the least
            // important, oldest first.
            let threshold = self.config.eviction_importance_threshold;
            archival.sort_by(|a, b| {
                let a_low = a.importance < threshold;
                let b_low = b.importance < threshold;
                b_low
                    .cmp(&a_low)
                    .then_with(|| {
                        if a_low && b_low {
                            Ordering::Equal
                        } else {
                            a.importance.partial_cmp(&b.importance).unwrap_or(Ordering::Equal)
                        }
                    })
                    .then_with(|| a.entered_tier_step.cmp(&b.entered_tier_step))
                    .then_with(|| a.id.cmp(&b.id))
            });
            let victims: Vec<String> = archival
                .iter()
                .take_while(|_| {
                    let keep_going = excess > 0;
                    excess = excess.saturating_sub(1);
                    keep_going
                })
                .map(|b| b.id.clone())
                .collect();
            for id in &victims {
                inner.remove(id);
            }
            report.evicted = victims;
        }

        debug!(
            step,
            demoted_to_recent = report.demoted_to_recent.len(),
            demoted_to_archival = report.demoted_to_archival.len(),
            evicted = report.evicted.len(),
            "Memory pruning step"
        );
        report
    }

    /// Joins blocks into a prompt section.
    #[must_use]
    pub fn render(blocks: &[MemoryBlock]) -> String {
        blocks
            .iter()
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Fraction of `keywords` present in the block's keywords or content.
fn keyword_relevance(block: &MemoryBlock, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let mut vocab: BTreeSet<String> = text::words(&block.content).into_iter().collect();
    vocab.extend(block.keywords.iter().map(|k| k.to_lowercase()));
    let hits = keywords
        .iter()
        .filter(|k| vocab.contains(&k.to_lowercase()))
        .count();
    hits as f64 / keywords.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block(id: &str, tier: MemoryTier, importance: f64, tokens: u64, step: u64) -> MemoryBlock {
        MemoryBlock {
            id: id.into(),
            tier,
            content: format!("content of {id}"),
            importance,
            keywords: vec![],
            source_stage: id.split('#').next().unwrap_or(id).into(),
            token_estimate: tokens,
            entered_tier_step: step,
        }
    }

    #[test]
    fn test_query_skips_blocks_that_do_not_fit() {
        let store = MemoryStore::new(MemoryConfig::default());
        store.write(block("a#0", MemoryTier::Immediate, 0.9, 80, 0));
        store.write(block("b#0", MemoryTier::Immediate, 0.8, 50, 0));
        store.write(block("c#0", MemoryTier::Immediate, 0.7, 20, 0));

        let selected = store.query(&MemoryFilter::default(), 100);
        let ids: Vec<_> = selected.iter().map(|b| b.id.as_str()).collect();

        // b does not fit after a; c still does.
        assert_eq!(ids, vec!["a#0", "c#0"]);
        assert!(selected.iter().map(|b| b.token_estimate).sum::<u64>() <= 100);
    }

    #[test]
    fn test_query_ties_broken_by_id() {
        let store = MemoryStore::new(MemoryConfig::default());
        store.write(block("z#0", MemoryTier::Recent, 0.5, 1, 0));
        store.write(block("m#0", MemoryTier::Recent, 0.5, 1, 0));
        let ids: Vec<_> = store
            .query(&MemoryFilter::default(), 10)
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["m#0", "z#0"]);
    }

    #[test]
    fn test_keyword_relevance_lifts_matching_blocks() {
        let store = MemoryStore::new(MemoryConfig::default());
        let mut dragon = block("lore#0", MemoryTier::Archival, 0.3, 5, 0);
        dragon.content = "The dragon sleeps under the mountain.".into();
        store.write(dragon);
        store.write(block("misc#0", MemoryTier::Archival, 0.3, 5, 0));

        let filter = MemoryFilter::for_keywords(["Dragon", "mountain"]);
        let top = store.query(&filter, 5);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id, "lore#0");
    }

    #[test]
    fn test_score_formula() {
        let config = MemoryConfig::default();
        let store = MemoryStore::new(config.clone());
        let b = block("a#0", MemoryTier::Immediate, 0.5, 1, 0);
        let expected = config.w_importance * 0.5 + config.w_recency * 1.0;
        assert!((store.score(&b, &MemoryFilter::default()) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_commit_replaces_previous_blocks_of_stage() {
        let store = MemoryStore::new(MemoryConfig::default());
        let ids = store.commit("draft", vec![MemoryWrite::new("v1 a", 0.5), MemoryWrite::new("v1 b", 0.5)]);
        assert_eq!(ids, vec!["draft#0", "draft#1"]);

        let ids = store.commit("draft", vec![MemoryWrite::new("v2", 0.5)]);
        assert_eq!(ids, vec!["draft#0"]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("draft#0").unwrap().content, "v2");
    }

    #[test]
    fn test_links_are_side_index_and_dropped_with_blocks() {
        let store = MemoryStore::new(MemoryConfig::default());
        store.commit("outline", vec![MemoryWrite::new("outline", 0.9)]);
        store.commit(
            "draft",
            vec![MemoryWrite::new("chapter", 0.5).with_link("outline#0", "expands")],
        );
        assert_eq!(store.related("outline#0").len(), 1);
        assert!(!store.link("draft#0", "missing#0", "x"));

        store.forget_stages(&BTreeSet::from(["outline".to_string()]));
        assert!(store.related("draft#0").is_empty());
    }

    #[test]
    fn test_advance_step_demotes_through_tiers() {
        let config = MemoryConfig {
            immediate_ttl_steps: 1,
            recent_ttl_steps: 1,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::new(config);
        store.commit("draft", vec![MemoryWrite::new("text", 0.5)]);

        assert!(store.advance_step().demoted_to_recent.is_empty());
        assert_eq!(store.advance_step().demoted_to_recent, vec!["draft#0"]);
        assert_eq!(store.get("draft#0").unwrap().tier, MemoryTier::Recent);
        store.advance_step();
        assert_eq!(store.advance_step().demoted_to_archival, vec!["draft#0"]);
    }

    #[test]
    fn test_eviction_prefers_low_importance_then_oldest() {
        let config = MemoryConfig {
            archival_capacity: 2,
            eviction_importance_threshold: 0.2,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::new(config);
        store.write(block("old_low#0", MemoryTier::Archival, 0.1, 1, 0));
        store.write(block("new_low#0", MemoryTier::Archival, 0.1, 1, 5));
        store.write(block("old_high#0", MemoryTier::Archival, 0.9, 1, 0));
        store.write(block("mid#0", MemoryTier::Archival, 0.5, 1, 1));

        let report = store.advance_step();
        assert_eq!(report.evicted, vec!["old_low#0", "new_low#0"]);
        assert_eq!(store.len(), 2);

        store.write(block("mid2#0", MemoryTier::Archival, 0.4, 1, 2));
        let report = store.advance_step();
        assert_eq!(report.evicted, vec!["mid2#0"]);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_step_and_relations() {
        let store = MemoryStore::new(MemoryConfig::default());
        store.commit("a", vec![MemoryWrite::new("one", 0.5)]);
        store.commit("b", vec![MemoryWrite::new("two", 0.5).with_link("a#0", "follows")]);
        store.advance_step();

        let restored = MemoryStore::from_snapshot(MemoryConfig::default(), store.snapshot());
        assert_eq!(restored.snapshot(), store.snapshot());
        assert_eq!(restored.step(), 1);
    }
}
