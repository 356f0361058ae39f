#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]

//! Blocking decisions for query names, in three tiers: a Bloom
//! pre-filter that lets the common unblocked case through with no
//! lock contention on anything shared-and-hot, an LRU decision cache,
//! and a persistent first-match rule store.  Snapshot updates replace
//! all three at once.

pub mod bloom;
pub mod decision;
pub mod rules;
pub mod store;

use std::sync::RwLock;

use udns_types::protocol::types::Name;

use crate::bloom::BloomFilter;
use crate::decision::DecisionCache;
use crate::rules::{reverse_name, suffix_anchors, BlockDecision, BlockRule, BlockRuleKind};
use crate::store::{Store, StoreError, StoreMetadata};

const LOCK_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] blocklist lock poisoned, cannot recover from this - aborting";

/// The seam between the repository and its persistence, so tests can
/// substitute a scripted store.  `Store` is the production
/// implementation.
pub trait RuleStore {
    /// See [`Store::get_first_match`].
    fn get_first_match(&self, name: &str) -> Result<Option<BlockRule>, StoreError>;

    /// See [`Store::rebuild_all`].
    fn rebuild_all(
        &self,
        rules: &[BlockRule],
        version: u64,
        updated_unix: i64,
    ) -> Result<(), StoreError>;

    /// See [`Store::metadata`].
    fn metadata(&self) -> Result<Option<StoreMetadata>, StoreError>;
}

impl RuleStore for Store {
    fn get_first_match(&self, name: &str) -> Result<Option<BlockRule>, StoreError> {
        Store::get_first_match(self, name)
    }

    fn rebuild_all(
        &self,
        rules: &[BlockRule],
        version: u64,
        updated_unix: i64,
    ) -> Result<(), StoreError> {
        Store::rebuild_all(self, rules, version, updated_unix)
    }

    fn metadata(&self) -> Result<Option<StoreMetadata>, StoreError> {
        Store::metadata(self)
    }
}

/// The blocklist repository: decides whether names are blocked, and
/// atomically swaps in full-dataset snapshots.
///
/// Any number of threads may call `decide` concurrently; `update_all`
/// is called by one updater at a time.  Readers between a store
/// rebuild and the cache purge may still see the old snapshot; once
/// `update_all` returns, every `decide` sees the new dataset and an
/// empty decision cache.
#[derive(Debug)]
pub struct Repository<S = Store> {
    store: S,

    /// Swapped whole on every snapshot update.  `None` until the
    /// first update; an absent Bloom means the pre-check is skipped,
    /// not that everything is allowed.
    bloom: RwLock<Option<BloomFilter>>,

    cache: DecisionCache,
    fp_rate: f64,
}

impl<S: RuleStore> Repository<S> {
    pub fn new(store: S, decision_cache_capacity: usize, fp_rate: f64) -> Self {
        Self {
            store,
            bloom: RwLock::new(None),
            cache: DecisionCache::new(decision_cache_capacity),
            fp_rate,
        }
    }

    /// Decide whether a name is blocked.
    ///
    /// The name arrives canonical; the blocklist key is its form
    /// without the trailing dot.  Store errors fail open: a broken
    /// store means nothing is blocked, and the (empty) decision is
    /// still cached so a broken store is not also a hammered store.
    pub fn decide(&self, name: &Name) -> BlockDecision {
        let cn = name.without_trailing_dot();

        {
            let bloom = self.bloom.read().expect(LOCK_POISON_MESSAGE);
            if let Some(bloom) = bloom.as_ref() {
                let possible = bloom.might_contain(cn.as_bytes())
                    || suffix_anchors(cn)
                        .iter()
                        .any(|anchor| bloom.might_contain(anchor.as_bytes()));
                if !possible {
                    // early allow: neither the exact key nor any
                    // reversed anchor can be in the store
                    return BlockDecision::empty();
                }
            }
        }

        if let Some(decision) = self.cache.get(cn) {
            return decision;
        }

        let decision = match self.store.get_first_match(cn) {
            Ok(Some(rule)) => BlockDecision::block(&rule),
            Ok(None) => BlockDecision::empty(),
            Err(error) => {
                tracing::warn!(name = %cn, %error, "blocklist store read failed, failing open");
                BlockDecision::empty()
            }
        };

        self.cache.insert(cn.to_string(), decision.clone());
        decision
    }

    /// Atomically replace the whole dataset.
    ///
    /// The store is rebuilt first, in its own write transaction.  If
    /// that fails the error is returned and neither the Bloom filter
    /// nor the decision cache is touched.  On success a fresh Bloom
    /// filter (sized for the new rule count) is swapped in and the
    /// cache purged under one write lock, so no reader can see the
    /// new store through the old cache for longer than the swap.
    pub fn update_all(
        &self,
        rules: &[BlockRule],
        version: u64,
        updated_unix: i64,
    ) -> Result<(), StoreError> {
        self.store.rebuild_all(rules, version, updated_unix)?;

        let mut bloom = BloomFilter::with_parameters(rules.len(), self.fp_rate);
        for rule in rules {
            match rule.kind {
                BlockRuleKind::Exact => bloom.add(rule.name.as_bytes()),
                BlockRuleKind::Suffix => bloom.add(reverse_name(&rule.name).as_bytes()),
            }
        }

        let mut guard = self.bloom.write().expect(LOCK_POISON_MESSAGE);
        *guard = Some(bloom);
        self.cache.purge();
        drop(guard);

        tracing::info!(rules = rules.len(), version, "blocklist snapshot updated");
        Ok(())
    }

    /// The current snapshot's metadata, if one has been written.
    pub fn metadata(&self) -> Result<Option<StoreMetadata>, StoreError> {
        self.store.metadata()
    }

    /// How many decisions are currently cached.
    pub fn cached_decisions(&self) -> usize {
        self.cache.len()
    }
}
