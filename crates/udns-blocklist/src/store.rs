//! The persistent rule store: a single-file embedded B-tree database
//! with three tables.
//!
//! - `exact`: canonical name (no trailing dot) -> rule value
//! - `suffix`: byte-reversed canonical name -> rule value
//! - `meta`: `version` and `updated`, both u64 big-endian
//!
//! Rule values are `kind (1) | added_at (8, BE) | source_len (2, BE) |
//! source`.  Values shorter than the 11-octet header are legacy
//! minimal entries and decode with defaults; a kind octet that is
//! neither exact nor suffix is repaired to whichever table the value
//! was found in.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

use crate::rules::{reverse_name, suffix_anchors, BlockRule, BlockRuleKind};

const EXACT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("exact");
const SUFFIX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("suffix");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const KIND_EXACT: u8 = 0;
const KIND_SUFFIX: u8 = 1;

/// The fixed prefix of a rule value: kind, added-at, source length.
const VALUE_HEADER_LEN: usize = 11;

/// Snapshot metadata, from the `meta` table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StoreMetadata {
    pub version: u64,
    pub updated: u64,
}

/// The on-disk rule store.  One writer at a time; any number of
/// readers, each seeing a committed snapshot.
pub struct Store {
    db: Database,
}

impl Store {
    /// Open (or create) the store at a path.
    ///
    /// # Errors
    ///
    /// If the database cannot be created or its header is corrupt.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        Ok(Self { db })
    }

    /// Replace the entire dataset in one write transaction: all three
    /// tables are deleted, recreated, and repopulated, then the
    /// transaction commits.  Readers see the old snapshot until the
    /// commit and the new one after it, never anything between.
    ///
    /// # Errors
    ///
    /// If any part of the transaction fails.  On error nothing is
    /// committed and the previous snapshot remains intact.
    pub fn rebuild_all(
        &self,
        rules: &[BlockRule],
        version: u64,
        updated_unix: i64,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            txn.delete_table(EXACT)?;
            txn.delete_table(SUFFIX)?;
            txn.delete_table(META)?;

            let mut exact = txn.open_table(EXACT)?;
            let mut suffix = txn.open_table(SUFFIX)?;
            for rule in rules {
                let value = encode_value(rule);
                match rule.kind {
                    BlockRuleKind::Exact => {
                        exact.insert(rule.name.as_bytes(), value.as_slice())?;
                    }
                    BlockRuleKind::Suffix => {
                        suffix.insert(reverse_name(&rule.name).as_bytes(), value.as_slice())?;
                    }
                }
            }

            let mut meta = txn.open_table(META)?;
            let updated = u64::try_from(updated_unix).unwrap_or(0);
            meta.insert("version", version.to_be_bytes().as_slice())?;
            meta.insert("updated", updated.to_be_bytes().as_slice())?;
        }
        txn.commit()?;

        Ok(())
    }

    /// Find the first matching rule for a canonical name (no trailing
    /// dot): the exact entry if there is one, else the most specific
    /// suffix anchor.
    ///
    /// For the suffix walk, a cursor seeks to each reversed anchor in
    /// turn (most labels first); the first entry whose key has the
    /// anchor as a prefix is the match.
    ///
    /// # Errors
    ///
    /// If the read transaction or a lookup fails.
    pub fn get_first_match(&self, name: &str) -> Result<Option<BlockRule>, StoreError> {
        let txn = self.db.begin_read()?;

        if let Some(exact) = open_if_exists(txn.open_table(EXACT))? {
            if let Some(value) = exact.get(name.as_bytes())? {
                return Ok(Some(decode_value(
                    name,
                    BlockRuleKind::Exact,
                    value.value(),
                )));
            }
        }

        if let Some(suffix) = open_if_exists(txn.open_table(SUFFIX))? {
            for anchor in suffix_anchors(name) {
                let mut range = suffix.range(anchor.as_bytes()..)?;
                if let Some(entry) = range.next() {
                    let (key, value) = entry?;
                    // an entry that merely extends the anchor is a
                    // rule for a longer name, which must not match a
                    // shorter one; only the anchor's own key counts.
                    if key.value() == anchor.as_bytes() {
                        let rule_name = reverse_key(key.value());
                        return Ok(Some(decode_value(
                            &rule_name,
                            BlockRuleKind::Suffix,
                            value.value(),
                        )));
                    }
                }
            }
        }

        Ok(None)
    }

    /// The snapshot metadata, if a snapshot has ever been written.
    ///
    /// # Errors
    ///
    /// If the read transaction or a lookup fails.
    pub fn metadata(&self) -> Result<Option<StoreMetadata>, StoreError> {
        let txn = self.db.begin_read()?;

        let Some(meta) = open_if_exists(txn.open_table(META))? else {
            return Ok(None);
        };
        let Some(version) = meta.get("version")? else {
            return Ok(None);
        };
        let Some(updated) = meta.get("updated")? else {
            return Ok(None);
        };

        Ok(Some(StoreMetadata {
            version: decode_u64(version.value()),
            updated: decode_u64(updated.value()),
        }))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

/// A freshly-created database has no tables until the first rebuild;
/// that reads as an empty store, not an error.
fn open_if_exists<T>(result: Result<T, redb::TableError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(table) => Ok(Some(table)),
        Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

fn encode_value(rule: &BlockRule) -> Vec<u8> {
    let source = rule.source.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    let source_len = source.len().min(usize::from(u16::MAX)) as u16;

    let mut value = Vec::with_capacity(VALUE_HEADER_LEN + usize::from(source_len));
    value.push(match rule.kind {
        BlockRuleKind::Exact => KIND_EXACT,
        BlockRuleKind::Suffix => KIND_SUFFIX,
    });
    value.extend_from_slice(&rule.added_at.to_be_bytes());
    value.extend_from_slice(&source_len.to_be_bytes());
    value.extend_from_slice(&source[..usize::from(source_len)]);
    value
}

fn decode_value(name: &str, context_kind: BlockRuleKind, value: &[u8]) -> BlockRule {
    if value.len() < VALUE_HEADER_LEN {
        // legacy minimal entry
        return BlockRule {
            name: name.to_string(),
            kind: context_kind,
            source: String::new(),
            added_at: 0,
        };
    }

    let kind = match value[0] {
        KIND_EXACT => BlockRuleKind::Exact,
        KIND_SUFFIX => BlockRuleKind::Suffix,
        _ => context_kind,
    };
    let added_at = decode_u64(&value[1..9]);
    let source_len = usize::from(u16::from_be_bytes([value[9], value[10]]));
    let source_end = (VALUE_HEADER_LEN + source_len).min(value.len());
    let source = String::from_utf8_lossy(&value[VALUE_HEADER_LEN..source_end]).into_owned();

    BlockRule {
        name: name.to_string(),
        kind,
        source,
        added_at,
    }
}

fn decode_u64(octets: &[u8]) -> u64 {
    let mut fixed = [0u8; 8];
    let len = octets.len().min(8);
    fixed[8 - len..].copy_from_slice(&octets[..len]);
    u64::from_be_bytes(fixed)
}

/// A reversed-anchor key, un-reversed back into a rule name.
fn reverse_key(key: &[u8]) -> String {
    key.iter().rev().map(|b| char::from(*b)).collect()
}

/// Errors from the persistence layer.  Reads fail open at the
/// repository level; writes surface to the caller of `update_all`.
#[derive(Debug)]
pub enum StoreError {
    Open(redb::DatabaseError),
    Transaction(redb::TransactionError),
    Table(redb::TableError),
    Storage(redb::StorageError),
    Commit(redb::CommitError),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(error: redb::DatabaseError) -> Self {
        StoreError::Open(error)
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(error: redb::TransactionError) -> Self {
        StoreError::Transaction(error)
    }
}

impl From<redb::TableError> for StoreError {
    fn from(error: redb::TableError) -> Self {
        StoreError::Table(error)
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(error: redb::StorageError) -> Self {
        StoreError::Storage(error)
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(error: redb::CommitError) -> Self {
        StoreError::Commit(error)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StoreError::Open(error) => write!(f, "could not open store: {error}"),
            StoreError::Transaction(error) => write!(f, "store transaction failed: {error}"),
            StoreError::Table(error) => write!(f, "store table failed: {error}"),
            StoreError::Storage(error) => write!(f, "store read/write failed: {error}"),
            StoreError::Commit(error) => write!(f, "store commit failed: {error}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Open(error) => Some(error),
            StoreError::Transaction(error) => Some(error),
            StoreError::Table(error) => Some(error),
            StoreError::Storage(error) => Some(error),
            StoreError::Commit(error) => Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("rules.redb")).unwrap();
        (dir, store)
    }

    fn exact(name: &str) -> BlockRule {
        BlockRule::new(name, BlockRuleKind::Exact, "exact-list.txt", 1_700_000_000)
    }

    fn suffix(name: &str) -> BlockRule {
        BlockRule::new(name, BlockRuleKind::Suffix, "suffix-list.txt", 1_700_000_000)
    }

    #[test]
    fn empty_store_matches_nothing() {
        let (_dir, store) = temp_store();
        assert!(store.get_first_match("x.example").unwrap().is_none());
        assert!(store.metadata().unwrap().is_none());
    }

    #[test]
    fn exact_rules_match_the_apex_only() {
        let (_dir, store) = temp_store();
        store.rebuild_all(&[exact("ads.example")], 1, 100).unwrap();

        let hit = store.get_first_match("ads.example").unwrap().unwrap();
        assert_eq!(BlockRuleKind::Exact, hit.kind);
        assert_eq!("ads.example", hit.name);
        assert_eq!("exact-list.txt", hit.source);
        assert_eq!(1_700_000_000, hit.added_at);

        assert!(store.get_first_match("sub.ads.example").unwrap().is_none());
    }

    #[test]
    fn suffix_rules_match_subdomains_and_the_name_itself() {
        let (_dir, store) = temp_store();
        store
            .rebuild_all(&[suffix("doubleclick.net")], 1, 100)
            .unwrap();

        for name in [
            "doubleclick.net",
            "a.doubleclick.net",
            "a.b.doubleclick.net",
        ] {
            let hit = store.get_first_match(name).unwrap().unwrap();
            assert_eq!(BlockRuleKind::Suffix, hit.kind, "{name}");
            assert_eq!("doubleclick.net", hit.name, "{name}");
        }

        // sibling names sharing a reversed prefix must not match
        assert!(store.get_first_match("example.net").unwrap().is_none());
        assert!(store.get_first_match("net").unwrap().is_none());
        assert!(store.get_first_match("adoubleclick.net").unwrap().is_none());
    }

    #[test]
    fn exact_beats_suffix_and_longer_suffix_beats_shorter() {
        let (_dir, store) = temp_store();
        store
            .rebuild_all(
                &[
                    exact("tracker.ads.example"),
                    suffix("ads.example"),
                    suffix("tracker.ads.example"),
                ],
                1,
                100,
            )
            .unwrap();

        let hit = store.get_first_match("tracker.ads.example").unwrap().unwrap();
        assert_eq!(BlockRuleKind::Exact, hit.kind);

        let hit = store.get_first_match("x.tracker.ads.example").unwrap().unwrap();
        assert_eq!("tracker.ads.example", hit.name);

        let hit = store.get_first_match("other.ads.example").unwrap().unwrap();
        assert_eq!("ads.example", hit.name);
    }

    #[test]
    fn rebuild_replaces_the_previous_snapshot() {
        let (_dir, store) = temp_store();
        store.rebuild_all(&[exact("old.example")], 1, 100).unwrap();
        store.rebuild_all(&[exact("new.example")], 2, 200).unwrap();

        assert!(store.get_first_match("old.example").unwrap().is_none());
        assert!(store.get_first_match("new.example").unwrap().is_some());

        let meta = store.metadata().unwrap().unwrap();
        assert_eq!(2, meta.version);
        assert_eq!(200, meta.updated);
    }

    #[test]
    fn negative_updated_is_clamped_to_zero() {
        let (_dir, store) = temp_store();
        store.rebuild_all(&[], 1, -5).unwrap();
        assert_eq!(0, store.metadata().unwrap().unwrap().updated);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.redb");

        {
            let store = Store::open(&path).unwrap();
            store
                .rebuild_all(&[exact("ads.example"), suffix("doubleclick.net")], 7, 42)
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert!(store.get_first_match("ads.example").unwrap().is_some());
        assert!(store.get_first_match("x.doubleclick.net").unwrap().is_some());
        assert_eq!(7, store.metadata().unwrap().unwrap().version);
    }

    #[test]
    fn legacy_and_malformed_values_are_repaired() {
        let (_dir, store) = temp_store();
        store.rebuild_all(&[], 1, 0).unwrap();

        // write a legacy 1-octet value and a value with a junk kind
        // octet directly, as an old release might have left behind
        let txn = store.db.begin_write().unwrap();
        {
            let mut exact = txn.open_table(EXACT).unwrap();
            exact.insert(b"legacy.example".as_slice(), [1u8].as_slice()).unwrap();

            let mut junk = encode_value(&suffix("doubleclick.net"));
            junk[0] = 9;
            let mut table = txn.open_table(SUFFIX).unwrap();
            table
                .insert(reverse_name("doubleclick.net").as_bytes(), junk.as_slice())
                .unwrap();
        }
        txn.commit().unwrap();

        let hit = store.get_first_match("legacy.example").unwrap().unwrap();
        assert_eq!(BlockRuleKind::Exact, hit.kind);
        assert_eq!(0, hit.added_at);
        assert_eq!("", hit.source);

        let hit = store.get_first_match("a.doubleclick.net").unwrap().unwrap();
        assert_eq!(BlockRuleKind::Suffix, hit.kind);
        assert_eq!("doubleclick.net", hit.name);
    }
}
