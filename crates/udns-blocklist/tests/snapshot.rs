//! Snapshot-atomicity checks against the real on-disk store.

use udns_blocklist::rules::{BlockRule, BlockRuleKind};
use udns_blocklist::store::Store;
use udns_blocklist::Repository;
use udns_types::protocol::types::Name;

fn name(s: &str) -> Name {
    Name::canonicalise(s).unwrap()
}

fn repository(dir: &tempfile::TempDir) -> Repository {
    let store = Store::open(&dir.path().join("rules.redb")).unwrap();
    Repository::new(store, 1024, 0.01)
}

#[test]
fn snapshot_covers_every_rule() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);

    let mut rules = Vec::new();
    for i in 0..50 {
        rules.push(BlockRule::new(
            &format!("exact-{i}.example"),
            BlockRuleKind::Exact,
            "exact-list.txt",
            1_700_000_000,
        ));
        rules.push(BlockRule::new(
            &format!("suffix-{i}.example"),
            BlockRuleKind::Suffix,
            "suffix-list.txt",
            1_700_000_000,
        ));
    }
    repo.update_all(&rules, 1, 1_700_000_000).unwrap();

    for rule in &rules {
        match rule.kind {
            BlockRuleKind::Exact => {
                let decision = repo.decide(&name(&format!("{}.", rule.name)));
                assert!(decision.blocked, "{}", rule.name);
                assert_eq!(Some(BlockRuleKind::Exact), decision.kind, "{}", rule.name);
            }
            BlockRuleKind::Suffix => {
                for queried in [rule.name.clone(), format!("deep.sub.{}", rule.name)] {
                    let decision = repo.decide(&name(&format!("{queried}.")));
                    assert!(decision.blocked, "{queried}");
                    assert_eq!(Some(BlockRuleKind::Suffix), decision.kind, "{queried}");
                    assert_eq!(rule.name, decision.matched_rule, "{queried}");
                }
            }
        }
    }
}

#[test]
fn update_is_atomic_across_store_bloom_and_cache() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);

    repo.update_all(
        &[BlockRule::new(
            "ads.example",
            BlockRuleKind::Exact,
            "v1.txt",
            100,
        )],
        1,
        100,
    )
    .unwrap();

    // warm the decision cache with both outcomes
    assert!(repo.decide(&name("ads.example.")).blocked);
    assert!(!repo.decide(&name("ads-two.example.")).blocked);

    repo.update_all(
        &[BlockRule::new(
            "ads-two.example",
            BlockRuleKind::Exact,
            "v2.txt",
            200,
        )],
        2,
        200,
    )
    .unwrap();

    // no stale decisions survive the swap
    assert_eq!(0, repo.cached_decisions());
    assert!(!repo.decide(&name("ads.example.")).blocked);
    let decision = repo.decide(&name("ads-two.example."));
    assert!(decision.blocked);
    assert_eq!("v2.txt", decision.source);

    let meta = repo.metadata().unwrap().unwrap();
    assert_eq!(2, meta.version);
    assert_eq!(200, meta.updated);
}

#[test]
fn first_match_prefers_exact_then_longest_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);

    repo.update_all(
        &[
            BlockRule::new("ads.example", BlockRuleKind::Suffix, "broad.txt", 1),
            BlockRule::new("cdn.ads.example", BlockRuleKind::Suffix, "narrow.txt", 2),
            BlockRule::new("static.cdn.ads.example", BlockRuleKind::Exact, "pin.txt", 3),
        ],
        1,
        100,
    )
    .unwrap();

    let decision = repo.decide(&name("static.cdn.ads.example."));
    assert_eq!(Some(BlockRuleKind::Exact), decision.kind);
    assert_eq!("pin.txt", decision.source);

    let decision = repo.decide(&name("x.cdn.ads.example."));
    assert_eq!("cdn.ads.example", decision.matched_rule);

    let decision = repo.decide(&name("y.ads.example."));
    assert_eq!("ads.example", decision.matched_rule);
}
