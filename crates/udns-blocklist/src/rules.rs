//! Block rules and blocking decisions.
//!
//! Rule names are canonical domain names *without* the trailing dot:
//! `ads.example`, not `ads.example.`.  Suffix rules are keyed in the
//! persistent store and the Bloom filter by their byte-reversed name
//! (the "reversed anchor"), so that all the names a suffix rule
//! covers share its key as a prefix of their own reversed forms.

use std::fmt;

/// How a rule matches.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BlockRuleKind {
    /// Matches the named apex only.
    Exact,

    /// Matches the name itself and every subdomain of it.
    Suffix,
}

impl fmt::Display for BlockRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockRuleKind::Exact => write!(f, "exact"),
            BlockRuleKind::Suffix => write!(f, "suffix"),
        }
    }
}

/// A single blocking rule, as produced by the list parsers.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockRule {
    /// Canonical name without the trailing dot.
    pub name: String,

    pub kind: BlockRuleKind,

    /// Which list this rule came from.  Non-empty.
    pub source: String,

    /// When the rule was added, in Unix seconds.
    pub added_at: u64,
}

impl BlockRule {
    pub fn new(name: &str, kind: BlockRuleKind, source: &str, added_at: u64) -> Self {
        Self {
            name: name.trim().trim_end_matches('.').to_ascii_lowercase(),
            kind,
            source: source.to_string(),
            added_at,
        }
    }

    /// The store key for this rule: the name as-is for exact rules,
    /// the reversed anchor for suffix rules.
    pub fn key(&self) -> String {
        match self.kind {
            BlockRuleKind::Exact => self.name.clone(),
            BlockRuleKind::Suffix => reverse_name(&self.name),
        }
    }
}

/// The outcome of a blocking decision.  `BlockDecision::empty()` is
/// "not blocked".
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockDecision {
    pub blocked: bool,

    /// The name of the rule that matched, when blocked.
    pub matched_rule: String,

    /// The source list of the matching rule, when blocked.
    pub source: String,

    pub kind: Option<BlockRuleKind>,
}

impl BlockDecision {
    /// The "not blocked" decision.
    pub fn empty() -> Self {
        Self {
            blocked: false,
            matched_rule: String::new(),
            source: String::new(),
            kind: None,
        }
    }

    pub fn block(rule: &BlockRule) -> Self {
        Self {
            blocked: true,
            matched_rule: rule.name.clone(),
            source: rule.source.clone(),
            kind: Some(rule.kind),
        }
    }
}

/// Byte-wise reversal of a canonical (ASCII) name:
/// `example.com` becomes `moc.elpmaxe`.
///
/// This is the one and only reversal used anywhere - the store keys,
/// the Bloom filter keys, and the lookup walk must all agree on it.
pub fn reverse_name(name: &str) -> String {
    name.bytes().rev().map(char::from).collect()
}

/// The reversed anchors of a name, most specific first: the reversed
/// form of the name itself, then of each suffix obtained by stripping
/// the leftmost label, down to the bare final label.
///
/// `a.b.example.com` yields the reversed forms of `a.b.example.com`,
/// `b.example.com`, `example.com`, and `com`.
pub fn suffix_anchors(name: &str) -> Vec<String> {
    let mut anchors = Vec::with_capacity(4);
    let mut rest = name;

    loop {
        anchors.push(reverse_name(rest));
        match rest.find('.') {
            Some(dot) => rest = &rest[dot + 1..],
            None => break,
        }
    }

    anchors
}
