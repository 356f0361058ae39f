#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]

//! Query resolution: the composition of blocklist, authoritative
//! zones, response cache, and upstream forwarding into one
//! `resolve` call.

pub mod cache;
pub mod context;
pub mod upstream;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use udns_blocklist::rules::{BlockDecision, BlockRule};
use udns_blocklist::store::{StoreError, StoreMetadata};
use udns_blocklist::{Repository, RuleStore};
use udns_types::protocol::types::{DnsResponse, Name, Question, Rcode, ResourceRecord};
use udns_types::zones::Zones;

use crate::cache::SharedCache;
use crate::context::Context;
use crate::upstream::{Forwarder, ResolveError};

/// The blocking capability: decide names, swap in snapshots.
pub trait Blocklist: Send + Sync {
    fn decide(&self, name: &Name) -> BlockDecision;

    fn update_all(
        &self,
        rules: &[BlockRule],
        version: u64,
        updated_unix: i64,
    ) -> Result<(), StoreError>;

    fn metadata(&self) -> Result<Option<StoreMetadata>, StoreError>;
}

impl<S: RuleStore + Send + Sync> Blocklist for Repository<S> {
    fn decide(&self, name: &Name) -> BlockDecision {
        Repository::decide(self, name)
    }

    fn update_all(
        &self,
        rules: &[BlockRule],
        version: u64,
        updated_unix: i64,
    ) -> Result<(), StoreError> {
        Repository::update_all(self, rules, version, updated_unix)
    }

    fn metadata(&self) -> Result<Option<StoreMetadata>, StoreError> {
        Repository::metadata(self)
    }
}

/// The authoritative capability: serve and administer zones.
pub trait ZoneStore: Send + Sync {
    fn find_records(&self, question: &Question) -> Option<Arc<[ResourceRecord]>>;
    fn put_zone(&self, apex: Name, records: Vec<ResourceRecord>);
    fn remove_zone(&self, apex: &Name);
    fn zones(&self) -> Vec<Name>;
    fn count(&self) -> usize;
}

impl ZoneStore for Zones {
    fn find_records(&self, question: &Question) -> Option<Arc<[ResourceRecord]>> {
        Zones::find_records(self, question)
    }

    fn put_zone(&self, apex: Name, records: Vec<ResourceRecord>) {
        Zones::put_zone(self, apex, records);
    }

    fn remove_zone(&self, apex: &Name) {
        Zones::remove_zone(self, apex);
    }

    fn zones(&self) -> Vec<Name> {
        Zones::zones(self)
    }

    fn count(&self) -> usize {
        Zones::count(self)
    }
}

/// The memoisation capability: the TTL-aware response cache.
pub trait AnswerCache: Send + Sync {
    fn get(&self, key: &str) -> Option<ResourceRecord>;
    fn set(&self, record: ResourceRecord);
    fn delete(&self, key: &str) -> bool;
    fn len(&self) -> usize;
    fn keys(&self) -> Vec<String>;
}

impl AnswerCache for SharedCache {
    fn get(&self, key: &str) -> Option<ResourceRecord> {
        SharedCache::get(self, key)
    }

    fn set(&self, record: ResourceRecord) {
        SharedCache::set(self, record);
    }

    fn delete(&self, key: &str) -> bool {
        SharedCache::delete(self, key)
    }

    fn len(&self) -> usize {
        SharedCache::len(self)
    }

    fn keys(&self) -> Vec<String> {
        SharedCache::keys(self)
    }
}

/// The forwarding capability: upstream resolution and its liveness
/// probe.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn resolve(&self, ctx: &Context, question: &Question)
        -> Result<DnsResponse, ResolveError>;

    async fn health(&self) -> bool;
}

#[async_trait]
impl Upstream for Forwarder {
    async fn resolve(
        &self,
        ctx: &Context,
        question: &Question,
    ) -> Result<DnsResponse, ResolveError> {
        Forwarder::resolve(self, ctx, question).await
    }

    async fn health(&self) -> bool {
        Forwarder::health(self).await
    }
}

/// The assembled pipeline, one handle per server.  Cloneable and
/// cheap to pass into per-request tasks.
#[derive(Clone)]
pub struct Resolver {
    pub blocklist: Arc<dyn Blocklist>,
    pub zones: Arc<dyn ZoneStore>,
    pub cache: Arc<dyn AnswerCache>,
    pub upstream: Arc<dyn Upstream>,
}

impl Resolver {
    pub async fn resolve(&self, ctx: &Context, question: &Question) -> DnsResponse {
        resolve(
            ctx,
            &*self.blocklist,
            &*self.zones,
            &*self.cache,
            &*self.upstream,
            question,
        )
        .await
    }
}

/// Resolve one question.
///
/// The stages run in a fixed order: blocklist first (a blocked name
/// must never leak upstream), then the authoritative zones (their
/// records do not age like cached ones), then the response cache,
/// then upstream.  Whatever happens, the client gets a well-formed
/// response echoing the question's ID:
///
/// - blocked names answer NXDOMAIN with empty sections;
/// - zone hits answer NOERROR with the stored RRset, authoritative;
/// - cache hits answer NOERROR with the remaining-TTL record;
/// - upstream successes are passed through, their answers cached;
/// - upstream failure answers SERVFAIL with empty sections.
pub async fn resolve(
    ctx: &Context,
    blocklist: &dyn Blocklist,
    zones: &dyn ZoneStore,
    cache: &dyn AnswerCache,
    upstream: &dyn Upstream,
    question: &Question,
) -> DnsResponse {
    let decision = blocklist.decide(&question.name);
    if decision.blocked {
        tracing::debug!(
            %question,
            rule = %decision.matched_rule,
            source = %decision.source,
            "blocked"
        );
        return DnsResponse::empty(question, Rcode::NameError);
    }

    if let Some(rrs) = zones.find_records(question) {
        tracing::trace!(%question, "authoritative HIT");
        let mut response = DnsResponse::with_answers(question, rrs.to_vec());
        response.authoritative = true;
        return response;
    }

    let fingerprint = question.fingerprint();
    if let Some(rr) = cache.get(&fingerprint) {
        tracing::trace!(%question, "cache HIT");
        return DnsResponse::with_answers(question, vec![rr]);
    }
    tracing::trace!(%question, "cache MISS");

    match upstream.resolve(ctx, question).await {
        Ok(mut response) => {
            let now = Instant::now();
            for rr in &response.answers {
                cache.set(rr.clone().into_cached(now));
            }
            response.question = Some(question.clone());
            response.authoritative = false;
            response
        }
        Err(error) => {
            tracing::debug!(%question, %error, "upstream failed");
            DnsResponse::empty(question, Rcode::ServerFailure)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use udns_types::protocol::types::test_util::*;
    use udns_types::protocol::types::RecordType;

    use super::*;

    /// A blocklist double with a fixed set of exact rules.
    struct StubBlocklist {
        blocked: Vec<String>,
    }

    impl StubBlocklist {
        fn none() -> Self {
            Self {
                blocked: Vec::new(),
            }
        }

        fn exact(names: &[&str]) -> Self {
            Self {
                blocked: names.iter().map(|n| (*n).to_string()).collect(),
            }
        }
    }

    impl Blocklist for StubBlocklist {
        fn decide(&self, name: &Name) -> BlockDecision {
            if self.blocked.iter().any(|b| b == name.without_trailing_dot()) {
                BlockDecision::block(&BlockRule::new(
                    name.without_trailing_dot(),
                    udns_blocklist::rules::BlockRuleKind::Exact,
                    "stub",
                    0,
                ))
            } else {
                BlockDecision::empty()
            }
        }

        fn update_all(&self, _: &[BlockRule], _: u64, _: i64) -> Result<(), StoreError> {
            Ok(())
        }

        fn metadata(&self) -> Result<Option<StoreMetadata>, StoreError> {
            Ok(None)
        }
    }

    /// An upstream double serving a scripted record, counting calls,
    /// and optionally failing.
    struct StubUpstream {
        answer: Mutex<Option<ResourceRecord>>,
        calls: AtomicUsize,
    }

    impl StubUpstream {
        fn serving(rr: ResourceRecord) -> Self {
            Self {
                answer: Mutex::new(Some(rr)),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                answer: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }

        fn disable(&self) {
            *self.answer.lock().unwrap() = None;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for StubUpstream {
        async fn resolve(
            &self,
            _ctx: &Context,
            question: &Question,
        ) -> Result<DnsResponse, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answer.lock().unwrap().clone() {
                Some(rr) => Ok(DnsResponse::with_answers(question, vec![rr])),
                None => Err(ResolveError::NoServersConfigured),
            }
        }

        async fn health(&self) -> bool {
            self.answer.lock().unwrap().is_some()
        }
    }

    fn pipeline(blocklist: StubBlocklist, upstream: StubUpstream) -> Resolver {
        Resolver {
            blocklist: Arc::new(blocklist),
            zones: Arc::new(Zones::new()),
            cache: Arc::new(SharedCache::with_capacity(64).unwrap()),
            upstream: Arc::new(upstream),
        }
    }

    #[tokio::test]
    async fn zone_hit_answers_authoritatively() {
        let resolver = pipeline(StubBlocklist::none(), StubUpstream::failing());
        let rr = a_record("www.example.com.", [192, 0, 2, 1]);
        resolver
            .zones
            .put_zone(name("example.com."), vec![rr.clone()]);

        let q = question(12345, "www.example.com.", RecordType::A);
        let response = resolver.resolve(&Context::background(), &q).await;

        assert_eq!(12345, response.id);
        assert_eq!(Rcode::NoError, response.rcode);
        assert!(response.authoritative);
        assert_eq!(vec![rr], response.answers);
        assert!(response.authority.is_empty());
        assert!(response.additional.is_empty());
    }

    #[tokio::test]
    async fn blocked_names_answer_nxdomain_and_never_reach_upstream() {
        let upstream = Arc::new(StubUpstream::serving(
            a_record("ads.example.", [203, 0, 113, 99]),
        ));
        let resolver = Resolver {
            blocklist: Arc::new(StubBlocklist::exact(&["ads.example"])),
            zones: Arc::new(Zones::new()),
            cache: Arc::new(SharedCache::with_capacity(64).unwrap()),
            upstream: upstream.clone(),
        };

        let q = question(7, "ads.example.", RecordType::A);
        let response = resolver.resolve(&Context::background(), &q).await;

        assert_eq!(7, response.id);
        assert_eq!(Rcode::NameError, response.rcode);
        assert!(response.answers.is_empty());
        assert!(response.authority.is_empty());
        assert!(response.additional.is_empty());

        assert_eq!(0, upstream.calls());
        assert_eq!(0, resolver.cache.len());
    }

    #[tokio::test]
    async fn upstream_answers_are_cached_and_served() {
        let upstream = Arc::new(StubUpstream::serving(
            a_record("cdn.example.", [203, 0, 113, 5]),
        ));
        let resolver = Resolver {
            blocklist: Arc::new(StubBlocklist::none()),
            zones: Arc::new(Zones::new()),
            cache: Arc::new(SharedCache::with_capacity(64).unwrap()),
            upstream: upstream.clone(),
        };

        let q = question(9, "cdn.example.", RecordType::A);
        let first = resolver.resolve(&Context::background(), &q).await;
        assert_eq!(Rcode::NoError, first.rcode);
        assert_eq!(1, upstream.calls());
        assert_eq!(1, resolver.cache.len());

        // disable the stub: the second identical question must come
        // from the cache
        upstream.disable();
        let second = resolver.resolve(&Context::background(), &q).await;
        assert_eq!(9, second.id);
        assert_eq!(Rcode::NoError, second.rcode);
        assert_eq!(1, second.answers.len());
        assert_eq!(first.answers[0].data, second.answers[0].data);
        assert_eq!(1, upstream.calls());
    }

    #[tokio::test]
    async fn upstream_failure_answers_servfail() {
        let resolver = pipeline(StubBlocklist::none(), StubUpstream::failing());

        let q = question(41, "unreachable.example.", RecordType::A);
        let response = resolver.resolve(&Context::background(), &q).await;

        assert_eq!(41, response.id);
        assert_eq!(Rcode::ServerFailure, response.rcode);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn every_stage_echoes_the_question_id() {
        for id in [0u16, 1, 999, u16::MAX] {
            let resolver = pipeline(
                StubBlocklist::exact(&["blocked.example"]),
                StubUpstream::failing(),
            );
            resolver.zones.put_zone(
                name("zone.example."),
                vec![a_record("zone.example.", [192, 0, 2, 7])],
            );

            for qname in ["blocked.example.", "zone.example.", "missing.example."] {
                let q = question(id, qname, RecordType::A);
                let response = resolver.resolve(&Context::background(), &q).await;
                assert_eq!(id, response.id, "{qname}");
            }
        }
    }

    #[tokio::test]
    async fn zone_precedes_cache_and_upstream() {
        let upstream = Arc::new(StubUpstream::serving(
            a_record("www.example.com.", [9, 9, 9, 9]),
        ));
        let resolver = Resolver {
            blocklist: Arc::new(StubBlocklist::none()),
            zones: Arc::new(Zones::new()),
            cache: Arc::new(SharedCache::with_capacity(64).unwrap()),
            upstream: upstream.clone(),
        };
        resolver.zones.put_zone(
            name("example.com."),
            vec![a_record("www.example.com.", [192, 0, 2, 1])],
        );

        let q = question(5, "www.example.com.", RecordType::A);
        let response = resolver.resolve(&Context::background(), &q).await;

        assert!(response.authoritative);
        assert_eq!([192, 0, 2, 1].as_slice(), &response.answers[0].data[..]);
        assert_eq!(0, upstream.calls());
    }
}
