//! The authoritative zone store: in-memory zones indexed by apex,
//! holding RRsets keyed the same way questions are fingerprinted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::protocol::types::*;

const LOCK_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] zone lock poisoned, cannot recover from this - aborting";

/// A collection of zones, safe to share between threads.
///
/// Replacing a zone is atomic from a reader's perspective: the new
/// zone is built outside the lock and swapped in whole, so a
/// concurrent `find_records` sees either the old zone or the new one,
/// never a mixture.
#[derive(Debug, Clone, Default)]
pub struct Zones {
    inner: Arc<RwLock<HashMap<Name, Arc<Zone>>>>,
}

impl Zones {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the entire contents for an apex.
    pub fn put_zone(&self, apex: Name, records: Vec<ResourceRecord>) {
        let zone = Arc::new(Zone::new(records));
        self.inner
            .write()
            .expect(LOCK_POISON_MESSAGE)
            .insert(apex, zone);
    }

    /// Remove the zone at an apex, if there is one.  Removing an
    /// absent apex is fine.
    pub fn remove_zone(&self, apex: &Name) {
        self.inner.write().expect(LOCK_POISON_MESSAGE).remove(apex);
    }

    /// Look up the RRset answering a question: find the zone for the
    /// question name's apex, then the records at the question's
    /// fingerprint.
    ///
    /// The records are handed out as a reference-counted view of the
    /// zone's own vector: no record is copied, and the zone can be
    /// replaced while the caller still reads the old RRset.
    pub fn find_records(&self, question: &Question) -> Option<Arc<[ResourceRecord]>> {
        let apex = question.name.apex();

        let zone = {
            let zones = self.inner.read().expect(LOCK_POISON_MESSAGE);
            zones.get(&apex).cloned()
        }?;

        zone.rrsets.get(&question.fingerprint()).cloned()
    }

    /// The apexes currently served, for administration.
    pub fn zones(&self) -> Vec<Name> {
        self.inner
            .read()
            .expect(LOCK_POISON_MESSAGE)
            .keys()
            .cloned()
            .collect()
    }

    /// How many zones are currently served.
    pub fn count(&self) -> usize {
        self.inner.read().expect(LOCK_POISON_MESSAGE).len()
    }
}

/// A zone is a collection of records all belonging to the same apex,
/// grouped into RRsets by fingerprint.
#[derive(Debug)]
struct Zone {
    rrsets: HashMap<String, Arc<[ResourceRecord]>>,
}

impl Zone {
    fn new(records: Vec<ResourceRecord>) -> Self {
        let mut grouped: HashMap<String, Vec<ResourceRecord>> = HashMap::new();
        for rr in records {
            grouped.entry(rr.fingerprint()).or_default().push(rr);
        }

        let rrsets = grouped
            .into_iter()
            .map(|(fingerprint, rrs)| (fingerprint, Arc::from(rrs)))
            .collect();

        Self { rrsets }
    }
}
