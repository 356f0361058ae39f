//! The Bloom pre-filter in front of the rule store.
//!
//! A definitive negative here lets `decide` answer "not blocked"
//! without touching the decision cache or the store at all, which is
//! the common case for every name not on any list.

use bloomfilter::Bloom;

/// The false-positive rate used when the configured one is not a
/// probability.
pub const DEFAULT_FP_RATE: f64 = 0.01;

/// A probabilistic set of rule keys.  Sized for an expected element
/// count `n` and target false-positive rate `p` with the standard
/// formulas
///
/// ```text
///     m = ceil(-n * ln p / (ln 2)^2)        (bits)
///     k = max(1, round((m / n) * ln 2))     (hash functions)
/// ```
///
/// An expected count of zero is treated as one, and a `p` outside
/// (0, 1) falls back to 0.01, so construction cannot fail.
///
/// Filters are never mutated after construction-time `add` calls
/// finish: each blocklist snapshot builds a fresh filter and swaps it
/// in whole.
pub struct BloomFilter {
    inner: Bloom<[u8]>,
}

impl BloomFilter {
    pub fn with_parameters(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1);
        let p = if fp_rate > 0.0 && fp_rate < 1.0 {
            fp_rate
        } else {
            DEFAULT_FP_RATE
        };

        Self {
            inner: Bloom::new_for_fp_rate(n, p),
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        self.inner.set(key);
    }

    /// True if the key *may* have been added; false only if it
    /// definitely was not.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.inner.check(key)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.inner.number_of_bits())
            .field("hashes", &self.inner.number_of_hash_functions())
            .finish()
    }
}
