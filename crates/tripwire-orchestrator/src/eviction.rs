//! LRU eviction policy.

use std::time::Instant;

/// Strict least-recently-used victim selection.
///
/// Ties on the access timestamp are broken by insertion order (the
/// earliest-inserted entry wins eviction), which keeps the choice
/// deterministic under coarse clocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruPolicy;

impl LruPolicy {
    /// Picks the key to drop from `(key, last_access, inserted_seq)`
    /// candidates. Returns `None` when there are no candidates.
    pub fn select_victim<'a, I>(&self, candidates: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = (&'a str, Instant, u64)>,
    {
        candidates
            .into_iter()
            .min_by_key(|&(_, last_access, inserted_seq)| (last_access, inserted_seq))
            .map(|(key, _, _)| key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_candidates_yield_none() {
        let policy = LruPolicy;
        assert_eq!(policy.select_victim(std::iter::empty()), None);
    }

    #[test]
    fn test_oldest_access_wins_eviction() {
        let policy = LruPolicy;
        let now = Instant::now();

        let candidates = vec![
            ("m1", now - Duration::from_secs(30), 0),
            ("m2", now - Duration::from_secs(10), 1),
            ("m3", now, 2),
        ];

        assert_eq!(policy.select_victim(candidates), Some("m1"));
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let policy = LruPolicy;
        let at = Instant::now();

        let candidates = vec![("late", at, 7), ("early", at, 3), ("middle", at, 5)];

        assert_eq!(policy.select_victim(candidates), Some("early"));
    }

    #[test]
    fn test_single_candidate() {
        let policy = LruPolicy;
        let candidates = vec![("only", Instant::now(), 0)];
        assert_eq!(policy.select_victim(candidates), Some("only"));
    }
}
