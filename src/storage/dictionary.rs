//! String dictionary: i32 id ↔ string with a transient tier
//!
//! Persistent ids count up from zero and never change; literals added during
//! a query land in the transient tier with negative ids so the persistent
//! mapping is never mutated by query execution. A dictionary outlives any
//! query that references it (held by `Arc` from table metadata, literal
//! buffers and result sets alike).

use parking_lot::RwLock;
use std::collections::HashMap;

/// Reserved id meaning "not present"
pub const INVALID_STR_ID: i32 = -1;

/// First transient id; the tier grows downward (-2, -3, ...)
const BASE_TRANSIENT_ID: i32 = -2;

#[derive(Debug, Default)]
struct Tier {
    strings: Vec<String>,
    ids: HashMap<String, i32>,
}

/// Bidirectional string mapping with O(1) id→string and amortized O(1)
/// string→id.
#[derive(Debug, Default)]
pub struct StringDictionary {
    persistent: RwLock<Tier>,
    transient: RwLock<Tier>,
}

impl StringDictionary {
    /// Empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dictionary pre-populated from an iterator (ids assigned in order).
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dict = Self::new();
        for s in strings {
            dict.get_or_add(&s.into());
        }
        dict
    }

    /// Intern a string into the persistent tier, returning its id.
    #[allow(clippy::cast_possible_wrap)]
    pub fn get_or_add(&self, s: &str) -> i32 {
        {
            let tier = self.persistent.read();
            if let Some(&id) = tier.ids.get(s) {
                return id;
            }
        }
        let mut tier = self.persistent.write();
        if let Some(&id) = tier.ids.get(s) {
            return id;
        }
        let id = tier.strings.len() as i32;
        tier.strings.push(s.to_string());
        tier.ids.insert(s.to_string(), id);
        id
    }

    /// Intern a query-time literal into the transient tier. The persistent
    /// tier is consulted first so an existing id is reused.
    pub fn get_or_add_transient(&self, s: &str) -> i32 {
        if let Some(id) = self.get_id(s) {
            return id;
        }
        let mut tier = self.transient.write();
        if let Some(&id) = tier.ids.get(s) {
            return id;
        }
        #[allow(clippy::cast_possible_wrap)]
        let id = BASE_TRANSIENT_ID - tier.strings.len() as i32;
        tier.strings.push(s.to_string());
        tier.ids.insert(s.to_string(), id);
        id
    }

    /// Resolve a string to its id in either tier.
    #[must_use]
    pub fn get_id(&self, s: &str) -> Option<i32> {
        if let Some(&id) = self.persistent.read().ids.get(s) {
            return Some(id);
        }
        self.transient.read().ids.get(s).copied()
    }

    /// Resolve an id to its string.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn string(&self, id: i32) -> Option<String> {
        if id >= 0 {
            self.persistent.read().strings.get(id as usize).cloned()
        } else if id <= BASE_TRANSIENT_ID {
            let idx = (BASE_TRANSIENT_ID - id) as usize;
            self.transient.read().strings.get(idx).cloned()
        } else {
            None
        }
    }

    /// Persistent entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.persistent.read().strings.len()
    }

    /// Whether the persistent tier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transient entry count.
    #[must_use]
    pub fn transient_len(&self) -> usize {
        self.transient.read().strings.len()
    }

    /// Ids whose strings match a SQL LIKE pattern (`%`/`_` wildcards), both
    /// tiers. Used to lower LIKE over dictionary-encoded columns into an id
    /// set at query-compile time.
    #[must_use]
    pub fn ids_matching(&self, pattern: &str, case_insensitive: bool) -> Vec<i32> {
        let mut out = Vec::new();
        {
            let tier = self.persistent.read();
            for (i, s) in tier.strings.iter().enumerate() {
                if like_match(pattern, s, case_insensitive) {
                    #[allow(clippy::cast_possible_wrap)]
                    out.push(i as i32);
                }
            }
        }
        let tier = self.transient.read();
        for (i, s) in tier.strings.iter().enumerate() {
            if like_match(pattern, s, case_insensitive) {
                #[allow(clippy::cast_possible_wrap)]
                out.push(BASE_TRANSIENT_ID - i as i32);
            }
        }
        out
    }

    /// Bulk id translation: for every id of `self`, the matching id in
    /// `dest` or [`INVALID_STR_ID`] when the string is absent there. Index
    /// into the returned map with the source id.
    #[must_use]
    pub fn build_translation_map(&self, dest: &Self) -> Vec<i32> {
        let tier = self.persistent.read();
        tier.strings
            .iter()
            .map(|s| dest.get_id(s).unwrap_or(INVALID_STR_ID))
            .collect()
    }
}

/// SQL LIKE match: `%` any run, `_` any single char.
#[must_use]
pub fn like_match(pattern: &str, s: &str, case_insensitive: bool) -> bool {
    fn rec(p: &[char], s: &[char]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some('%') => {
                (0..=s.len()).any(|k| rec(&p[1..], &s[k..]))
            }
            Some('_') => !s.is_empty() && rec(&p[1..], &s[1..]),
            Some(&c) => s.first() == Some(&c) && rec(&p[1..], &s[1..]),
        }
    }
    if case_insensitive {
        let p: Vec<char> = pattern.to_lowercase().chars().collect();
        let t: Vec<char> = s.to_lowercase().chars().collect();
        rec(&p, &t)
    } else {
        let p: Vec<char> = pattern.chars().collect();
        let t: Vec<char> = s.chars().collect();
        rec(&p, &t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_ids_are_dense_and_stable() {
        let dict = StringDictionary::new();
        assert_eq!(dict.get_or_add("hi"), 0);
        assert_eq!(dict.get_or_add("bye"), 1);
        assert_eq!(dict.get_or_add("hi"), 0);
        assert_eq!(dict.string(1).as_deref(), Some("bye"));
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_transient_tier_grows_downward_without_touching_persistent() {
        let dict = StringDictionary::from_strings(["a", "b"]);
        let t1 = dict.get_or_add_transient("zzz");
        let t2 = dict.get_or_add_transient("yyy");
        assert_eq!(t1, -2);
        assert_eq!(t2, -3);
        assert_eq!(dict.get_or_add_transient("zzz"), -2);
        // an existing persistent string resolves without a transient entry
        assert_eq!(dict.get_or_add_transient("a"), 0);
        assert_eq!(dict.len(), 2, "persistent tier untouched");
        assert_eq!(dict.transient_len(), 2);
        assert_eq!(dict.string(-3).as_deref(), Some("yyy"));
    }

    #[test]
    fn test_invalid_id_resolution() {
        let dict = StringDictionary::new();
        assert_eq!(dict.string(INVALID_STR_ID), None);
        assert_eq!(dict.string(5), None);
    }

    #[test]
    fn test_like_matching_over_ids() {
        let dict = StringDictionary::from_strings(["apple", "apricot", "banana"]);
        let ids = dict.ids_matching("ap%", false);
        assert_eq!(ids, vec![0, 1]);
        let ids = dict.ids_matching("_anana", false);
        assert_eq!(ids, vec![2]);
        let ids = dict.ids_matching("APPLE", true);
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn test_translation_map_between_dictionaries() {
        let src = StringDictionary::from_strings(["x", "y", "z"]);
        let dst = StringDictionary::from_strings(["z", "x"]);
        let map = src.build_translation_map(&dst);
        assert_eq!(map, vec![1, INVALID_STR_ID, 0]);
    }
}
