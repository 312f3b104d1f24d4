//! Sorted-set backing store: a member→score table paired with a
//! score-ordered index.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::mem;

use crate::dict::Dict;
use crate::sds::Sds;

/// Ordering key: score first, member bytes as tie-break. Scores are finite
/// by construction (the coercion layer rejects non-finite input).
struct ScoreKey {
    score: f64,
    member: Sds,
}

impl PartialEq for ScoreKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.as_bytes().cmp(other.member.as_bytes()))
    }
}

pub struct ZSet {
    dict: Dict<f64>,
    ord: BTreeMap<ScoreKey, ()>,
}

impl ZSet {
    pub fn new() -> Self {
        ZSet {
            dict: Dict::new(),
            ord: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Inserts or updates a member. Returns `true` when the member was new.
    pub fn insert(&mut self, member: &[u8], score: f64) -> bool {
        let key = Sds::from_bytes(member);
        if let Some(old) = self.dict.insert(key.clone(), score) {
            self.ord.remove(&ScoreKey {
                score: old,
                member: key.clone(),
            });
            self.ord.insert(ScoreKey { score, member: key }, ());
            false
        } else {
            self.ord.insert(ScoreKey { score, member: key }, ());
            true
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.dict.get(member).copied()
    }

    /// Members in score order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], f64)> {
        self.ord.keys().map(|k| (k.member.as_bytes(), k.score))
    }

    pub fn dict(&self) -> &Dict<f64> {
        &self.dict
    }

    /// Ordered-index bookkeeping per member, excluding the member bytes.
    pub fn node_overhead() -> usize {
        mem::size_of::<ScoreKey>() + 4 * mem::size_of::<usize>()
    }
}

impl Default for ZSet {
    fn default() -> Self {
        Self::new()
    }
}
