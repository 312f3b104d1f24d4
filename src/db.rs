//! The key→value map that owns stored values.
//!
//! Minimal by design: the command layer needs lookups (with and without
//! access-clock updates), replacement and removal with the refcount
//! discipline, an expires table, and per-table bookkeeping for the memory
//! report.

use crate::dict::Dict;
use crate::sds::Sds;
use crate::value::OValue;

pub struct Database {
    id: u32,
    dict: Dict<OValue>,
    expires: Dict<u64>,
}

impl Database {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Database {
            id,
            dict: Dict::new(),
            expires: Dict::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dict.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    #[must_use]
    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    /// Stores `value` under `key`, taking over its reference. A replaced
    /// value is released.
    pub fn set(&mut self, key: &[u8], value: OValue) {
        self.dict.insert(Sds::from_bytes(key), value);
        self.expires.remove(key);
    }

    /// Read-path lookup: updates the value's access clock.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&OValue> {
        let v = self.dict.get(key)?;
        v.touch();
        Some(v)
    }

    /// Introspection lookup: does not disturb the access clock.
    #[must_use]
    pub fn peek(&self, key: &[u8]) -> Option<&OValue> {
        self.dict.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut OValue> {
        self.dict.get_mut(key)
    }

    /// Removes a key, releasing the stored reference.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key);
        self.dict.remove(key).is_some()
    }

    /// Sets a key's expiry (milliseconds since the epoch). The key must
    /// exist in the main table.
    pub fn set_expire(&mut self, key: &[u8], at_ms: u64) -> bool {
        if !self.dict.contains_key(key) {
            return false;
        }
        self.expires.insert(Sds::from_bytes(key), at_ms);
        true
    }

    #[must_use]
    pub fn expire_at(&self, key: &[u8]) -> Option<u64> {
        self.expires.get(key).copied()
    }

    /// Main-table bookkeeping bytes for the overhead report.
    #[must_use]
    pub fn main_overhead_bytes(&self) -> usize {
        self.dict.overhead_bytes()
    }

    /// Expires-table bookkeeping bytes for the overhead report.
    #[must_use]
    pub fn expires_overhead_bytes(&self) -> usize {
        self.expires.overhead_bytes()
    }

    /// The cost of the key itself: its string allocation plus one main
    /// table entry's bookkeeping. `None` when the key is absent.
    #[must_use]
    pub fn key_footprint(&self, key: &[u8]) -> Option<usize> {
        let (stored_key, _) = self.dict.get_key_value(key)?;
        Some(stored_key.alloc_size() + Dict::<OValue>::entry_overhead())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::OString;
    use crate::value::Encoding;

    #[mockalloc::test]
    fn set_get_remove_balance_references() {
        let mut db = Database::new(0);
        db.set(b"k", OString::new(b"first").into());
        db.set(b"k", OString::new(b"second").into());
        assert_eq!(db.len(), 1);
        let v = db.get(b"k").unwrap();
        assert_eq!(v.encoding(), Encoding::EmbStr);
        assert_eq!(v.refcount(), 1);
        assert!(db.remove(b"k"));
        assert!(!db.remove(b"k"));
        assert!(db.get(b"k").is_none());
    }

    #[mockalloc::test]
    fn aliases_survive_eviction() {
        let mut db = Database::new(0);
        let v: OValue = OString::new(b"kept alive").into();
        db.set(b"k", v.clone());
        assert_eq!(v.refcount(), 2);
        db.remove(b"k");
        assert_eq!(v.refcount(), 1);
        assert_eq!(
            v.as_string().unwrap().str_bytes(),
            Some(&b"kept alive"[..])
        );
    }

    #[mockalloc::test]
    fn expires_follow_the_key() {
        let mut db = Database::new(3);
        assert!(!db.set_expire(b"k", 1000));
        db.set(b"k", OString::new(b"v").into());
        assert!(db.set_expire(b"k", 1000));
        assert_eq!(db.expire_at(b"k"), Some(1000));
        assert_eq!(db.expires_len(), 1);
        // Overwriting the key clears its expiry.
        db.set(b"k", OString::new(b"w").into());
        assert_eq!(db.expire_at(b"k"), None);
    }

    #[mockalloc::test]
    fn key_footprint_counts_key_and_entry() {
        let mut db = Database::new(0);
        db.set(b"some-key", OString::new(b"v").into());
        let footprint = db.key_footprint(b"some-key").unwrap();
        assert!(footprint > b"some-key".len());
        assert!(db.key_footprint(b"missing").is_none());
    }
}
