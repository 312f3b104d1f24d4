//! The immortal shared-value registry.
//!
//! Populated once at startup and frozen: every value in it carries the
//! [`SHARED_REFCOUNT`](crate::SHARED_REFCOUNT) sentinel, so clone and drop
//! are no-ops and the records may be read from any thread without
//! synchronization.

use lazy_static::lazy_static;

use crate::string::OString;

/// One immortal integer value exists for every integer in
/// `0..SHARED_INT_LIMIT`.
pub const SHARED_INT_LIMIT: i64 = 10_000;

struct Registry {
    integers: Vec<OString>,
    empty: OString,
    ok: OString,
}

impl Registry {
    fn build() -> Self {
        let integers: Vec<OString> = (0..SHARED_INT_LIMIT)
            .map(|v| {
                let s = OString::int_value(v);
                s.0.promote_shared();
                s
            })
            .collect();
        let empty = OString::new(b"");
        empty.0.promote_shared();
        let ok = OString::new(b"OK");
        ok.0.promote_shared();
        log::debug!("shared registry initialized with {} integers", integers.len());
        Registry { integers, empty, ok }
    }
}

lazy_static! {
    static ref REGISTRY: Registry = Registry::build();
}

// Eagerly initialize the registry during tests or when the `ctor`
// feature is enabled.
#[cfg(any(test, feature = "ctor"))]
#[ctor::ctor]
fn ctor_init_registry() {
    lazy_static::initialize(&REGISTRY);
}

/// Forces registry construction; hosts call this once during startup so
/// later reads never hit initialization.
pub fn init() {
    lazy_static::initialize(&REGISTRY);
}

/// The shared singleton for `v`, when `v` is in the shared range.
#[must_use]
pub fn integer(v: i64) -> Option<OString> {
    if (0..SHARED_INT_LIMIT).contains(&v) {
        Some(REGISTRY.integers[v as usize].clone())
    } else {
        None
    }
}

/// The immortal empty string.
#[must_use]
pub fn empty_string() -> OString {
    REGISTRY.empty.clone()
}

/// The immortal "OK" status value.
#[must_use]
pub fn ok() -> OString {
    REGISTRY.ok.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Encoding, SHARED_REFCOUNT};

    #[mockalloc::test]
    fn integers_are_deduplicated() {
        let a = integer(9999).unwrap();
        let b = integer(9999).unwrap();
        assert!(a.0.ptr_eq(&b.0));
        assert_eq!(a.0.encoding(), Encoding::Int);
        assert_eq!(a.to_i64(), Ok(9999));
        assert!(integer(SHARED_INT_LIMIT).is_none());
        assert!(integer(-1).is_none());
    }

    #[mockalloc::test]
    fn refcount_is_immune_to_clone_and_drop() {
        let a = integer(5).unwrap();
        assert_eq!(a.0.refcount(), SHARED_REFCOUNT);
        let b = a.clone();
        assert_eq!(a.0.refcount(), SHARED_REFCOUNT);
        drop(b);
        drop(a.clone());
        assert_eq!(a.0.refcount(), SHARED_REFCOUNT);
        // Payload bytes are unchanged by any of the above.
        assert_eq!(a.decoded().str_bytes(), Some(&b"5"[..]));
    }

    #[mockalloc::test]
    fn well_known_values() {
        assert_eq!(empty_string().len(), 0);
        assert!(empty_string().0.is_shared());
        assert_eq!(ok().str_bytes(), Some(&b"OK"[..]));
        assert!(ok().0.ptr_eq(&ok().0));
    }
}
