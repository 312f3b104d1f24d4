//! String values: construction across the three physical forms and the
//! adaptive re-encoding that moves between them.

use std::fmt::{self, Debug, Formatter};
use std::ptr::{copy_nonoverlapping, write_bytes};

use crate::convert;
use crate::eviction;
use crate::sds::Sds;
use crate::shared;
use crate::value::{Encoding, Kind, OValue, Payload};

/// Longest string stored embedded in the header allocation. Chosen so the
/// whole allocation still fits a 64-byte allocator slab.
pub const EMBSTR_LIMIT: usize = 44;

/// Strings longer than this never re-encode as integers.
const INT_ENCODE_LIMIT: usize = 20;

/// Raw capacity slack tolerated before `try_encode` shrinks the payload,
/// as a fraction of the string length.
const SHRINK_DENOMINATOR: usize = 10;

/// A string-kind value.
///
/// Three physical forms back it: an independently allocated dynamic string
/// (`Raw`), bytes embedded in the header allocation (`EmbStr`, immutable
/// for the life of the header), and a tagged machine integer with no heap
/// payload at all (`Int`).
#[repr(transparent)]
#[derive(Clone)]
pub struct OString(pub(crate) OValue);

impl OString {
    pub(crate) fn from_value(v: OValue) -> Self {
        debug_assert_eq!(v.kind(), Kind::String);
        OString(v)
    }

    /// The public construction entry point: embeds short strings, spills
    /// long ones to a dynamic string.
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        if bytes.len() <= EMBSTR_LIMIT {
            Self::embedded(bytes)
        } else {
            Self::raw(bytes)
        }
    }

    /// A `Raw`-encoded string with an independently allocated payload.
    #[must_use]
    pub fn raw(bytes: &[u8]) -> Self {
        OString(OValue::from_parts(
            Kind::String,
            Encoding::Raw,
            0,
            Payload::from_box(Box::new(Sds::from_bytes(bytes))),
        ))
    }

    /// An `EmbStr`-encoded string: header and bytes in one allocation.
    #[must_use]
    pub fn embedded(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= EMBSTR_LIMIT);
        let mut v = OValue::from_parts(
            Kind::String,
            Encoding::EmbStr,
            bytes.len(),
            Payload::from_len(bytes.len()),
        );
        // Safety: the allocation carries exactly `len` trailing bytes
        unsafe {
            copy_nonoverlapping(bytes.as_ptr(), v.emb_bytes_mut_ptr(), bytes.len());
        }
        OString(v)
    }

    /// A zero-filled string of the given length, encoded like
    /// [`OString::new`] would encode it.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        if len <= EMBSTR_LIMIT {
            let mut v =
                OValue::from_parts(Kind::String, Encoding::EmbStr, len, Payload::from_len(len));
            // Safety: the allocation carries exactly `len` trailing bytes
            unsafe {
                write_bytes(v.emb_bytes_mut_ptr(), 0, len);
            }
            OString(v)
        } else {
            OString(OValue::from_parts(
                Kind::String,
                Encoding::Raw,
                0,
                Payload::from_box(Box::new(Sds::zeroed(len))),
            ))
        }
    }

    /// An integer string: the shared singleton when the value qualifies and
    /// the eviction policy permits aliasing, else a fresh `Int` header.
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        if eviction::shared_integers_enabled() {
            if let Some(s) = shared::integer(v) {
                return s;
            }
        }
        Self::int_value(v)
    }

    pub(crate) fn int_value(v: i64) -> Self {
        OString(OValue::from_parts(
            Kind::String,
            Encoding::Int,
            0,
            Payload::from_int(v),
        ))
    }

    /// Formats a double into a string value. `human_friendly` trades
    /// precision for a plain decimal form with trailing zeros trimmed;
    /// otherwise the scientific form round-trips the value bit-for-bit.
    #[must_use]
    pub fn from_f64(v: f64, human_friendly: bool) -> Self {
        let s = convert::format_double(v, human_friendly);
        Self::new(s.as_bytes())
    }

    /// An independent, unshared copy preserving the encoding. An `Int` dup
    /// never returns the shared singleton.
    #[must_use]
    pub fn dup(&self) -> Self {
        match self.0.encoding() {
            // Safety: Int payload is the integer itself
            Encoding::Int => Self::int_value(unsafe { self.0.payload_int() }),
            Encoding::EmbStr => Self::embedded(self.0.emb_bytes()),
            Encoding::Raw => Self::raw(self.sds().as_bytes()),
            other => unreachable!("corrupt string encoding {:?}", other),
        }
    }

    pub(crate) fn sds(&self) -> &Sds {
        debug_assert_eq!(self.0.encoding(), Encoding::Raw);
        // Safety: Raw payload is an owned Sds
        unsafe { self.0.payload_ref::<Sds>() }
    }

    /// The string bytes for string-form encodings; `None` under `Int`.
    #[must_use]
    pub fn str_bytes(&self) -> Option<&[u8]> {
        match self.0.encoding() {
            Encoding::Raw => Some(self.sds().as_bytes()),
            Encoding::EmbStr => Some(self.0.emb_bytes()),
            Encoding::Int => None,
            other => unreachable!("corrupt string encoding {:?}", other),
        }
    }

    /// String length; the decimal digit count under `Int`.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.str_bytes() {
            Some(bytes) => bytes.len(),
            // Safety: Int payload is the integer itself
            None => convert::digits_i64(unsafe { self.0.payload_int() }),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends bytes, forcing the `Raw` encoding: embedded and integer
    /// forms are immutable, so they are materialized first.
    pub fn append(&mut self, more: &[u8]) -> usize {
        assert_eq!(self.0.refcount(), 1, "cannot mutate an aliased value");
        match self.0.encoding() {
            Encoding::Raw => {
                // Safety: sole reference, checked above
                unsafe { self.0.payload_mut::<Sds>() }.append(more);
            }
            Encoding::EmbStr | Encoding::Int => {
                let mut sds = match self.str_bytes() {
                    Some(bytes) => Sds::from_bytes(bytes),
                    None => {
                        let mut buf = [0u8; 32];
                        // Safety: Int payload is the integer itself
                        let n = convert::fmt_i64(unsafe { self.0.payload_int() }, &mut buf);
                        Sds::from_bytes(&buf[..n])
                    }
                };
                sds.append(more);
                // Safety: sole reference; EmbStr/Int payloads need no free
                unsafe {
                    self.0
                        .replace_payload(Encoding::Raw, Payload::from_box(Box::new(sds)));
                }
            }
            other => unreachable!("corrupt string encoding {:?}", other),
        }
        self.len()
    }

    /// A value with the same bytes, guaranteed to be in a string-form
    /// encoding: a cheap alias when already string-form, a freshly
    /// formatted value under `Int`. Never modifies `self`.
    #[must_use]
    pub fn decoded(&self) -> OString {
        match self.0.encoding() {
            Encoding::Int => {
                let mut buf = [0u8; 32];
                // Safety: Int payload is the integer itself
                let n = convert::fmt_i64(unsafe { self.0.payload_int() }, &mut buf);
                OString::new(&buf[..n])
            }
            _ => self.clone(),
        }
    }
}

impl OValue {
    /// Opportunistic space optimization for freshly parsed string values.
    ///
    /// Short decimal strings collapse to the `Int` form (or to the shared
    /// singleton when aliasing is permitted), embeddable `Raw` strings are
    /// rebuilt as `EmbStr`, and oversized `Raw` payloads are trimmed.
    /// Non-strings, already-integer values, and aliased values pass through
    /// unchanged.
    #[must_use]
    pub fn try_encode(self) -> OValue {
        if self.kind() != Kind::String
            || self.encoding() == Encoding::Int
            || self.refcount() != 1
        {
            return self;
        }

        let (len, parsed) = {
            let s = self.as_string().unwrap();
            let bytes = s.str_bytes().unwrap();
            let parsed = if bytes.len() <= INT_ENCODE_LIMIT {
                convert::parse_i64_canonical(bytes)
            } else {
                None
            };
            (bytes.len(), parsed)
        };

        if let Some(v) = parsed {
            if eviction::shared_integers_enabled() {
                if let Some(s) = shared::integer(v) {
                    log::trace!("re-encoded {}-byte string as shared integer", len);
                    drop(self);
                    return s.into();
                }
            }
            let mut this = self;
            // Safety: sole reference; the old Raw payload is freed here,
            // EmbStr bytes die with the header
            unsafe {
                if this.encoding() == Encoding::Raw {
                    drop(Box::from_raw(this.payload_raw() as *mut Sds));
                }
                this.replace_payload(Encoding::Int, Payload::from_int(v));
            }
            return this;
        }

        if len <= EMBSTR_LIMIT {
            if self.encoding() == Encoding::EmbStr {
                return self;
            }
            let emb = {
                let s = self.as_string().unwrap();
                OString::embedded(s.str_bytes().unwrap())
            };
            log::trace!("re-encoded {}-byte raw string as embstr", len);
            return emb.into();
        }

        if self.encoding() == Encoding::Raw {
            let mut this = self;
            // Safety: sole reference, checked above
            let sds = unsafe { this.payload_mut::<Sds>() };
            if sds.avail() > sds.len() / SHRINK_DENOMINATOR {
                sds.shrink_to_fit();
                log::trace!("trimmed raw string payload to {} bytes", len);
            }
            return this;
        }

        self
    }

    /// String-form view of this value (see [`OString::decoded`]). Non-string
    /// values are returned as a plain alias.
    #[must_use]
    pub fn decoded(&self) -> OValue {
        match self.as_string() {
            Some(s) => s.decoded().into(),
            None => self.clone(),
        }
    }
}

impl PartialEq for OString {
    fn eq(&self, other: &Self) -> bool {
        convert::equals(&self.0, &other.0)
    }
}

impl Eq for OString {}

impl Debug for OString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let decoded = self.decoded();
        let bytes = decoded.str_bytes().unwrap_or(b"");
        Debug::fmt(&String::from_utf8_lossy(bytes), f)
    }
}

impl From<&str> for OString {
    fn from(other: &str) -> Self {
        Self::new(other.as_bytes())
    }
}

impl From<&[u8]> for OString {
    fn from(other: &[u8]) -> Self {
        Self::new(other)
    }
}

impl From<i64> for OString {
    fn from(other: i64) -> Self {
        Self::from_i64(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SHARED_INT_LIMIT;

    #[mockalloc::test]
    fn embeds_up_to_the_limit() {
        let at_limit = [b'x'; EMBSTR_LIMIT];
        let v = OString::new(&at_limit);
        assert_eq!(v.0.encoding(), Encoding::EmbStr);
        assert_eq!(v.len(), EMBSTR_LIMIT);

        let over = [b'x'; EMBSTR_LIMIT + 1];
        let v = OString::new(&over);
        assert_eq!(v.0.encoding(), Encoding::Raw);
        assert_eq!(v.str_bytes(), Some(&over[..]));
    }

    #[mockalloc::test]
    fn hello_is_embedded() {
        let v = OString::new(b"hello");
        assert_eq!(v.0.encoding(), Encoding::EmbStr);
        assert_eq!(v.len(), 5);
        assert_eq!(v.str_bytes(), Some(&b"hello"[..]));
    }

    #[mockalloc::test]
    fn zeroed_matches_new_encoding_choice() {
        let v = OString::zeroed(10);
        assert_eq!(v.0.encoding(), Encoding::EmbStr);
        assert_eq!(v.str_bytes(), Some(&[0u8; 10][..]));
        let v = OString::zeroed(100);
        assert_eq!(v.0.encoding(), Encoding::Raw);
        assert_eq!(v.len(), 100);
    }

    #[test]
    fn small_integers_are_shared() {
        let _guard = eviction::policy_guard();
        let v = OString::from_i64(7);
        let w = OString::from_i64(7);
        assert!(v.0.ptr_eq(&w.0));
        assert!(v.0.is_shared());
        // Dropping a shared value is a no-op on its refcount.
        drop(w);
        assert!(v.0.is_shared());
        assert_eq!(v.to_i64(), Ok(7));
    }

    #[mockalloc::test]
    fn large_integers_are_not_shared() {
        let v = OString::from_i64(SHARED_INT_LIMIT);
        assert_eq!(v.0.encoding(), Encoding::Int);
        assert_eq!(v.0.refcount(), 1);
        let w = OString::from_i64(SHARED_INT_LIMIT);
        assert!(!v.0.ptr_eq(&w.0));
    }

    #[mockalloc::test]
    fn integers_round_trip_across_the_word_range() {
        for &v in &[i64::MIN, i64::MIN + 1, -1, i64::MAX - 1, i64::MAX] {
            let s = OString::from_i64(v);
            assert_eq!(s.0.encoding(), Encoding::Int);
            assert_eq!(s.to_i64(), Ok(v));
            assert_eq!(s.len(), convert::digits_i64(v));
            assert_eq!(
                s.decoded().str_bytes().map(<[u8]>::to_vec),
                Some(v.to_string().into_bytes())
            );
        }
    }

    #[mockalloc::test]
    fn dup_is_unshared_and_preserves_encoding() {
        let raw = OString::raw(b"0123456789");
        let d = raw.dup();
        assert_eq!(d.0.encoding(), Encoding::Raw);
        assert!(!d.0.ptr_eq(&raw.0));

        let emb = OString::new(b"short");
        assert_eq!(emb.dup().0.encoding(), Encoding::EmbStr);

        let int = OString::int_value(1234567);
        let d = int.dup();
        assert_eq!(d.0.encoding(), Encoding::Int);
        assert_eq!(d.0.refcount(), 1);
        assert_eq!(d.to_i64(), Ok(1234567));
    }

    #[test]
    fn try_encode_finds_shared_singletons() {
        let _guard = eviction::policy_guard();
        let v: OValue = OString::new(b"12345").into();
        assert_eq!(v.encoding(), Encoding::EmbStr);
        let v = v.try_encode();
        assert!(v.is_shared());
        assert_eq!(v.encoding(), Encoding::Int);
        let again = OString::from_i64(12345);
        assert!(v.ptr_eq(&again.0));
    }

    #[test]
    fn try_encode_converts_in_place_beyond_the_shared_range() {
        let _guard = eviction::policy_guard();
        let v: OValue = OString::raw(b"123456789").into();
        let v = v.try_encode();
        assert_eq!(v.encoding(), Encoding::Int);
        assert_eq!(v.refcount(), 1);
        assert_eq!(v.as_string().unwrap().to_i64(), Ok(123456789));
    }

    #[mockalloc::test]
    fn try_encode_leaves_long_strings_raw() {
        let long = [b'y'; EMBSTR_LIMIT + 1];
        let v: OValue = OString::new(&long).into();
        assert_eq!(v.encoding(), Encoding::Raw);
        let v = v.try_encode();
        assert_eq!(v.encoding(), Encoding::Raw);
        assert_eq!(v.as_string().unwrap().str_bytes(), Some(&long[..]));
    }

    #[mockalloc::test]
    fn try_encode_compacts_short_raw_strings() {
        let v: OValue = OString::raw(b"not a number").into();
        let v = v.try_encode();
        assert_eq!(v.encoding(), Encoding::EmbStr);
    }

    #[mockalloc::test]
    fn try_encode_skips_aliased_values() {
        let v: OValue = OString::raw(b"99").into();
        let alias = v.clone();
        let v = v.try_encode();
        assert_eq!(v.encoding(), Encoding::Raw);
        drop(alias);
    }

    #[mockalloc::test]
    fn try_encode_is_idempotent() {
        let _guard = eviction::policy_guard();
        for input in [
            &b"12345"[..],
            &b"123456789"[..],
            &b"plain"[..],
            &[b'z'; 60][..],
        ]
        .iter()
        {
            let once = OValue::from(OString::new(input)).try_encode();
            let encoding = once.encoding();
            let bytes_once = once.decoded();
            let twice = once.try_encode();
            assert_eq!(twice.encoding(), encoding);
            let a = bytes_once.as_string().unwrap();
            let b = twice.decoded();
            assert_eq!(a.str_bytes(), b.as_string().unwrap().str_bytes());
        }
    }

    #[mockalloc::test]
    fn leading_zeros_stay_strings() {
        let v: OValue = OString::new(b"007").into();
        let v = v.try_encode();
        assert_ne!(v.encoding(), Encoding::Int);
        assert_eq!(v.decoded().as_string().unwrap().str_bytes(), Some(&b"007"[..]));
    }

    #[mockalloc::test]
    fn decoded_view_materializes_integers() {
        let v = OString::int_value(-42);
        let d = v.decoded();
        assert_eq!(d.str_bytes(), Some(&b"-42"[..]));
        // The original is untouched.
        assert_eq!(v.0.encoding(), Encoding::Int);
    }

    #[mockalloc::test]
    fn append_forces_raw() {
        let mut v = OString::new(b"short");
        assert_eq!(v.0.encoding(), Encoding::EmbStr);
        let len = v.append(&[b'.'; 45]);
        assert_eq!(len, 50);
        assert_eq!(v.0.encoding(), Encoding::Raw);

        let mut n = OString::int_value(12);
        n.append(b"ab");
        assert_eq!(n.0.encoding(), Encoding::Raw);
        assert_eq!(n.str_bytes(), Some(&b"12ab"[..]));
    }

    #[mockalloc::test]
    fn double_formatting_round_trips() {
        for &x in &[0.5f64, -3.75, 1.0e100, 6.02e23, -0.0] {
            let v = OString::from_f64(x, false);
            let parsed = v.to_f64().unwrap();
            assert_eq!(parsed.to_bits(), x.to_bits());
        }
        let v = OString::from_f64(3.0, true);
        assert_eq!(v.str_bytes(), Some(&b"3"[..]));
    }
}
