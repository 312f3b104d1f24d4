//! Numeric/textual coercions and string-value comparison.
//!
//! The parsers here are deliberately strict: full-string consumption, no
//! leading whitespace, no partial numerics, and no non-finite results.
//! Callers depend on that strictness to guard against injection of
//! partial-numeric data.

use std::cmp::Ordering;
use std::ffi::CString;
use std::io::Write;

use crate::error::ValueError;
use crate::string::OString;
use crate::value::{Encoding, OValue};

/// Parses a canonical decimal integer: optional minus, no leading zeros,
/// no sign-only input, full consumption, overflow checked. Canonicality
/// guarantees that re-formatting the parsed value reproduces the input
/// bytes exactly, which the integer re-encoding relies on.
pub(crate) fn parse_i64_canonical(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return None;
    }
    if bytes == b"0" {
        return Some(0);
    }
    let (negative, digits) = if bytes[0] == b'-' {
        (true, &bytes[1..])
    } else {
        (false, bytes)
    };
    match digits.first().copied() {
        Some(b'1'..=b'9') => {}
        _ => return None,
    }
    let mut acc: u64 = 0;
    for &c in digits {
        if !c.is_ascii_digit() {
            return None;
        }
        acc = acc
            .checked_mul(10)?
            .checked_add(u64::from(c - b'0'))?;
    }
    if negative {
        const MIN_MAGNITUDE: u64 = i64::MAX as u64 + 1;
        if acc > MIN_MAGNITUDE {
            None
        } else if acc == MIN_MAGNITUDE {
            Some(i64::MIN)
        } else {
            Some(-(acc as i64))
        }
    } else if acc > i64::MAX as u64 {
        None
    } else {
        Some(acc as i64)
    }
}

/// Strict double parse: full consumption, finite result. A zero result
/// with nonzero digits in the input marks an underflow and is rejected.
pub(crate) fn parse_f64_strict(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let v: f64 = s.parse().ok()?;
    if !v.is_finite() {
        return None;
    }
    if v == 0.0 && s.bytes().any(|b| (b'1'..=b'9').contains(&b)) {
        return None;
    }
    Some(v)
}

/// Formats a double. The scientific form is the shortest representation
/// that reparses bit-for-bit; the human-friendly form is plain decimal
/// with trailing zeros trimmed, at the cost of precision guarantees.
pub(crate) fn format_double(v: f64, human_friendly: bool) -> String {
    if human_friendly {
        if v.is_infinite() {
            return if v > 0.0 { "inf" } else { "-inf" }.to_owned();
        }
        let mut s = format!("{:.17}", v);
        if s.contains('.') {
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
        }
        s
    } else {
        format!("{:e}", v)
    }
}

/// Writes the decimal form of `v` into `buf`, returning the length used.
pub(crate) fn fmt_i64(v: i64, buf: &mut [u8; 32]) -> usize {
    let mut cursor = std::io::Cursor::new(&mut buf[..]);
    write!(cursor, "{}", v).unwrap();
    cursor.position() as usize
}

/// Decimal digit count of `v`, sign included.
pub(crate) fn digits_i64(v: i64) -> usize {
    let mut buf = [0u8; 32];
    fmt_i64(v, &mut buf)
}

/// How [`compare`] orders string values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompareMode {
    /// Byte-wise order, length as tie-break.
    Binary,
    /// The host locale's collation order.
    Collate,
}

fn materialize<'a>(v: &'a OValue, buf: &'a mut [u8; 32]) -> &'a [u8] {
    let s = v.as_string().expect("compare requires string values");
    match s.str_bytes() {
        Some(bytes) => bytes,
        None => {
            // Safety: Int payload is the integer itself
            let n = fmt_i64(unsafe { v.payload_int() }, buf);
            &buf[..n]
        }
    }
}

fn collate(a: &[u8], b: &[u8]) -> Ordering {
    // Collation is a C-string primitive: bytes past an interior NUL do
    // not participate.
    fn to_c(bytes: &[u8]) -> CString {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        CString::new(&bytes[..end]).unwrap()
    }
    let ca = to_c(a);
    let cb = to_c(b);
    // Safety: both pointers are valid NUL-terminated strings
    let r = unsafe { libc::strcoll(ca.as_ptr(), cb.as_ptr()) };
    r.cmp(&0)
}

/// Orders two string values. Integer-encoded operands are materialized
/// into stack buffers; identity-equal operands short-circuit.
#[must_use]
pub fn compare(a: &OValue, b: &OValue, mode: CompareMode) -> Ordering {
    if a.ptr_eq(b) {
        return Ordering::Equal;
    }
    let mut abuf = [0u8; 32];
    let mut bbuf = [0u8; 32];
    let ab = materialize(a, &mut abuf);
    let bb = materialize(b, &mut bbuf);
    match mode {
        CompareMode::Binary => ab.cmp(bb),
        CompareMode::Collate => collate(ab, bb),
    }
}

/// String-value equality: payload comparison when both sides are integer
/// encoded, binary comparison otherwise.
#[must_use]
pub fn equals(a: &OValue, b: &OValue) -> bool {
    if a.encoding() == Encoding::Int && b.encoding() == Encoding::Int {
        // Safety: Int payload is the integer itself
        unsafe { a.payload_int() == b.payload_int() }
    } else {
        compare(a, b, CompareMode::Binary) == Ordering::Equal
    }
}

impl OString {
    /// The value as a signed integer, parsing the whole string strictly.
    pub fn to_i64(&self) -> Result<i64, ValueError> {
        match self.str_bytes() {
            // Safety: Int payload is the integer itself
            None => Ok(unsafe { self.0.payload_int() }),
            Some(bytes) => parse_i64_canonical(bytes).ok_or(ValueError::NotAnInteger),
        }
    }

    /// The value as a double, parsing the whole string strictly.
    pub fn to_f64(&self) -> Result<f64, ValueError> {
        match self.str_bytes() {
            // Safety: Int payload is the integer itself
            None => Ok(unsafe { self.0.payload_int() } as f64),
            Some(bytes) => parse_f64_strict(bytes).ok_or(ValueError::NotAFloat),
        }
    }

    /// Extended-precision extraction. Rust targets have no wider float, so
    /// this shares the double parser; it stays a distinct entry point
    /// because callers distinguish precision requirements.
    pub fn to_long_double(&self) -> Result<f64, ValueError> {
        self.to_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn canonical_integer_parse() {
        assert_eq!(parse_i64_canonical(b"0"), Some(0));
        assert_eq!(parse_i64_canonical(b"42"), Some(42));
        assert_eq!(parse_i64_canonical(b"-42"), Some(-42));
        assert_eq!(
            parse_i64_canonical(b"9223372036854775807"),
            Some(i64::MAX)
        );
        assert_eq!(
            parse_i64_canonical(b"-9223372036854775808"),
            Some(i64::MIN)
        );
        assert_eq!(parse_i64_canonical(b"9223372036854775808"), None);
        assert_eq!(parse_i64_canonical(b"-9223372036854775809"), None);
        assert_eq!(parse_i64_canonical(b""), None);
        assert_eq!(parse_i64_canonical(b"-"), None);
        assert_eq!(parse_i64_canonical(b"+42"), None);
        assert_eq!(parse_i64_canonical(b"042"), None);
        assert_eq!(parse_i64_canonical(b"-0"), None);
        assert_eq!(parse_i64_canonical(b" 42"), None);
        assert_eq!(parse_i64_canonical(b"42x"), None);
        assert_eq!(parse_i64_canonical(b"4 2"), None);
    }

    #[mockalloc::test]
    fn strict_extraction_scenarios() {
        let v = OString::new(b"   42");
        assert_eq!(v.to_i64(), Err(ValueError::NotAnInteger));
        let v = OString::new(b"42");
        assert_eq!(v.to_i64(), Ok(42));
        let v = OString::new(b"42x");
        assert_eq!(v.to_i64(), Err(ValueError::NotAnInteger));
    }

    #[test]
    fn double_parse_rejects_junk() {
        assert_eq!(parse_f64_strict(b"1.5"), Some(1.5));
        assert_eq!(parse_f64_strict(b"-1e10"), Some(-1e10));
        assert_eq!(parse_f64_strict(b""), None);
        assert_eq!(parse_f64_strict(b" 1.5"), None);
        assert_eq!(parse_f64_strict(b"1.5 "), None);
        assert_eq!(parse_f64_strict(b"1.5x"), None);
        assert_eq!(parse_f64_strict(b"nan"), None);
        assert_eq!(parse_f64_strict(b"inf"), None);
        assert_eq!(parse_f64_strict(b"-inf"), None);
        assert_eq!(parse_f64_strict(b"1e999"), None);
        assert_eq!(parse_f64_strict(b"1e-999"), None);
        assert_eq!(parse_f64_strict(b"0.000"), Some(0.0));
    }

    #[test]
    fn digit_counting() {
        assert_eq!(digits_i64(0), 1);
        assert_eq!(digits_i64(7), 1);
        assert_eq!(digits_i64(-7), 2);
        assert_eq!(digits_i64(10_000), 5);
        assert_eq!(digits_i64(i64::MIN), 20);
    }

    #[mockalloc::test]
    fn binary_compare_orders_bytes() {
        let a: OValue = OString::new(b"abc").into();
        let b: OValue = OString::new(b"abd").into();
        let prefix: OValue = OString::new(b"ab").into();
        assert_eq!(compare(&a, &b, CompareMode::Binary), Ordering::Less);
        assert_eq!(compare(&b, &a, CompareMode::Binary), Ordering::Greater);
        assert_eq!(compare(&prefix, &a, CompareMode::Binary), Ordering::Less);
        assert_eq!(compare(&a, &a, CompareMode::Binary), Ordering::Equal);
    }

    #[mockalloc::test]
    fn integers_materialize_for_compare() {
        let i = OString::int_value(123);
        let s: OValue = OString::new(b"123").into();
        assert_eq!(compare(i.as_ref(), &s, CompareMode::Binary), Ordering::Equal);
        assert!(equals(i.as_ref(), &s));
        let j = OString::int_value(124);
        assert_eq!(
            compare(i.as_ref(), j.as_ref(), CompareMode::Binary),
            Ordering::Less
        );
    }

    #[test]
    fn equality_agrees_with_binary_compare() {
        let mut rng = rand::thread_rng();
        let mut values = Vec::new();
        for _ in 0..64 {
            let n: u8 = rng.gen_range(0..8);
            let bytes: Vec<u8> = (0..n).map(|_| rng.gen_range(b'a'..=b'c')).collect();
            values.push(OValue::from(OString::new(&bytes)));
        }
        for a in &values {
            for b in &values {
                assert_eq!(
                    equals(a, b),
                    compare(a, b, CompareMode::Binary) == Ordering::Equal
                );
            }
        }
    }

    #[test]
    fn binary_compare_is_transitive() {
        let mut rng = rand::thread_rng();
        let mut values = Vec::new();
        for _ in 0..24 {
            let n: u8 = rng.gen_range(0..6);
            let bytes: Vec<u8> = (0..n).map(|_| rng.gen_range(0u8..4)).collect();
            values.push(OValue::from(OString::new(&bytes)));
        }
        values.sort_by(|a, b| compare(a, b, CompareMode::Binary));
        for w in values.windows(2) {
            assert_ne!(
                compare(&w[0], &w[1], CompareMode::Binary),
                Ordering::Greater
            );
        }
    }

    #[mockalloc::test]
    fn collation_smoke() {
        let a: OValue = OString::new(b"apple").into();
        let b: OValue = OString::new(b"banana").into();
        assert_eq!(compare(&a, &b, CompareMode::Collate), Ordering::Less);
        assert_eq!(compare(&a, &a, CompareMode::Collate), Ordering::Equal);
    }
}
