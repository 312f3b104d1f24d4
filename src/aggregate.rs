//! Aggregate values: lists, sets, hashes, sorted sets, and opaque module
//! values.
//!
//! Each aggregate starts in its compact encoding where one exists and is
//! promoted to the full encoding by the mutation paths below; the value
//! layer records the resulting encoding, the containers own the rest.

use dashmap::DashSet;
use lazy_static::lazy_static;
use std::fmt::{self, Debug, Formatter};

use crate::convert;
use crate::dict::Dict;
use crate::error::ValueError;
use crate::intset::IntSet;
use crate::quicklist::QuickList;
use crate::sds::Sds;
use crate::value::{Encoding, Kind, OValue, Payload};
use crate::ziplist::ZipList;
use crate::zset::ZSet;

/// Entry-count ceiling for compact (ziplist) hash and sorted-set encodings.
const ZIP_MAX_ENTRIES: usize = 128;
/// Entry-size ceiling for compact encodings, in bytes.
const ZIP_MAX_VALUE: usize = 64;
/// Cardinality ceiling for the integer-set encoding.
const INTSET_MAX_ENTRIES: usize = 512;

// ---------------------------------------------------------------------------
// Lists

/// A list-kind value, encoded as a quicklist or a compact ziplist.
#[repr(transparent)]
#[derive(Clone, Debug)]
pub struct OList(pub(crate) OValue);

impl OList {
    pub(crate) fn from_value(v: OValue) -> Self {
        debug_assert_eq!(v.kind(), Kind::List);
        OList(v)
    }

    /// A fresh list in the general-purpose quicklist encoding.
    #[must_use]
    pub fn new() -> Self {
        OList(OValue::from_parts(
            Kind::List,
            Encoding::QuickList,
            0,
            Payload::from_box(Box::new(QuickList::new())),
        ))
    }

    /// A fresh list in the compact encoding.
    #[must_use]
    pub fn zip() -> Self {
        OList(OValue::from_parts(
            Kind::List,
            Encoding::ZipList,
            0,
            Payload::from_box(Box::new(ZipList::new())),
        ))
    }

    pub(crate) fn quicklist(&self) -> Option<&QuickList> {
        match self.0.encoding() {
            // Safety: QuickList payload per the encoding table
            Encoding::QuickList => Some(unsafe { self.0.payload_ref::<QuickList>() }),
            _ => None,
        }
    }

    pub(crate) fn ziplist(&self) -> Option<&ZipList> {
        match self.0.encoding() {
            // Safety: ZipList payload per the encoding table
            Encoding::ZipList => Some(unsafe { self.0.payload_ref::<ZipList>() }),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.0.encoding() {
            Encoding::QuickList => self.quicklist().unwrap().len(),
            _ => self.ziplist().unwrap().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an entry, promoting a full compact list to the quicklist
    /// encoding first.
    pub fn push(&mut self, entry: &[u8]) {
        if self.0.encoding() == Encoding::ZipList
            && (self.ziplist().unwrap().len() >= ZIP_MAX_ENTRIES || entry.len() > ZIP_MAX_VALUE)
        {
            self.promote_to_quicklist();
        }
        match self.0.encoding() {
            // Safety: sole reference enforced by payload_mut
            Encoding::QuickList => unsafe { self.0.payload_mut::<QuickList>() }.push_tail(entry),
            _ => unsafe { self.0.payload_mut::<ZipList>() }.push(entry),
        }
    }

    fn promote_to_quicklist(&mut self) {
        assert_eq!(self.0.refcount(), 1, "cannot mutate an aliased value");
        let mut ql = QuickList::new();
        for entry in self.ziplist().unwrap().entries() {
            ql.push_tail(entry);
        }
        log::trace!("list promoted from ziplist to quicklist at {} entries", ql.len());
        // Safety: sole reference; the old ziplist box is freed here
        unsafe {
            drop(Box::from_raw(self.0.payload_raw() as *mut ZipList));
            self.0
                .replace_payload(Encoding::QuickList, Payload::from_box(Box::new(ql)));
        }
    }
}

impl Default for OList {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Sets

/// A set-kind value, encoded as a hashtable or a compact integer set.
#[repr(transparent)]
#[derive(Clone, Debug)]
pub struct OSet(pub(crate) OValue);

impl OSet {
    pub(crate) fn from_value(v: OValue) -> Self {
        debug_assert_eq!(v.kind(), Kind::Set);
        OSet(v)
    }

    /// A fresh set in the hashtable encoding.
    #[must_use]
    pub fn new() -> Self {
        OSet(OValue::from_parts(
            Kind::Set,
            Encoding::HashTable,
            0,
            Payload::from_box(Box::new(Dict::<()>::new())),
        ))
    }

    /// A fresh set in the integer-set encoding.
    #[must_use]
    pub fn intset() -> Self {
        OSet(OValue::from_parts(
            Kind::Set,
            Encoding::IntSet,
            0,
            Payload::from_box(Box::new(IntSet::new())),
        ))
    }

    /// The conventional creation path for a first member: integer members
    /// start compact, anything else starts as a hashtable.
    #[must_use]
    pub fn for_first_member(member: &[u8]) -> Self {
        let mut set = if convert::parse_i64_canonical(member).is_some() {
            Self::intset()
        } else {
            Self::new()
        };
        set.add(member);
        set
    }

    pub(crate) fn dict(&self) -> Option<&Dict<()>> {
        match self.0.encoding() {
            // Safety: Dict<()> payload per the encoding table
            Encoding::HashTable => Some(unsafe { self.0.payload_ref::<Dict<()>>() }),
            _ => None,
        }
    }

    pub(crate) fn intset_ref(&self) -> Option<&IntSet> {
        match self.0.encoding() {
            // Safety: IntSet payload per the encoding table
            Encoding::IntSet => Some(unsafe { self.0.payload_ref::<IntSet>() }),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.0.encoding() {
            Encoding::HashTable => self.dict().unwrap().len(),
            _ => self.intset_ref().unwrap().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, member: &[u8]) -> bool {
        match self.0.encoding() {
            Encoding::HashTable => self.dict().unwrap().contains_key(member),
            _ => match convert::parse_i64_canonical(member) {
                Some(v) => self.intset_ref().unwrap().contains(v),
                None => false,
            },
        }
    }

    /// Adds a member. An integer set is promoted to a hashtable when the
    /// member is not an integer or the cardinality ceiling is hit.
    pub fn add(&mut self, member: &[u8]) -> bool {
        if self.0.encoding() == Encoding::IntSet {
            if let Some(v) = convert::parse_i64_canonical(member) {
                if self.intset_ref().unwrap().len() < INTSET_MAX_ENTRIES
                    || self.intset_ref().unwrap().contains(v)
                {
                    // Safety: sole reference enforced by payload_mut
                    return unsafe { self.0.payload_mut::<IntSet>() }.add(v);
                }
            }
            self.promote_to_dict();
        }
        // Safety: sole reference enforced by payload_mut
        unsafe { self.0.payload_mut::<Dict<()>>() }
            .insert(Sds::from_bytes(member), ())
            .is_none()
    }

    fn promote_to_dict(&mut self) {
        assert_eq!(self.0.refcount(), 1, "cannot mutate an aliased value");
        let mut dict = Dict::new();
        for v in self.intset_ref().unwrap().iter() {
            let mut buf = [0u8; 32];
            let n = convert::fmt_i64(v, &mut buf);
            dict.insert(Sds::from_bytes(&buf[..n]), ());
        }
        log::trace!("set promoted from intset to hashtable at {} members", dict.len());
        // Safety: sole reference; the old intset box is freed here
        unsafe {
            drop(Box::from_raw(self.0.payload_raw() as *mut IntSet));
            self.0
                .replace_payload(Encoding::HashTable, Payload::from_box(Box::new(dict)));
        }
    }
}

impl Default for OSet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Hashes

/// A hash-kind value, compact while small.
#[repr(transparent)]
#[derive(Clone, Debug)]
pub struct OHash(pub(crate) OValue);

impl OHash {
    pub(crate) fn from_value(v: OValue) -> Self {
        debug_assert_eq!(v.kind(), Kind::Hash);
        OHash(v)
    }

    /// A fresh hash in the compact encoding.
    #[must_use]
    pub fn new() -> Self {
        OHash(OValue::from_parts(
            Kind::Hash,
            Encoding::ZipList,
            0,
            Payload::from_box(Box::new(ZipList::new())),
        ))
    }

    pub(crate) fn dict(&self) -> Option<&Dict<Sds>> {
        match self.0.encoding() {
            // Safety: Dict<Sds> payload per the encoding table
            Encoding::HashTable => Some(unsafe { self.0.payload_ref::<Dict<Sds>>() }),
            _ => None,
        }
    }

    pub(crate) fn ziplist(&self) -> Option<&ZipList> {
        match self.0.encoding() {
            // Safety: ZipList payload per the encoding table
            Encoding::ZipList => Some(unsafe { self.0.payload_ref::<ZipList>() }),
            _ => None,
        }
    }

    /// Number of field/value pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.0.encoding() {
            Encoding::HashTable => self.dict().unwrap().len(),
            _ => self.ziplist().unwrap().len() / 2,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, field: &[u8]) -> Option<&[u8]> {
        match self.0.encoding() {
            Encoding::HashTable => self.dict().unwrap().get(field).map(Sds::as_bytes),
            _ => {
                let zl = self.ziplist().unwrap();
                let mut entries = zl.entries();
                while let Some(f) = entries.next() {
                    let v = entries.next()?;
                    if f == field {
                        return Some(v);
                    }
                }
                None
            }
        }
    }

    /// Sets a field, promoting the compact encoding past the entry-count
    /// or entry-size ceilings. Returns `true` when the field was new.
    pub fn insert(&mut self, field: &[u8], value: &[u8]) -> bool {
        if self.0.encoding() == Encoding::ZipList {
            let oversized = field.len() > ZIP_MAX_VALUE || value.len() > ZIP_MAX_VALUE;
            let existing = self.get(field).is_some();
            if oversized || (!existing && self.len() >= ZIP_MAX_ENTRIES) {
                self.promote_to_dict();
            } else {
                let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = self.pairs_owned();
                let was_new = match pairs.iter_mut().find(|(f, _)| f.as_slice() == field) {
                    Some((_, v)) => {
                        *v = value.to_vec();
                        false
                    }
                    None => {
                        pairs.push((field.to_vec(), value.to_vec()));
                        true
                    }
                };
                let mut zl = ZipList::new();
                for (f, v) in &pairs {
                    zl.push(f);
                    zl.push(v);
                }
                // Safety: sole reference enforced by payload_mut
                *unsafe { self.0.payload_mut::<ZipList>() } = zl;
                return was_new;
            }
        }
        // Safety: sole reference enforced by payload_mut
        unsafe { self.0.payload_mut::<Dict<Sds>>() }
            .insert(Sds::from_bytes(field), Sds::from_bytes(value))
            .is_none()
    }

    fn pairs_owned(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let zl = self.ziplist().unwrap();
        let mut pairs = Vec::with_capacity(zl.len() / 2);
        let mut entries = zl.entries();
        while let Some(f) = entries.next() {
            if let Some(v) = entries.next() {
                pairs.push((f.to_vec(), v.to_vec()));
            }
        }
        pairs
    }

    fn promote_to_dict(&mut self) {
        assert_eq!(self.0.refcount(), 1, "cannot mutate an aliased value");
        let mut dict = Dict::new();
        for (f, v) in self.pairs_owned() {
            dict.insert(Sds::from_bytes(&f), Sds::from_bytes(&v));
        }
        log::trace!("hash promoted from ziplist to hashtable at {} fields", dict.len());
        // Safety: sole reference; the old ziplist box is freed here
        unsafe {
            drop(Box::from_raw(self.0.payload_raw() as *mut ZipList));
            self.0
                .replace_payload(Encoding::HashTable, Payload::from_box(Box::new(dict)));
        }
    }
}

impl Default for OHash {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Sorted sets

/// A sorted-set-kind value: member→score table plus score order.
#[repr(transparent)]
#[derive(Clone, Debug)]
pub struct OSortedSet(pub(crate) OValue);

impl OSortedSet {
    pub(crate) fn from_value(v: OValue) -> Self {
        debug_assert_eq!(v.kind(), Kind::SortedSet);
        OSortedSet(v)
    }

    /// A fresh sorted set in the general-purpose encoding.
    #[must_use]
    pub fn new() -> Self {
        OSortedSet(OValue::from_parts(
            Kind::SortedSet,
            Encoding::SkipList,
            0,
            Payload::from_box(Box::new(ZSet::new())),
        ))
    }

    /// A fresh sorted set in the compact encoding.
    #[must_use]
    pub fn zip() -> Self {
        OSortedSet(OValue::from_parts(
            Kind::SortedSet,
            Encoding::ZipList,
            0,
            Payload::from_box(Box::new(ZipList::new())),
        ))
    }

    pub(crate) fn zset(&self) -> Option<&ZSet> {
        match self.0.encoding() {
            // Safety: ZSet payload per the encoding table
            Encoding::SkipList => Some(unsafe { self.0.payload_ref::<ZSet>() }),
            _ => None,
        }
    }

    pub(crate) fn ziplist(&self) -> Option<&ZipList> {
        match self.0.encoding() {
            // Safety: ZipList payload per the encoding table
            Encoding::ZipList => Some(unsafe { self.0.payload_ref::<ZipList>() }),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.0.encoding() {
            Encoding::SkipList => self.zset().unwrap().len(),
            _ => self.ziplist().unwrap().len() / 2,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn score(&self, member: &[u8]) -> Option<f64> {
        match self.0.encoding() {
            Encoding::SkipList => self.zset().unwrap().score(member),
            _ => {
                let zl = self.ziplist().unwrap();
                let mut entries = zl.entries();
                while let Some(m) = entries.next() {
                    let s = entries.next()?;
                    if m == member {
                        return convert::parse_f64_strict(s);
                    }
                }
                None
            }
        }
    }

    /// Adds or updates a member, promoting the compact encoding past the
    /// ceilings. Returns `true` when the member was new.
    pub fn add(&mut self, member: &[u8], score: f64) -> bool {
        if self.0.encoding() == Encoding::ZipList {
            let existing = self.score(member).is_some();
            if member.len() > ZIP_MAX_VALUE || (!existing && self.len() >= ZIP_MAX_ENTRIES) {
                self.promote_to_zset();
            } else {
                let mut pairs = self.members_owned();
                let was_new = match pairs.iter_mut().find(|(m, _)| m.as_slice() == member) {
                    Some((_, s)) => {
                        *s = score;
                        false
                    }
                    None => {
                        pairs.push((member.to_vec(), score));
                        true
                    }
                };
                let mut zl = ZipList::new();
                for (m, s) in &pairs {
                    zl.push(m);
                    zl.push(convert::format_double(*s, false).as_bytes());
                }
                // Safety: sole reference enforced by payload_mut
                *unsafe { self.0.payload_mut::<ZipList>() } = zl;
                return was_new;
            }
        }
        // Safety: sole reference enforced by payload_mut
        unsafe { self.0.payload_mut::<ZSet>() }.insert(member, score)
    }

    fn members_owned(&self) -> Vec<(Vec<u8>, f64)> {
        let zl = self.ziplist().unwrap();
        let mut pairs = Vec::with_capacity(zl.len() / 2);
        let mut entries = zl.entries();
        while let Some(m) = entries.next() {
            if let Some(s) = entries.next() {
                if let Some(score) = convert::parse_f64_strict(s) {
                    pairs.push((m.to_vec(), score));
                }
            }
        }
        pairs
    }

    fn promote_to_zset(&mut self) {
        assert_eq!(self.0.refcount(), 1, "cannot mutate an aliased value");
        let mut zset = ZSet::new();
        for (m, s) in self.members_owned() {
            zset.insert(&m, s);
        }
        log::trace!("sorted set promoted from ziplist to skiplist at {} members", zset.len());
        // Safety: sole reference; the old ziplist box is freed here
        unsafe {
            drop(Box::from_raw(self.0.payload_raw() as *mut ZipList));
            self.0
                .replace_payload(Encoding::SkipList, Payload::from_box(Box::new(zset)));
        }
    }
}

impl Default for OSortedSet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Module values

/// Type descriptor for opaque module payloads: the vtable carries disposal
/// (`Drop`) and size estimation. `Send` because background workers may hold
/// the last reference.
pub trait ModuleData: Send {
    /// The registered name of this value's module type.
    fn type_name(&self) -> &'static str;

    /// Estimated bytes consumed by the payload; 0 when unsupported.
    fn mem_usage(&self) -> usize {
        0
    }
}

pub(crate) struct ModuleBlob {
    pub(crate) data: Box<dyn ModuleData>,
}

lazy_static! {
    static ref MODULE_TYPES: DashSet<&'static str> = DashSet::new();
}

/// Registers a module type name. Returns `false` if it was already
/// registered. The registry is resolved from background threads, hence
/// the concurrent set.
pub fn register_module_type(name: &'static str) -> bool {
    let inserted = MODULE_TYPES.insert(name);
    if inserted {
        log::debug!("module type {:?} registered", name);
    }
    inserted
}

/// Whether a module type name has been registered.
#[must_use]
pub fn module_type_registered(name: &str) -> bool {
    MODULE_TYPES.contains(name)
}

/// A module-kind value: an opaque payload behind a type descriptor.
#[repr(transparent)]
#[derive(Clone)]
pub struct OModule(pub(crate) OValue);

impl OModule {
    pub(crate) fn from_value(v: OValue) -> Self {
        debug_assert_eq!(v.kind(), Kind::Module);
        OModule(v)
    }

    /// Wraps an opaque payload whose type was registered beforehand.
    pub fn create(data: Box<dyn ModuleData>) -> Result<Self, ValueError> {
        if !module_type_registered(data.type_name()) {
            return Err(ValueError::UnknownModuleType);
        }
        Ok(OModule(OValue::from_parts(
            Kind::Module,
            Encoding::ModuleBlob,
            0,
            Payload::from_box(Box::new(ModuleBlob { data })),
        )))
    }

    pub(crate) fn blob(&self) -> &ModuleBlob {
        // Safety: ModuleBlob payload per the encoding table
        unsafe { self.0.payload_ref::<ModuleBlob>() }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.blob().data.type_name()
    }

    /// The payload's own memory estimate, via the type descriptor.
    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.blob().data.mem_usage()
    }
}

impl Debug for OModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OModule")
            .field("type", &self.type_name())
            .finish()
    }
}
