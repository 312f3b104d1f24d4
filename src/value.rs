use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use crate::aggregate::{ModuleBlob, OHash, OList, OModule, OSet, OSortedSet};
use crate::dict::Dict;
use crate::eviction;
use crate::intset::IntSet;
use crate::quicklist::QuickList;
use crate::sds::Sds;
use crate::string::OString;
use crate::ziplist::ZipList;
use crate::zset::ZSet;

/// Refcount sentinel marking an immortal value: never incremented,
/// decremented, mutated, or freed.
pub const SHARED_REFCOUNT: u32 = u32::MAX;

/// The logical kind of a stored value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    String = 0,
    List,
    Set,
    Hash,
    SortedSet,
    Module,
}

/// The physical representation chosen for a value of a given kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    /// Independently allocated dynamic string.
    Raw = 0,
    /// Machine integer held directly in the payload slot.
    Int,
    /// String bytes sharing the header allocation.
    EmbStr,
    HashTable,
    QuickList,
    ZipList,
    IntSet,
    SkipList,
    /// Opaque module payload behind a type descriptor.
    ModuleBlob,
}

impl Encoding {
    /// The user-visible encoding name. These exact spellings are part of
    /// the wire contract.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Raw | Encoding::ModuleBlob => "raw",
            Encoding::Int => "int",
            Encoding::EmbStr => "embstr",
            Encoding::HashTable => "hashtable",
            Encoding::QuickList => "quicklist",
            Encoding::ZipList => "ziplist",
            Encoding::IntSet => "intset",
            Encoding::SkipList => "skiplist",
        }
    }
}

impl Kind {
    /// The closed table of legal (kind, encoding) pairs. Anything outside
    /// it is a bug, not bad input.
    #[must_use]
    pub fn allows(self, encoding: Encoding) -> bool {
        matches!(
            (self, encoding),
            (Kind::String, Encoding::Raw)
                | (Kind::String, Encoding::Int)
                | (Kind::String, Encoding::EmbStr)
                | (Kind::List, Encoding::QuickList)
                | (Kind::List, Encoding::ZipList)
                | (Kind::Set, Encoding::HashTable)
                | (Kind::Set, Encoding::IntSet)
                | (Kind::Hash, Encoding::HashTable)
                | (Kind::Hash, Encoding::ZipList)
                | (Kind::SortedSet, Encoding::SkipList)
                | (Kind::SortedSet, Encoding::ZipList)
                | (Kind::Module, Encoding::ModuleBlob)
        )
    }
}

/// Payload slot: interpretation is fixed by (kind, encoding).
#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) union Payload {
    pub int: i64,
    pub ptr: *mut u8,
    pub len: usize,
}

impl Payload {
    pub(crate) fn from_int(v: i64) -> Self {
        Payload { int: v }
    }
    pub(crate) fn from_box<T>(b: Box<T>) -> Self {
        Payload {
            ptr: Box::into_raw(b).cast(),
        }
    }
    pub(crate) fn from_len(len: usize) -> Self {
        Payload { len }
    }
}

#[repr(C)]
pub(crate) struct Header {
    kind: Kind,
    encoding: Encoding,
    // Trailing-byte capacity of this allocation. Kept even after an
    // in-place re-encode so deallocation always sees the original layout.
    emb_cap: u8,
    rc: AtomicU32,
    evict: AtomicU32,
    payload: Payload,
}

impl Header {
    fn layout(emb_cap: usize) -> Layout {
        Layout::new::<Header>()
            .extend(Layout::array::<u8>(emb_cap).unwrap())
            .unwrap()
            .0
            .pad_to_align()
    }

    pub(crate) fn bytes_ptr(&self) -> *const u8 {
        // Safety: pointers to the end of structs are allowed
        unsafe { (self as *const Header).add(1).cast() }
    }
}

/// A stored value: a pointer-sized handle onto a reference-counted header.
///
/// Every value a database stores passes through this wrapper. The header
/// records the logical [`Kind`], the physical [`Encoding`] currently chosen
/// for it, a refcount, and 24 bits of eviction metadata; the payload slot
/// holds a machine integer, an owned container, or the length of bytes
/// embedded directly behind the header.
///
/// `Clone` aliases the value (refcount increment) and `Drop` releases it,
/// freeing the payload when the last reference goes away. Values from the
/// shared registry carry [`SHARED_REFCOUNT`] and are exempt from both.
///
/// The concurrency contract is single-writer: all mutation happens on the
/// owning command thread, and a value handed to a background worker (via
/// [`OValue::into_raw`]) is only ever dropped there once it is unreachable
/// from the main thread.
#[repr(transparent)]
pub struct OValue {
    ptr: NonNull<Header>,
}

// Safety: refcounts and eviction bits are atomic; payloads are only
// mutated by the single writer that holds the last reference.
unsafe impl Send for OValue {}
unsafe impl Sync for OValue {}

impl OValue {
    pub(crate) fn from_parts(
        kind: Kind,
        encoding: Encoding,
        emb_cap: usize,
        payload: Payload,
    ) -> Self {
        debug_assert!(kind.allows(encoding));
        let layout = Header::layout(emb_cap);
        unsafe {
            let ptr = alloc(layout).cast::<Header>();
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            ptr.write(Header {
                kind,
                encoding,
                emb_cap: emb_cap as u8,
                rc: AtomicU32::new(1),
                evict: AtomicU32::new(eviction::initial_meta()),
                payload,
            });
            OValue {
                ptr: NonNull::new_unchecked(ptr),
            }
        }
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: the handle always points at a live header
        unsafe { self.ptr.as_ref() }
    }

    // Safety: caller must hold the only reference
    unsafe fn header_mut(&mut self) -> &mut Header {
        self.ptr.as_mut()
    }

    pub(crate) unsafe fn unchecked_cast_ref<T>(&self) -> &T {
        &*(self as *const Self).cast::<T>()
    }

    pub(crate) unsafe fn unchecked_cast_mut<T>(&mut self) -> &mut T {
        &mut *(self as *mut Self).cast::<T>()
    }

    /// The logical kind of this value.
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.header().kind
    }

    /// The physical encoding currently backing this value.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.header().encoding
    }

    /// The user-visible encoding name.
    #[must_use]
    pub fn encoding_name(&self) -> &'static str {
        self.encoding().name()
    }

    /// Current reference count; [`SHARED_REFCOUNT`] for immortal values.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.header().rc.load(AtomicOrdering::Relaxed)
    }

    /// Returns `true` for immortal registry values.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.refcount() == SHARED_REFCOUNT
    }

    /// Identity comparison: do both handles alias the same header?
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }

    pub(crate) fn promote_shared(&self) {
        self.header().rc.store(SHARED_REFCOUNT, AtomicOrdering::Relaxed);
    }

    /// Transfers ownership of this reference to a raw pointer, for hand-off
    /// to a background worker. Must be paired with [`OValue::from_raw`].
    #[must_use]
    pub fn into_raw(self) -> *mut () {
        let ptr = self.ptr.as_ptr();
        mem::forget(self);
        ptr.cast()
    }

    /// Reconstitutes a value from [`OValue::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` and must not be used again.
    pub unsafe fn from_raw(ptr: *mut ()) -> Self {
        OValue {
            ptr: NonNull::new_unchecked(ptr.cast()),
        }
    }

    /// Raw 24-bit eviction metadata (recency clock or frequency state,
    /// depending on the process-wide policy).
    #[must_use]
    pub fn eviction_meta(&self) -> u32 {
        self.header().evict.load(AtomicOrdering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_eviction_meta(&self, raw: u32) {
        self.header().evict.store(raw, AtomicOrdering::Relaxed);
    }

    /// Lookup hook: restamps the recency clock, or decays and bumps the
    /// frequency counter under LFU. Shared values are left untouched.
    pub fn touch(&self) {
        if self.is_shared() {
            return;
        }
        let h = self.header();
        let meta = match eviction::mode() {
            eviction::EvictionMode::Lfu => {
                eviction::lfu_touched_meta(h.evict.load(AtomicOrdering::Relaxed))
            }
            _ => eviction::lru_clock(),
        };
        h.evict.store(meta, AtomicOrdering::Relaxed);
    }

    /// Seconds since this value was last touched (recency-clock reading).
    #[must_use]
    pub fn idle_seconds(&self) -> u64 {
        eviction::idle_seconds(self.eviction_meta())
    }

    /// The logarithmic frequency counter, decayed by elapsed time so cold
    /// values report low even without an intervening access.
    #[must_use]
    pub fn freq(&self) -> u8 {
        eviction::lfu_decayed_counter(self.eviction_meta())
    }

    pub(crate) unsafe fn payload_int(&self) -> i64 {
        self.header().payload.int
    }

    pub(crate) unsafe fn payload_raw(&self) -> *mut u8 {
        self.header().payload.ptr
    }

    pub(crate) unsafe fn payload_ref<T>(&self) -> &T {
        &*(self.header().payload.ptr as *const T)
    }

    pub(crate) unsafe fn payload_mut<T>(&mut self) -> &mut T {
        assert_eq!(self.refcount(), 1, "cannot mutate an aliased value");
        &mut *(self.header().payload.ptr as *mut T)
    }

    // Safety: caller must hold the only reference and keep the (kind,
    // encoding) table satisfied, disposing of the old payload itself.
    pub(crate) unsafe fn replace_payload(&mut self, encoding: Encoding, payload: Payload) {
        debug_assert!(self.kind().allows(encoding));
        let h = self.header_mut();
        h.encoding = encoding;
        h.payload = payload;
    }

    /// Bytes embedded behind the header (EmbStr encoding only).
    pub(crate) fn emb_bytes(&self) -> &[u8] {
        debug_assert_eq!(self.encoding(), Encoding::EmbStr);
        let h = self.header();
        // Safety: EmbStr headers are allocated with `payload.len` trailing
        // bytes, immutable for the life of the header
        unsafe { std::slice::from_raw_parts(h.bytes_ptr(), h.payload.len) }
    }

    pub(crate) fn emb_bytes_mut_ptr(&mut self) -> *mut u8 {
        debug_assert_eq!(self.encoding(), Encoding::EmbStr);
        self.header().bytes_ptr() as *mut u8
    }

    /// Destructures a reference to this value into an enum which can be
    /// `match`ed on.
    #[must_use]
    pub fn destructure_ref(&self) -> DestructuredRef {
        // Safety: we check the kind
        unsafe {
            match self.kind() {
                Kind::String => DestructuredRef::String(self.unchecked_cast_ref()),
                Kind::List => DestructuredRef::List(self.unchecked_cast_ref()),
                Kind::Set => DestructuredRef::Set(self.unchecked_cast_ref()),
                Kind::Hash => DestructuredRef::Hash(self.unchecked_cast_ref()),
                Kind::SortedSet => DestructuredRef::SortedSet(self.unchecked_cast_ref()),
                Kind::Module => DestructuredRef::Module(self.unchecked_cast_ref()),
            }
        }
    }
}

value_kind!(OString = Kind::String; is_string, as_string, as_string_mut, into_string);
value_kind!(OList = Kind::List; is_list, as_list, as_list_mut, into_list);
value_kind!(OSet = Kind::Set; is_set, as_set, as_set_mut, into_set);
value_kind!(OHash = Kind::Hash; is_hash, as_hash, as_hash_mut, into_hash);
value_kind!(OSortedSet = Kind::SortedSet; is_sorted_set, as_sorted_set, as_sorted_set_mut, into_sorted_set);
value_kind!(OModule = Kind::Module; is_module, as_module, as_module_mut, into_module);

/// Enum returned by [`OValue::destructure_ref`] to allow matching on the
/// kind of a reference to a value.
#[derive(Debug, Copy, Clone)]
pub enum DestructuredRef<'a> {
    String(&'a OString),
    List(&'a OList),
    Set(&'a OSet),
    Hash(&'a OHash),
    SortedSet(&'a OSortedSet),
    Module(&'a OModule),
}

impl Clone for OValue {
    fn clone(&self) -> Self {
        let h = self.header();
        if h.rc.load(AtomicOrdering::Relaxed) != SHARED_REFCOUNT {
            h.rc.fetch_add(1, AtomicOrdering::Relaxed);
        }
        OValue { ptr: self.ptr }
    }
}

impl Drop for OValue {
    fn drop(&mut self) {
        let h = self.header();
        let rc = h.rc.load(AtomicOrdering::Relaxed);
        if rc == SHARED_REFCOUNT {
            return;
        }
        assert!(rc > 0, "value released with zero refcount");
        if h.rc.fetch_sub(1, AtomicOrdering::Relaxed) == 1 {
            // Safety: last reference gone; nobody can observe the header
            unsafe { free_value(self.ptr) }
        }
    }
}

// Safety: must only run once, on the last reference.
unsafe fn free_value(ptr: NonNull<Header>) {
    let h = ptr.as_ref();
    let payload = h.payload;
    match (h.kind, h.encoding) {
        (Kind::String, Encoding::Int) | (Kind::String, Encoding::EmbStr) => {}
        (Kind::String, Encoding::Raw) => drop(Box::from_raw(payload.ptr as *mut Sds)),
        (Kind::List, Encoding::QuickList) => drop(Box::from_raw(payload.ptr as *mut QuickList)),
        (Kind::List, Encoding::ZipList)
        | (Kind::Hash, Encoding::ZipList)
        | (Kind::SortedSet, Encoding::ZipList) => drop(Box::from_raw(payload.ptr as *mut ZipList)),
        (Kind::Set, Encoding::HashTable) => drop(Box::from_raw(payload.ptr as *mut Dict<()>)),
        (Kind::Set, Encoding::IntSet) => drop(Box::from_raw(payload.ptr as *mut IntSet)),
        (Kind::Hash, Encoding::HashTable) => drop(Box::from_raw(payload.ptr as *mut Dict<Sds>)),
        (Kind::SortedSet, Encoding::SkipList) => drop(Box::from_raw(payload.ptr as *mut ZSet)),
        (Kind::Module, Encoding::ModuleBlob) => drop(Box::from_raw(payload.ptr as *mut ModuleBlob)),
        (kind, encoding) => unreachable!("corrupt value: {:?} encoded as {:?}", kind, encoding),
    }
    dealloc(ptr.as_ptr().cast(), Header::layout(h.emb_cap as usize));
}

impl Debug for OValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OValue")
            .field("kind", &self.kind())
            .field("encoding", &self.encoding())
            .field("refcount", &self.refcount())
            .finish()
    }
}
