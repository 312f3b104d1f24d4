//! Allocator instrumentation: used/peak byte counters, the startup
//! baseline, RSS-based fragmentation, and stubs for capabilities the
//! standard allocator does not offer.

use std::alloc::{GlobalAlloc, Layout};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

static USED: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);
static STARTUP: AtomicUsize = AtomicUsize::new(0);

/// A global-allocator wrapper that keeps the used/peak counters honest.
/// Hosts install it as their `#[global_allocator]`; without it the
/// counters simply read zero and the overhead report degrades gracefully.
pub struct CountingAlloc<A> {
    inner: A,
}

impl<A> CountingAlloc<A> {
    pub const fn new(inner: A) -> Self {
        CountingAlloc { inner }
    }
}

fn account_alloc(size: usize) {
    let used = USED.fetch_add(size, AtomicOrdering::Relaxed) + size;
    PEAK.fetch_max(used, AtomicOrdering::Relaxed);
}

fn account_dealloc(size: usize) {
    USED.fetch_sub(size, AtomicOrdering::Relaxed);
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAlloc<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            account_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout);
        account_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            account_dealloc(layout.size());
            account_alloc(new_size);
        }
        new_ptr
    }
}

/// Bytes currently accounted as live.
pub fn used_memory() -> usize {
    USED.load(AtomicOrdering::Relaxed)
}

/// High-water mark of `used_memory`.
pub fn peak_memory() -> usize {
    PEAK.load(AtomicOrdering::Relaxed)
}

/// Captures the current usage as the startup baseline; the overhead
/// report measures dataset growth net of this.
pub fn note_startup_baseline() {
    STARTUP.store(used_memory(), AtomicOrdering::Relaxed);
}

pub fn startup_memory() -> usize {
    STARTUP.load(AtomicOrdering::Relaxed)
}

/// Resident set size of the process, in bytes. Zero when unavailable.
pub fn process_rss() -> usize {
    let statm = match fs::read_to_string("/proc/self/statm") {
        Ok(s) => s,
        Err(_) => return 0,
    };
    let resident_pages: usize = match statm.split_whitespace().nth(1).and_then(|f| f.parse().ok()) {
        Some(p) => p,
        None => return 0,
    };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return 0;
    }
    resident_pages * page_size as usize
}

/// RSS over used bytes; 1.0 when either side is unknown.
pub fn fragmentation_ratio() -> f64 {
    let used = used_memory();
    let rss = process_rss();
    if used == 0 || rss == 0 {
        1.0
    } else {
        rss as f64 / used as f64
    }
}

/// Asks the allocator to hand dirty pages back to the kernel. The
/// standard allocator has no such hook, so this reports the capability
/// as absent.
pub fn purge() -> bool {
    false
}

/// The allocator's internal statistics dump, when it has one.
pub fn malloc_stats() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::System;

    #[test]
    fn counters_track_alloc_and_free() {
        let a = CountingAlloc::new(System);
        let layout = Layout::from_size_align(256, 8).unwrap();
        let before = used_memory();
        unsafe {
            let p = a.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(used_memory(), before + 256);
            assert!(peak_memory() >= before + 256);
            a.dealloc(p, layout);
        }
        assert_eq!(used_memory(), before);
    }

    #[test]
    fn capability_stubs() {
        assert!(!purge());
        assert!(malloc_stats().is_none());
        assert!(fragmentation_ratio() >= 0.0);
    }
}
