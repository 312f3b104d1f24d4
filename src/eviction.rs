//! Process-wide eviction policy state and the per-value recency/frequency
//! clocks.
//!
//! The flags here are read unlocked on every construction and lookup.
//! Switching policy at runtime is expected to be rare; live values keep
//! their metadata bits as-is and readers accept a transient window of
//! meaningless idle/frequency readings.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Initial value of the logarithmic frequency counter for new values.
pub const LFU_INIT: u8 = 5;

/// Width of the per-value eviction metadata field.
pub const EVICT_BITS: u32 = 24;
pub(crate) const EVICT_MASK: u32 = (1 << EVICT_BITS) - 1;

/// How per-value eviction metadata is interpreted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum EvictionMode {
    /// No eviction pressure; metadata carries the recency clock.
    None = 0,
    /// Recency-based eviction.
    Lru = 1,
    /// Frequency-based eviction.
    Lfu = 2,
}

static MODE: AtomicU8 = AtomicU8::new(EvictionMode::None as u8);
static LFU_DECAY_MINUTES: AtomicU32 = AtomicU32::new(1);
static LFU_LOG_FACTOR: AtomicU32 = AtomicU32::new(10);

pub fn mode() -> EvictionMode {
    match MODE.load(AtomicOrdering::Relaxed) {
        0 => EvictionMode::None,
        1 => EvictionMode::Lru,
        _ => EvictionMode::Lfu,
    }
}

pub fn set_mode(mode: EvictionMode) {
    log::info!("eviction mode set to {:?}", mode);
    MODE.store(mode as u8, AtomicOrdering::Relaxed);
}

/// Minutes of inactivity it takes to decay the frequency counter by one.
pub fn set_lfu_decay_minutes(minutes: u32) {
    LFU_DECAY_MINUTES.store(minutes.max(1), AtomicOrdering::Relaxed);
}

pub fn set_lfu_log_factor(factor: u32) {
    LFU_LOG_FACTOR.store(factor, AtomicOrdering::Relaxed);
}

/// Whether small-integer values may alias the shared singletons. Any
/// eviction policy needs per-value metadata, which aliasing would corrupt.
pub fn shared_integers_enabled() -> bool {
    mode() == EvictionMode::None
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Coarse recency clock: seconds, wrapping at the metadata width.
pub fn lru_clock() -> u32 {
    (unix_seconds() as u32) & EVICT_MASK
}

/// Minute-granularity timestamp stored in the high 16 bits under LFU.
pub(crate) fn lfu_minutes() -> u32 {
    ((unix_seconds() / 60) as u32) & 0xFFFF
}

/// Metadata stamp for a freshly constructed value under the current mode.
pub(crate) fn initial_meta() -> u32 {
    match mode() {
        EvictionMode::Lfu => (lfu_minutes() << 8) | u32::from(LFU_INIT),
        _ => lru_clock(),
    }
}

/// Seconds elapsed since `meta` was stamped, accounting for clock wrap.
pub(crate) fn idle_seconds(meta: u32) -> u64 {
    let clock = lru_clock();
    let stamped = meta & EVICT_MASK;
    if clock >= stamped {
        u64::from(clock - stamped)
    } else {
        u64::from(clock + (EVICT_MASK - stamped))
    }
}

/// Frequency counter decayed by the minutes elapsed since its timestamp.
pub(crate) fn lfu_decayed_counter(meta: u32) -> u8 {
    let counter = (meta & 0xFF) as u8;
    let stamped = (meta >> 8) & 0xFFFF;
    let now = lfu_minutes();
    let elapsed = if now >= stamped {
        now - stamped
    } else {
        now + (0x10000 - stamped)
    };
    let periods = elapsed / LFU_DECAY_MINUTES.load(AtomicOrdering::Relaxed).max(1);
    counter.saturating_sub(periods.min(255) as u8)
}

/// Logarithmic counter increment: the probability of a bump decays with
/// the counter's distance from its initial value.
pub(crate) fn lfu_incr_counter(counter: u8) -> u8 {
    if counter == u8::MAX {
        return counter;
    }
    let r: f64 = rand::random();
    let base = f64::from(counter.saturating_sub(LFU_INIT));
    let factor = f64::from(LFU_LOG_FACTOR.load(AtomicOrdering::Relaxed));
    let p = 1.0 / (base * factor + 1.0);
    if r < p {
        counter + 1
    } else {
        counter
    }
}

/// Metadata stamp after an access under LFU: decay, bump, restamp.
pub(crate) fn lfu_touched_meta(meta: u32) -> u32 {
    let counter = lfu_incr_counter(lfu_decayed_counter(meta));
    (lfu_minutes() << 8) | u32::from(counter)
}

/// Serializes tests that flip the process-wide mode against tests that
/// depend on it.
#[cfg(test)]
pub(crate) fn policy_guard() -> std::sync::MutexGuard<'static, ()> {
    lazy_static::lazy_static! {
        static ref LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    }
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
