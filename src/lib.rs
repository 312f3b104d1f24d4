//! A memory-efficient polymorphic value layer for in-memory key-value
//! stores.
//!
//! Every stored value passes through [`OValue`]: a pointer-sized handle
//! onto a reference-counted header that records the logical [`Kind`]
//! (string, list, set, hash, sorted set, opaque module value), the
//! physical [`Encoding`] currently chosen for it, and 24 bits of eviction
//! metadata. Values pick among multiple encodings to minimize memory:
//! short strings embed their bytes in the header allocation, small
//! integers collapse to a tagged machine word (or alias the immortal
//! [`shared`] singletons outright), and aggregates start in compact
//! representations that are promoted as they grow.
//!
//! The adaptive rules live in [`OValue::try_encode`]; per-value and
//! instance-wide memory accounting live in [`size_of_value`] and
//! [`collect_overhead`]; the `OBJECT` and `MEMORY` wire commands are
//! exposed through [`object_command`] and [`memory_command`].
//!
//! The layer runs single-writer: all construction, re-encoding, and
//! release happen on the owning command thread, with the shared registry
//! as the one freely aliasable exception.

#[cfg(test)]
mod test_alloc {
    use mockalloc::Mockalloc;
    use std::alloc::System;

    #[global_allocator]
    static ALLOCATOR: Mockalloc<System> = Mockalloc(System);
}

#[macro_use]
mod macros;

mod aggregate;
pub mod alloc;
mod command;
mod convert;
mod db;
mod dict;
mod error;
pub mod eviction;
mod intset;
mod mem;
mod quicklist;
mod reply;
mod sds;
pub mod shared;
mod string;
mod value;
mod ziplist;
mod zset;

pub use aggregate::{
    module_type_registered, register_module_type, ModuleData, OHash, OList, OModule, OSet,
    OSortedSet,
};
pub use command::{check_kind, memory_command, object_command};
pub use convert::{compare, equals, CompareMode};
pub use db::Database;
pub use error::ValueError;
pub use eviction::{EvictionMode, LFU_INIT};
pub use mem::{
    collect_overhead, memory_doctor, size_of_value, ClientBuffers, DbOverhead, MemoryOverhead,
    ServerView, DEFAULT_SAMPLES,
};
pub use reply::{BufferedReply, Reply, ReplyItem};
pub use shared::SHARED_INT_LIMIT;
pub use string::{OString, EMBSTR_LIMIT};
pub use value::{DestructuredRef, Encoding, Kind, OValue, SHARED_REFCOUNT};
