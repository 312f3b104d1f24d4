//! The two externally exposed introspection commands, dispatching by
//! case-insensitive subcommand name onto the reply writer.

use crate::alloc;
use crate::convert;
use crate::db::Database;
use crate::error::ValueError;
use crate::eviction::{self, EvictionMode};
use crate::mem::{collect_overhead, memory_doctor, size_of_value, ServerView, DEFAULT_SAMPLES};
use crate::reply::Reply;
use crate::value::{Kind, OValue};

/// Emits the shared wrong-type error when `v` is not of the expected kind.
/// Returns `true` when the error was emitted.
pub fn check_kind(v: &OValue, expected: Kind, reply: &mut dyn Reply) -> bool {
    if v.kind() != expected {
        reply.error(&ValueError::WrongType.to_string());
        true
    } else {
        false
    }
}

fn is_subcommand(arg: &[u8], name: &str) -> bool {
    arg.eq_ignore_ascii_case(name.as_bytes())
}

fn unknown_subcommand(command: &str, sub: &[u8], reply: &mut dyn Reply) {
    reply.error(&format!(
        "ERR Unknown subcommand or wrong number of arguments for '{}'. Try {} HELP.",
        String::from_utf8_lossy(sub),
        command
    ));
}

const OBJECT_HELP: &[&str] = &[
    "OBJECT <subcommand> <key>. Subcommands:",
    "ENCODING <key> -- Return the kind of internal representation used to store the value.",
    "FREQ <key> -- Return the access frequency index of the key; a logarithmic counter.",
    "IDLETIME <key> -- Return the idle time of the key, in seconds.",
    "REFCOUNT <key> -- Return the number of references of the value associated with the key.",
];

/// `OBJECT HELP|REFCOUNT|ENCODING|IDLETIME|FREQ`.
///
/// `args[0]` is the subcommand. A missing key replies null; an unknown
/// subcommand or wrong arity replies an error.
pub fn object_command(db: &Database, args: &[&[u8]], reply: &mut dyn Reply) {
    let sub = match args.first() {
        Some(sub) => *sub,
        None => {
            unknown_subcommand("OBJECT", b"", reply);
            return;
        }
    };

    if is_subcommand(sub, "help") {
        if args.len() == 1 {
            reply.array(OBJECT_HELP.len());
            for line in OBJECT_HELP {
                reply.simple(line);
            }
        } else {
            unknown_subcommand("OBJECT", sub, reply);
        }
        return;
    }

    if args.len() != 2 {
        unknown_subcommand("OBJECT", sub, reply);
        return;
    }
    // Introspection must not disturb the access clock it reports on.
    let value = match db.peek(args[1]) {
        Some(v) => v,
        None => {
            reply.null();
            return;
        }
    };

    if is_subcommand(sub, "refcount") {
        reply.integer(i64::from(value.refcount()));
    } else if is_subcommand(sub, "encoding") {
        reply.bulk(value.encoding_name().as_bytes());
    } else if is_subcommand(sub, "idletime") {
        if eviction::mode() == EvictionMode::Lfu {
            reply.error(
                "ERR An LFU eviction policy is selected, idle time is not tracked. \
                 Note that switching eviction policies at runtime leaves stale \
                 metadata on live values.",
            );
        } else {
            reply.integer(value.idle_seconds() as i64);
        }
    } else if is_subcommand(sub, "freq") {
        if eviction::mode() != EvictionMode::Lfu {
            reply.error("ERR An LFU eviction policy is not selected, access frequency is not tracked.");
        } else {
            reply.integer(i64::from(value.freq()));
        }
    } else {
        unknown_subcommand("OBJECT", sub, reply);
    }
}

const MEMORY_HELP: &[&str] = &[
    "MEMORY <subcommand> [<arg>]. Subcommands:",
    "DOCTOR -- Return a memory problems report.",
    "MALLOC-STATS -- Return the allocator's internal statistics report.",
    "PURGE -- Attempt to purge dirty pages for reclamation by the allocator.",
    "STATS -- Return information about the memory usage of the server.",
    "USAGE <key> [SAMPLES <count>] -- Return memory in bytes used by <key> and its value.",
];

fn memory_usage(db: &Database, args: &[&[u8]], reply: &mut dyn Reply) {
    let samples = match args {
        [_, _key] => DEFAULT_SAMPLES,
        [_, _key, opt, count] if is_subcommand(opt, "samples") => {
            match convert::parse_i64_canonical(count).filter(|&n| n >= 0) {
                Some(n) => n as usize,
                None => {
                    reply.error("ERR syntax error");
                    return;
                }
            }
        }
        _ => {
            reply.error("ERR syntax error");
            return;
        }
    };
    match db.peek(args[1]) {
        Some(v) => {
            let total = size_of_value(v, samples) + db.key_footprint(args[1]).unwrap_or(0);
            reply.integer(total as i64);
        }
        None => reply.null(),
    }
}

fn memory_stats(view: &ServerView, dbs: &[Database], reply: &mut dyn Reply) {
    let m = collect_overhead(view, dbs);
    let pairs = 14 + m.dbs.len();
    reply.array(pairs * 2);

    reply.bulk(b"peak.allocated");
    reply.integer(m.peak as i64);
    reply.bulk(b"total.allocated");
    reply.integer(m.used as i64);
    reply.bulk(b"startup.allocated");
    reply.integer(m.startup as i64);
    reply.bulk(b"replication.backlog");
    reply.integer(m.repl_backlog as i64);
    reply.bulk(b"clients.slaves");
    reply.integer(m.replica_buffers as i64);
    reply.bulk(b"clients.normal");
    reply.integer(m.client_buffers as i64);
    reply.bulk(b"aof.buffer");
    reply.integer(m.persistence_buffer as i64);

    for db in &m.dbs {
        reply.bulk(format!("db.{}", db.id).as_bytes());
        reply.array(4);
        reply.bulk(b"overhead.hashtable.main");
        reply.integer(db.hashtable_main as i64);
        reply.bulk(b"overhead.hashtable.expires");
        reply.integer(db.hashtable_expires as i64);
    }

    reply.bulk(b"overhead.total");
    reply.integer(m.overhead_total as i64);
    reply.bulk(b"keys.count");
    reply.integer(m.total_keys as i64);
    reply.bulk(b"keys.bytes-per-key");
    reply.integer(m.bytes_per_key as i64);
    reply.bulk(b"dataset.bytes");
    reply.integer(m.dataset as i64);
    reply.bulk(b"dataset.percentage");
    reply.bulk(format!("{:.2}", m.dataset_pct).as_bytes());
    reply.bulk(b"peak.percentage");
    reply.bulk(format!("{:.2}", m.peak_pct).as_bytes());
    reply.bulk(b"allocator.fragmentation");
    reply.bulk(format!("{:.2}", m.fragmentation).as_bytes());
}

/// `MEMORY USAGE|STATS|DOCTOR|PURGE|MALLOC-STATS|HELP`.
///
/// `args[0]` is the subcommand; `cur_db` selects the database USAGE
/// resolves keys against.
pub fn memory_command(
    dbs: &[Database],
    cur_db: usize,
    view: &ServerView,
    args: &[&[u8]],
    reply: &mut dyn Reply,
) {
    let sub = match args.first() {
        Some(sub) => *sub,
        None => {
            unknown_subcommand("MEMORY", b"", reply);
            return;
        }
    };

    if is_subcommand(sub, "usage") && args.len() >= 2 {
        memory_usage(&dbs[cur_db], args, reply);
    } else if is_subcommand(sub, "stats") && args.len() == 1 {
        memory_stats(view, dbs, reply);
    } else if is_subcommand(sub, "doctor") && args.len() == 1 {
        let report = memory_doctor(&collect_overhead(view, dbs));
        reply.bulk(report.as_bytes());
    } else if is_subcommand(sub, "purge") && args.len() == 1 {
        // Releasing dirty pages is allocator-dependent; absent the
        // capability the instruction is a no-op.
        alloc::purge();
        reply.simple("OK");
    } else if is_subcommand(sub, "malloc-stats") && args.len() == 1 {
        match alloc::malloc_stats() {
            Some(stats) => reply.bulk(stats.as_bytes()),
            None => reply.bulk(b"allocator statistics are not supported by the current allocator"),
        }
    } else if is_subcommand(sub, "help") && args.len() == 1 {
        reply.array(MEMORY_HELP.len());
        for line in MEMORY_HELP {
            reply.simple(line);
        }
    } else {
        unknown_subcommand("MEMORY", sub, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::{BufferedReply, ReplyItem};
    use crate::string::OString;
    use crate::value::SHARED_REFCOUNT;

    fn run_object(db: &Database, args: &[&str]) -> BufferedReply {
        let raw: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
        let mut reply = BufferedReply::new();
        object_command(db, &raw, &mut reply);
        reply
    }

    fn run_memory(dbs: &[Database], args: &[&str]) -> BufferedReply {
        let raw: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
        let mut reply = BufferedReply::new();
        memory_command(dbs, 0, &ServerView::default(), &raw, &mut reply);
        reply
    }

    #[test]
    fn encoding_follows_the_value_lifecycle() {
        let _guard = eviction::policy_guard();
        let mut db = Database::new(0);

        db.set(b"key", OValue::from(OString::new(b"short")).try_encode());
        let r = run_object(&db, &["encoding", "key"]);
        assert_eq!(r.items, vec![ReplyItem::Bulk(b"embstr".to_vec())]);

        {
            let v = db.get_mut(b"key").unwrap();
            let s = v.as_string_mut().unwrap();
            s.append(&[b'!'; 45]);
        }
        let r = run_object(&db, &["ENCODING", "key"]);
        assert_eq!(r.items, vec![ReplyItem::Bulk(b"raw".to_vec())]);

        db.set(b"key", OValue::from(OString::new(b"42")).try_encode());
        let r = run_object(&db, &["Encoding", "key"]);
        assert_eq!(r.items, vec![ReplyItem::Bulk(b"int".to_vec())]);
    }

    #[test]
    fn refcount_reports_shared_values() {
        let _guard = eviction::policy_guard();
        let mut db = Database::new(0);
        db.set(b"n", OString::from_i64(42).into());
        let r = run_object(&db, &["refcount", "n"]);
        assert_eq!(r.items, vec![ReplyItem::Integer(i64::from(SHARED_REFCOUNT))]);
    }

    #[mockalloc::test]
    fn missing_keys_reply_null() {
        let db = Database::new(0);
        let r = run_object(&db, &["refcount", "nope"]);
        assert_eq!(r.items, vec![ReplyItem::Null]);
        let r = run_object(&db, &["encoding", "nope"]);
        assert_eq!(r.items, vec![ReplyItem::Null]);
    }

    #[mockalloc::test]
    fn unknown_subcommand_and_arity_errors() {
        let mut db = Database::new(0);
        db.set(b"k", OString::new(b"v").into());
        let r = run_object(&db, &["wat", "k"]);
        assert!(r.single_error().unwrap().contains("Try OBJECT HELP"));
        let r = run_object(&db, &["refcount"]);
        assert!(r.single_error().unwrap().contains("Try OBJECT HELP"));
        let r = run_object(&db, &["refcount", "k", "extra"]);
        assert!(r.single_error().is_some());
    }

    #[test]
    fn idletime_and_freq_follow_the_policy() {
        let _guard = eviction::policy_guard();
        let mut db = Database::new(0);
        db.set(b"k", OString::new(b"v").into());

        let r = run_object(&db, &["idletime", "k"]);
        assert!(matches!(r.items.as_slice(), [ReplyItem::Integer(n)] if *n >= 0));
        let r = run_object(&db, &["freq", "k"]);
        assert!(r.single_error().unwrap().contains("not selected"));

        eviction::set_mode(EvictionMode::Lfu);
        let r = run_object(&db, &["idletime", "k"]);
        assert!(r.single_error().unwrap().contains("LFU"));
        // The value was created under the LRU-style clock; fabricate LFU
        // metadata as if it had been stamped cold ten minutes ago.
        let v = db.peek(b"k").unwrap();
        v.set_eviction_meta(((eviction::lfu_minutes().wrapping_sub(10) & 0xFFFF) << 8) | 5);
        let r = run_object(&db, &["freq", "k"]);
        assert_eq!(r.items, vec![ReplyItem::Integer(0)]);
        eviction::set_mode(EvictionMode::None);
    }

    #[test]
    fn object_help_lists_subcommands() {
        let db = Database::new(0);
        let r = run_object(&db, &["help"]);
        assert_eq!(r.items[0], ReplyItem::Array(OBJECT_HELP.len()));
        assert!(r.items.len() == OBJECT_HELP.len() + 1);
    }

    #[test]
    fn usage_counts_value_key_and_entry() {
        let _guard = eviction::policy_guard();
        let mut db = Database::new(0);
        db.set(b"k", OString::new(b"hello").into());
        let dbs = vec![db];

        let r = run_memory(&dbs, &["usage", "k"]);
        let bare = match r.items.as_slice() {
            [ReplyItem::Integer(n)] => *n,
            other => panic!("unexpected reply {:?}", other),
        };
        let expected = size_of_value(dbs[0].peek(b"k").unwrap(), DEFAULT_SAMPLES)
            + dbs[0].key_footprint(b"k").unwrap();
        assert_eq!(bare as usize, expected);

        let r = run_memory(&dbs, &["usage", "k", "SAMPLES", "0"]);
        assert!(matches!(r.items.as_slice(), [ReplyItem::Integer(_)]));
        let r = run_memory(&dbs, &["usage", "missing"]);
        assert_eq!(r.items, vec![ReplyItem::Null]);
        let r = run_memory(&dbs, &["usage", "k", "samples", "x"]);
        assert_eq!(r.single_error(), Some("ERR syntax error"));
    }

    #[test]
    fn stats_contains_db_entries() {
        let mut db = Database::new(0);
        db.set(b"k", OString::new(b"v").into());
        let dbs = vec![db];
        let r = run_memory(&dbs, &["stats"]);
        assert_eq!(r.items[0], ReplyItem::Array(15 * 2));
        assert!(r
            .items
            .contains(&ReplyItem::Bulk(b"total.allocated".to_vec())));
        assert!(r.items.contains(&ReplyItem::Bulk(b"db.0".to_vec())));
        assert!(r
            .items
            .contains(&ReplyItem::Bulk(b"overhead.hashtable.expires".to_vec())));
    }

    #[test]
    fn doctor_purge_and_malloc_stats() {
        let dbs = vec![Database::new(0)];
        let r = run_memory(&dbs, &["doctor"]);
        assert!(matches!(r.items.as_slice(), [ReplyItem::Bulk(_)]));
        let r = run_memory(&dbs, &["purge"]);
        assert_eq!(r.items, vec![ReplyItem::Simple("OK".to_owned())]);
        let r = run_memory(&dbs, &["malloc-stats"]);
        assert!(
            matches!(r.items.as_slice(), [ReplyItem::Bulk(b)] if b.starts_with(b"allocator statistics"))
        );
        let r = run_memory(&dbs, &["bogus"]);
        assert!(r.single_error().unwrap().contains("Try MEMORY HELP"));
    }

    #[mockalloc::test]
    fn wrong_kind_emits_the_shared_error() {
        let v: OValue = OString::new(b"s").into();
        let mut reply = BufferedReply::new();
        assert!(!check_kind(&v, Kind::String, &mut reply));
        assert!(reply.items.is_empty());
        assert!(check_kind(&v, Kind::List, &mut reply));
        assert!(reply.single_error().unwrap().starts_with("WRONGTYPE"));
    }
}
