//! Memory accounting: per-value size estimation and the instance-wide
//! overhead report with its rule-based diagnosis.

use std::mem;

use crate::alloc;
use crate::db::Database;
use crate::dict::Dict;
use crate::quicklist::QuickList;
use crate::sds::Sds;
use crate::value::{DestructuredRef, Encoding, Header, OValue};
use crate::ziplist::ZipList;
use crate::zset::ZSet;

/// Default element budget for sampled size estimation.
pub const DEFAULT_SAMPLES: usize = 5;

/// Bookkeeping bytes an embedded string carries beyond its bytes and the
/// header.
const EMBSTR_META_OVERHEAD: usize = 2;

fn averaged(sampled: usize, count: usize, total: usize) -> usize {
    if count == 0 {
        0
    } else {
        (sampled / count) * total
    }
}

fn dict_footprint<V>(
    dict: &Dict<V>,
    budget: usize,
    value_size: impl Fn(&V) -> usize,
) -> usize {
    let mut sampled = 0usize;
    let mut count = 0usize;
    for (key, value) in dict.iter().take(budget) {
        sampled += Dict::<V>::entry_overhead() + key.alloc_size() + value_size(value);
        count += 1;
    }
    mem::size_of::<Dict<V>>() + dict.table_bytes() + averaged(sampled, count, dict.len())
}

/// Estimates the bytes consumed by a value.
///
/// Exact for strings, integer sets, and ziplist-backed aggregates; sampled
/// (and therefore O(`samples`), not O(size)) for quicklists, hashtables,
/// and skiplist-backed sorted sets. `samples == 0` means "walk everything".
#[must_use]
pub fn size_of_value(v: &OValue, samples: usize) -> usize {
    let budget = if samples == 0 { usize::MAX } else { samples };
    let hdr = mem::size_of::<Header>();
    match v.destructure_ref() {
        DestructuredRef::String(s) => match v.encoding() {
            Encoding::Int => hdr,
            Encoding::Raw => hdr + s.sds().alloc_size(),
            Encoding::EmbStr => hdr + s.len() + EMBSTR_META_OVERHEAD,
            other => unreachable!("corrupt string encoding {:?}", other),
        },
        DestructuredRef::List(l) => match l.quicklist() {
            Some(ql) => {
                let mut sampled = 0usize;
                let mut count = 0usize;
                for node in ql.nodes().take(budget) {
                    sampled += mem::size_of::<ZipList>() + node.blob_len();
                    count += 1;
                }
                hdr + mem::size_of::<QuickList>() + averaged(sampled, count, ql.node_count())
            }
            None => hdr + l.ziplist().unwrap().blob_len(),
        },
        DestructuredRef::Set(s) => match s.dict() {
            Some(d) => hdr + dict_footprint(d, budget, |_| 0),
            None => hdr + s.intset_ref().unwrap().blob_len(),
        },
        DestructuredRef::Hash(h) => match h.dict() {
            Some(d) => hdr + dict_footprint(d, budget, Sds::alloc_size),
            None => hdr + h.ziplist().unwrap().blob_len(),
        },
        DestructuredRef::SortedSet(z) => match z.zset() {
            Some(zs) => {
                let mut sampled = 0usize;
                let mut count = 0usize;
                for (member, _) in zs.iter().take(budget) {
                    sampled += mem::size_of::<Sds>()
                        + member.len()
                        + Dict::<f64>::entry_overhead()
                        + ZSet::node_overhead();
                    count += 1;
                }
                hdr + mem::size_of::<ZSet>()
                    + zs.dict().table_bytes()
                    + averaged(sampled, count, zs.len())
            }
            None => hdr + z.ziplist().unwrap().blob_len(),
        },
        DestructuredRef::Module(m) => hdr + m.mem_usage(),
    }
}

/// Buffer accounting for one class of connected clients, reported by the
/// host.
#[derive(Debug, Default, Clone)]
pub struct ClientBuffers {
    pub count: usize,
    pub output_bytes: usize,
    pub query_bytes: usize,
}

impl ClientBuffers {
    #[must_use]
    pub fn total(&self) -> usize {
        self.output_bytes + self.query_bytes
    }
}

/// Host-reported figures the value layer cannot observe itself.
#[derive(Debug, Default, Clone)]
pub struct ServerView {
    pub repl_backlog_bytes: usize,
    pub replicas: ClientBuffers,
    pub clients: ClientBuffers,
    pub persistence_buffer_bytes: usize,
}

/// Per-database bookkeeping entry of the overhead report.
#[derive(Debug, Clone)]
pub struct DbOverhead {
    pub id: u32,
    pub hashtable_main: usize,
    pub hashtable_expires: usize,
    pub keys: usize,
}

/// The instance-wide overhead report.
#[derive(Debug, Clone, Default)]
pub struct MemoryOverhead {
    pub used: usize,
    pub startup: usize,
    pub peak: usize,
    pub fragmentation: f64,
    pub repl_backlog: usize,
    pub replica_count: usize,
    pub replica_buffers: usize,
    pub client_count: usize,
    pub client_buffers: usize,
    pub persistence_buffer: usize,
    pub dbs: Vec<DbOverhead>,
    pub overhead_total: usize,
    pub total_keys: usize,
    pub dataset: usize,
    pub dataset_pct: f64,
    pub bytes_per_key: usize,
    pub peak_pct: f64,
}

/// Collects the overhead report from the allocator counters, the host view,
/// and the per-database tables.
#[must_use]
pub fn collect_overhead(view: &ServerView, dbs: &[Database]) -> MemoryOverhead {
    let used = alloc::used_memory();
    let startup = alloc::startup_memory();
    let peak = alloc::peak_memory();

    let mut overhead = startup
        + view.repl_backlog_bytes
        + view.replicas.total()
        + view.clients.total()
        + view.persistence_buffer_bytes;
    let mut total_keys = 0usize;
    let mut db_entries = Vec::new();
    for db in dbs {
        if db.len() == 0 && db.expires_len() == 0 {
            continue;
        }
        let main = db.main_overhead_bytes();
        let expires = db.expires_overhead_bytes();
        overhead += main + expires;
        total_keys += db.len();
        db_entries.push(DbOverhead {
            id: db.id(),
            hashtable_main: main,
            hashtable_expires: expires,
            keys: db.len(),
        });
    }

    let dataset = used.saturating_sub(overhead);
    let net = used.saturating_sub(startup);
    MemoryOverhead {
        used,
        startup,
        peak,
        fragmentation: alloc::fragmentation_ratio(),
        repl_backlog: view.repl_backlog_bytes,
        replica_count: view.replicas.count,
        replica_buffers: view.replicas.total(),
        client_count: view.clients.count,
        client_buffers: view.clients.total(),
        persistence_buffer: view.persistence_buffer_bytes,
        dbs: db_entries,
        overhead_total: overhead,
        total_keys,
        dataset,
        dataset_pct: if net > 0 {
            dataset as f64 / net as f64 * 100.0
        } else {
            0.0
        },
        bytes_per_key: if total_keys > 0 { net / total_keys } else { 0 },
        peak_pct: if peak > 0 {
            used as f64 / peak as f64 * 100.0
        } else {
            0.0
        },
    }
}

const EMPTY_THRESHOLD: usize = 5 * 1024 * 1024;
const PEAK_RATIO_THRESHOLD: f64 = 1.5;
const FRAG_RATIO_THRESHOLD: f64 = 1.4;
const CLIENT_BUF_THRESHOLD: usize = 200 * 1024;
const REPLICA_BUF_THRESHOLD: usize = 10 * 1024 * 1024;

/// Turns an overhead report into a short rule-based diagnosis.
#[must_use]
pub fn memory_doctor(m: &MemoryOverhead) -> String {
    if m.used < EMPTY_THRESHOLD {
        return "This instance holds almost no data; memory issues cannot be diagnosed \
                until the dataset grows past a few megabytes."
            .to_owned();
    }

    let mut issues: Vec<String> = Vec::new();
    if m.used > 0 && m.peak as f64 / m.used as f64 > PEAK_RATIO_THRESHOLD {
        issues.push(
            "Peak memory usage is more than 150% of current usage. The allocator is \
             normally unable to return freed pages to the operating system, so the \
             resident size may stay near the peak."
                .to_owned(),
        );
    }
    if m.fragmentation > FRAG_RATIO_THRESHOLD {
        issues.push(format!(
            "The fragmentation ratio is {:.2}, over the 1.4 watermark. This can be \
             caused by workloads with values of widely varying sizes.",
            m.fragmentation
        ));
    }
    if m.client_count > 0 && m.client_buffers / m.client_count > CLIENT_BUF_THRESHOLD {
        issues.push(format!(
            "Connected clients average more than 200KB of buffered data each \
             ({} clients). Check for slow consumers or very large multi-bulk requests.",
            m.client_count
        ));
    }
    if m.replica_count > 0 && m.replica_buffers / m.replica_count > REPLICA_BUF_THRESHOLD {
        issues.push(format!(
            "Replica output buffers average more than 10MB each ({} replicas). \
             Replicas may be failing to keep up with the write rate.",
            m.replica_count
        ));
    }

    if issues.is_empty() {
        return "This instance reports no memory issues.".to_owned();
    }
    let mut report = String::from("Findings:\n");
    for issue in &issues {
        report.push_str(" * ");
        report.push_str(issue);
        report.push('\n');
    }
    log::debug!("memory doctor produced {} findings", issues.len());
    report
}
