//! Stick tables: keyed counters tracked per stream.
//!
//! A table maps a typed key to a reference-counted entry carrying
//! counters and sliding-window rates. A stream that tracks an entry
//! holds it alive; an entry is only evicted once it is both expired
//! and unreferenced, or when a full table recycles its least-recently
//! used unreferenced entry to admit a new key.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

pub(crate) mod rate;

use self::rate::FreqCounter;

/// A stick-table key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StickKey {
    /// An IPv4 address.
    Ipv4(Ipv4Addr),
    /// An IPv6 address.
    Ipv6(Ipv6Addr),
    /// An integer sample.
    Integer(u64),
    /// A string sample.
    Str(String),
    /// An opaque binary sample.
    Binary(Vec<u8>),
}

impl From<std::net::IpAddr> for StickKey {
    fn from(ip: std::net::IpAddr) -> StickKey {
        match ip {
            std::net::IpAddr::V4(v4) => StickKey::Ipv4(v4),
            std::net::IpAddr::V6(v6) => StickKey::Ipv6(v6),
        }
    }
}

/// Tuning of one stick table.
#[derive(Clone, Debug)]
pub struct TableConfig {
    /// Table name, for logs.
    pub name: String,
    /// Maximum number of entries.
    pub size: usize,
    /// How long an untouched entry stays alive.
    pub expire: Duration,
    /// Window of the connection-rate counter.
    pub conn_rate_period: Duration,
    /// Window of the request-rate counter.
    pub http_req_rate_period: Duration,
    /// Window of the error-rate counter.
    pub http_err_rate_period: Duration,
}

impl TableConfig {
    /// A table with common defaults.
    pub fn new(name: impl Into<String>, size: usize) -> TableConfig {
        TableConfig {
            name: name.into(),
            size,
            expire: Duration::from_secs(600),
            conn_rate_period: Duration::from_secs(10),
            http_req_rate_period: Duration::from_secs(10),
            http_err_rate_period: Duration::from_secs(10),
        }
    }
}

/// One tracked entry.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) key: StickKey,
    expire: Mutex<Instant>,
    ref_cnt: AtomicUsize,
    pub(crate) conn_cur: AtomicU64,
    pub(crate) conn_cnt: AtomicU64,
    pub(crate) sess_cnt: AtomicU64,
    pub(crate) http_req_cnt: AtomicU64,
    pub(crate) http_err_cnt: AtomicU64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    conn_rate: Mutex<FreqCounter>,
    http_req_rate: Mutex<FreqCounter>,
    http_err_rate: Mutex<FreqCounter>,
}

impl Entry {
    fn new(key: StickKey, cfg: &TableConfig, now: Instant) -> Entry {
        Entry {
            key,
            expire: Mutex::new(now + cfg.expire),
            ref_cnt: AtomicUsize::new(0),
            conn_cur: AtomicU64::new(0),
            conn_cnt: AtomicU64::new(0),
            sess_cnt: AtomicU64::new(0),
            http_req_cnt: AtomicU64::new(0),
            http_err_cnt: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            conn_rate: Mutex::new(FreqCounter::new(cfg.conn_rate_period)),
            http_req_rate: Mutex::new(FreqCounter::new(cfg.http_req_rate_period)),
            http_err_rate: Mutex::new(FreqCounter::new(cfg.http_err_rate_period)),
        }
    }

    pub(crate) fn ref_cnt(&self) -> usize {
        self.ref_cnt.load(Ordering::Acquire)
    }

    fn is_expired(&self, now: Instant) -> bool {
        *self.expire.lock().unwrap() <= now
    }

    fn touch(&self, expire: Duration, now: Instant) {
        *self.expire.lock().unwrap() = now + expire;
    }

    pub(crate) fn conn_rate(&self) -> u64 {
        self.conn_rate.lock().unwrap().read(Instant::now())
    }

    pub(crate) fn http_req_rate(&self) -> u64 {
        self.http_req_rate.lock().unwrap().read(Instant::now())
    }

    pub(crate) fn http_err_rate(&self) -> u64 {
        self.http_err_rate.lock().unwrap().read(Instant::now())
    }

    pub(crate) fn note_http_req(&self) {
        self.http_req_cnt.fetch_add(1, Ordering::Relaxed);
        self.http_req_rate.lock().unwrap().add(1, Instant::now());
    }

    pub(crate) fn note_http_err(&self) {
        self.http_err_cnt.fetch_add(1, Ordering::Relaxed);
        self.http_err_rate.lock().unwrap().add(1, Instant::now());
    }

    pub(crate) fn add_bytes(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }
}

/// Which analyser stages apply updates through a tracked counter.
///
/// The original encoded these two bits inside the entry pointer; here
/// they are plain fields next to the reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TrackFlags {
    pub(crate) backend: bool,
    pub(crate) content: bool,
}

/// A stream's handle on one tracked entry. Dropping it is the `store`
/// half of the track/store contract.
#[derive(Debug)]
pub(crate) struct StkCtr {
    pub(crate) entry: Arc<Entry>,
    pub(crate) table: Arc<StickTable>,
    pub(crate) flags: TrackFlags,
}

impl Drop for StkCtr {
    fn drop(&mut self) {
        self.entry.conn_cur.fetch_sub(1, Ordering::AcqRel);
        let remaining = self.entry.ref_cnt.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.entry.is_expired(Instant::now()) {
            self.table.evict(&self.entry.key);
        }
    }
}

#[derive(Debug)]
pub(crate) struct StickTable {
    pub(crate) cfg: TableConfig,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<StickKey, Arc<Entry>>,
    /// Keys from least- to most-recently used.
    lru: VecDeque<StickKey>,
}

impl StickTable {
    pub(crate) fn new(cfg: TableConfig) -> Arc<StickTable> {
        Arc::new(StickTable {
            cfg,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Begin tracking `key`: bumps `conn_cur`, `conn_cnt` and the
    /// connection rate, and pins the entry through the returned
    /// handle. Returns `None` when the table is full of referenced
    /// entries.
    pub(crate) fn track(
        self: &Arc<Self>,
        key: StickKey,
        flags: TrackFlags,
    ) -> Option<StkCtr> {
        let now = Instant::now();
        let entry = self.get_or_create(key, now)?;
        entry.ref_cnt.fetch_add(1, Ordering::AcqRel);
        entry.conn_cur.fetch_add(1, Ordering::AcqRel);
        entry.conn_cnt.fetch_add(1, Ordering::Relaxed);
        entry.conn_rate.lock().unwrap().add(1, now);
        Some(StkCtr {
            entry,
            table: Arc::clone(self),
            flags,
        })
    }

    /// Look up without creating or pinning.
    pub(crate) fn lookup(&self, key: &StickKey) -> Option<Arc<Entry>> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).cloned()
    }

    fn get_or_create(&self, key: StickKey, now: Instant) -> Option<Arc<Entry>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get(&key) {
            let entry = Arc::clone(entry);
            entry.touch(self.cfg.expire, now);
            promote(&mut inner.lru, &key);
            return Some(entry);
        }

        if inner.entries.len() >= self.cfg.size && !evict_lru_unreferenced(&mut inner) {
            debug!("stick table {} full of referenced entries", self.cfg.name);
            return None;
        }

        let entry = Arc::new(Entry::new(key.clone(), &self.cfg, now));
        inner.entries.insert(key.clone(), Arc::clone(&entry));
        inner.lru.push_back(key);
        Some(entry)
    }

    fn evict(&self, key: &StickKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get(key) {
            // A racing track() may have re-pinned it.
            if entry.ref_cnt() > 0 {
                return;
            }
            inner.entries.remove(key);
            inner.lru.retain(|k| k != key);
        }
    }

    /// The periodic sweep: drop expired, unreferenced entries.
    pub(crate) fn expire_sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let dead: Vec<StickKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.ref_cnt() == 0 && e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            trace!("sweeping expired stick entry {:?}", key);
            inner.entries.remove(&key);
            inner.lru.retain(|k| k != &key);
        }
    }
}

fn promote(lru: &mut VecDeque<StickKey>, key: &StickKey) {
    if let Some(pos) = lru.iter().position(|k| k == key) {
        lru.remove(pos);
    }
    lru.push_back(key.clone());
}

/// Drop the least-recently-used entry nobody references. False when
/// every entry is pinned.
fn evict_lru_unreferenced(inner: &mut Inner) -> bool {
    let victim = inner
        .lru
        .iter()
        .position(|k| inner.entries.get(k).map(|e| e.ref_cnt() == 0).unwrap_or(true));
    match victim {
        Some(pos) => {
            if let Some(key) = inner.lru.remove(pos) {
                trace!("stick table recycling {:?}", key);
                inner.entries.remove(&key);
            }
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(size: usize) -> Arc<StickTable> {
        StickTable::new(TableConfig::new("t", size))
    }

    #[tokio::test(start_paused = true)]
    async fn track_and_store_balance_refcount() {
        let tbl = table(16);
        let key = StickKey::Integer(7);

        let ctr = tbl.track(key.clone(), TrackFlags::default()).unwrap();
        assert_eq!(ctr.entry.ref_cnt(), 1);
        assert_eq!(ctr.entry.conn_cur.load(Ordering::Acquire), 1);
        assert_eq!(ctr.entry.conn_cnt.load(Ordering::Relaxed), 1);

        let ctr2 = tbl.track(key.clone(), TrackFlags::default()).unwrap();
        assert_eq!(ctr2.entry.ref_cnt(), 2);
        assert_eq!(ctr2.entry.conn_cur.load(Ordering::Acquire), 2);

        drop(ctr);
        let entry = tbl.lookup(&key).unwrap();
        assert_eq!(entry.ref_cnt(), 1);
        assert_eq!(entry.conn_cur.load(Ordering::Acquire), 1);

        drop(ctr2);
        let entry = tbl.lookup(&key).unwrap();
        assert_eq!(entry.ref_cnt(), 0, "back to the pre-stream value");
        assert_eq!(entry.conn_cur.load(Ordering::Acquire), 0);
        // conn_cnt is cumulative and survives.
        assert_eq!(entry.conn_cnt.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_evicted_on_last_store() {
        let mut cfg = TableConfig::new("t", 16);
        cfg.expire = Duration::from_secs(1);
        let tbl = StickTable::new(cfg);
        let key = StickKey::Str("client".into());

        let ctr = tbl.track(key.clone(), TrackFlags::default()).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        // Expired but referenced: still present.
        assert!(tbl.lookup(&key).is_some());
        drop(ctr);
        assert!(tbl.lookup(&key).is_none(), "expired and unreferenced");
    }

    #[tokio::test(start_paused = true)]
    async fn full_table_recycles_lru_unreferenced() {
        let tbl = table(2);
        drop(tbl.track(StickKey::Integer(1), TrackFlags::default()).unwrap());
        drop(tbl.track(StickKey::Integer(2), TrackFlags::default()).unwrap());
        assert_eq!(tbl.len(), 2);

        // Touch key 1 so key 2 is the LRU.
        drop(tbl.track(StickKey::Integer(1), TrackFlags::default()).unwrap());

        let _ctr = tbl.track(StickKey::Integer(3), TrackFlags::default()).unwrap();
        assert_eq!(tbl.len(), 2);
        assert!(tbl.lookup(&StickKey::Integer(2)).is_none(), "LRU recycled");
        assert!(tbl.lookup(&StickKey::Integer(1)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn full_table_of_referenced_entries_rejects_insert() {
        let tbl = table(1);
        let _pin = tbl.track(StickKey::Integer(1), TrackFlags::default()).unwrap();
        assert!(
            tbl.track(StickKey::Integer(2), TrackFlags::default()).is_none(),
            "no unreferenced entry to recycle"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_takes_expired_unreferenced() {
        let mut cfg = TableConfig::new("t", 16);
        cfg.expire = Duration::from_secs(10);
        let tbl = StickTable::new(cfg);

        let pinned = tbl.track(StickKey::Integer(1), TrackFlags::default()).unwrap();
        drop(tbl.track(StickKey::Integer(2), TrackFlags::default()).unwrap());

        tokio::time::advance(Duration::from_secs(60)).await;
        tbl.expire_sweep();

        assert!(tbl.lookup(&StickKey::Integer(1)).is_some(), "pinned survives");
        assert!(tbl.lookup(&StickKey::Integer(2)).is_none());
        drop(pinned);
    }

    #[tokio::test(start_paused = true)]
    async fn http_rates_accumulate() {
        let tbl = table(4);
        let ctr = tbl.track(StickKey::Integer(9), TrackFlags::default()).unwrap();
        ctr.entry.note_http_req();
        ctr.entry.note_http_req();
        ctr.entry.note_http_err();
        assert_eq!(ctr.entry.http_req_cnt.load(Ordering::Relaxed), 2);
        assert_eq!(ctr.entry.http_err_cnt.load(Ordering::Relaxed), 1);
        assert_eq!(ctr.entry.http_req_rate(), 2);
        assert_eq!(ctr.entry.http_err_rate(), 1);
    }
}
