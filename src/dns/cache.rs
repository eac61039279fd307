//! Resolution cache.
//!
//! LRU keyed by `(qtype, qname)`. The requested FQDN of a server can
//! change at runtime, so a hit also re-checks the stored name bytes
//! before being trusted.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

use super::message::QueryType;

#[derive(Debug, Clone)]
pub(crate) struct CachedResolution {
    pub(crate) qname_dn: Vec<u8>,
    pub(crate) addresses: Vec<IpAddr>,
    pub(crate) last_resolution: Instant,
}

#[derive(Debug)]
pub(crate) struct DnsCache {
    cap: usize,
    map: HashMap<(u16, Vec<u8>), CachedResolution>,
    lru: VecDeque<(u16, Vec<u8>)>,
}

impl DnsCache {
    pub(crate) fn new(cap: usize) -> DnsCache {
        DnsCache {
            cap: std::cmp::max(cap, 1),
            map: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    pub(crate) fn get(
        &mut self,
        qtype: QueryType,
        qname_dn: &[u8],
        max_age: Duration,
        now: Instant,
    ) -> Option<CachedResolution> {
        let key = (qtype.to_u16(), qname_dn.to_vec());
        let hit = self.map.get(&key)?;
        if hit.qname_dn != qname_dn {
            // The slot was reused for another name; ignore it.
            return None;
        }
        if now.saturating_duration_since(hit.last_resolution) > max_age {
            trace!("dns cache entry for {:?} too old", qtype);
            return None;
        }
        let hit = hit.clone();
        self.promote(&key);
        Some(hit)
    }

    pub(crate) fn put(
        &mut self,
        qtype: QueryType,
        qname_dn: Vec<u8>,
        addresses: Vec<IpAddr>,
        now: Instant,
    ) {
        let key = (qtype.to_u16(), qname_dn.clone());
        if self.map.len() >= self.cap && !self.map.contains_key(&key) {
            if let Some(victim) = self.lru.pop_front() {
                self.map.remove(&victim);
            }
        }
        self.map.insert(
            key.clone(),
            CachedResolution {
                qname_dn,
                addresses,
                last_resolution: now,
            },
        );
        self.promote(&key);
    }

    fn promote(&mut self, key: &(u16, Vec<u8>)) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.clone());
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
