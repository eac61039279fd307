//! The DNS resolver client.
//!
//! Pipelined UDP queries against a set of nameservers, with retries,
//! CNAME chasing, A/AAAA family fallback, candidate scoring, and an
//! LRU cache. Server address refresh is the one consumer: a hostname
//! goes in, the best-scoring address comes out.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::error::Dns as DnsError;

pub(crate) mod cache;
pub(crate) mod message;

use self::cache::DnsCache;
use self::message::{
    build_query, encode_domain_name, parse_response, QueryType, RData, Rcode, Response,
    MAX_MESSAGE_SIZE,
};

/// Address family preference for resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    /// Prefer IPv4 answers.
    V4,
    /// Prefer IPv6 answers.
    V6,
}

impl Family {
    fn query_type(self) -> QueryType {
        match self {
            Family::V4 => QueryType::A,
            Family::V6 => QueryType::Aaaa,
        }
    }

    fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
        }
    }
}

/// Tuning of one resolvers section.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Nameservers queried in parallel.
    pub nameservers: Vec<SocketAddr>,
    /// Send attempts per query before giving up.
    pub retries: u32,
    /// Wait per attempt before resending.
    pub timeout: Duration,
    /// Attempts with the preferred family before switching to the
    /// other one.
    pub fallback_tries: u32,
    /// How long a valid cached resolution may be served.
    pub hold_valid: Duration,
    /// Preferred address family.
    pub prefer: Family,
    /// Networks that add weight to a candidate (address, prefix len).
    pub preferred_networks: Vec<(IpAddr, u8)>,
    /// Capacity of the resolution cache.
    pub cache_size: usize,
}

impl ResolverConfig {
    /// A resolvers section with common defaults.
    pub fn new(nameservers: Vec<SocketAddr>) -> ResolverConfig {
        ResolverConfig {
            nameservers,
            retries: 3,
            timeout: Duration::from_secs(1),
            fallback_tries: 1,
            hold_valid: Duration::from_secs(10),
            prefer: Family::V4,
            preferred_networks: Vec::new(),
            cache_size: 1024,
        }
    }
}

/// Per-call inputs to candidate scoring.
#[derive(Debug, Default)]
pub(crate) struct ResolveContext {
    /// Addresses already bound to other servers of the same backend.
    pub(crate) already_bound: Vec<IpAddr>,
    /// The server's current address, for stability preference.
    pub(crate) current: Option<IpAddr>,
    /// Caller's acceptable cache age; the effective hold is the
    /// smaller of this and the section's `hold_valid`.
    pub(crate) valid_period: Option<Duration>,
}

#[derive(Debug, Default)]
pub(crate) struct ResolverCounters {
    pub(crate) sent: AtomicU64,
    pub(crate) valid: AtomicU64,
    pub(crate) nx: AtomicU64,
    pub(crate) refused: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) truncated: AtomicU64,
    pub(crate) invalid: AtomicU64,
    pub(crate) outdated: AtomicU64,
    pub(crate) any_err: AtomicU64,
    pub(crate) cname_err: AtomicU64,
}

/// A resolvers section: the client side of a set of nameservers.
pub struct Resolver {
    cfg: ResolverConfig,
    socket: UdpSocket,
    seed: Mutex<XorShift64>,
    /// Query ids currently in flight; late answers with unknown ids
    /// are counted as outdated and dropped.
    in_flight: Mutex<HashMap<u16, Vec<u8>>>,
    cache: Mutex<DnsCache>,
    /// Serializes resolutions on the shared socket.
    gate: tokio::sync::Mutex<()>,
    pub(crate) counters: ResolverCounters,
}

impl Resolver {
    /// Open the shared UDP socket and set up the section.
    pub async fn new(cfg: ResolverConfig) -> crate::Result<Resolver> {
        let bind: SocketAddr = if cfg.nameservers.iter().any(|ns| ns.is_ipv6()) {
            "[::]:0".parse().expect("literal addr")
        } else {
            "0.0.0.0:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind).await.map_err(crate::Error::new_io)?;
        let cache_size = cfg.cache_size;
        Ok(Resolver {
            cfg,
            socket,
            seed: Mutex::new(XorShift64::from_clock()),
            in_flight: Mutex::new(HashMap::new()),
            cache: Mutex::new(DnsCache::new(cache_size)),
            gate: tokio::sync::Mutex::new(()),
            counters: ResolverCounters::default(),
        })
    }

    /// Resolve `hostname` with no scoring context.
    pub async fn lookup(&self, hostname: &str) -> crate::Result<IpAddr> {
        self.resolve(hostname, &ResolveContext::default()).await
    }

    /// Resolve `hostname` to the best-scoring address.
    pub(crate) async fn resolve(
        &self,
        hostname: &str,
        ctx: &ResolveContext,
    ) -> crate::Result<IpAddr> {
        let qname = encode_domain_name(hostname)
            .map_err(|e| crate::Error::new_dns(DnsError::Invalid).with(e))?;

        let hold = match ctx.valid_period {
            Some(valid) => std::cmp::min(valid, self.cfg.hold_valid),
            None => self.cfg.hold_valid,
        };
        let mut qtype = self.cfg.prefer.query_type();
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap()
            .get(qtype, &qname, hold, Instant::now())
        {
            if let Some(best) = self.select_best(&hit.addresses, ctx) {
                trace!("dns cache hit for {}", hostname);
                return Ok(best);
            }
        }

        let _serialized = self.gate.lock().await;

        let mut tries = self.cfg.retries.max(1);
        let mut family_tries = self.cfg.fallback_tries.max(1);
        let mut saw_cname_dead_end = false;

        loop {
            if tries == 0 {
                return Err(if saw_cname_dead_end {
                    crate::Error::new_dns(DnsError::Cname)
                } else {
                    crate::Error::new_dns(DnsError::NoAnswer)
                });
            }
            tries -= 1;

            match self.query_once(&qname, qtype).await? {
                QueryOutcome::Addresses(addrs) => {
                    self.counters.valid.fetch_add(1, Ordering::Relaxed);
                    self.cache.lock().unwrap().put(
                        qtype,
                        qname.clone(),
                        addrs.clone(),
                        Instant::now(),
                    );
                    if let Some(best) = self.select_best(&addrs, ctx) {
                        return Ok(best);
                    }
                    return Err(crate::Error::new_dns(DnsError::NoAnswer));
                }
                QueryOutcome::NoAnswer => {
                    // An empty success for this family: try the other
                    // one once the preferred-family budget is spent.
                    self.counters.any_err.fetch_add(1, Ordering::Relaxed);
                    family_tries = family_tries.saturating_sub(1);
                    if family_tries == 0 {
                        debug!("dns {}: no {:?} records, trying other family", hostname, qtype);
                        qtype = qtype.other_family();
                        family_tries = self.cfg.fallback_tries.max(1);
                    }
                }
                QueryOutcome::CnameDeadEnd => {
                    self.counters.cname_err.fetch_add(1, Ordering::Relaxed);
                    saw_cname_dead_end = true;
                    family_tries = family_tries.saturating_sub(1);
                    if family_tries == 0 {
                        qtype = qtype.other_family();
                        family_tries = self.cfg.fallback_tries.max(1);
                    }
                }
                QueryOutcome::NxDomain => {
                    self.counters.nx.fetch_add(1, Ordering::Relaxed);
                    return Err(crate::Error::new_dns(DnsError::NxDomain));
                }
                QueryOutcome::Refused => {
                    self.counters.refused.fetch_add(1, Ordering::Relaxed);
                    return Err(crate::Error::new_dns(DnsError::Refused));
                }
                QueryOutcome::Truncated => {
                    self.counters.truncated.fetch_add(1, Ordering::Relaxed);
                    return Err(crate::Error::new_dns(DnsError::Truncated));
                }
                QueryOutcome::Timeout => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    trace!("dns {}: attempt timed out, {} tries left", hostname, tries);
                }
                QueryOutcome::ServerError => {
                    self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// One round: send to every nameserver, collect the first
    /// conclusive answer before the retry tick.
    async fn query_once(
        &self,
        qname: &[u8],
        qtype: QueryType,
    ) -> crate::Result<QueryOutcome> {
        let id = self.register_query(qname);
        let query = build_query(id, qname, qtype);
        for ns in &self.cfg.nameservers {
            if let Err(e) = self.socket.send_to(&query, ns).await {
                warn!("dns send to {} failed: {}", ns, e);
            } else {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
        }

        let deadline = Instant::now() + self.cfg.timeout;
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let outcome = loop {
            let recv = timeout_at(deadline, self.socket.recv_from(&mut buf)).await;
            let (len, _from) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    self.unregister_query(id);
                    return Err(crate::Error::new_io(e));
                }
                Err(_elapsed) => break QueryOutcome::Timeout,
            };
            let resp = match parse_response(&buf[..len]) {
                Ok(resp) => resp,
                Err(e) => {
                    debug!("dns response unparseable: {}", e);
                    self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if !self.is_known_query(resp.id) {
                self.counters.outdated.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if resp.id != id {
                // A still-registered id from an earlier round; not ours.
                self.counters.outdated.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            break classify_response(&resp, qname, qtype);
        };
        self.unregister_query(id);
        Ok(outcome)
    }

    fn register_query(&self, qname: &[u8]) -> u16 {
        let mut in_flight = self.in_flight.lock().unwrap();
        let mut seed = self.seed.lock().unwrap();
        loop {
            let id = seed.next_u16();
            if !in_flight.contains_key(&id) {
                in_flight.insert(id, qname.to_vec());
                return id;
            }
        }
    }

    fn unregister_query(&self, id: u16) {
        self.in_flight.lock().unwrap().remove(&id);
    }

    fn is_known_query(&self, id: u16) -> bool {
        self.in_flight.lock().unwrap().contains_key(&id)
    }

    fn select_best(&self, candidates: &[IpAddr], ctx: &ResolveContext) -> Option<IpAddr> {
        let mut best: Option<(u8, IpAddr)> = None;
        for &ip in candidates {
            let score = score_candidate(
                ip,
                self.cfg.prefer,
                &self.cfg.preferred_networks,
                &ctx.already_bound,
                ctx.current,
            );
            if score == 15 {
                // Nothing can beat a full house.
                return Some(ip);
            }
            match best {
                Some((bs, _)) if bs >= score => {}
                _ => best = Some((score, ip)),
            }
        }
        best.map(|(_, ip)| ip)
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("nameservers", &self.cfg.nameservers)
            .finish()
    }
}

#[derive(Debug, PartialEq)]
enum QueryOutcome {
    Addresses(Vec<IpAddr>),
    NoAnswer,
    CnameDeadEnd,
    NxDomain,
    Refused,
    Truncated,
    Timeout,
    ServerError,
}

fn classify_response(resp: &Response, qname: &[u8], qtype: QueryType) -> QueryOutcome {
    if resp.truncated {
        return QueryOutcome::Truncated;
    }
    match resp.rcode {
        Rcode::NoError => {}
        Rcode::NxDomain => return QueryOutcome::NxDomain,
        Rcode::Refused => return QueryOutcome::Refused,
        Rcode::Other(code) => {
            debug!("dns rcode {}", code);
            return QueryOutcome::ServerError;
        }
    }
    if resp.qdcount != 1 {
        return QueryOutcome::ServerError;
    }
    if resp.answers.is_empty() {
        return QueryOutcome::NoAnswer;
    }
    match extract_addresses(resp, qname, qtype) {
        Extracted::Addresses(addrs) => QueryOutcome::Addresses(addrs),
        Extracted::CnameOnly => QueryOutcome::CnameDeadEnd,
        Extracted::Nothing => QueryOutcome::NoAnswer,
    }
}

enum Extracted {
    Addresses(Vec<IpAddr>),
    /// The chain ended on a CNAME with no address record.
    CnameOnly,
    Nothing,
}

/// Walk the answer section following the CNAME chain from `qname`.
/// Records whose owner does not match the current chain position are
/// ignored.
fn extract_addresses(resp: &Response, qname: &[u8], qtype: QueryType) -> Extracted {
    let mut chain: Vec<u8> = qname.to_vec();
    let mut addrs = Vec::new();
    let mut saw_cname = false;

    for answer in &resp.answers {
        if !eq_dn(&answer.name, &chain) {
            continue;
        }
        match &answer.data {
            RData::Cname(target) => {
                saw_cname = true;
                chain = target.clone();
            }
            RData::Ipv4(ip) if qtype == QueryType::A => addrs.push(IpAddr::V4(*ip)),
            RData::Ipv6(ip) if qtype == QueryType::Aaaa => addrs.push(IpAddr::V6(*ip)),
            _ => {}
        }
    }

    if !addrs.is_empty() {
        Extracted::Addresses(addrs)
    } else if saw_cname {
        Extracted::CnameOnly
    } else {
        Extracted::Nothing
    }
}

/// DNS names compare case-insensitively.
fn eq_dn(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// Weighted preference for one candidate address.
///
/// +8 preferred family, +4 inside a preferred network, +2 not already
/// bound to another server of the backend, +1 equals the current
/// address. 15 cannot be beaten.
fn score_candidate(
    ip: IpAddr,
    prefer: Family,
    preferred_networks: &[(IpAddr, u8)],
    already_bound: &[IpAddr],
    current: Option<IpAddr>,
) -> u8 {
    let mut score = 0;
    if prefer.matches(&ip) {
        score += 8;
    }
    if preferred_networks
        .iter()
        .any(|&(net, prefix)| in_network(ip, net, prefix))
    {
        score += 4;
    }
    if !already_bound.contains(&ip) {
        score += 2;
    }
    if current == Some(ip) {
        score += 1;
    }
    score
}

fn in_network(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let prefix = u32::from(prefix.min(32));
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix);
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let prefix = u32::from(prefix.min(128));
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix);
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

/// The query-id generator: a 64-bit xorshift.
#[derive(Debug)]
struct XorShift64(u64);

impl XorShift64 {
    fn from_clock() -> XorShift64 {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e37_79b9_7f4a_7c15);
        XorShift64(nanos | 1)
    }

    fn next_u16(&mut self) -> u16 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x & 0xffff) as u16
    }
}
