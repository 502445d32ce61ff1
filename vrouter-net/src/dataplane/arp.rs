//! ARP cache and pending-request queue.
//!
//! The cache maps next-hop IPv4 addresses to MACs with a 15 s freshness
//! window. Frames that miss the cache are queued behind a per-address
//! request; a retry tick re-broadcasts each outstanding request once per
//! second and fails it after five attempts, handing the queued frames back
//! to the caller for ICMP host-unreachable generation.
//!
//! The struct itself is not synchronized; the router wraps it in a mutex
//! and runs the tick's side effects after releasing it.

use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a learned entry stays fresh.
pub const ENTRY_TTL: Duration = Duration::from_secs(15);

/// Interval between re-broadcasts of an unanswered request.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Broadcasts attempted before a request is failed.
pub const MAX_ATTEMPTS: u8 = 5;

#[derive(Debug, Clone)]
struct ArpEntry {
    mac: EthernetAddress,
    inserted: Instant,
}

/// An outbound frame parked until its next hop resolves.
#[derive(Debug, Clone)]
pub struct PendingFrame {
    /// Complete Ethernet frame; destination MAC still unset.
    pub frame: Vec<u8>,
    /// Egress interface name.
    pub iface: String,
}

/// One outstanding request per next-hop address.
#[derive(Debug)]
struct ArpRequest {
    ip: Ipv4Addr,
    iface: String,
    first_sent: Instant,
    last_sent: Instant,
    times_sent: u8,
    queued: Vec<PendingFrame>,
}

/// A request due for another broadcast.
#[derive(Debug, Clone)]
pub struct Retry {
    pub ip: Ipv4Addr,
    pub iface: String,
}

/// A request that exhausted its attempts.
#[derive(Debug)]
pub struct FailedRequest {
    pub ip: Ipv4Addr,
    pub queued: Vec<PendingFrame>,
}

/// ARP cache plus the FIFO of outstanding requests.
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: HashMap<Ipv4Addr, ArpEntry>,
    requests: Vec<ArpRequest>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh-entry lookup; expired entries count as misses.
    pub fn lookup(&mut self, ip: Ipv4Addr, now: Instant) -> Option<EthernetAddress> {
        match self.entries.get(&ip) {
            Some(entry) if now.duration_since(entry.inserted) < ENTRY_TTL => Some(entry.mac),
            Some(_) => {
                self.entries.remove(&ip);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh a learned address.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: EthernetAddress, now: Instant) {
        self.entries.insert(ip, ArpEntry { mac, inserted: now });
    }

    /// Queue a frame behind the request for `ip`, creating the request if
    /// absent. Returns true when the request is new and its first broadcast
    /// should go out now.
    pub fn enqueue(&mut self, ip: Ipv4Addr, iface: &str, frame: Vec<u8>, now: Instant) -> bool {
        let pending = PendingFrame {
            frame,
            iface: iface.to_string(),
        };
        if let Some(request) = self.requests.iter_mut().find(|r| r.ip == ip) {
            request.queued.push(pending);
            return false;
        }
        self.requests.push(ArpRequest {
            ip,
            iface: iface.to_string(),
            first_sent: now,
            last_sent: now,
            times_sent: 1,
            queued: vec![pending],
        });
        true
    }

    /// Remove the request for `ip`, handing back its queued frames.
    pub fn take_queued(&mut self, ip: Ipv4Addr) -> Vec<PendingFrame> {
        match self.requests.iter().position(|r| r.ip == ip) {
            Some(index) => self.requests.remove(index).queued,
            None => Vec::new(),
        }
    }

    /// Once-per-second maintenance: collect requests due for another
    /// broadcast and requests that exhausted their attempts.
    pub fn tick(&mut self, now: Instant) -> (Vec<Retry>, Vec<FailedRequest>) {
        let mut retries = Vec::new();
        let mut failures = Vec::new();

        let mut index = 0;
        while index < self.requests.len() {
            let request = &mut self.requests[index];
            if now.duration_since(request.last_sent) < RETRY_INTERVAL {
                index += 1;
                continue;
            }
            if request.times_sent >= MAX_ATTEMPTS {
                let request = self.requests.remove(index);
                debug!(
                    ip = %request.ip,
                    frames = request.queued.len(),
                    age_ms = now.duration_since(request.first_sent).as_millis() as u64,
                    "ARP request exhausted, failing queued frames"
                );
                failures.push(FailedRequest {
                    ip: request.ip,
                    queued: request.queued,
                });
                continue;
            }
            request.times_sent += 1;
            request.last_sent = now;
            retries.push(Retry {
                ip: request.ip,
                iface: request.iface.clone(),
            });
            index += 1;
        }

        (retries, failures)
    }

    /// Number of outstanding requests.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: EthernetAddress = EthernetAddress([0x0e, 0x20, 0xab, 0x80, 0x00, 0x02]);

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 1, last)
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let mut cache = ArpCache::new();
        let t0 = Instant::now();
        cache.insert(ip(1), MAC, t0);

        assert_eq!(cache.lookup(ip(1), t0), Some(MAC));
        assert_eq!(cache.lookup(ip(1), t0 + Duration::from_secs(14)), Some(MAC));
        assert_eq!(cache.lookup(ip(1), t0 + Duration::from_secs(15)), None);
        // The expired entry is gone even for an earlier timestamp
        assert_eq!(cache.lookup(ip(1), t0), None);
    }

    #[test]
    fn test_one_request_per_address() {
        let mut cache = ArpCache::new();
        let t0 = Instant::now();

        assert!(cache.enqueue(ip(1), "eth3", vec![1], t0));
        assert!(!cache.enqueue(ip(1), "eth3", vec![2], t0));
        assert!(cache.enqueue(ip(2), "eth3", vec![3], t0));
        assert_eq!(cache.pending_requests(), 2);

        let queued = cache.take_queued(ip(1));
        assert_eq!(queued.len(), 2);
        assert_eq!(cache.pending_requests(), 1);
        assert!(cache.take_queued(ip(1)).is_empty());
    }

    #[test]
    fn test_tick_retries_once_per_second() {
        let mut cache = ArpCache::new();
        let t0 = Instant::now();
        cache.enqueue(ip(1), "eth3", vec![1], t0);

        // Too early for a retry
        let (retries, failures) = cache.tick(t0 + Duration::from_millis(500));
        assert!(retries.is_empty());
        assert!(failures.is_empty());

        let (retries, failures) = cache.tick(t0 + Duration::from_secs(1));
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].ip, ip(1));
        assert_eq!(retries[0].iface, "eth3");
        assert!(failures.is_empty());
    }

    #[test]
    fn test_request_fails_after_max_attempts() {
        let mut cache = ArpCache::new();
        let t0 = Instant::now();
        cache.enqueue(ip(1), "eth3", vec![1], t0);
        cache.enqueue(ip(1), "eth3", vec![2], t0);

        // First broadcast counted at enqueue; four more retries allowed
        let mut now = t0;
        for _ in 0..4 {
            now += Duration::from_secs(1);
            let (retries, failures) = cache.tick(now);
            assert_eq!(retries.len(), 1);
            assert!(failures.is_empty());
        }

        now += Duration::from_secs(1);
        let (retries, failures) = cache.tick(now);
        assert!(retries.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].ip, ip(1));
        assert_eq!(failures[0].queued.len(), 2);
        assert_eq!(cache.pending_requests(), 0);
    }
}
