//! NAPT mapping table and TCP connection tracking.
//!
//! A mapping binds one internal (address, identifier-or-port) pair to one
//! external port on the egress interface; TCP mappings additionally carry
//! one connection record per external peer. Two keys are unique at all
//! times: `(kind, ip_int, aux_int)` and `(kind, aux_ext)`.
//!
//! The table is not synchronized; the router wraps it in a mutex and the
//! expiry tick returns its ICMP side effects for the caller to emit after
//! the lock is released.

pub mod translate;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

/// First external port/identifier handed out.
pub const PORT_RANGE_START: u16 = 50_000;

/// Last external port/identifier handed out before wrapping.
pub const PORT_RANGE_END: u16 = 59_999;

/// Grace window for an unsolicited inbound SYN awaiting a matching
/// outbound SYN (TCP simultaneous open).
pub const SIMULTANEOUS_OPEN_WINDOW: Duration = Duration::from_secs(6);

/// Transport flavor of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    /// ICMP query mapping keyed by echo identifier.
    Icmp,
    /// TCP mapping keyed by port.
    Tcp,
}

/// Per-peer TCP connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Internal host sent SYN, no answer seen yet.
    OutboundSyn,
    /// Handshake completed (or simultaneous open resolved).
    Connected,
    /// A FIN was seen from either side.
    TimeWait,
    /// Unsolicited inbound SYN held for the simultaneous-open window.
    InboundSynPending,
}

/// One TCP connection per (mapping, external peer).
#[derive(Debug, Clone)]
pub struct TcpConnection {
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub state: TcpState,
    pub last_accessed: Instant,
    /// Owned copy of the held inbound SYN datagram, if any.
    pub queued_syn: Option<Vec<u8>>,
}

impl TcpConnection {
    fn new_outbound(peer_ip: Ipv4Addr, peer_port: u16, now: Instant) -> Self {
        Self {
            peer_ip,
            peer_port,
            state: TcpState::OutboundSyn,
            last_accessed: now,
            queued_syn: None,
        }
    }

    fn new_inbound_pending(peer_ip: Ipv4Addr, peer_port: u16, syn: Vec<u8>, now: Instant) -> Self {
        Self {
            peer_ip,
            peer_port,
            state: TcpState::InboundSynPending,
            last_accessed: now,
            queued_syn: Some(syn),
        }
    }

    /// Apply a segment from the internal host toward this peer.
    pub fn on_outbound_segment(&mut self, syn: bool, fin: bool, now: Instant) {
        self.last_accessed = now;
        match self.state {
            TcpState::InboundSynPending if syn => {
                self.state = TcpState::Connected;
                self.queued_syn = None;
            }
            TcpState::TimeWait if syn => {
                self.state = TcpState::OutboundSyn;
            }
            TcpState::Connected if fin => {
                self.state = TcpState::TimeWait;
            }
            _ => {}
        }
    }

    /// Apply a segment from this peer toward the internal host.
    pub fn on_inbound_segment(&mut self, fin: bool, now: Instant) {
        self.last_accessed = now;
        match self.state {
            // Answer to our SYN, or a simultaneous SYN: either completes
            TcpState::OutboundSyn => {
                self.state = TcpState::Connected;
            }
            TcpState::Connected if fin => {
                self.state = TcpState::TimeWait;
            }
            _ => {}
        }
    }
}

/// One NAT table entry.
#[derive(Debug, Clone)]
pub struct NatMapping {
    pub kind: NatKind,
    pub ip_int: Ipv4Addr,
    /// Echo identifier (ICMP) or source port (TCP) of the internal host.
    pub aux_int: u16,
    /// External port/identifier the flow appears from.
    pub aux_ext: u16,
    pub last_updated: Instant,
    pub conns: Vec<TcpConnection>,
}

impl NatMapping {
    pub fn conn_mut(&mut self, peer_ip: Ipv4Addr, peer_port: u16) -> Option<&mut TcpConnection> {
        self.conns
            .iter_mut()
            .find(|c| c.peer_ip == peer_ip && c.peer_port == peer_port)
    }
}

/// An unsolicited inbound SYN to a port with no mapping, held until a
/// matching outbound SYN claims the port or the window expires.
#[derive(Debug, Clone)]
pub struct PendingSyn {
    pub ext_port: u16,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub received: Instant,
    /// Owned copy of the SYN datagram.
    pub datagram: Vec<u8>,
}

/// Idle expiry knobs, taken from the router configuration.
#[derive(Debug, Clone, Copy)]
pub struct NatTimeouts {
    pub icmp: Duration,
    pub tcp_established: Duration,
    pub tcp_transitory: Duration,
}

/// A held SYN whose window expired; the router answers it with ICMP
/// port-unreachable toward the external peer.
#[derive(Debug)]
pub struct ExpiredSyn {
    pub datagram: Vec<u8>,
}

/// The NAPT table.
#[derive(Debug)]
pub struct NatTable {
    mappings: Vec<NatMapping>,
    pending: Vec<PendingSyn>,
    timeouts: NatTimeouts,
    next_tcp_port: u16,
    next_icmp_ident: u16,
}

impl NatTable {
    pub fn new(timeouts: NatTimeouts) -> Self {
        Self {
            mappings: Vec::new(),
            pending: Vec::new(),
            timeouts,
            next_tcp_port: PORT_RANGE_START,
            next_icmp_ident: PORT_RANGE_START,
        }
    }

    /// Hand out the next external port/identifier for `kind`.
    ///
    /// The counters roll over the range without checking for ports still in
    /// use; a wrap after 10 000 live mappings can collide. Known limitation.
    fn allocate(&mut self, kind: NatKind) -> u16 {
        let counter = match kind {
            NatKind::Tcp => &mut self.next_tcp_port,
            NatKind::Icmp => &mut self.next_icmp_ident,
        };
        let port = *counter;
        *counter = if port >= PORT_RANGE_END {
            PORT_RANGE_START
        } else {
            port + 1
        };
        port
    }

    pub fn find_internal(
        &mut self,
        kind: NatKind,
        ip_int: Ipv4Addr,
        aux_int: u16,
    ) -> Option<&mut NatMapping> {
        self.mappings
            .iter_mut()
            .find(|m| m.kind == kind && m.ip_int == ip_int && m.aux_int == aux_int)
    }

    pub fn find_external(&mut self, kind: NatKind, aux_ext: u16) -> Option<&mut NatMapping> {
        self.mappings
            .iter_mut()
            .find(|m| m.kind == kind && m.aux_ext == aux_ext)
    }

    /// Create a mapping for a first-seen internal flow, allocating a fresh
    /// external port/identifier.
    pub fn create_mapping(
        &mut self,
        kind: NatKind,
        ip_int: Ipv4Addr,
        aux_int: u16,
        now: Instant,
    ) -> &mut NatMapping {
        let aux_ext = self.allocate(kind);
        self.create_mapping_with_port(kind, ip_int, aux_int, aux_ext, now)
    }

    /// Create a mapping bound to a specific external port (simultaneous
    /// open claims the held SYN's destination port).
    pub fn create_mapping_with_port(
        &mut self,
        kind: NatKind,
        ip_int: Ipv4Addr,
        aux_int: u16,
        aux_ext: u16,
        now: Instant,
    ) -> &mut NatMapping {
        debug!(?kind, %ip_int, aux_int, aux_ext, "Creating NAT mapping");
        self.mappings.push(NatMapping {
            kind,
            ip_int,
            aux_int,
            aux_ext,
            last_updated: now,
            conns: Vec::new(),
        });
        self.mappings.last_mut().unwrap()
    }

    /// Record an outbound TCP segment, creating the mapping and connection
    /// on a first-seen SYN. Returns the mapping when the segment
    /// translates, `None` when it must be dropped (non-SYN with no
    /// mapping).
    pub fn outbound_tcp(
        &mut self,
        ip_int: Ipv4Addr,
        src_port: u16,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        syn: bool,
        fin: bool,
        now: Instant,
    ) -> Option<&mut NatMapping> {
        let exists = self
            .find_internal(NatKind::Tcp, ip_int, src_port)
            .is_some();

        if !exists {
            if !syn {
                return None;
            }
            // A held simultaneous-open SYN from this peer claims its port
            if let Some(held) = self.take_pending(peer_ip, peer_port) {
                let mapping = self.create_mapping_with_port(
                    NatKind::Tcp,
                    ip_int,
                    src_port,
                    held.ext_port,
                    now,
                );
                mapping.conns.push(TcpConnection {
                    peer_ip,
                    peer_port,
                    state: TcpState::Connected,
                    last_accessed: now,
                    queued_syn: None,
                });
                mapping.last_updated = now;
                return self.find_internal(NatKind::Tcp, ip_int, src_port);
            }
            let mapping = self.create_mapping(NatKind::Tcp, ip_int, src_port, now);
            mapping
                .conns
                .push(TcpConnection::new_outbound(peer_ip, peer_port, now));
            return self.find_internal(NatKind::Tcp, ip_int, src_port);
        }

        let mapping = self
            .find_internal(NatKind::Tcp, ip_int, src_port)
            .expect("mapping checked above");
        mapping.last_updated = now;
        match mapping
            .conns
            .iter()
            .position(|c| c.peer_ip == peer_ip && c.peer_port == peer_port)
        {
            Some(index) => mapping.conns[index].on_outbound_segment(syn, fin, now),
            None if syn => mapping
                .conns
                .push(TcpConnection::new_outbound(peer_ip, peer_port, now)),
            // Endpoint-independent mapping: translate even without a record
            None => {}
        }
        self.find_internal(NatKind::Tcp, ip_int, src_port)
    }

    /// Hold an unsolicited inbound SYN for a port with no mapping. Keeps
    /// the first SYN per (port, peer).
    pub fn hold_pending(
        &mut self,
        ext_port: u16,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        datagram: Vec<u8>,
        now: Instant,
    ) {
        if self
            .pending
            .iter()
            .any(|p| p.ext_port == ext_port && p.peer_ip == peer_ip && p.peer_port == peer_port)
        {
            return;
        }
        debug!(ext_port, %peer_ip, peer_port, "Holding unsolicited inbound SYN");
        self.pending.push(PendingSyn {
            ext_port,
            peer_ip,
            peer_port,
            received: now,
            datagram,
        });
    }

    /// Remove and return the held SYN from `peer`, if any.
    fn take_pending(&mut self, peer_ip: Ipv4Addr, peer_port: u16) -> Option<PendingSyn> {
        let index = self
            .pending
            .iter()
            .position(|p| p.peer_ip == peer_ip && p.peer_port == peer_port)?;
        Some(self.pending.remove(index))
    }

    /// Expire idle mappings, connections and held SYNs. Returns the held
    /// SYNs whose window lapsed so the caller can answer them.
    pub fn tick(&mut self, now: Instant) -> Vec<ExpiredSyn> {
        let mut expired = Vec::new();
        let timeouts = self.timeouts;

        self.mappings.retain_mut(|mapping| match mapping.kind {
            NatKind::Icmp => {
                let keep = now.duration_since(mapping.last_updated) <= timeouts.icmp;
                if !keep {
                    debug!(ip_int = %mapping.ip_int, aux_ext = mapping.aux_ext, "ICMP mapping expired");
                }
                keep
            }
            NatKind::Tcp => {
                mapping.conns.retain_mut(|conn| {
                    let limit = match conn.state {
                        TcpState::Connected => timeouts.tcp_established,
                        TcpState::OutboundSyn | TcpState::TimeWait => timeouts.tcp_transitory,
                        TcpState::InboundSynPending => {
                            SIMULTANEOUS_OPEN_WINDOW.min(timeouts.tcp_transitory)
                        }
                    };
                    let keep = now.duration_since(conn.last_accessed) <= limit;
                    if !keep {
                        debug!(
                            peer = %conn.peer_ip,
                            peer_port = conn.peer_port,
                            state = ?conn.state,
                            "TCP connection expired"
                        );
                        if let Some(datagram) = conn.queued_syn.take() {
                            expired.push(ExpiredSyn { datagram });
                        }
                    }
                    keep
                });
                !mapping.conns.is_empty()
            }
        });

        self.pending.retain_mut(|pending| {
            let keep = now.duration_since(pending.received) <= SIMULTANEOUS_OPEN_WINDOW;
            if !keep {
                debug!(
                    ext_port = pending.ext_port,
                    peer = %pending.peer_ip,
                    "Simultaneous-open window expired for held SYN"
                );
                expired.push(ExpiredSyn {
                    datagram: std::mem::take(&mut pending.datagram),
                });
            }
            keep
        });

        expired
    }

    pub fn mappings(&self) -> &[NatMapping] {
        &self.mappings
    }

    pub fn pending(&self) -> &[PendingSyn] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 100);

    fn timeouts() -> NatTimeouts {
        NatTimeouts {
            icmp: Duration::from_secs(60),
            tcp_established: Duration::from_secs(7440),
            tcp_transitory: Duration::from_secs(300),
        }
    }

    fn table() -> NatTable {
        NatTable::new(timeouts())
    }

    #[test]
    fn test_allocator_rolls_and_wraps() {
        let mut table = table();
        assert_eq!(table.allocate(NatKind::Tcp), 50_000);
        assert_eq!(table.allocate(NatKind::Tcp), 50_001);
        // ICMP identifiers roll independently
        assert_eq!(table.allocate(NatKind::Icmp), 50_000);

        table.next_tcp_port = PORT_RANGE_END;
        assert_eq!(table.allocate(NatKind::Tcp), PORT_RANGE_END);
        assert_eq!(table.allocate(NatKind::Tcp), PORT_RANGE_START);
    }

    #[test]
    fn test_mapping_keys_unique() {
        let mut table = table();
        let now = Instant::now();
        table.create_mapping(NatKind::Icmp, HOST, 0x4242, now);
        table.create_mapping(NatKind::Tcp, HOST, 0x4242, now);
        table.create_mapping(NatKind::Tcp, HOST, 12345, now);

        for (i, a) in table.mappings().iter().enumerate() {
            for b in &table.mappings()[i + 1..] {
                assert!(
                    !(a.kind == b.kind && a.ip_int == b.ip_int && a.aux_int == b.aux_int),
                    "internal key collision"
                );
                assert!(
                    !(a.kind == b.kind && a.aux_ext == b.aux_ext),
                    "external key collision"
                );
            }
        }
    }

    #[test]
    fn test_outbound_syn_creates_mapping_and_connection() {
        let mut table = table();
        let now = Instant::now();
        let mapping = table
            .outbound_tcp(HOST, 12345, PEER, 80, true, false, now)
            .unwrap();
        assert_eq!(mapping.aux_ext, 50_000);
        assert_eq!(mapping.conns.len(), 1);
        assert_eq!(mapping.conns[0].state, TcpState::OutboundSyn);

        // Same flow again reuses the mapping
        let mapping = table
            .outbound_tcp(HOST, 12345, PEER, 80, true, false, now)
            .unwrap();
        assert_eq!(mapping.aux_ext, 50_000);
        assert_eq!(mapping.conns.len(), 1);
    }

    #[test]
    fn test_outbound_non_syn_without_mapping_drops() {
        let mut table = table();
        let now = Instant::now();
        assert!(
            table
                .outbound_tcp(HOST, 12345, PEER, 80, false, false, now)
                .is_none()
        );
        assert!(table.mappings().is_empty());
    }

    #[test]
    fn test_handshake_and_fin() {
        let mut table = table();
        let mut now = Instant::now();
        table
            .outbound_tcp(HOST, 12345, PEER, 80, true, false, now)
            .unwrap();

        now += Duration::from_millis(10);
        let mapping = table.find_external(NatKind::Tcp, 50_000).unwrap();
        let conn = mapping.conn_mut(PEER, 80).unwrap();
        conn.on_inbound_segment(false, now);
        assert_eq!(conn.state, TcpState::Connected);

        conn.on_inbound_segment(true, now);
        assert_eq!(conn.state, TcpState::TimeWait);

        // Reopen from TIME_WAIT with a fresh outbound SYN
        conn.on_outbound_segment(true, false, now);
        assert_eq!(conn.state, TcpState::OutboundSyn);
    }

    #[test]
    fn test_simultaneous_open_claims_held_port() {
        let mut table = table();
        let now = Instant::now();
        table.hold_pending(50_010, PEER, 80, vec![0xab; 40], now);
        assert_eq!(table.pending().len(), 1);

        let mapping = table
            .outbound_tcp(Ipv4Addr::new(10, 0, 1, 50), 12345, PEER, 80, true, false, now)
            .unwrap();
        assert_eq!(mapping.aux_ext, 50_010);
        assert_eq!(mapping.conns[0].state, TcpState::Connected);
        assert!(mapping.conns[0].queued_syn.is_none());
        assert!(table.pending().is_empty());
    }

    #[test]
    fn test_inbound_pending_inside_mapping_promotes_on_outbound_syn() {
        let mut table = table();
        let now = Instant::now();
        let mapping = table
            .outbound_tcp(HOST, 12345, PEER, 80, true, false, now)
            .unwrap();
        // A second peer SYNs the mapped port
        let other = Ipv4Addr::new(198, 51, 100, 9);
        mapping
            .conns
            .push(TcpConnection::new_inbound_pending(other, 443, vec![1, 2, 3], now));

        let mapping = table
            .outbound_tcp(HOST, 12345, other, 443, true, false, now)
            .unwrap();
        let conn = mapping.conn_mut(other, 443).unwrap();
        assert_eq!(conn.state, TcpState::Connected);
        assert!(conn.queued_syn.is_none());
    }

    #[test]
    fn test_tick_expires_icmp_mapping() {
        let mut table = table();
        let t0 = Instant::now();
        table.create_mapping(NatKind::Icmp, HOST, 0x4242, t0);

        assert!(table.tick(t0 + Duration::from_secs(59)).is_empty());
        assert_eq!(table.mappings().len(), 1);

        table.tick(t0 + Duration::from_secs(61));
        assert!(table.mappings().is_empty());
    }

    #[test]
    fn test_tick_expires_connections_by_state() {
        let mut table = NatTable::new(NatTimeouts {
            icmp: Duration::from_secs(60),
            tcp_established: Duration::from_secs(2),
            tcp_transitory: Duration::from_secs(300),
        });
        let t0 = Instant::now();
        table
            .outbound_tcp(HOST, 12345, PEER, 80, true, false, t0)
            .unwrap();
        let mapping = table.find_external(NatKind::Tcp, 50_000).unwrap();
        mapping.conn_mut(PEER, 80).unwrap().on_inbound_segment(false, t0);

        // Established timeout (2 s) governs the connected record; the
        // transitory timeout would keep it for 300 s
        table.tick(t0 + Duration::from_secs(3));
        assert!(table.mappings().is_empty(), "mapping dies with last conn");
    }

    #[test]
    fn test_tick_answers_expired_held_syn() {
        let mut table = table();
        let t0 = Instant::now();
        table.hold_pending(50_010, PEER, 80, vec![0xcd; 44], t0);

        assert!(table.tick(t0 + Duration::from_secs(5)).is_empty());
        let expired = table.tick(t0 + Duration::from_secs(7));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].datagram, vec![0xcd; 44]);
        assert!(table.pending().is_empty());
    }

    #[test]
    fn test_tick_answers_expired_pending_connection() {
        let mut table = table();
        let t0 = Instant::now();
        let mapping = table
            .outbound_tcp(HOST, 12345, PEER, 80, true, false, t0)
            .unwrap();
        let other = Ipv4Addr::new(198, 51, 100, 9);
        mapping
            .conns
            .push(TcpConnection::new_inbound_pending(other, 443, vec![7; 40], t0));

        let expired = table.tick(t0 + Duration::from_secs(7));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].datagram, vec![7; 40]);
        // The outbound connection survives (transitory timeout)
        assert_eq!(table.mappings().len(), 1);
        assert_eq!(table.mappings()[0].conns.len(), 1);
    }
}
