//! The router core: ingress pipeline, forwarding and timers.
//!
//! The transport calls [`Router::handle_frame`] with each received Ethernet
//! frame and receives emitted frames through the [`FrameSink`] it supplied
//! at construction. Processing is synchronous per packet; the only other
//! execution contexts are the two 1 s maintenance timers (ARP retries, NAT
//! expiry), started with [`Router::start`].
//!
//! Lock order is ARP before NAT. Code holding the NAT lock only collects
//! actions and never touches the ARP layer; emission happens after locks
//! are released.

use crate::config::RouterConfig;
use crate::dataplane::arp::ArpCache;
use crate::dataplane::icmp::{self, IcmpErrorKind};
use crate::dataplane::interface::{Interface, InterfaceError, InterfaceTable};
use crate::dataplane::nat::translate::{self, NatVerdict};
use crate::dataplane::nat::{NatTable, NatTimeouts};
use crate::dataplane::packet;
use crate::routing::{Route, RoutingTable};
use crossbeam_channel::Sender;
use smoltcp::wire::{
    ArpOperation, ArpRepr, EthernetAddress, EthernetProtocol, Icmpv4Message, Icmpv4Packet,
    IpProtocol, Ipv4Packet,
};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cadence of the maintenance timers.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Egress seam toward the transport.
///
/// Implementations must not mutate the provided buffer and must be callable
/// from the ingress worker and both timer threads.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, iface: &str, frame: &[u8]) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("frame sink closed")]
    Closed,
}

/// A frame the core asked the transport to emit.
#[derive(Debug, Clone)]
pub struct EmittedFrame {
    pub iface: String,
    pub frame: Vec<u8>,
}

/// [`FrameSink`] over a crossbeam channel, for transports that drain
/// emitted frames from a separate thread.
pub struct ChannelSink {
    tx: Sender<EmittedFrame>,
}

impl ChannelSink {
    pub fn new(tx: Sender<EmittedFrame>) -> Self {
        Self { tx }
    }
}

impl FrameSink for ChannelSink {
    fn send_frame(&self, iface: &str, frame: &[u8]) -> Result<(), SinkError> {
        self.tx
            .send(EmittedFrame {
                iface: iface.to_string(),
                frame: frame.to_vec(),
            })
            .map_err(|_| SinkError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Interface(#[from] InterfaceError),
    #[error("route {prefix} references unknown interface `{interface}`")]
    UnknownRouteInterface { prefix: String, interface: String },
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

struct RouterCore {
    interfaces: InterfaceTable,
    routes: RoutingTable,
    config: RouterConfig,
    arp: Mutex<ArpCache>,
    nat: Mutex<NatTable>,
    ip_ident: AtomicU16,
    sink: Arc<dyn FrameSink>,
}

/// The router instance.
pub struct Router {
    core: Arc<RouterCore>,
    shutdown: Arc<AtomicBool>,
    timers: Vec<JoinHandle<()>>,
}

impl Router {
    /// Build a router from the transport-supplied interface list, routing
    /// table and configuration.
    pub fn new(
        interfaces: Vec<Interface>,
        routes: Vec<Route>,
        config: RouterConfig,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, RouterError> {
        let interfaces = InterfaceTable::new(interfaces)?;
        for route in &routes {
            if interfaces.by_name(&route.interface).is_none() {
                return Err(RouterError::UnknownRouteInterface {
                    prefix: route.prefix.to_string(),
                    interface: route.interface.clone(),
                });
            }
        }
        let routes = RoutingTable::from_routes(routes);
        let nat = NatTable::new(NatTimeouts {
            icmp: config.icmp_timeout(),
            tcp_established: config.tcp_established_timeout(),
            tcp_transitory: config.tcp_transitory_timeout(),
        });

        Ok(Self {
            core: Arc::new(RouterCore {
                interfaces,
                routes,
                config,
                arp: Mutex::new(ArpCache::new()),
                nat: Mutex::new(nat),
                ip_ident: AtomicU16::new(0),
                sink,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            timers: Vec::new(),
        })
    }

    /// Process one received Ethernet frame.
    pub fn handle_frame(&self, iface: &str, frame: &[u8]) {
        self.core.handle_frame(iface, frame);
    }

    /// Run one ARP maintenance pass. Driven by the `arp-retry` timer;
    /// exposed so tests can advance time deterministically.
    pub fn tick_arp(&self, now: Instant) {
        self.core.tick_arp(now);
    }

    /// Run one NAT expiry pass. Driven by the `nat-timer` timer; exposed
    /// so tests can advance time deterministically.
    pub fn tick_nat(&self, now: Instant) {
        self.core.tick_nat(now);
    }

    /// Start the maintenance timers.
    pub fn start(&mut self) -> Result<(), RouterError> {
        if !self.timers.is_empty() {
            return Ok(());
        }
        info!(nat_enabled = self.core.config.nat_enabled, "Starting router timers");

        self.timers
            .push(self.spawn_timer("arp-retry", |core, now| core.tick_arp(now))?);
        if self.core.config.nat_enabled {
            self.timers
                .push(self.spawn_timer("nat-timer", |core, now| core.tick_nat(now))?);
        }
        Ok(())
    }

    fn spawn_timer(
        &self,
        name: &'static str,
        tick: fn(&RouterCore, Instant),
    ) -> Result<JoinHandle<()>, RouterError> {
        let core = Arc::clone(&self.core);
        let shutdown = Arc::clone(&self.shutdown);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(TICK_INTERVAL);
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    tick(&core, Instant::now());
                }
                debug!(timer = name, "Timer stopped");
            })
            .map_err(|source| RouterError::Spawn { name, source })
    }

    /// Signal the timers to stop and wait for them.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.timers.drain(..) {
            if handle.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RouterCore {
    fn handle_frame(&self, iface_name: &str, frame: &[u8]) {
        let Some(iface) = self.interfaces.by_name(iface_name) else {
            warn!(iface = %iface_name, "Frame on unknown interface");
            return;
        };
        let Some(eth) = packet::parse_ethernet(frame) else {
            debug!(iface = %iface_name, len = frame.len(), "Runt frame");
            return;
        };

        let dst_mac = eth.dst_addr();
        if dst_mac != iface.mac && !dst_mac.is_broadcast() {
            debug!(iface = %iface_name, dst = %dst_mac, "Frame not for us");
            return;
        }

        match eth.ethertype() {
            EthernetProtocol::Arp => self.handle_arp(iface, eth.payload()),
            EthernetProtocol::Ipv4 => self.handle_ipv4(iface, eth.payload()),
            ethertype => debug!(iface = %iface_name, ?ethertype, "Unhandled ethertype"),
        }
    }

    fn handle_arp(&self, iface: &Interface, payload: &[u8]) {
        let Some(repr) = packet::parse_arp(payload) else {
            debug!(iface = %iface.name, "Malformed ARP packet");
            return;
        };

        match repr {
            ArpRepr::EthernetIpv4 {
                operation: ArpOperation::Request,
                source_hardware_addr,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } => {
                if target_protocol_addr != iface.addr {
                    debug!(
                        iface = %iface.name,
                        target = %target_protocol_addr,
                        "ARP request not for us, ignoring"
                    );
                    return;
                }
                debug!(
                    iface = %iface.name,
                    sender = %source_protocol_addr,
                    "ARP request for our address, replying"
                );
                let reply = packet::build_arp_reply_frame(
                    iface.mac,
                    iface.addr,
                    source_hardware_addr,
                    source_protocol_addr,
                );
                self.emit(&iface.name, &reply);
            }
            ArpRepr::EthernetIpv4 {
                operation: ArpOperation::Reply,
                source_hardware_addr,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } => {
                if target_protocol_addr != iface.addr {
                    debug!(
                        iface = %iface.name,
                        target = %target_protocol_addr,
                        "ARP reply for non-owned address, ignoring"
                    );
                    return;
                }
                let now = Instant::now();
                let queued = {
                    let mut arp = self.arp.lock().unwrap();
                    arp.insert(source_protocol_addr, source_hardware_addr, now);
                    arp.take_queued(source_protocol_addr)
                };
                debug!(
                    iface = %iface.name,
                    sender = %source_protocol_addr,
                    flushed = queued.len(),
                    "Learned ARP entry"
                );
                for pending in queued {
                    let mut frame = pending.frame;
                    frame[..6].copy_from_slice(source_hardware_addr.as_bytes());
                    self.emit(&pending.iface, &frame);
                }
            }
            _ => {}
        }
    }

    fn handle_ipv4(&self, iface: &Interface, payload: &[u8]) {
        let Ok(ip) = Ipv4Packet::new_checked(payload) else {
            debug!(iface = %iface.name, len = payload.len(), "Malformed IPv4 header");
            return;
        };
        if ip.version() != 4 {
            debug!(iface = %iface.name, version = ip.version(), "Not IPv4");
            return;
        }
        if !ip.verify_checksum() {
            debug!(iface = %iface.name, "Bad IPv4 header checksum");
            return;
        }

        // Trailing Ethernet padding is not part of the datagram
        let datagram = &payload[..ip.total_len() as usize];
        let dst = ip.dst_addr();
        let local = self.interfaces.owns_addr(dst);

        if !self.config.nat_enabled {
            if local {
                self.handle_local(datagram);
            } else {
                self.forward(iface, datagram);
            }
            return;
        }

        let now = Instant::now();
        if iface.name == self.config.internal_interface {
            if local {
                self.handle_local(datagram);
                return;
            }
            // TTL check precedes translation: the error must quote the
            // sender's datagram, not a rewritten one
            if ip.hop_limit() <= 1 {
                self.send_icmp_error(datagram, IcmpErrorKind::TimeExceeded);
                return;
            }
            // Route first: traffic that would egress the internal interface
            // again is never translated
            let Some(route) = self.routes.lookup(dst) else {
                self.send_icmp_error(datagram, IcmpErrorKind::NetUnreachable);
                return;
            };
            if route.interface == iface.name {
                self.send_icmp_error(datagram, IcmpErrorKind::NetUnreachable);
                return;
            }
            let Some(egress) = self.interfaces.by_name(&route.interface) else {
                warn!(interface = %route.interface, "Route egress interface missing");
                return;
            };
            let verdict = {
                let mut nat = self.nat.lock().unwrap();
                translate::process_outbound(&mut nat, datagram, egress.addr, now)
            };
            self.apply_verdict(iface, datagram, verdict);
        } else {
            if !local {
                // External-to-external traffic is forwarded untranslated
                self.forward(iface, datagram);
                return;
            }
            let internal_addr = self
                .interfaces
                .by_name(&self.config.internal_interface)
                .map(|internal| internal.addr);
            if internal_addr == Some(dst) {
                debug!(
                    iface = %iface.name,
                    "External datagram for the internal-facing address, dropping"
                );
                return;
            }
            let verdict = {
                let mut nat = self.nat.lock().unwrap();
                translate::process_inbound(&mut nat, datagram, now)
            };
            self.apply_verdict(iface, datagram, verdict);
        }
    }

    fn apply_verdict(&self, ingress: &Interface, datagram: &[u8], verdict: NatVerdict) {
        match verdict {
            NatVerdict::Local => self.handle_local(datagram),
            NatVerdict::Forward(translated) => self.forward(ingress, &translated),
            NatVerdict::Held => {}
            NatVerdict::PortUnreachable => {
                self.send_icmp_error(datagram, IcmpErrorKind::PortUnreachable)
            }
            NatVerdict::Drop => debug!(iface = %ingress.name, "NAT dropped datagram"),
        }
    }

    /// Datagram addressed to one of the router's own addresses.
    fn handle_local(&self, datagram: &[u8]) {
        let ip = Ipv4Packet::new_unchecked(datagram);
        let header_len = ip.header_len() as usize;
        match ip.next_header() {
            IpProtocol::Icmp => {
                let Ok(icmp) = Icmpv4Packet::new_checked(&datagram[header_len..]) else {
                    debug!("Malformed ICMP to router");
                    return;
                };
                if !icmp.verify_checksum() {
                    debug!("Bad ICMP checksum");
                    return;
                }
                if icmp.msg_type() != Icmpv4Message::EchoRequest {
                    debug!(msg_type = ?icmp.msg_type(), "ICMP to router ignored");
                    return;
                }
                let reply = icmp::build_echo_reply(
                    ip.dst_addr(),
                    ip.src_addr(),
                    icmp.echo_ident(),
                    icmp.echo_seq_no(),
                    icmp.data(),
                    self.next_ident(),
                );
                self.send_datagram(reply);
            }
            protocol => {
                debug!(%protocol, "Non-ICMP datagram for router");
                self.send_icmp_error(datagram, IcmpErrorKind::PortUnreachable);
            }
        }
    }

    /// Forward a transit datagram: TTL, route lookup, link resolution.
    fn forward(&self, ingress: &Interface, datagram: &[u8]) {
        let ip = Ipv4Packet::new_unchecked(datagram);
        let ttl = ip.hop_limit();
        let dst = ip.dst_addr();

        if ttl <= 1 {
            debug!(%dst, "TTL expired in transit");
            self.send_icmp_error(datagram, IcmpErrorKind::TimeExceeded);
            return;
        }

        let Some(route) = self.routes.lookup(dst) else {
            debug!(%dst, "No route");
            self.send_icmp_error(datagram, IcmpErrorKind::NetUnreachable);
            return;
        };
        if route.interface == ingress.name {
            debug!(%dst, iface = %ingress.name, "Route loops back to ingress");
            self.send_icmp_error(datagram, IcmpErrorKind::NetUnreachable);
            return;
        }

        let mut out = datagram.to_vec();
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut out[..]);
            ip.set_hop_limit(ttl - 1);
            ip.fill_checksum();
        }
        self.send_via_route(out, route);
    }

    /// Route a self-generated datagram by its destination.
    fn send_datagram(&self, datagram: Vec<u8>) {
        let dst = Ipv4Packet::new_unchecked(&datagram[..]).dst_addr();
        let Some(route) = self.routes.lookup(dst) else {
            debug!(%dst, "No route for generated datagram");
            return;
        };
        self.send_via_route(datagram, route);
    }

    /// Fill the Ethernet header and resolve the next hop; on an ARP miss
    /// the frame is queued and the first request broadcast immediately.
    fn send_via_route(&self, datagram: Vec<u8>, route: &Route) {
        let Some(egress) = self.interfaces.by_name(&route.interface) else {
            warn!(interface = %route.interface, "Route egress interface missing");
            return;
        };
        let dst = Ipv4Packet::new_unchecked(&datagram[..]).dst_addr();
        let next_hop = route.next_hop(dst);

        let mut frame = packet::build_ethernet_frame(
            EthernetAddress([0; 6]),
            egress.mac,
            EthernetProtocol::Ipv4,
            &datagram,
        );

        let now = Instant::now();
        let mut arp = self.arp.lock().unwrap();
        if let Some(mac) = arp.lookup(next_hop, now) {
            drop(arp);
            frame[..6].copy_from_slice(mac.as_bytes());
            self.emit(&egress.name, &frame);
            return;
        }
        let is_new = arp.enqueue(next_hop, &route.interface, frame, now);
        drop(arp);

        if is_new {
            debug!(%next_hop, iface = %egress.name, "ARP miss, broadcasting request");
            let request = packet::build_arp_request_frame(egress.mac, egress.addr, next_hop);
            self.emit(&egress.name, &request);
        } else {
            debug!(%next_hop, "Queued frame behind pending ARP request");
        }
    }

    /// Build and send an ICMP error toward the original sender, sourced
    /// from the interface the route back to them selects.
    fn send_icmp_error(&self, original: &[u8], kind: IcmpErrorKind) {
        let sender = Ipv4Packet::new_unchecked(original).src_addr();
        if self.interfaces.owns_addr(sender) {
            debug!(%sender, "Undeliverable self-sourced datagram, dropping");
            return;
        }
        let Some(route) = self.routes.lookup(sender) else {
            debug!(%sender, "No route back to sender for ICMP error");
            return;
        };
        let Some(src_iface) = self.interfaces.by_name(&route.interface) else {
            warn!(interface = %route.interface, "Route egress interface missing");
            return;
        };
        let error = icmp::build_error(kind, src_iface.addr, sender, original, self.next_ident());
        self.send_via_route(error, route);
    }

    fn tick_arp(&self, now: Instant) {
        let (retries, failures) = {
            let mut arp = self.arp.lock().unwrap();
            arp.tick(now)
        };

        for retry in retries {
            let Some(iface) = self.interfaces.by_name(&retry.iface) else {
                continue;
            };
            let request = packet::build_arp_request_frame(iface.mac, iface.addr, retry.ip);
            self.emit(&iface.name, &request);
        }

        for failure in failures {
            for pending in failure.queued {
                if pending.frame.len() < packet::ETHERNET_HEADER_SIZE + 20 {
                    continue;
                }
                let datagram = &pending.frame[packet::ETHERNET_HEADER_SIZE..];
                self.send_icmp_error(datagram, IcmpErrorKind::HostUnreachable);
            }
        }
    }

    fn tick_nat(&self, now: Instant) {
        if !self.config.nat_enabled {
            return;
        }
        let expired = {
            let mut nat = self.nat.lock().unwrap();
            nat.tick(now)
        };
        for held in expired {
            self.send_icmp_error(&held.datagram, IcmpErrorKind::PortUnreachable);
        }
    }

    fn next_ident(&self) -> u16 {
        self.ip_ident.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, iface: &str, frame: &[u8]) {
        if let Err(error) = self.sink.send_frame(iface, frame) {
            warn!(%iface, %error, "Failed to emit frame");
        }
    }
}
