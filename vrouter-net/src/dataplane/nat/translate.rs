//! Direction classification and packet rewriting for the NAPT gateway.
//!
//! Rewriters take the validated datagram by reference and return an owned,
//! rewritten copy; the caller forwards it through the normal egress path.
//! All header mutation goes through smoltcp views; transport checksums are
//! recomputed in full where the whole segment is present, and fixed up
//! incrementally (RFC 1624) inside truncated ICMP error quotes.

use super::{NatKind, NatTable, TcpConnection};
use smoltcp::wire::{Icmpv4Message, Icmpv4Packet, IpAddress, IpProtocol, Ipv4Packet, TcpPacket};
use std::net::Ipv4Addr;
use std::time::Instant;
use tracing::debug;

/// What the gateway decided about one datagram.
#[derive(Debug)]
pub enum NatVerdict {
    /// Deliver to the router itself.
    Local,
    /// Translated; forward the rewritten datagram.
    Forward(Vec<u8>),
    /// Held for the simultaneous-open window; nothing is emitted.
    Held,
    /// Answer the sender with ICMP port-unreachable.
    PortUnreachable,
    /// Drop silently.
    Drop,
}

/// Classify and rewrite a datagram leaving the internal network.
///
/// `egress_ip` is the address of the interface the route for the datagram's
/// destination selects; translated flows appear to originate from it.
pub fn process_outbound(
    table: &mut NatTable,
    datagram: &[u8],
    egress_ip: Ipv4Addr,
    now: Instant,
) -> NatVerdict {
    let ip = Ipv4Packet::new_unchecked(datagram);
    let header_len = ip.header_len() as usize;
    let src = ip.src_addr();
    let dst = ip.dst_addr();
    let payload = &datagram[header_len..];

    match ip.next_header() {
        IpProtocol::Icmp => {
            let Ok(icmp) = Icmpv4Packet::new_checked(payload) else {
                return NatVerdict::Drop;
            };
            match icmp.msg_type() {
                Icmpv4Message::EchoRequest | Icmpv4Message::EchoReply => {
                    let ident = icmp.echo_ident();
                    if table.find_internal(NatKind::Icmp, src, ident).is_none() {
                        table.create_mapping(NatKind::Icmp, src, ident, now);
                    }
                    let mapping = table
                        .find_internal(NatKind::Icmp, src, ident)
                        .expect("mapping created above");
                    mapping.last_updated = now;
                    let aux_ext = mapping.aux_ext;
                    NatVerdict::Forward(rewrite_outbound_echo(datagram, aux_ext, egress_ip))
                }
                Icmpv4Message::DstUnreachable | Icmpv4Message::TimeExceeded => {
                    translate_outbound_error(table, datagram, egress_ip, now)
                }
                _ => NatVerdict::Drop,
            }
        }
        IpProtocol::Tcp => {
            let Ok(tcp) = TcpPacket::new_checked(payload) else {
                return NatVerdict::Drop;
            };
            let (src_port, dst_port) = (tcp.src_port(), tcp.dst_port());
            let (syn, fin) = (tcp.syn(), tcp.fin());
            match table.outbound_tcp(src, src_port, dst, dst_port, syn, fin, now) {
                Some(mapping) => {
                    let aux_ext = mapping.aux_ext;
                    NatVerdict::Forward(rewrite_outbound_tcp(datagram, aux_ext, egress_ip))
                }
                None => {
                    debug!(%src, src_port, "Outbound non-SYN without mapping, dropping");
                    NatVerdict::Drop
                }
            }
        }
        protocol => {
            debug!(%src, %dst, %protocol, "Protocol not translated, dropping");
            NatVerdict::Drop
        }
    }
}

/// Classify and rewrite a datagram arriving on an external interface and
/// addressed to the router's external address.
pub fn process_inbound(table: &mut NatTable, datagram: &[u8], now: Instant) -> NatVerdict {
    let ip = Ipv4Packet::new_unchecked(datagram);
    let header_len = ip.header_len() as usize;
    let src = ip.src_addr();
    let payload = &datagram[header_len..];

    match ip.next_header() {
        IpProtocol::Tcp => {
            let Ok(tcp) = TcpPacket::new_checked(payload) else {
                return NatVerdict::Drop;
            };
            let (src_port, dst_port) = (tcp.src_port(), tcp.dst_port());
            let (syn, fin) = (tcp.syn(), tcp.fin());

            if table.find_external(NatKind::Tcp, dst_port).is_none() {
                if syn {
                    table.hold_pending(dst_port, src, src_port, datagram.to_vec(), now);
                    return NatVerdict::Held;
                }
                return NatVerdict::PortUnreachable;
            }
            let mapping = table
                .find_external(NatKind::Tcp, dst_port)
                .expect("mapping checked above");
            mapping.last_updated = now;
            let (ip_int, aux_int) = (mapping.ip_int, mapping.aux_int);
            match mapping
                .conns
                .iter()
                .position(|c| c.peer_ip == src && c.peer_port == src_port)
            {
                Some(index) => mapping.conns[index].on_inbound_segment(fin, now),
                None if syn => {
                    mapping.conns.push(TcpConnection::new_inbound_pending(
                        src,
                        src_port,
                        datagram.to_vec(),
                        now,
                    ));
                    return NatVerdict::Held;
                }
                // Endpoint-independent mapping: no record, still translated
                None => {}
            }
            NatVerdict::Forward(rewrite_inbound_tcp(datagram, ip_int, aux_int))
        }
        IpProtocol::Icmp => {
            let Ok(icmp) = Icmpv4Packet::new_checked(payload) else {
                return NatVerdict::Drop;
            };
            match icmp.msg_type() {
                Icmpv4Message::EchoRequest | Icmpv4Message::EchoReply => {
                    let Some(mapping) = table.find_external(NatKind::Icmp, icmp.echo_ident())
                    else {
                        return NatVerdict::Local;
                    };
                    mapping.last_updated = now;
                    let (ip_int, aux_int) = (mapping.ip_int, mapping.aux_int);
                    NatVerdict::Forward(rewrite_inbound_echo(datagram, ip_int, aux_int))
                }
                Icmpv4Message::DstUnreachable | Icmpv4Message::TimeExceeded => {
                    translate_inbound_error(table, datagram, now)
                }
                _ => NatVerdict::Local,
            }
        }
        _ => NatVerdict::Drop,
    }
}

fn bounds(datagram: &[u8]) -> (usize, usize) {
    let ip = Ipv4Packet::new_unchecked(datagram);
    let header_len = ip.header_len() as usize;
    let total_len = (ip.total_len() as usize).min(datagram.len());
    (header_len, total_len)
}

fn rewrite_outbound_echo(datagram: &[u8], aux_ext: u16, egress_ip: Ipv4Addr) -> Vec<u8> {
    let mut out = datagram.to_vec();
    let (header_len, total_len) = bounds(&out);
    {
        let mut icmp = Icmpv4Packet::new_unchecked(&mut out[header_len..total_len]);
        icmp.set_echo_ident(aux_ext);
        icmp.fill_checksum();
    }
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut out[..]);
        ip.set_src_addr(egress_ip);
        ip.fill_checksum();
    }
    out
}

fn rewrite_inbound_echo(datagram: &[u8], ip_int: Ipv4Addr, aux_int: u16) -> Vec<u8> {
    let mut out = datagram.to_vec();
    let (header_len, total_len) = bounds(&out);
    {
        let mut icmp = Icmpv4Packet::new_unchecked(&mut out[header_len..total_len]);
        icmp.set_echo_ident(aux_int);
        icmp.fill_checksum();
    }
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut out[..]);
        ip.set_dst_addr(ip_int);
        ip.fill_checksum();
    }
    out
}

fn rewrite_outbound_tcp(datagram: &[u8], aux_ext: u16, egress_ip: Ipv4Addr) -> Vec<u8> {
    let mut out = datagram.to_vec();
    let (header_len, total_len) = bounds(&out);
    let dst = Ipv4Packet::new_unchecked(&out[..]).dst_addr();
    {
        let mut tcp = TcpPacket::new_unchecked(&mut out[header_len..total_len]);
        tcp.set_src_port(aux_ext);
        tcp.fill_checksum(&IpAddress::Ipv4(egress_ip), &IpAddress::Ipv4(dst));
    }
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut out[..]);
        ip.set_src_addr(egress_ip);
        ip.fill_checksum();
    }
    out
}

fn rewrite_inbound_tcp(datagram: &[u8], ip_int: Ipv4Addr, aux_int: u16) -> Vec<u8> {
    let mut out = datagram.to_vec();
    let (header_len, total_len) = bounds(&out);
    let src = Ipv4Packet::new_unchecked(&out[..]).src_addr();
    {
        let mut tcp = TcpPacket::new_unchecked(&mut out[header_len..total_len]);
        tcp.set_dst_port(aux_int);
        tcp.fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(ip_int));
    }
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut out[..]);
        ip.set_dst_addr(ip_int);
        ip.fill_checksum();
    }
    out
}

/// Embedded datagram inside an ICMP error, as byte offsets into the outer
/// datagram. The quote holds at least the embedded IP header plus 8 bytes.
struct Embedded {
    /// Offset of the embedded IP header in the outer datagram.
    start: usize,
    /// Embedded IP header length.
    header_len: usize,
    /// Offset one past the quote.
    end: usize,
    protocol: IpProtocol,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

fn parse_embedded(datagram: &[u8]) -> Option<Embedded> {
    let (outer_header, outer_total) = bounds(datagram);
    // 8 fixed ICMP bytes precede the quote
    let start = outer_header + 8;
    if outer_total < start + 20 {
        return None;
    }
    let quote = &datagram[start..outer_total];
    let embedded = Ipv4Packet::new_unchecked(quote);
    let header_len = embedded.header_len() as usize;
    if header_len < 20 || quote.len() < header_len + 8 {
        return None;
    }
    Some(Embedded {
        start,
        header_len,
        end: outer_total,
        protocol: embedded.next_header(),
        src: embedded.src_addr(),
        dst: embedded.dst_addr(),
    })
}

/// RFC 1624 incremental checksum update for one changed 16-bit word.
fn fixup16(checksum: u16, old: u16, new: u16) -> u16 {
    let mut sum = (!checksum as u32 & 0xffff) + (!old as u32 & 0xffff) + new as u32;
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Fix an embedded transport checksum at `csum_offset` (if the quote is
/// long enough to contain it) for a set of changed 16-bit words.
fn fixup_embedded_checksum(
    buf: &mut [u8],
    csum_offset: usize,
    end: usize,
    changes: &[(u16, u16)],
) {
    if csum_offset + 2 > end {
        return;
    }
    let mut checksum = read_u16(buf, csum_offset);
    for &(old, new) in changes {
        checksum = fixup16(checksum, old, new);
    }
    write_u16(buf, csum_offset, checksum);
}

fn addr_words(addr: Ipv4Addr) -> (u16, u16) {
    let octets = addr.octets();
    (
        u16::from_be_bytes([octets[0], octets[1]]),
        u16::from_be_bytes([octets[2], octets[3]]),
    )
}

/// An ICMP error from the internal network quotes a packet the internal
/// host received, i.e. an inbound-translated datagram: its destination is
/// the internal flow endpoint. Map that destination back to the external
/// view so the peer recognizes the flow.
fn translate_outbound_error(
    table: &mut NatTable,
    datagram: &[u8],
    egress_ip: Ipv4Addr,
    now: Instant,
) -> NatVerdict {
    let Some(embedded) = parse_embedded(datagram) else {
        return NatVerdict::Drop;
    };

    let transport = embedded.start + embedded.header_len;
    let (aux_int, kind) = match embedded.protocol {
        IpProtocol::Tcp => (read_u16(datagram, transport + 2), NatKind::Tcp),
        IpProtocol::Icmp => {
            let msg_type = Icmpv4Message::from(datagram[transport]);
            if msg_type != Icmpv4Message::EchoRequest && msg_type != Icmpv4Message::EchoReply {
                return NatVerdict::Drop;
            }
            (read_u16(datagram, transport + 4), NatKind::Icmp)
        }
        _ => return NatVerdict::Drop,
    };

    let Some(mapping) = table.find_internal(kind, embedded.dst, aux_int) else {
        debug!(embedded_dst = %embedded.dst, aux_int, "No mapping for outbound ICMP error");
        return NatVerdict::Drop;
    };
    mapping.last_updated = now;
    let aux_ext = mapping.aux_ext;

    let mut out = datagram.to_vec();
    let (outer_header, outer_total) = bounds(&out);

    // Embedded destination address: internal host -> external view
    {
        let mut inner = Ipv4Packet::new_unchecked(&mut out[embedded.start..embedded.end]);
        inner.set_dst_addr(egress_ip);
        inner.fill_checksum();
    }
    // Embedded destination port / identifier
    let (old_hi, old_lo) = addr_words(embedded.dst);
    let (new_hi, new_lo) = addr_words(egress_ip);
    match kind {
        NatKind::Tcp => {
            let old_port = read_u16(&out, transport + 2);
            write_u16(&mut out, transport + 2, aux_ext);
            // Pseudo-header and port both feed the quoted TCP checksum
            fixup_embedded_checksum(
                &mut out,
                transport + 16,
                embedded.end,
                &[(old_hi, new_hi), (old_lo, new_lo), (old_port, aux_ext)],
            );
        }
        NatKind::Icmp => {
            let old_ident = read_u16(&out, transport + 4);
            write_u16(&mut out, transport + 4, aux_ext);
            fixup_embedded_checksum(
                &mut out,
                transport + 2,
                embedded.end,
                &[(old_ident, aux_ext)],
            );
        }
    }
    // Outer ICMP checksum over the rewritten quote
    {
        let mut icmp = Icmpv4Packet::new_unchecked(&mut out[outer_header..outer_total]);
        icmp.fill_checksum();
    }
    // Outer source: the error now originates from the external address
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut out[..]);
        ip.set_src_addr(egress_ip);
        ip.fill_checksum();
    }
    NatVerdict::Forward(out)
}

/// An ICMP error from the external network quotes a packet this gateway
/// emitted, i.e. an outbound-translated datagram: its source carries the
/// external flow identity. Map that source back to the internal host.
fn translate_inbound_error(table: &mut NatTable, datagram: &[u8], now: Instant) -> NatVerdict {
    let Some(embedded) = parse_embedded(datagram) else {
        return NatVerdict::Drop;
    };

    let transport = embedded.start + embedded.header_len;
    let (aux_ext, kind) = match embedded.protocol {
        IpProtocol::Tcp => (read_u16(datagram, transport), NatKind::Tcp),
        IpProtocol::Icmp => {
            let msg_type = Icmpv4Message::from(datagram[transport]);
            if msg_type != Icmpv4Message::EchoRequest && msg_type != Icmpv4Message::EchoReply {
                return NatVerdict::Drop;
            }
            (read_u16(datagram, transport + 4), NatKind::Icmp)
        }
        _ => return NatVerdict::Drop,
    };

    let Some(mapping) = table.find_external(kind, aux_ext) else {
        debug!(aux_ext, "No mapping for inbound ICMP error");
        return NatVerdict::Drop;
    };
    mapping.last_updated = now;
    let (ip_int, aux_int) = (mapping.ip_int, mapping.aux_int);

    let mut out = datagram.to_vec();
    let (outer_header, outer_total) = bounds(&out);

    // Embedded source address: external view -> internal host
    {
        let mut inner = Ipv4Packet::new_unchecked(&mut out[embedded.start..embedded.end]);
        inner.set_src_addr(ip_int);
        inner.fill_checksum();
    }
    let (old_hi, old_lo) = addr_words(embedded.src);
    let (new_hi, new_lo) = addr_words(ip_int);
    match kind {
        NatKind::Tcp => {
            let old_port = read_u16(&out, transport);
            write_u16(&mut out, transport, aux_int);
            fixup_embedded_checksum(
                &mut out,
                transport + 16,
                embedded.end,
                &[(old_hi, new_hi), (old_lo, new_lo), (old_port, aux_int)],
            );
        }
        NatKind::Icmp => {
            let old_ident = read_u16(&out, transport + 4);
            write_u16(&mut out, transport + 4, aux_int);
            fixup_embedded_checksum(
                &mut out,
                transport + 2,
                embedded.end,
                &[(old_ident, aux_int)],
            );
        }
    }
    {
        let mut icmp = Icmpv4Packet::new_unchecked(&mut out[outer_header..outer_total]);
        icmp.fill_checksum();
    }
    // Outer destination: deliver to the internal host
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut out[..]);
        ip.set_dst_addr(ip_int);
        ip.fill_checksum();
    }
    NatVerdict::Forward(out)
}
