//! ICMPv4 echo replies and error generation.
//!
//! Echo replies mirror the request's identifier, sequence number and payload
//! verbatim. Error packets (destination-unreachable, time-exceeded) quote
//! the offending datagram's IP header plus the first 8 payload bytes; the
//! quote is copied byte-exact so the sender can match the error to its flow
//! by the original header fields.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr};
use std::net::Ipv4Addr;

/// TTL of self-generated datagrams.
pub const GENERATED_TTL: u8 = 64;

/// Bytes of the offending datagram quoted in an error packet.
pub const ERROR_QUOTE_LEN: usize = 28;

/// ICMP errors the router generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpErrorKind {
    /// Type 3 code 0: no route, or route egresses the ingress interface.
    NetUnreachable,
    /// Type 3 code 1: ARP resolution exhausted.
    HostUnreachable,
    /// Type 3 code 3: closed port on the router, or NAT rejection.
    PortUnreachable,
    /// Type 11 code 0: TTL expired in transit.
    TimeExceeded,
}

impl IcmpErrorKind {
    fn message(self) -> (Icmpv4Message, u8) {
        match self {
            IcmpErrorKind::NetUnreachable => (Icmpv4Message::DstUnreachable, 0),
            IcmpErrorKind::HostUnreachable => (Icmpv4Message::DstUnreachable, 1),
            IcmpErrorKind::PortUnreachable => (Icmpv4Message::DstUnreachable, 3),
            IcmpErrorKind::TimeExceeded => (Icmpv4Message::TimeExceeded, 0),
        }
    }
}

/// Build an echo-reply datagram (IP level, no Ethernet header).
pub fn build_echo_reply(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
    ip_ident: u16,
) -> Vec<u8> {
    let caps = ChecksumCapabilities::default();
    let icmp_repr = Icmpv4Repr::EchoReply {
        ident,
        seq_no,
        data,
    };
    let ipv4_repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: GENERATED_TTL,
    };

    let mut buffer = vec![0u8; ipv4_repr.buffer_len() + icmp_repr.buffer_len()];
    let mut ipv4_packet = Ipv4Packet::new_unchecked(&mut buffer);
    ipv4_repr.emit(&mut ipv4_packet, &caps);

    let mut icmp_packet = Icmpv4Packet::new_unchecked(ipv4_packet.payload_mut());
    icmp_repr.emit(&mut icmp_packet, &caps);

    ipv4_packet.set_ident(ip_ident);
    ipv4_packet.set_dont_frag(true);
    ipv4_packet.fill_checksum();

    buffer
}

/// Build an error datagram quoting `original` (IP level, no Ethernet header).
///
/// `dst` is the original sender; `src` is the address of the interface the
/// route toward that sender selects.
pub fn build_error(
    kind: IcmpErrorKind,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    original: &[u8],
    ip_ident: u16,
) -> Vec<u8> {
    let caps = ChecksumCapabilities::default();
    let (msg_type, msg_code) = kind.message();

    // Fixed header (8 bytes) plus the zero-padded quote.
    let mut icmp_buf = vec![0u8; 8 + ERROR_QUOTE_LEN];
    let quote_len = original.len().min(ERROR_QUOTE_LEN);
    icmp_buf[8..8 + quote_len].copy_from_slice(&original[..quote_len]);
    {
        let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut icmp_buf);
        icmp_packet.set_msg_type(msg_type);
        icmp_packet.set_msg_code(msg_code);
        icmp_packet.fill_checksum();
    }

    let ipv4_repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_buf.len(),
        hop_limit: GENERATED_TTL,
    };

    let mut buffer = vec![0u8; ipv4_repr.buffer_len() + icmp_buf.len()];
    let mut ipv4_packet = Ipv4Packet::new_unchecked(&mut buffer);
    ipv4_repr.emit(&mut ipv4_packet, &caps);
    ipv4_packet.payload_mut().copy_from_slice(&icmp_buf);
    ipv4_packet.set_ident(ip_ident);
    ipv4_packet.set_dont_frag(true);
    ipv4_packet.fill_checksum();

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked_views(datagram: &[u8]) -> (Ipv4Packet<&[u8]>, Icmpv4Packet<&[u8]>) {
        let ip = Ipv4Packet::new_checked(datagram).unwrap();
        assert!(ip.verify_checksum());
        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert!(icmp.verify_checksum());
        (Ipv4Packet::new_checked(datagram).unwrap(), icmp)
    }

    #[test]
    fn test_echo_reply_copies_fields() {
        let reply = build_echo_reply(
            Ipv4Addr::new(10, 0, 1, 11),
            Ipv4Addr::new(64, 121, 20, 36),
            0x4242,
            7,
            b"payload bytes",
            123,
        );

        let (ip, icmp) = checked_views(&reply);
        assert_eq!(ip.src_addr(), Ipv4Addr::new(10, 0, 1, 11));
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(64, 121, 20, 36));
        assert_eq!(ip.hop_limit(), GENERATED_TTL);
        assert!(ip.dont_frag());
        assert_eq!(ip.ident(), 123);

        assert_eq!(icmp.msg_type(), Icmpv4Message::EchoReply);
        assert_eq!(icmp.echo_ident(), 0x4242);
        assert_eq!(icmp.echo_seq_no(), 7);
        assert_eq!(icmp.data(), b"payload bytes");
    }

    #[test]
    fn test_error_quotes_original() {
        // 20-byte header plus 12 bytes of payload
        let mut original = vec![0u8; 32];
        original[0] = 0x45;
        for (i, byte) in original.iter_mut().enumerate().skip(20) {
            *byte = i as u8;
        }

        let error = build_error(
            IcmpErrorKind::TimeExceeded,
            Ipv4Addr::new(10, 0, 1, 11),
            Ipv4Addr::new(1, 2, 3, 4),
            &original,
            9,
        );

        let (ip, icmp) = checked_views(&error);
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(icmp.msg_type(), Icmpv4Message::TimeExceeded);
        assert_eq!(icmp.msg_code(), 0);
        // Quote: original header plus first 8 payload bytes
        assert_eq!(icmp.data(), &original[..28]);
    }

    #[test]
    fn test_error_pads_short_original() {
        let original = [0x45u8; 20];
        let error = build_error(
            IcmpErrorKind::HostUnreachable,
            Ipv4Addr::new(10, 0, 1, 11),
            Ipv4Addr::new(1, 2, 3, 4),
            &original,
            0,
        );

        let (_, icmp) = checked_views(&error);
        assert_eq!(icmp.msg_code(), 1);
        assert_eq!(icmp.data().len(), ERROR_QUOTE_LEN);
        assert_eq!(&icmp.data()[..20], &original[..]);
        assert_eq!(&icmp.data()[20..], &[0u8; 8][..]);
    }

    #[test]
    fn test_port_unreachable_codes() {
        let original = [0x45u8; 28];
        let error = build_error(
            IcmpErrorKind::PortUnreachable,
            Ipv4Addr::new(172, 64, 3, 1),
            Ipv4Addr::new(203, 0, 113, 7),
            &original,
            0,
        );
        let (_, icmp) = checked_views(&error);
        assert_eq!(icmp.msg_type(), Icmpv4Message::DstUnreachable);
        assert_eq!(icmp.msg_code(), 3);
    }
}
