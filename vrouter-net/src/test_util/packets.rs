//! Packet building utilities for tests
//!
//! Functions to construct the Ethernet frames and IP datagrams the test
//! suites deliver to the router, plus parse-back helpers for assertions.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpAddress, IpProtocol, Ipv4Packet,
    Ipv4Repr, TcpPacket, TcpSeqNumber,
};
use std::net::Ipv4Addr;

/// Build a raw Ethernet frame
pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress(src),
        dst_addr: EthernetAddress(dst),
        ethertype: EthernetProtocol::from(ethertype),
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

/// Build a broadcast ARP request frame
pub fn arp_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(sender_mac),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target_ip,
    };

    let mut payload = vec![0u8; arp_repr.buffer_len()];
    let mut packet = ArpPacket::new_unchecked(&mut payload);
    arp_repr.emit(&mut packet);

    ethernet_frame(
        EthernetAddress::BROADCAST.0,
        sender_mac,
        EthernetProtocol::Arp.into(),
        &payload,
    )
}

/// Build an ARP reply frame addressed to `target`
pub fn arp_reply(
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: EthernetAddress(sender_mac),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress(target_mac),
        target_protocol_addr: target_ip,
    };

    let mut payload = vec![0u8; arp_repr.buffer_len()];
    let mut packet = ArpPacket::new_unchecked(&mut payload);
    arp_repr.emit(&mut packet);

    ethernet_frame(
        target_mac,
        sender_mac,
        EthernetProtocol::Arp.into(),
        &payload,
    )
}

/// Parsed ARP reply
#[derive(Debug, Clone)]
pub struct ArpReply {
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

/// Parse an ARP reply from an Ethernet frame
pub fn parse_arp_reply(frame: &[u8]) -> Option<ArpReply> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }

    let arp = ArpPacket::new_checked(eth.payload()).ok()?;
    match ArpRepr::parse(&arp).ok()? {
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } => Some(ArpReply {
            sender_mac: source_hardware_addr.0,
            sender_ip: source_protocol_addr,
            target_mac: target_hardware_addr.0,
            target_ip: target_protocol_addr,
        }),
        _ => None,
    }
}

/// Parsed ARP request
#[derive(Debug, Clone)]
pub struct ArpRequest {
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
}

/// Parse an ARP request from an Ethernet frame
pub fn parse_arp_request(frame: &[u8]) -> Option<ArpRequest> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }

    let arp = ArpPacket::new_checked(eth.payload()).ok()?;
    match ArpRepr::parse(&arp).ok()? {
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } => Some(ArpRequest {
            sender_mac: source_hardware_addr.0,
            sender_ip: source_protocol_addr,
            target_ip: target_protocol_addr,
        }),
        _ => None,
    }
}

/// Wrap a transport payload in an IPv4 header
pub fn ipv4_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    ttl: u8,
    payload: &[u8],
) -> Vec<u8> {
    let repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: protocol,
        payload_len: payload.len(),
        hop_limit: ttl,
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut packet = Ipv4Packet::new_unchecked(&mut buffer);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    packet.payload_mut().copy_from_slice(payload);
    packet.fill_checksum();
    buffer
}

/// Build an ICMP echo request or reply datagram
pub fn icmp_echo_datagram(
    request: bool,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
    ttl: u8,
) -> Vec<u8> {
    let icmp_repr = if request {
        Icmpv4Repr::EchoRequest {
            ident,
            seq_no,
            data,
        }
    } else {
        Icmpv4Repr::EchoReply {
            ident,
            seq_no,
            data,
        }
    };

    let mut icmp_buf = vec![0u8; icmp_repr.buffer_len()];
    let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut icmp_buf);
    icmp_repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());

    ipv4_datagram(src, dst, IpProtocol::Icmp, ttl, &icmp_buf)
}

/// Build a minimal TCP datagram with the given control flags
pub fn tcp_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    syn: bool,
    fin: bool,
    ttl: u8,
) -> Vec<u8> {
    let mut segment = vec![0u8; 20];
    {
        let mut tcp = TcpPacket::new_unchecked(&mut segment);
        tcp.set_src_port(src_port);
        tcp.set_dst_port(dst_port);
        tcp.set_seq_number(TcpSeqNumber(1000));
        tcp.set_ack_number(TcpSeqNumber(0));
        tcp.set_header_len(20);
        tcp.set_window_len(64240);
        tcp.set_syn(syn);
        tcp.set_fin(fin);
        tcp.set_ack(!syn);
        tcp.fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst));
    }
    ipv4_datagram(src, dst, IpProtocol::Tcp, ttl, &segment)
}

/// Build an ICMP error datagram quoting `quote`
pub fn icmp_error_datagram(
    msg_type: Icmpv4Message,
    msg_code: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    quote: &[u8],
    ttl: u8,
) -> Vec<u8> {
    let mut icmp_buf = vec![0u8; 8 + quote.len()];
    icmp_buf[8..].copy_from_slice(quote);
    {
        let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut icmp_buf);
        icmp_packet.set_msg_type(msg_type);
        icmp_packet.set_msg_code(msg_code);
        icmp_packet.fill_checksum();
    }
    ipv4_datagram(src, dst, IpProtocol::Icmp, ttl, &icmp_buf)
}
