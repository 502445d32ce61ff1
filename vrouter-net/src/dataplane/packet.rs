//! Packet parsing and building using smoltcp
//!
//! This module provides utilities for parsing and building Ethernet frames
//! and ARP packets. IPv4/ICMP/TCP manipulation happens in place through
//! smoltcp views and lives with the handlers that own it.

use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr,
};
use std::net::Ipv4Addr;

/// Ethernet header size
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// ARP packet size (for Ethernet + IPv4)
pub const ARP_PACKET_SIZE: usize = 28;

/// Parse an Ethernet frame
pub fn parse_ethernet(data: &[u8]) -> Option<EthernetFrame<&[u8]>> {
    EthernetFrame::new_checked(data).ok()
}

/// Build an Ethernet frame with the given payload
pub fn build_ethernet_frame(
    dst_mac: EthernetAddress,
    src_mac: EthernetAddress,
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype,
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

/// Parse an ARP packet from Ethernet payload
pub fn parse_arp(data: &[u8]) -> Option<ArpRepr> {
    let packet = ArpPacket::new_checked(data).ok()?;
    ArpRepr::parse(&packet).ok()
}

/// Build a broadcast ARP request frame asking for `target_ip`.
pub fn build_arp_request_frame(
    src_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: src_mac,
        source_protocol_addr: src_ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target_ip,
    };

    let mut payload = vec![0u8; arp_repr.buffer_len()];
    let mut packet = ArpPacket::new_unchecked(&mut payload);
    arp_repr.emit(&mut packet);

    build_ethernet_frame(
        EthernetAddress::BROADCAST,
        src_mac,
        EthernetProtocol::Arp,
        &payload,
    )
}

/// Build a complete ARP reply Ethernet frame
pub fn build_arp_reply_frame(
    src_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_mac: EthernetAddress,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: src_mac,
        source_protocol_addr: sender_ip,
        target_hardware_addr: target_mac,
        target_protocol_addr: target_ip,
    };

    let mut payload = vec![0u8; arp_repr.buffer_len()];
    let mut packet = ArpPacket::new_unchecked(&mut payload);
    arp_repr.emit(&mut packet);

    build_ethernet_frame(target_mac, src_mac, EthernetProtocol::Arp, &payload)
}
