//! Data plane: the packet-processing pipeline
//!
//! Architecture:
//! - The transport drives [`router::Router::handle_frame`] synchronously
//!   with raw Ethernet frames and receives emitted frames via a
//!   [`router::FrameSink`]
//! - ARP terminates at each interface; misses queue frames behind a
//!   per-address request with a 1 s retry timer
//! - IPv4 transit traffic goes through validation, TTL handling and LPM
//!   routing; with NAT enabled the translator rewrites flows between the
//!   internal interface and the external networks
//! - Two timer threads (ARP retry, NAT expiry) share state with the
//!   ingress worker through per-table mutexes

pub mod arp;
pub mod icmp;
pub mod interface;
pub mod nat;
pub mod packet;
pub mod router;

pub use interface::{Interface, InterfaceTable};
pub use router::{ChannelSink, EmittedFrame, FrameSink, Router, RouterError, SinkError};
