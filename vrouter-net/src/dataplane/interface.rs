//! Router interface table.
//!
//! Interfaces are created once at startup from the transport's interface
//! list and never change afterwards, so the table is plain owned data that
//! the router shares immutably across its threads.

use smoltcp::wire::EthernetAddress;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Longest accepted interface name, in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// A single router interface.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub mac: EthernetAddress,
    pub addr: Ipv4Addr,
}

impl Interface {
    pub fn new(name: impl Into<String>, mac: [u8; 6], addr: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            mac: EthernetAddress(mac),
            addr,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("interface list is empty")]
    Empty,
    #[error("interface name `{0}` exceeds {MAX_NAME_LEN} bytes")]
    NameTooLong(String),
    #[error("duplicate interface name `{0}`")]
    DuplicateName(String),
}

/// Ordered list of the router's interfaces.
#[derive(Debug, Clone)]
pub struct InterfaceTable {
    interfaces: Vec<Interface>,
}

impl InterfaceTable {
    pub fn new(interfaces: Vec<Interface>) -> Result<Self, InterfaceError> {
        if interfaces.is_empty() {
            return Err(InterfaceError::Empty);
        }
        for (i, iface) in interfaces.iter().enumerate() {
            if iface.name.len() > MAX_NAME_LEN {
                return Err(InterfaceError::NameTooLong(iface.name.clone()));
            }
            if interfaces[..i].iter().any(|other| other.name == iface.name) {
                return Err(InterfaceError::DuplicateName(iface.name.clone()));
            }
        }
        Ok(Self { interfaces })
    }

    pub fn by_name(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|iface| iface.name == name)
    }

    pub fn by_addr(&self, addr: Ipv4Addr) -> Option<&Interface> {
        self.interfaces.iter().find(|iface| iface.addr == addr)
    }

    /// Whether `addr` is one of the router's own addresses.
    pub fn owns_addr(&self, addr: Ipv4Addr) -> bool {
        self.by_addr(addr).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter()
    }
}
