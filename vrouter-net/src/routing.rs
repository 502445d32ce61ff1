//! LPM (Longest Prefix Match) routing table for packet forwarding.
//!
//! The transport supplies the table once per run as a list of rows; lookups
//! return the row with the most specific matching prefix. When the same
//! prefix is inserted twice the first row wins.

use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;
use std::net::Ipv4Addr;
use tracing::warn;

/// A single routing table row.
#[derive(Debug, Clone)]
pub struct Route {
    /// Destination prefix this row matches.
    pub prefix: Ipv4Net,
    /// Next-hop gateway; `0.0.0.0` marks a directly connected network.
    pub gateway: Ipv4Addr,
    /// Name of the egress interface.
    pub interface: String,
}

impl Route {
    pub fn new(prefix: Ipv4Net, gateway: Ipv4Addr, interface: impl Into<String>) -> Self {
        Self {
            prefix,
            gateway,
            interface: interface.into(),
        }
    }

    /// The address to resolve on the link for a datagram to `dst`.
    ///
    /// Directly connected routes carry no gateway, so the next hop is the
    /// destination itself.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.gateway.is_unspecified() {
            dst
        } else {
            self.gateway
        }
    }
}

/// Routing table with longest-prefix-match lookup.
#[derive(Clone)]
pub struct RoutingTable {
    routes: PrefixMap<Ipv4Net, Route>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            routes: PrefixMap::new(),
        }
    }

    pub fn from_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        let mut table = Self::new();
        for route in routes {
            table.add_route(route);
        }
        table
    }

    /// Insert a row. A duplicate prefix keeps the existing row.
    pub fn add_route(&mut self, route: Route) {
        if self.routes.get(&route.prefix).is_some() {
            warn!(prefix = %route.prefix, "Duplicate route prefix, keeping first row");
            return;
        }
        self.routes.insert(route.prefix, route);
    }

    /// Longest-prefix-match lookup.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&Route> {
        let host = Ipv4Net::new(addr, 32).ok()?;
        self.routes.get_lpm(&host).map(|(_, route)| route)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().map(|(_, route)| route)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.iter().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, gateway: [u8; 4], iface: &str) -> Route {
        Route::new(prefix.parse().unwrap(), Ipv4Addr::from(gateway), iface)
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RoutingTable::from_routes([
            route("10.0.0.0/8", [10, 0, 0, 1], "eth1"),
            route("10.1.0.0/16", [10, 1, 0, 1], "eth2"),
        ]);

        let hit = table.lookup(Ipv4Addr::new(10, 1, 2, 3)).unwrap();
        assert_eq!(hit.interface, "eth2");

        let hit = table.lookup(Ipv4Addr::new(10, 2, 3, 4)).unwrap();
        assert_eq!(hit.interface, "eth1");

        assert!(table.lookup(Ipv4Addr::new(192, 168, 1, 1)).is_none());
    }

    #[test]
    fn test_default_route() {
        let table = RoutingTable::from_routes([
            route("0.0.0.0/0", [172, 64, 3, 254], "eth2"),
            route("10.0.1.0/24", [0, 0, 0, 0], "eth1"),
        ]);

        let hit = table.lookup(Ipv4Addr::new(8, 8, 8, 8)).unwrap();
        assert_eq!(hit.interface, "eth2");

        let hit = table.lookup(Ipv4Addr::new(10, 0, 1, 77)).unwrap();
        assert_eq!(hit.interface, "eth1");
    }

    #[test]
    fn test_duplicate_prefix_keeps_first() {
        let table = RoutingTable::from_routes([
            route("10.0.0.0/24", [10, 0, 0, 1], "eth1"),
            route("10.0.0.0/24", [10, 0, 0, 2], "eth2"),
        ]);

        let hit = table.lookup(Ipv4Addr::new(10, 0, 0, 5)).unwrap();
        assert_eq!(hit.interface, "eth1");
        assert_eq!(hit.gateway, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_next_hop() {
        let direct = route("10.0.1.0/24", [0, 0, 0, 0], "eth1");
        assert_eq!(
            direct.next_hop(Ipv4Addr::new(10, 0, 1, 9)),
            Ipv4Addr::new(10, 0, 1, 9)
        );

        let via = route("0.0.0.0/0", [10, 0, 1, 1], "eth3");
        assert_eq!(
            via.next_hop(Ipv4Addr::new(8, 8, 8, 8)),
            Ipv4Addr::new(10, 0, 1, 1)
        );
    }
}
