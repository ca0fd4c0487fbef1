//! Builders and parsers for the well-known key templates.
//!
//! The scheduler never interprets these; they exist so that descriptors and
//! northbound clients agree on the key space.

use crate::key::{Key, KeyError};

pub const INTERFACE_KEY_PREFIX: &str = "config/interface/";
pub const ROUTE_KEY_PREFIX: &str = "config/route/";
pub const ARP_KEY_PREFIX: &str = "config/arp/";
pub const NAT_KEY_PREFIX: &str = "config/nat/rule/";
pub const BRIDGE_DOMAIN_KEY_PREFIX: &str = "config/bridge-domain/";

/// Prefix of derived interface link-state property keys.
pub const INTERFACE_STATE_KEY_PREFIX: &str = "state/interface/";
/// Prefix of derived interface address property keys.
pub const INTERFACE_ADDRESS_KEY_PREFIX: &str = "derived/interface-address/";

pub fn interface_key(name: &str) -> Result<Key, KeyError> {
    Key::new(format!("{INTERFACE_KEY_PREFIX}{name}"))
}

/// Route keys embed the outgoing interface and the destination network,
/// e.g. `config/route/tap0/dest/10.0.0.0/24`.
pub fn route_key(out_interface: &str, dst_network: &str) -> Result<Key, KeyError> {
    Key::new(format!("{ROUTE_KEY_PREFIX}{out_interface}/dest/{dst_network}"))
}

pub fn arp_entry_key(interface: &str, ip_address: &str) -> Result<Key, KeyError> {
    Key::new(format!("{ARP_KEY_PREFIX}{interface}/{ip_address}"))
}

pub fn nat_rule_key(label: &str) -> Result<Key, KeyError> {
    Key::new(format!("{NAT_KEY_PREFIX}{label}"))
}

pub fn bridge_domain_key(name: &str) -> Result<Key, KeyError> {
    Key::new(format!("{BRIDGE_DOMAIN_KEY_PREFIX}{name}"))
}

/// Derived property key announcing the link state of an interface. Other
/// values depend on `interface_state_key(name, true)` to wait until the
/// interface is administratively up.
pub fn interface_state_key(name: &str, up: bool) -> Result<Key, KeyError> {
    let state = if up { "UP" } else { "DOWN" };
    Key::new(format!("{INTERFACE_STATE_KEY_PREFIX}{name}/{state}"))
}

/// Derived property key for one IP address assigned to an interface.
pub fn interface_address_key(name: &str, address: &str) -> Result<Key, KeyError> {
    Key::new(format!("{INTERFACE_ADDRESS_KEY_PREFIX}{name}/{address}"))
}

pub fn parse_interface_key(key: &Key) -> Option<&str> {
    let name = key.as_str().strip_prefix(INTERFACE_KEY_PREFIX)?;
    (!name.is_empty() && !name.contains('/')).then_some(name)
}

/// Returns `(out_interface, dst_network)` for a route key.
pub fn parse_route_key(key: &Key) -> Option<(&str, &str)> {
    let rest = key.as_str().strip_prefix(ROUTE_KEY_PREFIX)?;
    let (iface, dst) = rest.split_once("/dest/")?;
    (!iface.is_empty() && !dst.is_empty()).then_some((iface, dst))
}

/// Returns `(interface, up)` for a derived link-state key.
pub fn parse_interface_state_key(key: &Key) -> Option<(&str, bool)> {
    let rest = key.as_str().strip_prefix(INTERFACE_STATE_KEY_PREFIX)?;
    let (name, state) = rest.rsplit_once('/')?;
    match state {
        "UP" => Some((name, true)),
        "DOWN" => Some((name, false)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_key_round_trip() {
        let key = interface_key("tap0").unwrap();
        assert_eq!(key.as_str(), "config/interface/tap0");
        assert_eq!(parse_interface_key(&key), Some("tap0"));
    }

    #[test]
    fn route_key_keeps_cidr_suffix() {
        let key = route_key("tap0", "10.0.0.0/24").unwrap();
        assert_eq!(parse_route_key(&key), Some(("tap0", "10.0.0.0/24")));
    }

    #[test]
    fn state_key_encodes_direction() {
        let up = interface_state_key("veth1", true).unwrap();
        assert_eq!(parse_interface_state_key(&up), Some(("veth1", true)));
        let down = interface_state_key("veth1", false).unwrap();
        assert_eq!(parse_interface_state_key(&down), Some(("veth1", false)));
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        let key = interface_key("tap0").unwrap();
        assert_eq!(parse_route_key(&key), None);
        assert_eq!(parse_interface_state_key(&key), None);
    }

    #[test]
    fn remaining_builders_use_their_prefixes() {
        assert_eq!(
            arp_entry_key("tap0", "10.0.0.2").unwrap().as_str(),
            "config/arp/tap0/10.0.0.2"
        );
        assert_eq!(
            nat_rule_key("dnat-1").unwrap().as_str(),
            "config/nat/rule/dnat-1"
        );
        assert_eq!(
            bridge_domain_key("bd1").unwrap().as_str(),
            "config/bridge-domain/bd1"
        );
        assert_eq!(
            interface_address_key("tap0", "10.0.0.1/24").unwrap().as_str(),
            "derived/interface-address/tap0/10.0.0.1/24"
        );
    }
}
