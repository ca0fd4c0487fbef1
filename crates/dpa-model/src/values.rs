use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Closed set of configuration payloads the agent knows how to realize.
///
/// Descriptors are compiled against the concrete variant they own and treat a
/// foreign variant as an invalid value; the scheduler itself never looks
/// inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConfigValue {
    Interface(Interface),
    Route(Route),
    ArpEntry(ArpEntry),
    NatRule(NatRule),
    BridgeDomain(BridgeDomain),
    /// Empty marker carried by derived property values, e.g. "interface X is
    /// up". Exists only so other values can depend on the property.
    Property,
}

impl ConfigValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigValue::Interface(_) => "interface",
            ConfigValue::Route(_) => "route",
            ConfigValue::ArpEntry(_) => "arp-entry",
            ConfigValue::NatRule(_) => "nat-rule",
            ConfigValue::BridgeDomain(_) => "bridge-domain",
            ConfigValue::Property => "property",
        }
    }

    pub fn is_property(&self) -> bool {
        matches!(self, ConfigValue::Property)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Tap,
    Veth,
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub kind: InterfaceKind,
    pub enabled: bool,
    /// Physical (MAC) address; compare with [`mac_eq`], the textual form is
    /// not canonical.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phys_address: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Network namespace the interface lives in; `None` means the default
    /// namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_if_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteScope {
    #[default]
    Global,
    Link,
    Host,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst_network: String,
    pub out_interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
    #[serde(default)]
    pub scope: RouteScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub interface: String,
    pub ip_address: String,
    pub hw_address: String,
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatRule {
    pub label: String,
    pub interface: String,
    pub external_ip: String,
    pub local_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeDomain {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub learn: bool,
    #[serde(default)]
    pub forward: bool,
}

/// Opaque, descriptor-owned runtime data produced by Create/Update and needed
/// by Update/Delete and by dependent descriptors (through the read-only
/// metadata maps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Metadata {
    Interface(InterfaceMeta),
    BridgeDomain(BridgeDomainMeta),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceMeta {
    /// Index assigned by the backend dataplane.
    pub sw_if_index: u32,
    /// Kernel ifindex, when the interface is visible to the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_if_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeDomainMeta {
    pub index: u32,
}

/// One declared or derived key-value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub key: Key,
    pub value: ConfigValue,
}

impl KeyValuePair {
    pub fn new(key: Key, value: ConfigValue) -> Self {
        Self { key, value }
    }
}

/// Case-insensitive MAC address comparison; `aa:bb:cc:00:11:22` and
/// `AA:BB:CC:00:11:22` describe the same address.
pub fn mac_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
