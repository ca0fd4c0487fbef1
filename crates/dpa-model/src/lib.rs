//! Key space and configuration value model shared by the scheduler and descriptors.

mod key;
pub mod keys;
mod values;

pub use key::{Key, KeyError};
pub use values::{
    ArpEntry, BridgeDomain, BridgeDomainMeta, ConfigValue, Interface, InterfaceKind,
    InterfaceMeta, KeyValuePair, Metadata, NatRule, Route, RouteScope, mac_eq,
};
