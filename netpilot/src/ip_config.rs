// Per-family IP configuration and static-override merge

//! IP configuration model
//!
//! An [`IpConfig`] is what a transport hands back for one family and what the
//! system configurator applies. [`IpSettings`] is the static side coming
//! from a connection profile. [`merge`] folds the latter into the former and
//! [`IpConfig::diff`] tells the configurator which parts actually changed.

use crate::shared::SharedLease;
use crate::types::IpFamily;
use std::net::IpAddr;
use std::rc::Rc;

/// How a family acquires its addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpMethod {
    /// DHCPv4, or SLAAC with optional DHCPv6 for IPv6
    Auto,
    /// DHCPv6 only
    Dhcp,
    /// IPv4LL (autoip) or kernel IPv6 link-local
    LinkLocal,
    Manual,
    /// NAT mode with a pooled address and local DHCP/DNS
    Shared,
    /// IPv4 off
    Disabled,
    /// IPv6 off
    Ignore,
}

impl IpMethod {
    /// Parse a method name valid for the given family
    pub fn parse(family: IpFamily, s: &str) -> Option<IpMethod> {
        match (family, s) {
            (_, "auto") => Some(IpMethod::Auto),
            (_, "link-local") => Some(IpMethod::LinkLocal),
            (_, "manual") => Some(IpMethod::Manual),
            (IpFamily::V4, "shared") => Some(IpMethod::Shared),
            (IpFamily::V4, "disabled") => Some(IpMethod::Disabled),
            (IpFamily::V6, "dhcp") => Some(IpMethod::Dhcp),
            (IpFamily::V6, "ignore") => Some(IpMethod::Ignore),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpMethod::Auto => "auto",
            IpMethod::Dhcp => "dhcp",
            IpMethod::LinkLocal => "link-local",
            IpMethod::Manual => "manual",
            IpMethod::Shared => "shared",
            IpMethod::Disabled => "disabled",
            IpMethod::Ignore => "ignore",
        }
    }

    /// Methods that never produce a config for their family
    pub fn is_off(&self) -> bool {
        matches!(self, IpMethod::Disabled | IpMethod::Ignore)
    }
}

/// An interface address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub address: IpAddr,
    pub prefix: u8,
    pub gateway: Option<IpAddr>,
}

impl Address {
    pub fn new(address: IpAddr, prefix: u8) -> Self {
        Self {
            address,
            prefix,
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// A gateway that can carry a default route (present and not unspecified)
    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some_and(|g| !g.is_unspecified())
    }
}

/// A static or transport-supplied route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dest: IpAddr,
    pub prefix: u8,
    pub next_hop: Option<IpAddr>,
    pub metric: u32,
}

impl Route {
    /// Routes are identified by destination, prefix and next hop; metric may change
    fn same_route(&self, other: &Route) -> bool {
        self.dest == other.dest && self.prefix == other.prefix && self.next_hop == other.next_hop
    }
}

/// Which parts of a config differ from the currently applied one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub addresses: bool,
    pub nameservers: bool,
    pub domains: bool,
    pub searches: bool,
    pub routes: bool,
    pub mtu: bool,
    pub never_default: bool,
}

impl ConfigDiff {
    /// Everything differs (first apply)
    pub fn all() -> Self {
        Self {
            addresses: true,
            nameservers: true,
            domains: true,
            searches: true,
            routes: true,
            mtu: true,
            never_default: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigDiff::default()
    }

    /// True if the kernel-visible part (addresses, routes, mtu) changed
    pub fn touches_kernel(&self) -> bool {
        self.addresses || self.routes || self.mtu
    }
}

/// Resolved configuration of one address family on one interface
#[derive(Debug, Clone)]
pub struct IpConfig {
    pub family: IpFamily,
    pub addresses: Vec<Address>,
    pub nameservers: Vec<IpAddr>,
    pub domains: Vec<String>,
    pub searches: Vec<String>,
    pub routes: Vec<Route>,
    pub mtu: Option<u32>,
    pub never_default: bool,
    /// Pooled NAT-mode address; released when the last clone drops
    pub shared: Option<Rc<SharedLease>>,
}

impl IpConfig {
    pub fn new(family: IpFamily) -> Self {
        Self {
            family,
            addresses: Vec::new(),
            nameservers: Vec::new(),
            domains: Vec::new(),
            searches: Vec::new(),
            routes: Vec::new(),
            mtu: None,
            never_default: false,
            shared: None,
        }
    }

    /// First address carrying a usable gateway
    pub fn gateway(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|a| a.has_gateway())
            .and_then(|a| a.gateway)
    }

    /// True if every address is link-local (169.254/16 or fe80::/10)
    pub fn is_link_local_only(&self) -> bool {
        !self.addresses.is_empty() && self.addresses.iter().all(|a| is_link_local(&a.address))
    }

    /// Compare against the currently applied config
    pub fn diff(&self, other: &IpConfig) -> ConfigDiff {
        ConfigDiff {
            addresses: self.addresses != other.addresses,
            nameservers: self.nameservers != other.nameservers,
            domains: self.domains != other.domains,
            searches: self.searches != other.searches,
            routes: self.routes != other.routes,
            mtu: self.mtu != other.mtu,
            never_default: self.never_default != other.never_default,
        }
    }
}

/// Static per-family settings from a connection profile
#[derive(Debug, Clone, PartialEq)]
pub struct IpSettings {
    pub method: IpMethod,
    pub addresses: Vec<Address>,
    pub nameservers: Vec<IpAddr>,
    pub searches: Vec<String>,
    pub routes: Vec<Route>,
    pub ignore_auto_dns: bool,
    pub ignore_auto_routes: bool,
    pub never_default: bool,
    /// Timeout of this family alone does not fail the activation
    pub may_fail: bool,
}

impl IpSettings {
    pub fn with_method(method: IpMethod) -> Self {
        Self {
            method,
            addresses: Vec::new(),
            nameservers: Vec::new(),
            searches: Vec::new(),
            routes: Vec::new(),
            ignore_auto_dns: false,
            ignore_auto_routes: false,
            never_default: false,
            may_fail: true,
        }
    }
}

/// Fold a connection's static settings into a transport-supplied config
///
/// Applying the same settings twice yields the same result as applying them
/// once: duplicates are suppressed and matching entries replaced in place.
pub fn merge(config: &mut IpConfig, settings: &IpSettings) {
    if settings.ignore_auto_dns {
        config.nameservers.clear();
        config.domains.clear();
        config.searches.clear();
    }

    if settings.ignore_auto_routes {
        config.routes.clear();
    }

    for ns in &settings.nameservers {
        if !config.nameservers.contains(ns) {
            config.nameservers.push(*ns);
        }
    }

    for search in &settings.searches {
        if !config.searches.contains(search) {
            config.searches.push(search.clone());
        }
    }

    for addr in &settings.addresses {
        match config
            .addresses
            .iter_mut()
            .find(|a| a.address == addr.address)
        {
            Some(existing) => *existing = *addr,
            None => config.addresses.push(*addr),
        }
    }

    for route in &settings.routes {
        match config.routes.iter_mut().find(|r| r.same_route(route)) {
            Some(existing) => *existing = *route,
            None => config.routes.push(*route),
        }
    }

    // Sticky: either side may forbid the default route
    if settings.never_default {
        config.never_default = true;
    }
}

fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
