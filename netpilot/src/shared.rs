//! NAT-mode ("shared") connection support
//!
//! Shared connections take a /24 out of `10.42.0.0/16`, masquerade it behind
//! whatever holds the default route, and serve DHCP/DNS on it with dnsmasq.
//!
//! The pool is one table per process. Leases are reference-counted and give
//! their block back when the last holder drops, so release happens exactly
//! once without manual bookkeeping.

use crate::ip_config::{Address, IpConfig};
use crate::types::IpFamily;
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::process::{Child, Command, Stdio};
use std::rc::Rc;

/// First address handed out: 10.42.0.1
const POOL_START: u32 = 0x0A2A_0001;
/// Blocks are /24s
const POOL_STEP: u32 = 0x100;
/// Offset of the last usable block (10.42.254.1)
const POOL_MAX_OFFSET: u32 = 0xFE00;
/// Prefix of each leased block
pub const SHARED_PREFIX: u8 = 24;

/// Process-wide allocator for shared-mode addresses
#[derive(Debug, Clone, Default)]
pub struct SharedAddressPool {
    inner: Rc<RefCell<BTreeSet<u32>>>,
}

impl SharedAddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest free block, or `None` when all 255 are in use
    pub fn lease(&self) -> Option<Rc<SharedLease>> {
        let mut used = self.inner.borrow_mut();
        let offset = (0..=POOL_MAX_OFFSET)
            .step_by(POOL_STEP as usize)
            .find(|offset| !used.contains(offset))?;
        used.insert(offset);

        let address = Ipv4Addr::from(POOL_START + offset);
        log::debug!("shared pool: leased {}/{}", address, SHARED_PREFIX);
        Some(Rc::new(SharedLease {
            pool: Rc::clone(&self.inner),
            offset,
            address,
        }))
    }

    /// Number of blocks currently leased
    pub fn in_use(&self) -> usize {
        self.inner.borrow().len()
    }
}

/// One leased /24 block
#[derive(Debug)]
pub struct SharedLease {
    pool: Rc<RefCell<BTreeSet<u32>>>,
    offset: u32,
    address: Ipv4Addr,
}

impl SharedLease {
    /// The gateway address of the block (x.x.x.1)
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Network address of the block
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & 0xFFFF_FF00)
    }

    /// IPv4 config describing the shared side of the interface
    pub fn ip_config(self: &Rc<Self>) -> IpConfig {
        let mut config = IpConfig::new(IpFamily::V4);
        config
            .addresses
            .push(Address::new(IpAddr::V4(self.address), SHARED_PREFIX));
        config.never_default = true;
        config.shared = Some(Rc::clone(self));
        config
    }
}

impl Drop for SharedLease {
    fn drop(&mut self) {
        self.pool.borrow_mut().remove(&self.offset);
        log::debug!("shared pool: released {}/{}", self.address, SHARED_PREFIX);
    }
}

/// A firewall rule installed for the lifetime of a shared activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRule {
    pub table: &'static str,
    pub rule: String,
}

/// iptables rules needed to NAT and serve a shared interface
pub fn share_rules(iface: &str, lease: &SharedLease) -> Vec<ShareRule> {
    let net = format!("{}/{}", lease.network(), SHARED_PREFIX);
    let filter = |rule: String| ShareRule {
        table: "filter",
        rule,
    };

    let mut rules = Vec::new();
    for (proto, port) in [("tcp", 53), ("udp", 53), ("tcp", 67), ("udp", 67)] {
        rules.push(filter(format!(
            "INPUT --in-interface {} --protocol {} --destination-port {} --jump ACCEPT",
            iface, proto, port
        )));
    }
    rules.push(filter(format!("FORWARD --in-interface {} --jump REJECT", iface)));
    rules.push(filter(format!("FORWARD --out-interface {} --jump REJECT", iface)));
    rules.push(filter(format!(
        "FORWARD --in-interface {0} --out-interface {0} --jump ACCEPT",
        iface
    )));
    rules.push(filter(format!(
        "FORWARD --source {} --in-interface {} --jump ACCEPT",
        net, iface
    )));
    rules.push(filter(format!(
        "FORWARD --destination {} --out-interface {} --match state --state ESTABLISHED,RELATED --jump ACCEPT",
        net, iface
    )));
    rules.push(ShareRule {
        table: "nat",
        rule: format!(
            "POSTROUTING --source {0} ! --destination {0} --jump MASQUERADE",
            net
        ),
    });
    rules
}

/// Installs share rules and runs the local DHCP/DNS server
pub trait SharingBackend {
    fn start(&mut self, iface: &str, config: &IpConfig, rules: &[ShareRule]) -> Result<()>;
    fn stop(&mut self, iface: &str, rules: &[ShareRule]);
}

/// iptables + dnsmasq implementation
#[derive(Default)]
pub struct DnsmasqSharing {
    servers: HashMap<String, Child>,
}

impl DnsmasqSharing {
    pub fn new() -> Self {
        Self::default()
    }

    fn iptables(action: &str, rule: &ShareRule) -> Result<()> {
        let mut args = vec!["--table", rule.table, action];
        args.extend(rule.rule.split_whitespace());
        let status = Command::new("iptables")
            .args(&args)
            .status()
            .context("Failed to execute iptables")?;
        anyhow::ensure!(status.success(), "iptables {} failed: {}", action, rule.rule);
        Ok(())
    }
}

impl SharingBackend for DnsmasqSharing {
    fn start(&mut self, iface: &str, config: &IpConfig, rules: &[ShareRule]) -> Result<()> {
        let lease = config
            .shared
            .as_ref()
            .context("Shared config carries no pooled address")?;

        std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
            .context("Failed to enable IPv4 forwarding")?;

        // Insert in reverse so the final chain order matches the list
        for rule in rules.iter().rev() {
            Self::iptables("--insert", rule)?;
        }

        let base = u32::from(lease.network());
        let first = Ipv4Addr::from(base + 10);
        let last = Ipv4Addr::from(base + 254);
        let child = Command::new("dnsmasq")
            .args([
                "--no-hosts",
                "--keep-in-foreground",
                "--bind-interfaces",
                "--except-interface=lo",
                "--strict-order",
                "--conf-file",
                &format!("--listen-address={}", lease.address()),
                &format!("--dhcp-range={},{},60m", first, last),
                &format!("--dhcp-option=option:router,{}", lease.address()),
                "--dhcp-lease-max=50",
                &format!("--pid-file=/run/netpilot/dnsmasq-{}.pid", iface),
            ])
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start dnsmasq on {}", iface))?;

        log::info!("({}): sharing {} via dnsmasq", iface, lease.network());
        self.servers.insert(iface.to_string(), child);
        Ok(())
    }

    fn stop(&mut self, iface: &str, rules: &[ShareRule]) {
        if let Some(mut child) = self.servers.remove(iface) {
            let _ = child.kill();
            let _ = child.wait();
        }
        for rule in rules {
            if let Err(e) = Self::iptables("--delete", rule) {
                log::warn!("({}): failed to remove share rule: {}", iface, e);
            }
        }
    }
}

impl Drop for DnsmasqSharing {
    fn drop(&mut self) {
        for (_, mut child) in self.servers.drain() {
            let _ = child.kill();
        }
    }
}
