//! Kernel-facing configuration
//!
//! The [`SystemConfigurator`] trait is the only path by which the core
//! touches interfaces, addresses, routes and the hostname. The iproute2
//! implementation shells out to `ip` synchronously, mirroring how the rest
//! of the daemon drives system tools, and only rewrites the parts a
//! [`ConfigDiff`] marks as changed.

use crate::ip_config::{ConfigDiff, IpConfig};
use crate::types::IpFamily;
use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;
use std::process::Command;

/// Why bringing a link up failed
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("firmware missing")]
    FirmwareMissing,
    #[error("{0}")]
    Failed(String),
}

/// Applies and removes kernel network state
pub trait SystemConfigurator {
    /// Apply `config`; `diff` says which parts differ from what is applied
    fn apply(
        &mut self,
        iface: &str,
        ifindex: u32,
        config: &IpConfig,
        priority: u32,
        diff: &ConfigDiff,
    ) -> bool;

    /// Remove every address and route of `family`
    fn flush(&mut self, iface: &str, ifindex: u32, family: IpFamily);

    fn link_up(&mut self, iface: &str) -> Result<(), LinkError>;

    fn link_down(&mut self, iface: &str);

    fn enslave(&mut self, master: &str, slave: &str) -> bool;

    fn release(&mut self, master: &str, slave: &str);

    /// Point the default route of `family` at `iface`
    fn replace_default_route(&mut self, iface: &str, family: IpFamily, gateway: Option<IpAddr>)
        -> bool;

    fn set_hostname(&mut self, hostname: &str) -> bool;
}

/// iproute2-backed configurator
#[derive(Debug, Default)]
pub struct IprouteConfigurator;

impl IprouteConfigurator {
    pub fn new() -> Self {
        Self
    }

    fn ip(family: Option<IpFamily>, args: &[&str]) -> Result<()> {
        let mut command = Command::new("ip");
        match family {
            Some(IpFamily::V4) => {
                command.arg("-4");
            }
            Some(IpFamily::V6) => {
                command.arg("-6");
            }
            None => {}
        }
        let output = command
            .args(args)
            .output()
            .context("Failed to execute ip")?;
        anyhow::ensure!(
            output.status.success(),
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(())
    }

    fn apply_inner(&self, iface: &str, config: &IpConfig, priority: u32, diff: &ConfigDiff) -> Result<()> {
        let family = Some(config.family);

        if diff.addresses {
            Self::ip(family, &["addr", "flush", "dev", iface, "scope", "global"])?;
            for addr in &config.addresses {
                let cidr = format!("{}/{}", addr.address, addr.prefix);
                Self::ip(family, &["addr", "add", &cidr, "dev", iface])?;
            }
        }

        if let (true, Some(mtu)) = (diff.mtu, config.mtu) {
            Self::ip(None, &["link", "set", "dev", iface, "mtu", &mtu.to_string()])?;
        }

        if diff.routes || diff.addresses {
            Self::ip(family, &["route", "flush", "dev", iface, "proto", "static"])?;
            for route in &config.routes {
                let dest = format!("{}/{}", route.dest, route.prefix);
                let metric = (route.metric.max(priority)).to_string();
                let mut args = vec!["route", "replace", dest.as_str()];
                let hop;
                if let Some(next_hop) = route.next_hop {
                    hop = next_hop.to_string();
                    args.extend(["via", hop.as_str()]);
                }
                args.extend(["dev", iface, "proto", "static", "metric", metric.as_str()]);
                Self::ip(family, &args)?;
            }
        }

        Ok(())
    }
}

impl SystemConfigurator for IprouteConfigurator {
    fn apply(
        &mut self,
        iface: &str,
        _ifindex: u32,
        config: &IpConfig,
        priority: u32,
        diff: &ConfigDiff,
    ) -> bool {
        if !diff.touches_kernel() {
            return true;
        }
        match self.apply_inner(iface, config, priority, diff) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("({}): failed to apply {} config: {:#}", iface, config.family, e);
                false
            }
        }
    }

    fn flush(&mut self, iface: &str, _ifindex: u32, family: IpFamily) {
        let family = Some(family);
        if let Err(e) = Self::ip(family, &["route", "flush", "dev", iface]) {
            log::debug!("({}): route flush: {}", iface, e);
        }
        if let Err(e) = Self::ip(family, &["addr", "flush", "dev", iface, "scope", "global"]) {
            log::debug!("({}): address flush: {}", iface, e);
        }
    }

    fn link_up(&mut self, iface: &str) -> Result<(), LinkError> {
        match Self::ip(None, &["link", "set", "dev", iface, "up"]) {
            Ok(()) => Ok(()),
            // ENOENT from the driver means it could not load its firmware
            Err(e) if format!("{}", e).contains("No such file or directory") => {
                Err(LinkError::FirmwareMissing)
            }
            Err(e) => Err(LinkError::Failed(format!("{:#}", e))),
        }
    }

    fn link_down(&mut self, iface: &str) {
        if let Err(e) = Self::ip(None, &["link", "set", "dev", iface, "down"]) {
            log::warn!("({}): failed to take link down: {}", iface, e);
        }
    }

    fn enslave(&mut self, master: &str, slave: &str) -> bool {
        // Ports must be down while being attached
        let result = Self::ip(None, &["link", "set", "dev", slave, "down"])
            .and_then(|_| Self::ip(None, &["link", "set", "dev", slave, "master", master]))
            .and_then(|_| Self::ip(None, &["link", "set", "dev", slave, "up"]));
        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("({}): failed to enslave to {}: {}", slave, master, e);
                false
            }
        }
    }

    fn release(&mut self, master: &str, slave: &str) {
        if let Err(e) = Self::ip(None, &["link", "set", "dev", slave, "nomaster"]) {
            log::warn!("({}): failed to release from {}: {}", slave, master, e);
        }
    }

    fn replace_default_route(
        &mut self,
        iface: &str,
        family: IpFamily,
        gateway: Option<IpAddr>,
    ) -> bool {
        let gw;
        let mut args = vec!["route", "replace", "default"];
        if let Some(gateway) = gateway {
            gw = gateway.to_string();
            args.extend(["via", gw.as_str()]);
        }
        args.extend(["dev", iface]);
        match Self::ip(Some(family), &args) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("({}): failed to set {} default route: {}", iface, family, e);
                false
            }
        }
    }

    fn set_hostname(&mut self, name: &str) -> bool {
        match hostname::set(name) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Couldn't set the system hostname to '{}': {}", name, e);
                false
            }
        }
    }
}

/// Hostname of the machine at process start, if it carries information
pub fn startup_hostname() -> Option<String> {
    let name = hostname::get().ok()?.into_string().ok()?;
    usable_hostname(&name).then_some(name)
}

/// Placeholder names left by distributions are not worth keeping
pub fn usable_hostname(name: &str) -> bool {
    !matches!(
        name,
        "" | "localhost" | "localhost.localdomain" | "(none)"
    )
}

/// Kernel index of `iface` from sysfs
pub fn read_ifindex(iface: &str) -> Result<u32> {
    let path = format!("/sys/class/net/{}/ifindex", iface);
    let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    text.trim()
        .parse()
        .with_context(|| format!("Invalid ifindex in {}", path))
}

/// Carrier flag from sysfs; `None` if the interface is down or gone
pub fn read_carrier(iface: &str) -> Option<bool> {
    let text = fs::read_to_string(format!("/sys/class/net/{}/carrier", iface)).ok()?;
    Some(text.trim() == "1")
}

/// Addresses currently configured on `iface`
pub fn interface_addresses(iface: &str) -> Result<Vec<IpAddr>> {
    let interfaces = if_addrs::get_if_addrs().context("Failed to get interface addresses")?;
    Ok(interfaces
        .into_iter()
        .filter(|i| i.name == iface)
        .map(|i| i.ip())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_hostname() {
        assert!(usable_hostname("workstation"));
        assert!(!usable_hostname(""));
        assert!(!usable_hostname("localhost"));
        assert!(!usable_hostname("localhost.localdomain"));
        assert!(!usable_hostname("(none)"));
    }

    #[test]
    fn test_loopback_addresses() {
        // lo exists in every network namespace
        let addrs = interface_addresses("lo").unwrap();
        assert!(addrs.iter().all(|a| a.is_loopback()));
    }

    #[test]
    fn test_missing_interface() {
        assert!(read_ifindex("does-not-exist0").is_err());
        assert_eq!(read_carrier("does-not-exist0"), None);
    }
}
