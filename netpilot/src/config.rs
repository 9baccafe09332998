// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the TOML configuration file, validating its
//! contents, and turning `[[connections]]` tables into
//! [`ConnectionSettings`].

use crate::connection::{ConnectionSettings, WifiMode, WifiSettings};
use crate::ip_config::{Address, IpMethod, IpSettings, Route};
use crate::types::{Config, ConnectionConfig, DeviceKind, IpFamily, IpSection};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.general.dhcp_timeout == 0 {
        anyhow::bail!("dhcp_timeout must be > 0");
    }

    if config.general.autoconnect_retries == 0 {
        anyhow::bail!("autoconnect_retries must be > 0");
    }

    if config.general.carrier_poll_secs == 0 {
        anyhow::bail!("carrier_poll_secs must be > 0");
    }

    for kind in config.priorities.keys() {
        kind.parse::<DeviceKind>()
            .map_err(|e| anyhow::anyhow!("Invalid priorities entry: {}", e))?;
    }

    let mut names = HashSet::new();
    for device in &config.devices {
        validate_interface_name(&device.name)?;
        if !names.insert(device.name.as_str()) {
            anyhow::bail!("Duplicate device '{}'", device.name);
        }
        device
            .kind
            .parse::<DeviceKind>()
            .map_err(|e| anyhow::anyhow!("Device {}: {}", device.name, e))?;
    }

    let mut uuids = HashSet::new();
    for conn in &config.connections {
        if !uuids.insert(conn.uuid.as_str()) {
            anyhow::bail!("Duplicate connection uuid '{}'", conn.uuid);
        }
        connection_settings(conn).with_context(|| format!("Invalid connection '{}'", conn.id))?;
    }

    Ok(())
}

/// Validates that an interface name is safe to pass to external commands.
/// Only allows alphanumeric characters, hyphens, underscores and dots.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Interface name cannot be empty");
    }

    if name.len() > 15 {
        anyhow::bail!("Interface name '{}' is longer than 15 characters", name);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        anyhow::bail!(
            "Interface name contains invalid characters: '{}'. Only alphanumeric, hyphens, underscores and dots are allowed",
            name
        );
    }

    Ok(())
}

/// Parse CIDR notation into (address, prefix length)
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .context("Invalid CIDR format (expected ADDRESS/PREFIX)")?;

    let ip: IpAddr = addr.parse().context("Invalid IP address")?;
    let prefix_len: u8 = prefix.parse().context("Invalid prefix length")?;

    let max = if ip.is_ipv4() { 32 } else { 128 };
    if prefix_len > max {
        anyhow::bail!("Prefix length must be <= {}", max);
    }

    Ok((ip, prefix_len))
}

fn parse_ip(family: IpFamily, s: &str) -> Result<IpAddr> {
    let ip: IpAddr = s
        .parse()
        .with_context(|| format!("Invalid IP address '{}'", s))?;
    check_family(family, &ip)?;
    Ok(ip)
}

fn check_family(family: IpFamily, ip: &IpAddr) -> Result<()> {
    let ok = match family {
        IpFamily::V4 => ip.is_ipv4(),
        IpFamily::V6 => ip.is_ipv6(),
    };
    anyhow::ensure!(ok, "{} is not an {} address", ip, family);
    Ok(())
}

fn ip_settings(family: IpFamily, section: Option<&IpSection>, slave: bool) -> Result<IpSettings> {
    let Some(section) = section else {
        let method = match (slave, family) {
            (false, _) => IpMethod::Auto,
            (true, IpFamily::V4) => IpMethod::Disabled,
            (true, IpFamily::V6) => IpMethod::Ignore,
        };
        return Ok(IpSettings::with_method(method));
    };

    let method = IpMethod::parse(family, &section.method)
        .with_context(|| format!("Unknown {} method '{}'", family, section.method))?;
    let mut settings = IpSettings::with_method(method);

    for entry in &section.addresses {
        let (ip, prefix) = parse_cidr(&entry.address)
            .with_context(|| format!("Invalid CIDR: {}", entry.address))?;
        check_family(family, &ip)?;
        let mut address = Address::new(ip, prefix);
        if let Some(gw) = &entry.gateway {
            address = address.with_gateway(parse_ip(family, gw)?);
        }
        settings.addresses.push(address);
    }

    if method == IpMethod::Manual && settings.addresses.is_empty() {
        anyhow::bail!("{} method 'manual' requires at least one address", family);
    }

    for ns in &section.dns {
        settings.nameservers.push(parse_ip(family, ns)?);
    }
    settings.searches = section.dns_search.clone();

    for entry in &section.routes {
        let (dest, prefix) =
            parse_cidr(&entry.dest).with_context(|| format!("Invalid CIDR: {}", entry.dest))?;
        check_family(family, &dest)?;
        let next_hop = entry
            .next_hop
            .as_deref()
            .map(|n| parse_ip(family, n))
            .transpose()?;
        settings.routes.push(Route {
            dest,
            prefix,
            next_hop,
            metric: entry.metric,
        });
    }

    settings.ignore_auto_dns = section.ignore_auto_dns;
    settings.ignore_auto_routes = section.ignore_auto_routes;
    settings.never_default = section.never_default;
    settings.may_fail = section.may_fail;
    Ok(settings)
}

/// Convert a `[[connections]]` table into a profile
pub fn connection_settings(conn: &ConnectionConfig) -> Result<ConnectionSettings> {
    if conn.id.is_empty() {
        anyhow::bail!("connection id cannot be empty");
    }
    if conn.uuid.is_empty() {
        anyhow::bail!("connection uuid cannot be empty");
    }

    let kind: DeviceKind = conn.kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    if let Some(iface) = &conn.interface {
        validate_interface_name(iface)?;
    }

    let slave_type = conn
        .slave_type
        .as_deref()
        .map(|s| s.parse::<DeviceKind>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()?;
    if slave_type.is_some() && conn.master.is_none() {
        anyhow::bail!("slave_type requires master");
    }

    let slave = conn.master.is_some();
    let ipv4 = ip_settings(IpFamily::V4, conn.ipv4.as_ref(), slave)?;
    let ipv6 = ip_settings(IpFamily::V6, conn.ipv6.as_ref(), slave)?;

    let wifi = match &conn.wifi {
        Some(w) => {
            let mode = match w.mode.as_str() {
                "infrastructure" => WifiMode::Infrastructure,
                "adhoc" => WifiMode::Adhoc,
                "ap" => WifiMode::Ap,
                other => anyhow::bail!("Unknown wifi mode '{}'", other),
            };
            if w.ssid.is_empty() || w.ssid.len() > 32 {
                anyhow::bail!("wifi ssid must be 1-32 bytes");
            }
            Some(WifiSettings {
                ssid: w.ssid.clone(),
                mode,
                security: w.security.clone(),
            })
        }
        None if kind == DeviceKind::Wifi => anyhow::bail!("wifi connection needs a [wifi] table"),
        None => None,
    };

    Ok(ConnectionSettings {
        id: conn.id.clone(),
        uuid: conn.uuid.clone(),
        kind,
        interface: conn.interface.clone(),
        autoconnect: conn.autoconnect,
        master: conn.master.clone(),
        slave_type,
        zone: conn.zone.clone(),
        permissions: conn.permissions.clone(),
        ipv4,
        ipv6,
        wifi,
    })
}
