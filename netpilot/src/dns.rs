//! DNS resolver management
//!
//! Each committed IP config is registered per interface with a priority
//! class. The resolv.conf writer orders nameservers and search domains by
//! class (VPN first, then the best device, then everyone else) and rewrites
//! the file whenever the aggregate changes.

use crate::ip_config::IpConfig;
use crate::types::IpFamily;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;

/// Priority class of a registered config
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DnsClass {
    Vpn,
    BestDevice,
    Default,
}

/// DNS resolver manager
pub trait DnsManager {
    /// Register (or re-class) the config of `iface`
    fn add(&mut self, iface: &str, config: &IpConfig, class: DnsClass);

    fn remove(&mut self, iface: &str, config: &IpConfig);

    /// Hostname used for the resolver's own search/domain hints
    fn set_hostname(&mut self, hostname: Option<&str>);
}

#[derive(Debug, Clone)]
struct Entry {
    iface: String,
    family: IpFamily,
    class: DnsClass,
    nameservers: Vec<IpAddr>,
    searches: Vec<String>,
}

/// glibc only honours the first three nameservers
const MAX_NAMESERVERS: usize = 3;

/// Writes an aggregated resolv.conf
pub struct ResolvConfManager {
    path: PathBuf,
    entries: Vec<Entry>,
    hostname: Option<String>,
    last_written: Option<String>,
}

impl ResolvConfManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Vec::new(),
            hostname: None,
            last_written: None,
        }
    }

    /// Current file contents
    pub fn render(&self) -> String {
        let mut entries: Vec<&Entry> = self.entries.iter().collect();
        // Stable: registration order breaks ties within a class
        entries.sort_by_key(|e| e.class);

        let mut nameservers: Vec<IpAddr> = Vec::new();
        let mut searches: Vec<String> = Vec::new();
        for entry in entries {
            for ns in &entry.nameservers {
                if !nameservers.contains(ns) {
                    nameservers.push(*ns);
                }
            }
            for search in &entry.searches {
                if !searches.contains(search) {
                    searches.push(search.clone());
                }
            }
        }

        // A dotted hostname contributes its domain as a search fallback
        if searches.is_empty() {
            if let Some(domain) = self.hostname.as_deref().and_then(|h| h.split_once('.')) {
                searches.push(domain.1.to_string());
            }
        }

        let mut out = String::from("# Generated by netpilot\n");
        if !searches.is_empty() {
            let _ = writeln!(out, "search {}", searches.join(" "));
        }
        for ns in nameservers.iter().take(MAX_NAMESERVERS) {
            let _ = writeln!(out, "nameserver {}", ns);
        }
        out
    }

    fn write(&mut self) -> Result<()> {
        let contents = self.render();
        if self.last_written.as_deref() == Some(contents.as_str()) {
            return Ok(());
        }
        std::fs::write(&self.path, &contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        self.last_written = Some(contents);
        Ok(())
    }

    fn update(&mut self) {
        if let Err(e) = self.write() {
            log::error!("Could not commit DNS changes: {:#}", e);
        }
    }
}

impl DnsManager for ResolvConfManager {
    fn add(&mut self, iface: &str, config: &IpConfig, class: DnsClass) {
        let entry = Entry {
            iface: iface.to_string(),
            family: config.family,
            class,
            nameservers: config.nameservers.clone(),
            searches: config
                .searches
                .iter()
                .chain(config.domains.iter())
                .cloned()
                .collect(),
        };
        match self
            .entries
            .iter_mut()
            .find(|e| e.iface == iface && e.family == config.family)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.update();
    }

    fn remove(&mut self, iface: &str, config: &IpConfig) {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.iface == iface && e.family == config.family));
        if self.entries.len() != before {
            self.update();
        }
    }

    fn set_hostname(&mut self, hostname: Option<&str>) {
        self.hostname = hostname.map(str::to_string);
        self.update();
    }
}
