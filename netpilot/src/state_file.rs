// State file writer for external monitoring
//!
//! Writes the observable daemon state (per-device state, managed and
//! firmware flags, active connection, addresses, default flags, and the
//! hostname with its provenance) to a file for status bars and scripts.

use crate::policy::HostnameSource;
use crate::types::{DeviceKind, DeviceState};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Observable properties of one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub name: String,
    pub kind: DeviceKind,
    pub state: DeviceState,
    pub managed: bool,
    pub firmware_missing: bool,
    /// Id of the active connection
    pub connection: Option<String>,
    pub ip4: Vec<String>,
    pub ip6: Vec<String>,
    pub default4: bool,
    pub default6: bool,
}

/// Everything the state file exposes
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub devices: Vec<DeviceStatus>,
    pub hostname: Option<String>,
    pub hostname_source: HostnameSource,
}

/// `KEY=VALUE` lines; device keys are prefixed with `DEVICE_<iface>_`
pub fn render(snapshot: &Snapshot, timestamp: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "HOSTNAME={}", snapshot.hostname.as_deref().unwrap_or(""));
    let _ = writeln!(out, "HOSTNAME_SOURCE={}", snapshot.hostname_source.as_str());
    let _ = writeln!(out, "TIMESTAMP={}", timestamp);

    for dev in &snapshot.devices {
        let prefix = format!("DEVICE_{}_", dev.name);
        let _ = writeln!(out, "{}KIND={}", prefix, dev.kind);
        let _ = writeln!(out, "{}STATE={}", prefix, dev.state);
        let _ = writeln!(out, "{}MANAGED={}", prefix, dev.managed);
        let _ = writeln!(out, "{}FIRMWARE_MISSING={}", prefix, dev.firmware_missing);
        let _ = writeln!(
            out,
            "{}CONNECTION={}",
            prefix,
            dev.connection.as_deref().unwrap_or("")
        );
        let _ = writeln!(out, "{}IP4={}", prefix, dev.ip4.join(","));
        let _ = writeln!(out, "{}IP6={}", prefix, dev.ip6.join(","));
        let _ = writeln!(out, "{}DEFAULT4={}", prefix, dev.default4);
        let _ = writeln!(out, "{}DEFAULT6={}", prefix, dev.default6);
    }
    out
}

/// Write current state to state file
pub fn write_state(path: &Path, snapshot: &Snapshot) -> Result<()> {
    // Create directory if it doesn't exist
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir).context("Failed to create state directory")?;
        }
    }

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    // Write through a sibling file so readers never see a partial state
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, render(snapshot, timestamp)).context("Failed to write state file")?;
    fs::rename(&tmp, path).context("Failed to replace state file")?;

    Ok(())
}

/// Remove state file on shutdown
pub fn cleanup(path: &Path) {
    let _ = fs::remove_file(path);
}
