//! Connection profiles and the settings store
//!
//! [`ConnectionSettings`] is the immutable description of a profile; an
//! activation holds it behind an `Rc` so edits to the store never mutate a
//! running attempt. [`Connection`] adds the policy-side bookkeeping (retry
//! budget, last failure, visibility) and lives only in [`Settings`].

use crate::ip_config::{IpMethod, IpSettings};
use crate::types::{DeviceKind, IpFamily, StateReason};
use std::rc::Rc;
use std::time::Instant;

/// Wireless operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    Infrastructure,
    Adhoc,
    Ap,
}

/// Wireless part of a profile
#[derive(Debug, Clone, PartialEq)]
pub struct WifiSettings {
    pub ssid: String,
    pub mode: WifiMode,
    /// Key management, e.g. "wpa-psk"; `None` for open networks
    pub security: Option<String>,
}

/// Immutable connection profile
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub id: String,
    pub uuid: String,
    pub kind: DeviceKind,
    pub interface: Option<String>,
    pub autoconnect: bool,
    /// Master interface name or connection uuid
    pub master: Option<String>,
    pub slave_type: Option<DeviceKind>,
    pub zone: Option<String>,
    pub permissions: Vec<String>,
    pub ipv4: IpSettings,
    pub ipv6: IpSettings,
    pub wifi: Option<WifiSettings>,
}

impl ConnectionSettings {
    /// Minimal profile with automatic addressing on both families
    pub fn new(id: &str, uuid: &str, kind: DeviceKind) -> Self {
        Self {
            id: id.to_string(),
            uuid: uuid.to_string(),
            kind,
            interface: None,
            autoconnect: true,
            master: None,
            slave_type: None,
            zone: None,
            permissions: Vec::new(),
            ipv4: IpSettings::with_method(IpMethod::Auto),
            ipv6: IpSettings::with_method(IpMethod::Auto),
            wifi: None,
        }
    }

    pub fn ip(&self, family: IpFamily) -> &IpSettings {
        match family {
            IpFamily::V4 => &self.ipv4,
            IpFamily::V6 => &self.ipv6,
        }
    }

    pub fn is_slave(&self) -> bool {
        self.master.is_some()
    }

    /// Wifi profile that shares its uplink (AP/adhoc with shared IPv4)
    pub fn is_shared_wifi(&self) -> bool {
        self.kind == DeviceKind::Wifi
            && self.ipv4.method == IpMethod::Shared
            && self
                .wifi
                .as_ref()
                .is_some_and(|w| w.mode != WifiMode::Infrastructure)
    }

    /// Name of the setting that needs secrets before the link can come up
    pub fn secrets_setting(&self) -> Option<&'static str> {
        self.wifi
            .as_ref()
            .and_then(|w| w.security.as_ref())
            .map(|_| "802-11-wireless-security")
    }
}

/// A profile plus its auto-activation bookkeeping
#[derive(Debug)]
pub struct Connection {
    settings: Rc<ConnectionSettings>,
    retries: u32,
    failure_reason: Option<StateReason>,
    reset_stamp: Option<Instant>,
    visible: bool,
    /// Last time the profile was successfully activated
    timestamp: Option<Instant>,
}

impl Connection {
    pub fn new(settings: ConnectionSettings, retries: u32, visible: bool) -> Self {
        Self {
            settings: Rc::new(settings),
            retries,
            failure_reason: None,
            reset_stamp: None,
            visible,
            timestamp: None,
        }
    }

    pub fn settings(&self) -> &Rc<ConnectionSettings> {
        &self.settings
    }

    pub fn uuid(&self) -> &str {
        &self.settings.uuid
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn failure_reason(&self) -> Option<StateReason> {
        self.failure_reason
    }

    pub fn reset_stamp(&self) -> Option<Instant> {
        self.reset_stamp
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn set_timestamp(&mut self, now: Instant) {
        self.timestamp = Some(now);
    }

    /// Restore the full budget and forget the failure
    pub fn reset_retries(&mut self, budget: u32) {
        self.retries = budget;
        self.failure_reason = None;
        self.reset_stamp = None;
    }

    /// Spend one attempt; returns the remaining budget
    pub fn decrement_retries(&mut self) -> u32 {
        self.retries = self.retries.saturating_sub(1);
        self.retries
    }

    /// Exhaust the budget immediately (secrets failure)
    pub fn block(&mut self, reason: StateReason) {
        self.retries = 0;
        self.failure_reason = Some(reason);
    }

    pub fn clear_failure(&mut self) {
        self.failure_reason = None;
    }

    pub fn stamp(&mut self, now: Instant) {
        self.reset_stamp = Some(now);
    }

    fn replace_settings(&mut self, settings: ConnectionSettings) {
        self.settings = Rc::new(settings);
    }
}

/// Result of [`Settings::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated,
    Unchanged,
}

/// Store of known connection profiles, in insertion order
#[derive(Debug)]
pub struct Settings {
    connections: Vec<Connection>,
    default_retries: u32,
    permissions: Vec<String>,
}

impl Settings {
    pub fn new(default_retries: u32, permissions: Vec<String>) -> Self {
        Self {
            connections: Vec::new(),
            default_retries,
            permissions,
        }
    }

    pub fn default_retries(&self) -> u32 {
        self.default_retries
    }

    /// True if the requester holds the named permission
    pub fn has_permission(&self, name: &str) -> bool {
        self.permissions.iter().any(|p| p == name)
    }

    /// Profile ACL check: unrestricted, or any listed permission is held
    pub fn acl_allows(&self, settings: &ConnectionSettings) -> bool {
        settings.permissions.is_empty()
            || settings.permissions.iter().any(|p| self.has_permission(p))
    }

    /// Insert or replace a profile; budget is reset either way
    pub fn add(&mut self, settings: ConnectionSettings, visible: bool) -> Change {
        let visible = visible && self.acl_allows(&settings);
        let budget = self.default_retries;

        if let Some(existing) = self.get_mut(&settings.uuid) {
            if **existing.settings() == settings && existing.is_visible() == visible {
                return Change::Unchanged;
            }
            existing.replace_settings(settings);
            existing.set_visible(visible);
            existing.reset_retries(budget);
            return Change::Updated;
        }

        self.connections
            .push(Connection::new(settings, budget, visible));
        Change::Added
    }

    pub fn remove(&mut self, uuid: &str) -> Option<Connection> {
        let pos = self.connections.iter().position(|c| c.uuid() == uuid)?;
        Some(self.connections.remove(pos))
    }

    pub fn get(&self, uuid: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.uuid() == uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.uuid() == uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn reset_retries(&mut self, uuid: &str) {
        let budget = self.default_retries;
        if let Some(conn) = self.get_mut(uuid) {
            conn.reset_retries(budget);
        }
    }

    pub fn reset_all_retries(&mut self) {
        let budget = self.default_retries;
        for conn in &mut self.connections {
            conn.reset_retries(budget);
        }
    }

    /// Restore budgets stamped at least `window` ago; returns how many changed
    pub fn reset_expired(&mut self, now: Instant, window: std::time::Duration) -> usize {
        let budget = self.default_retries;
        let mut changed = 0;
        for conn in &mut self.connections {
            if let Some(stamp) = conn.reset_stamp() {
                if now.saturating_duration_since(stamp) >= window {
                    conn.reset_retries(budget);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Earliest pending reset stamp
    pub fn oldest_stamp(&self) -> Option<Instant> {
        self.connections.iter().filter_map(|c| c.reset_stamp()).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn profile(uuid: &str) -> ConnectionSettings {
        ConnectionSettings::new("Wired", uuid, DeviceKind::Ethernet)
    }

    #[test]
    fn test_add_update_unchanged() {
        let mut settings = Settings::new(4, Vec::new());
        assert_eq!(settings.add(profile("a"), true), Change::Added);
        assert_eq!(settings.add(profile("a"), true), Change::Unchanged);

        let mut edited = profile("a");
        edited.autoconnect = false;
        assert_eq!(settings.add(edited, true), Change::Updated);
        assert_eq!(settings.len(), 1);
        assert!(!settings.get("a").unwrap().settings().autoconnect);
    }

    #[test]
    fn test_update_resets_budget() {
        let mut settings = Settings::new(4, Vec::new());
        settings.add(profile("a"), true);
        settings.get_mut("a").unwrap().block(StateReason::NoSecrets);
        assert_eq!(settings.get("a").unwrap().retries(), 0);

        let mut edited = profile("a");
        edited.id = "Renamed".to_string();
        settings.add(edited, true);
        let conn = settings.get("a").unwrap();
        assert_eq!(conn.retries(), 4);
        assert_eq!(conn.failure_reason(), None);
    }

    #[test]
    fn test_decrement_saturates() {
        let mut conn = Connection::new(profile("a"), 1, true);
        assert_eq!(conn.decrement_retries(), 0);
        assert_eq!(conn.decrement_retries(), 0);
    }

    #[test]
    fn test_reset_expired() {
        let mut settings = Settings::new(4, Vec::new());
        settings.add(profile("a"), true);
        settings.add(profile("b"), true);

        let t0 = Instant::now();
        let a = settings.get_mut("a").unwrap();
        a.block(StateReason::DhcpFailed);
        a.stamp(t0);
        let b = settings.get_mut("b").unwrap();
        b.block(StateReason::DhcpFailed);
        b.stamp(t0 + Duration::from_secs(100));

        let window = Duration::from_secs(300);
        assert_eq!(settings.oldest_stamp(), Some(t0));
        assert_eq!(settings.reset_expired(t0 + Duration::from_secs(299), window), 0);
        assert_eq!(settings.reset_expired(t0 + Duration::from_secs(300), window), 1);
        assert_eq!(settings.get("a").unwrap().retries(), 4);
        assert_eq!(settings.get("b").unwrap().retries(), 0);
        assert_eq!(settings.oldest_stamp(), Some(t0 + Duration::from_secs(100)));
    }

    #[test]
    fn test_acl_visibility() {
        let mut settings = Settings::new(4, vec!["sharing".to_string()]);
        let mut restricted = profile("a");
        restricted.permissions = vec!["admin".to_string()];
        settings.add(restricted, true);
        assert!(!settings.get("a").unwrap().is_visible());

        let mut allowed = profile("b");
        allowed.permissions = vec!["sharing".to_string()];
        settings.add(allowed, true);
        assert!(settings.get("b").unwrap().is_visible());
    }

    #[test]
    fn test_shared_wifi_and_secrets() {
        let mut ap = ConnectionSettings::new("Hotspot", "h", DeviceKind::Wifi);
        ap.ipv4.method = IpMethod::Shared;
        ap.wifi = Some(WifiSettings {
            ssid: "hotspot".to_string(),
            mode: WifiMode::Ap,
            security: Some("wpa-psk".to_string()),
        });
        assert!(ap.is_shared_wifi());
        assert_eq!(ap.secrets_setting(), Some("802-11-wireless-security"));

        let wired = profile("w");
        assert!(!wired.is_shared_wifi());
        assert_eq!(wired.secrets_setting(), None);
    }
}
