// Shared types between the device state machine, policy engine and config

//! Shared data structures
//!
//! This module defines the enums every other module speaks in: device
//! lifecycle states, per-family sub-states, the state-change reason
//! taxonomy, device kinds, plus the TOML configuration structures.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Stable identifier of a managed device, assigned in first-seen order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of an outstanding collaborator call (secrets, firewall)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

/// Device lifecycle states
///
/// Ordering follows the activation pipeline, so range checks such as
/// `state >= Prepare && state <= Activated` read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceState {
    Unknown,
    Unmanaged,
    Unavailable,
    Disconnected,
    Prepare,
    Config,
    NeedAuth,
    IpConfig,
    IpCheck,
    Secondaries,
    Activated,
    Deactivating,
    Failed,
}

impl DeviceState {
    /// Canonical lowercase name used in logs and the state file
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Unmanaged => "unmanaged",
            DeviceState::Unavailable => "unavailable",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Prepare => "prepare",
            DeviceState::Config => "config",
            DeviceState::NeedAuth => "need-auth",
            DeviceState::IpConfig => "ip-config",
            DeviceState::IpCheck => "ip-check",
            DeviceState::Secondaries => "secondaries",
            DeviceState::Activated => "activated",
            DeviceState::Deactivating => "deactivating",
            DeviceState::Failed => "failed",
        }
    }

    /// True while an activation attempt is in flight or complete
    pub fn is_activating_or_active(&self) -> bool {
        *self >= DeviceState::Prepare && *self <= DeviceState::Activated
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason attached to every state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateReason {
    None,
    Unknown,
    NowManaged,
    NowUnmanaged,
    // IP layer
    IpConfigUnavailable,
    IpConfigExpired,
    // Address transports
    DhcpStartFailed,
    DhcpFailed,
    PppFailed,
    AutoipFailed,
    // Authentication
    NoSecrets,
    SupplicantFailed,
    SupplicantTimeout,
    // Dependencies
    FirmwareMissing,
    ConfigFailed,
    SharedStartFailed,
    // Lifecycle
    Removed,
    UserRequested,
    ConnectionAssumed,
    CarrierChanged,
    ConnectionRemoved,
    Sleeping,
}

impl StateReason {
    /// Kebab-case name used in logs and the state file
    pub fn as_str(&self) -> &'static str {
        match self {
            StateReason::None => "none",
            StateReason::Unknown => "unknown",
            StateReason::NowManaged => "now-managed",
            StateReason::NowUnmanaged => "now-unmanaged",
            StateReason::IpConfigUnavailable => "ip-config-unavailable",
            StateReason::IpConfigExpired => "ip-config-expired",
            StateReason::DhcpStartFailed => "dhcp-start-failed",
            StateReason::DhcpFailed => "dhcp-failed",
            StateReason::PppFailed => "ppp-failed",
            StateReason::AutoipFailed => "autoip-failed",
            StateReason::NoSecrets => "no-secrets",
            StateReason::SupplicantFailed => "supplicant-failed",
            StateReason::SupplicantTimeout => "supplicant-timeout",
            StateReason::FirmwareMissing => "firmware-missing",
            StateReason::ConfigFailed => "config-failed",
            StateReason::SharedStartFailed => "shared-start-failed",
            StateReason::Removed => "removed",
            StateReason::UserRequested => "user-requested",
            StateReason::ConnectionAssumed => "connection-assumed",
            StateReason::CarrierChanged => "carrier-changed",
            StateReason::ConnectionRemoved => "connection-removed",
            StateReason::Sleeping => "sleeping",
        }
    }
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Both families in commit order
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

    /// Slot index for per-family arrays
    pub fn index(self) -> usize {
        match self {
            IpFamily::V4 => 0,
            IpFamily::V6 => 1,
        }
    }

    pub fn other(self) -> IpFamily {
        match self {
            IpFamily::V4 => IpFamily::V6,
            IpFamily::V6 => IpFamily::V4,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Per-family progress inside one activation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum IpSubState {
    #[default]
    None,
    Conf,
    Done,
}

impl IpSubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpSubState::None => "none",
            IpSubState::Conf => "conf",
            IpSubState::Done => "done",
        }
    }
}

/// Hardware/link kind of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Ethernet,
    Wifi,
    Bluetooth,
    OlpcMesh,
    Wimax,
    Modem,
    Infiniband,
    Bond,
    Generic,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Ethernet => "ethernet",
            DeviceKind::Wifi => "wifi",
            DeviceKind::Bluetooth => "bluetooth",
            DeviceKind::OlpcMesh => "olpc-mesh",
            DeviceKind::Wimax => "wimax",
            DeviceKind::Modem => "modem",
            DeviceKind::Infiniband => "infiniband",
            DeviceKind::Bond => "bond",
            DeviceKind::Generic => "generic",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ethernet" => Ok(DeviceKind::Ethernet),
            "wifi" => Ok(DeviceKind::Wifi),
            "bluetooth" => Ok(DeviceKind::Bluetooth),
            "olpc-mesh" => Ok(DeviceKind::OlpcMesh),
            "wimax" => Ok(DeviceKind::Wimax),
            "modem" => Ok(DeviceKind::Modem),
            "infiniband" => Ok(DeviceKind::Infiniband),
            "bond" => Ok(DeviceKind::Bond),
            "generic" => Ok(DeviceKind::Generic),
            other => Err(format!("unknown device kind '{}'", other)),
        }
    }
}

/// Outcome of the link-layer activation stages (prepare, config)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResult {
    /// Stage finished, schedule the next one
    Success,
    /// Stage is waiting on something external; it will be re-run
    Postpone,
    /// Stage failed; the device goes to `Failed` with this reason
    Failure(StateReason),
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    /// Device-kind priority overrides, lower wins
    #[serde(default)]
    pub priorities: BTreeMap<String, u32>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Persistent hostname; wins over every automatic source
    #[serde(default)]
    pub hostname: Option<String>,
    /// Seconds a lease helper may run before the attempt times out
    #[serde(default = "default_dhcp_timeout")]
    pub dhcp_timeout: u64,
    #[serde(default = "default_autoconnect_retries")]
    pub autoconnect_retries: u32,
    #[serde(default = "default_retry_reset_secs")]
    pub retry_reset_secs: u64,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
    #[serde(default)]
    pub dispatcher_dir: Option<PathBuf>,
    #[serde(default)]
    pub secrets_dir: Option<PathBuf>,
    #[serde(default)]
    pub lease_helper: Option<PathBuf>,
    /// Assign firewalld zones before committing IP configuration
    #[serde(default)]
    pub firewall: bool,
    /// Permissions held by the daemon's requester (e.g. "sharing")
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default = "default_carrier_poll_secs")]
    pub carrier_poll_secs: u64,
    /// Adopt addresses already present on interfaces at startup
    #[serde(default = "default_true")]
    pub assume_existing: bool,
    /// Follow logind suspend/resume over the system bus
    #[serde(default)]
    pub sleep_monitor: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            hostname: None,
            dhcp_timeout: default_dhcp_timeout(),
            autoconnect_retries: default_autoconnect_retries(),
            retry_reset_secs: default_retry_reset_secs(),
            state_file: default_state_file(),
            resolv_conf: default_resolv_conf(),
            dispatcher_dir: None,
            secrets_dir: None,
            lease_helper: None,
            firewall: false,
            permissions: Vec::new(),
            carrier_poll_secs: default_carrier_poll_secs(),
            assume_existing: true,
            sleep_monitor: false,
        }
    }
}

/// A device the daemon should manage
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    pub name: String,
    /// Kernel interface index; read from sysfs when omitted
    #[serde(default)]
    pub ifindex: Option<u32>,
    pub kind: String,
    #[serde(default = "default_true")]
    pub managed: bool,
}

/// A connection profile
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    pub id: String,
    pub uuid: String,
    pub kind: String,
    /// Bind the profile to one interface name
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_true")]
    pub autoconnect: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    /// Master interface name or connection uuid
    #[serde(default)]
    pub master: Option<String>,
    #[serde(default)]
    pub slave_type: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub ipv4: Option<IpSection>,
    #[serde(default)]
    pub ipv6: Option<IpSection>,
    #[serde(default)]
    pub wifi: Option<WifiSection>,
}

/// Per-family IP settings of a connection profile
#[derive(Debug, Deserialize, Clone)]
pub struct IpSection {
    pub method: String,
    #[serde(default)]
    pub addresses: Vec<AddressEntry>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub dns_search: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub ignore_auto_dns: bool,
    #[serde(default)]
    pub ignore_auto_routes: bool,
    #[serde(default)]
    pub never_default: bool,
    #[serde(default = "default_true")]
    pub may_fail: bool,
}

/// Static address in CIDR notation with optional gateway
#[derive(Debug, Deserialize, Clone)]
pub struct AddressEntry {
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// Static route
#[derive(Debug, Deserialize, Clone)]
pub struct RouteEntry {
    pub dest: String,
    #[serde(default)]
    pub next_hop: Option<String>,
    #[serde(default)]
    pub metric: u32,
}

/// Wireless settings
#[derive(Debug, Deserialize, Clone)]
pub struct WifiSection {
    pub ssid: String,
    /// "infrastructure", "adhoc" or "ap"
    #[serde(default = "default_wifi_mode")]
    pub mode: String,
    /// e.g. "wpa-psk"; absent means open network
    #[serde(default)]
    pub security: Option<String>,
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_dhcp_timeout() -> u64 {
    45
}

fn default_autoconnect_retries() -> u32 {
    4
}

fn default_retry_reset_secs() -> u64 {
    300 // 5 minutes
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/run/netpilot/state")
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_carrier_poll_secs() -> u64 {
    5
}

fn default_wifi_mode() -> String {
    "infrastructure".to_string()
}

fn default_true() -> bool {
    true
}
