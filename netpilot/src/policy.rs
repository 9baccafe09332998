// Routing, DNS and hostname policy

//! Policy engine
//!
//! Reacts to device state changes and settings events. It owns three
//! decisions:
//!
//! - which device (or VPN) carries the default route and the primary DNS
//!   servers of each family,
//! - which hostname the system gets,
//! - when a device should try to auto-activate, gated by each connection's
//!   retry budget.
//!
//! Devices never call into the policy; the manager hands it every
//! [`StateNotification`] after the emitting device's handler has returned.

use crate::activation::ActivationRequest;
use crate::connection::Settings;
use crate::context::{Context, StateNotification};
use crate::device::Device;
use crate::dispatcher::DispatchAction;
use crate::dns::DnsClass;
use crate::hostname::HostnameResolver;
use crate::ip_config::{IpConfig, IpMethod};
use crate::scheduler::{Task, TimerId};
use crate::types::{DeviceId, DeviceKind, DeviceState, IpFamily, StateReason};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

/// Retry budget a connection starts with
pub const RETRIES_DEFAULT: u32 = 4;

/// How long an exhausted connection stays blocked
pub const RESET_RETRIES_TIMER: Duration = Duration::from_secs(300);

/// Delay before a failed device looks for something else to activate
const FAILURE_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Hostname set when every other source comes up empty
pub const FALLBACK_HOSTNAME: &str = "localhost.localdomain";

/// Permission needed to auto-activate a shared wifi profile
const SHARING_PERMISSION: &str = "sharing";

/// Device-kind priority for default route selection, lower wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityTable {
    overrides: HashMap<DeviceKind, u32>,
}

impl PriorityTable {
    /// Build the table from `[priorities]`, unlisted kinds keep their default
    pub fn from_config(priorities: &BTreeMap<String, u32>) -> Result<Self> {
        let mut overrides = HashMap::new();
        for (name, priority) in priorities {
            let kind = name
                .parse::<DeviceKind>()
                .map_err(|e| anyhow::anyhow!("Invalid priorities entry: {}", e))?;
            overrides.insert(kind, *priority);
        }
        Ok(Self { overrides })
    }

    pub fn get(&self, kind: DeviceKind) -> u32 {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_priority(kind))
    }
}

fn default_priority(kind: DeviceKind) -> u32 {
    match kind {
        DeviceKind::Ethernet => 1,
        DeviceKind::Wifi => 2,
        DeviceKind::Bluetooth => 5,
        DeviceKind::OlpcMesh => 6,
        DeviceKind::Wimax => 7,
        DeviceKind::Modem => 8,
        DeviceKind::Infiniband => 9,
        DeviceKind::Bond => 10,
        DeviceKind::Generic => 11,
    }
}

/// An active VPN as reported by the VPN layer
#[derive(Debug, Clone)]
pub struct VpnConnection {
    pub id: String,
    /// Tunnel interface
    pub iface: String,
    pub ip4: Option<IpConfig>,
    pub ip6: Option<IpConfig>,
    pub never_default: bool,
}

impl VpnConnection {
    pub fn config(&self, family: IpFamily) -> Option<&IpConfig> {
        match family {
            IpFamily::V4 => self.ip4.as_ref(),
            IpFamily::V6 => self.ip6.as_ref(),
        }
    }

    fn can_default(&self, family: IpFamily) -> bool {
        !self.never_default && self.config(family).is_some_and(|c| !c.never_default)
    }
}

#[derive(Debug)]
struct ActiveVpn {
    vpn: VpnConnection,
    default: [bool; 2],
}

/// Where the current hostname came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostnameSource {
    Configured,
    Dhcp4,
    Dhcp6,
    Startup,
    ReverseLookup,
    Fallback,
}

impl HostnameSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostnameSource::Configured => "configured",
            HostnameSource::Dhcp4 => "dhcp4",
            HostnameSource::Dhcp6 => "dhcp6",
            HostnameSource::Startup => "startup",
            HostnameSource::ReverseLookup => "reverse-lookup",
            HostnameSource::Fallback => "fallback",
        }
    }
}

/// Best device to carry the default route of `family`
///
/// Only activated devices with a config for the family qualify. Link-local
/// configs and never-default ones are skipped, and a gateway is required
/// unless the device kind is point-to-point. Lowest priority wins; the
/// first device seen wins a tie.
pub fn best_device<'a>(
    devices: &'a [Device],
    family: IpFamily,
    priorities: &PriorityTable,
) -> Option<&'a Device> {
    let mut best: Option<(&Device, u32)> = None;

    for device in devices {
        if device.state() != DeviceState::Activated {
            continue;
        }
        let Some(config) = device.ip_config(family) else {
            continue;
        };
        let Some(connection) = device.connection() else {
            continue;
        };

        let settings = connection.ip(family);
        if settings.method == IpMethod::LinkLocal || config.is_link_local_only() {
            continue;
        }
        if !device.gateway_less() && !config.addresses.iter().any(|a| a.has_gateway()) {
            continue;
        }
        if settings.never_default || config.never_default {
            continue;
        }

        let priority = priorities.get(device.kind());
        if priority > 0 && best.map_or(true, |(_, p)| priority < p) {
            best = Some((device, priority));
        }
    }

    best.map(|(device, _)| device)
}

/// Master device of a slave connection: matched by interface name or by
/// the uuid of the connection active on it
pub fn find_master<'a>(devices: &'a [Device], master: &str) -> Option<&'a Device> {
    devices
        .iter()
        .find(|d| d.name() == master || d.request().is_some_and(|r| r.uuid() == master))
}

/// DHCP-provided hostname of `device`, with leading blanks stripped
fn dhcp_hostname(device: &Device, family: IpFamily) -> Option<String> {
    let raw = device.dhcp_options(family).get("host_name")?;
    if raw.is_empty() {
        return None;
    }
    let name = raw.trim_start_matches([' ', '\t']);
    if name.is_empty() {
        log::warn!(
            "DHCP{}-provided hostname '{}' looks invalid; ignoring it",
            if family == IpFamily::V4 { "v4" } else { "v6" },
            raw
        );
        return None;
    }
    Some(name.to_string())
}

/// Policy engine state
pub struct Policy {
    default_device: [Option<DeviceId>; 2],
    vpns: Vec<ActiveVpn>,
    pending_checks: HashSet<DeviceId>,
    reset_timer: Option<TimerId>,
    retry_window: Duration,
    sleeping: bool,

    configured_hostname: Option<String>,
    orig_hostname: Option<String>,
    cur_hostname: Option<String>,
    hostname_changed: bool,
    hostname_source: HostnameSource,
    resolver: HostnameResolver,
}

impl Policy {
    /// `orig_hostname` is what the system was called when the daemon started
    pub fn new(
        resolver: HostnameResolver,
        orig_hostname: Option<String>,
        configured_hostname: Option<String>,
        retry_window: Duration,
    ) -> Self {
        Self {
            default_device: [None, None],
            vpns: Vec::new(),
            pending_checks: HashSet::new(),
            reset_timer: None,
            retry_window,
            sleeping: false,
            configured_hostname,
            orig_hostname,
            cur_hostname: None,
            hostname_changed: false,
            hostname_source: HostnameSource::Startup,
            resolver,
        }
    }

    /// Hostname currently in effect
    pub fn hostname(&self) -> Option<&str> {
        self.cur_hostname
            .as_deref()
            .or(self.orig_hostname.as_deref())
    }

    pub fn hostname_source(&self) -> HostnameSource {
        self.hostname_source
    }

    pub fn resolver(&self) -> &HostnameResolver {
        &self.resolver
    }

    pub fn default_device(&self, family: IpFamily) -> Option<DeviceId> {
        self.default_device[family.index()]
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    pub fn has_pending_check(&self, device: DeviceId) -> bool {
        self.pending_checks.contains(&device)
    }

    /// VPNs currently holding the default flag of `family`
    pub fn default_vpn(&self, family: IpFamily) -> Option<&VpnConnection> {
        self.vpns
            .iter()
            .find(|v| v.default[family.index()])
            .map(|v| &v.vpn)
    }

    /// React to one device state transition
    pub fn device_state_changed(
        &mut self,
        ctx: &mut Context,
        devices: &mut [Device],
        settings: &mut Settings,
        note: &StateNotification,
    ) {
        let Some(index) = devices.iter().position(|d| d.id() == note.device) else {
            return;
        };

        if let Some(conn) = &note.connection {
            if let Some(conn) = settings.get_mut(&conn.uuid) {
                conn.clear_failure();
            }
        }

        if note.new <= DeviceState::Disconnected || note.new == DeviceState::Failed {
            self.resolver.cancel_for(note.device);
        }

        match note.new {
            DeviceState::Failed => {
                self.connection_failed(ctx, settings, note);
                self.schedule_check(ctx, &devices[index], FAILURE_RETRY_DELAY);
            }
            DeviceState::Activated => {
                if let Some(conn) = &note.connection {
                    let budget = settings.default_retries();
                    if let Some(conn) = settings.get_mut(&conn.uuid) {
                        conn.reset_retries(budget);
                        conn.set_timestamp(ctx.now);
                    }
                }
                self.update_routing_and_dns(ctx, devices, false);
            }
            DeviceState::Unmanaged => {
                if note.old != DeviceState::Unavailable && note.old != DeviceState::Disconnected {
                    self.update_routing_and_dns(ctx, devices, false);
                }
            }
            DeviceState::Unavailable => {
                self.update_routing_and_dns(ctx, devices, false);
            }
            DeviceState::Disconnected => {
                if note.reason == StateReason::CarrierChanged
                    && note.old == DeviceState::Unavailable
                {
                    let budget = settings.default_retries();
                    for conn in settings.iter_mut() {
                        if devices[index].check_compatible(conn.settings()).is_ok() {
                            conn.reset_retries(budget);
                        }
                    }
                }
                self.update_routing_and_dns(ctx, devices, false);
                self.schedule_check(ctx, &devices[index], Duration::ZERO);
            }
            DeviceState::Prepare => {
                self.activate_slave_connections(ctx, devices, settings, index);
            }
            _ => {}
        }
    }

    /// Retry bookkeeping for an attempt that ended in `Failed`
    fn connection_failed(
        &mut self,
        ctx: &mut Context,
        settings: &mut Settings,
        note: &StateNotification,
    ) {
        if !note.old.is_activating_or_active() {
            return;
        }
        let Some(conn) = &note.connection else {
            return;
        };
        let Some(conn) = settings.get_mut(&conn.uuid) else {
            return;
        };

        if note.reason == StateReason::NoSecrets {
            conn.block(StateReason::NoSecrets);
        } else if conn.retries() > 0 {
            conn.decrement_retries();
        }

        if conn.retries() == 0 {
            log::info!("Marking connection '{}' invalid.", conn.id());
            conn.stamp(ctx.now);
            if self.reset_timer.is_none() {
                self.reset_timer = Some(
                    ctx.queue
                        .schedule_at(ctx.now + self.retry_window, Task::ResetRetries),
                );
            }
        }
    }

    /// A master entered `Prepare`: unblock its slave connections and resume
    /// slaves that were postponed waiting for it
    fn activate_slave_connections(
        &mut self,
        ctx: &mut Context,
        devices: &mut [Device],
        settings: &mut Settings,
        index: usize,
    ) {
        let master_iface = devices[index].name().to_string();
        let master_uuid = devices[index].request().map(|r| r.uuid().to_string());
        let is_ours = |master: &str| {
            master == master_iface || master_uuid.as_deref() == Some(master)
        };

        let budget = settings.default_retries();
        for conn in settings.iter_mut() {
            if conn.settings().master.as_deref().is_some_and(is_ours) {
                conn.reset_retries(budget);
            }
        }

        for device in devices.iter_mut() {
            let waiting_on_us = device.is_waiting_for_master()
                && device
                    .connection()
                    .and_then(|c| c.master.as_deref())
                    .is_some_and(is_ours);
            if waiting_on_us {
                device.master_ready(ctx);
            }
        }

        self.schedule_activate_all(ctx, devices);
    }

    /// Queue an auto-activation check for `device`; at most one per device
    pub fn schedule_check(&mut self, ctx: &mut Context, device: &Device, delay: Duration) {
        if self.sleeping {
            return;
        }
        if device.state() < DeviceState::Disconnected || !device.is_managed() {
            return;
        }
        if !self.pending_checks.insert(device.id()) {
            return;
        }

        let task = Task::ActivationCheck {
            device: device.id(),
        };
        if delay.is_zero() {
            ctx.queue.push(task);
        } else {
            ctx.queue.schedule_at(ctx.now + delay, task);
        }
    }

    pub fn schedule_activate_all(&mut self, ctx: &mut Context, devices: &[Device]) {
        for device in devices {
            self.schedule_check(ctx, device, Duration::ZERO);
        }
    }

    /// Pick the best eligible connection for an idle device and activate it
    pub fn run_activation_check(
        &mut self,
        ctx: &mut Context,
        devices: &mut [Device],
        settings: &Settings,
        device: DeviceId,
    ) {
        if !self.pending_checks.remove(&device) || self.sleeping {
            return;
        }
        let Some(index) = devices.iter().position(|d| d.id() == device) else {
            return;
        };
        {
            let dev = &devices[index];
            if dev.request().is_some() || dev.state() < DeviceState::Disconnected {
                return;
            }
        }

        let active: HashSet<&str> = devices
            .iter()
            .filter(|d| d.id() != device)
            .filter_map(|d| d.request().map(|r| r.uuid()))
            .collect();

        let mut candidates: Vec<_> = settings
            .iter()
            .filter(|c| c.retries() > 0 && c.is_visible() && c.settings().autoconnect)
            .filter(|c| !active.contains(c.uuid()))
            .filter(|c| devices[index].check_compatible(c.settings()).is_ok())
            .filter(|c| {
                !c.settings().is_shared_wifi() || settings.has_permission(SHARING_PERMISSION)
            })
            .collect();
        // Most recently used first; stable sort keeps store order for ties
        candidates.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));

        let Some(best) = candidates.first() else {
            return;
        };
        let connection = std::rc::Rc::clone(best.settings());

        if let Some(master) = &connection.master {
            let ready = find_master(devices, master).is_some_and(|m| m.request().is_some());
            if !ready {
                log::info!(
                    "Connection '{}' auto-activation postponed: master not available",
                    connection.id
                );
                return;
            }
        }

        log::info!("Auto-activating connection '{}'.", connection.id);
        let id = connection.id.clone();
        if let Err(e) = devices[index].activate(ctx, ActivationRequest::new(connection)) {
            log::info!("Connection '{}' auto-activation failed: {}", id, e);
        }
    }

    /// Timer sweep: restore budgets whose block window has passed
    pub fn reset_retries_sweep(
        &mut self,
        ctx: &mut Context,
        devices: &[Device],
        settings: &mut Settings,
    ) {
        self.reset_timer = None;
        let changed = settings.reset_expired(ctx.now, self.retry_window);

        if let Some(oldest) = settings.oldest_stamp() {
            self.reset_timer = Some(
                ctx.queue
                    .schedule_at(oldest + self.retry_window, Task::ResetRetries),
            );
        }

        if changed > 0 {
            log::debug!("Restored retry budget of {} connection(s)", changed);
            self.schedule_activate_all(ctx, devices);
        }
    }

    /// Re-elect the default device of both families, then the hostname
    pub fn update_routing_and_dns(&mut self, ctx: &mut Context, devices: &mut [Device], force: bool) {
        for family in IpFamily::ALL {
            self.update_default(ctx, devices, family, force);
        }
        self.update_hostname(ctx, devices);
    }

    fn update_default(
        &mut self,
        ctx: &mut Context,
        devices: &mut [Device],
        family: IpFamily,
        force: bool,
    ) {
        let slot = family.index();
        let best = best_device(devices, family, &ctx.options.priorities).map(Device::id);

        let Some(best) = best else {
            clear_default_flags(devices, family);
            for vpn in &mut self.vpns {
                vpn.default[slot] = false;
            }
            if self.default_device[slot].take().is_some() {
                log::info!("Policy: no device left to carry {} default route", family);
            }
            return;
        };
        if !force && self.default_device[slot] == Some(best) {
            return;
        }
        let Some(best_index) = devices.iter().position(|d| d.id() == best) else {
            return;
        };

        let vpn = self.vpns.iter().position(|v| v.vpn.can_default(family));
        let device = &devices[best_index];
        let (iface, name, config, class, gateway) = match vpn {
            Some(i) => {
                let vpn = &self.vpns[i].vpn;
                let Some(config) = vpn.config(family) else {
                    return;
                };
                (
                    vpn.iface.clone(),
                    vpn.id.clone(),
                    config.clone(),
                    DnsClass::Vpn,
                    config.gateway(),
                )
            }
            None => {
                let Some(config) = device.ip_config(family) else {
                    return;
                };
                let gateway = if device.gateway_less() {
                    None
                } else {
                    config.gateway()
                };
                (
                    device.name().to_string(),
                    device
                        .connection()
                        .map(|c| c.id.clone())
                        .unwrap_or_default(),
                    config.clone(),
                    DnsClass::BestDevice,
                    gateway,
                )
            }
        };

        if !ctx
            .services
            .system
            .replace_default_route(&iface, family, gateway)
        {
            log::warn!("Failed to set {} default route on {}", family, iface);
        }

        // Clear every flag first, then set the winner's
        clear_default_flags(devices, family);
        for (i, active) in self.vpns.iter_mut().enumerate() {
            active.default[slot] = Some(i) == vpn;
        }

        if let Some(previous) = self.default_device[slot].filter(|p| *p != best) {
            if let Some(prev) = devices.iter().find(|d| d.id() == previous) {
                if let Some(prev_config) = prev.ip_config(family) {
                    ctx.services
                        .dns
                        .add(prev.name(), prev_config, DnsClass::Default);
                }
            }
        }
        ctx.services.dns.add(&iface, &config, class);

        if let Some(request) = devices[best_index].request_mut() {
            request.set_default(family, true);
        }
        self.default_device[slot] = Some(best);

        log::info!(
            "Policy set '{}' ({}) as default for {} routing and DNS.",
            name,
            iface,
            family
        );
    }

    /// Pick the hostname by precedence and apply it
    pub fn update_hostname(&mut self, ctx: &mut Context, devices: &[Device]) {
        self.resolver.cancel();

        if let Some(name) = self.configured_hostname.clone() {
            self.set_hostname(ctx, Some(name), HostnameSource::Configured);
            return;
        }

        let best4 = best_device(devices, IpFamily::V4, &ctx.options.priorities);
        let best6 = best_device(devices, IpFamily::V6, &ctx.options.priorities);

        if best4.is_none() && best6.is_none() {
            let orig = self.orig_hostname.clone();
            let source = if orig.is_some() {
                HostnameSource::Startup
            } else {
                HostnameSource::Fallback
            };
            self.set_hostname(ctx, orig, source);
            return;
        }

        let dhcp = match (best4, best6) {
            (Some(device), _) => dhcp_hostname(device, IpFamily::V4).map(|n| (n, HostnameSource::Dhcp4)),
            (None, Some(device)) => {
                dhcp_hostname(device, IpFamily::V6).map(|n| (n, HostnameSource::Dhcp6))
            }
            (None, None) => None,
        };
        if let Some((name, source)) = dhcp {
            self.set_hostname(ctx, Some(name), source);
            return;
        }

        if let Some(orig) = self.orig_hostname.clone() {
            self.set_hostname(ctx, Some(orig), HostnameSource::Startup);
            return;
        }

        let target = match (best4, best6) {
            (Some(device), _) => Some((device, IpFamily::V4)),
            (None, Some(device)) => Some((device, IpFamily::V6)),
            (None, None) => None,
        };
        let lookup = target.and_then(|(device, family)| {
            let config = device.ip_config(family)?;
            let first = config.addresses.first()?;
            (!config.nameservers.is_empty()).then_some((device.id(), first.address))
        });

        match lookup {
            Some((device, address)) => {
                self.resolver.start(device, address);
            }
            None => self.set_hostname(ctx, None, HostnameSource::Fallback),
        }
    }

    fn set_hostname(&mut self, ctx: &mut Context, name: Option<String>, source: HostnameSource) {
        self.hostname_source = source;

        // Leave an untouched startup hostname alone
        if self.orig_hostname.is_some() && !self.hostname_changed && self.orig_hostname == name {
            return;
        }
        if self.cur_hostname == name {
            return;
        }

        let effective = name.as_deref().unwrap_or(FALLBACK_HOSTNAME).to_string();
        log::info!(
            "Setting system hostname to '{}' ({})",
            effective,
            source.as_str()
        );
        self.cur_hostname = name;
        self.hostname_changed = true;

        ctx.services.dns.set_hostname(self.cur_hostname.as_deref());
        if ctx.services.system.set_hostname(&effective) {
            ctx.services
                .dispatcher
                .run(DispatchAction::Hostname, None, None);
        } else {
            log::warn!("Couldn't set the system hostname to '{}'", effective);
        }
    }

    /// Reverse lookup finished
    pub fn lookup_done(&mut self, ctx: &mut Context, generation: u64, result: Option<String>) {
        match self.resolver.complete(generation, result) {
            Some(Some(name)) => self.set_hostname(ctx, Some(name), HostnameSource::ReverseLookup),
            Some(None) => self.set_hostname(ctx, None, HostnameSource::Fallback),
            None => {}
        }
    }

    pub fn set_configured_hostname(
        &mut self,
        ctx: &mut Context,
        devices: &[Device],
        hostname: Option<String>,
    ) {
        self.configured_hostname = hostname;
        self.update_hostname(ctx, devices);
    }

    pub fn vpn_activated(&mut self, ctx: &mut Context, devices: &mut [Device], vpn: VpnConnection) {
        log::info!("VPN connection '{}' ({}) activated", vpn.id, vpn.iface);
        self.vpns.retain(|v| v.vpn.id != vpn.id);
        self.vpns.push(ActiveVpn {
            vpn,
            default: [false; 2],
        });
        self.update_routing_and_dns(ctx, devices, true);
    }

    pub fn vpn_deactivated(&mut self, ctx: &mut Context, devices: &mut [Device], id: &str) -> bool {
        let Some(pos) = self.vpns.iter().position(|v| v.vpn.id == id) else {
            return false;
        };
        let active = self.vpns.remove(pos);
        log::info!("VPN connection '{}' deactivated", id);
        for family in IpFamily::ALL {
            if let Some(config) = active.vpn.config(family) {
                ctx.services.dns.remove(&active.vpn.iface, config);
            }
        }
        self.update_routing_and_dns(ctx, devices, true);
        true
    }

    pub fn connection_added(
        &mut self,
        ctx: &mut Context,
        devices: &[Device],
        settings: &mut Settings,
        uuid: &str,
    ) {
        settings.reset_retries(uuid);
        self.schedule_activate_all(ctx, devices);
    }

    pub fn connection_updated(
        &mut self,
        ctx: &mut Context,
        devices: &[Device],
        settings: &mut Settings,
        uuid: &str,
    ) {
        // The zone may have changed under an activated device
        if let Some(firewall) = ctx.services.firewall.as_mut() {
            for device in devices {
                if device.state() != DeviceState::Activated {
                    continue;
                }
                let Some(conn) = device.connection().filter(|c| c.uuid == uuid) else {
                    continue;
                };
                firewall.add_or_change(
                    device.id(),
                    IpFamily::V4,
                    device.name(),
                    conn.zone.as_deref(),
                );
            }
        }
        settings.reset_retries(uuid);
        self.schedule_activate_all(ctx, devices);
    }

    pub fn connection_removed(&mut self, ctx: &mut Context, devices: &mut [Device], uuid: &str) {
        deactivate_if_active(ctx, devices, uuid);
    }

    pub fn visibility_changed(
        &mut self,
        ctx: &mut Context,
        devices: &mut [Device],
        uuid: &str,
        visible: bool,
    ) {
        if visible {
            self.schedule_activate_all(ctx, devices);
        } else {
            deactivate_if_active(ctx, devices, uuid);
        }
    }

    /// A secrets agent appeared; connections that failed for lack of
    /// secrets get another chance
    pub fn secrets_agent_registered(
        &mut self,
        ctx: &mut Context,
        devices: &[Device],
        settings: &mut Settings,
    ) {
        let budget = settings.default_retries();
        for conn in settings.iter_mut() {
            if conn.failure_reason() == Some(StateReason::NoSecrets) {
                conn.reset_retries(budget);
            }
        }
        self.schedule_activate_all(ctx, devices);
    }

    /// Sleep or wake; pending checks are dropped on the way down
    pub fn set_sleeping(&mut self, ctx: &mut Context, settings: &mut Settings, sleeping: bool) {
        if self.sleeping == sleeping {
            return;
        }
        self.sleeping = sleeping;
        settings.reset_all_retries();
        if sleeping {
            self.pending_checks.clear();
            ctx.queue
                .cancel_where(|t| matches!(t, Task::ActivationCheck { .. }));
        }
    }

    pub fn device_removed(&mut self, ctx: &mut Context, devices: &mut [Device], device: DeviceId) {
        if self.pending_checks.remove(&device) {
            ctx.queue
                .cancel_where(|t| *t == Task::ActivationCheck { device });
        }
        self.resolver.cancel_for(device);
        self.update_routing_and_dns(ctx, devices, false);
    }
}

fn clear_default_flags(devices: &mut [Device], family: IpFamily) {
    for device in devices.iter_mut() {
        if let Some(request) = device.request_mut() {
            request.set_default(family, false);
        }
    }
}

fn deactivate_if_active(ctx: &mut Context, devices: &mut [Device], uuid: &str) {
    for device in devices.iter_mut() {
        if device.request().is_some_and(|r| r.uuid() == uuid) {
            log::info!(
                "({}): deactivating connection '{}'",
                device.name(),
                uuid
            );
            let _ = device.deactivate(ctx, StateReason::ConnectionRemoved);
        }
    }
}
