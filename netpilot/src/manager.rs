// Device registry and event dispatch

//! Device manager
//!
//! The [`Manager`] owns every device, the settings store, the policy engine
//! and the shared [`Context`]. It is the single entry point for inbound
//! requests, collaborator events and queued tasks. After each handler it
//! fans the recorded state notifications out to the policy, so no observer
//! ever runs inside a device's own transition.

use crate::activation::ActivationRequest;
use crate::config::connection_settings;
use crate::connection::{Change, ConnectionSettings, Settings};
use crate::context::{Context, Options, Services, StateNotification};
use crate::device::{hooks_for, Device, MasterStatus};
use crate::error::{ActivationError, DeactivationError};
use crate::hostname::{HostnameResolver, ReverseLookup};
use crate::ip_config::IpMethod;
use crate::policy::{find_master, Policy, PriorityTable, VpnConnection};
use crate::scheduler::{Event, Task};
use crate::state_file::{DeviceStatus, Snapshot};
use crate::system;
use crate::types::{Config, DeviceId, DeviceKind, DeviceState, IpFamily, StateReason};
use anyhow::{Context as _, Result};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Owner of all devices and the policy engine
pub struct Manager {
    devices: Vec<Device>,
    settings: Settings,
    policy: Policy,
    ctx: Context,
    next_id: u32,
    /// Devices unmanaged by sleep, re-managed on wake
    asleep: HashSet<DeviceId>,
}

impl Manager {
    pub fn new(
        services: Services,
        options: Options,
        settings: Settings,
        policy: Policy,
        now: Instant,
    ) -> Self {
        Self {
            devices: Vec::new(),
            settings,
            policy,
            ctx: Context::new(services, options, now),
            next_id: 0,
            asleep: HashSet::new(),
        }
    }

    /// Build a manager from the configuration file; devices and connections
    /// are registered but nothing runs until the loop drains the queue
    pub fn from_config(
        config: &Config,
        services: Services,
        lookup: Box<dyn ReverseLookup>,
        orig_hostname: Option<String>,
        now: Instant,
    ) -> Result<Self> {
        let general = &config.general;
        let options = Options {
            dhcp_timeout: Duration::from_secs(general.dhcp_timeout),
            priorities: PriorityTable::from_config(&config.priorities)?,
        };
        let settings = Settings::new(general.autoconnect_retries, general.permissions.clone());
        let policy = Policy::new(
            HostnameResolver::new(lookup),
            orig_hostname,
            general.hostname.clone(),
            Duration::from_secs(general.retry_reset_secs),
        );
        let mut manager = Self::new(services, options, settings, policy, now);

        for conn in &config.connections {
            let settings = connection_settings(conn)
                .with_context(|| format!("Invalid connection '{}'", conn.id))?;
            manager.add_connection(settings, conn.visible);
        }

        for dev in &config.devices {
            let kind = dev
                .kind
                .parse::<DeviceKind>()
                .map_err(|e| anyhow::anyhow!("Device {}: {}", dev.name, e))?;
            let ifindex = match dev.ifindex {
                Some(index) => index,
                None => system::read_ifindex(&dev.name)?,
            };
            let present = if general.assume_existing && dev.managed {
                system::interface_addresses(&dev.name).unwrap_or_else(|e| {
                    log::warn!("({}): couldn't read existing addresses: {}", dev.name, e);
                    Vec::new()
                })
            } else {
                Vec::new()
            };
            manager.add_existing_device(&dev.name, ifindex, kind, dev.managed, &present);
        }

        Ok(manager)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn device_by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn now(&self) -> Instant {
        self.ctx.now
    }

    fn index_of(&self, id: DeviceId) -> Option<usize> {
        self.devices.iter().position(|d| d.id() == id)
    }

    /// Register a device; it starts unmanaged and becomes managed if asked
    pub fn add_device(&mut self, name: &str, ifindex: u32, kind: DeviceKind, managed: bool) -> DeviceId {
        self.add_existing_device(name, ifindex, kind, managed, &[])
    }

    /// Register a device whose interface already carries `present`. When a
    /// compatible connection covers them, the device is managed without
    /// teardown and that connection is activated as assumed.
    pub fn add_existing_device(
        &mut self,
        name: &str,
        ifindex: u32,
        kind: DeviceKind,
        managed: bool,
        present: &[IpAddr],
    ) -> DeviceId {
        self.next_id += 1;
        let id = DeviceId(self.next_id);
        let mut device = Device::new(id, name, ifindex, hooks_for(kind));
        log::info!("({}): new {} device (ifindex {})", name, kind, ifindex);

        device.state_changed(&mut self.ctx, DeviceState::Unmanaged, StateReason::None);
        let mut assumed = None;
        if managed {
            if self.policy.is_sleeping() {
                self.asleep.insert(id);
            } else {
                assumed = self.assumable(&device, present);
                let reason = if assumed.is_some() {
                    StateReason::ConnectionAssumed
                } else {
                    StateReason::NowManaged
                };
                device.set_managed(&mut self.ctx, true, reason);
            }
        }
        self.devices.push(device);
        self.flush();

        if let Some(uuid) = assumed {
            log::info!("({}): assuming existing configuration with connection '{}'", name, uuid);
            if let Err(e) = self.activate_connection(&uuid, id, true) {
                log::warn!("({}): couldn't assume connection '{}': {}", name, uuid, e);
            }
        }
        id
    }

    /// A connection whose manual IPv4 addresses are all in `present`
    fn assumable(&self, device: &Device, present: &[IpAddr]) -> Option<String> {
        if present.is_empty() {
            return None;
        }
        self.settings
            .iter()
            .find(|conn| {
                let ip4 = conn.settings().ip(IpFamily::V4);
                ip4.method == IpMethod::Manual
                    && !ip4.addresses.is_empty()
                    && ip4.addresses.iter().all(|a| present.contains(&a.address))
                    && device.check_compatible(conn.settings()).is_ok()
            })
            .map(|conn| conn.uuid().to_string())
    }

    pub fn remove_device(&mut self, id: DeviceId) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        log::info!("({}): device removed", self.devices[index].name());
        self.devices[index].state_changed(&mut self.ctx, DeviceState::Unmanaged, StateReason::Removed);
        self.flush();

        self.devices.remove(index);
        self.asleep.remove(&id);
        self.ctx.queue.cancel_where(|t| match t {
            Task::QueuedState { device, .. } | Task::Stage { device, .. } => *device == id,
            _ => false,
        });
        self.policy.device_removed(&mut self.ctx, &mut self.devices, id);
        self.flush();
        true
    }

    pub fn set_managed(&mut self, id: DeviceId, managed: bool) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        if self.policy.is_sleeping() {
            if managed {
                self.asleep.insert(id);
            } else {
                self.asleep.remove(&id);
            }
            return true;
        }
        let reason = if managed {
            StateReason::NowManaged
        } else {
            StateReason::NowUnmanaged
        };
        self.devices[index].set_managed(&mut self.ctx, managed, reason);
        self.flush();
        true
    }

    pub fn set_carrier(&mut self, id: DeviceId, carrier: bool) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        self.devices[index].set_carrier(&mut self.ctx, carrier);
        self.flush();
        true
    }

    /// Re-read carrier of every device from sysfs
    pub fn poll_carriers(&mut self) {
        for index in 0..self.devices.len() {
            if let Some(carrier) = system::read_carrier(self.devices[index].name()) {
                self.devices[index].set_carrier(&mut self.ctx, carrier);
            }
        }
        self.flush();
    }

    /// Sleep takes managed devices down; waking brings them back
    pub fn set_sleeping(&mut self, sleeping: bool) {
        if self.policy.is_sleeping() == sleeping {
            return;
        }
        log::info!("{} requested", if sleeping { "sleep" } else { "wake" });
        self.policy
            .set_sleeping(&mut self.ctx, &mut self.settings, sleeping);

        if sleeping {
            for device in &mut self.devices {
                if device.is_managed() {
                    self.asleep.insert(device.id());
                    device.set_managed(&mut self.ctx, false, StateReason::Sleeping);
                }
            }
        } else {
            for device in &mut self.devices {
                if self.asleep.remove(&device.id()) {
                    device.set_managed(&mut self.ctx, true, StateReason::NowManaged);
                }
            }
        }
        self.flush();
    }

    /// Inbound activation of a prepared request
    pub fn activate(&mut self, id: DeviceId, request: ActivationRequest) -> Result<(), ActivationError> {
        let index = self.index_of(id).ok_or(ActivationError::UnknownDevice)?;
        let uuid = request.uuid().to_string();
        let result = self.devices[index].activate(&mut self.ctx, request);
        if result.is_ok() {
            // A connection is bound to at most one device
            for (i, other) in self.devices.iter_mut().enumerate() {
                if i == index || !other.request().is_some_and(|r| r.uuid() == uuid) {
                    continue;
                }
                log::info!("({}): connection '{}' moved to another device", other.name(), uuid);
                if let Err(e) = other.deactivate(&mut self.ctx, StateReason::UserRequested) {
                    log::warn!("({}): couldn't deactivate: {}", other.name(), e);
                }
            }
        }
        self.flush();
        result
    }

    /// Activate a stored connection on a device
    pub fn activate_connection(
        &mut self,
        uuid: &str,
        id: DeviceId,
        assumed: bool,
    ) -> Result<(), ActivationError> {
        let conn = self
            .settings
            .get(uuid)
            .ok_or(ActivationError::UnknownConnection)?;
        let request = ActivationRequest::new(std::rc::Rc::clone(conn.settings()));
        let request = if assumed {
            request.assumed()
        } else {
            request.user_requested()
        };
        self.activate(id, request)
    }

    pub fn deactivate(&mut self, id: DeviceId) -> Result<(), DeactivationError> {
        let index = self.index_of(id).ok_or(DeactivationError::UnknownDevice)?;
        let result = self.devices[index].deactivate(&mut self.ctx, StateReason::UserRequested);
        self.flush();
        result
    }

    /// Insert or replace a profile
    pub fn add_connection(&mut self, settings: ConnectionSettings, visible: bool) -> Change {
        let uuid = settings.uuid.clone();
        let change = self.settings.add(settings, visible);
        match change {
            Change::Added => {
                log::info!("Connection '{}' added", uuid);
                self.policy
                    .connection_added(&mut self.ctx, &self.devices, &mut self.settings, &uuid);
            }
            Change::Updated => {
                log::info!("Connection '{}' updated", uuid);
                self.policy
                    .connection_updated(&mut self.ctx, &self.devices, &mut self.settings, &uuid);
            }
            Change::Unchanged => {}
        }
        self.flush();
        change
    }

    /// Replace an existing profile
    pub fn update_connection(
        &mut self,
        settings: ConnectionSettings,
        visible: bool,
    ) -> Result<Change, ActivationError> {
        if self.settings.get(&settings.uuid).is_none() {
            return Err(ActivationError::UnknownConnection);
        }
        Ok(self.add_connection(settings, visible))
    }

    pub fn remove_connection(&mut self, uuid: &str) -> bool {
        if self.settings.remove(uuid).is_none() {
            return false;
        }
        log::info!("Connection '{}' removed", uuid);
        self.policy
            .connection_removed(&mut self.ctx, &mut self.devices, uuid);
        self.flush();
        true
    }

    pub fn set_connection_visible(&mut self, uuid: &str, visible: bool) -> bool {
        let allowed = match self.settings.get(uuid) {
            Some(conn) => self.settings.acl_allows(conn.settings()),
            None => return false,
        };
        let visible = visible && allowed;
        let Some(conn) = self.settings.get_mut(uuid) else {
            return false;
        };
        if conn.is_visible() == visible {
            return true;
        }
        conn.set_visible(visible);
        self.policy
            .visibility_changed(&mut self.ctx, &mut self.devices, uuid, visible);
        self.flush();
        true
    }

    pub fn secrets_agent_registered(&mut self) {
        self.policy
            .secrets_agent_registered(&mut self.ctx, &self.devices, &mut self.settings);
        self.flush();
    }

    pub fn set_configured_hostname(&mut self, hostname: Option<String>) {
        self.policy
            .set_configured_hostname(&mut self.ctx, &self.devices, hostname);
        self.flush();
    }

    pub fn vpn_activated(&mut self, vpn: VpnConnection) {
        self.policy.vpn_activated(&mut self.ctx, &mut self.devices, vpn);
        self.flush();
    }

    pub fn vpn_deactivated(&mut self, id: &str) -> bool {
        let found = self.policy.vpn_deactivated(&mut self.ctx, &mut self.devices, id);
        self.flush();
        found
    }

    /// Swap the connection list for a freshly loaded one
    pub fn reload_connections(&mut self, connections: Vec<(ConnectionSettings, bool)>) {
        let keep: HashSet<String> = connections.iter().map(|(c, _)| c.uuid.clone()).collect();
        let stale: Vec<String> = self
            .settings
            .iter()
            .map(|c| c.uuid().to_string())
            .filter(|uuid| !keep.contains(uuid))
            .collect();
        for uuid in stale {
            self.remove_connection(&uuid);
        }
        for (settings, visible) in connections {
            self.add_connection(settings, visible);
        }
    }

    /// Completion from an asynchronous collaborator
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Transport {
                device,
                family,
                attempt,
                event,
            } => {
                if let Some(index) = self.index_of(device) {
                    self.devices[index].transport_event(&mut self.ctx, family, attempt, event);
                }
            }
            Event::Secrets {
                device,
                call,
                result,
            } => {
                if let Some(index) = self.index_of(device) {
                    self.devices[index].secrets_reply(&mut self.ctx, call, result);
                }
            }
            Event::Zone {
                device,
                family,
                call,
            } => {
                if let Some(index) = self.index_of(device) {
                    self.devices[index].zone_reply(&mut self.ctx, family, call);
                }
            }
            Event::HostnameLookup { generation, result } => {
                self.policy.lookup_done(&mut self.ctx, generation, result);
            }
        }
        self.flush();
    }

    /// Run queued work until the ready queue is empty
    pub fn run_until_idle(&mut self) {
        self.flush();
        while let Some(task) = self.ctx.queue.pop() {
            self.run_task(task);
            self.flush();
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::QueuedState { device, token } => {
                if let Some(index) = self.index_of(device) {
                    self.devices[index].run_queued_state(&mut self.ctx, token);
                }
            }
            Task::Stage {
                device,
                family,
                token,
            } => {
                let Some(index) = self.index_of(device) else {
                    return;
                };
                let master = self.master_status(index);
                self.devices[index].run_stage(&mut self.ctx, family, token, &master);
            }
            Task::ActivationCheck { device } => {
                self.policy
                    .run_activation_check(&mut self.ctx, &mut self.devices, &self.settings, device);
            }
            Task::ResetRetries => {
                self.policy
                    .reset_retries_sweep(&mut self.ctx, &self.devices, &mut self.settings);
            }
        }
    }

    /// Where the master of a slave device's connection stands
    fn master_status(&self, index: usize) -> MasterStatus {
        let device = &self.devices[index];
        let Some(master) = device.connection().and_then(|c| c.master.as_deref()) else {
            return MasterStatus::NotRequired;
        };
        match find_master(&self.devices, master) {
            Some(m) if m.id() != device.id() && m.request().is_some() => MasterStatus::Ready {
                id: m.id(),
                iface: m.name().to_string(),
            },
            _ => MasterStatus::Waiting,
        }
    }

    /// Fan recorded notifications out to the policy until none are left
    fn flush(&mut self) {
        loop {
            let notes = self.ctx.take_notifications();
            let changed = self.ctx.take_config_changed();
            if notes.is_empty() && !changed {
                break;
            }
            for note in &notes {
                self.state_notified(note);
            }
            if changed {
                self.policy
                    .update_routing_and_dns(&mut self.ctx, &mut self.devices, true);
            }
        }
    }

    fn state_notified(&mut self, note: &StateNotification) {
        self.policy
            .device_state_changed(&mut self.ctx, &mut self.devices, &mut self.settings, note);
    }

    /// Move the loop clock forward and run whatever became due
    pub fn advance_to(&mut self, now: Instant) {
        if now > self.ctx.now {
            self.ctx.now = now;
        }
        self.ctx.queue.fire_due(self.ctx.now);
        self.run_until_idle();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.ctx.queue.next_deadline()
    }

    /// Deactivate everything before exit
    pub fn shutdown(&mut self) {
        for device in &mut self.devices {
            if device.request().is_some() {
                let _ = device.deactivate(&mut self.ctx, StateReason::Removed);
            }
        }
        self.policy.set_sleeping(&mut self.ctx, &mut self.settings, true);
        self.flush();
    }

    /// Observable state of every device plus the hostname
    pub fn snapshot(&self) -> Snapshot {
        let devices = self
            .devices
            .iter()
            .map(|d| {
                let addresses = |family: IpFamily| -> Vec<String> {
                    d.ip_config(family)
                        .map(|c| {
                            c.addresses
                                .iter()
                                .map(|a| format!("{}/{}", a.address, a.prefix))
                                .collect()
                        })
                        .unwrap_or_default()
                };
                DeviceStatus {
                    name: d.name().to_string(),
                    kind: d.kind(),
                    state: d.state(),
                    managed: d.is_managed(),
                    firmware_missing: d.firmware_missing(),
                    connection: d.connection().map(|c| c.id.clone()),
                    ip4: addresses(IpFamily::V4),
                    ip6: addresses(IpFamily::V6),
                    default4: d.request().is_some_and(|r| r.is_default(IpFamily::V4)),
                    default6: d.request().is_some_and(|r| r.is_default(IpFamily::V6)),
                }
            })
            .collect();

        Snapshot {
            devices,
            hostname: self.policy.hostname().map(str::to_string),
            hostname_source: self.policy.hostname_source(),
        }
    }
}
