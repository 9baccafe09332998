//! Shared runtime context handed to devices and the policy engine
//!
//! Devices never call each other or the policy directly. They act on the
//! collaborators in [`Services`], push deferred work onto the queue, and
//! record state-change notifications that the manager fans out once the
//! emitting device's handler has returned.

use crate::connection::ConnectionSettings;
use crate::dispatcher::Dispatcher;
use crate::dns::DnsManager;
use crate::firewall::ZoneAssigner;
use crate::policy::PriorityTable;
use crate::scheduler::EventQueue;
use crate::secrets::SecretsBroker;
use crate::shared::{SharedAddressPool, SharingBackend};
use crate::system::SystemConfigurator;
use crate::transport::Transport;
use crate::types::{DeviceId, DeviceState, StateReason};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Outbound collaborators
pub struct Services {
    pub system: Box<dyn SystemConfigurator>,
    pub dns: Box<dyn DnsManager>,
    pub transport: Box<dyn Transport>,
    pub dispatcher: Box<dyn Dispatcher>,
    pub secrets: Box<dyn SecretsBroker>,
    /// Zone assignment is skipped entirely when no firewall is configured
    pub firewall: Option<Box<dyn ZoneAssigner>>,
    pub sharing: Box<dyn SharingBackend>,
}

/// Tunables read from the configuration
#[derive(Debug, Clone)]
pub struct Options {
    pub dhcp_timeout: Duration,
    pub priorities: PriorityTable,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dhcp_timeout: Duration::from_secs(45),
            priorities: PriorityTable::default(),
        }
    }
}

/// One state transition as seen by observers
#[derive(Debug, Clone)]
pub struct StateNotification {
    pub device: DeviceId,
    pub new: DeviceState,
    pub old: DeviceState,
    pub reason: StateReason,
    /// Connection still bound to the device after the transition
    pub connection: Option<Rc<ConnectionSettings>>,
}

pub struct Context {
    pub services: Services,
    pub queue: EventQueue,
    pub pool: SharedAddressPool,
    pub options: Options,
    /// Loop time; advanced by the manager, never read from the clock here
    pub now: Instant,
    notifications: Vec<StateNotification>,
    config_changed: bool,
}

impl Context {
    pub fn new(services: Services, options: Options, now: Instant) -> Self {
        Self {
            services,
            queue: EventQueue::new(),
            pool: SharedAddressPool::new(),
            options,
            now,
            notifications: Vec::new(),
            config_changed: false,
        }
    }

    pub fn notify(&mut self, notification: StateNotification) {
        self.notifications.push(notification);
    }

    pub fn take_notifications(&mut self) -> Vec<StateNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// An activated device replaced one of its configs
    pub fn mark_config_changed(&mut self) {
        self.config_changed = true;
    }

    pub fn take_config_changed(&mut self) -> bool {
        std::mem::take(&mut self.config_changed)
    }
}
