//! Recording fakes for every collaborator, plus a manager harness

use crate::activation::ActivationRequest;
use crate::connection::ConnectionSettings;
use crate::context::{Options, Services};
use crate::device::DeviceHooks;
use crate::dispatcher::{DispatchAction, Dispatcher};
use crate::dns::{DnsClass, DnsManager};
use crate::firewall::ZoneAssigner;
use crate::hostname::{HostnameResolver, ReverseLookup};
use crate::ip_config::{Address, ConfigDiff, IpConfig};
use crate::manager::Manager;
use crate::policy::{Policy, RESET_RETRIES_TIMER, RETRIES_DEFAULT};
use crate::scheduler::Event;
use crate::secrets::{SecretsBroker, SecretsFlags};
use crate::shared::{ShareRule, SharingBackend};
use crate::connection::Settings;
use crate::system::{LinkError, SystemConfigurator};
use crate::transport::{
    LeaseOptions, Transport, TransportError, TransportEvent, TransportHandle, TransportRequest,
};
use crate::types::{CallId, DeviceId, DeviceKind, IpFamily, StageResult};
use std::cell::{Cell, RefCell};
use std::net::IpAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// One recorded collaborator call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Apply {
        iface: String,
        family: IpFamily,
        addresses: Vec<IpAddr>,
        nameservers: Vec<IpAddr>,
    },
    Flush {
        iface: String,
        family: IpFamily,
    },
    LinkUp(String),
    LinkDown(String),
    Enslave {
        master: String,
        slave: String,
    },
    Release {
        master: String,
        slave: String,
    },
    DefaultRoute {
        iface: String,
        family: IpFamily,
    },
    SetHostname(String),
    DnsAdd {
        iface: String,
        family: IpFamily,
        class: DnsClass,
    },
    DnsRemove {
        iface: String,
        family: IpFamily,
    },
    DnsHostname(Option<String>),
    TransportStart {
        iface: String,
        family: IpFamily,
        attempt: u64,
    },
    TransportStop(TransportHandle),
    Dispatch {
        action: DispatchAction,
        iface: Option<String>,
    },
    SecretsRequest {
        call: CallId,
        setting: String,
    },
    SecretsCancel(CallId),
    ZoneAdd {
        iface: String,
        family: IpFamily,
        call: CallId,
    },
    ZoneRemove(String),
    ZoneCancel(CallId),
    SharingStart(String),
    SharingStop(String),
    Lookup {
        generation: u64,
        address: IpAddr,
    },
    LookupCancel(u64),
    /// Kind hook of stage 1 ran for the interface
    HookPrepare(String),
}

/// Switches that make the fakes fail
#[derive(Debug, Default)]
pub struct Faults {
    pub apply_fails: bool,
    pub firmware_missing: bool,
    pub link_fails: bool,
    pub enslave_fails: bool,
    pub transport_fails: bool,
    pub sharing_fails: bool,
    pub set_hostname_fails: bool,
}

type Log = Rc<RefCell<Vec<Call>>>;

/// Shared recorder behind every fake
#[derive(Clone, Default)]
pub struct Fakes {
    log: Log,
    pub faults: Rc<RefCell<Faults>>,
    next_id: Rc<Cell<u64>>,
    firewall: bool,
}

impl Fakes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_firewall() -> Self {
        Self {
            firewall: true,
            ..Self::default()
        }
    }

    pub fn services(&self) -> Services {
        Services {
            system: Box::new(FakeSystem(self.clone())),
            dns: Box::new(FakeDns(self.clone())),
            transport: Box::new(FakeTransport(self.clone())),
            dispatcher: Box::new(FakeDispatcher(self.clone())),
            secrets: Box::new(FakeSecrets(self.clone())),
            firewall: self
                .firewall
                .then(|| Box::new(FakeZones(self.clone())) as Box<dyn ZoneAssigner>),
            sharing: Box::new(FakeSharing(self.clone())),
        }
    }

    pub fn lookup(&self) -> Box<dyn ReverseLookup> {
        Box::new(FakeLookup(self.clone()))
    }

    fn record(&self, call: Call) {
        self.log.borrow_mut().push(call);
    }

    fn next(&self) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.borrow().clone()
    }

    pub fn clear(&self) {
        self.log.borrow_mut().clear();
    }

    pub fn has(&self, call: &Call) -> bool {
        self.log.borrow().contains(call)
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.log.borrow().iter().filter(|c| pred(c)).count()
    }

    pub fn last_secrets_call(&self) -> Option<CallId> {
        self.log.borrow().iter().rev().find_map(|c| match c {
            Call::SecretsRequest { call, .. } => Some(*call),
            _ => None,
        })
    }

    pub fn last_zone_call(&self) -> Option<CallId> {
        self.log.borrow().iter().rev().find_map(|c| match c {
            Call::ZoneAdd { call, .. } => Some(*call),
            _ => None,
        })
    }

    pub fn last_lookup(&self) -> Option<(u64, IpAddr)> {
        self.log.borrow().iter().rev().find_map(|c| match c {
            Call::Lookup {
                generation,
                address,
            } => Some((*generation, *address)),
            _ => None,
        })
    }

    /// Hostnames pushed to the system, in order
    pub fn hostnames(&self) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::SetHostname(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

struct FakeSystem(Fakes);

impl SystemConfigurator for FakeSystem {
    fn apply(
        &mut self,
        iface: &str,
        _ifindex: u32,
        config: &IpConfig,
        _priority: u32,
        _diff: &ConfigDiff,
    ) -> bool {
        self.0.record(Call::Apply {
            iface: iface.to_string(),
            family: config.family,
            addresses: config.addresses.iter().map(|a| a.address).collect(),
            nameservers: config.nameservers.clone(),
        });
        !self.0.faults.borrow().apply_fails
    }

    fn flush(&mut self, iface: &str, _ifindex: u32, family: IpFamily) {
        self.0.record(Call::Flush {
            iface: iface.to_string(),
            family,
        });
    }

    fn link_up(&mut self, iface: &str) -> Result<(), LinkError> {
        self.0.record(Call::LinkUp(iface.to_string()));
        let faults = self.0.faults.borrow();
        if faults.firmware_missing {
            Err(LinkError::FirmwareMissing)
        } else if faults.link_fails {
            Err(LinkError::Failed("no such device".to_string()))
        } else {
            Ok(())
        }
    }

    fn link_down(&mut self, iface: &str) {
        self.0.record(Call::LinkDown(iface.to_string()));
    }

    fn enslave(&mut self, master: &str, slave: &str) -> bool {
        self.0.record(Call::Enslave {
            master: master.to_string(),
            slave: slave.to_string(),
        });
        !self.0.faults.borrow().enslave_fails
    }

    fn release(&mut self, master: &str, slave: &str) {
        self.0.record(Call::Release {
            master: master.to_string(),
            slave: slave.to_string(),
        });
    }

    fn replace_default_route(
        &mut self,
        iface: &str,
        family: IpFamily,
        _gateway: Option<IpAddr>,
    ) -> bool {
        self.0.record(Call::DefaultRoute {
            iface: iface.to_string(),
            family,
        });
        true
    }

    fn set_hostname(&mut self, hostname: &str) -> bool {
        self.0.record(Call::SetHostname(hostname.to_string()));
        !self.0.faults.borrow().set_hostname_fails
    }
}

struct FakeDns(Fakes);

impl DnsManager for FakeDns {
    fn add(&mut self, iface: &str, config: &IpConfig, class: DnsClass) {
        self.0.record(Call::DnsAdd {
            iface: iface.to_string(),
            family: config.family,
            class,
        });
    }

    fn remove(&mut self, iface: &str, config: &IpConfig) {
        self.0.record(Call::DnsRemove {
            iface: iface.to_string(),
            family: config.family,
        });
    }

    fn set_hostname(&mut self, hostname: Option<&str>) {
        self.0.record(Call::DnsHostname(hostname.map(str::to_string)));
    }
}

struct FakeTransport(Fakes);

impl Transport for FakeTransport {
    fn start(&mut self, request: TransportRequest) -> Result<TransportHandle, TransportError> {
        if self.0.faults.borrow().transport_fails {
            return Err(TransportError::NotConfigured);
        }
        self.0.record(Call::TransportStart {
            iface: request.iface,
            family: request.family,
            attempt: request.attempt,
        });
        Ok(TransportHandle(self.0.next()))
    }

    fn stop(&mut self, handle: TransportHandle) {
        self.0.record(Call::TransportStop(handle));
    }
}

struct FakeDispatcher(Fakes);

impl Dispatcher for FakeDispatcher {
    fn run(
        &mut self,
        action: DispatchAction,
        _connection: Option<&ConnectionSettings>,
        iface: Option<&str>,
    ) {
        self.0.record(Call::Dispatch {
            action,
            iface: iface.map(str::to_string),
        });
    }
}

struct FakeSecrets(Fakes);

impl SecretsBroker for FakeSecrets {
    fn request(
        &mut self,
        _device: DeviceId,
        _connection: &ConnectionSettings,
        setting: &str,
        _flags: SecretsFlags,
        _hint: Option<&str>,
    ) -> CallId {
        let call = CallId(self.0.next());
        self.0.record(Call::SecretsRequest {
            call,
            setting: setting.to_string(),
        });
        call
    }

    fn cancel(&mut self, call: CallId) {
        self.0.record(Call::SecretsCancel(call));
    }
}

struct FakeZones(Fakes);

impl ZoneAssigner for FakeZones {
    fn add_or_change(
        &mut self,
        _device: DeviceId,
        family: IpFamily,
        iface: &str,
        _zone: Option<&str>,
    ) -> CallId {
        let call = CallId(self.0.next());
        self.0.record(Call::ZoneAdd {
            iface: iface.to_string(),
            family,
            call,
        });
        call
    }

    fn remove(&mut self, iface: &str, _zone: Option<&str>) {
        self.0.record(Call::ZoneRemove(iface.to_string()));
    }

    fn cancel(&mut self, call: CallId) {
        self.0.record(Call::ZoneCancel(call));
    }
}

struct FakeSharing(Fakes);

impl SharingBackend for FakeSharing {
    fn start(&mut self, iface: &str, _config: &IpConfig, _rules: &[ShareRule]) -> anyhow::Result<()> {
        self.0.record(Call::SharingStart(iface.to_string()));
        if self.0.faults.borrow().sharing_fails {
            anyhow::bail!("dnsmasq failed to start");
        }
        Ok(())
    }

    fn stop(&mut self, iface: &str, _rules: &[ShareRule]) {
        self.0.record(Call::SharingStop(iface.to_string()));
    }
}

struct FakeLookup(Fakes);

impl ReverseLookup for FakeLookup {
    fn start(&mut self, generation: u64, address: IpAddr) {
        self.0.record(Call::Lookup {
            generation,
            address,
        });
    }

    fn cancel(&mut self, generation: u64) {
        self.0.record(Call::LookupCancel(generation));
    }
}

/// Device hooks of `kind` that record when stage 1 reaches them
pub struct RecordingHooks {
    fakes: Fakes,
    kind: DeviceKind,
    iface: String,
}

impl RecordingHooks {
    pub fn new(fakes: &Fakes, kind: DeviceKind, iface: &str) -> Self {
        Self {
            fakes: fakes.clone(),
            kind,
            iface: iface.to_string(),
        }
    }
}

impl DeviceHooks for RecordingHooks {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn stage1_prepare(&mut self, _settings: &ConnectionSettings) -> StageResult {
        self.fakes.record(Call::HookPrepare(self.iface.clone()));
        StageResult::Success
    }
}

/// A lease event for `family` with one address behind `gateway`
pub fn lease(family: IpFamily, address: &str, gateway: &str) -> TransportEvent {
    lease_with(family, address, gateway, LeaseOptions::new())
}

pub fn lease_with(
    family: IpFamily,
    address: &str,
    gateway: &str,
    options: LeaseOptions,
) -> TransportEvent {
    let prefix = if family == IpFamily::V4 { 24 } else { 64 };
    let mut config = IpConfig::new(family);
    config.addresses.push(
        Address::new(address.parse().unwrap(), prefix).with_gateway(gateway.parse().unwrap()),
    );
    config.nameservers.push(gateway.parse().unwrap());
    TransportEvent::Lease { config, options }
}

/// Manager wired to recording fakes, with a hand-driven clock
pub struct Harness {
    pub manager: Manager,
    pub fakes: Fakes,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Harness whose system had `orig` as hostname at start and `configured`
    /// set persistently
    pub fn with_hostnames(orig: Option<&str>, configured: Option<&str>) -> Self {
        Self::build(orig, configured)
    }

    fn build(orig: Option<&str>, configured: Option<&str>) -> Self {
        let fakes = Fakes::new();
        let policy = Policy::new(
            HostnameResolver::new(fakes.lookup()),
            orig.map(str::to_string),
            configured.map(str::to_string),
            RESET_RETRIES_TIMER,
        );
        let manager = Manager::new(
            fakes.services(),
            Options::default(),
            Settings::new(RETRIES_DEFAULT, vec!["sharing".to_string()]),
            policy,
            Instant::now(),
        );
        Self { manager, fakes }
    }

    /// Managed device with carrier, settled in `Disconnected`
    pub fn device(&mut self, name: &str, kind: DeviceKind) -> DeviceId {
        let id = self.manager.add_device(name, 10 + self.manager.devices().len() as u32, kind, true);
        self.manager.set_carrier(id, true);
        self.manager.run_until_idle();
        id
    }

    pub fn connection(&mut self, settings: ConnectionSettings) {
        self.manager.add_connection(settings, true);
        self.manager.run_until_idle();
    }

    pub fn activate(&mut self, id: DeviceId, settings: ConnectionSettings) {
        self.manager
            .activate(id, ActivationRequest::new(Rc::new(settings)))
            .unwrap();
        self.manager.run_until_idle();
    }

    pub fn event(&mut self, id: DeviceId, family: IpFamily, event: TransportEvent) {
        let attempt = self.manager.device(id).unwrap().attempt();
        self.manager.handle_event(Event::Transport {
            device: id,
            family,
            attempt,
            event,
        });
        self.manager.run_until_idle();
    }

    pub fn lease(&mut self, id: DeviceId, family: IpFamily, address: &str, gateway: &str) {
        self.event(id, family, lease(family, address, gateway));
    }

    pub fn advance(&mut self, by: Duration) {
        let now = self.manager.now() + by;
        self.manager.advance_to(now);
    }
}
