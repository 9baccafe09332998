// Per-device activation state machine

//! Device activation state machine
//!
//! A [`Device`] owns one interface's lifecycle. Activation runs as a
//! five-stage pipeline; every stage is a [`Task::Stage`] on the event queue,
//! never a direct call, so a stage can freely change state without
//! re-entering itself:
//!
//! 1. Prepare: wait for the master (if any), enslave, kind hook
//! 2. Config: secrets, bring the link up
//! 3. IP Configure Start: start both families independently
//! 4. IP Configure Timeout (per family)
//! 5. IP Commit (per family)
//!
//! Stages 1-3 run in the IPv4 slot; stages 4 and 5 use their family's slot.
//! Because every state change cancels both slots, a family result that
//! arrives while the other family is committing is parked in
//! `outcomes` and rescheduled after the transition.

pub mod kind;

pub use kind::{hooks_for, DeviceHooks};

use crate::activation::{ActivationRequest, Secrets};
use crate::connection::ConnectionSettings;
use crate::context::{Context, StateNotification};
use crate::dispatcher::DispatchAction;
use crate::dns::DnsClass;
use crate::error::{ActivationError, DeactivationError};
use crate::ip_config::{merge, ConfigDiff, IpConfig, IpMethod};
use crate::scheduler::{Slot, Task, Token};
use crate::secrets::SecretsFlags;
use crate::shared::share_rules;
use crate::system::LinkError;
use crate::transport::{LeaseOptions, TransportEvent, TransportHandle, TransportRequest};
use crate::types::{
    CallId, DeviceId, DeviceKind, DeviceState, IpFamily, IpSubState, StageResult, StateReason,
};
use std::rc::Rc;

/// Activation pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Config,
    IpConfigStart,
    IpTimeout,
    IpCommit,
}

impl Stage {
    fn describe(self, family: IpFamily) -> String {
        match self {
            Stage::Prepare => "Stage 1 of 5 (Device Prepare)".to_string(),
            Stage::Config => "Stage 2 of 5 (Device Configure)".to_string(),
            Stage::IpConfigStart => "Stage 3 of 5 (IP Configure Start)".to_string(),
            Stage::IpTimeout => format!("Stage 4 of 5 ({} Configure Timeout)", family),
            Stage::IpCommit => format!("Stage 5 of 5 ({} Commit)", family),
        }
    }
}

/// Master dependency of a slave connection, resolved by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterStatus {
    NotRequired,
    /// Master device absent or not yet activating
    Waiting,
    Ready { id: DeviceId, iface: String },
}

/// Result of starting one family in stage 3
enum IpStart {
    Ready(IpConfig),
    Postpone,
    Stop,
    Failure(StateReason),
}

/// Family result waiting for its stage 4/5 to run
#[derive(Debug)]
enum Outcome {
    Ready(IpConfig),
    Expired(StateReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedState {
    state: DeviceState,
    reason: StateReason,
}

pub struct Device {
    id: DeviceId,
    name: String,
    ifindex: u32,
    hooks: Box<dyn DeviceHooks>,
    state: DeviceState,
    managed: bool,
    firmware_missing: bool,
    carrier: bool,
    ip_state: [IpSubState; 2],
    ip_config: [Option<IpConfig>; 2],
    dhcp_options: [LeaseOptions; 2],
    /// Non-owning link to the master device, with its interface name
    master: Option<(DeviceId, String)>,
    waiting_for_master: bool,
    request: Option<ActivationRequest>,
    queued: Slot<QueuedState>,
    stages: [Slot<Stage>; 2],
    /// Attempt id stamped on transport requests; bumps per activation
    attempt: u64,
    transports: [Option<TransportHandle>; 2],
    outcomes: [Option<Outcome>; 2],
    secrets_call: Option<CallId>,
    zone_calls: [Option<CallId>; 2],
    zone_done: [bool; 2],
    sharing_active: bool,
}

impl Device {
    pub fn new(id: DeviceId, name: &str, ifindex: u32, hooks: Box<dyn DeviceHooks>) -> Self {
        Self {
            id,
            name: name.to_string(),
            ifindex,
            hooks,
            state: DeviceState::Unknown,
            managed: false,
            firmware_missing: false,
            carrier: false,
            ip_state: [IpSubState::None; 2],
            ip_config: [None, None],
            dhcp_options: Default::default(),
            master: None,
            waiting_for_master: false,
            request: None,
            queued: Slot::default(),
            stages: Default::default(),
            attempt: 0,
            transports: [None, None],
            outcomes: [None, None],
            secrets_call: None,
            zone_calls: [None, None],
            zone_done: [false; 2],
            sharing_active: false,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn kind(&self) -> DeviceKind {
        self.hooks.kind()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn ip_state(&self, family: IpFamily) -> IpSubState {
        self.ip_state[family.index()]
    }

    pub fn ip_config(&self, family: IpFamily) -> Option<&IpConfig> {
        self.ip_config[family.index()].as_ref()
    }

    pub fn dhcp_options(&self, family: IpFamily) -> &LeaseOptions {
        &self.dhcp_options[family.index()]
    }

    pub fn request(&self) -> Option<&ActivationRequest> {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> Option<&mut ActivationRequest> {
        self.request.as_mut()
    }

    pub fn connection(&self) -> Option<&Rc<ConnectionSettings>> {
        self.request.as_ref().map(|r| r.connection())
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn firmware_missing(&self) -> bool {
        self.firmware_missing
    }

    pub fn carrier(&self) -> bool {
        self.carrier
    }

    pub fn master(&self) -> Option<DeviceId> {
        self.master.as_ref().map(|(id, _)| *id)
    }

    pub fn is_waiting_for_master(&self) -> bool {
        self.waiting_for_master
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn gateway_less(&self) -> bool {
        self.hooks.gateway_less()
    }

    pub fn hw_address(&self) -> Option<&str> {
        self.hooks.hw_address()
    }

    /// True if a queued transition or a stage is waiting to run
    pub fn has_pending_work(&self) -> bool {
        self.queued.is_armed() || self.stages.iter().any(Slot::is_armed)
    }

    pub fn is_available(&self) -> bool {
        self.managed && !self.firmware_missing && self.hooks.is_available(self.carrier)
    }

    /// Whether `settings` may run on this device
    pub fn check_compatible(&self, settings: &ConnectionSettings) -> Result<(), String> {
        if let Some(iface) = &settings.interface {
            if *iface != self.name {
                return Err(format!("connection is bound to interface {}", iface));
            }
        }
        self.hooks.check_compatible(settings)
    }

    /// Apply a state transition and emit one notification
    pub fn state_changed(&mut self, ctx: &mut Context, new: DeviceState, reason: StateReason) {
        let old = self.state;
        if old == new && !(new == DeviceState::Unavailable && self.firmware_missing) {
            return;
        }

        log::info!(
            "({}): device state change: {} -> {} (reason '{}')",
            self.name,
            old,
            new,
            reason
        );
        self.state = new;

        if self.queued.cancel() {
            log::debug!("({}): dropped queued state change", self.name);
        }
        for slot in &mut self.stages {
            slot.cancel();
        }

        let connection = self.connection().cloned();

        match new {
            DeviceState::Unmanaged => {
                self.firmware_missing = false;
                if old > DeviceState::Unmanaged {
                    self.take_down(ctx, reason);
                }
            }
            DeviceState::Unavailable => {
                if old == DeviceState::Unmanaged || self.firmware_missing {
                    self.bring_up(ctx);
                }
                // Assumed connections keep whatever the kernel already has
                if reason != StateReason::ConnectionAssumed {
                    self.teardown(ctx, reason);
                }
            }
            DeviceState::Disconnected => {
                if old != DeviceState::Unavailable {
                    self.teardown(ctx, reason);
                }
            }
            _ => {}
        }

        ctx.notify(StateNotification {
            device: self.id,
            new,
            old,
            reason,
            connection: self.connection().cloned(),
        });

        match new {
            DeviceState::Unavailable => {
                if self.is_available() {
                    self.queue_state(ctx, DeviceState::Disconnected, StateReason::None);
                } else {
                    log::debug!("({}): device not yet available for activation", self.name);
                }
            }
            DeviceState::Activated => {
                log::info!("Activation ({}) successful, device activated.", self.name);
                ctx.services
                    .dispatcher
                    .run(DispatchAction::Up, connection.as_deref(), Some(&self.name));
            }
            DeviceState::Failed => {
                log::warn!("Activation ({}) failed.", self.name);
                self.queue_state(ctx, DeviceState::Disconnected, StateReason::None);
            }
            _ => {}
        }

        if old == DeviceState::Activated {
            ctx.services
                .dispatcher
                .run(DispatchAction::Down, connection.as_deref(), Some(&self.name));
        }
    }

    /// Defer a transition to the next loop turn, replacing any queued one
    pub fn queue_state(&mut self, ctx: &mut Context, state: DeviceState, reason: StateReason) {
        if let Some(pending) = self.queued.pending() {
            if pending.state != state {
                log::debug!(
                    "({}): replacing queued state change to {}",
                    self.name,
                    pending.state
                );
            }
        }
        if let Some(token) = self.queued.arm(QueuedState { state, reason }, &mut ctx.queue) {
            log::debug!(
                "({}): queued state change to {} (reason '{}')",
                self.name,
                state,
                reason
            );
            ctx.queue.push(Task::QueuedState {
                device: self.id,
                token,
            });
        }
    }

    pub fn run_queued_state(&mut self, ctx: &mut Context, token: Token) {
        if let Some(queued) = self.queued.take(token) {
            log::debug!("({}): running queued state change to {}", self.name, queued.state);
            self.state_changed(ctx, queued.state, queued.reason);
        }
    }

    pub fn set_managed(&mut self, ctx: &mut Context, managed: bool, reason: StateReason) {
        if self.managed == managed {
            return;
        }
        self.managed = managed;
        if managed {
            self.state_changed(ctx, DeviceState::Unavailable, reason);
        } else {
            self.state_changed(ctx, DeviceState::Unmanaged, reason);
        }
    }

    pub fn set_carrier(&mut self, ctx: &mut Context, carrier: bool) {
        if self.carrier == carrier {
            return;
        }
        let was_available = self.is_available();
        self.carrier = carrier;
        log::info!(
            "({}): carrier now {}",
            self.name,
            if carrier { "ON" } else { "OFF" }
        );
        if !self.managed || was_available == self.is_available() {
            return;
        }

        if self.is_available() {
            if self.state == DeviceState::Unavailable {
                self.state_changed(ctx, DeviceState::Disconnected, StateReason::CarrierChanged);
            }
        } else if self.state >= DeviceState::Disconnected {
            self.state_changed(ctx, DeviceState::Unavailable, StateReason::CarrierChanged);
        }
    }

    /// Bind `request` to this device and schedule stage 1
    pub fn activate(
        &mut self,
        ctx: &mut Context,
        request: ActivationRequest,
    ) -> Result<(), ActivationError> {
        if !self.managed || self.state < DeviceState::Unavailable {
            return Err(ActivationError::Unmanaged);
        }
        self.check_compatible(request.connection())
            .map_err(ActivationError::InvalidConnection)?;

        if let Some(current) = &self.request {
            if current.uuid() == request.uuid()
                && self.state >= DeviceState::Prepare
                && self.state < DeviceState::Activated
            {
                return Err(ActivationError::AlreadyActivating);
            }
        }
        if self.state == DeviceState::Unavailable && !request.is_assumed() && !self.is_available()
        {
            return Err(ActivationError::Unavailable);
        }

        if self.queued.cancel() {
            log::debug!("({}): dropped queued state change", self.name);
        }

        // Tear down whatever ran before
        if self.state > DeviceState::Disconnected {
            self.state_changed(ctx, DeviceState::Disconnected, StateReason::UserRequested);
        } else if self.request.is_some() {
            self.teardown(ctx, StateReason::UserRequested);
        }

        log::info!(
            "Activation ({}) starting connection '{}'",
            self.name,
            request.connection().id
        );
        self.attempt = ctx.queue.token().0;
        self.request = Some(request);
        self.schedule_stage(ctx, IpFamily::V4, Stage::Prepare);
        Ok(())
    }

    /// Inbound deactivation
    pub fn deactivate(
        &mut self,
        ctx: &mut Context,
        reason: StateReason,
    ) -> Result<(), DeactivationError> {
        if self.request.is_none() {
            return Err(DeactivationError::NotActive);
        }
        if self.state > DeviceState::Disconnected {
            self.state_changed(ctx, DeviceState::Disconnected, reason);
        } else {
            self.teardown(ctx, reason);
        }
        Ok(())
    }

    /// Re-run stage 1 of a slave that was waiting for its master
    pub fn master_ready(&mut self, ctx: &mut Context) {
        if self.waiting_for_master && self.request.is_some() {
            log::info!("({}): master ready, resuming activation", self.name);
            self.schedule_stage(ctx, IpFamily::V4, Stage::Prepare);
        }
    }

    fn schedule_stage(&mut self, ctx: &mut Context, family: IpFamily, stage: Stage) {
        if let Some(token) = self.stages[family.index()].arm(stage, &mut ctx.queue) {
            log::info!("Activation ({}) {} scheduled...", self.name, stage.describe(family));
            ctx.queue.push(Task::Stage {
                device: self.id,
                family,
                token,
            });
        }
    }

    /// Stage waiting in the slot of `family`, if any
    pub fn pending_stage(&self, family: IpFamily) -> Option<Stage> {
        self.stages[family.index()].pending().copied()
    }

    /// Run the stage behind `token`; stale tokens are ignored
    pub fn run_stage(
        &mut self,
        ctx: &mut Context,
        family: IpFamily,
        token: Token,
        master: &MasterStatus,
    ) {
        let Some(stage) = self.stages[family.index()].take(token) else {
            return;
        };
        if self.request.is_none() {
            return;
        }
        log::info!("Activation ({}) {} started...", self.name, stage.describe(family));
        match stage {
            Stage::Prepare => self.stage1_prepare(ctx, master),
            Stage::Config => self.stage2_config(ctx),
            Stage::IpConfigStart => self.stage3_ip_config_start(ctx),
            Stage::IpTimeout => self.stage4_ip_timeout(ctx, family),
            Stage::IpCommit => self.stage5_ip_commit(ctx, family),
        }
    }

    fn stage1_prepare(&mut self, ctx: &mut Context, master: &MasterStatus) {
        self.ip_state = [IpSubState::None; 2];
        self.outcomes = [None, None];
        self.zone_done = [false; 2];

        self.state_changed(ctx, DeviceState::Prepare, StateReason::None);

        match master {
            MasterStatus::NotRequired => {}
            MasterStatus::Waiting => {
                log::info!(
                    "Activation ({}) connection has a master, waiting for it",
                    self.name
                );
                self.waiting_for_master = true;
                return;
            }
            MasterStatus::Ready { id, iface } => {
                if self.master.is_none() {
                    if !ctx.services.system.enslave(iface, &self.name) {
                        self.state_changed(ctx, DeviceState::Failed, StateReason::ConfigFailed);
                        return;
                    }
                    log::info!("({}): enslaved to {}", self.name, iface);
                    self.master = Some((*id, iface.clone()));
                }
                self.waiting_for_master = false;
            }
        }

        let Some(settings) = self.connection().cloned() else {
            return;
        };
        match self.hooks.stage1_prepare(&settings) {
            StageResult::Success => {
                log::info!(
                    "Activation ({}) {} complete.",
                    self.name,
                    Stage::Prepare.describe(IpFamily::V4)
                );
                self.schedule_stage(ctx, IpFamily::V4, Stage::Config);
            }
            StageResult::Postpone => {}
            StageResult::Failure(reason) => {
                self.state_changed(ctx, DeviceState::Failed, reason);
            }
        }
    }

    fn stage2_config(&mut self, ctx: &mut Context) {
        self.state_changed(ctx, DeviceState::Config, StateReason::None);

        let Some(request) = &self.request else {
            return;
        };
        let settings = Rc::clone(request.connection());

        if let Some(setting) = self.hooks.secrets_needed(request) {
            let flags = SecretsFlags {
                allow_interaction: request.is_user_requested(),
                request_new: false,
            };
            self.state_changed(ctx, DeviceState::NeedAuth, StateReason::None);
            log::info!(
                "Activation ({}) connection '{}' requires secrets for '{}'",
                self.name,
                settings.id,
                setting
            );
            let call = ctx
                .services
                .secrets
                .request(self.id, &settings, setting, flags, None);
            self.secrets_call = Some(call);
            return;
        }

        if let Err(e) = ctx.services.system.link_up(&self.name) {
            log::warn!("({}): failed to bring up link: {}", self.name, e);
            let reason = match e {
                LinkError::FirmwareMissing => {
                    self.firmware_missing = true;
                    StateReason::FirmwareMissing
                }
                LinkError::Failed(_) => StateReason::ConfigFailed,
            };
            self.state_changed(ctx, DeviceState::Failed, reason);
            return;
        }

        match self.hooks.stage2_config(&settings) {
            StageResult::Success => {
                log::info!(
                    "Activation ({}) {} successful.",
                    self.name,
                    Stage::Config.describe(IpFamily::V4)
                );
                self.schedule_stage(ctx, IpFamily::V4, Stage::IpConfigStart);
            }
            StageResult::Postpone => {}
            StageResult::Failure(reason) => self.state_changed(ctx, DeviceState::Failed, reason),
        }
    }

    fn stage3_ip_config_start(&mut self, ctx: &mut Context) {
        self.state_changed(ctx, DeviceState::IpConfig, StateReason::None);

        for family in IpFamily::ALL {
            match self.start_family(ctx, family) {
                IpStart::Ready(config) => {
                    self.advance_ip_state(family, IpSubState::Conf);
                    self.outcomes[family.index()] = Some(Outcome::Ready(config));
                    self.schedule_stage(ctx, family, Stage::IpCommit);
                }
                IpStart::Postpone => self.advance_ip_state(family, IpSubState::Conf),
                IpStart::Stop => self.advance_ip_state(family, IpSubState::Done),
                IpStart::Failure(reason) => {
                    self.state_changed(ctx, DeviceState::Failed, reason);
                    return;
                }
            }
        }

        // Nothing to configure at layer 3 (bond ports and the like)
        if IpFamily::ALL
            .iter()
            .all(|f| self.ip_state[f.index()] == IpSubState::Done)
        {
            self.state_changed(ctx, DeviceState::Activated, StateReason::None);
        }
    }

    fn start_family(&mut self, ctx: &mut Context, family: IpFamily) -> IpStart {
        let Some(request) = self.request.as_mut() else {
            return IpStart::Failure(StateReason::Unknown);
        };
        let settings = Rc::clone(request.connection());
        let method = settings.ip(family).method;

        match method {
            IpMethod::Disabled | IpMethod::Ignore => IpStart::Stop,
            // Static addresses come from the overrides merged at commit
            IpMethod::Manual => IpStart::Ready(IpConfig::new(family)),
            // The kernel configures fe80::/64 by itself
            IpMethod::LinkLocal if family == IpFamily::V6 => IpStart::Ready(IpConfig::new(family)),
            IpMethod::Shared => match ctx.pool.lease() {
                Some(lease) => {
                    request.set_share_rules(share_rules(&self.name, &lease));
                    IpStart::Ready(lease.ip_config())
                }
                None => {
                    log::warn!("({}): no free shared address block", self.name);
                    IpStart::Failure(StateReason::SharedStartFailed)
                }
            },
            IpMethod::Auto | IpMethod::Dhcp | IpMethod::LinkLocal => {
                let transport_request = TransportRequest {
                    device: self.id,
                    attempt: self.attempt,
                    iface: self.name.clone(),
                    family,
                    method,
                    connection_uuid: settings.uuid.clone(),
                    timeout: ctx.options.dhcp_timeout,
                    anycast: self.hooks.anycast_address(),
                };
                match ctx.services.transport.start(transport_request) {
                    Ok(handle) => {
                        log::info!(
                            "Activation ({}) Beginning {} {} transaction.",
                            self.name,
                            family,
                            method.as_str()
                        );
                        self.transports[family.index()] = Some(handle);
                        IpStart::Postpone
                    }
                    Err(e) => {
                        log::warn!("({}): failed to start {} transport: {}", self.name, family, e);
                        IpStart::Failure(if method == IpMethod::LinkLocal {
                            StateReason::AutoipFailed
                        } else {
                            StateReason::DhcpStartFailed
                        })
                    }
                }
            }
        }
    }

    fn advance_ip_state(&mut self, family: IpFamily, state: IpSubState) {
        let current = &mut self.ip_state[family.index()];
        if state < *current {
            log::warn!(
                "({}): ignoring {} sub-state regression {} -> {}",
                self.name,
                family,
                current.as_str(),
                state.as_str()
            );
            return;
        }
        *current = state;
    }

    /// Transport completion for `family`
    pub fn transport_event(
        &mut self,
        ctx: &mut Context,
        family: IpFamily,
        attempt: u64,
        event: TransportEvent,
    ) {
        if attempt != self.attempt || self.request.is_none() {
            log::debug!("({}): dropping stale {} transport event", self.name, family);
            return;
        }
        let i = family.index();

        match (self.ip_state[i], event) {
            (IpSubState::Conf, TransportEvent::Lease { config, options }) => {
                log::info!("({}): {} configuration available", self.name, family);
                self.dhcp_options[i] = options;
                self.outcomes[i] = Some(Outcome::Ready(config));
                self.schedule_stage(ctx, family, Stage::IpCommit);
            }
            (IpSubState::Conf, failure) => {
                let method = self
                    .connection()
                    .map(|c| c.ip(family).method)
                    .unwrap_or(IpMethod::Auto);
                let reason = match (&failure, method) {
                    (_, IpMethod::LinkLocal) => StateReason::AutoipFailed,
                    (TransportEvent::Fatal(_), _) => StateReason::DhcpFailed,
                    _ => StateReason::IpConfigUnavailable,
                };
                if let TransportEvent::Fatal(msg) = &failure {
                    log::warn!("({}): {} transport failed: {}", self.name, family, msg);
                } else {
                    log::info!("({}): {} transport timed out", self.name, family);
                }
                if let Some(handle) = self.transports[i].take() {
                    ctx.services.transport.stop(handle);
                }
                self.outcomes[i] = Some(Outcome::Expired(reason));
                self.schedule_stage(ctx, family, Stage::IpTimeout);
            }
            (IpSubState::Done, TransportEvent::Lease { config, options }) => {
                self.renew(ctx, family, config, options);
            }
            (IpSubState::Done, _) if self.ip_config[i].is_some() => {
                log::warn!("({}): {} lease lost", self.name, family);
                self.state_changed(ctx, DeviceState::Failed, StateReason::IpConfigExpired);
            }
            _ => {
                log::debug!("({}): ignoring {} transport event", self.name, family);
            }
        }
    }

    fn renew(
        &mut self,
        ctx: &mut Context,
        family: IpFamily,
        mut config: IpConfig,
        options: LeaseOptions,
    ) {
        let Some(settings) = self.connection().cloned() else {
            return;
        };
        log::info!("({}): {} lease renewed", self.name, family);
        merge(&mut config, settings.ip(family));
        self.dhcp_options[family.index()] = options;

        if !self.set_ip_config(ctx, family, Some(config)) {
            log::warn!("({}): failed to update {} config after renewal", self.name, family);
            self.state_changed(ctx, DeviceState::Failed, StateReason::IpConfigExpired);
            return;
        }
        let action = match family {
            IpFamily::V4 => DispatchAction::Dhcp4Change,
            IpFamily::V6 => DispatchAction::Dhcp6Change,
        };
        ctx.services
            .dispatcher
            .run(action, Some(settings.as_ref()), Some(&self.name));
    }

    fn stage4_ip_timeout(&mut self, ctx: &mut Context, family: IpFamily) {
        let i = family.index();
        if self.ip_state[i] != IpSubState::Conf {
            return;
        }
        let reason = match self.outcomes[i].take() {
            Some(Outcome::Expired(reason)) => reason,
            Some(ready) => {
                // A lease beat the timeout stage; let it commit instead
                self.outcomes[i] = Some(ready);
                self.schedule_stage(ctx, family, Stage::IpCommit);
                return;
            }
            None => StateReason::IpConfigUnavailable,
        };
        let may_fail = self
            .connection()
            .map(|c| c.ip(family).may_fail)
            .unwrap_or(false);

        if !may_fail {
            self.state_changed(ctx, DeviceState::Failed, reason);
            return;
        }

        log::info!(
            "Activation ({}) {} failed, continuing without it",
            self.name,
            family
        );
        self.advance_ip_state(family, IpSubState::Done);

        let other = family.other();
        if self.ip_state[other.index()] == IpSubState::Done && self.ip_config[other.index()].is_none()
        {
            self.state_changed(ctx, DeviceState::Failed, StateReason::IpConfigUnavailable);
        }
    }

    fn stage5_ip_commit(&mut self, ctx: &mut Context, family: IpFamily) {
        let i = family.index();
        if self.ip_state[i] != IpSubState::Conf {
            return;
        }
        let Some(settings) = self.connection().cloned() else {
            return;
        };

        // Zone assignment precedes the first commit of each family
        if self.state < DeviceState::Activated && !self.zone_done[i] {
            if let Some(firewall) = ctx.services.firewall.as_mut() {
                if self.zone_calls[i].is_none() {
                    log::info!(
                        "Activation ({}) {} waiting for firewall zone",
                        self.name,
                        family
                    );
                    let call =
                        firewall.add_or_change(self.id, family, &self.name, settings.zone.as_deref());
                    self.zone_calls[i] = Some(call);
                }
                return;
            }
        }

        let Some(Outcome::Ready(mut config)) = self.outcomes[i].take() else {
            return;
        };
        merge(&mut config, settings.ip(family));

        if !self.set_ip_config(ctx, family, Some(config)) {
            log::warn!("Activation ({}) {} commit failed", self.name, family);
            self.state_changed(ctx, DeviceState::Failed, StateReason::ConfigFailed);
            return;
        }
        self.advance_ip_state(family, IpSubState::Done);

        if family == IpFamily::V4 && settings.ipv4.method == IpMethod::Shared && !self.sharing_active
        {
            if let Err(e) = self.start_sharing(ctx) {
                log::warn!("Activation ({}) failed to start sharing: {:#}", self.name, e);
                self.state_changed(ctx, DeviceState::Failed, StateReason::SharedStartFailed);
                return;
            }
        }

        log::info!(
            "Activation ({}) {} complete.",
            self.name,
            Stage::IpCommit.describe(family)
        );

        if self.state == DeviceState::IpConfig {
            self.state_changed(ctx, DeviceState::Activated, StateReason::None);
            self.resume_families(ctx);
        }
    }

    fn start_sharing(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let config = self.ip_config[IpFamily::V4.index()]
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no IPv4 configuration to share"))?;
        let rules = self
            .request
            .as_ref()
            .map(|r| r.share_rules().to_vec())
            .unwrap_or_default();
        ctx.services.sharing.start(&self.name, config, &rules)?;
        self.sharing_active = true;
        Ok(())
    }

    /// Re-schedule family results that a state change cancelled
    fn resume_families(&mut self, ctx: &mut Context) {
        for family in IpFamily::ALL {
            let i = family.index();
            if self.ip_state[i] != IpSubState::Conf {
                continue;
            }
            match &self.outcomes[i] {
                Some(Outcome::Ready(_)) => self.schedule_stage(ctx, family, Stage::IpCommit),
                Some(Outcome::Expired(_)) => self.schedule_stage(ctx, family, Stage::IpTimeout),
                None => {}
            }
        }
    }

    /// Firewall zone call finished
    pub fn zone_reply(&mut self, ctx: &mut Context, family: IpFamily, call: CallId) {
        let i = family.index();
        if self.zone_calls[i] != Some(call) {
            log::debug!("({}): ignoring stale zone reply", self.name);
            return;
        }
        self.zone_calls[i] = None;
        self.zone_done[i] = true;
        self.schedule_stage(ctx, family, Stage::IpCommit);
    }

    /// Secrets broker answered
    pub fn secrets_reply(&mut self, ctx: &mut Context, call: CallId, result: Result<Secrets, String>) {
        if self.secrets_call != Some(call) {
            log::debug!("({}): ignoring stale secrets reply", self.name);
            return;
        }
        self.secrets_call = None;
        if self.state != DeviceState::NeedAuth {
            return;
        }
        match result {
            Ok(secrets) => {
                log::info!("Activation ({}) secrets received, restarting", self.name);
                if let Some(request) = self.request.as_mut() {
                    request.set_secrets(secrets);
                }
                self.schedule_stage(ctx, IpFamily::V4, Stage::Prepare);
            }
            Err(e) => {
                log::warn!("Activation ({}) no secrets: {}", self.name, e);
                self.state_changed(ctx, DeviceState::Failed, StateReason::NoSecrets);
            }
        }
    }

    /// Replace the config of `family`, applying and registering it
    ///
    /// Returns false if the system configurator rejected the new config.
    /// The config is recorded either way so a later flush removes it.
    pub fn set_ip_config(
        &mut self,
        ctx: &mut Context,
        family: IpFamily,
        new: Option<IpConfig>,
    ) -> bool {
        let i = family.index();
        let diff = match (&self.ip_config[i], &new) {
            (None, None) => return true,
            (Some(old), Some(new)) => old.diff(new),
            _ => ConfigDiff::all(),
        };
        if diff.is_empty() {
            return true;
        }

        if let Some(old) = self.ip_config[i].take() {
            ctx.services.dns.remove(&self.name, &old);
        }

        let mut success = true;
        if let Some(config) = &new {
            let assumed = self.request.as_ref().is_some_and(|r| r.is_assumed());
            if !assumed {
                let priority = ctx.options.priorities.get(self.kind());
                success = ctx
                    .services
                    .system
                    .apply(&self.name, self.ifindex, config, priority, &diff);
            }
            if success {
                ctx.services.dns.add(&self.name, config, DnsClass::Default);
            }
        }
        self.ip_config[i] = new;
        if self.state == DeviceState::Activated {
            ctx.mark_config_changed();
        }
        success
    }

    fn bring_up(&mut self, ctx: &mut Context) {
        self.hooks.update_hw_address(&self.name);
        match ctx.services.system.link_up(&self.name) {
            Ok(()) => self.firmware_missing = false,
            Err(LinkError::FirmwareMissing) => {
                log::warn!("({}): firmware may be missing.", self.name);
                self.firmware_missing = true;
            }
            Err(e) => log::warn!("({}): failed to bring up link: {}", self.name, e),
        }
    }

    fn take_down(&mut self, ctx: &mut Context, reason: StateReason) {
        self.teardown(ctx, reason);
        ctx.services.system.link_down(&self.name);
    }

    fn teardown(&mut self, ctx: &mut Context, reason: StateReason) {
        log::info!("({}): deactivating device (reason '{}')", self.name, reason);

        for slot in &mut self.stages {
            slot.cancel();
        }
        self.waiting_for_master = false;

        for i in 0..2 {
            if let Some(handle) = self.transports[i].take() {
                ctx.services.transport.stop(handle);
            }
            self.outcomes[i] = None;
        }
        if let Some(call) = self.secrets_call.take() {
            ctx.services.secrets.cancel(call);
        }
        let zone = self.connection().and_then(|c| c.zone.clone());
        if let Some(firewall) = ctx.services.firewall.as_mut() {
            for call in self.zone_calls.iter_mut().filter_map(Option::take) {
                firewall.cancel(call);
            }
            if self.zone_done.iter().any(|done| *done) {
                firewall.remove(&self.name, zone.as_deref());
            }
        }
        self.zone_done = [false; 2];

        if let Some((_, master)) = self.master.take() {
            log::info!("({}): releasing from master {}", self.name, master);
            ctx.services.system.release(&master, &self.name);
        }

        for family in IpFamily::ALL {
            ctx.services.system.flush(&self.name, self.ifindex, family);
        }

        if self.sharing_active {
            let rules = self
                .request
                .as_mut()
                .map(|r| r.take_share_rules())
                .unwrap_or_default();
            ctx.services.sharing.stop(&self.name, &rules);
            self.sharing_active = false;
        }

        // Dropping a shared config returns its address block to the pool
        for family in IpFamily::ALL {
            self.set_ip_config(ctx, family, None);
        }
        self.dhcp_options = Default::default();
        self.request = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{WifiMode, WifiSettings};
    use crate::context::Options;
    use crate::ip_config::Address;
    use crate::testing::{Call, Fakes, RecordingHooks};
    use std::time::Instant;

    fn drain(device: &mut Device, ctx: &mut Context, master: &MasterStatus) {
        while let Some(task) = ctx.queue.pop() {
            match task {
                Task::QueuedState { token, .. } => device.run_queued_state(ctx, token),
                Task::Stage { family, token, .. } => device.run_stage(ctx, family, token, master),
                _ => {}
            }
        }
    }

    fn setup(kind: DeviceKind) -> (Device, Context, Fakes) {
        let fakes = Fakes::new();
        let mut ctx = Context::new(fakes.services(), Options::default(), Instant::now());
        let mut device = Device::new(DeviceId(1), "eth0", 2, hooks_for(kind));
        device.state_changed(&mut ctx, DeviceState::Unmanaged, StateReason::None);
        device.set_carrier(&mut ctx, true);
        device.set_managed(&mut ctx, true, StateReason::NowManaged);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        ctx.take_notifications();
        fakes.clear();
        (device, ctx, fakes)
    }

    fn wired(v4: IpMethod, v6: IpMethod) -> Rc<ConnectionSettings> {
        let mut settings = ConnectionSettings::new("Wired", "wired-1", DeviceKind::Ethernet);
        settings.ipv4.method = v4;
        settings.ipv6.method = v6;
        Rc::new(settings)
    }

    fn lease(family: IpFamily, addr: &str, gw: &str) -> TransportEvent {
        let mut config = IpConfig::new(family);
        config.addresses.push(
            Address::new(addr.parse().unwrap(), if family == IpFamily::V4 { 24 } else { 64 })
                .with_gateway(gw.parse().unwrap()),
        );
        TransportEvent::Lease {
            config,
            options: LeaseOptions::new(),
        }
    }

    fn states(ctx: &mut Context) -> Vec<DeviceState> {
        ctx.take_notifications().into_iter().map(|n| n.new).collect()
    }

    #[test]
    fn test_managed_device_reaches_disconnected() {
        let (device, _ctx, _fakes) = setup(DeviceKind::Ethernet);
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert!(device.is_managed());
    }

    #[test]
    fn test_dhcp_activation_pipeline() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Ethernet);
        let request = ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Ignore));
        device.activate(&mut ctx, request).unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        assert_eq!(device.state(), DeviceState::IpConfig);
        assert_eq!(device.ip_state(IpFamily::V4), IpSubState::Conf);
        assert_eq!(device.ip_state(IpFamily::V6), IpSubState::Done);
        assert!(fakes.has(&Call::LinkUp("eth0".to_string())));

        let attempt = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, lease(IpFamily::V4, "192.168.1.5", "192.168.1.1"));
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        assert_eq!(device.state(), DeviceState::Activated);
        assert_eq!(device.ip_state(IpFamily::V4), IpSubState::Done);
        assert!(device.ip_config(IpFamily::V4).is_some());
        assert_eq!(
            states(&mut ctx),
            vec![
                DeviceState::Prepare,
                DeviceState::Config,
                DeviceState::IpConfig,
                DeviceState::Activated
            ]
        );
        assert_eq!(fakes.count(|c| matches!(c, Call::Apply { .. })), 1);
        assert_eq!(
            fakes.count(|c| matches!(c, Call::DnsAdd { class: DnsClass::Default, .. })),
            1
        );
        assert_eq!(
            fakes.count(|c| matches!(c, Call::Dispatch { action: DispatchAction::Up, .. })),
            1
        );
    }

    #[test]
    fn test_both_families_stop_activates_immediately() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        let request = ActivationRequest::new(wired(IpMethod::Disabled, IpMethod::Ignore));
        device.activate(&mut ctx, request).unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(device.state(), DeviceState::Activated);
    }

    #[test]
    fn test_manual_config_commits_overrides() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        let mut settings = ConnectionSettings::new("Static", "s1", DeviceKind::Ethernet);
        settings.ipv4.method = IpMethod::Manual;
        settings.ipv4.addresses.push(
            Address::new("10.0.0.2".parse().unwrap(), 24).with_gateway("10.0.0.1".parse().unwrap()),
        );
        settings.ipv6.method = IpMethod::Ignore;
        device
            .activate(&mut ctx, ActivationRequest::new(Rc::new(settings)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        assert_eq!(device.state(), DeviceState::Activated);
        let config = device.ip_config(IpFamily::V4).unwrap();
        assert_eq!(config.addresses.len(), 1);
        assert_eq!(config.gateway(), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_timeout_without_may_fail_fails_device() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        let mut settings = ConnectionSettings::new("Wired", "w", DeviceKind::Ethernet);
        settings.ipv4.may_fail = false;
        settings.ipv6.method = IpMethod::Ignore;
        device
            .activate(&mut ctx, ActivationRequest::new(Rc::new(settings)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        ctx.take_notifications();

        let attempt = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, TransportEvent::Timeout);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        let notes = ctx.take_notifications();
        assert_eq!(notes[0].new, DeviceState::Failed);
        assert_eq!(notes[0].reason, StateReason::IpConfigUnavailable);
        // Failed always falls back to Disconnected
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert!(device.request().is_none());
    }

    #[test]
    fn test_may_fail_family_lets_other_family_activate() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Auto)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        let attempt = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, TransportEvent::Timeout);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(device.ip_state(IpFamily::V4), IpSubState::Done);
        assert_eq!(device.state(), DeviceState::IpConfig);

        device.transport_event(&mut ctx, IpFamily::V6, attempt, lease(IpFamily::V6, "2001:db8::5", "fe80::1"));
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(device.state(), DeviceState::Activated);
        assert!(device.ip_config(IpFamily::V4).is_none());
    }

    #[test]
    fn test_both_families_expire_fails_device() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Auto)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        ctx.take_notifications();

        let attempt = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, TransportEvent::Timeout);
        device.transport_event(&mut ctx, IpFamily::V6, attempt, TransportEvent::Fatal("no router".into()));
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        let notes = ctx.take_notifications();
        assert_eq!(notes[0].new, DeviceState::Failed);
        assert_eq!(notes[0].reason, StateReason::IpConfigUnavailable);
    }

    #[test]
    fn test_second_family_commits_after_activation() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Auto)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        // Both leases land in the same loop turn
        let attempt = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, lease(IpFamily::V4, "192.168.1.5", "192.168.1.1"));
        device.transport_event(&mut ctx, IpFamily::V6, attempt, lease(IpFamily::V6, "2001:db8::5", "fe80::1"));
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        assert_eq!(device.state(), DeviceState::Activated);
        assert_eq!(device.ip_state(IpFamily::V4), IpSubState::Done);
        assert_eq!(device.ip_state(IpFamily::V6), IpSubState::Done);
        assert!(device.ip_config(IpFamily::V6).is_some());
    }

    #[test]
    fn test_stale_transport_event_ignored() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Ignore)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        let old = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, old + 1000, lease(IpFamily::V4, "10.1.1.1", "10.1.1.254"));
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(device.state(), DeviceState::IpConfig);
    }

    #[test]
    fn test_deactivate_inactive_is_not_active() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        assert_eq!(
            device.deactivate(&mut ctx, StateReason::UserRequested),
            Err(DeactivationError::NotActive)
        );
        assert_eq!(
            device.deactivate(&mut ctx, StateReason::UserRequested),
            Err(DeactivationError::NotActive)
        );
    }

    #[test]
    fn test_deactivate_cancels_transports_and_flushes() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Ethernet);
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Auto)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        fakes.clear();

        device.deactivate(&mut ctx, StateReason::UserRequested).unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        assert_eq!(device.state(), DeviceState::Disconnected);
        assert!(device.request().is_none());
        assert!(!device.has_pending_work());
        assert_eq!(fakes.count(|c| matches!(c, Call::TransportStop(_))), 2);
        assert_eq!(fakes.count(|c| matches!(c, Call::Flush { .. })), 2);

        // A lease for the torn-down attempt changes nothing
        let attempt = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, lease(IpFamily::V4, "10.1.1.1", "10.1.1.254"));
        assert!(device.ip_config(IpFamily::V4).is_none());
    }

    #[test]
    fn test_already_activating() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        let conn = wired(IpMethod::Auto, IpMethod::Ignore);
        device
            .activate(&mut ctx, ActivationRequest::new(Rc::clone(&conn)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(
            device.activate(&mut ctx, ActivationRequest::new(conn)),
            Err(ActivationError::AlreadyActivating)
        );
    }

    #[test]
    fn test_incompatible_connection_rejected() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        let mut settings = ConnectionSettings::new("Other", "o", DeviceKind::Ethernet);
        settings.interface = Some("eth9".to_string());
        let result = device.activate(&mut ctx, ActivationRequest::new(Rc::new(settings)));
        assert!(matches!(result, Err(ActivationError::InvalidConnection(_))));
        assert!(device.request().is_none());
    }

    #[test]
    fn test_slave_waits_for_master() {
        let fakes = Fakes::new();
        let mut ctx = Context::new(fakes.services(), Options::default(), Instant::now());
        let hooks = RecordingHooks::new(&fakes, DeviceKind::Ethernet, "eth0");
        let mut device = Device::new(DeviceId(1), "eth0", 2, Box::new(hooks));
        device.state_changed(&mut ctx, DeviceState::Unmanaged, StateReason::None);
        device.set_carrier(&mut ctx, true);
        device.set_managed(&mut ctx, true, StateReason::NowManaged);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        fakes.clear();

        let mut settings = ConnectionSettings::new("Port", "p1", DeviceKind::Ethernet);
        settings.master = Some("bond0".to_string());
        settings.ipv4.method = IpMethod::Disabled;
        settings.ipv6.method = IpMethod::Ignore;
        device
            .activate(&mut ctx, ActivationRequest::new(Rc::new(settings)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::Waiting);

        assert_eq!(device.state(), DeviceState::Prepare);
        assert!(device.is_waiting_for_master());
        assert!(!fakes.has(&Call::HookPrepare("eth0".to_string())));
        assert!(!fakes.has(&Call::LinkUp("eth0".to_string())));

        device.master_ready(&mut ctx);
        let ready = MasterStatus::Ready {
            id: DeviceId(7),
            iface: "bond0".to_string(),
        };
        drain(&mut device, &mut ctx, &ready);

        assert_eq!(device.master(), Some(DeviceId(7)));
        assert_eq!(device.state(), DeviceState::Activated);
        let calls = fakes.calls();
        let enslave = calls
            .iter()
            .position(|c| matches!(c, Call::Enslave { .. }))
            .unwrap();
        let hook = calls
            .iter()
            .position(|c| *c == Call::HookPrepare("eth0".to_string()))
            .unwrap();
        assert!(enslave < hook);
        assert_eq!(fakes.count(|c| matches!(c, Call::HookPrepare(_))), 1);

        device.deactivate(&mut ctx, StateReason::UserRequested).unwrap();
        assert!(fakes.has(&Call::Release {
            master: "bond0".to_string(),
            slave: "eth0".to_string()
        }));
        assert_eq!(device.master(), None);
    }

    #[test]
    fn test_secrets_round_trip() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Wifi);
        let mut settings = ConnectionSettings::new("Home", "home", DeviceKind::Wifi);
        settings.wifi = Some(WifiSettings {
            ssid: "home".to_string(),
            mode: WifiMode::Infrastructure,
            security: Some("wpa-psk".to_string()),
        });
        settings.ipv6.method = IpMethod::Ignore;
        device
            .activate(&mut ctx, ActivationRequest::new(Rc::new(settings)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(device.state(), DeviceState::NeedAuth);

        let call = fakes.last_secrets_call().unwrap();
        device.secrets_reply(&mut ctx, call, Ok([("psk".to_string(), "pw".to_string())].into()));
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        assert_eq!(device.state(), DeviceState::IpConfig);
        assert!(device.request().unwrap().secrets().is_some());
    }

    #[test]
    fn test_secrets_error_fails_with_no_secrets() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Wifi);
        let mut settings = ConnectionSettings::new("Home", "home", DeviceKind::Wifi);
        settings.wifi = Some(WifiSettings {
            ssid: "home".to_string(),
            mode: WifiMode::Infrastructure,
            security: Some("wpa-psk".to_string()),
        });
        device
            .activate(&mut ctx, ActivationRequest::new(Rc::new(settings)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        ctx.take_notifications();

        let call = fakes.last_secrets_call().unwrap();
        device.secrets_reply(&mut ctx, call, Err("user cancelled".to_string()));
        let notes = ctx.take_notifications();
        assert_eq!(notes[0].new, DeviceState::Failed);
        assert_eq!(notes[0].reason, StateReason::NoSecrets);
    }

    #[test]
    fn test_firmware_missing_blocks_availability() {
        let fakes = Fakes::new();
        fakes.faults.borrow_mut().firmware_missing = true;
        let mut ctx = Context::new(fakes.services(), Options::default(), Instant::now());
        let mut device = Device::new(DeviceId(1), "wlan0", 3, hooks_for(DeviceKind::Wifi));
        device.state_changed(&mut ctx, DeviceState::Unmanaged, StateReason::None);
        device.set_carrier(&mut ctx, true);
        device.set_managed(&mut ctx, true, StateReason::NowManaged);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        assert!(device.firmware_missing());
        assert_eq!(device.state(), DeviceState::Unavailable);

        // Re-entering Unavailable retries the bring-up
        fakes.faults.borrow_mut().firmware_missing = false;
        device.state_changed(&mut ctx, DeviceState::Unavailable, StateReason::FirmwareMissing);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert!(!device.firmware_missing());
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn test_carrier_loss_tears_down() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Disabled, IpMethod::Ignore)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(device.state(), DeviceState::Activated);
        ctx.take_notifications();

        device.set_carrier(&mut ctx, false);
        assert_eq!(device.state(), DeviceState::Unavailable);
        assert!(device.request().is_none());
        let notes = ctx.take_notifications();
        assert_eq!(notes[0].reason, StateReason::CarrierChanged);

        device.set_carrier(&mut ctx, true);
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn test_renewal_and_lost_lease() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Ethernet);
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Ignore)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        let attempt = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, lease(IpFamily::V4, "192.168.1.5", "192.168.1.1"));
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        fakes.clear();

        // Same lease again: no kernel work, still a dispatcher event
        device.transport_event(&mut ctx, IpFamily::V4, attempt, lease(IpFamily::V4, "192.168.1.5", "192.168.1.1"));
        assert_eq!(fakes.count(|c| matches!(c, Call::Apply { .. })), 0);
        assert_eq!(
            fakes.count(|c| matches!(c, Call::Dispatch { action: DispatchAction::Dhcp4Change, .. })),
            1
        );

        device.transport_event(&mut ctx, IpFamily::V4, attempt, lease(IpFamily::V4, "192.168.1.9", "192.168.1.1"));
        assert_eq!(fakes.count(|c| matches!(c, Call::Apply { .. })), 1);

        ctx.take_notifications();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, TransportEvent::Fatal("nak".into()));
        let notes = ctx.take_notifications();
        assert_eq!(notes[0].new, DeviceState::Failed);
        assert_eq!(notes[0].reason, StateReason::IpConfigExpired);
    }

    #[test]
    fn test_commit_failure() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Ethernet);
        fakes.faults.borrow_mut().apply_fails = true;
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Ignore)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        ctx.take_notifications();

        let attempt = device.attempt();
        device.transport_event(&mut ctx, IpFamily::V4, attempt, lease(IpFamily::V4, "192.168.1.5", "192.168.1.1"));
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        let notes = ctx.take_notifications();
        assert_eq!(notes[0].reason, StateReason::ConfigFailed);
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn test_transport_start_failure() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Ethernet);
        fakes.faults.borrow_mut().transport_fails = true;
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Auto, IpMethod::Ignore)))
            .unwrap();
        ctx.take_notifications();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        let failed = ctx
            .take_notifications()
            .into_iter()
            .find(|n| n.new == DeviceState::Failed)
            .unwrap();
        assert_eq!(failed.reason, StateReason::DhcpStartFailed);
    }

    #[test]
    fn test_shared_mode_leases_and_releases_block() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Ethernet);
        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Shared, IpMethod::Ignore)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        assert_eq!(device.state(), DeviceState::Activated);
        assert_eq!(ctx.pool.in_use(), 1);
        assert!(fakes.has(&Call::SharingStart("eth0".to_string())));
        assert!(!device.request().unwrap().share_rules().is_empty());

        device.deactivate(&mut ctx, StateReason::UserRequested).unwrap();
        assert!(fakes.has(&Call::SharingStop("eth0".to_string())));
        assert_eq!(ctx.pool.in_use(), 0);
    }

    #[test]
    fn test_firewall_zone_precedes_commit() {
        let fakes = Fakes::with_firewall();
        let mut ctx = Context::new(fakes.services(), Options::default(), Instant::now());
        let mut device = Device::new(DeviceId(1), "eth0", 2, hooks_for(DeviceKind::Ethernet));
        device.state_changed(&mut ctx, DeviceState::Unmanaged, StateReason::None);
        device.set_carrier(&mut ctx, true);
        device.set_managed(&mut ctx, true, StateReason::NowManaged);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);

        device
            .activate(&mut ctx, ActivationRequest::new(wired(IpMethod::Disabled, IpMethod::LinkLocal)))
            .unwrap();
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(device.state(), DeviceState::IpConfig);
        assert_eq!(fakes.count(|c| matches!(c, Call::Apply { .. })), 0);

        let call = fakes.last_zone_call().unwrap();
        device.zone_reply(&mut ctx, IpFamily::V6, call);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        assert_eq!(device.state(), DeviceState::Activated);
    }

    #[test]
    fn test_unmanage_takes_link_down() {
        let (mut device, mut ctx, fakes) = setup(DeviceKind::Ethernet);
        device.set_managed(&mut ctx, false, StateReason::NowUnmanaged);
        assert_eq!(device.state(), DeviceState::Unmanaged);
        assert!(fakes.has(&Call::LinkDown("eth0".to_string())));
    }

    #[test]
    fn test_same_state_is_noop() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        device.state_changed(&mut ctx, DeviceState::Disconnected, StateReason::None);
        assert!(ctx.take_notifications().is_empty());
    }

    #[test]
    fn test_queue_state_single_slot() {
        let (mut device, mut ctx, _fakes) = setup(DeviceKind::Ethernet);
        device.queue_state(&mut ctx, DeviceState::Unavailable, StateReason::None);
        device.queue_state(&mut ctx, DeviceState::Unavailable, StateReason::None);
        device.queue_state(&mut ctx, DeviceState::Unmanaged, StateReason::None);
        drain(&mut device, &mut ctx, &MasterStatus::NotRequired);
        // Only the last queued transition runs
        assert_eq!(states(&mut ctx), vec![DeviceState::Unmanaged]);
    }
}
