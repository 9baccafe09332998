//! Activation requests
//!
//! One [`ActivationRequest`] exists per device while it is activating or
//! activated. It is created by the caller of `activate()`, moved into the
//! device, and dropped by deactivation.

use crate::connection::ConnectionSettings;
use crate::shared::ShareRule;
use crate::types::IpFamily;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Secrets returned by the broker, keyed by setting property
pub type Secrets = BTreeMap<String, String>;

/// A device's binding to a connection for one activation
#[derive(Debug)]
pub struct ActivationRequest {
    connection: Rc<ConnectionSettings>,
    default4: bool,
    default6: bool,
    assumed: bool,
    user_requested: bool,
    share_rules: Vec<ShareRule>,
    secrets: Option<Secrets>,
}

impl ActivationRequest {
    pub fn new(connection: Rc<ConnectionSettings>) -> Self {
        Self {
            connection,
            default4: false,
            default6: false,
            assumed: false,
            user_requested: false,
            share_rules: Vec::new(),
            secrets: None,
        }
    }

    /// Adopt kernel state that is already configured instead of re-applying it
    pub fn assumed(mut self) -> Self {
        self.assumed = true;
        self
    }

    pub fn user_requested(mut self) -> Self {
        self.user_requested = true;
        self
    }

    pub fn connection(&self) -> &Rc<ConnectionSettings> {
        &self.connection
    }

    pub fn uuid(&self) -> &str {
        &self.connection.uuid
    }

    pub fn is_assumed(&self) -> bool {
        self.assumed
    }

    pub fn is_user_requested(&self) -> bool {
        self.user_requested
    }

    pub fn is_default(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::V4 => self.default4,
            IpFamily::V6 => self.default6,
        }
    }

    pub fn set_default(&mut self, family: IpFamily, default: bool) {
        match family {
            IpFamily::V4 => self.default4 = default,
            IpFamily::V6 => self.default6 = default,
        }
    }

    pub fn share_rules(&self) -> &[ShareRule] {
        &self.share_rules
    }

    pub fn set_share_rules(&mut self, rules: Vec<ShareRule>) {
        self.share_rules = rules;
    }

    pub fn take_share_rules(&mut self) -> Vec<ShareRule> {
        std::mem::take(&mut self.share_rules)
    }

    pub fn secrets(&self) -> Option<&Secrets> {
        self.secrets.as_ref()
    }

    pub fn set_secrets(&mut self, secrets: Secrets) {
        self.secrets = Some(secrets);
    }
}
