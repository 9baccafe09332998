//! Per-kind device capabilities
//!
//! The activation pipeline is generic; what differs between an Ethernet
//! port, a Wi-Fi radio, a modem or a bond is captured by [`DeviceHooks`].
//! Every method has a default so a kind only overrides what it changes.

use crate::activation::ActivationRequest;
use crate::connection::ConnectionSettings;
use crate::types::{DeviceKind, StageResult};
use std::fs;

/// Capability set of one device kind
pub trait DeviceHooks {
    fn kind(&self) -> DeviceKind;

    /// Whether the device could activate right now
    fn is_available(&self, carrier: bool) -> bool {
        carrier
    }

    /// Kind-specific compatibility check for a profile
    fn check_compatible(&self, settings: &ConnectionSettings) -> Result<(), String> {
        if settings.kind == self.kind() {
            Ok(())
        } else {
            Err(format!(
                "{} connection cannot run on a {} device",
                settings.kind,
                self.kind()
            ))
        }
    }

    fn stage1_prepare(&mut self, _settings: &ConnectionSettings) -> StageResult {
        StageResult::Success
    }

    fn stage2_config(&mut self, _settings: &ConnectionSettings) -> StageResult {
        StageResult::Success
    }

    /// Setting that must be filled by the secrets broker before stage 2 can finish
    fn secrets_needed(&self, _request: &ActivationRequest) -> Option<&'static str> {
        None
    }

    /// Point-to-point kinds get a default route without a gateway address
    fn gateway_less(&self) -> bool {
        false
    }

    fn update_hw_address(&mut self, _iface: &str) {}

    fn hw_address(&self) -> Option<&str> {
        None
    }

    /// Hardware address to request anycast DHCP with
    fn anycast_address(&self) -> Option<String> {
        None
    }
}

fn read_hw_address(iface: &str) -> Option<String> {
    let text = fs::read_to_string(format!("/sys/class/net/{}/address", iface)).ok()?;
    let addr = text.trim();
    (!addr.is_empty() && addr != "00:00:00:00:00:00").then(|| addr.to_string())
}

/// Wired Ethernet
#[derive(Debug, Default)]
pub struct Ethernet {
    hw_address: Option<String>,
}

impl DeviceHooks for Ethernet {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Ethernet
    }

    fn update_hw_address(&mut self, iface: &str) {
        self.hw_address = read_hw_address(iface);
    }

    fn hw_address(&self) -> Option<&str> {
        self.hw_address.as_deref()
    }
}

/// Wi-Fi station, ad-hoc or access point
#[derive(Debug, Default)]
pub struct Wifi {
    hw_address: Option<String>,
}

impl DeviceHooks for Wifi {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Wifi
    }

    fn check_compatible(&self, settings: &ConnectionSettings) -> Result<(), String> {
        if settings.kind != DeviceKind::Wifi {
            return Err(format!("{} connection cannot run on a wifi device", settings.kind));
        }
        if settings.wifi.is_none() {
            return Err("wifi connection has no wireless settings".to_string());
        }
        Ok(())
    }

    fn secrets_needed(&self, request: &ActivationRequest) -> Option<&'static str> {
        if request.secrets().is_some() {
            return None;
        }
        request.connection().secrets_setting()
    }

    fn update_hw_address(&mut self, iface: &str) {
        self.hw_address = read_hw_address(iface);
    }

    fn hw_address(&self) -> Option<&str> {
        self.hw_address.as_deref()
    }
}

/// Cellular modem; always available, point-to-point
#[derive(Debug, Default)]
pub struct Modem;

impl DeviceHooks for Modem {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Modem
    }

    fn is_available(&self, _carrier: bool) -> bool {
        true
    }

    fn gateway_less(&self) -> bool {
        true
    }
}

/// Bonding master; has no carrier until ports are attached
#[derive(Debug, Default)]
pub struct Bond;

impl DeviceHooks for Bond {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Bond
    }

    fn is_available(&self, _carrier: bool) -> bool {
        true
    }
}

/// OLPC mesh; DHCP goes out anycast on the companion radio's address
#[derive(Debug, Default)]
pub struct OlpcMesh {
    hw_address: Option<String>,
}

impl DeviceHooks for OlpcMesh {
    fn kind(&self) -> DeviceKind {
        DeviceKind::OlpcMesh
    }

    fn is_available(&self, _carrier: bool) -> bool {
        true
    }

    fn update_hw_address(&mut self, iface: &str) {
        self.hw_address = read_hw_address(iface);
    }

    fn hw_address(&self) -> Option<&str> {
        self.hw_address.as_deref()
    }

    fn anycast_address(&self) -> Option<String> {
        self.hw_address.clone()
    }
}

/// Kinds with no special behaviour (Bluetooth PAN, WiMAX, InfiniBand, ...)
#[derive(Debug)]
pub struct Plain {
    kind: DeviceKind,
}

impl DeviceHooks for Plain {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn check_compatible(&self, settings: &ConnectionSettings) -> Result<(), String> {
        // Generic devices run whatever is bound to them by name
        if self.kind == DeviceKind::Generic && settings.interface.is_some() {
            return Ok(());
        }
        if settings.kind == self.kind {
            Ok(())
        } else {
            Err(format!(
                "{} connection cannot run on a {} device",
                settings.kind, self.kind
            ))
        }
    }
}

/// Hooks for a device of `kind`
pub fn hooks_for(kind: DeviceKind) -> Box<dyn DeviceHooks> {
    match kind {
        DeviceKind::Ethernet => Box::<Ethernet>::default(),
        DeviceKind::Wifi => Box::<Wifi>::default(),
        DeviceKind::Modem => Box::new(Modem),
        DeviceKind::Bond => Box::new(Bond),
        DeviceKind::OlpcMesh => Box::<OlpcMesh>::default(),
        kind => Box::new(Plain { kind }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{WifiMode, WifiSettings};
    use std::rc::Rc;

    #[test]
    fn test_kind_mismatch_rejected() {
        let eth = hooks_for(DeviceKind::Ethernet);
        let wired = ConnectionSettings::new("Wired", "w", DeviceKind::Ethernet);
        let modem = ConnectionSettings::new("Mobile", "m", DeviceKind::Modem);
        assert!(eth.check_compatible(&wired).is_ok());
        assert!(eth.check_compatible(&modem).is_err());
    }

    #[test]
    fn test_wifi_needs_secrets_until_supplied() {
        let wifi = hooks_for(DeviceKind::Wifi);
        let mut settings = ConnectionSettings::new("Home", "h", DeviceKind::Wifi);
        settings.wifi = Some(WifiSettings {
            ssid: "home".to_string(),
            mode: WifiMode::Infrastructure,
            security: Some("wpa-psk".to_string()),
        });
        let mut request = ActivationRequest::new(Rc::new(settings));
        assert_eq!(wifi.secrets_needed(&request), Some("802-11-wireless-security"));

        request.set_secrets([("psk".to_string(), "secret".to_string())].into());
        assert_eq!(wifi.secrets_needed(&request), None);
    }

    #[test]
    fn test_availability() {
        assert!(!hooks_for(DeviceKind::Ethernet).is_available(false));
        assert!(hooks_for(DeviceKind::Ethernet).is_available(true));
        assert!(hooks_for(DeviceKind::Modem).is_available(false));
        assert!(hooks_for(DeviceKind::Bond).is_available(false));
    }

    #[test]
    fn test_gateway_less() {
        assert!(hooks_for(DeviceKind::Modem).gateway_less());
        assert!(!hooks_for(DeviceKind::Wifi).gateway_less());
    }

    #[test]
    fn test_generic_accepts_bound_profiles() {
        let generic = hooks_for(DeviceKind::Generic);
        let mut settings = ConnectionSettings::new("tun", "t", DeviceKind::Ethernet);
        assert!(generic.check_compatible(&settings).is_err());
        settings.interface = Some("tun0".to_string());
        assert!(generic.check_compatible(&settings).is_ok());
    }
}
