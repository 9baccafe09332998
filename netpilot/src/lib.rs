// Network Connection Manager Library
// Shared modules for daemon and tests

#![warn(missing_docs)]

//! Network Connection Manager Library
//!
//! This library drives network devices through their activation pipeline,
//! obtains and applies IP configuration, and keeps routing, DNS and the
//! hostname pointed at the best available connection.
//!
//! # Main Components
//!
//! - [`activation`]: Activation requests binding a profile to a device
//! - [`config`]: Configuration file parsing and validation
//! - [`connection`]: Connection profiles and the settings store
//! - [`context`]: Collaborators and notifications shared with devices
//! - [`device`]: Per-device state machine and activation stages
//! - [`dispatcher`]: Dispatcher script invocation
//! - [`dns`]: resolv.conf management
//! - [`error`]: Error types surfaced to callers
//! - [`firewall`]: firewalld zone assignment via D-Bus
//! - [`hostname`]: Reverse-DNS hostname resolution
//! - [`ip_config`]: IP configuration types and merge rules
//! - [`manager`]: Device registry and event dispatch
//! - [`policy`]: Default route, DNS, hostname and auto-activation policy
//! - [`scheduler`]: Ready queue, timers and loop events
//! - [`secrets`]: Secrets broker
//! - [`shared`]: Connection sharing (address pool, NAT, dnsmasq)
//! - [`sleep_monitor`]: Suspend/resume detection via D-Bus
//! - [`state_file`]: State file for external monitoring
//! - [`system`]: Kernel link and address configuration
//! - [`transport`]: DHCP and autoconfiguration transports
//! - [`types`]: Shared data structures

pub mod activation;
pub mod config;
pub mod connection;
pub mod context;
pub mod device;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod firewall;
pub mod hostname;
pub mod ip_config;
pub mod manager;
pub mod policy;
pub mod scheduler;
pub mod secrets;
pub mod shared;
pub mod sleep_monitor;
pub mod state_file;
pub mod system;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;
