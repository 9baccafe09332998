// Address-family transports

//! Address acquisition for one family on one device
//!
//! The core never speaks DHCP itself. A [`Transport`] is started per device
//! and family when stage 3 needs an automatic address, and reports back
//! through the event channel with a [`TransportEvent`]: a lease (first one
//! or a renewal), a timeout, or a fatal error.
//!
//! [`CommandTransport`] runs an external lease helper and reads leases from
//! its stdout as `key=value` blocks separated by blank lines.

use crate::config::{parse_cidr, validate_interface_name};
use crate::ip_config::{Address, IpConfig, IpMethod, Route};
use crate::scheduler::{Event, EventSink};
use crate::types::{DeviceId, IpFamily};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Options reported alongside a lease (e.g. `host_name`)
pub type LeaseOptions = BTreeMap<String, String>;

/// Final outcome of one transport step
#[derive(Debug)]
pub enum TransportEvent {
    Lease {
        config: IpConfig,
        options: LeaseOptions,
    },
    Timeout,
    Fatal(String),
}

/// Handle of a running transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

/// Everything a transport needs to start
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub device: DeviceId,
    /// Activation attempt the events belong to
    pub attempt: u64,
    pub iface: String,
    pub family: IpFamily,
    pub method: IpMethod,
    pub connection_uuid: String,
    pub timeout: Duration,
    /// Hardware address to use for anycast DHCP, if the device kind needs it
    pub anycast: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no lease helper configured")]
    NotConfigured,
    #[error("invalid interface name '{0}'")]
    InvalidInterface(String),
    #[error("method {0} has no transport")]
    Unsupported(&'static str),
}

/// Address-family transport
pub trait Transport {
    fn start(&mut self, request: TransportRequest) -> Result<TransportHandle, TransportError>;

    /// Stop without waiting; no further events are delivered for `handle`
    fn stop(&mut self, handle: TransportHandle);
}

/// Runs `<helper> <iface> <ipv4|ipv6> <method>` per transport
pub struct CommandTransport {
    helper: Option<PathBuf>,
    sink: EventSink,
    tasks: HashMap<TransportHandle, JoinHandle<()>>,
    next: u64,
}

impl CommandTransport {
    pub fn new(helper: Option<PathBuf>, sink: EventSink) -> Self {
        Self {
            helper,
            sink,
            tasks: HashMap::new(),
            next: 0,
        }
    }
}

impl Transport for CommandTransport {
    fn start(&mut self, request: TransportRequest) -> Result<TransportHandle, TransportError> {
        let helper = self.helper.clone().ok_or(TransportError::NotConfigured)?;
        validate_interface_name(&request.iface)
            .map_err(|_| TransportError::InvalidInterface(request.iface.clone()))?;
        if matches!(
            request.method,
            IpMethod::Manual | IpMethod::Shared | IpMethod::Disabled | IpMethod::Ignore
        ) {
            return Err(TransportError::Unsupported(request.method.as_str()));
        }

        self.next += 1;
        let handle = TransportHandle(self.next);
        self.tasks.retain(|_, task| !task.is_finished());

        log::debug!(
            "({}): starting {} transport ({})",
            request.iface,
            request.family,
            request.method.as_str()
        );
        let sink = self.sink.clone();
        let task = tokio::task::spawn_local(run_helper(helper, request, sink));
        self.tasks.insert(handle, task);
        Ok(handle)
    }

    fn stop(&mut self, handle: TransportHandle) {
        // Aborting drops the child, which kill_on_drop terminates
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
        }
    }
}

impl Drop for CommandTransport {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

async fn run_helper(helper: PathBuf, request: TransportRequest, sink: EventSink) {
    let send = |event: TransportEvent| {
        let _ = sink.send(Event::Transport {
            device: request.device,
            family: request.family,
            attempt: request.attempt,
            event,
        });
    };

    let family = match request.family {
        IpFamily::V4 => "ipv4",
        IpFamily::V6 => "ipv6",
    };
    let mut command = Command::new(&helper);
    command
        .args([request.iface.as_str(), family, request.method.as_str()])
        .env("CONNECTION_UUID", &request.connection_uuid)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true);
    if let Some(anycast) = &request.anycast {
        command.env("ANYCAST_ADDRESS", anycast);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            send(TransportEvent::Fatal(format!(
                "failed to run {}: {}",
                helper.display(),
                e
            )));
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        send(TransportEvent::Fatal("lease helper has no stdout".to_string()));
        return;
    };

    let mut lines = BufReader::new(stdout).lines();
    let deadline = tokio::time::Instant::now() + request.timeout;
    let mut block: Vec<String> = Vec::new();
    let mut leased = false;

    loop {
        // Only the first lease is subject to the timeout
        let next = if leased {
            lines.next_line().await
        } else {
            match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Ok(next) => next,
                Err(_) => {
                    log::info!("({}): {} transport timed out", request.iface, request.family);
                    send(TransportEvent::Timeout);
                    return;
                }
            }
        };

        match next {
            Ok(Some(line)) if line.trim().is_empty() => {
                if block.is_empty() {
                    continue;
                }
                match parse_lease(request.family, &block) {
                    Ok((config, options)) => {
                        leased = true;
                        send(TransportEvent::Lease { config, options });
                    }
                    Err(e) => {
                        send(TransportEvent::Fatal(format!("{:#}", e)));
                        return;
                    }
                }
                block.clear();
            }
            Ok(Some(line)) => block.push(line),
            Ok(None) => break,
            Err(e) => {
                send(TransportEvent::Fatal(format!("reading lease helper: {}", e)));
                return;
            }
        }
    }

    // Trailing block without a blank line
    if !block.is_empty() {
        match parse_lease(request.family, &block) {
            Ok((config, options)) => {
                leased = true;
                send(TransportEvent::Lease { config, options });
            }
            Err(e) => {
                send(TransportEvent::Fatal(format!("{:#}", e)));
                return;
            }
        }
    }

    let status = child.wait().await;
    match (leased, status) {
        // One-shot helper: the lease stays until deactivation
        (true, Ok(status)) if status.success() => {}
        (_, Ok(status)) => send(TransportEvent::Fatal(format!("lease helper exited: {}", status))),
        (_, Err(e)) => send(TransportEvent::Fatal(format!("lease helper wait failed: {}", e))),
    }
}

/// Parse one `key=value` lease block
///
/// Known keys: `address` (CIDR), `gateway`, `dns`, `domain`, `search`,
/// `route` (`dest/prefix[,next_hop[,metric]]`), `mtu`, `never_default`.
/// Anything else is kept as a lease option.
pub fn parse_lease(family: IpFamily, lines: &[String]) -> Result<(IpConfig, LeaseOptions)> {
    let mut config = IpConfig::new(family);
    let mut options = LeaseOptions::new();
    let mut gateway: Option<IpAddr> = None;

    for line in lines {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("Malformed lease line '{}'", line))?;
        let value = value.trim();

        match key.trim() {
            "address" => {
                let (ip, prefix) = parse_cidr(value)?;
                config.addresses.push(Address::new(ip, prefix));
            }
            "gateway" => gateway = Some(value.parse().context("Invalid gateway")?),
            "dns" => config
                .nameservers
                .push(value.parse().context("Invalid nameserver")?),
            "domain" => config.domains.push(value.to_string()),
            "search" => config.searches.push(value.to_string()),
            "route" => {
                let mut parts = value.split(',');
                let (dest, prefix) = parse_cidr(parts.next().unwrap_or_default())?;
                let next_hop = match parts.next().filter(|s| !s.is_empty()) {
                    Some(hop) => Some(hop.parse().context("Invalid route next hop")?),
                    None => None,
                };
                let metric = match parts.next() {
                    Some(m) => m.parse().context("Invalid route metric")?,
                    None => 0,
                };
                config.routes.push(Route {
                    dest,
                    prefix,
                    next_hop,
                    metric,
                });
            }
            "mtu" => config.mtu = Some(value.parse().context("Invalid mtu")?),
            "never_default" => config.never_default = value == "true" || value == "1",
            other => {
                options.insert(other.to_string(), value.to_string());
            }
        }
    }

    anyhow::ensure!(!config.addresses.is_empty(), "Lease carries no address");
    for addr in &config.addresses {
        anyhow::ensure!(
            addr.address.is_ipv4() == (family == IpFamily::V4),
            "Lease address {} does not match {}",
            addr.address,
            family
        );
    }

    // The lease gateway belongs to the first address
    if let (Some(gw), Some(first)) = (gateway, config.addresses.first_mut()) {
        first.gateway = Some(gw);
    }

    Ok((config, options))
}
