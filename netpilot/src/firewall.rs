// firewalld zone assignment via D-Bus

//! Firewall zone assignment
//!
//! Before an interface gets its first IP configuration committed it is
//! placed into the connection's firewalld zone. The commit proceeds when the
//! call completes, whether or not firewalld accepted it.

use crate::scheduler::{Event, EventSink};
use crate::types::{CallId, DeviceId, IpFamily};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use zbus::{proxy, Connection};

/// D-Bus proxy for firewalld zones
#[proxy(
    interface = "org.fedoraproject.FirewallD1.zone",
    default_service = "org.fedoraproject.FirewallD1",
    default_path = "/org/fedoraproject/FirewallD1"
)]
trait FirewallZone {
    /// Move an interface into a zone; an empty zone means the default one
    #[zbus(name = "changeZoneOfInterface")]
    fn change_zone_of_interface(&self, zone: &str, interface: &str) -> zbus::Result<String>;

    #[zbus(name = "removeInterface")]
    fn remove_interface(&self, zone: &str, interface: &str) -> zbus::Result<String>;
}

/// Zone assignment collaborator
pub trait ZoneAssigner {
    /// Start moving `iface` into `zone`; completion arrives as `Event::Zone`
    fn add_or_change(
        &mut self,
        device: DeviceId,
        family: IpFamily,
        iface: &str,
        zone: Option<&str>,
    ) -> CallId;

    /// Drop `iface` from its zone, fire-and-forget
    fn remove(&mut self, iface: &str, zone: Option<&str>);

    fn cancel(&mut self, call: CallId);
}

/// firewalld client on the system bus
pub struct FirewalldZones {
    connection: Rc<OnceCell<Connection>>,
    sink: EventSink,
    calls: HashMap<CallId, JoinHandle<()>>,
    next: u64,
}

impl FirewalldZones {
    pub fn new(sink: EventSink) -> Self {
        Self {
            connection: Rc::new(OnceCell::new()),
            sink,
            calls: HashMap::new(),
            next: 0,
        }
    }
}

async fn zone_proxy(cell: &OnceCell<Connection>) -> Result<FirewallZoneProxy<'static>> {
    let connection = cell
        .get_or_try_init(Connection::system)
        .await
        .context("Failed to connect to system D-Bus")?;
    FirewallZoneProxy::new(connection)
        .await
        .context("Failed to create firewalld proxy")
}

impl ZoneAssigner for FirewalldZones {
    fn add_or_change(
        &mut self,
        device: DeviceId,
        family: IpFamily,
        iface: &str,
        zone: Option<&str>,
    ) -> CallId {
        self.next += 1;
        let call = CallId(self.next);
        self.calls.retain(|_, task| !task.is_finished());

        let cell = Rc::clone(&self.connection);
        let sink = self.sink.clone();
        let iface = iface.to_string();
        let zone = zone.unwrap_or_default().to_string();

        let task = tokio::task::spawn_local(async move {
            let result = async {
                let proxy = zone_proxy(&cell).await?;
                proxy
                    .change_zone_of_interface(&zone, &iface)
                    .await
                    .context("changeZoneOfInterface failed")
            }
            .await;
            match result {
                Ok(assigned) => log::info!("({}) firewall zone set to '{}'", iface, assigned),
                Err(e) => log::warn!("({}) firewall zone add failed: {:#}", iface, e),
            }
            let _ = sink.send(Event::Zone {
                device,
                family,
                call,
            });
        });
        self.calls.insert(call, task);
        call
    }

    fn remove(&mut self, iface: &str, zone: Option<&str>) {
        let cell = Rc::clone(&self.connection);
        let iface = iface.to_string();
        let zone = zone.unwrap_or_default().to_string();
        tokio::task::spawn_local(async move {
            let result = async {
                let proxy = zone_proxy(&cell).await?;
                proxy
                    .remove_interface(&zone, &iface)
                    .await
                    .context("removeInterface failed")
            }
            .await;
            if let Err(e) = result {
                log::debug!("({}) firewall zone remove failed: {:#}", iface, e);
            }
        });
    }

    fn cancel(&mut self, call: CallId) {
        if let Some(task) = self.calls.remove(&call) {
            task.abort();
        }
    }
}
