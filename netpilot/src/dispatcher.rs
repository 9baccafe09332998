//! Dispatcher scripts
//!
//! Every executable in the dispatcher directory is run with
//! `<iface|none> <action>` when a device comes up or goes down, a lease
//! changes, or the hostname changes. Runs are fire-and-forget: a failing
//! script is logged and never affects activation.

use crate::connection::ConnectionSettings;
use futures_util::future::join_all;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Events reported to dispatcher scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    Up,
    Down,
    Dhcp4Change,
    Dhcp6Change,
    Hostname,
}

impl DispatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchAction::Up => "up",
            DispatchAction::Down => "down",
            DispatchAction::Dhcp4Change => "dhcp4-change",
            DispatchAction::Dhcp6Change => "dhcp6-change",
            DispatchAction::Hostname => "hostname",
        }
    }
}

/// Fire-and-forget notification of external hooks
pub trait Dispatcher {
    fn run(
        &mut self,
        action: DispatchAction,
        connection: Option<&ConnectionSettings>,
        iface: Option<&str>,
    );
}

/// Runs the executables of one directory, in name order
pub struct ScriptDispatcher {
    dir: Option<PathBuf>,
}

impl ScriptDispatcher {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn scripts(dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut scripts: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| {
                e.metadata()
                    .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false)
            })
            .map(|e| e.path())
            .collect();
        scripts.sort();
        scripts
    }
}

impl Dispatcher for ScriptDispatcher {
    fn run(
        &mut self,
        action: DispatchAction,
        connection: Option<&ConnectionSettings>,
        iface: Option<&str>,
    ) {
        let Some(dir) = &self.dir else {
            return;
        };
        let scripts = Self::scripts(dir);
        if scripts.is_empty() {
            return;
        }

        let iface = iface.unwrap_or("none").to_string();
        let (id, uuid) = connection
            .map(|c| (c.id.clone(), c.uuid.clone()))
            .unwrap_or_default();
        log::debug!("dispatcher: {} {} ({} scripts)", iface, action.as_str(), scripts.len());

        tokio::task::spawn_local(async move {
            let mut children = Vec::new();
            for script in &scripts {
                match Command::new(script)
                    .args([iface.as_str(), action.as_str()])
                    .env("CONNECTION_ID", &id)
                    .env("CONNECTION_UUID", &uuid)
                    .spawn()
                {
                    Ok(child) => children.push((script, child)),
                    Err(e) => log::warn!("dispatcher: failed to run {}: {}", script.display(), e),
                }
            }

            let results = join_all(children.iter_mut().map(|(_, child)| child.wait())).await;
            for ((script, _), result) in children.iter().zip(results) {
                match result {
                    Ok(status) if status.success() => {}
                    Ok(status) => log::warn!("dispatcher: {} exited with {}", script.display(), status),
                    Err(e) => log::warn!("dispatcher: failed to run {}: {}", script.display(), e),
                }
            }
        });
    }
}
