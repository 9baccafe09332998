//! Secrets broker
//!
//! Devices that need credentials before the link can come up ask the broker
//! and park in `NeedAuth`. The reply arrives later as an event; a pending
//! request is cancelled when the device deactivates.

use crate::activation::Secrets;
use crate::connection::ConnectionSettings;
use crate::scheduler::{Event, EventSink};
use crate::types::{CallId, DeviceId};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::task::JoinHandle;

/// How the broker may obtain the secrets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecretsFlags {
    /// A user agent may be prompted
    pub allow_interaction: bool,
    /// Cached secrets were rejected; ask for fresh ones
    pub request_new: bool,
}

/// Secrets broker
pub trait SecretsBroker {
    fn request(
        &mut self,
        device: DeviceId,
        connection: &ConnectionSettings,
        setting: &str,
        flags: SecretsFlags,
        hint: Option<&str>,
    ) -> CallId;

    fn cancel(&mut self, call: CallId);
}

/// Reads `<dir>/<uuid>.toml`, one table per setting
pub struct FileSecretsBroker {
    dir: Option<PathBuf>,
    sink: EventSink,
    calls: HashMap<CallId, JoinHandle<()>>,
    next: u64,
}

impl FileSecretsBroker {
    pub fn new(dir: Option<PathBuf>, sink: EventSink) -> Self {
        Self {
            dir,
            sink,
            calls: HashMap::new(),
            next: 0,
        }
    }

    /// True once a secrets directory exists to answer requests
    pub fn is_available(&self) -> bool {
        self.dir.as_ref().is_some_and(|d| d.is_dir())
    }
}

impl SecretsBroker for FileSecretsBroker {
    fn request(
        &mut self,
        device: DeviceId,
        connection: &ConnectionSettings,
        setting: &str,
        flags: SecretsFlags,
        hint: Option<&str>,
    ) -> CallId {
        self.next += 1;
        let call = CallId(self.next);
        self.calls.retain(|_, task| !task.is_finished());

        let path = self
            .dir
            .as_ref()
            .map(|d| d.join(format!("{}.toml", connection.uuid)));
        let setting = setting.to_string();
        let sink = self.sink.clone();
        log::debug!(
            "secrets: requesting '{}' for '{}' (hint {:?}, new {})",
            setting,
            connection.id,
            hint,
            flags.request_new
        );

        let task = tokio::task::spawn_local(async move {
            let result = match path {
                Some(path) => match tokio::fs::read_to_string(&path).await {
                    Ok(text) => parse_secrets(&text, &setting).map_err(|e| format!("{:#}", e)),
                    Err(e) => Err(format!("{}: {}", path.display(), e)),
                },
                None => Err("no secrets agent available".to_string()),
            };
            let _ = sink.send(Event::Secrets {
                device,
                call,
                result,
            });
        });
        self.calls.insert(call, task);
        call
    }

    fn cancel(&mut self, call: CallId) {
        if let Some(task) = self.calls.remove(&call) {
            task.abort();
        }
    }
}

/// Extract the string values of one setting table
pub fn parse_secrets(text: &str, setting: &str) -> Result<Secrets> {
    let table: toml::Table = toml::from_str(text).context("Failed to parse secrets file")?;
    let section = table
        .get(setting)
        .and_then(|v| v.as_table())
        .with_context(|| format!("No secrets for setting '{}'", setting))?;

    let secrets: Secrets = section
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect();
    anyhow::ensure!(!secrets.is_empty(), "Setting '{}' has no secrets", setting);
    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secrets() {
        let text = r#"
["802-11-wireless-security"]
psk = "correct horse"
leap-password = "unused"
"#;
        let secrets = parse_secrets(text, "802-11-wireless-security").unwrap();
        assert_eq!(secrets.get("psk").map(String::as_str), Some("correct horse"));
        assert_eq!(secrets.len(), 2);
    }

    #[test]
    fn test_parse_secrets_missing_setting() {
        assert!(parse_secrets("[other]\nkey = \"v\"\n", "802-11-wireless-security").is_err());
        assert!(parse_secrets("[\"802-11-wireless-security\"]\n", "802-11-wireless-security").is_err());
        assert!(parse_secrets("not toml [", "x").is_err());
    }

    #[test]
    fn test_availability() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSecretsBroker::new(Some(dir.path().to_path_buf()), tx.clone()).is_available());
        assert!(!FileSecretsBroker::new(None, tx).is_available());
    }
}
