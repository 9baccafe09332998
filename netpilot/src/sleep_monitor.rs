// logind suspend/resume monitor via D-Bus

//! Suspend/resume detection via D-Bus
//!
//! Follows logind's `PrepareForSleep` signal so the daemon can take managed
//! devices down before the machine suspends and bring them back on resume.

use anyhow::{Context, Result};
use futures_util::stream::StreamExt;
use tokio::sync::mpsc;
use zbus::{proxy, Connection};

/// Sleep event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepEvent {
    /// The system is about to suspend
    Suspending,
    /// The system came back from suspend
    Resumed,
}

impl SleepEvent {
    /// Map the `start` argument of `PrepareForSleep`
    pub fn from_signal(start: bool) -> Self {
        if start {
            SleepEvent::Suspending
        } else {
            SleepEvent::Resumed
        }
    }

    /// Whether networking should be asleep after this event
    pub fn is_sleeping(&self) -> bool {
        *self == SleepEvent::Suspending
    }
}

/// D-Bus proxy for the logind manager
#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait LoginManager {
    /// Emitted with `true` before suspend and `false` after resume
    #[zbus(signal)]
    fn prepare_for_sleep(&self, start: bool) -> zbus::Result<()>;
}

/// Sleep monitor
pub struct SleepMonitor {
    connection: Connection,
}

impl SleepMonitor {
    /// Create a new sleep monitor
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;

        Ok(Self { connection })
    }

    /// Forward every `PrepareForSleep` signal until the bus goes away
    pub async fn monitor(&self, tx: mpsc::UnboundedSender<SleepEvent>) -> Result<()> {
        let logind = LoginManagerProxy::new(&self.connection)
            .await
            .context("Failed to create logind proxy")?;
        let mut stream = logind
            .receive_prepare_for_sleep()
            .await
            .context("Failed to subscribe to PrepareForSleep")?;

        log::info!("Starting sleep monitor");

        while let Some(signal) = stream.next().await {
            let start = match signal.args() {
                Ok(args) => args.start,
                Err(e) => {
                    log::warn!("Malformed PrepareForSleep signal: {}", e);
                    continue;
                }
            };

            let event = SleepEvent::from_signal(start);
            log::info!("Sleep event: {:?}", event);
            if tx.send(event).is_err() {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_signal() {
        assert_eq!(SleepEvent::from_signal(true), SleepEvent::Suspending);
        assert_eq!(SleepEvent::from_signal(false), SleepEvent::Resumed);
        assert!(SleepEvent::Suspending.is_sleeping());
        assert!(!SleepEvent::Resumed.is_sleeping());
    }
}
