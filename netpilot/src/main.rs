// Network Connection Manager Daemon

use anyhow::{Context, Result};
use clap::Parser;
use netpilot::{
    config::{connection_settings, load_config},
    context::Services,
    dispatcher::ScriptDispatcher,
    dns::ResolvConfManager,
    firewall::{FirewalldZones, ZoneAssigner},
    hostname::GetentLookup,
    manager::Manager,
    scheduler::Event,
    secrets::FileSecretsBroker,
    shared::DnsmasqSharing,
    sleep_monitor::{SleepEvent, SleepMonitor},
    state_file,
    system::{self, IprouteConfigurator},
    transport::CommandTransport,
    types::Config,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio::time::interval;

/// Upper bound on an idle wait when no timer is pending
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "netpilot")]
#[command(about = "Network connection manager daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/netpilot/config.toml")]
    config: PathBuf,
}

/// Collaborators backed by the real system, reporting back through `sink`
fn build_services(config: &Config, sink: &mpsc::UnboundedSender<Event>) -> Services {
    let general = &config.general;
    let firewall: Option<Box<dyn ZoneAssigner>> = if general.firewall {
        Some(Box::new(FirewalldZones::new(sink.clone())))
    } else {
        None
    };

    Services {
        system: Box::new(IprouteConfigurator::new()),
        dns: Box::new(ResolvConfManager::new(general.resolv_conf.clone())),
        transport: Box::new(CommandTransport::new(
            general.lease_helper.clone(),
            sink.clone(),
        )),
        dispatcher: Box::new(ScriptDispatcher::new(general.dispatcher_dir.clone())),
        secrets: Box::new(FileSecretsBroker::new(
            general.secrets_dir.clone(),
            sink.clone(),
        )),
        firewall,
        sharing: Box::new(DnsmasqSharing::new()),
    }
}

/// Re-read the config file and swap in its connection list
fn reload(manager: &mut Manager, path: &Path) -> Result<()> {
    let config = load_config(path)
        .with_context(|| format!("Failed to reload config from {:?}", path))?;
    let connections = config
        .connections
        .iter()
        .map(|c| {
            connection_settings(c)
                .with_context(|| format!("Invalid connection '{}'", c.id))
                .map(|s| (s, c.visible))
        })
        .collect::<Result<Vec<_>>>()?;

    log::info!("Reloaded {} connections", connections.len());
    manager.reload_connections(connections);
    manager.set_configured_hostname(config.general.hostname.clone());
    Ok(())
}

/// Spawn the logind watcher; its events arrive on the returned channel
fn spawn_sleep_monitor() -> mpsc::UnboundedReceiver<SleepEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::task::spawn_local(async move {
        let result = async {
            let monitor = SleepMonitor::new().await?;
            monitor.monitor(tx).await
        }
        .await;
        if let Err(e) = result {
            log::error!("Sleep monitor error: {:#}", e);
        }
    });
    rx
}

fn main() -> Result<()> {
    // Every collaborator shares the loop thread, so one thread is enough
    let runtime = tokio::runtime::Builder::new_current_thread()
        .thread_name("netpilot")
        .enable_all()
        .build()?;

    LocalSet::new().block_on(&runtime, async_main())
}

async fn async_main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    log::info!("Starting netpilot daemon");
    log::info!(
        "{} devices, {} connections configured",
        config.devices.len(),
        config.connections.len()
    );

    // Completions from collaborators
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let services = build_services(&config, &event_tx);
    let lookup = Box::new(GetentLookup::new(event_tx.clone()));
    let mut manager = Manager::from_config(
        &config,
        services,
        lookup,
        system::startup_hostname(),
        Instant::now(),
    )
    .context("Failed to set up devices")?;

    manager.poll_carriers();
    manager.run_until_idle();

    let mut sleep_rx = if config.general.sleep_monitor {
        Some(spawn_sleep_monitor())
    } else {
        None
    };

    let state_path = config.general.state_file.clone();
    let mut carrier_timer = interval(Duration::from_secs(config.general.carrier_poll_secs));

    // Set up signal handlers
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("Failed to set up SIGHUP handler")?;

    log::info!("Daemon started successfully");

    // Main event loop
    loop {
        if let Err(e) = state_file::write_state(&state_path, &manager.snapshot()) {
            log::warn!("Failed to write state file: {}", e);
        }

        let deadline = manager
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

        tokio::select! {
            // Shutdown signals
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }

            _ = sighup.recv() => {
                log::info!("Received SIGHUP, reloading connections");
                if let Err(e) = reload(&mut manager, &args.config) {
                    log::error!("{:#}", e);
                }
            }

            Some(event) = event_rx.recv() => {
                manager.handle_event(event);
            }

            Some(event) = async {
                match sleep_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                manager.set_sleeping(event.is_sleeping());
            }

            _ = tokio::time::sleep_until(deadline.into()) => {
                manager.advance_to(Instant::now());
            }

            _ = carrier_timer.tick() => {
                manager.poll_carriers();
            }
        }

        manager.run_until_idle();
    }

    log::info!("Shutting down gracefully...");
    manager.shutdown();
    state_file::cleanup(&state_path);
    log::info!("Shutdown complete");

    Ok(())
}
