//! Netto Filter Daemon
//!
//! Serves the provider socket (flows in, verdicts out) and the UI socket
//! (permission prompts and settings).

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};

use netto::channel::{bind_socket, UI_SOCKET_MODE};
use netto::protocol::StatsData;
use netto::provider::{self, ProviderHost, PROVIDER_SOCKET_MODE};
use netto::{
    ConfigManager, ControllerSettings, EventLog, FlowClassifier, FlowController, PolicyStore,
    StopReason, UiServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Netto filter daemon starting...");

    let config_manager = ConfigManager::new();
    let config = config_manager.get();

    // Unparsable files are moved aside by the stores; only I/O errors stop startup.
    let policies = Arc::new(
        PolicyStore::open(&config.policy_path)
            .with_context(|| format!("opening policy store {}", config.policy_path.display()))?,
    );
    let events = Arc::new(match EventLog::open(&config.event_log_path, config.event_log_capacity) {
        Ok(log) => log,
        Err(e) => {
            warn!("Starting with an empty event log: {}", e);
            EventLog::new(config.event_log_capacity)
        }
    });
    let stats = Arc::new(Mutex::new(StatsData::default()));

    let ui = Arc::new(UiServer::new(policies.clone(), events.clone(), stats.clone()));
    let host = Arc::new(ProviderHost::new());
    let classifier = FlowClassifier::new(policies.clone())
        .with_trusted_apps(config.trusted_apps.iter().cloned())
        .trust_system_apps(config.trust_system_apps);
    let controller = FlowController::new(
        classifier,
        policies.clone(),
        events.clone(),
        ui.clone(),
        host.clone(),
        ControllerSettings::from_config(&config),
        stats,
    );

    info!(
        "Default verdict: {} after {}s without an answer",
        config.default_verdict,
        config.decision_timeout().as_secs()
    );

    let ui_listener =
        bind_socket(&config.ui_socket, UI_SOCKET_MODE).context("binding UI socket")?;
    let provider_listener = bind_socket(&config.provider_socket, PROVIDER_SOCKET_MODE)
        .context("binding provider socket")?;

    tokio::spawn(ui.clone().serve(ui_listener));
    tokio::spawn(provider::serve(provider_listener, host, controller.clone()));

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut flush = tokio::time::interval(config.event_flush_interval());

    info!("Ready to filter flows");

    loop {
        tokio::select! {
            _ = flush.tick() => {
                let (events, policies) = (events.clone(), policies.clone());
                let synced = tokio::task::spawn_blocking(move || {
                    if let Err(e) = events.flush() {
                        warn!("Failed to save event log: {}", e);
                    }
                    match policies.refresh_if_changed() {
                        Ok(true) => info!("Picked up policy changes from disk"),
                        Ok(false) => {}
                        Err(e) => warn!("Failed to refresh policies: {}", e),
                    }
                })
                .await;
                if let Err(e) = synced {
                    warn!("Store sync task failed: {}", e);
                }
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration and policies");
                config_manager.reload();
                controller.update_settings(ControllerSettings::from_config(&config_manager.get()));
                let store = policies.clone();
                match tokio::task::spawn_blocking(move || store.reload()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to reload policies: {}", e),
                    Err(e) => warn!("Policy reload task failed: {}", e),
                }
            }
            _ = terminate.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.stop_filter(StopReason::Shutdown);
    if let Err(e) = events.flush() {
        warn!("Failed to save event log on shutdown: {}", e);
    }
    for path in [&config.ui_socket, &config.provider_socket] {
        let _ = std::fs::remove_file(path);
    }
    info!("Daemon stopped");
    Ok(())
}
