//! Provider socket - the boundary to the OS flow-filtering layer.
//!
//! A platform adapter (network extension shim, packet queue reader, ...)
//! connects here, reports new and closed flows, and applies the verdicts it
//! receives. Verdict lines for one flow are written in the order the filter
//! produced them, so a `pause` always reaches the adapter before the final
//! `allow`/`drop` for the same flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::channel::peer_allowed;
use crate::controller::{FilterError, FilterHost, FlowController, StopReason};
use crate::flow::{Flow, FlowId, NewFlowVerdict, Verdict};
use crate::protocol::{encode_line, ProviderCommand, ProviderMessage};

/// Only root and the daemon's own user may act as the provider.
pub const PROVIDER_SOCKET_MODE: u32 = 0o600;

/// Verdict lines queued for the adapter before it counts as stalled.
pub const PROVIDER_QUEUE: usize = 1024;

struct Connection {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// [`FilterHost`] backed by the currently connected provider.
pub struct ProviderHost {
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ProviderHost {
    pub fn new() -> Self {
        Self::with_queue_capacity(PROVIDER_QUEUE)
    }

    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            conn: Mutex::new(None),
            next_id: AtomicU64::new(0),
            queue_capacity: capacity.max(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn attach(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        if self.conn.lock().replace(Connection { id, tx }).is_some() {
            warn!("Provider {} replaces an existing provider connection", id);
        }
        (id, rx)
    }

    /// Returns whether `id` was still the active connection.
    fn detach(&self, id: u64) -> bool {
        let mut conn = self.conn.lock();
        if conn.as_ref().map(|c| c.id) == Some(id) {
            *conn = None;
            true
        } else {
            false
        }
    }

    fn send_verdict(&self, flow_id: FlowId, verdict: NewFlowVerdict) {
        let line = match encode_line(&ProviderCommand::Verdict { flow_id, verdict }) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode verdict for {}: {}", flow_id, e);
                return;
            }
        };
        let mut conn = self.conn.lock();
        let Some(active) = conn.as_ref() else {
            warn!("No provider connected, verdict for {} not delivered", flow_id);
            return;
        };
        match active.tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Provider {} stopped reading, dropping it; verdict for {} not delivered",
                    active.id, flow_id
                );
                *conn = None;
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Provider gone, verdict for {} not delivered", flow_id);
            }
        }
    }
}

impl Default for ProviderHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterHost for ProviderHost {
    fn apply_settings(&self) -> Result<(), FilterError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(FilterError::HostUnavailable)
        }
    }

    fn pause(&self, flow: &Flow) {
        self.send_verdict(flow.id, NewFlowVerdict::Pause);
    }

    fn resume(&self, flow: &Flow, verdict: Verdict) {
        self.send_verdict(flow.id, verdict.into());
    }
}

/// Accepts provider connections until the listener fails. Each connection
/// starts the filter; losing the active connection stops it.
pub async fn serve(
    listener: UnixListener,
    host: Arc<ProviderHost>,
    controller: Arc<FlowController>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                if !peer_allowed(&stream, false) {
                    continue;
                }
                let host = host.clone();
                let controller = controller.clone();
                tokio::spawn(async move {
                    handle_connection(stream, host, controller).await;
                });
            }
            Err(e) => {
                error!("Provider socket accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    host: Arc<ProviderHost>,
    controller: Arc<FlowController>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (id, mut rx) = host.attach();
    info!("Provider {} connected", id);

    if let Err(e) = controller.start_filter() {
        error!("Provider {}: filter activation failed: {}", id, e);
        host.detach(id);
        return;
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            queued = rx.recv() => match queued {
                Some(line) => {
                    if let Err(e) = write_half.write_all(line.as_bytes()).await {
                        warn!("Provider {} write error: {}", id, e);
                        break;
                    }
                }
                None => break,
            },
            incoming = lines.next_line() => match incoming {
                Ok(Some(line)) => handle_line(&line, &host, &controller),
                Ok(None) => {
                    info!("Provider {} closed the connection", id);
                    break;
                }
                Err(e) => {
                    warn!("Provider {} read error: {}", id, e);
                    break;
                }
            },
        }
    }

    // Also covers a connection the host already dropped for stalling.
    host.detach(id);
    if !host.is_connected() {
        controller.stop_filter(StopReason::ProviderDisconnected);
    }
}

fn handle_line(line: &str, host: &ProviderHost, controller: &Arc<FlowController>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let msg = match serde_json::from_str::<ProviderMessage>(line) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Ignoring malformed provider message: {}", e);
            return;
        }
    };

    match msg {
        ProviderMessage::NewFlow {
            flow_id,
            app_id,
            remote_address,
            remote_port,
            protocol,
            direction,
        } => {
            let flow = Flow {
                id: flow_id,
                app_id,
                remote_address,
                remote_port,
                protocol,
                direction,
                created_at: Utc::now(),
            };
            match controller.handle_new_flow(flow) {
                // Paused flows already had their pause sent through the host.
                NewFlowVerdict::Pause => {}
                verdict => host.send_verdict(flow_id, verdict),
            }
        }
        ProviderMessage::FlowClosed { flow_id } => {
            debug!("Provider closed flow {}", flow_id);
            controller.handle_flow_closed(flow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{bind_socket, UiServer};
    use crate::classifier::FlowClassifier;
    use crate::controller::{ControllerSettings, FilterStatus};
    use crate::event_log::EventLog;
    use crate::policy::PolicyStore;
    use crate::protocol::StatsData;

    struct Daemon {
        host: Arc<ProviderHost>,
        controller: Arc<FlowController>,
        policies: Arc<PolicyStore>,
    }

    fn daemon() -> Daemon {
        let policies = Arc::new(PolicyStore::in_memory());
        let events = Arc::new(EventLog::new(10));
        let stats = Arc::new(Mutex::new(StatsData::default()));
        let ui = Arc::new(UiServer::new(policies.clone(), events.clone(), stats.clone()));
        let host = Arc::new(ProviderHost::new());
        let controller = FlowController::new(
            FlowClassifier::new(policies.clone()),
            policies.clone(),
            events,
            ui,
            host.clone(),
            ControllerSettings {
                decision_timeout: Duration::from_secs(30),
                default_verdict: Verdict::Drop,
            },
            stats,
        );
        Daemon { host, controller, policies }
    }

    #[test]
    fn apply_fails_without_provider() {
        let d = daemon();
        assert!(matches!(d.host.apply_settings(), Err(FilterError::HostUnavailable)));
        assert!(d.controller.start_filter().is_err());
        assert_eq!(d.controller.status(), FilterStatus::Error);
    }

    type CommandLines = tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>;

    async fn read_command(lines: &mut CommandLines) -> ProviderCommand {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn new_flow(flow_id: u64, app_id: &str) -> String {
        format!(
            concat!(
                r#"{{"type":"new_flow","flow_id":{},"app_id":"{}","#,
                r#""remote_address":"1.1.1.1","remote_port":443,"protocol":"tcp"}}"#,
                "\n"
            ),
            flow_id, app_id
        )
    }

    #[test]
    fn stalled_provider_is_dropped() {
        let host = ProviderHost::with_queue_capacity(1);
        // Held but never drained.
        let (id, _queue) = host.attach();
        host.send_verdict(FlowId(1), NewFlowVerdict::Pause);
        assert!(host.is_connected());

        host.send_verdict(FlowId(1), NewFlowVerdict::Allow);
        assert!(!host.is_connected());
        assert!(!host.detach(id));
        assert!(matches!(host.apply_settings(), Err(FilterError::HostUnavailable)));
    }

    #[tokio::test]
    async fn provider_session_drives_the_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.sock");
        let listener = bind_socket(&path, PROVIDER_SOCKET_MODE).unwrap();
        let d = daemon();
        d.policies.set("com.example.Allowed", true).unwrap();
        tokio::spawn(serve(listener, d.host.clone(), d.controller.clone()));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while d.controller.status() != FilterStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Known app: answered straight away.
        write_half.write_all(new_flow(1, "com.example.Allowed").as_bytes()).await.unwrap();
        assert_eq!(
            read_command(&mut lines).await,
            ProviderCommand::Verdict { flow_id: FlowId(1), verdict: NewFlowVerdict::Allow }
        );

        // Unknown app with no UI attached: pause, then the default.
        write_half.write_all(new_flow(2, "com.example.New").as_bytes()).await.unwrap();
        assert_eq!(
            read_command(&mut lines).await,
            ProviderCommand::Verdict { flow_id: FlowId(2), verdict: NewFlowVerdict::Pause }
        );
        assert_eq!(
            read_command(&mut lines).await,
            ProviderCommand::Verdict { flow_id: FlowId(2), verdict: NewFlowVerdict::Drop }
        );

        drop(write_half);
        drop(lines);
        while d.controller.status() != FilterStatus::Stopped {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!d.host.is_connected());
    }
}
