//! Decision channel between the filter and the UI process.
//!
//! The filter hands a [`PermissionRequest`] to a [`DecisionChannel`] and gets
//! back a receiver that yields the matching [`Decision`]. If the channel loses
//! the request (UI gone, connection dropped) the receiver errors instead, which
//! the controller treats the same as a timeout.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::event_log::EventLog;
use crate::policy::PolicyStore;
use crate::protocol::{
    encode_line, CorrelationId, DaemonMessage, Decision, PermissionRequest, StatsData, UiMessage,
};

pub const STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Lines queued for one UI client before it counts as stalled.
pub const CLIENT_QUEUE: usize = 256;

/// Lowest uid treated as a regular login user.
const MIN_USER_UID: u32 = 1000;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no UI client connected")]
    NotConnected,
    #[error("UI connection closed")]
    Closed,
    #[error("UI client is not reading")]
    Full,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DecisionReceiver = oneshot::Receiver<Decision>;

pub trait DecisionChannel: Send + Sync + 'static {
    /// Dispatches `request`. The receiver yields the decision carrying the same
    /// correlation id, at most once.
    fn send(&self, request: PermissionRequest) -> Result<DecisionReceiver, ChannelError>;

    /// Releases a request that will not be answered any more.
    fn cancel(&self, correlation_id: CorrelationId);
}

struct Pending {
    request: PermissionRequest,
    responder: oneshot::Sender<Decision>,
}

/// Requests waiting for an answer, keyed by correlation id.
#[derive(Default)]
pub struct PendingResponders {
    entries: Mutex<HashMap<CorrelationId, Pending>>,
}

impl PendingResponders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request: PermissionRequest) -> DecisionReceiver {
        let (responder, rx) = oneshot::channel();
        self.entries
            .lock()
            .insert(request.correlation_id, Pending { request, responder });
        rx
    }

    /// Hands `decision` to its waiter. Returns false for unknown, late or
    /// duplicate ids.
    pub fn deliver(&self, decision: Decision) -> bool {
        let Some(pending) = self.entries.lock().remove(&decision.correlation_id) else {
            debug!("Dropping decision for unknown request {}", decision.correlation_id);
            return false;
        };
        if pending.responder.send(decision).is_err() {
            debug!("Waiter for {} already gone", decision.correlation_id);
            return false;
        }
        true
    }

    pub fn remove(&self, correlation_id: &CorrelationId) -> bool {
        self.entries.lock().remove(correlation_id).is_some()
    }

    /// Drops every waiter; their receivers observe the channel as closed.
    pub fn fail_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn requests(&self) -> Vec<PermissionRequest> {
        self.entries.lock().values().map(|p| p.request.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

struct ClientHandle {
    id: u64,
    tx: mpsc::Sender<String>,
}

impl ClientHandle {
    fn offer(&self, line: String) -> Result<(), ChannelError> {
        self.tx.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::Full,
            TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

/// Unix socket server UI processes connect to.
///
/// Any connection may change settings, list policies and events, or answer a
/// request. Permission prompts go only to the connection that last sent
/// `register`, which also receives every request still open at that moment.
/// When the registered client goes away its open requests fail and fall back
/// to the default verdict, as they do when its queue fills up.
pub struct UiServer {
    pending: PendingResponders,
    prompt: Mutex<Option<ClientHandle>>,
    next_client_id: AtomicU64,
    policies: Arc<PolicyStore>,
    events: Arc<EventLog>,
    stats: Arc<Mutex<StatsData>>,
}

impl UiServer {
    pub fn new(
        policies: Arc<PolicyStore>,
        events: Arc<EventLog>,
        stats: Arc<Mutex<StatsData>>,
    ) -> Self {
        Self {
            pending: PendingResponders::new(),
            prompt: Mutex::new(None),
            next_client_id: AtomicU64::new(1),
            policies,
            events,
            stats,
        }
    }

    /// Whether a client is registered to receive permission requests.
    pub fn is_connected(&self) -> bool {
        self.prompt.lock().is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Accepts UI clients until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if !peer_allowed(&stream, true) {
                        continue;
                    }
                    let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_client(stream, id).await;
                    });
                }
                Err(e) => {
                    error!("UI socket accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_client(self: Arc<Self>, stream: UnixStream, client_id: u64) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<String>(CLIENT_QUEUE);
        let mut lines = BufReader::new(read_half).lines();
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        info!("UI client {} connected", client_id);

        loop {
            let outgoing = tokio::select! {
                Some(line) = rx.recv() => line,
                _ = ticker.tick() => {
                    let stats = self.stats.lock().clone();
                    match encode_line(&DaemonMessage::StatsUpdate { stats }) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("Failed to encode stats: {}", e);
                            continue;
                        }
                    }
                },
                incoming = lines.next_line() => match incoming {
                    Ok(Some(line)) => match self.handle_line(&line, client_id, &tx).await {
                        Some(reply) => match encode_line(&reply) {
                            Ok(line) => line,
                            Err(e) => {
                                warn!("Failed to encode reply: {}", e);
                                continue;
                            }
                        },
                        None => continue,
                    },
                    Ok(None) => {
                        info!("UI client {} closed the connection", client_id);
                        break;
                    }
                    Err(e) => {
                        warn!("UI client {} read error: {}", client_id, e);
                        break;
                    }
                },
            };

            if let Err(e) = write_half.write_all(outgoing.as_bytes()).await {
                warn!("UI client {} write error: {}", client_id, e);
                break;
            }
        }

        self.detach(client_id);
    }

    /// Makes `client_id` the prompt target and replays open requests to it.
    /// A client whose queue cannot take the replay is not registered.
    fn register(&self, client_id: u64, tx: &mpsc::Sender<String>) {
        let mut prompt = self.prompt.lock();
        let handle = ClientHandle { id: client_id, tx: tx.clone() };
        for request in self.pending.requests() {
            let line = match encode_line(&DaemonMessage::PermissionRequest(request)) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to encode pending request: {}", e);
                    continue;
                }
            };
            if let Err(e) = handle.offer(line) {
                warn!("UI client {} cannot take open requests ({}), not registered", client_id, e);
                return;
            }
        }
        match prompt.replace(handle) {
            Some(previous) if previous.id != client_id => {
                info!("UI client {} takes over prompts from client {}", client_id, previous.id)
            }
            Some(_) => debug!("UI client {} registered again", client_id),
            None => info!("UI client {} registered for prompts", client_id),
        }
    }

    fn detach(&self, client_id: u64) {
        let mut prompt = self.prompt.lock();
        if prompt.as_ref().map(|c| c.id) != Some(client_id) {
            debug!("UI client {} disconnected", client_id);
            return;
        }
        *prompt = None;
        drop(prompt);

        let failed = self.pending.fail_all();
        if failed > 0 {
            warn!(
                "UI disconnected with {} open requests; they fall back to the default verdict",
                failed
            );
        } else {
            info!("UI client {} disconnected", client_id);
        }
    }

    /// Drops a prompt target whose queue is full and fails its open requests.
    fn drop_stalled(&self, prompt: &mut Option<ClientHandle>) {
        if let Some(stalled) = prompt.take() {
            let failed = self.pending.fail_all();
            warn!(
                "UI client {} stopped reading; dropped it with {} open requests",
                stalled.id, failed
            );
        }
    }

    /// Handles one line from client `client_id`. Returns the reply to write
    /// back, if any.
    async fn handle_line(
        &self,
        line: &str,
        client_id: u64,
        tx: &mpsc::Sender<String>,
    ) -> Option<DaemonMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let msg = match serde_json::from_str::<UiMessage>(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ignoring malformed UI message: {}", e);
                return None;
            }
        };

        match msg {
            UiMessage::Register => {
                self.register(client_id, tx);
                None
            }
            UiMessage::Decision(decision) => {
                debug!(
                    "[DECISION] {} allowed={} remember={}",
                    decision.correlation_id, decision.allowed, decision.remember
                );
                self.pending.deliver(decision);
                None
            }
            UiMessage::SetPolicy { app_id, allowed } => {
                if app_id.trim().is_empty() {
                    return Some(DaemonMessage::PolicyUpdated { app_id, success: false });
                }
                info!("[SETTINGS] {} -> {}", app_id, if allowed { "allow" } else { "deny" });
                let id = app_id.clone();
                let success = match self.on_store(move |p| p.set(&id, allowed)).await {
                    Some(Ok(_)) => true,
                    Some(Err(e)) => {
                        warn!("Policy for {} applied but not saved: {}", app_id, e);
                        false
                    }
                    None => false,
                };
                Some(DaemonMessage::PolicyUpdated { app_id, success })
            }
            UiMessage::RemovePolicy { app_id } => {
                info!("[SETTINGS] removing policy for {}", app_id);
                let id = app_id.clone();
                let success = match self.on_store(move |p| p.remove(&id)).await {
                    Some(Ok(existed)) => existed,
                    Some(Err(e)) => {
                        warn!("Failed to save after removing {}: {}", app_id, e);
                        false
                    }
                    None => false,
                };
                Some(DaemonMessage::PolicyUpdated { app_id, success })
            }
            UiMessage::ResetPolicies => {
                info!("[SETTINGS] resetting all policies");
                if let Some(Err(e)) = self.on_store(|p| p.reset()).await {
                    warn!("Failed to save after reset: {}", e);
                }
                Some(DaemonMessage::PoliciesList { policies: self.policies.all() })
            }
            UiMessage::ListPolicies => {
                Some(DaemonMessage::PoliciesList { policies: self.policies.all() })
            }
            UiMessage::ListEvents => {
                Some(DaemonMessage::EventsList { events: self.events.recent() })
            }
        }
    }

    /// Runs a policy store operation on the blocking pool; saves touch disk.
    async fn on_store<T, F>(&self, op: F) -> Option<T>
    where
        F: FnOnce(&PolicyStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let policies = Arc::clone(&self.policies);
        match tokio::task::spawn_blocking(move || op(&policies)).await {
            Ok(result) => Some(result),
            Err(e) => {
                error!("Policy store task failed: {}", e);
                None
            }
        }
    }

    fn push(&self, msg: &DaemonMessage) -> Result<(), ChannelError> {
        let line = encode_line(msg)?;
        let mut prompt = self.prompt.lock();
        let handle = prompt.as_ref().ok_or(ChannelError::NotConnected)?;
        // A closed queue means the connection task is exiting; it detaches itself.
        let result = handle.offer(line);
        if let Err(ChannelError::Full) = result {
            self.drop_stalled(&mut prompt);
        }
        result
    }
}

impl DecisionChannel for UiServer {
    fn send(&self, request: PermissionRequest) -> Result<DecisionReceiver, ChannelError> {
        let line = encode_line(&DaemonMessage::PermissionRequest(request.clone()))?;
        let correlation_id = request.correlation_id;
        // Held across register and write so a client registering meanwhile
        // sees the request exactly once.
        let mut prompt = self.prompt.lock();
        let handle = prompt.as_ref().ok_or(ChannelError::NotConnected)?;
        // Register before writing so a fast answer always finds its waiter.
        let rx = self.pending.register(request);
        if let Err(e) = handle.offer(line) {
            self.pending.remove(&correlation_id);
            if let ChannelError::Full = e {
                self.drop_stalled(&mut prompt);
            }
            return Err(e);
        }
        Ok(rx)
    }

    fn cancel(&self, correlation_id: CorrelationId) {
        if self.pending.remove(&correlation_id) {
            if let Err(e) = self.push(&DaemonMessage::RequestCancelled { correlation_id }) {
                debug!("Could not notify UI about cancelled request {}: {}", correlation_id, e);
            }
        }
    }
}

/// Mode for the UI socket; callers are filtered by uid on accept.
pub const UI_SOCKET_MODE: u32 = 0o666;

/// Binds a Unix socket at `path`, replacing a stale socket file but never
/// following or removing a symlink.
pub fn bind_socket(path: &Path, mode: u32) -> Result<UnixListener, ChannelError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} is a symlink, refusing to replace it", path.display()),
            )));
        }
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            warn!("Failed to set permissions on {}: {}", path.display(), e);
        }
    }

    info!("Listening on {}", path.display());
    Ok(listener)
}

/// Accepts root and the daemon's own user, plus regular login users
/// (uid >= 1000) when `allow_users` is set.
pub(crate) fn peer_allowed(stream: &UnixStream, allow_users: bool) -> bool {
    let cred = match stream.peer_cred() {
        Ok(cred) => cred,
        Err(e) => {
            warn!("Failed to get peer credentials ({}), allowing connection", e);
            return true;
        }
    };
    let uid = cred.uid();
    // SAFETY: geteuid has no preconditions and cannot fail.
    let own_uid = unsafe { libc::geteuid() };
    if uid == 0 || uid == own_uid || (allow_users && uid >= MIN_USER_UID) {
        debug!("Accepted peer uid {}", uid);
        true
    } else {
        warn!("Rejected connection from UID {}", uid);
        false
    }
}
