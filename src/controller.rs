//! The flow filter engine.
//!
//! Each new flow is classified. Flows with a known answer are decided on the
//! spot; the rest are paused at the OS layer, a [`PermissionRequest`] goes out
//! over the [`DecisionChannel`], and a timer task per request waits for the
//! answer or the deadline, whichever comes first. Whatever path gets to
//! [`FlowController::resolve`] first removes the flow from the pending table;
//! every later attempt finds nothing and is a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::AbortHandle;

use crate::channel::{DecisionChannel, DecisionReceiver};
use crate::classifier::{app_category, Classification, FlowClassifier};
use crate::config::Config;
use crate::event_log::{EventLog, FirewallEvent};
use crate::flow::{Flow, FlowId, FlowState, NewFlowVerdict, Verdict};
use crate::policy::PolicyStore;
use crate::protocol::{CorrelationId, Decision, PermissionRequest, StatsData};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to apply filter settings: {0}")]
    Apply(String),
    #[error("OS adapter unavailable")]
    HostUnavailable,
}

/// The OS networking layer as seen by the filter.
pub trait FilterHost: Send + Sync + 'static {
    /// Installs the filter. Called once from [`FlowController::start_filter`].
    fn apply_settings(&self) -> Result<(), FilterError>;

    /// Holds `flow` without dropping it. Always called before the flow's
    /// permission request is dispatched.
    fn pause(&self, flow: &Flow);

    /// Releases a paused flow with its final verdict.
    fn resume(&self, flow: &Flow, verdict: Verdict);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterStatus {
    Stopped,
    Running,
    Error,
    Indeterminate,
}

impl fmt::Display for FilterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterStatus::Stopped => "Stopped",
            FilterStatus::Running => "Running",
            FilterStatus::Error => "Error",
            FilterStatus::Indeterminate => "Loading...",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserInitiated,
    ProviderDisconnected,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::UserInitiated => "user initiated",
            StopReason::ProviderDisconnected => "provider disconnected",
            StopReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub decision_timeout: Duration,
    /// Verdict when the user cannot be asked in time.
    pub default_verdict: Verdict,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            decision_timeout: config.decision_timeout(),
            default_verdict: config.default_verdict,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// How a pending flow left the pending table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Answered(Decision),
    TimedOut,
    ChannelFailed,
    Stopped,
}

/// Result of finalizing a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub flow: Flow,
    pub verdict: Verdict,
    pub state: FlowState,
    pub auto_resolved: bool,
}

struct PendingFlow {
    flow: Flow,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct PendingTable {
    by_request: HashMap<CorrelationId, PendingFlow>,
    by_flow: HashMap<FlowId, CorrelationId>,
}

impl PendingTable {
    fn insert(&mut self, id: CorrelationId, flow: Flow) {
        self.by_flow.insert(flow.id, id);
        self.by_request.insert(id, PendingFlow { flow, timer: None });
    }

    fn take(&mut self, id: &CorrelationId) -> Option<PendingFlow> {
        let entry = self.by_request.remove(id)?;
        if self.by_flow.get(&entry.flow.id) == Some(id) {
            self.by_flow.remove(&entry.flow.id);
        }
        Some(entry)
    }

    fn len(&self) -> usize {
        self.by_request.len()
    }
}

pub struct FlowController {
    classifier: FlowClassifier,
    policies: Arc<PolicyStore>,
    events: Arc<EventLog>,
    channel: Arc<dyn DecisionChannel>,
    host: Arc<dyn FilterHost>,
    settings: RwLock<ControllerSettings>,
    status: RwLock<FilterStatus>,
    pending: Mutex<PendingTable>,
    stats: Arc<Mutex<StatsData>>,
}

impl FlowController {
    pub fn new(
        classifier: FlowClassifier,
        policies: Arc<PolicyStore>,
        events: Arc<EventLog>,
        channel: Arc<dyn DecisionChannel>,
        host: Arc<dyn FilterHost>,
        settings: ControllerSettings,
        stats: Arc<Mutex<StatsData>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            classifier,
            policies,
            events,
            channel,
            host,
            settings: RwLock::new(settings),
            status: RwLock::new(FilterStatus::Indeterminate),
            pending: Mutex::new(PendingTable::default()),
            stats,
        })
    }

    pub fn status(&self) -> FilterStatus {
        *self.status.read()
    }

    pub fn settings(&self) -> ControllerSettings {
        *self.settings.read()
    }

    /// Applies to flows that arrive afterwards; pending timers keep their deadline.
    pub fn update_settings(&self, settings: ControllerSettings) {
        *self.settings.write() = settings;
        info!(
            "Default verdict {}, decision timeout {}s",
            settings.default_verdict,
            settings.decision_timeout.as_secs()
        );
    }

    pub fn stats(&self) -> StatsData {
        self.stats.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// `PendingDecision` while the flow waits for an answer, `None` once the
    /// filter is no longer involved with it.
    pub fn flow_state(&self, flow_id: FlowId) -> Option<FlowState> {
        self.pending
            .lock()
            .by_flow
            .contains_key(&flow_id)
            .then_some(FlowState::PendingDecision)
    }

    pub fn start_filter(&self) -> Result<(), FilterError> {
        match self.host.apply_settings() {
            Ok(()) => {
                *self.status.write() = FilterStatus::Running;
                info!("Filter started");
                Ok(())
            }
            Err(e) => {
                *self.status.write() = FilterStatus::Error;
                error!("Failed to start filter: {}", e);
                Err(e)
            }
        }
    }

    /// Stops filtering and releases every paused flow with the default verdict.
    pub fn stop_filter(&self, reason: StopReason) {
        info!("Stopping filter ({})", reason);
        *self.status.write() = FilterStatus::Stopped;

        let ids: Vec<CorrelationId> = self.pending.lock().by_request.keys().copied().collect();
        for id in ids {
            self.channel.cancel(id);
            self.resolve(id, Outcome::Stopped);
        }
    }

    /// Entry point for every new flow. Must run inside a Tokio runtime: an
    /// undecided flow spawns its timer task here.
    pub fn handle_new_flow(self: &Arc<Self>, flow: Flow) -> NewFlowVerdict {
        self.stats.lock().total_flows += 1;

        if self.status() != FilterStatus::Running {
            debug!("Filter not running, passing {}", flow.summary());
            self.stats.lock().allowed_flows += 1;
            return NewFlowVerdict::Allow;
        }

        match self.classifier.classify(&flow) {
            Classification::Cached(policy) => {
                let verdict = Verdict::from_allowed(policy.allowed);
                debug!("[{}] {} (policy)", verdict, flow.summary());
                self.record(&flow, verdict, false);
                return verdict.into();
            }
            Classification::Trusted(reason) => {
                debug!("[ALLOW] {} ({})", flow.summary(), reason);
                self.record(&flow, Verdict::Allow, false);
                return NewFlowVerdict::Allow;
            }
            Classification::Undecided => {}
        }

        let id = CorrelationId::new();
        let request = PermissionRequest::for_flow(id, &flow, app_category(&flow.app_id));

        // Paused and tracked before anything is sent.
        self.host.pause(&flow);
        {
            let mut pending = self.pending.lock();
            pending.insert(id, flow.clone());
            self.stats.lock().pending_flows = pending.len() as u64;
        }
        info!("[PROMPT] {} ({})", flow.summary(), id);

        match self.channel.send(request) {
            // Torn down or stopped while the request was on its way out.
            Ok(_) if !self.pending.lock().by_request.contains_key(&id) => {
                debug!("Request {} withdrawn during send", id);
                self.channel.cancel(id);
            }
            Ok(rx) => self.spawn_timer(id, rx),
            Err(e) => {
                warn!("Cannot ask about {}: {}", flow.summary(), e);
                self.resolve(id, Outcome::ChannelFailed);
            }
        }
        NewFlowVerdict::Pause
    }

    /// The OS tore the flow down. A pending request for it is withdrawn
    /// without a verdict or an event.
    pub fn handle_flow_closed(&self, flow_id: FlowId) {
        let entry = {
            let mut pending = self.pending.lock();
            let Some(id) = pending.by_flow.get(&flow_id).copied() else { return };
            let entry = pending.take(&id).map(|e| (id, e));
            self.stats.lock().pending_flows = pending.len() as u64;
            entry
        };
        if let Some((id, entry)) = entry {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            self.channel.cancel(id);
            debug!("[CLOSED] {} ({:?})", entry.flow.summary(), FlowState::Terminated);
        }
    }

    fn spawn_timer(self: &Arc<Self>, id: CorrelationId, rx: DecisionReceiver) {
        let controller = Arc::clone(self);
        let timeout = self.settings().decision_timeout;
        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                answer = rx => match answer {
                    Ok(decision) => Outcome::Answered(decision),
                    Err(_) => Outcome::ChannelFailed,
                },
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            };
            if !matches!(outcome, Outcome::Answered(_)) {
                controller.channel.cancel(id);
            }
            controller.resolve(id, outcome);
        });

        if let Some(entry) = self.pending.lock().by_request.get_mut(&id) {
            entry.timer = Some(task.abort_handle());
        }
    }

    /// Moves a pending flow to its final state. Returns `None` if the flow was
    /// already resolved or torn down.
    fn resolve(&self, id: CorrelationId, outcome: Outcome) -> Option<Resolution> {
        let entry = {
            let mut pending = self.pending.lock();
            let entry = pending.take(&id);
            self.stats.lock().pending_flows = pending.len() as u64;
            entry
        };
        let Some(PendingFlow { flow, timer }) = entry else {
            debug!("Request {} already resolved, ignoring {:?}", id, outcome);
            return None;
        };
        if let (Some(timer), Outcome::Stopped) = (timer, outcome) {
            timer.abort();
        }

        let default = self.settings().default_verdict;
        let (verdict, auto_resolved, remember) = match outcome {
            Outcome::Answered(d) => (Verdict::from_allowed(d.allowed), false, d.remember),
            Outcome::TimedOut | Outcome::ChannelFailed | Outcome::Stopped => (default, true, false),
        };

        self.host.resume(&flow, verdict);
        self.record(&flow, verdict, auto_resolved);

        if auto_resolved {
            info!("[AUTO] {} {} ({:?})", verdict, flow.summary(), outcome);
        } else {
            info!("[{}] {} (user)", verdict, flow.summary());
        }

        // Persist after the flow is released so disk trouble never holds it.
        if remember {
            if flow.has_app_id() {
                self.policies.record(&flow.app_id, verdict.is_allow());
                let policies = Arc::clone(&self.policies);
                let app_id = flow.app_id.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = policies.persist() {
                        warn!("Decision for {} applies now but was not saved: {}", app_id, e);
                    }
                });
            } else {
                debug!("Not remembering a decision for a flow without app id");
            }
        }

        let state = match verdict {
            Verdict::Allow => FlowState::Resumed,
            Verdict::Drop => FlowState::Terminated,
        };
        Some(Resolution { flow, verdict, state, auto_resolved })
    }

    fn record(&self, flow: &Flow, verdict: Verdict, auto_resolved: bool) {
        {
            let mut stats = self.stats.lock();
            match verdict {
                Verdict::Allow => stats.allowed_flows += 1,
                Verdict::Drop => stats.blocked_flows += 1,
            }
            if auto_resolved {
                stats.auto_resolved_flows += 1;
            }
        }
        self.events.append(FirewallEvent::for_flow(flow, verdict.is_allow(), auto_resolved));
    }
}
