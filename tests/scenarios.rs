//! End-to-end flow scenarios: a real UI socket, a scripted UI client and a
//! recording filter host.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use netto::channel::{bind_socket, UI_SOCKET_MODE};
use netto::controller::FilterError;
use netto::protocol::{
    encode_line, CorrelationId, DaemonMessage, Decision, PermissionRequest, StatsData, UiMessage,
};
use netto::{
    ControllerSettings, Direction, EventLog, FilterHost, Flow, FlowClassifier, FlowController,
    FlowId, NewFlowVerdict, PolicyStore, Protocol, StopReason, UiServer, Verdict,
};

#[derive(Debug, PartialEq, Eq)]
enum HostCall {
    Pause(FlowId),
    Resume(FlowId, Verdict),
}

struct RecordingHost {
    tx: mpsc::UnboundedSender<HostCall>,
}

impl FilterHost for RecordingHost {
    fn apply_settings(&self) -> Result<(), FilterError> {
        Ok(())
    }
    fn pause(&self, flow: &Flow) {
        let _ = self.tx.send(HostCall::Pause(flow.id));
    }
    fn resume(&self, flow: &Flow, verdict: Verdict) {
        let _ = self.tx.send(HostCall::Resume(flow.id, verdict));
    }
}

struct Rig {
    controller: Arc<FlowController>,
    policies: Arc<PolicyStore>,
    events: Arc<EventLog>,
    ui: Arc<UiServer>,
    host_calls: mpsc::UnboundedReceiver<HostCall>,
    socket: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

impl Rig {
    async fn host_call(&mut self) -> HostCall {
        tokio::time::timeout(Duration::from_secs(5), self.host_calls.recv())
            .await
            .expect("host call in time")
            .expect("host alive")
    }
}

fn rig(default_verdict: Verdict, decision_timeout: Duration) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("ui.sock");
    let listener = bind_socket(&socket, UI_SOCKET_MODE).unwrap();

    let policies = Arc::new(PolicyStore::open(dir.path().join("policies.json")).unwrap());
    let events = Arc::new(EventLog::new(50));
    let stats = Arc::new(Mutex::new(StatsData::default()));
    let ui = Arc::new(UiServer::new(policies.clone(), events.clone(), stats.clone()));
    tokio::spawn(ui.clone().serve(listener));

    let (tx, host_calls) = mpsc::unbounded_channel();
    let controller = FlowController::new(
        FlowClassifier::new(policies.clone()),
        policies.clone(),
        events.clone(),
        ui.clone(),
        Arc::new(RecordingHost { tx }),
        ControllerSettings { decision_timeout, default_verdict },
        stats,
    );
    controller.start_filter().unwrap();

    Rig { controller, policies, events, ui, host_calls, socket, _dir: dir }
}

struct UiClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl UiClient {
    async fn register(rig: &Rig) -> Self {
        let stream = UnixStream::connect(&rig.socket).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = UiClient { lines: BufReader::new(read_half).lines(), writer };
        client.send(&UiMessage::Register).await;
        while !rig.ui.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        client
    }

    async fn send(&mut self, msg: &UiMessage) {
        self.writer.write_all(encode_line(msg).unwrap().as_bytes()).await.unwrap();
    }

    async fn answer(&mut self, correlation_id: CorrelationId, allowed: bool, remember: bool) {
        self.send(&UiMessage::Decision(Decision { correlation_id, allowed, remember })).await;
    }

    /// Next message other than a stats push.
    async fn next(&mut self) -> DaemonMessage {
        loop {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("message in time")
                .unwrap()
                .expect("connection open");
            match serde_json::from_str(&line).unwrap() {
                DaemonMessage::StatsUpdate { .. } => continue,
                msg => return msg,
            }
        }
    }

    async fn next_request(&mut self) -> PermissionRequest {
        match self.next().await {
            DaemonMessage::PermissionRequest(request) => request,
            other => panic!("expected a permission request, got {:?}", other),
        }
    }
}

fn flow_for(id: u64, app_id: impl Into<String>) -> Flow {
    Flow::new(FlowId(id), app_id, "93.184.216.34", 443, Protocol::Tcp, Direction::Outbound)
}

fn example_flow(id: u64) -> Flow {
    flow_for(id, "com.example.App")
}

#[tokio::test]
async fn remembered_allow_resumes_and_stores_policy() {
    let mut rig = rig(Verdict::Drop, Duration::from_secs(30));
    let mut ui = UiClient::register(&rig).await;

    assert_eq!(rig.controller.handle_new_flow(example_flow(1)), NewFlowVerdict::Pause);
    assert_eq!(rig.host_call().await, HostCall::Pause(FlowId(1)));

    let request = ui.next_request().await;
    assert_eq!(request.app_id, "com.example.App");
    assert_eq!(request.remote_address, "93.184.216.34");
    assert_eq!(request.remote_port, 443);
    assert_eq!(request.protocol, Protocol::Tcp);

    ui.answer(request.correlation_id, true, true).await;
    assert_eq!(rig.host_call().await, HostCall::Resume(FlowId(1), Verdict::Allow));

    assert!(rig.policies.get("com.example.App").unwrap().allowed);
    let events = rig.events.recent();
    assert_eq!(events.len(), 1);
    assert!(events[0].allowed);
    assert!(!events[0].auto_resolved);

    // The next flow from the same app is answered from the stored policy.
    assert_eq!(rig.controller.handle_new_flow(example_flow(2)), NewFlowVerdict::Allow);
    assert!(rig.host_calls.try_recv().is_err());
    assert_eq!(rig.ui.pending_requests(), 0);
}

#[tokio::test]
async fn one_off_deny_drops_without_policy() {
    let mut rig = rig(Verdict::Allow, Duration::from_secs(30));
    let mut ui = UiClient::register(&rig).await;

    rig.controller.handle_new_flow(example_flow(1));
    assert_eq!(rig.host_call().await, HostCall::Pause(FlowId(1)));
    let request = ui.next_request().await;

    ui.answer(request.correlation_id, false, false).await;
    assert_eq!(rig.host_call().await, HostCall::Resume(FlowId(1), Verdict::Drop));

    assert!(rig.policies.get("com.example.App").is_none());
    let events = rig.events.recent();
    assert_eq!(events.len(), 1);
    assert!(!events[0].allowed);
}

#[tokio::test]
async fn no_ui_falls_back_to_default_immediately() {
    let mut rig = rig(Verdict::Drop, Duration::from_secs(30));

    assert_eq!(rig.controller.handle_new_flow(example_flow(1)), NewFlowVerdict::Pause);
    assert_eq!(rig.host_call().await, HostCall::Pause(FlowId(1)));
    assert_eq!(rig.host_call().await, HostCall::Resume(FlowId(1), Verdict::Drop));

    let events = rig.events.recent();
    assert_eq!(events.len(), 1);
    assert!(events[0].auto_resolved);
    assert_eq!(rig.controller.stats().auto_resolved_flows, 1);
    assert_eq!(rig.controller.pending_count(), 0);
}

#[tokio::test]
async fn unanswered_request_times_out_once() {
    let mut rig = rig(Verdict::Allow, Duration::from_millis(200));
    let mut ui = UiClient::register(&rig).await;

    rig.controller.handle_new_flow(example_flow(1));
    assert_eq!(rig.host_call().await, HostCall::Pause(FlowId(1)));
    let request = ui.next_request().await;

    assert_eq!(rig.host_call().await, HostCall::Resume(FlowId(1), Verdict::Allow));
    assert_eq!(
        ui.next().await,
        DaemonMessage::RequestCancelled { correlation_id: request.correlation_id }
    );

    // A late answer changes nothing.
    ui.answer(request.correlation_id, false, true).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rig.host_calls.try_recv().is_err());
    assert!(rig.policies.get("com.example.App").is_none());
    let events = rig.events.recent();
    assert_eq!(events.len(), 1);
    assert!(events[0].auto_resolved);
}

#[tokio::test]
async fn ui_disconnect_releases_pending_flows() {
    let mut rig = rig(Verdict::Drop, Duration::from_secs(30));
    let mut ui = UiClient::register(&rig).await;

    rig.controller.handle_new_flow(example_flow(1));
    assert_eq!(rig.host_call().await, HostCall::Pause(FlowId(1)));
    ui.next_request().await;

    drop(ui);
    assert_eq!(rig.host_call().await, HostCall::Resume(FlowId(1), Verdict::Drop));
    assert!(rig.events.recent()[0].auto_resolved);
}

#[tokio::test]
async fn reconnecting_ui_sees_open_requests() {
    let mut rig = rig(Verdict::Drop, Duration::from_secs(30));
    let mut first = UiClient::register(&rig).await;

    rig.controller.handle_new_flow(example_flow(1));
    let request = first.next_request().await;

    let mut second = UiClient::register(&rig).await;
    let replayed = second.next_request().await;
    assert_eq!(replayed.correlation_id, request.correlation_id);

    second.answer(replayed.correlation_id, true, false).await;
    assert_eq!(rig.host_call().await, HostCall::Pause(FlowId(1)));
    assert_eq!(rig.host_call().await, HostCall::Resume(FlowId(1), Verdict::Allow));
}

#[tokio::test]
async fn stop_releases_paused_flows_with_default() {
    let mut rig = rig(Verdict::Allow, Duration::from_secs(30));
    let mut ui = UiClient::register(&rig).await;

    rig.controller.handle_new_flow(example_flow(1));
    assert_eq!(rig.host_call().await, HostCall::Pause(FlowId(1)));
    let request = ui.next_request().await;

    rig.controller.stop_filter(StopReason::Shutdown);
    assert_eq!(rig.host_call().await, HostCall::Resume(FlowId(1), Verdict::Allow));
    assert_eq!(
        ui.next().await,
        DaemonMessage::RequestCancelled { correlation_id: request.correlation_id }
    );

    // Stopped filters pass new flows straight through.
    assert_eq!(rig.controller.handle_new_flow(example_flow(2)), NewFlowVerdict::Allow);
}

#[tokio::test]
async fn settings_client_does_not_steal_prompts() {
    let mut rig = rig(Verdict::Drop, Duration::from_secs(30));
    let mut prompt = UiClient::register(&rig).await;

    let stream = UnixStream::connect(&rig.socket).await.unwrap();
    let (read_half, writer) = stream.into_split();
    let mut settings = UiClient { lines: BufReader::new(read_half).lines(), writer };
    settings
        .send(&UiMessage::SetPolicy { app_id: "com.example.Other".into(), allowed: false })
        .await;
    assert_eq!(
        settings.next().await,
        DaemonMessage::PolicyUpdated { app_id: "com.example.Other".into(), success: true }
    );
    drop(settings);

    rig.controller.handle_new_flow(example_flow(1));
    let request = prompt.next_request().await;
    prompt.answer(request.correlation_id, true, false).await;
    assert_eq!(rig.host_call().await, HostCall::Pause(FlowId(1)));
    assert_eq!(rig.host_call().await, HostCall::Resume(FlowId(1), Verdict::Allow));
}

#[test]
fn policy_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policies.json");
    {
        let store = PolicyStore::open(&path).unwrap();
        store.set("com.example.App", true).unwrap();
        assert!(store.get("com.example.App").unwrap().allowed);
    }
    let reopened = PolicyStore::open(&path).unwrap();
    assert!(reopened.get("com.example.App").unwrap().allowed);
}

#[test]
fn event_log_evicts_oldest_at_capacity() {
    let log = EventLog::new(3);
    for id in 0..4 {
        let flow = flow_for(id, format!("com.example.App{}", id));
        log.append(netto::FirewallEvent::for_flow(&flow, true, false));
    }
    let events = log.recent();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].app_id, "com.example.App1");
    assert_eq!(events[2].app_id, "com.example.App3");
}
