//! Newline-delimited JSON messages on the UI and provider sockets.
//!
//! Every message is an object with a `type` tag. Receivers ignore fields
//! they do not know so the filter and UI can be upgraded independently.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::classifier::AppCategory;
use crate::event_log::FirewallEvent;
use crate::flow::{Direction, Flow, FlowId, NewFlowVerdict, Protocol};
use crate::policy::Policy;

/// Ties a [`PermissionRequest`] to the [`Decision`] answering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    pub correlation_id: CorrelationId,
    pub app_id: String,
    pub app_category: AppCategory,
    pub remote_address: String,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub direction: Direction,
}

impl PermissionRequest {
    pub fn for_flow(correlation_id: CorrelationId, flow: &Flow, app_category: AppCategory) -> Self {
        Self {
            correlation_id,
            app_id: flow.app_id.clone(),
            app_category,
            remote_address: flow.remote_address.clone(),
            remote_port: flow.remote_port,
            protocol: flow.protocol,
            direction: flow.direction,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub correlation_id: CorrelationId,
    pub allowed: bool,
    /// Store the answer as the app's policy.
    #[serde(default)]
    pub remember: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsData {
    pub total_flows: u64,
    pub allowed_flows: u64,
    pub blocked_flows: u64,
    pub auto_resolved_flows: u64,
    pub pending_flows: u64,
}

/// Filter -> UI.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    PermissionRequest(PermissionRequest),
    RequestCancelled { correlation_id: CorrelationId },
    StatsUpdate { stats: StatsData },
    PoliciesList { policies: Vec<Policy> },
    EventsList { events: Vec<FirewallEvent> },
    PolicyUpdated { app_id: String, success: bool },
}

/// UI -> filter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiMessage {
    /// Makes this connection the one that receives permission requests.
    Register,
    Decision(Decision),
    SetPolicy { app_id: String, allowed: bool },
    RemovePolicy { app_id: String },
    ResetPolicies,
    ListPolicies,
    ListEvents,
}

/// OS adapter -> filter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderMessage {
    NewFlow {
        flow_id: FlowId,
        #[serde(default)]
        app_id: String,
        remote_address: String,
        remote_port: u16,
        protocol: Protocol,
        #[serde(default = "outbound")]
        direction: Direction,
    },
    FlowClosed { flow_id: FlowId },
}

fn outbound() -> Direction {
    Direction::Outbound
}

/// Filter -> OS adapter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderCommand {
    Verdict { flow_id: FlowId, verdict: NewFlowVerdict },
}

/// Serializes `msg` as one line, newline included.
pub fn encode_line<T: Serialize>(msg: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn permission_request_wire_shape() {
        let flow = Flow::new(
            FlowId(7),
            "com.example.App",
            "93.184.216.34",
            443,
            Protocol::Tcp,
            Direction::Outbound,
        );
        let id = CorrelationId::new();
        let request = PermissionRequest::for_flow(id, &flow, AppCategory::Unknown);
        let msg = DaemonMessage::PermissionRequest(request);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "permission_request");
        assert_eq!(value["correlation_id"], json!(id.0.to_string()));
        assert_eq!(value["app_id"], "com.example.App");
        assert_eq!(value["remote_port"], 443);
        assert_eq!(value["protocol"], "tcp");
    }

    #[test]
    fn decision_accepts_missing_remember_and_extra_fields() {
        let id = CorrelationId::new();
        let line = format!(
            r#"{{"type":"decision","correlation_id":"{}","allowed":true,"shown_for_ms":1200}}"#,
            id
        );
        let msg: UiMessage = serde_json::from_str(&line).unwrap();
        let expected = Decision { correlation_id: id, allowed: true, remember: false };
        assert_eq!(msg, UiMessage::Decision(expected));
    }

    #[test]
    fn unit_variants_parse() {
        let msg: UiMessage = serde_json::from_str(r#"{"type":"list_policies"}"#).unwrap();
        assert_eq!(msg, UiMessage::ListPolicies);
    }

    #[test]
    fn provider_new_flow_defaults() {
        let msg: ProviderMessage = serde_json::from_str(
            r#"{"type":"new_flow","flow_id":3,"remote_address":"1.1.1.1",
                "remote_port":53,"protocol":"udp"}"#,
        )
        .unwrap();
        match msg {
            ProviderMessage::NewFlow { flow_id, app_id, direction, .. } => {
                assert_eq!(flow_id, FlowId(3));
                assert!(app_id.is_empty());
                assert_eq!(direction, Direction::Outbound);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn encoded_lines_end_with_newline() {
        let cmd = ProviderCommand::Verdict { flow_id: FlowId(1), verdict: NewFlowVerdict::Pause };
        let line = encode_line(&cmd).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains(r#""verdict":"pause""#));
    }
}
