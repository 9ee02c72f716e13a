//! Flow descriptors and verdicts shared by every layer of the filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the OS networking layer assigns to a flow. Opaque to the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Final decision for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Drop,
}

impl Verdict {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed { Verdict::Allow } else { Verdict::Drop }
    }

    pub fn is_allow(self) -> bool {
        self == Verdict::Allow
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => f.write_str("ALLOW"),
            Verdict::Drop => f.write_str("BLOCK"),
        }
    }
}

/// What the filter answers to a new-flow notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewFlowVerdict {
    Allow,
    Drop,
    /// Held at the OS layer; a final verdict follows through `resume`.
    Pause,
}

impl From<Verdict> for NewFlowVerdict {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Allow => NewFlowVerdict::Allow,
            Verdict::Drop => NewFlowVerdict::Drop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    New,
    PendingDecision,
    Resumed,
    Terminated,
}

/// One network connection attempt reported by the OS layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    /// Bundle or process identity of the application that opened the flow.
    pub app_id: String,
    pub remote_address: String,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(
        id: FlowId,
        app_id: impl Into<String>,
        remote_address: impl Into<String>,
        remote_port: u16,
        protocol: Protocol,
        direction: Direction,
    ) -> Self {
        Self {
            id,
            app_id: app_id.into(),
            remote_address: remote_address.into(),
            remote_port,
            protocol,
            direction,
            created_at: Utc::now(),
        }
    }

    pub fn has_app_id(&self) -> bool {
        !self.app_id.trim().is_empty()
    }

    /// `app -> host:port/PROTO`, used in log lines.
    pub fn summary(&self) -> String {
        let app = if self.has_app_id() { self.app_id.as_str() } else { "unknown" };
        format!("{} -> {}:{}/{}", app, self.remote_address, self.remote_port, self.protocol)
    }
}
