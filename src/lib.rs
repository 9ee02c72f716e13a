//! Netto - per-application network flow filter.
//!
//! New flows arrive from the OS layer through the provider socket, are
//! classified against stored policies, and are either decided immediately or
//! paused while the UI process asks the user.

pub mod channel;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod event_log;
pub mod flow;
pub mod policy;
pub mod protocol;
pub mod provider;

pub use channel::{DecisionChannel, UiServer};
pub use classifier::FlowClassifier;
pub use config::{Config, ConfigManager};
pub use controller::{ControllerSettings, FilterHost, FilterStatus, FlowController, StopReason};
pub use event_log::{EventLog, FirewallEvent};
pub use flow::{Direction, Flow, FlowId, NewFlowVerdict, Protocol, Verdict};
pub use policy::{Policy, PolicyStore};
