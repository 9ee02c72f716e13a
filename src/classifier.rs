//! Flow classification - cached policies, trusted apps, display categories

use std::collections::HashSet;
use std::sync::Arc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::flow::Flow;
use crate::policy::{Policy, PolicyStore};

/// Bundle ids of well-known VPN and proxy clients
static PROXY_APP_IDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "com.expressvpn.ExpressVPN",
        "com.nordvpn.osx",
        "com.surfshark.vpnclient.macos",
        "com.cyberghostvpn.mac",
        "com.privateinternetaccess.vpn",
        "com.tunnelbear.mac.TunnelBear",
        "com.protonvpn.mac",
        "com.windscribe.desktop",
        "com.hotspotshield.vpn.mac",
        "com.qiuyuzhou.ShadowsocksX-NG",
        "com.west2online.ClashX",
        "com.nssurge.surge-mac",
        "com.proxyman.NSProxy",
        "com.xk72.Charles",
        "com.proxifier.macos",
        "org.torproject.torbrowser",
        "org.getlantern.lantern",
        "ca.psiphon.Psiphon",
        "net.tunnelblick.tunnelblick",
        "net.openvpn.connect.app",
        "com.viscosityvpn.Viscosity",
    ]
    .into_iter()
    .collect()
});

const PROXY_KEYWORDS: &[&str] = &[
    "vpn", "proxy", "shadowsocks", "v2ray", "clash", "surge", "trojan",
    "vmess", "vless", "wireguard", "openvpn", "tunnel", "tor",
];

const SYSTEM_PREFIX: &str = "com.apple.";

/// Category of an application, shown next to a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppCategory {
    System,
    Proxy,
    Unknown,
}

/// Get category for an application id
pub fn app_category(app_id: &str) -> AppCategory {
    if app_id.starts_with(SYSTEM_PREFIX) {
        return AppCategory::System;
    }
    if PROXY_APP_IDS.contains(app_id) {
        return AppCategory::Proxy;
    }
    // "tor" only counts as a whole segment, otherwise "com.editor.App" would match.
    let lower = app_id.to_lowercase();
    let hit = lower
        .split(|c: char| c == '.' || c == '-' || c == '_')
        .any(|segment| {
            PROXY_KEYWORDS
                .iter()
                .any(|k| segment == *k || (*k != "tor" && segment.contains(k)))
        });
    if hit {
        return AppCategory::Proxy;
    }
    AppCategory::Unknown
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A stored policy decides the flow.
    Cached(Policy),
    /// Allowed without a policy; the string says why.
    Trusted(&'static str),
    /// Nobody has decided yet; the user must be asked.
    Undecided,
}

pub struct FlowClassifier {
    policies: Arc<PolicyStore>,
    trusted_apps: HashSet<String>,
    trust_system_apps: bool,
}

impl FlowClassifier {
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self {
            policies,
            trusted_apps: HashSet::new(),
            trust_system_apps: false,
        }
    }

    pub fn with_trusted_apps<I, S>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_apps = apps.into_iter().map(Into::into).collect();
        self
    }

    pub fn trust_system_apps(mut self, trust: bool) -> Self {
        self.trust_system_apps = trust;
        self
    }

    pub fn classify(&self, flow: &Flow) -> Classification {
        if !flow.has_app_id() {
            return Classification::Undecided;
        }

        // An explicit policy beats trust, so a user can still block a trusted app.
        if let Some(policy) = self.policies.get(&flow.app_id) {
            return Classification::Cached(policy);
        }

        if self.trusted_apps.contains(&flow.app_id) {
            return Classification::Trusted("Trusted application");
        }

        if self.trust_system_apps && app_category(&flow.app_id) == AppCategory::System {
            return Classification::Trusted("System application");
        }

        Classification::Undecided
    }
}
