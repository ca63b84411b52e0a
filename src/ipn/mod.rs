//! Daemon-facing types
//!
//! meshd exposes its state through a small local API:
//!
//! - a status snapshot (lifecycle state, own addresses, peers, pending auth URL)
//! - the active preferences, editable in full ("start") or partially
//!   ([`MaskedPrefs`])
//! - a notification bus carrying state changes, auth URLs, fatal errors and
//!   engine liveness pings
//!
//! [`LocalBackend`] is the seam the `up` logic is written against;
//! [`client::LocalClient`] implements it over the daemon's local socket.

pub mod client;
pub mod prefs;
pub mod protocol;
pub mod tags;

#[cfg(test)]
pub mod fake;

pub use client::LocalClient;
pub use prefs::{MaskedPrefs, NetfilterMode, Persist, PrefField, Prefs, StableNodeId};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error message meshd sends when the caller may not operate it
pub const ERR_MSG_PERMISSION_DENIED: &str = "permission denied";

/// State key for the daemon-global login state
pub const GLOBAL_DAEMON_STATE_KEY: &str = "_daemon";

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IPC error: {0}")]
    Io(#[from] io::Error),
    #[error("daemon error: {0}")]
    Daemon(String),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

/// Lifecycle state of the daemon's backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    NoState,
    InUseOtherUser,
    NeedsLogin,
    NeedsMachineAuth,
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendState::NoState => "NoState",
            BackendState::InUseOtherUser => "InUseOtherUser",
            BackendState::NeedsLogin => "NeedsLogin",
            BackendState::NeedsMachineAuth => "NeedsMachineAuth",
            BackendState::Stopped => "Stopped",
            BackendState::Starting => "Starting",
            BackendState::Running => "Running",
        };
        f.write_str(s)
    }
}

/// One message from the daemon's notification bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notify {
    State(BackendState),
    /// Fatal backend error; the daemon can't proceed with this client
    ErrMessage(String),
    /// Interactive login URL the user should visit
    BrowseToUrl(String),
    /// Engine status update, used as a liveness ping
    Engine,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: StableNodeId,
    pub host_name: String,
    pub tailscale_ips: Vec<IpAddr>,
}

/// Point-in-time snapshot of the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub backend_state: BackendState,
    /// Pending interactive login URL, empty if none
    #[serde(default)]
    pub auth_url: String,
    /// This node's own addresses
    #[serde(default)]
    pub tailscale_ips: Vec<IpAddr>,
    #[serde(default)]
    pub peers: BTreeMap<String, PeerStatus>,
}

impl Status {
    pub fn new(backend_state: BackendState) -> Self {
        Self {
            backend_state,
            auth_url: String::new(),
            tailscale_ips: Vec::new(),
            peers: BTreeMap::new(),
        }
    }

    /// Exit node address of `prefs`, mapping an ID-only selection to the
    /// peer's first address.
    pub fn resolve_exit_node(&self, prefs: &Prefs) -> Option<IpAddr> {
        if let Some(ip) = prefs.exit_node_ip {
            return Some(ip);
        }
        let id = prefs.exit_node_id.as_ref()?;
        self.peers
            .values()
            .find(|peer| &peer.id == id)
            .and_then(|peer| peer.tailscale_ips.first().copied())
    }
}

/// Full (re)start request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Where the daemon keeps login state; `None` lets it pick per connection
    pub state_key: Option<String>,
    pub auth_key: Option<String>,
    pub update_prefs: Prefs,
    /// Prefs for daemons that predate server-side state storage
    pub legacy_prefs: Option<Prefs>,
}

/// Live notification subscription; ends when the daemon closes it
pub type Subscription = mpsc::Receiver<Result<Notify, BackendError>>;

/// Local API of the daemon
#[async_trait]
pub trait LocalBackend: Send + Sync {
    async fn status(&self) -> Result<Status, BackendError>;

    async fn get_prefs(&self) -> Result<Prefs, BackendError>;

    /// Apply a partial update and return the resulting prefs
    async fn edit_prefs(&self, mp: &MaskedPrefs) -> Result<Prefs, BackendError>;

    async fn start(&self, opts: &StartOptions) -> Result<(), BackendError>;

    async fn start_login_interactive(&self) -> Result<(), BackendError>;

    /// Ask for an engine update on the bus
    async fn request_engine_status(&self) -> Result<(), BackendError>;

    async fn watch_ipn_bus(&self) -> Result<Subscription, BackendError>;

    /// Errors if IP forwarding looks misconfigured for subnet routing
    async fn check_ip_forwarding(&self) -> Result<(), BackendError>;
}
