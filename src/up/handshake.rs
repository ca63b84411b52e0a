//! Waiting for the daemon to come up
//!
//! [`Handshake`] is the transition table: it consumes notifications and
//! says what to do about them, without doing any I/O itself. [`Session`]
//! runs it on a listener task that owns the notification subscription and
//! reports back to the `up` flow over a channel. Interactive login is
//! started at most once per session, whether the listener or the `up` flow
//! asks first.

use super::UpError;
use crate::ipn::client::describe;
use crate::ipn::{
    BackendError, BackendState, LocalBackend, Notify, Subscription, ERR_MSG_PERMISSION_DENIED,
};
use crate::platform::Platform;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

pub struct HandshakeConfig {
    /// Auth URL the daemon was already showing before this run
    pub orig_auth_url: String,
    pub auth_key_supplied: bool,
    pub force_reauth: bool,
    pub admin_url: String,
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartLoginInteractive,
    Prompt(String),
    /// Reached Starting or Running; `announce` if a prompt was shown
    Success { announce: bool },
    Fatal(String),
}

pub struct Handshake {
    config: HandshakeConfig,
    login_started: bool,
    printed: bool,
    shown_urls: BTreeSet<String>,
    done: bool,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            login_started: false,
            printed: false,
            shown_urls: BTreeSet::new(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn request_login(&mut self) -> Option<Effect> {
        if self.login_started {
            return None;
        }
        self.login_started = true;
        Some(Effect::StartLoginInteractive)
    }

    pub fn on_notify(&mut self, n: &Notify) -> Vec<Effect> {
        if self.done {
            return Vec::new();
        }
        match n {
            Notify::ErrMessage(msg) => {
                let mut msg = msg.clone();
                if msg == ERR_MSG_PERMISSION_DENIED {
                    msg.push_str(self.config.platform.permission_denied_hint());
                }
                self.done = true;
                vec![Effect::Fatal(msg)]
            }
            Notify::State(BackendState::NeedsLogin) => self.request_login().into_iter().collect(),
            Notify::State(BackendState::NeedsMachineAuth) => {
                self.printed = true;
                vec![Effect::Prompt(format!(
                    "\nTo authorize your machine, visit (as admin):\n\n\t{}\n\n",
                    self.config.admin_url
                ))]
            }
            Notify::State(BackendState::Starting | BackendState::Running) => {
                self.done = true;
                vec![Effect::Success {
                    announce: self.printed,
                }]
            }
            Notify::State(_) | Notify::Engine => Vec::new(),
            Notify::BrowseToUrl(url) => {
                if !self.should_show_auth_url(url) || !self.shown_urls.insert(url.clone()) {
                    return Vec::new();
                }
                self.printed = true;
                vec![Effect::Prompt(format!(
                    "\nTo authenticate, visit:\n\n\t{}\n\n",
                    url
                ))]
            }
        }
    }

    fn should_show_auth_url(&self, url: &str) -> bool {
        if self.config.auth_key_supplied {
            return false;
        }
        // A forced re-auth would otherwise echo the stale URL from before.
        !(self.config.force_reauth && url == self.config.orig_auth_url)
    }
}

/// Starts interactive login on the first call only
#[derive(Clone)]
struct LoginOnce {
    backend: Arc<dyn LocalBackend>,
    started: Arc<AtomicBool>,
}

impl LoginOnce {
    async fn start(&self) -> Result<(), BackendError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Starting interactive login");
        self.backend.start_login_interactive().await
    }
}

#[derive(Debug)]
enum Signal {
    /// The subscription delivered its first notification
    Live,
    Running,
    Failed(UpError),
}

/// Notification listener plus the channels to talk to it
pub struct Session {
    signals: mpsc::Receiver<Signal>,
    login: LoginOnce,
    cancel: CancellationToken,
    _stop_listener: DropGuard,
}

impl Session {
    /// Subscribe to the daemon's notifications and wait until the
    /// subscription is live, so no transition after this point is missed.
    pub async fn open(
        backend: Arc<dyn LocalBackend>,
        machine: Handshake,
        out: Box<dyn Write + Send>,
        cancel: &CancellationToken,
    ) -> Result<Self, UpError> {
        let sub = backend.watch_ipn_bus().await?;

        let token = cancel.child_token();
        let (signal_tx, signals) = mpsc::channel(4);
        let login = LoginOnce {
            backend: backend.clone(),
            started: Arc::new(AtomicBool::new(false)),
        };
        let listener = Listener {
            login: login.clone(),
            machine,
            out,
            signals: signal_tx,
        };
        tokio::spawn(listener.run(sub, token.clone()));

        let mut session = Self {
            signals,
            login,
            cancel: cancel.clone(),
            _stop_listener: token.drop_guard(),
        };

        // Any traffic will do; an engine update is the cheapest to ask for.
        backend.request_engine_status().await?;
        // The listener reports Live before any outcome.
        if let Signal::Failed(e) = session.next_signal().await? {
            return Err(e);
        }
        debug!("Subscribed to daemon notifications");
        Ok(session)
    }

    /// Start interactive login now, unless the listener already did
    ///
    /// Runs even when the daemon already reported Running, so a forced
    /// re-auth always reaches it.
    pub async fn request_login(&self) -> Result<(), UpError> {
        self.login.start().await?;
        Ok(())
    }

    pub async fn wait_running(mut self) -> Result<(), UpError> {
        loop {
            match self.next_signal().await? {
                Signal::Live => continue,
                Signal::Running => return Ok(()),
                Signal::Failed(e) => return Err(e),
            }
        }
    }

    async fn next_signal(&mut self) -> Result<Signal, UpError> {
        tokio::select! {
            biased;
            signal = self.signals.recv() => match signal {
                Some(signal) => Ok(signal),
                // The listener quits silently when canceled.
                None if self.cancel.is_cancelled() => Err(UpError::Canceled),
                None => Err(UpError::StreamEnded),
            },
            _ = self.cancel.cancelled() => Err(UpError::Canceled),
        }
    }
}

struct Listener {
    login: LoginOnce,
    machine: Handshake,
    out: Box<dyn Write + Send>,
    signals: mpsc::Sender<Signal>,
}

impl Listener {
    async fn run(mut self, mut sub: Subscription, token: CancellationToken) {
        let mut live = false;
        loop {
            let effects = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                item = sub.recv() => match item {
                    Some(Ok(n)) => {
                        debug!("notify: {}", describe(&n));
                        if !live {
                            live = true;
                            let _ = self.signals.send(Signal::Live).await;
                        }
                        self.machine.on_notify(&n)
                    }
                    Some(Err(e)) => {
                        self.fail(UpError::Backend(e)).await;
                        return;
                    }
                    None => {
                        if !token.is_cancelled() {
                            self.fail(UpError::StreamEnded).await;
                        }
                        return;
                    }
                },
            };
            if !self.apply(effects, &token).await {
                return;
            }
        }
    }

    /// Carry out `effects`; false once the handshake is over
    async fn apply(&mut self, effects: Vec<Effect>, token: &CancellationToken) -> bool {
        for effect in effects {
            match effect {
                Effect::StartLoginInteractive => {
                    if let Err(e) = self.login.start().await {
                        self.fail(UpError::Backend(e)).await;
                        return false;
                    }
                }
                Effect::Prompt(text) => self.print(&text),
                Effect::Success { announce } => {
                    if announce {
                        self.print("Success.\n");
                    }
                    let _ = self.signals.send(Signal::Running).await;
                    token.cancel();
                    return false;
                }
                Effect::Fatal(msg) => {
                    self.fail(UpError::BackendFatal(msg)).await;
                    return false;
                }
            }
        }
        true
    }

    fn print(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            warn!("Failed to print prompt: {}", e);
        }
    }

    async fn fail(&mut self, err: UpError) {
        debug!("Handshake failed: {}", err);
        let _ = self.signals.send(Signal::Failed(err)).await;
    }
}
