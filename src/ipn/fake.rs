//! In-memory daemon for tests
//!
//! Records every call and replies to requests by pushing scripted events onto
//! the notification bus, so handshake paths can be driven deterministically.

use super::{
    BackendError, LocalBackend, MaskedPrefs, Notify, Prefs, StartOptions, Status, Subscription,
};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Status,
    GetPrefs,
    EditPrefs(MaskedPrefs),
    Start(StartOptions),
    StartLoginInteractive,
    RequestEngineStatus,
    WatchIpnBus,
    CheckIpForwarding,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Send(Notify),
    Fail(String),
    Close,
}

#[derive(Default)]
pub struct Script {
    pub on_engine_request: Vec<BusEvent>,
    pub on_start: Vec<BusEvent>,
    pub on_edit: Vec<BusEvent>,
    pub on_login: Vec<BusEvent>,
}

pub struct FakeBackend {
    status: Status,
    prefs: Mutex<Prefs>,
    script: Script,
    calls: Mutex<Vec<Call>>,
    bus: Mutex<Option<mpsc::Sender<Result<Notify, BackendError>>>>,
    pub fail_watch: bool,
    pub ip_forwarding_warning: Option<String>,
}

impl FakeBackend {
    pub fn new(status: Status, prefs: Prefs, script: Script) -> Self {
        Self {
            status,
            prefs: Mutex::new(prefs),
            script,
            calls: Mutex::new(Vec::new()),
            bus: Mutex::new(None),
            fail_watch: false,
            ip_forwarding_warning: None,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn prefs(&self) -> Prefs {
        self.prefs.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn emit(&self, events: &[BusEvent]) {
        let mut bus = self.bus.lock().unwrap();
        for event in events {
            let Some(tx) = bus.as_ref() else { return };
            match event {
                BusEvent::Send(n) => {
                    let _ = tx.try_send(Ok(n.clone()));
                }
                BusEvent::Fail(msg) => {
                    let _ = tx.try_send(Err(BackendError::Daemon(msg.clone())));
                }
                BusEvent::Close => {
                    *bus = None;
                }
            }
        }
    }
}

#[async_trait]
impl LocalBackend for FakeBackend {
    async fn status(&self) -> Result<Status, BackendError> {
        self.record(Call::Status);
        Ok(self.status.clone())
    }

    async fn get_prefs(&self) -> Result<Prefs, BackendError> {
        self.record(Call::GetPrefs);
        Ok(self.prefs())
    }

    async fn edit_prefs(&self, mp: &MaskedPrefs) -> Result<Prefs, BackendError> {
        self.record(Call::EditPrefs(mp.clone()));
        let updated = {
            let mut prefs = self.prefs.lock().unwrap();
            mp.apply_to(&mut prefs);
            prefs.clone()
        };
        self.emit(&self.script.on_edit);
        Ok(updated)
    }

    async fn start(&self, opts: &StartOptions) -> Result<(), BackendError> {
        self.record(Call::Start(opts.clone()));
        *self.prefs.lock().unwrap() = opts.update_prefs.clone();
        self.emit(&self.script.on_start);
        Ok(())
    }

    async fn start_login_interactive(&self) -> Result<(), BackendError> {
        self.record(Call::StartLoginInteractive);
        self.emit(&self.script.on_login);
        Ok(())
    }

    async fn request_engine_status(&self) -> Result<(), BackendError> {
        self.record(Call::RequestEngineStatus);
        self.emit(&self.script.on_engine_request);
        Ok(())
    }

    async fn watch_ipn_bus(&self) -> Result<Subscription, BackendError> {
        self.record(Call::WatchIpnBus);
        if self.fail_watch {
            return Err(BackendError::Daemon("bus unavailable".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.bus.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn check_ip_forwarding(&self) -> Result<(), BackendError> {
        self.record(Call::CheckIpForwarding);
        match &self.ip_forwarding_warning {
            Some(msg) => Err(BackendError::Daemon(msg.clone())),
            None => Ok(()),
        }
    }
}
