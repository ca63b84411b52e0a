//! Local socket client for meshd
//!
//! Talks to the daemon over a Unix socket, or a named pipe on Windows. Each
//! call opens its own connection; the notification bus keeps a dedicated
//! connection open for as long as the subscription lives.

use super::protocol::{read_message, write_message, Request, Response};
use super::{
    BackendError, LocalBackend, MaskedPrefs, Notify, Prefs, StartOptions, Status, Subscription,
};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

#[cfg(windows)]
use interprocess::local_socket::tokio::{prelude::*, RecvHalf, SendHalf, Stream};
#[cfg(windows)]
use interprocess::local_socket::GenericFilePath;

#[cfg(not(windows))]
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
#[cfg(not(windows))]
use tokio::net::UnixStream;

#[cfg(windows)]
type Reader = RecvHalf;
#[cfg(windows)]
type Writer = SendHalf;
#[cfg(not(windows))]
type Reader = OwnedReadHalf;
#[cfg(not(windows))]
type Writer = OwnedWriteHalf;

/// Notifications buffered between the socket reader and the consumer
const BUS_BUFFER: usize = 32;

pub struct LocalClient {
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl LocalClient {
    pub fn new(socket_path: PathBuf, request_timeout: Duration) -> Self {
        Self {
            socket_path,
            request_timeout,
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    #[cfg(windows)]
    async fn open(&self) -> io::Result<(Reader, Writer)> {
        let name = self
            .socket_path
            .as_path()
            .to_fs_name::<GenericFilePath>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let stream = Stream::connect(name).await?;
        Ok(stream.split())
    }

    #[cfg(not(windows))]
    async fn open(&self) -> io::Result<(Reader, Writer)> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        Ok(stream.into_split())
    }

    async fn connect(&self) -> Result<(Reader, Writer), BackendError> {
        match timeout(self.request_timeout, self.open()).await {
            Ok(Ok(halves)) => Ok(halves),
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", self.socket_path.display(), e);
                Err(e.into())
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "Connect timeout").into()),
        }
    }

    /// Write one request and read the first reply frame
    async fn exchange(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
        request: &Request,
    ) -> Result<Response, BackendError> {
        match timeout(self.request_timeout, write_message(writer, request)).await {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "Write timeout").into()),
        }
        match timeout(self.request_timeout, read_message(reader)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "Read timeout").into()),
        }
    }

    /// Send a request to the daemon and wait for response
    async fn send_request(&self, request: Request) -> Result<Response, BackendError> {
        debug!("Sending request: {:?}", request);
        let (mut reader, mut writer) = self.connect().await?;
        let response = self.exchange(&mut reader, &mut writer, &request).await?;
        debug!("Received response: {:?}", response);

        match response {
            Response::Error(msg) => Err(BackendError::Daemon(msg)),
            other => Ok(other),
        }
    }

    async fn expect_ok(&self, request: Request, what: &'static str) -> Result<(), BackendError> {
        match self.send_request(request).await? {
            Response::Ok => Ok(()),
            _ => Err(BackendError::UnexpectedResponse(what)),
        }
    }
}

#[async_trait]
impl LocalBackend for LocalClient {
    async fn status(&self) -> Result<Status, BackendError> {
        match self.send_request(Request::Status).await? {
            Response::Status(status) => Ok(status),
            _ => Err(BackendError::UnexpectedResponse("Status")),
        }
    }

    async fn get_prefs(&self) -> Result<Prefs, BackendError> {
        match self.send_request(Request::GetPrefs).await? {
            Response::Prefs(prefs) => Ok(prefs),
            _ => Err(BackendError::UnexpectedResponse("GetPrefs")),
        }
    }

    async fn edit_prefs(&self, mp: &MaskedPrefs) -> Result<Prefs, BackendError> {
        match self.send_request(Request::EditPrefs(mp.clone())).await? {
            Response::Prefs(prefs) => Ok(prefs),
            _ => Err(BackendError::UnexpectedResponse("EditPrefs")),
        }
    }

    async fn start(&self, opts: &StartOptions) -> Result<(), BackendError> {
        self.expect_ok(Request::Start(opts.clone()), "Start").await
    }

    async fn start_login_interactive(&self) -> Result<(), BackendError> {
        self.expect_ok(Request::StartLoginInteractive, "StartLoginInteractive")
            .await
    }

    async fn request_engine_status(&self) -> Result<(), BackendError> {
        self.expect_ok(Request::RequestEngineStatus, "RequestEngineStatus")
            .await
    }

    async fn watch_ipn_bus(&self) -> Result<Subscription, BackendError> {
        let (mut reader, mut writer) = self.connect().await?;

        // The daemon acks once it has subscribed us.
        match self
            .exchange(&mut reader, &mut writer, &Request::WatchIpnBus)
            .await?
        {
            Response::Ok => {}
            Response::Error(msg) => return Err(BackendError::Daemon(msg)),
            _ => return Err(BackendError::UnexpectedResponse("WatchIpnBus")),
        }

        let (tx, rx) = mpsc::channel(BUS_BUFFER);
        tokio::spawn(async move {
            // Dropping the write half shuts down our side of the connection.
            let _writer = writer;
            loop {
                let response = tokio::select! {
                    _ = tx.closed() => break,
                    response = read_message::<_, Response>(&mut reader) => response,
                };
                let item = match response {
                    Ok(Response::Notify(n)) => Ok(n),
                    Ok(Response::Error(msg)) => Err(BackendError::Daemon(msg)),
                    Ok(other) => {
                        debug!("Ignoring non-notify frame on bus: {:?}", other);
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        debug!("Notification bus closed by daemon");
                        break;
                    }
                    Err(e) => Err(BackendError::Io(e)),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn check_ip_forwarding(&self) -> Result<(), BackendError> {
        self.expect_ok(Request::CheckIpForwarding, "CheckIpForwarding")
            .await
    }
}

/// Human-readable one-liner for a notification, for debug logs
pub fn describe(n: &Notify) -> String {
    match n {
        Notify::State(state) => format!("state={}", state),
        Notify::ErrMessage(msg) => format!("error={:?}", msg),
        Notify::BrowseToUrl(url) => format!("auth-url={}", url),
        Notify::Engine => "engine".to_string(),
    }
}
