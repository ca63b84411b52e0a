//! `meshctl up`: connect, or change settings of a running node
//!
//! The flow is build → guard → pick a mode → apply:
//!
//! 1. [`builder`] turns the flags into the desired prefs
//! 2. [`revert`] refuses runs that would silently drop current settings
//! 3. [`mode`] picks between editing in place, resuming, or a full start
//! 4. for anything but an in-place edit, [`handshake`] waits for the daemon
//!    to come up, prompting for login along the way

pub mod builder;
pub mod flags;
pub mod handshake;
pub mod mode;
pub mod revert;

pub use flags::{FlagSet, UpArgs, UpInvocation};
pub use mode::UpdateMode;

use crate::ipn::{BackendError, LocalBackend, MaskedPrefs};
use crate::platform::Host;
use builder::BuildError;
use handshake::{Handshake, HandshakeConfig, Session};
use revert::{AccidentalRevert, UpCheckEnv};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum UpError {
    #[error("too many non-flag arguments: {0:?}")]
    Usage(Vec<String>),
    #[error("error fetching current status: {0}")]
    Status(#[source] BackendError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Revert(#[from] AccidentalRevert),
    #[error("can't change --login-server without --force-reauth")]
    LoginServerChangeNeedsReauth,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("backend error: {0}")]
    BackendFatal(String),
    #[error("notification stream ended before the daemon came up")]
    StreamEnded,
    #[error("canceled")]
    Canceled,
    #[error("timed out after {0:?} waiting for the daemon to come up")]
    TimedOut(Duration),
}

/// Run `up` against `backend`
///
/// Prompts go to `out`. `timeout` bounds the wait for the daemon to come up;
/// canceling `cancel` abandons it.
pub async fn run_up(
    backend: Arc<dyn LocalBackend>,
    inv: &UpInvocation,
    host: &Host,
    timeout: Option<Duration>,
    out: Box<dyn Write + Send>,
    cancel: &CancellationToken,
) -> Result<UpdateMode, UpError> {
    if !inv.extra.is_empty() {
        return Err(UpError::Usage(inv.extra.clone()));
    }
    let args = &inv.args;

    let st = backend.status().await.map_err(UpError::Status)?;
    debug!("Daemon is {}", st.backend_state);

    let mut prefs = builder::prefs_from_up_args(args, host, &st, |msg| warn!("{}", msg))?;

    if !prefs.advertise_routes.is_empty() {
        if let Err(e) = backend.check_ip_forwarding().await {
            warn!("{}", e);
        }
    }

    let cur = backend.get_prefs().await?;
    if !args.reset {
        builder::apply_implicit_prefs(&mut prefs, &cur, &host.user);
        let env = UpCheckEnv {
            platform: &host.platform,
            status: &st,
        };
        revert::check_for_accidental_setting_reverts(&inv.flags, &cur, &prefs, &env)?;
    }

    let mode = mode::select_update_mode(st.backend_state, args, &inv.flags, &cur, &prefs)?;
    info!("Applying settings ({})", mode);

    if mode == UpdateMode::WarmEdit {
        backend
            .edit_prefs(&mode::warm_edit_prefs(&prefs, &inv.flags))
            .await?;
        return Ok(mode);
    }

    let machine = Handshake::new(HandshakeConfig {
        orig_auth_url: st.auth_url.clone(),
        auth_key_supplied: !args.auth_key.is_empty(),
        force_reauth: args.force_reauth,
        admin_url: prefs.admin_page_url(),
        platform: host.platform.clone(),
    });
    let handshake = async {
        let session = Session::open(backend.clone(), machine, out, cancel).await?;
        if mode == UpdateMode::BareResume {
            backend.edit_prefs(&MaskedPrefs::want_running(true)).await?;
        } else {
            let opts = mode::start_options(&prefs, args, &host.platform);
            backend.start(&opts).await?;
            if args.force_reauth {
                session.request_login().await?;
            }
        }
        session.wait_running().await
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| UpError::TimedOut(limit))??,
        None => handshake.await?,
    }
    info!("Daemon is up");
    Ok(mode)
}
