//! Choosing how to hand the new prefs to the daemon

use super::flags::{prefs_of_flag, FlagSet, UpArgs};
use super::UpError;
use crate::ipn::prefs::is_login_server_synonym;
use crate::ipn::{BackendState, MaskedPrefs, PrefField, Prefs, StartOptions, GLOBAL_DAEMON_STATE_KEY};
use crate::platform::Platform;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Already running: patch only what the flags mention
    WarmEdit,
    /// Bare `up` after a previous login: just set want-running
    BareResume,
    /// Hand the daemon the complete prefs and wait for it to come up
    FullStart,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMode::WarmEdit => write!(f, "warm edit"),
            UpdateMode::BareResume => write!(f, "bare resume"),
            UpdateMode::FullStart => write!(f, "full start"),
        }
    }
}

/// Whether going from `cur` to `new` points the node at another control
/// server. Spellings of the default server are interchangeable.
pub fn control_url_changed(cur: &Prefs, new: &Prefs) -> bool {
    if cur.control_url == new.control_url {
        return false;
    }
    !(is_login_server_synonym(&cur.control_url) && is_login_server_synonym(&new.control_url))
}

pub fn select_update_mode(
    state: BackendState,
    args: &UpArgs,
    flags: &FlagSet,
    cur: &Prefs,
    new: &Prefs,
) -> Result<UpdateMode, UpError> {
    let url_changed = control_url_changed(cur, new);
    let running = state == BackendState::Running;
    if url_changed && running && !args.force_reauth {
        return Err(UpError::LoginServerChangeNeedsReauth);
    }

    if running && !args.force_reauth && !args.reset && args.auth_key.is_empty() && !url_changed {
        return Ok(UpdateMode::WarmEdit);
    }

    if flags.is_empty() && cur.has_logged_in() && state != BackendState::NeedsLogin {
        return Ok(UpdateMode::BareResume);
    }

    Ok(UpdateMode::FullStart)
}

/// Masked update carrying `new` for every field an explicit flag governs,
/// plus want-running.
pub fn warm_edit_prefs(new: &Prefs, flags: &FlagSet) -> MaskedPrefs {
    let mut mp = MaskedPrefs::new(new.clone());
    mp.mark(PrefField::WantRunning);
    for (name, _) in flags.iter() {
        for field in prefs_of_flag(name).unwrap_or_default() {
            mp.mark(*field);
        }
    }
    mp
}

pub fn start_options(new: &Prefs, args: &UpArgs, platform: &Platform) -> StartOptions {
    let auth_key = (!args.auth_key.is_empty()).then(|| args.auth_key.clone());
    match platform {
        // The Windows service derives the state key from the connection's
        // identity and still reads prefs from the legacy slot.
        Platform::Windows => StartOptions {
            state_key: None,
            auth_key,
            update_prefs: new.clone(),
            legacy_prefs: Some(new.clone()),
        },
        _ => StartOptions {
            state_key: Some(GLOBAL_DAEMON_STATE_KEY.to_string()),
            auth_key,
            update_prefs: new.clone(),
            legacy_prefs: None,
        },
    }
}
