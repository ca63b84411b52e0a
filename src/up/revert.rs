//! Guard against silently reverting settings
//!
//! `meshctl up` with flags means "this is the complete set of settings I
//! want". A user who once ran `up --advertise-tags=tag:eng` and later runs
//! `up --hostname=foo` would otherwise lose the tag without noticing. So for
//! every flag that wasn't given, we render the current and the new prefs as
//! the value that flag would need to reproduce them; any difference blocks
//! the run and prints the full command line that keeps everything as is.

use super::flags::{applies_to_platform, pref_flags, FlagSet, FlagValue};
use crate::ipn::prefs::is_login_server_synonym;
use crate::ipn::{Prefs, Status};
use crate::platform::Platform;
use ipnet::IpNet;
use std::collections::BTreeMap;
use thiserror::Error;

const ACCIDENTAL_UP_PREFIX: &str = "Error: changing settings via 'meshctl up' requires mentioning all\n\
    non-default flags. To proceed, either re-run your command with --reset or\n\
    use the command below to explicitly mention the current value of\n\
    all non-default settings:\n\n\
    \tmeshctl up";

/// The run would change settings whose flags weren't mentioned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", corrective_message(.explicit, .missing))]
pub struct AccidentalRevert {
    /// Flags the user gave, as `--name[=value]`
    pub explicit: Vec<String>,
    /// Flags needed to keep the current settings, sorted
    pub missing: Vec<String>,
}

impl AccidentalRevert {
    /// The `meshctl up ...` command that keeps every current setting
    pub fn command_line(&self) -> String {
        let mut cmd = String::from("meshctl up");
        for arg in self.explicit.iter().chain(&self.missing) {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        cmd
    }
}

fn corrective_message(explicit: &[String], missing: &[String]) -> String {
    let mut msg = String::from(ACCIDENTAL_UP_PREFIX);
    for arg in explicit.iter().chain(missing) {
        msg.push(' ');
        msg.push_str(arg);
    }
    msg.push_str("\n\n");
    msg
}

/// What the guard needs to know besides the prefs themselves
pub struct UpCheckEnv<'a> {
    pub platform: &'a Platform,
    /// Used to resolve ID-only exit node selections to an address
    pub status: &'a Status,
}

/// Fail if any flag not in `flags` would change a setting of `cur`
pub fn check_for_accidental_setting_reverts(
    flags: &FlagSet,
    cur: &Prefs,
    new: &Prefs,
    env: &UpCheckEnv,
) -> Result<(), AccidentalRevert> {
    // Nothing to protect before the first login.
    if cur.control_url.is_empty() {
        return Ok(());
    }
    // Bare `up` means "bring it up as configured".
    if flags.is_empty() || flags.is_set("reset") {
        return Ok(());
    }

    let flags_cur = prefs_to_flags(env, cur);
    let flags_new = prefs_to_flags(env, new);

    let mut missing = Vec::new();
    for (name, val_cur) in &flags_cur {
        if flags.is_set(name) {
            continue;
        }
        let val_new = flags_new.get(name).cloned().flatten();
        if *val_cur == val_new {
            continue;
        }
        let Some(val_cur) = val_cur else { continue };
        if *name == "login-server" {
            if let (FlagValue::Str(a), Some(FlagValue::Str(b))) = (val_cur, &val_new) {
                if is_login_server_synonym(a) && is_login_server_synonym(b) {
                    continue;
                }
            }
        }
        missing.push(fmt_flag_value_arg(name, val_cur));
    }
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();

    let explicit = flags
        .iter()
        .map(|(name, value)| match value {
            FlagValue::Bool(true) => format!("--{}", name),
            FlagValue::Bool(false) => format!("--{}=false", name),
            FlagValue::Str(_) => fmt_flag_value_arg(name, value),
        })
        .collect();

    Err(AccidentalRevert { explicit, missing })
}

/// The flag values that would reproduce `prefs`. Flags that don't exist on
/// the platform map to `None`.
pub fn prefs_to_flags(env: &UpCheckEnv, prefs: &Prefs) -> BTreeMap<&'static str, Option<FlagValue>> {
    let mut ret = BTreeMap::new();
    for name in pref_flags() {
        let value: FlagValue = match name {
            "login-server" => prefs.control_url.clone().into(),
            "accept-routes" => prefs.route_all.into(),
            "host-routes" => prefs.allow_single_hosts.into(),
            "accept-dns" => prefs.corp_dns.into(),
            "shields-up" => prefs.shields_up.into(),
            "exit-node" => env
                .status
                .resolve_exit_node(prefs)
                .map(|ip| ip.to_string())
                .unwrap_or_default()
                .into(),
            "exit-node-allow-lan-access" => prefs.exit_node_allow_lan_access.into(),
            "advertise-tags" => prefs.advertise_tags.join(",").into(),
            "hostname" => prefs.hostname.clone().into(),
            "operator" => prefs.operator_user.clone().into(),
            "advertise-routes" => without_exit_node_routes(&prefs.advertise_routes)
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(",")
                .into(),
            "advertise-exit-node" => has_exit_node_routes(&prefs.advertise_routes).into(),
            "snat-subnet-routes" => (!prefs.no_snat).into(),
            "netfilter-mode" => prefs.netfilter_mode.to_string().into(),
            "unattended" => prefs.force_daemon.into(),
            other => panic!("unhandled flag {:?}", other),
        };
        ret.insert(name, applies_to_platform(name, env.platform).then_some(value));
    }
    ret
}

/// Render `--name=value` so it can be pasted into a shell
pub fn fmt_flag_value_arg(name: &str, value: &FlagValue) -> String {
    match value {
        FlagValue::Bool(true) => format!("--{}", name),
        FlagValue::Str(s) if s.is_empty() => format!("--{}=", name),
        _ => format!("--{}={}", name, shell_quote(&value.to_string())),
    }
}

const SPECIAL_CHARS: &str = "\\'\"`${[|&;<>()*?!";

/// Quote a word for a POSIX shell: backslash-escape metacharacters, or
/// single-quote the whole word if it contains whitespace.
fn shell_quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    if word.chars().any(char::is_whitespace) {
        return format!("'{}'", word.replace('\'', "'\\''"));
    }
    let mut out = String::with_capacity(word.len());
    for (i, c) in word.chars().enumerate() {
        if SPECIAL_CHARS.contains(c) || (i == 0 && c == '~') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Whether both the IPv4 and IPv6 default routes are advertised
pub fn has_exit_node_routes(routes: &[IpNet]) -> bool {
    let v4 = routes
        .iter()
        .any(|r| r.prefix_len() == 0 && matches!(r, IpNet::V4(_)));
    let v6 = routes
        .iter()
        .any(|r| r.prefix_len() == 0 && matches!(r, IpNet::V6(_)));
    v4 && v6
}

/// `routes` minus the default routes, if both of them are present
pub fn without_exit_node_routes(routes: &[IpNet]) -> Vec<IpNet> {
    if !has_exit_node_routes(routes) {
        return routes.to_vec();
    }
    routes
        .iter()
        .filter(|r| r.prefix_len() > 0)
        .copied()
        .collect()
}
