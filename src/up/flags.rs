//! The `up` flag set and the flag → preference mapping
//!
//! Which flags exist depends on the host: `--netfilter-mode` and
//! `--snat-subnet-routes` are Linux-only, `--unattended` is Windows-only, and
//! `--operator` only makes sense where the daemon authenticates local users
//! by socket peer credentials.
//!
//! Every flag that carries configuration maps to one or more [`PrefField`]s.
//! The table is checked once at startup; a flag without a mapping (or a
//! preference no flag can set) is a programming error and panics.

use crate::ipn::PrefField;
use crate::ipn::prefs::DEFAULT_CONTROL_URL;
use crate::platform::{Host, Platform};
use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command, FromArgMatches};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Once;

/// Id of the positional catch-all; `up` takes no positional arguments
pub const EXTRA_ARGS: &str = "args";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Str,
}

struct FlagSpec {
    name: &'static str,
    kind: Kind,
    help: &'static str,
}

const UP_FLAGS: &[FlagSpec] = &[
    FlagSpec {
        name: "force-reauth",
        kind: Kind::Bool,
        help: "force reauthentication",
    },
    FlagSpec {
        name: "reset",
        kind: Kind::Bool,
        help: "reset unspecified settings to their default values",
    },
    FlagSpec {
        name: "login-server",
        kind: Kind::Str,
        help: "base URL of control server",
    },
    FlagSpec {
        name: "accept-routes",
        kind: Kind::Bool,
        help: "accept routes advertised by other nodes",
    },
    FlagSpec {
        name: "accept-dns",
        kind: Kind::Bool,
        help: "accept DNS configuration from the admin panel",
    },
    FlagSpec {
        name: "host-routes",
        kind: Kind::Bool,
        help: "install host routes to other nodes",
    },
    FlagSpec {
        name: "exit-node",
        kind: Kind::Str,
        help: "IP of the exit node for internet traffic",
    },
    FlagSpec {
        name: "exit-node-allow-lan-access",
        kind: Kind::Bool,
        help: "allow direct access to the local network when routing traffic via an exit node",
    },
    FlagSpec {
        name: "shields-up",
        kind: Kind::Bool,
        help: "don't allow incoming connections",
    },
    FlagSpec {
        name: "advertise-tags",
        kind: Kind::Str,
        help: "comma-separated ACL tags to request; each must start with \"tag:\" (e.g. \"tag:eng,tag:montreal,tag:ssh\")",
    },
    FlagSpec {
        name: "authkey",
        kind: Kind::Str,
        help: "node authorization key",
    },
    FlagSpec {
        name: "hostname",
        kind: Kind::Str,
        help: "hostname to use instead of the one provided by the OS",
    },
    FlagSpec {
        name: "advertise-routes",
        kind: Kind::Str,
        help: "routes to advertise to other nodes (comma-separated, e.g. \"10.0.0.0/8,192.168.0.0/24\")",
    },
    FlagSpec {
        name: "advertise-exit-node",
        kind: Kind::Bool,
        help: "offer to be an exit node for internet traffic for the tailnet",
    },
    FlagSpec {
        name: "operator",
        kind: Kind::Str,
        help: "Unix username to allow to operate on meshd without sudo",
    },
    FlagSpec {
        name: "snat-subnet-routes",
        kind: Kind::Bool,
        help: "source NAT traffic to local routes advertised with --advertise-routes",
    },
    FlagSpec {
        name: "netfilter-mode",
        kind: Kind::Str,
        help: "netfilter mode (one of on, nodivert, off)",
    },
    FlagSpec {
        name: "unattended",
        kind: Kind::Bool,
        help: "run in \"Unattended Mode\" where meshd keeps running even after the current GUI user logs out (Windows-only)",
    },
];

const FLAG_PREFS: &[(&str, &[PrefField])] = &[
    // Both of these set the same preference:
    ("advertise-exit-node", &[PrefField::AdvertiseRoutes]),
    ("advertise-routes", &[PrefField::AdvertiseRoutes]),
    // and this one sets two:
    ("exit-node", &[PrefField::ExitNodeIp, PrefField::ExitNodeId]),
    ("accept-dns", &[PrefField::CorpDns]),
    ("accept-routes", &[PrefField::RouteAll]),
    ("advertise-tags", &[PrefField::AdvertiseTags]),
    ("host-routes", &[PrefField::AllowSingleHosts]),
    ("hostname", &[PrefField::Hostname]),
    ("login-server", &[PrefField::ControlUrl]),
    ("netfilter-mode", &[PrefField::NetfilterMode]),
    ("shields-up", &[PrefField::ShieldsUp]),
    ("snat-subnet-routes", &[PrefField::NoSnat]),
    ("exit-node-allow-lan-access", &[PrefField::ExitNodeAllowLanAccess]),
    ("unattended", &[PrefField::ForceDaemon]),
    ("operator", &[PrefField::OperatorUser]),
];

/// Preferences governed by `flag`, in registration order
pub fn prefs_of_flag(flag: &str) -> Option<&'static [PrefField]> {
    FLAG_PREFS
        .iter()
        .find(|(name, _)| *name == flag)
        .map(|(_, fields)| *fields)
}

/// Flags that steer the command rather than set a preference
pub fn is_prefless(flag: &str) -> bool {
    matches!(flag, "authkey" | "force-reauth" | "reset")
}

pub fn applies_to_platform(flag: &str, platform: &Platform) -> bool {
    match flag {
        "netfilter-mode" | "snat-subnet-routes" => *platform == Platform::Linux,
        "unattended" => *platform == Platform::Windows,
        "operator" => platform.uses_peer_creds(),
        _ => true,
    }
}

/// Names of every `up` flag on any platform
pub fn all_flags() -> impl Iterator<Item = &'static str> {
    UP_FLAGS.iter().map(|spec| spec.name)
}

/// Names of the preference-bearing flags on any platform
pub fn pref_flags() -> impl Iterator<Item = &'static str> {
    all_flags().filter(|name| !is_prefless(name))
}

pub fn is_bool_flag(flag: &str) -> bool {
    UP_FLAGS
        .iter()
        .any(|spec| spec.name == flag && spec.kind == Kind::Bool)
}

/// Verify that flags and preferences are fully cross-referenced
///
/// # Panics
/// If a preference-bearing flag has no mapping, a mapping names an unknown
/// flag, or a user-settable preference can't be reached from any flag.
pub fn check_flag_table() {
    let flags: BTreeSet<&str> = all_flags().collect();
    for (flag, fields) in FLAG_PREFS {
        if !flags.contains(flag) {
            panic!("flag table maps unknown flag {:?}", flag);
        }
        if is_prefless(flag) {
            panic!("flag table maps prefless flag {:?}", flag);
        }
        if fields.is_empty() {
            panic!("flag {:?} maps to no preferences", flag);
        }
    }
    for flag in pref_flags() {
        if prefs_of_flag(flag).is_none() {
            panic!("flag {:?} has no preference mapping", flag);
        }
    }
    let covered: BTreeSet<PrefField> = FLAG_PREFS
        .iter()
        .flat_map(|(_, fields)| fields.iter().copied())
        .collect();
    for field in PrefField::ALL {
        // Implied by every `up`; no flag for it.
        if field == PrefField::WantRunning {
            continue;
        }
        if !covered.contains(&field) {
            panic!("preference {} is not settable by any flag", field);
        }
    }
}

static FLAG_TABLE_CHECK: Once = Once::new();

fn default_value(flag: &str, host: &Host) -> &'static str {
    match flag {
        "login-server" => DEFAULT_CONTROL_URL,
        "accept-dns" | "host-routes" | "snat-subnet-routes" => "true",
        "netfilter-mode" => host.distro.default_netfilter_mode(),
        _ => match is_bool_flag(flag) {
            true => "false",
            false => "",
        },
    }
}

/// Add the platform's `up` flags to `cmd`
pub fn add_up_flags(mut cmd: Command, host: &Host) -> Command {
    FLAG_TABLE_CHECK.call_once(check_flag_table);

    for spec in UP_FLAGS {
        if !applies_to_platform(spec.name, &host.platform) {
            continue;
        }
        let arg = Arg::new(spec.name)
            .long(spec.name)
            .help(spec.help)
            .default_value(default_value(spec.name, host))
            .action(ArgAction::Set);
        let arg = match spec.kind {
            Kind::Bool => arg
                .value_parser(clap::value_parser!(bool))
                .num_args(0..=1)
                .require_equals(true)
                .default_missing_value("true"),
            Kind::Str => arg.num_args(1).value_name("VALUE"),
        };
        cmd = cmd.arg(arg);
    }
    cmd.arg(
        Arg::new(EXTRA_ARGS)
            .num_args(0..)
            .action(ArgAction::Append)
            .hide(true),
    )
}

/// Standalone `up` command for `host`
pub fn up_command(host: &Host) -> Command {
    add_up_flags(Command::new("up"), host)
}

/// Value a flag was given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    Bool(bool),
    Str(String),
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(b) => write!(f, "{}", b),
            FlagValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> Self {
        FlagValue::Bool(b)
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> Self {
        FlagValue::Str(s.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(s: String) -> Self {
        FlagValue::Str(s)
    }
}

/// Flags explicitly given on this invocation, sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSet {
    explicit: BTreeMap<String, FlagValue>,
}

impl FlagSet {
    pub fn from_matches(m: &ArgMatches) -> Self {
        let mut explicit = BTreeMap::new();
        for id in m.ids() {
            let name = id.as_str();
            if name == EXTRA_ARGS || m.value_source(name) != Some(ValueSource::CommandLine) {
                continue;
            }
            let value = if is_bool_flag(name) {
                match m.try_get_one::<bool>(name) {
                    Ok(Some(b)) => FlagValue::Bool(*b),
                    _ => continue,
                }
            } else {
                match m.try_get_one::<String>(name) {
                    Ok(Some(s)) => FlagValue::Str(s.clone()),
                    _ => continue,
                }
            };
            explicit.insert(name.to_string(), value);
        }
        Self { explicit }
    }

    pub fn insert(&mut self, name: &str, value: impl Into<FlagValue>) {
        self.explicit.insert(name.to_string(), value.into());
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.explicit.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty()
    }

    pub fn len(&self) -> usize {
        self.explicit.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FlagValue)> {
        self.explicit.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Parsed `up` flag values, explicit or defaulted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpArgs {
    pub reset: bool,
    pub server: String,
    pub accept_routes: bool,
    pub accept_dns: bool,
    pub single_routes: bool,
    pub exit_node_ip: String,
    pub exit_node_allow_lan_access: bool,
    pub shields_up: bool,
    pub force_reauth: bool,
    pub force_daemon: bool,
    pub advertise_routes: String,
    pub advertise_default_route: bool,
    pub advertise_tags: String,
    pub snat: bool,
    pub netfilter_mode: String,
    pub auth_key: String,
    pub hostname: String,
    pub op_user: String,
}

impl Default for UpArgs {
    fn default() -> Self {
        Self {
            reset: false,
            server: DEFAULT_CONTROL_URL.to_string(),
            accept_routes: false,
            accept_dns: true,
            single_routes: true,
            exit_node_ip: String::new(),
            exit_node_allow_lan_access: false,
            shields_up: false,
            force_reauth: false,
            force_daemon: false,
            advertise_routes: String::new(),
            advertise_default_route: false,
            advertise_tags: String::new(),
            snat: true,
            netfilter_mode: "on".to_string(),
            auth_key: String::new(),
            hostname: String::new(),
            op_user: String::new(),
        }
    }
}

impl UpArgs {
    /// Read values out of matches; flags the platform doesn't offer keep
    /// their defaults.
    pub fn from_matches(m: &ArgMatches) -> Self {
        let mut args = Self::default();
        let flag = |name: &str, into: &mut bool| {
            if let Ok(Some(b)) = m.try_get_one::<bool>(name) {
                *into = *b;
            }
        };
        let text = |name: &str, into: &mut String| {
            if let Ok(Some(s)) = m.try_get_one::<String>(name) {
                *into = s.clone();
            }
        };

        flag("reset", &mut args.reset);
        text("login-server", &mut args.server);
        flag("accept-routes", &mut args.accept_routes);
        flag("accept-dns", &mut args.accept_dns);
        flag("host-routes", &mut args.single_routes);
        text("exit-node", &mut args.exit_node_ip);
        flag(
            "exit-node-allow-lan-access",
            &mut args.exit_node_allow_lan_access,
        );
        flag("shields-up", &mut args.shields_up);
        flag("force-reauth", &mut args.force_reauth);
        flag("unattended", &mut args.force_daemon);
        text("advertise-routes", &mut args.advertise_routes);
        flag("advertise-exit-node", &mut args.advertise_default_route);
        text("advertise-tags", &mut args.advertise_tags);
        flag("snat-subnet-routes", &mut args.snat);
        text("netfilter-mode", &mut args.netfilter_mode);
        text("authkey", &mut args.auth_key);
        text("hostname", &mut args.hostname);
        text("operator", &mut args.op_user);
        args
    }
}

/// One parsed `up` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpInvocation {
    pub args: UpArgs,
    pub flags: FlagSet,
    /// Stray positional arguments, rejected by `run_up`
    pub extra: Vec<String>,
}

impl UpInvocation {
    pub fn from_matches(m: &ArgMatches) -> Self {
        let extra = m
            .try_get_many::<String>(EXTRA_ARGS)
            .ok()
            .flatten()
            .map(|vals| vals.cloned().collect())
            .unwrap_or_default();
        Self {
            args: UpArgs::from_matches(m),
            flags: FlagSet::from_matches(m),
            extra,
        }
    }

    /// Parse `argv` (without the command name) against `host`'s flag set
    pub fn parse<I, T>(host: &Host, argv: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let argv = std::iter::once("up".to_string()).chain(argv.into_iter().map(Into::into));
        let m = up_command(host).try_get_matches_from(argv)?;
        Ok(Self::from_matches(&m))
    }
}

impl FromArgMatches for UpInvocation {
    fn from_arg_matches(m: &ArgMatches) -> Result<Self, clap::Error> {
        Ok(Self::from_matches(m))
    }

    fn update_from_arg_matches(&mut self, m: &ArgMatches) -> Result<(), clap::Error> {
        *self = Self::from_matches(m);
        Ok(())
    }
}

impl clap::Args for UpInvocation {
    fn augment_args(cmd: Command) -> Command {
        add_up_flags(cmd, &Host::detect())
    }

    fn augment_args_for_update(cmd: Command) -> Command {
        Self::augment_args(cmd)
    }
}
