//! Daemon preferences and partial updates of them

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Control server used when none is configured
pub const DEFAULT_CONTROL_URL: &str = "https://controlplane.tailscale.com";

const LOGIN_SERVER_URL: &str = "https://login.tailscale.com";

/// Whether `url` is one of the spellings of the default control server
pub fn is_login_server_synonym(url: &str) -> bool {
    url == DEFAULT_CONTROL_URL || url == LOGIN_SERVER_URL
}

#[derive(Error, Debug, PartialEq)]
#[error("invalid netfilter mode {0:?} (one of on, nodivert, off)")]
pub struct NetfilterModeError(pub String);

/// How much of the host firewall the daemon manages (Linux only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetfilterMode {
    /// Manage chains and divert traffic into them
    #[default]
    On,
    /// Manage chains, but leave hooking them up to the admin
    NoDivert,
    Off,
}

impl FromStr for NetfilterMode {
    type Err = NetfilterModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(NetfilterMode::On),
            "nodivert" => Ok(NetfilterMode::NoDivert),
            "off" => Ok(NetfilterMode::Off),
            _ => Err(NetfilterModeError(s.to_string())),
        }
    }
}

impl fmt::Display for NetfilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetfilterMode::On => "on",
            NetfilterMode::NoDivert => "nodivert",
            NetfilterMode::Off => "off",
        })
    }
}

/// Stable identifier of a node in the tailnet
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableNodeId(pub String);

impl fmt::Display for StableNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Login state the daemon keeps between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persist {
    pub login_name: String,
}

/// The complete set of settings the daemon runs with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prefs {
    pub control_url: String,
    /// Accept subnet routes advertised by other nodes
    pub route_all: bool,
    pub allow_single_hosts: bool,
    pub exit_node_id: Option<StableNodeId>,
    pub exit_node_ip: Option<IpAddr>,
    pub exit_node_allow_lan_access: bool,
    /// Accept DNS configuration from the control server
    pub corp_dns: bool,
    pub want_running: bool,
    pub shields_up: bool,
    pub advertise_tags: Vec<String>,
    pub hostname: String,
    pub advertise_routes: Vec<IpNet>,
    pub no_snat: bool,
    pub netfilter_mode: NetfilterMode,
    /// Keep running after the GUI user logs out (Windows)
    pub force_daemon: bool,
    pub operator_user: String,
    pub persist: Option<Persist>,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            control_url: DEFAULT_CONTROL_URL.to_string(),
            route_all: true,
            allow_single_hosts: true,
            exit_node_id: None,
            exit_node_ip: None,
            exit_node_allow_lan_access: false,
            corp_dns: true,
            want_running: false,
            shields_up: false,
            advertise_tags: Vec::new(),
            hostname: String::new(),
            advertise_routes: Vec::new(),
            no_snat: false,
            netfilter_mode: NetfilterMode::On,
            force_daemon: false,
            operator_user: String::new(),
            persist: None,
        }
    }
}

impl Prefs {
    pub fn control_url_or_default(&self) -> &str {
        if self.control_url.is_empty() {
            DEFAULT_CONTROL_URL
        } else {
            &self.control_url
        }
    }

    /// Page where an admin approves new machines
    pub fn admin_page_url(&self) -> String {
        let mut url = self.control_url_or_default();
        if is_login_server_synonym(url) {
            url = LOGIN_SERVER_URL;
        }
        format!("{}/admin/machines", url.trim_end_matches('/'))
    }

    /// Whether the daemon has completed a login before
    pub fn has_logged_in(&self) -> bool {
        self.persist
            .as_ref()
            .is_some_and(|p| !p.login_name.is_empty())
    }
}

/// One user-settable field of [`Prefs`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrefField {
    ControlUrl,
    RouteAll,
    AllowSingleHosts,
    ExitNodeId,
    ExitNodeIp,
    ExitNodeAllowLanAccess,
    CorpDns,
    WantRunning,
    ShieldsUp,
    AdvertiseTags,
    Hostname,
    AdvertiseRoutes,
    NoSnat,
    NetfilterMode,
    ForceDaemon,
    OperatorUser,
}

impl PrefField {
    pub const ALL: [PrefField; 16] = [
        PrefField::ControlUrl,
        PrefField::RouteAll,
        PrefField::AllowSingleHosts,
        PrefField::ExitNodeId,
        PrefField::ExitNodeIp,
        PrefField::ExitNodeAllowLanAccess,
        PrefField::CorpDns,
        PrefField::WantRunning,
        PrefField::ShieldsUp,
        PrefField::AdvertiseTags,
        PrefField::Hostname,
        PrefField::AdvertiseRoutes,
        PrefField::NoSnat,
        PrefField::NetfilterMode,
        PrefField::ForceDaemon,
        PrefField::OperatorUser,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PrefField::ControlUrl => "control_url",
            PrefField::RouteAll => "route_all",
            PrefField::AllowSingleHosts => "allow_single_hosts",
            PrefField::ExitNodeId => "exit_node_id",
            PrefField::ExitNodeIp => "exit_node_ip",
            PrefField::ExitNodeAllowLanAccess => "exit_node_allow_lan_access",
            PrefField::CorpDns => "corp_dns",
            PrefField::WantRunning => "want_running",
            PrefField::ShieldsUp => "shields_up",
            PrefField::AdvertiseTags => "advertise_tags",
            PrefField::Hostname => "hostname",
            PrefField::AdvertiseRoutes => "advertise_routes",
            PrefField::NoSnat => "no_snat",
            PrefField::NetfilterMode => "netfilter_mode",
            PrefField::ForceDaemon => "force_daemon",
            PrefField::OperatorUser => "operator_user",
        }
    }
}

impl fmt::Display for PrefField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A partial preference change: only fields in `set` are applied
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedPrefs {
    pub prefs: Prefs,
    pub set: BTreeSet<PrefField>,
}

impl MaskedPrefs {
    pub fn new(prefs: Prefs) -> Self {
        Self {
            prefs,
            set: BTreeSet::new(),
        }
    }

    /// Update that only flips the want-running switch
    pub fn want_running(want: bool) -> Self {
        let mut mp = Self::new(Prefs {
            want_running: want,
            ..Prefs::default()
        });
        mp.mark(PrefField::WantRunning);
        mp
    }

    pub fn mark(&mut self, field: PrefField) {
        self.set.insert(field);
    }

    pub fn is_set(&self, field: PrefField) -> bool {
        self.set.contains(&field)
    }

    /// Overwrite the marked fields of `target` with the values carried here
    pub fn apply_to(&self, target: &mut Prefs) {
        let p = &self.prefs;
        for field in &self.set {
            match field {
                PrefField::ControlUrl => target.control_url = p.control_url.clone(),
                PrefField::RouteAll => target.route_all = p.route_all,
                PrefField::AllowSingleHosts => target.allow_single_hosts = p.allow_single_hosts,
                PrefField::ExitNodeId => target.exit_node_id = p.exit_node_id.clone(),
                PrefField::ExitNodeIp => target.exit_node_ip = p.exit_node_ip,
                PrefField::ExitNodeAllowLanAccess => {
                    target.exit_node_allow_lan_access = p.exit_node_allow_lan_access
                }
                PrefField::CorpDns => target.corp_dns = p.corp_dns,
                PrefField::WantRunning => target.want_running = p.want_running,
                PrefField::ShieldsUp => target.shields_up = p.shields_up,
                PrefField::AdvertiseTags => target.advertise_tags = p.advertise_tags.clone(),
                PrefField::Hostname => target.hostname = p.hostname.clone(),
                PrefField::AdvertiseRoutes => {
                    target.advertise_routes = p.advertise_routes.clone()
                }
                PrefField::NoSnat => target.no_snat = p.no_snat,
                PrefField::NetfilterMode => target.netfilter_mode = p.netfilter_mode,
                PrefField::ForceDaemon => target.force_daemon = p.force_daemon,
                PrefField::OperatorUser => target.operator_user = p.operator_user.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netfilter_mode_parse() {
        assert_eq!("on".parse::<NetfilterMode>(), Ok(NetfilterMode::On));
        assert_eq!(
            "nodivert".parse::<NetfilterMode>(),
            Ok(NetfilterMode::NoDivert)
        );
        assert_eq!("off".parse::<NetfilterMode>(), Ok(NetfilterMode::Off));
        assert!("sideways".parse::<NetfilterMode>().is_err());
        assert_eq!(NetfilterMode::NoDivert.to_string(), "nodivert");
    }

    #[test]
    fn test_login_server_synonyms() {
        assert!(is_login_server_synonym("https://login.tailscale.com"));
        assert!(is_login_server_synonym("https://controlplane.tailscale.com"));
        assert!(!is_login_server_synonym("https://headscale.example.com"));
    }

    #[test]
    fn test_admin_page_url() {
        let prefs = Prefs::default();
        assert_eq!(
            prefs.admin_page_url(),
            "https://login.tailscale.com/admin/machines"
        );

        let prefs = Prefs {
            control_url: "https://control.example.com/".to_string(),
            ..Prefs::default()
        };
        assert_eq!(
            prefs.admin_page_url(),
            "https://control.example.com/admin/machines"
        );

        let prefs = Prefs {
            control_url: String::new(),
            ..Prefs::default()
        };
        assert!(prefs.admin_page_url().starts_with("https://login.tailscale.com"));
    }

    #[test]
    fn test_has_logged_in() {
        let mut prefs = Prefs::default();
        assert!(!prefs.has_logged_in());

        prefs.persist = Some(Persist::default());
        assert!(!prefs.has_logged_in());

        prefs.persist = Some(Persist {
            login_name: "alice@example.com".to_string(),
        });
        assert!(prefs.has_logged_in());
    }

    #[test]
    fn test_pref_field_names_unique() {
        let names: BTreeSet<&str> = PrefField::ALL.iter().map(|f| f.name()).collect();
        assert_eq!(names.len(), PrefField::ALL.len());
    }

    #[test]
    fn test_masked_apply_only_touches_marked_fields() {
        let mut current = Prefs {
            hostname: "old".to_string(),
            corp_dns: true,
            shields_up: true,
            ..Prefs::default()
        };

        let mut mp = MaskedPrefs::new(Prefs {
            hostname: "new".to_string(),
            corp_dns: false,
            shields_up: false,
            ..Prefs::default()
        });
        mp.mark(PrefField::CorpDns);
        mp.mark(PrefField::Hostname);
        mp.apply_to(&mut current);

        assert_eq!(current.hostname, "new");
        assert!(!current.corp_dns);
        assert!(current.shields_up);
    }

    #[test]
    fn test_masked_want_running() {
        let mp = MaskedPrefs::want_running(true);
        assert!(mp.is_set(PrefField::WantRunning));
        assert_eq!(mp.set.len(), 1);

        let mut prefs = Prefs::default();
        mp.apply_to(&mut prefs);
        assert!(prefs.want_running);
    }

    #[test]
    fn test_prefs_json_defaults() {
        let prefs: Prefs = serde_json::from_str(r#"{"hostname":"box"}"#).unwrap();
        assert_eq!(prefs.hostname, "box");
        assert_eq!(prefs.control_url, DEFAULT_CONTROL_URL);
        assert_eq!(prefs.netfilter_mode, NetfilterMode::On);
    }
}
