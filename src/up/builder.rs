//! Turning `up` flags into the preferences to run with
//!
//! [`prefs_from_up_args`] is a pure function of the flags, the daemon status
//! snapshot and the host. It talks to nothing; the only thing it can do
//! besides return is report advisory warnings through `warnf`.

use super::flags::UpArgs;
use crate::ipn::tags::{check_tag, TagError};
use crate::ipn::{NetfilterMode, Prefs, Status};
use crate::platform::{Distro, Host};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::BTreeSet;
use std::net::IpAddr;
use thiserror::Error;

pub const MAX_HOSTNAME_LEN: usize = 256;

#[derive(Error, Debug, PartialEq)]
pub enum BuildError {
    #[error("{0:?} is not a valid IP address or CIDR prefix")]
    InvalidRoute(String),
    #[error("{route} has non-address bits set; expected {expected}")]
    NonCanonicalRoute { route: IpNet, expected: IpNet },
    #[error("{present} advertised without its {family} counterpart, please also advertise {missing}")]
    UnpairedDefaultRoute {
        present: IpNet,
        missing: IpNet,
        family: &'static str,
    },
    #[error("invalid IP address {value:?} for --exit-node: {reason}")]
    InvalidExitNode { value: String, reason: String },
    #[error("--exit-node-allow-lan-access can only be used with --exit-node")]
    LanAccessWithoutExitNode,
    #[error(
        "cannot use {0} as the exit node as it is a local IP address to this machine, did you mean --advertise-exit-node?"
    )]
    ExitNodeIsSelf(IpAddr),
    #[error("tag: {tag:?}: {source}")]
    InvalidTag { tag: String, source: TagError },
    #[error("hostname too long: {0} bytes (max 256)")]
    HostnameTooLong(usize),
    #[error("invalid value --netfilter-mode={0:?}")]
    InvalidNetfilterMode(String),
    #[error("{0} not supported on Synology")]
    UnsupportedOnSynology(&'static str),
}

pub fn ipv4_default_route() -> IpNet {
    IpNet::V4(Ipv4Net::default())
}

pub fn ipv6_default_route() -> IpNet {
    IpNet::V6(Ipv6Net::default())
}

/// Build the preferences requested by `args`
pub fn prefs_from_up_args(
    args: &UpArgs,
    host: &Host,
    status: &Status,
    mut warnf: impl FnMut(&str),
) -> Result<Prefs, BuildError> {
    if host.distro == Distro::Synology {
        check_synology(args)?;
    }

    let advertise_routes = parse_routes(args)?;
    let exit_node_ip = parse_exit_node(args, status)?;

    let mut tags = Vec::new();
    if !args.advertise_tags.is_empty() {
        for tag in args.advertise_tags.split(',') {
            check_tag(tag).map_err(|source| BuildError::InvalidTag {
                tag: tag.to_string(),
                source,
            })?;
            tags.push(tag.to_string());
        }
    }

    if args.hostname.len() > MAX_HOSTNAME_LEN {
        return Err(BuildError::HostnameTooLong(args.hostname.len()));
    }

    let mut prefs = Prefs {
        control_url: args.server.clone(),
        want_running: true,
        route_all: args.accept_routes,
        exit_node_ip,
        exit_node_allow_lan_access: args.exit_node_allow_lan_access,
        corp_dns: args.accept_dns,
        allow_single_hosts: args.single_routes,
        shields_up: args.shields_up,
        advertise_routes,
        advertise_tags: tags,
        hostname: args.hostname.clone(),
        force_daemon: args.force_daemon,
        operator_user: args.op_user.clone(),
        ..Prefs::default()
    };

    if host.is_linux() {
        prefs.no_snat = !args.snat;
        prefs.netfilter_mode = args
            .netfilter_mode
            .parse()
            .map_err(|_| BuildError::InvalidNetfilterMode(args.netfilter_mode.clone()))?;
        match prefs.netfilter_mode {
            NetfilterMode::NoDivert => {
                warnf("netfilter=nodivert; add iptables calls to ts-* chains manually.")
            }
            NetfilterMode::Off if host.distro.default_netfilter_mode() != "off" => {
                warnf("netfilter=off; configure iptables yourself.")
            }
            _ => {}
        }
    }

    Ok(prefs)
}

fn check_synology(args: &UpArgs) -> Result<(), BuildError> {
    if args.accept_routes {
        return Err(BuildError::UnsupportedOnSynology("--accept-routes is"));
    }
    if !args.exit_node_ip.is_empty() {
        return Err(BuildError::UnsupportedOnSynology("--exit-node is"));
    }
    if args.netfilter_mode != "off" {
        return Err(BuildError::UnsupportedOnSynology(
            "--netfilter-mode values besides \"off\" are",
        ));
    }
    Ok(())
}

/// Advertised routes, deduplicated and sorted by (prefix length, address)
fn parse_routes(args: &UpArgs) -> Result<Vec<IpNet>, BuildError> {
    let v4_default = ipv4_default_route();
    let v6_default = ipv6_default_route();
    let mut routes = BTreeSet::new();

    if !args.advertise_routes.is_empty() {
        let (mut default4, mut default6) = (false, false);
        for token in args.advertise_routes.split(',') {
            let route: IpNet = token
                .parse()
                .map_err(|_| BuildError::InvalidRoute(token.to_string()))?;
            if route != route.trunc() {
                return Err(BuildError::NonCanonicalRoute {
                    route,
                    expected: route.trunc(),
                });
            }
            if route == v4_default {
                default4 = true;
            } else if route == v6_default {
                default6 = true;
            }
            routes.insert(route);
        }
        if default4 && !default6 {
            return Err(BuildError::UnpairedDefaultRoute {
                present: v4_default,
                missing: v6_default,
                family: "IPv6",
            });
        }
        if default6 && !default4 {
            return Err(BuildError::UnpairedDefaultRoute {
                present: v6_default,
                missing: v4_default,
                family: "IPv4",
            });
        }
    }
    if args.advertise_default_route {
        routes.insert(v4_default);
        routes.insert(v6_default);
    }

    let mut routes: Vec<IpNet> = routes.into_iter().collect();
    routes.sort_by(|a, b| {
        a.prefix_len()
            .cmp(&b.prefix_len())
            .then_with(|| a.addr().cmp(&b.addr()))
    });
    Ok(routes)
}

fn parse_exit_node(args: &UpArgs, status: &Status) -> Result<Option<IpAddr>, BuildError> {
    if args.exit_node_ip.is_empty() {
        if args.exit_node_allow_lan_access {
            return Err(BuildError::LanAccessWithoutExitNode);
        }
        return Ok(None);
    }

    let ip: IpAddr = args
        .exit_node_ip
        .parse()
        .map_err(|e: std::net::AddrParseError| BuildError::InvalidExitNode {
            value: args.exit_node_ip.clone(),
            reason: e.to_string(),
        })?;
    if status.tailscale_ips.contains(&ip) {
        return Err(BuildError::ExitNodeIsSelf(ip));
    }
    Ok(Some(ip))
}

/// Carry the operator over from `old` when the invoking user is that
/// operator and didn't say otherwise, so a plain re-run keeps their access.
pub fn apply_implicit_prefs(prefs: &mut Prefs, old: &Prefs, cur_user: &str) {
    if prefs.operator_user.is_empty() && old.operator_user == cur_user {
        prefs.operator_user = old.operator_user.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipn::BackendState;
    use crate::platform::Platform;
    use crate::up::flags::UpInvocation;

    fn linux() -> Host {
        Host::new(Platform::Linux, Distro::Generic, "alice")
    }

    fn build_on(host: &Host, argv: &[&str]) -> Result<Prefs, BuildError> {
        let inv = UpInvocation::parse(host, argv.iter().copied()).unwrap();
        prefs_from_up_args(&inv.args, host, &Status::new(BackendState::Running), |_| {})
    }

    fn build(argv: &[&str]) -> Result<Prefs, BuildError> {
        build_on(&linux(), argv)
    }

    fn nets(list: &[&str]) -> Vec<IpNet> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_defaults() {
        let prefs = build(&[]).unwrap();
        assert!(prefs.want_running);
        assert!(prefs.corp_dns);
        assert!(prefs.allow_single_hosts);
        assert!(!prefs.route_all);
        assert!(!prefs.no_snat);
        assert_eq!(prefs.netfilter_mode, NetfilterMode::On);
        assert!(prefs.advertise_routes.is_empty());
        assert_eq!(prefs.exit_node_ip, None);
    }

    #[test]
    fn test_routes_sorted_and_deduplicated() {
        let prefs = build(&[
            "--advertise-routes=10.0.0.0/8,192.168.1.0/24,10.0.0.0/8,fd7a::/48,1.2.3.4/32,172.16.0.0/12,9.0.0.0/8",
        ])
        .unwrap();
        assert_eq!(
            prefs.advertise_routes,
            nets(&[
                "9.0.0.0/8",
                "10.0.0.0/8",
                "172.16.0.0/12",
                "192.168.1.0/24",
                "1.2.3.4/32",
                "fd7a::/48",
            ])
        );
    }

    #[test]
    fn test_route_lists_always_sorted_without_duplicates() {
        let inputs = [
            "10.0.0.0/8",
            "192.168.0.0/16,10.0.0.0/8,10.0.0.0/8",
            "::/0,0.0.0.0/0,10.1.0.0/16",
            "2001:db8::/32,10.0.0.0/8,2001:db8::/32,100.64.0.0/10",
        ];
        for input in inputs {
            let arg = format!("--advertise-routes={}", input);
            let routes = build(&[arg.as_str()]).unwrap().advertise_routes;
            for pair in routes.windows(2) {
                let key = |r: &IpNet| (r.prefix_len(), r.addr());
                assert!(key(&pair[0]) < key(&pair[1]), "{} not sorted", input);
            }
        }
    }

    #[test]
    fn test_invalid_route() {
        let err = build(&["--advertise-routes=10.0.0.0/8,bogus"]).unwrap_err();
        assert_eq!(err, BuildError::InvalidRoute("bogus".to_string()));
        assert_eq!(
            err.to_string(),
            "\"bogus\" is not a valid IP address or CIDR prefix"
        );

        let err = build(&["--advertise-routes=10.0.0.1"]).unwrap_err();
        assert!(matches!(err, BuildError::InvalidRoute(_)));
    }

    #[test]
    fn test_non_canonical_route() {
        let err = build(&["--advertise-routes=10.0.0.1/8"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "10.0.0.1/8 has non-address bits set; expected 10.0.0.0/8"
        );
    }

    #[test]
    fn test_unpaired_default_routes() {
        let err = build(&["--advertise-routes=0.0.0.0/0"]).unwrap_err();
        assert!(matches!(err, BuildError::UnpairedDefaultRoute { .. }));
        assert!(err.to_string().contains("please also advertise ::/0"));

        let err = build(&["--advertise-routes=::/0,10.0.0.0/8"]).unwrap_err();
        assert!(err.to_string().contains("IPv4 counterpart"));
        assert!(err.to_string().contains("please also advertise 0.0.0.0/0"));
    }

    #[test]
    fn test_default_routes_pair_equals_advertise_exit_node() {
        let explicit = build(&["--advertise-routes=0.0.0.0/0,::/0"]).unwrap();
        let convenience = build(&["--advertise-exit-node"]).unwrap();
        assert_eq!(explicit.advertise_routes, convenience.advertise_routes);
        assert_eq!(
            explicit.advertise_routes,
            vec![ipv4_default_route(), ipv6_default_route()]
        );
    }

    #[test]
    fn test_advertise_exit_node_merges_with_routes() {
        let prefs = build(&["--advertise-exit-node", "--advertise-routes=10.0.0.0/8"]).unwrap();
        assert_eq!(
            prefs.advertise_routes,
            nets(&["0.0.0.0/0", "::/0", "10.0.0.0/8"])
        );
    }

    #[test]
    fn test_exit_node() {
        let prefs = build(&["--exit-node=100.64.0.7", "--exit-node-allow-lan-access"]).unwrap();
        assert_eq!(prefs.exit_node_ip, Some("100.64.0.7".parse().unwrap()));
        assert!(prefs.exit_node_allow_lan_access);

        let err = build(&["--exit-node=not-an-ip"]).unwrap_err();
        assert!(matches!(err, BuildError::InvalidExitNode { .. }));
        assert!(err.to_string().contains("\"not-an-ip\""));
    }

    #[test]
    fn test_lan_access_requires_exit_node() {
        let err = build(&["--exit-node-allow-lan-access"]).unwrap_err();
        assert_eq!(err, BuildError::LanAccessWithoutExitNode);
    }

    #[test]
    fn test_exit_node_cannot_be_self() {
        let host = linux();
        let inv = UpInvocation::parse(&host, ["--exit-node=100.64.0.5"]).unwrap();
        let mut status = Status::new(BackendState::Running);
        status.tailscale_ips = vec!["100.64.0.5".parse().unwrap(), "fd7a::5".parse().unwrap()];

        let err = prefs_from_up_args(&inv.args, &host, &status, |_| {}).unwrap_err();
        assert_eq!(err, BuildError::ExitNodeIsSelf("100.64.0.5".parse().unwrap()));
        assert!(err.to_string().contains("did you mean --advertise-exit-node?"));
    }

    #[test]
    fn test_tags() {
        let prefs = build(&["--advertise-tags=tag:eng,tag:ssh"]).unwrap();
        assert_eq!(prefs.advertise_tags, vec!["tag:eng", "tag:ssh"]);

        let err = build(&["--advertise-tags=tag:eng,eng,tag:"]).unwrap_err();
        assert_eq!(
            err,
            BuildError::InvalidTag {
                tag: "eng".to_string(),
                source: TagError::MissingPrefix,
            }
        );
        assert_eq!(err.to_string(), "tag: \"eng\": tags must start with 'tag:'");
    }

    #[test]
    fn test_hostname_length_limit() {
        let ok = format!("--hostname={}", "a".repeat(256));
        assert_eq!(build(&[ok.as_str()]).unwrap().hostname.len(), 256);

        let too_long = format!("--hostname={}", "a".repeat(257));
        let err = build(&[too_long.as_str()]).unwrap_err();
        assert_eq!(err, BuildError::HostnameTooLong(257));
        assert!(err.to_string().contains("257"));
    }

    #[test]
    fn test_netfilter_modes_and_warnings() {
        let host = linux();
        let mut warnings = Vec::new();
        let inv = UpInvocation::parse(&host, ["--netfilter-mode=nodivert"]).unwrap();
        let prefs = prefs_from_up_args(
            &inv.args,
            &host,
            &Status::new(BackendState::Stopped),
            |w| warnings.push(w.to_string()),
        )
        .unwrap();
        assert_eq!(prefs.netfilter_mode, NetfilterMode::NoDivert);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("nodivert"));

        let mut warnings = Vec::new();
        let inv = UpInvocation::parse(&host, ["--netfilter-mode=off"]).unwrap();
        prefs_from_up_args(&inv.args, &host, &Status::new(BackendState::Stopped), |w| {
            warnings.push(w.to_string())
        })
        .unwrap();
        assert_eq!(warnings, vec!["netfilter=off; configure iptables yourself."]);

        let err = build(&["--netfilter-mode=sideways"]).unwrap_err();
        assert_eq!(err.to_string(), "invalid value --netfilter-mode=\"sideways\"");
    }

    #[test]
    fn test_snat_linux_only() {
        let prefs = build(&["--snat-subnet-routes=false"]).unwrap();
        assert!(prefs.no_snat);

        let mac = Host::new(Platform::MacOs, Distro::Generic, "alice");
        let prefs = build_on(&mac, &[]).unwrap();
        assert!(!prefs.no_snat);
        assert_eq!(prefs.netfilter_mode, NetfilterMode::On);
    }

    #[test]
    fn test_windows_unattended() {
        let windows = Host::new(Platform::Windows, Distro::Generic, "alice");
        let prefs = build_on(&windows, &["--unattended"]).unwrap();
        assert!(prefs.force_daemon);
    }

    #[test]
    fn test_synology_rejections() {
        let syno = Host::new(Platform::Linux, Distro::Synology, "admin");

        let err = build_on(&syno, &["--accept-routes"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "--accept-routes is not supported on Synology"
        );
        let err = build_on(&syno, &["--exit-node=100.64.0.1"]).unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedOnSynology(_)));
        let err = build_on(&syno, &["--netfilter-mode=on"]).unwrap_err();
        assert!(err.to_string().contains("besides \"off\""));

        // Default netfilter mode there is "off", so no warning either.
        let mut warned = false;
        let inv = UpInvocation::parse(&syno, Vec::<String>::new()).unwrap();
        let prefs = prefs_from_up_args(
            &inv.args,
            &syno,
            &Status::new(BackendState::Stopped),
            |_| warned = true,
        )
        .unwrap();
        assert_eq!(prefs.netfilter_mode, NetfilterMode::Off);
        assert!(!warned);
    }

    #[test]
    fn test_operator_inherited_from_same_user() {
        let old = Prefs {
            operator_user: "alice".to_string(),
            ..Prefs::default()
        };
        let mut prefs = build(&[]).unwrap();
        apply_implicit_prefs(&mut prefs, &old, "alice");
        assert_eq!(prefs.operator_user, "alice");
    }

    #[test]
    fn test_operator_not_inherited_from_other_user() {
        let old = Prefs {
            operator_user: "bob".to_string(),
            ..Prefs::default()
        };
        let mut prefs = build(&[]).unwrap();
        apply_implicit_prefs(&mut prefs, &old, "alice");
        assert_eq!(prefs.operator_user, "");
    }

    #[test]
    fn test_explicit_operator_wins() {
        let old = Prefs {
            operator_user: "alice".to_string(),
            ..Prefs::default()
        };
        let mut prefs = build(&["--operator=carol"]).unwrap();
        apply_implicit_prefs(&mut prefs, &old, "alice");
        assert_eq!(prefs.operator_user, "carol");
    }
}
