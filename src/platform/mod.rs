//! Host platform detection
//!
//! Several `up` flags only exist on one operating system, and a few Linux
//! distributions can't support everything the daemon offers. Everything that
//! depends on where we're running is resolved here once into a [`Host`].

#[cfg(target_os = "linux")]
pub mod linux;

use std::fmt;

/// Operating system the client runs on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
    FreeBsd,
    Other(String),
}

impl Platform {
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            "macos" => Platform::MacOs,
            "freebsd" => Platform::FreeBsd,
            other => Platform::Other(other.to_string()),
        }
    }

    /// Whether the daemon authenticates local clients by socket peer
    /// credentials, which is what makes `--operator` meaningful.
    pub fn uses_peer_creds(&self) -> bool {
        matches!(self, Platform::Linux | Platform::MacOs | Platform::FreeBsd)
    }

    /// Suffix appended to a daemon "permission denied" error
    pub fn permission_denied_hint(&self) -> &'static str {
        match self {
            Platform::Windows => " (meshd service in use by other user?)",
            _ => " (try 'sudo meshctl up [...]')",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => f.write_str("linux"),
            Platform::Windows => f.write_str("windows"),
            Platform::MacOs => f.write_str("macos"),
            Platform::FreeBsd => f.write_str("freebsd"),
            Platform::Other(os) => f.write_str(os),
        }
    }
}

/// Linux distribution, where it matters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distro {
    #[default]
    Generic,
    /// NAS appliance without netfilter support or route acceptance
    Synology,
}

impl Distro {
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            linux::detect_distro()
        }

        #[cfg(not(target_os = "linux"))]
        {
            Distro::Generic
        }
    }

    /// Default value of `--netfilter-mode`
    pub fn default_netfilter_mode(&self) -> &'static str {
        match self {
            Distro::Synology => "off",
            Distro::Generic => "on",
        }
    }
}

/// Everything about the invoking environment the `up` logic depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub platform: Platform,
    pub distro: Distro,
    /// Invoking OS user name, empty if unknown
    pub user: String,
}

impl Host {
    pub fn detect() -> Self {
        Self {
            platform: Platform::current(),
            distro: Distro::detect(),
            user: current_user(),
        }
    }

    pub fn new(platform: Platform, distro: Distro, user: impl Into<String>) -> Self {
        Self {
            platform,
            distro,
            user: user.into(),
        }
    }

    pub fn is_linux(&self) -> bool {
        self.platform == Platform::Linux
    }
}

/// Name of the user running this process
pub fn current_user() -> String {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return user;
        }
    }

    #[cfg(unix)]
    {
        let uid = nix::unistd::getuid();
        if let Ok(Some(user)) = nix::unistd::User::from_uid(uid) {
            return user.name;
        }
    }

    String::new()
}
