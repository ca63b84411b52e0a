//! meshctl - command-line client for the meshd mesh-VPN daemon
//!
//! The interesting part is `meshctl up`, which has to reconcile the flags
//! it was given with whatever the daemon is already running:
//!
//! - flags become a complete set of desired preferences
//! - settings the user didn't mention are never silently reverted
//! - a running node is edited in place; anything else is (re)started and
//!   watched until it comes up, with login prompts along the way
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `platform`: Host platform and distro detection
//! - `ipn`: Daemon-facing types and the local socket client
//! - `up`: The `up` command: flags, builder, revert guard, update modes, handshake

pub mod config;
pub mod ipn;
pub mod platform;
pub mod up;

pub use config::ClientConfig;
pub use ipn::{LocalBackend, LocalClient};
pub use platform::Host;
pub use up::{run_up, UpError, UpInvocation};
