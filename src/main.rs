use clap::{Parser, Subcommand};
use meshctl::ipn::MaskedPrefs;
use meshctl::{ClientConfig, Host, LocalBackend, LocalClient, UpError, UpInvocation};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "meshctl")]
#[command(about = "Command-line client for the meshd mesh-VPN daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the mesh, or change settings of a running node
    ///
    /// Without flags, brings a previously logged-in node back up. With
    /// flags, every setting must be mentioned (or --reset given), so
    /// nothing is changed by omission.
    Up(UpInvocation),
    /// Disconnect from the mesh, keeping settings and login
    Down,
    /// Show daemon state
    Status,
    /// Generate default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Prompts go to stderr as well; stdout is left for `status`
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => {
            info!("Generating default config...");
            let path = PathBuf::from(meshctl::config::LOCAL_CONFIG);
            ClientConfig::default().save(&path)?;
            println!("Created default config: {}", path.display());
        }
        Commands::Up(inv) => {
            let config = load_config();
            let client = Arc::new(daemon_client(&config));
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let result = meshctl::run_up(
                client,
                &inv,
                &Host::detect(),
                config.up_timeout(),
                Box::new(std::io::stderr()),
                &cancel,
            )
            .await;
            match result {
                Ok(mode) => debug!("up finished ({})", mode),
                // Printed as is so the suggested command can be copied.
                Err(UpError::Revert(e)) => {
                    eprint!("{}", e);
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Down => {
            let client = daemon_client(&load_config());
            info!("Disconnecting...");
            if let Err(e) = client.edit_prefs(&MaskedPrefs::want_running(false)).await {
                error!("{}", e);
                std::process::exit(1);
            }
            info!("Stopped");
        }
        Commands::Status => match daemon_client(&load_config()).status().await {
            Ok(st) => {
                println!("State: {}", st.backend_state);
                for ip in &st.tailscale_ips {
                    println!("  Address: {}", ip);
                }
                if !st.auth_url.is_empty() {
                    println!("  Log in at: {}", st.auth_url);
                }
                println!("  Peers: {}", st.peers.len());
                for peer in st.peers.values() {
                    let addrs: Vec<String> =
                        peer.tailscale_ips.iter().map(|ip| ip.to_string()).collect();
                    println!("    {} {}", peer.host_name, addrs.join(","));
                }
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

fn load_config() -> ClientConfig {
    match ClientConfig::discover() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn daemon_client(config: &ClientConfig) -> LocalClient {
    debug!("Using daemon socket {}", config.daemon.socket_path.display());
    LocalClient::new(config.daemon.socket_path.clone(), config.request_timeout())
}
