use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

use vmux_sync::VmuxConfig;

mod cli;

#[derive(Parser)]
#[command(name = "vmux")]
#[command(about = "Terminal client for the voice multiplexer relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.vmux)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and print sessions, status, and transcript as they change
    Watch(WatchArgs),

    /// Print the relay's current session list
    Sessions(SessionsArgs),

    /// Print the locally cached transcript of a session
    Transcript(TranscriptArgs),

    /// Delete the locally cached transcript of a session
    Clear(TargetArgs),

    /// Set or clear a local display name for a session
    Rename(RenameArgs),

    /// Set or clear a local color (hue 0-359) for a session
    Color(ColorArgs),

    /// Pair this device with the relay using a pairing code
    Pair(PairArgs),

    /// Inspect and manage device authorization
    #[command(subcommand)]
    Auth(AuthCommands),

    /// Point the client at a relay (writes config.toml)
    Relay(RelayArgs),

    /// Drop cached sessions not seen within the retention window
    Prune,
}

#[derive(Parser)]
struct WatchArgs {
    /// Attach to this session once the session list arrives
    #[arg(short, long)]
    session: Option<String>,
}

#[derive(Parser)]
struct SessionsArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct TranscriptArgs {
    session_id: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct TargetArgs {
    session_id: String,
}

#[derive(Parser)]
struct RenameArgs {
    session_id: String,
    /// New name; omit to fall back to the relay's name
    name: Option<String>,
}

#[derive(Parser)]
struct ColorArgs {
    session_id: String,
    /// Hue in degrees; omit to use the derived color
    hue: Option<u16>,
}

#[derive(Parser)]
struct PairArgs {
    code: String,

    /// Name this device is listed under on the relay
    #[arg(long, default_value = "vmux")]
    name: String,
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Show whether the relay requires auth and whether this device passes
    Status,
    /// List paired devices
    Devices,
    /// Revoke a paired device
    Revoke { device_id: String },
}

#[derive(Parser)]
struct RelayArgs {
    /// Relay base URL, e.g. http://10.0.0.5:3100
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "vmux=debug,vmux_sync=debug,info"
    } else {
        "vmux=info,vmux_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = VmuxConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Watch(args) => cli::watch::watch_command(&config, args.session).await,
        Commands::Sessions(args) => cli::watch::sessions_command(&config, args.json).await,
        Commands::Transcript(args) => {
            cli::local::transcript_command(&config, &args.session_id, args.json).await
        }
        Commands::Clear(args) => cli::local::clear_command(&config, &args.session_id).await,
        Commands::Rename(args) => {
            cli::local::rename_command(&config, &args.session_id, args.name).await
        }
        Commands::Color(args) => cli::local::color_command(&config, &args.session_id, args.hue).await,
        Commands::Pair(args) => cli::auth::pair_command(&config, &args.code, &args.name).await,
        Commands::Auth(AuthCommands::Status) => cli::auth::status_command(&config).await,
        Commands::Auth(AuthCommands::Devices) => cli::auth::devices_command(&config).await,
        Commands::Auth(AuthCommands::Revoke { device_id }) => {
            cli::auth::revoke_command(&config, &device_id).await
        }
        Commands::Relay(args) => cli::auth::set_relay_url(&config, &args.url),
        Commands::Prune => cli::local::prune_command(&config).await,
    }
}
