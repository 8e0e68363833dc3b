//! # dialbridge
//!
//! Operator binary for the dial-in bridge:
//! - `check-config`: load, validate and summarise configuration
//! - `probe`: open a signaling channel to a room and report what the
//!   room server's router offers
//!
//! The call-control adapter embeds [`dialbridge_call::Gateway`] and feeds it
//! invites; this binary covers bootstrap and diagnostics.

use std::time::Duration;

use anyhow::{Context, bail};
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde_json::json;

use dialbridge_call::{PromptLibrary, RoomDirectory, StaticRoomDirectory};
use dialbridge_common::config::{self, AppConfig};
use dialbridge_common::id::generate_peer_id;
use dialbridge_conference::capabilities::VIDEO_ORIENTATION;
use dialbridge_conference::protocol::method;
use dialbridge_conference::{ChannelConnector, ChannelEvent, RouterCapabilities, WsConnector};

#[derive(Parser)]
#[command(name = "dialbridge", version, about = "Dial-in bridge into WebRTC conference rooms")]
struct Cli {
    /// Configuration file; defaults to `config.*` in the working directory.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print a summary.
    CheckConfig,
    /// Fetch and print the router capabilities of a room.
    Probe(ProbeArgs),
}

#[derive(Args)]
#[command(group(ArgGroup::new("target").required(true).args(["code", "room"])))]
struct ProbeArgs {
    /// Dial-in code, resolved through `rooms.mapping`.
    #[arg(long)]
    code: Option<String>,
    #[arg(long)]
    room: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dialbridge=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = config::init(cli.config.as_deref()).context("loading configuration")?;
    config.validate()?;
    tracing::info!("Starting dialbridge v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::CheckConfig => check_config(config),
        Command::Probe(args) => probe(config, args).await,
    }
}

fn check_config(config: &AppConfig) -> anyhow::Result<()> {
    let directory = StaticRoomDirectory::from_config(&config.rooms);
    let prompts = PromptLibrary::load(&config.prompts, &config.mixer);
    let missing: Vec<String> = prompts.missing().iter().map(ToString::to_string).collect();

    let summary = json!({
        "room_server": format!("{}:{}", config.conference.host_name, config.conference.port),
        "force_tcp": config.conference.force_tcp,
        "last_n": config.conference.last_n,
        "turn_servers": config.conference.turn_servers.len(),
        "mode": config.bridge.mode,
        "room_codes": directory.len(),
        "default_room": config.rooms.default_room,
        "mixer": {
            "width": config.mixer.width,
            "height": config.mixer.height,
            "frame_rate": config.mixer.frame_rate,
            "layout": config.mixer.layout,
            "sample_rate": config.mixer.sample_rate,
            "channels": config.mixer.channels,
        },
        "missing_prompts": missing,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !missing.is_empty() {
        tracing::warn!(missing = missing.len(), "Some prompts failed to load; callers will hear silence for them");
    }
    Ok(())
}

async fn probe(config: &AppConfig, args: ProbeArgs) -> anyhow::Result<()> {
    let room = match (args.code, args.room) {
        (Some(code), _) => StaticRoomDirectory::from_config(&config.rooms)
            .resolve(&code)
            .await?
            .with_context(|| format!("no room mapped to code {code}"))?,
        (None, Some(room)) => room.trim().to_lowercase(),
        (None, None) => bail!("either --code or --room is required"),
    };
    let peer_id = generate_peer_id();
    tracing::info!(room = %room, peer = %peer_id, "Probing room");

    let mut handle = WsConnector::new(&config.conference)
        .connect(&peer_id, &room)
        .await?;
    let wait = Duration::from_millis(config.conference.request_timeout_ms);
    tokio::time::timeout(wait, async {
        loop {
            match handle.events.recv().await {
                Some(ChannelEvent::Connected) => return Ok(()),
                Some(ChannelEvent::Closed) | None => bail!("signaling channel closed"),
                Some(_) => {}
            }
        }
    })
    .await
    .context("timed out connecting to the room server")??;

    let result = handle
        .channel
        .request(method::GET_ROUTER_RTP_CAPABILITIES, json!({}))
        .await;
    handle.channel.close();

    let caps = RouterCapabilities::from_value(result?)?.without_header_extension(VIDEO_ORIENTATION);
    println!("{}", caps.summary());
    Ok(())
}
