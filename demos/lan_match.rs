//! A headless LAN match: find or host a game in the lobby, start it, then run a fixed
//! number of lockstep frames with scripted input.
//!
//! ```text
//! cargo run --example lan_match -- host --name alice --players 2
//! cargo run --example lan_match -- join --name bob
//! cargo run --example lan_match -- server
//! ```
//!
//! Each frame queues one keypress and draws from the shared generator, so every peer
//! should print the same checksum at the end.

use clap::{Parser, Subcommand};
use fortress_lockstep::prelude::*;
use fortress_lockstep::rng::Rng;
use fortress_lockstep::{DiscoveryServer, DiscoveryServerConfig, DISCOVERY_PORT, NETPLAY_PORT};
use std::net::SocketAddrV4;
use tracing::{info, warn};
use web_time::{Duration, Instant};

#[derive(Parser)]
struct Opt {
    #[command(subcommand)]
    mode: Mode,
    /// Frames to play once the match starts.
    #[arg(short, long, default_value_t = 300, global = true)]
    frames: u32,
    /// Display name in the lobby.
    #[arg(short, long, default_value = "player", global = true)]
    name: String,
    /// Global discovery server, e.g. `lobby.example.net`.
    #[arg(long, global = true)]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Mode {
    /// Host a game and start once enough players joined.
    Host {
        /// Players needed to start, host included.
        #[arg(short, long, default_value_t = 2)]
        players: usize,
        /// Death-match frag count, 0 for a regular game.
        #[arg(short, long, default_value_t = 0)]
        death_match: u8,
    },
    /// Join the first game found.
    Join {
        /// Ask this host directly instead of broadcasting.
        #[arg(long)]
        host: Option<SocketAddrV4>,
    },
    /// Run a global discovery server.
    Server {
        #[arg(short, long, default_value_t = DISCOVERY_PORT)]
        port: u16,
    },
}

const LOBBY_TICK: std::time::Duration = std::time::Duration::from_millis(20);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // configure logging: output Fortress Lockstep logs to standard out
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    )?;

    let opt = Opt::parse();
    let mut config = LobbyConfig::new(opt.name.clone());
    if let Some(server) = &opt.server {
        config = config.with_global_server(server, DISCOVERY_PORT)?;
    }

    match opt.mode {
        Mode::Host {
            players,
            death_match,
        } => {
            config.death_match = death_match;
            let mut transport = TransportSession::open_hosting()?;
            let mut lobby = LobbyDiscovery::new(config)?;
            lobby.start();
            lobby.set_hosting(&mut transport, true)?;
            info!(id = lobby.unique_id(), "hosting, waiting for {players} players");
            while lobby.hosted_game().map_or(0, |game| game.player_count()) < players {
                lobby.poll(&mut transport, Instant::now())?;
                std::thread::sleep(LOBBY_TICK);
            }

            let params = GameParams {
                rules: if death_match > 0 {
                    MatchRules::DeathMatch(u32::from(death_match))
                } else {
                    MatchRules::Lives(3)
                },
                ..GameParams::default()
            };
            let roster = lobby.match_roster()?;
            let mut session = MatchBuilder::new()
                .with_lockstep_config(LockstepConfig::lan())
                .host_match(&mut transport, roster, params)?;
            play(&mut session, opt.frames)
        },
        Mode::Join { host } => {
            if let Some(host) = host {
                config.local_discovery = Some(host);
            }
            let mut transport = TransportSession::open_ephemeral()?;
            let mut lobby = LobbyDiscovery::new(config)?;
            lobby.start();
            loop {
                if lobby.state() == LobbyState::Listing {
                    let next_id = lobby.games().iter().next().map(|game| {
                        info!(game = game.game_id(), host = %game.host, "joining");
                        game.game_id()
                    });
                    if let Some(id) = next_id {
                        lobby.join_game(&mut transport, id)?;
                    }
                }
                if lobby.poll(&mut transport, Instant::now())? == LobbyPoll::MatchStarting {
                    break;
                }
                std::thread::sleep(LOBBY_TICK);
            }

            let roster = lobby.match_roster()?;
            let mut session = MatchBuilder::new()
                .with_lockstep_config(LockstepConfig::lan())
                .join_match(&mut transport, roster)?;
            play(&mut session, opt.frames)
        },
        Mode::Server { port } => {
            if port == NETPLAY_PORT {
                warn!("the discovery server shares the match port; hosts on this machine cannot bind it");
            }
            let mut transport = TransportSession::open(port)?;
            let mut server = DiscoveryServer::new(DiscoveryServerConfig::default());
            info!(port, "discovery server running");
            loop {
                transport.poll(Duration::from_millis(500))?;
                let handled = server.pump(&mut transport, Instant::now())?;
                if handled > 0 {
                    info!(hosts = server.len(), "registrations");
                }
            }
        },
    }
}

fn play(session: &mut LockstepSession<'_>, frames: u32) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        local = %session.local_player(),
        seed = session.seed(),
        params = ?session.params(),
        "match started"
    );
    let mut checksum = 0u32;
    for frame in 0..frames {
        let key = b'a' + (frame % 26) as u8;
        session.queue_input(KEY_PRESS, key);
        session.advance_frame()?;
        for player in PlayerIndex::all() {
            for record in session.take_sync_buf(player) {
                checksum = checksum
                    .rotate_left(5)
                    .wrapping_add((u32::from(record.op) << 8) | u32::from(record.keycode));
            }
        }
        checksum ^= session.rng_mut().next_u32();
    }
    info!(
        checksum = %format!("{checksum:#010x}"),
        stats = ?session.stats(),
        "match finished"
    );
    Ok(())
}
