use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use dirty_pig::config::{load_dotenv, ClientConfig, DEFAULT_SUPABASE_URL};
use dirty_pig::domain::{CardType, RoomId};
use dirty_pig::game::GameStore;
use dirty_pig::logging::{init_tracing, json_from_env};
use dirty_pig::realtime::{ChannelSpec, RealtimeEvent};
use dirty_pig::session::{Identity, SessionStore, StaticAuth};
use dirty_pig::AppContext;

const LOG_TARGET: &str = "bin::dirty_pig";
const DEMO_TURN_LIMIT: usize = 400;
const DEMO_IDLE_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "dirty-pig")]
#[command(about = "Dirty Pig sync client tools", long_about = None)]
struct Args {
    /// Supabase project URL
    #[arg(long, env = "SUPABASE_URL", default_value = DEFAULT_SUPABASE_URL, global = true)]
    supabase_url: String,

    /// Supabase anon key
    #[arg(long, env = "SUPABASE_ANON_KEY", global = true)]
    anon_key: Option<String>,

    /// Explicit realtime websocket URL; derived from the project URL otherwise
    #[arg(long, env = "SUPABASE_REALTIME_URL", global = true)]
    realtime_url: Option<String>,

    /// Toggle structured (JSON) logs
    #[arg(long, env = "DIRTY_PIG_LOG_JSON", default_value_t = false, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Play a full game between bots on the in-memory backend
    Demo {
        #[arg(long, default_value_t = 3)]
        players: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// List rooms on the hosted project
    Rooms {
        #[arg(long, env = "DIRTY_PIG_ACCESS_TOKEN")]
        access_token: Option<String>,
    },
    /// Log every change and broadcast on a room's game channel
    Watch {
        #[arg(long)]
        room: RoomId,
        #[arg(long, env = "DIRTY_PIG_ACCESS_TOKEN")]
        access_token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let args = Args::parse();
    init_tracing(args.json || json_from_env())?;

    match args.command {
        Command::Demo { players, seed } => run_demo(players, seed).await,
        Command::Rooms { ref access_token } => {
            let config = build_config(&args)?;
            list_rooms(&config, access_token.clone()).await
        }
        Command::Watch {
            room,
            ref access_token,
        } => {
            let config = build_config(&args)?;
            watch_room(&config, room, access_token.clone()).await
        }
    }
}

fn build_config(args: &Args) -> Result<ClientConfig> {
    let key = args
        .anon_key
        .clone()
        .ok_or_else(|| anyhow!("SUPABASE_ANON_KEY is required for hosted commands"))?;
    let mut config = ClientConfig::new(&args.supabase_url, key).context("invalid Supabase settings")?;
    if let Some(raw) = &args.realtime_url {
        let url = raw.parse().context("invalid SUPABASE_REALTIME_URL")?;
        config = config.with_realtime_url(url);
    }
    Ok(config)
}

async fn list_rooms(config: &ClientConfig, access_token: Option<String>) -> Result<()> {
    let (context, _sync) = AppContext::connect(config, access_token, None)
        .await
        .context("failed to restore session")?;
    let lobby = context.lobby();
    let rooms = lobby.fetch_rooms().await.context("failed to list rooms")?;
    info!(target = LOG_TARGET, count = rooms.len(), "rooms fetched");
    for room in rooms {
        info!(
            target = LOG_TARGET,
            room_id = %room.id,
            name = %room.name,
            status = ?room.status,
            players = room.current_players,
            max_players = room.max_players,
            "room"
        );
    }
    Ok(())
}

async fn watch_room(config: &ClientConfig, room_id: RoomId, access_token: String) -> Result<()> {
    let (context, _sync) = AppContext::connect(config, Some(access_token), None)
        .await
        .context("failed to restore session")?;
    let me = context
        .session
        .identity()
        .ok_or_else(|| anyhow!("the access token did not resolve to a user"))?;
    let handle = context
        .realtime
        .open(ChannelSpec::game(room_id, me.id))
        .await
        .context("failed to open game channel")?;
    info!(target = LOG_TARGET, room_id = %room_id, topic = %handle.topic, "watching");

    let (mut events, _publisher, stop) = handle.into_parts();
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(RealtimeEvent::Table(change)) => info!(target = LOG_TARGET, ?change, "change"),
            Ok(RealtimeEvent::Broadcast(message)) => {
                info!(target = LOG_TARGET, ?message, "broadcast")
            }
            Ok(RealtimeEvent::Status(status)) => info!(target = LOG_TARGET, ?status, "status"),
            Err(RecvError::Lagged(skipped)) => warn!(target = LOG_TARGET, skipped, "lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    stop.cancel();
    Ok(())
}

struct Bot {
    identity: Identity,
    context: AppContext,
    game: GameStore,
}

async fn run_demo(players: usize, seed: u64) -> Result<()> {
    if !(2..=6).contains(&players) {
        bail!("a demo table seats 2 to 6 players, got {players}");
    }
    let (backend, realtime) = AppContext::local(seed);

    let mut bots = Vec::with_capacity(players);
    for seat in 0..players {
        let email = format!("bot{}@example.com", seat + 1);
        let identity = Identity::new(Uuid::new_v4(), &email);
        backend.register_player(identity.id, &email);
        let session = Arc::new(SessionStore::new(
            Arc::new(StaticAuth::signed_in(identity.clone())),
            "http://localhost:5173",
        ));
        session.initialize().await.context("bot sign-in failed")?;
        let context = AppContext::new(backend.clone(), realtime.clone(), session)
            .with_poll_interval(Duration::from_millis(200));
        let game = context.game();
        bots.push(Bot {
            identity,
            context,
            game,
        });
    }

    let host = bots[0].context.lobby();
    let room = host
        .create_room("demo sty", players as i32, false)
        .await
        .context("failed to create room")?;
    let mut lobbies = vec![host];
    for bot in &bots[1..] {
        let lobby = bot.context.lobby();
        lobby.join_room(room.id).await.context("failed to join room")?;
        lobbies.push(lobby);
    }
    for lobby in &lobbies {
        lobby.toggle_ready().await.context("failed to ready up")?;
    }
    lobbies[0].load_room(room.id).await?;
    let room_id = lobbies[0].start_game().await.context("failed to start game")?;
    info!(target = LOG_TARGET, room_id = %room_id, players, seed, "game started");

    bots[0].game.initialize_game(room_id).await?;
    for bot in &bots[1..] {
        bot.game.load_game(room_id).await?;
    }

    let mut turns = 0;
    let mut idle = tokio::time::Instant::now();
    while turns < DEMO_TURN_LIMIT {
        if let Some(winner) = bots.iter().find_map(|bot| bot.game.winner_info()) {
            info!(
                target = LOG_TARGET,
                winner = winner.name.as_deref().unwrap_or("unknown"),
                condition = ?winner.win_condition,
                turns,
                "game over"
            );
            break;
        }
        let Some(bot) = bots
            .iter()
            .find(|bot| bot.game.is_my_turn() && !bot.game.snapshot().turn_in_progress)
        else {
            if idle.elapsed() > DEMO_IDLE_LIMIT {
                bail!("no client picked up the turn");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        };
        take_turn(bot).await;
        turns += 1;
        idle = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if turns >= DEMO_TURN_LIMIT {
        warn!(target = LOG_TARGET, turns, "turn limit reached without a winner");
    }

    for (bot, lobby) in bots.iter().zip(&lobbies) {
        bot.game.safe_cleanup_on_leave().await;
        lobby.cleanup();
    }
    Ok(())
}

async fn take_turn(bot: &Bot) {
    let name = bot.identity.display_name().unwrap_or("bot").to_owned();
    let hand: Vec<CardType> = bot.game.my_hand().iter().map(|h| h.card_type).collect();
    let playable = hand.iter().copied().find(|card| bot.game.can_play_card(*card));

    let result = match playable {
        Some(card) => {
            let target = bot.game.valid_targets(card).first().map(|pig| pig.id);
            info!(target = LOG_TARGET, player = %name, %card, "plays");
            bot.game.play_card(card, target).await
        }
        None if bot.game.can_discard_all_cards() => {
            info!(target = LOG_TARGET, player = %name, "swaps a dead hand");
            bot.game.discard_all_cards().await
        }
        None => match hand.first() {
            Some(card) => {
                info!(target = LOG_TARGET, player = %name, %card, "discards");
                bot.game.discard_card(*card).await
            }
            None => {
                info!(target = LOG_TARGET, player = %name, "passes with an empty hand");
                bot.game.end_turn().await
            }
        },
    };
    if let Err(err) = result {
        warn!(target = LOG_TARGET, player = %name, error = %err, "action failed");
    }
}
