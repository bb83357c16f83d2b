use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use engine::{Credentials, Engine, EngineConfig, TurnOrder};
use error::GameError;
use games::cards::Card;
use games::crazy_eights::{Play, ADMIN};

mod engine;
mod error;
mod games;
mod registry;
mod store;

#[derive(Parser)]
#[command(version, about = "Crazy Eights played one move per invocation", long_about = None)]
struct Args {
    /// Directory holding one sub-directory per game
    #[arg(long, env = "CRAZY_EIGHTS_GAMES_DIR", default_value = "games")]
    games_dir: PathBuf,

    /// Name of the game to act on
    #[arg(short, long)]
    game: String,

    /// Acting identity
    #[arg(short, long, default_value = ADMIN)]
    user: String,

    /// Password of the acting identity, prompted for when absent
    #[arg(long, env = "CRAZY_EIGHTS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Give up waiting for a busy game after this long
    #[arg(long, env = "CRAZY_EIGHTS_LOCK_TIMEOUT_MS", default_value_t = 5000)]
    lock_timeout_ms: u64,

    // Reproducible shuffles
    #[arg(long, env = "CRAZY_EIGHTS_SEED", hide = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new game and its admin user
    Init {
        /// Password for admin, prompted for when absent
        #[arg(long, env = "CRAZY_EIGHTS_NEW_PASSWORD", hide_env_values = true)]
        new_password: Option<String>,
    },
    /// Register a player (admin, between games)
    AddUser {
        name: String,
        /// Password for the new player, prompted for when absent
        #[arg(long, env = "CRAZY_EIGHTS_NEW_PASSWORD", hide_env_values = true)]
        new_password: Option<String>,
    },
    /// Unregister a player (admin, between games)
    RemoveUser {
        name: String,
    },
    /// Deal a new game (admin)
    Start,
    /// Draw one card
    Draw,
    /// End your turn after drawing
    Pass,
    /// Play a card from your hand, e.g. `H10` or `SQ`
    Play {
        card: String,
    },
    /// Show the turn order and the top of the discard pile
    Order,
    /// Show the cards held by a player
    Cards {
        user: String,
    },
}

fn prompt_secret(user: &str) -> Result<String> {
    eprint!("Enter {} password: ", user);
    io::stderr().flush().context("Failed to write prompt")?;

    let mut line = String::new();
    let n = io::stdin().lock().read_line(&mut line).context("Failed to read password")?;
    if n == 0 {
        return Err(anyhow!("No password given for {}", user));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn secret_or_prompt(given: Option<String>, user: &str) -> Result<String> {
    match given {
        Some(secret) => Ok(secret),
        None => prompt_secret(user),
    }
}

fn format_cards(cards: &[Card]) -> String {
    cards
        .iter()
        .map(|c| format!("{} ({})", c, c.pretty()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_order(order: &TurnOrder) {
    println!("Top of discard: {} ({})", order.top, order.top.pretty());
    println!("Cards left in deck: {}", order.deck_size);
    for (i, (player, n_cards)) in order.seats.iter().enumerate() {
        let marker = if *player == order.current { "->" } else { "  " };
        let drawn = if *player == order.current && order.has_drawn { ", has drawn" } else { "" };
        println!("{} {}. {} ({} cards{})", marker, i + 1, player, n_cards, drawn);
    }
}

fn run(args: Args) -> Result<()> {
    let config = EngineConfig {
        lock_timeout: Duration::from_millis(args.lock_timeout_ms),
        seed: args.seed,
    };

    // Every command but init acts on an existing game as an authenticated user
    let open = || -> Result<(Engine, Credentials)> {
        let engine = Engine::open(&args.games_dir, &args.game, config.clone())?;
        let secret = secret_or_prompt(args.password.clone(), &args.user)?;
        Ok((engine, Credentials::new(&args.user, &secret)))
    };

    match args.commands {
        Commands::Init { new_password } => {
            let secret = secret_or_prompt(new_password, ADMIN)?;
            Engine::init(&args.games_dir, &args.game, &secret, config.clone())?;
            println!("Game {} created", args.game);
        }
        Commands::AddUser { name, new_password } => {
            let (engine, actor) = open()?;
            let new_secret = secret_or_prompt(new_password, &name)?;
            engine.add_user(&actor, &name, &new_secret)?;
            println!("Added {}", name);
        }
        Commands::RemoveUser { name } => {
            let (engine, actor) = open()?;
            engine.remove_user(&actor, &name)?;
            println!("Removed {}", name);
        }
        Commands::Start => {
            let (engine, actor) = open()?;
            let first = engine.start_game(&actor)?;
            println!("Game started, {} goes first", first);
        }
        Commands::Draw => {
            let (engine, actor) = open()?;
            let card = engine.draw_card(&actor)?;
            println!("You drew {} ({})", card, card.pretty());
        }
        Commands::Pass => {
            let (engine, actor) = open()?;
            let next = engine.pass_turn(&actor)?;
            println!("Turn passed to {}", next);
        }
        Commands::Play { card } => {
            let (engine, actor) = open()?;
            match engine.play_card(&actor, &card)? {
                Play::Continued { card, next } => println!("Played {} ({}), {} is next", card, card.pretty(), next),
                Play::Won { winner, card, scores } => {
                    println!("Played {} ({}). {} wins!", card, card.pretty(), winner);
                    for (player, points) in scores {
                        println!("  {} is left with {} points", player, points);
                    }
                }
            }
        }
        Commands::Order => {
            let (engine, actor) = open()?;
            print_order(&engine.view_turn_order(&actor)?);
        }
        Commands::Cards { user } => {
            let (engine, actor) = open()?;
            let hand = engine.view_hand(&actor, &user)?;
            println!("{} holds {} cards: {}", user, hand.len(), format_cards(&hand));
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let code = err
                .downcast_ref::<GameError>()
                .map_or(1, |e| e.category().exit_code());
            ExitCode::from(code)
        }
    }
}
