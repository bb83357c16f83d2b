use std::fs;
use std::path::Path;
use std::time::Duration;

use rand::{rngs::StdRng, SeedableRng};

use crate::error::{GameError, Result};
use crate::games::cards::Card;
use crate::games::crazy_eights::{decode_cards, encode_cards, Hand, Play, PlayerId, Table, Turn, ADMIN};
use crate::games::Validate;
use crate::registry::{Registry, UserFile};
use crate::store::{GameDir, GameLock, LockMode};

const USERS: &str = "users";
const TURN: &str = "turn";
const DECK: &str = "deck";
const DISCARD: &str = "discard";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub lock_timeout: Duration,
    // Fixed seed for reproducible deals, OS entropy otherwise
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { lock_timeout: Duration::from_millis(5000), seed: None }
    }
}

/// Acting identity of an invocation.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(user: &str, secret: &str) -> Self {
        Credentials { user: user.to_string(), secret: secret.to_string() }
    }

    fn is_admin(&self) -> bool {
        self.user == ADMIN
    }
}

/// What anyone in the game may see about the table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TurnOrder {
    // Roster order with each player's hand size
    pub seats: Vec<(PlayerId, usize)>,
    pub current: PlayerId,
    pub has_drawn: bool,
    pub top: Card,
    pub deck_size: usize,
}

// One committed transition in the play log. Drawn cards stay hidden.
#[derive(Debug, Clone, serde::Serialize)]
struct PlayLogPly {
    action: String,
    player: String,
    card: Option<String>,
    next: Option<String>,
    deck: usize,
    discard: usize,
    hand: Option<usize>,
}

impl PlayLogPly {
    fn new(action: &str, player: &str, table: &Table) -> Self {
        PlayLogPly {
            action: action.to_string(),
            player: player.to_string(),
            card: None,
            next: match &table.turn {
                Turn::Player { id, .. } if id != player => Some(id.clone()),
                _ => None,
            },
            deck: table.deck.len(),
            discard: table.discard.len(),
            hand: table.hands.get(player).map(|h| h.len()),
        }
    }

    fn with_card(mut self, card: Card) -> Self {
        self.card = Some(card.to_string());
        self
    }
}

// Everything one invocation reads, taken once under the lock
struct Snapshot {
    users: UserFile,
    roster: Vec<PlayerId>,
    table: Table,
}

fn load(lock: &GameLock) -> Result<Snapshot> {
    let users = lock
        .read(USERS)?
        .ok_or_else(|| GameError::malformed(USERS, "record is missing"))?;
    let users = UserFile::parse(&users)?;
    let roster = users.players();

    let turn: Turn = lock
        .read(TURN)?
        .ok_or_else(|| GameError::malformed(TURN, "record is missing"))?
        .parse()?;
    let deck = decode_cards(DECK, &lock.read(DECK)?.unwrap_or_default())?;
    let discard = decode_cards(DISCARD, &lock.read(DISCARD)?.unwrap_or_default())?;

    let mut table = Table::new(&roster);
    for player in &roster {
        let hand = decode_cards(player, &lock.read(player)?.unwrap_or_default())?;
        table.hands.insert(player.clone(), hand);
    }
    table.turn = turn;
    table.deck = deck;
    table.discard = discard;
    table.validate()?;

    Ok(Snapshot { users, roster, table })
}

// Write the records that differ between the two tables as one commit
fn commit_table(lock: &GameLock, before: &Table, after: &Table) -> Result<()> {
    let mut tx = lock.transaction();
    if before.turn != after.turn {
        tx.put(TURN, after.turn.to_string());
    }
    if before.deck != after.deck {
        tx.put(DECK, encode_cards(&after.deck));
    }
    if before.discard != after.discard {
        tx.put(DISCARD, encode_cards(&after.discard));
    }
    for (player, hand) in &after.hands {
        if before.hands.get(player) == Some(hand) {
            continue;
        }
        if after.turn.is_idle() && hand.is_empty() {
            tx.remove(player);
        } else {
            tx.put(player, encode_cards(hand));
        }
    }
    tx.commit()
}

/// Game engine bound to one game directory. Every operation takes the lock,
/// reads a fresh snapshot, applies at most one transition and commits it
/// before returning.
pub struct Engine {
    dir: GameDir,
    config: EngineConfig,
}

impl Engine {
    /// Create a new game with `admin` as its only user.
    pub fn init(games_dir: &Path, name: &str, admin_secret: &str, config: EngineConfig) -> Result<Self> {
        let dir = GameDir::create(games_dir, name)?;
        Self::populate(dir, admin_secret, config)
    }

    // Write the records of an idle game into a fresh directory. A directory
    // left without them could neither be opened nor created again, so it is
    // removed on failure.
    fn populate(dir: GameDir, admin_secret: &str, config: EngineConfig) -> Result<Self> {
        let written = dir.lock(LockMode::Exclusive, config.lock_timeout).and_then(|lock| {
            let mut tx = lock.transaction();
            tx.put(USERS, UserFile::with_admin(admin_secret).encode());
            tx.put(TURN, Turn::Idle.to_string());
            tx.put(DECK, String::new());
            tx.put(DISCARD, String::new());
            tx.commit()
        });
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_dir_all(dir.path()) {
                log::warn!("Could not remove half-created game {}: {}", dir.path().display(), cleanup);
            }
            return Err(err);
        }

        log::info!("Initialized game {} in {}", dir.name(), dir.path().display());
        Ok(Engine { dir, config })
    }

    pub fn open(games_dir: &Path, name: &str, config: EngineConfig) -> Result<Self> {
        let dir = GameDir::open(games_dir, name)?;
        Ok(Engine { dir, config })
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    fn lock(&self, mode: LockMode) -> Result<GameLock<'_>> {
        self.dir.lock(mode, self.config.lock_timeout)
    }

    // Lock, authenticate, run `act` on a copy of the table and commit the
    // result if it is still a valid game
    fn transition<T>(
        &self,
        actor: &Credentials,
        act: impl FnOnce(&mut Table, &[PlayerId], &mut StdRng) -> Result<T>,
        ply: impl FnOnce(&T, &Table) -> PlayLogPly,
    ) -> Result<T> {
        let lock = self.lock(LockMode::Exclusive)?;
        let snapshot = load(&lock)?;
        snapshot.users.require(&actor.user, &actor.secret)?;

        let mut table = snapshot.table.clone();
        let mut rng = self.rng();
        let outcome = act(&mut table, &snapshot.roster, &mut rng)?;
        table.validate()?;
        commit_table(&lock, &snapshot.table, &table)?;

        lock.append_history(&ply(&outcome, &table));
        Ok(outcome)
    }

    // Registry changes, only allowed by admin between games
    fn change_users(
        &self,
        actor: &Credentials,
        action: &str,
        user: &str,
        change: impl FnOnce(&mut UserFile) -> Result<Option<String>>,
    ) -> Result<()> {
        let lock = self.lock(LockMode::Exclusive)?;
        let mut snapshot = load(&lock)?;
        snapshot.users.require(&actor.user, &actor.secret)?;
        if !actor.is_admin() {
            return Err(GameError::AdminRequired(actor.user.clone()));
        }
        if !snapshot.table.turn.is_idle() {
            return Err(GameError::GameInProgress);
        }

        let hand = change(&mut snapshot.users)?;
        let mut tx = lock.transaction();
        tx.put(USERS, snapshot.users.encode());
        match hand {
            Some(contents) => tx.put(user, contents),
            None => tx.remove(user),
        }
        tx.commit()?;

        lock.append_history(&PlayLogPly::new(action, user, &snapshot.table));
        Ok(())
    }

    /// Register a player with an empty hand.
    pub fn add_user(&self, actor: &Credentials, name: &str, secret: &str) -> Result<()> {
        self.change_users(actor, "add-user", name, |users| users.add(name, secret).map(|()| Some(String::new())))?;
        log::info!("Added user {} to {}", name, self.dir.name());
        Ok(())
    }

    /// Unregister a player and drop their hand record.
    pub fn remove_user(&self, actor: &Credentials, name: &str) -> Result<()> {
        self.change_users(actor, "remove-user", name, |users| users.remove(name).map(|()| None))?;
        log::info!("Removed user {} from {}", name, self.dir.name());
        Ok(())
    }

    pub fn start_game(&self, actor: &Credentials) -> Result<PlayerId> {
        let first = self.transition(
            actor,
            |table, roster, rng| {
                if !actor.is_admin() {
                    return Err(GameError::AdminRequired(actor.user.clone()));
                }
                table.start(roster, rng)
            },
            |_, table| PlayLogPly::new("start", &actor.user, table),
        )?;

        log::info!("Started {}, {} goes first", self.dir.name(), first);
        Ok(first)
    }

    fn expect_player(actor: &Credentials) -> Result<()> {
        if actor.is_admin() {
            return Err(GameError::NotAPlayer(actor.user.clone()));
        }
        Ok(())
    }

    pub fn draw_card(&self, actor: &Credentials) -> Result<Card> {
        let card = self.transition(
            actor,
            |table, _, rng| {
                Self::expect_player(actor)?;
                table.draw(&actor.user, rng)
            },
            |_, table| PlayLogPly::new("draw", &actor.user, table),
        )?;

        log::info!("{} drew a card", actor.user);
        Ok(card)
    }

    pub fn pass_turn(&self, actor: &Credentials) -> Result<PlayerId> {
        let next = self.transition(
            actor,
            |table, roster, _| {
                Self::expect_player(actor)?;
                table.pass(&actor.user, roster)
            },
            |_, table| PlayLogPly::new("pass", &actor.user, table),
        )?;

        log::info!("{} passed, {} is next", actor.user, next);
        Ok(next)
    }

    pub fn play_card(&self, actor: &Credentials, token: &str) -> Result<Play> {
        let card: Card = token.trim().parse()?;
        let play = self.transition(
            actor,
            |table, roster, _| {
                Self::expect_player(actor)?;
                table.play(&actor.user, card, roster)
            },
            |play, table| {
                let action = match play {
                    Play::Won { .. } => "win",
                    Play::Continued { .. } => "play",
                };
                PlayLogPly::new(action, &actor.user, table).with_card(card)
            },
        )?;

        match &play {
            Play::Continued { next, .. } => log::info!("{} played {}, {} is next", actor.user, card, next),
            Play::Won { winner, .. } => log::info!("{} won {}, game reset", winner, self.dir.name()),
        }
        Ok(play)
    }

    // Snapshot for read-only operations of a running game
    fn query(&self, actor: &Credentials) -> Result<Snapshot> {
        let lock = self.lock(LockMode::Shared)?;
        let snapshot = load(&lock)?;
        snapshot.users.require(&actor.user, &actor.secret)?;
        if snapshot.table.turn.is_idle() {
            return Err(GameError::GameNotStarted);
        }
        Ok(snapshot)
    }

    /// Cards held by `target`. Players may only look at their own hand, admin
    /// at anyone's.
    pub fn view_hand(&self, actor: &Credentials, target: &str) -> Result<Hand> {
        let snapshot = self.query(actor)?;
        if target == ADMIN {
            return Err(GameError::NotAPlayer(target.to_string()));
        }
        if !snapshot.users.exists(target) {
            return Err(GameError::UnknownUser(target.to_string()));
        }
        if !actor.is_admin() && actor.user != target {
            return Err(GameError::NotPermitted { requester: actor.user.clone(), target: target.to_string() });
        }

        Ok(snapshot.table.hand(target)?.clone())
    }

    pub fn view_turn_order(&self, actor: &Credentials) -> Result<TurnOrder> {
        let snapshot = self.query(actor)?;
        let table = snapshot.table;
        let (current, has_drawn) = match &table.turn {
            Turn::Player { id, has_drawn } => (id.clone(), *has_drawn),
            Turn::Idle => return Err(GameError::GameNotStarted),
        };
        let top = *table
            .top()
            .ok_or_else(|| GameError::CorruptState("discard pile is empty".to_string()))?;

        Ok(TurnOrder {
            seats: snapshot
                .roster
                .iter()
                .map(|p| (p.clone(), table.hands.get(p).map_or(0, |h| h.len())))
                .collect(),
            current,
            has_drawn,
            top,
            deck_size: table.deck.len(),
        })
    }
}
