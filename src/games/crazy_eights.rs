use super::cards::{full_deck, Card, DECK_SIZE};
use super::Validate;
use crate::error::{GameError, Result};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use rand::{seq::SliceRandom, Rng};

pub const ADMIN: &str = "admin";
pub const HAND_SIZE: usize = 5;
pub const MIN_PLAYERS: usize = 2;

pub type PlayerId = String;
pub type Hand = Vec<Card>;

/// Who is to act. `Idle` means no game is running, which is persisted as the
/// bare admin identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Turn {
    Idle,
    Player { id: PlayerId, has_drawn: bool },
}

impl Turn {
    fn first(id: &str) -> Self {
        Turn::Player { id: id.to_string(), has_drawn: false }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Turn::Idle)
    }
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Turn::Idle => write!(f, "{}", ADMIN),
            Turn::Player { id, has_drawn } => write!(f, "{},{}", id, *has_drawn as u8),
        }
    }
}

impl FromStr for Turn {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == ADMIN {
            return Ok(Turn::Idle);
        }

        let (id, flag) = s
            .split_once(',')
            .ok_or_else(|| GameError::malformed("turn", format!("expected <player>,<0|1>, found {:?}", s)))?;
        let has_drawn = match flag {
            "0" => false,
            "1" => true,
            other => return Err(GameError::malformed("turn", format!("bad drawn flag {:?}", other))),
        };

        match id {
            "" => Err(GameError::malformed("turn", "missing player")),
            ADMIN => Ok(Turn::Idle),
            id => Ok(Turn::Player { id: id.to_string(), has_drawn }),
        }
    }
}

// One token per line, in pile order
pub fn encode_cards(cards: &[Card]) -> String {
    cards.iter().map(|c| format!("{}\n", c)).collect()
}

pub fn decode_cards(record: &str, contents: &str) -> Result<Vec<Card>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.parse::<Card>().map_err(|err| GameError::malformed(record, err.to_string())))
        .collect()
}

/// Penalty points of the cards left in a hand.
pub fn score(hand: &[Card]) -> u32 {
    hand.iter().map(|c| c.rank.points()).sum()
}

pub fn new_shuffled_deck<R: Rng + ?Sized>(rng: &mut R) -> Vec<Card> {
    let mut deck = full_deck();
    deck.shuffle(rng);
    deck
}

/// Recycle everything but the top of the discard pile into the deck. The deck
/// is expected to be exhausted. With fewer than two discarded cards there is
/// nothing to recycle and no legal draw exists.
pub fn reshuffle_from_discard<R: Rng + ?Sized>(deck: &mut Vec<Card>, discard: &mut Vec<Card>, rng: &mut R) -> Result<()> {
    if discard.len() < 2 {
        return Err(GameError::EmptyDiscardPile);
    }

    let top = discard.split_off(discard.len() - 1);
    deck.append(discard);
    deck.shuffle(rng);
    *discard = top;

    log::debug!("Reshuffled {} cards back into the deck", deck.len());
    Ok(())
}

// Roster successor of `current`, wrapping around to the first player
fn next_player(roster: &[PlayerId], current: &str) -> Result<PlayerId> {
    let idx = roster
        .iter()
        .position(|p| p == current)
        .ok_or_else(|| GameError::NotAPlayer(current.to_string()))?;
    Ok(roster[(idx + 1) % roster.len()].clone())
}

fn take_top(deck: &mut Vec<Card>) -> Result<Card> {
    deck.pop().ok_or_else(|| GameError::CorruptState("deck ran out while dealing".to_string()))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Play {
    Continued { card: Card, next: PlayerId },
    Won { winner: PlayerId, card: Card, scores: Vec<(PlayerId, u32)> },
}

/// In-memory snapshot of one game's piles, hands and turn. Transitions either
/// return an error leaving the table untouched or apply completely.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Table {
    pub turn: Turn,
    // Next card to draw is the last one
    pub deck: Vec<Card>,
    // Active top card is the last one
    pub discard: Vec<Card>,
    pub hands: BTreeMap<PlayerId, Hand>,
}

impl Table {
    pub fn new(roster: &[PlayerId]) -> Self {
        Table {
            turn: Turn::Idle,
            deck: Vec::new(),
            discard: Vec::new(),
            hands: roster.iter().map(|p| (p.clone(), Vec::new())).collect(),
        }
    }

    pub fn top(&self) -> Option<&Card> {
        self.discard.last()
    }

    pub fn hand(&self, player: &str) -> Result<&Hand> {
        self.hands.get(player).ok_or_else(|| GameError::NotAPlayer(player.to_string()))
    }

    // Check that `player` is to act and tell whether they have drawn already
    fn expect_turn(&self, player: &str) -> Result<bool> {
        match &self.turn {
            Turn::Idle => Err(GameError::GameNotStarted),
            Turn::Player { id, .. } if id != player => Err(GameError::NotYourTurn {
                player: player.to_string(),
                current: id.clone(),
            }),
            Turn::Player { has_drawn, .. } => Ok(*has_drawn),
        }
    }

    /// Deal a fresh game. Cards go round the table one at a time until every
    /// player has a full hand, then one card seeds the discard pile.
    pub fn start<R: Rng + ?Sized>(&mut self, roster: &[PlayerId], rng: &mut R) -> Result<PlayerId> {
        if !self.turn.is_idle() {
            return Err(GameError::GameInProgress);
        }
        if roster.len() < MIN_PLAYERS {
            return Err(GameError::InsufficientPlayers { found: roster.len(), required: MIN_PLAYERS });
        }
        if roster.len() * HAND_SIZE >= DECK_SIZE {
            return Err(GameError::TooManyUsers(roster.len()));
        }

        let mut deck = new_shuffled_deck(rng);
        let mut hands: BTreeMap<PlayerId, Hand> = roster
            .iter()
            .map(|p| (p.clone(), Vec::with_capacity(HAND_SIZE)))
            .collect();

        for _ in 0..HAND_SIZE {
            for player in roster {
                let card = take_top(&mut deck)?;
                if let Some(hand) = hands.get_mut(player) {
                    hand.push(card);
                }
            }
        }
        let seed = take_top(&mut deck)?;

        let first = roster[0].clone();
        self.turn = Turn::first(&first);
        self.deck = deck;
        self.discard = vec![seed];
        self.hands = hands;
        Ok(first)
    }

    pub fn draw<R: Rng + ?Sized>(&mut self, player: &str, rng: &mut R) -> Result<Card> {
        if self.expect_turn(player)? {
            return Err(GameError::AlreadyDrawn(player.to_string()));
        }
        self.hand(player)?;

        if self.deck.is_empty() {
            reshuffle_from_discard(&mut self.deck, &mut self.discard, rng)?;
        }
        let card = self.deck.pop().ok_or(GameError::EmptyDiscardPile)?;

        if let Some(hand) = self.hands.get_mut(player) {
            hand.push(card);
        }
        self.turn = Turn::Player { id: player.to_string(), has_drawn: true };
        Ok(card)
    }

    pub fn pass(&mut self, player: &str, roster: &[PlayerId]) -> Result<PlayerId> {
        if !self.expect_turn(player)? {
            return Err(GameError::MustDrawFirst(player.to_string()));
        }

        let next = next_player(roster, player)?;
        self.turn = Turn::first(&next);
        Ok(next)
    }

    pub fn play(&mut self, player: &str, card: Card, roster: &[PlayerId]) -> Result<Play> {
        self.expect_turn(player)?;

        let idx = self
            .hand(player)?
            .iter()
            .position(|&c| c == card)
            .ok_or(GameError::CardNotInHand(card))?;
        let top = *self
            .top()
            .ok_or_else(|| GameError::CorruptState("discard pile is empty".to_string()))?;
        if !card.is_playable(&top) {
            return Err(GameError::CardNotPlayable { card, top });
        }
        let next = next_player(roster, player)?;

        let hand = self
            .hands
            .get_mut(player)
            .ok_or_else(|| GameError::NotAPlayer(player.to_string()))?;
        hand.remove(idx);
        let has_won = hand.is_empty();
        self.discard.push(card);

        if has_won {
            let scores = roster
                .iter()
                .filter(|p| p.as_str() != player)
                .map(|p| (p.clone(), self.hands.get(p).map_or(0, |h| score(h))))
                .collect();
            self.reset();
            return Ok(Play::Won { winner: player.to_string(), card, scores });
        }

        self.turn = Turn::first(&next);
        Ok(Play::Continued { card, next })
    }

    // Back to idle, ready for a new deal
    fn reset(&mut self) {
        self.turn = Turn::Idle;
        self.deck.clear();
        self.discard.clear();
        for hand in self.hands.values_mut() {
            hand.clear();
        }
    }

    pub fn card_count(&self) -> usize {
        self.deck.len() + self.discard.len() + self.hands.values().map(|h| h.len()).sum::<usize>()
    }
}

impl Validate for Table {
    fn validate(&self) -> Result<()> {
        match &self.turn {
            Turn::Idle => {
                if self.card_count() != 0 {
                    return Err(GameError::CorruptState(format!(
                        "no game is running but {} cards are still out",
                        self.card_count()
                    )));
                }
            }
            Turn::Player { id, .. } => {
                if !self.hands.contains_key(id) {
                    return Err(GameError::CorruptState(format!("current player {} has no seat", id)));
                }
                if self.discard.is_empty() {
                    return Err(GameError::CorruptState("discard pile is empty".to_string()));
                }

                let count = self.card_count();
                let unique: HashSet<&Card> = self
                    .deck
                    .iter()
                    .chain(self.discard.iter())
                    .chain(self.hands.values().flatten())
                    .collect();
                if count != DECK_SIZE || unique.len() != DECK_SIZE {
                    return Err(GameError::CorruptState(format!(
                        "expected {} distinct cards in play, found {} ({} distinct)",
                        DECK_SIZE,
                        count,
                        unique.len()
                    )));
                }
            }
        }

        Ok(())
    }
}
