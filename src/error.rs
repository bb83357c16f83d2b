use std::path::PathBuf;

use thiserror::Error;

use crate::games::cards::Card;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    Validation,
    Precondition,
    Contention,
    Unrecoverable,
    Io,
}

impl ErrorCategory {
    // Distinct process exit status per category so callers can tell a retry
    // from an abort
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Io => 1,
            Self::Validation => 2,
            Self::Precondition => 3,
            Self::Contention => 4,
            Self::Unrecoverable => 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum GameError {
    #[error("invalid card token: {0:?}")]
    InvalidCardToken(String),
    #[error("user doesn't exist: {0}")]
    UnknownUser(String),
    #[error("invalid username {0:?}: use 1-32 letters, digits, '-' or '_'")]
    InvalidUserName(String),
    #[error("username {0:?} is reserved")]
    ReservedUserName(String),
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("maximum number of players reached ({0})")]
    TooManyUsers(usize),
    #[error("password is incorrect for {0}")]
    AuthenticationFailed(String),
    #[error("malformed record {record}: {reason}")]
    MalformedRecord { record: String, reason: String },
    #[error("{0} is not a player in this game")]
    NotAPlayer(String),
    #[error("game already exists: {0}")]
    GameExists(String),
    #[error("game doesn't exist: {0}")]
    NoSuchGame(String),
    #[error("invalid game name {0:?}: use letters, digits, '-' or '_'")]
    InvalidGameName(String),

    #[error("it is {current}'s turn, not {player}'s")]
    NotYourTurn { player: String, current: String },
    #[error("{0} has already drawn this turn")]
    AlreadyDrawn(String),
    #[error("{0} must draw a card before passing")]
    MustDrawFirst(String),
    #[error("card {0} is not in your hand")]
    CardNotInHand(Card),
    #[error("card {card} cannot be played on {top}")]
    CardNotPlayable { card: Card, top: Card },
    #[error("game is already in progress")]
    GameInProgress,
    #[error("game has not been started")]
    GameNotStarted,
    #[error("not enough players to start: {found} registered, at least {required} required")]
    InsufficientPlayers { found: usize, required: usize },
    #[error("only admin can do this, not {0}")]
    AdminRequired(String),
    #[error("{requester} cannot view the cards of {target}")]
    NotPermitted { requester: String, target: String },

    #[error("game is busy, lock not acquired within {0} ms; try again")]
    GameBusy(u128),

    #[error("deck is empty and the discard pile has no cards to reshuffle; admin must reset the game")]
    EmptyDiscardPile,
    #[error("game state is corrupt: {0}")]
    CorruptState(String),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GameError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn malformed(record: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord { record: record.into(), reason: reason.into() }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidCardToken(_)
            | Self::UnknownUser(_)
            | Self::InvalidUserName(_)
            | Self::ReservedUserName(_)
            | Self::UserExists(_)
            | Self::TooManyUsers(_)
            | Self::AuthenticationFailed(_)
            | Self::MalformedRecord { .. }
            | Self::NotAPlayer(_)
            | Self::GameExists(_)
            | Self::NoSuchGame(_)
            | Self::InvalidGameName(_) => ErrorCategory::Validation,

            Self::NotYourTurn { .. }
            | Self::AlreadyDrawn(_)
            | Self::MustDrawFirst(_)
            | Self::CardNotInHand(_)
            | Self::CardNotPlayable { .. }
            | Self::GameInProgress
            | Self::GameNotStarted
            | Self::InsufficientPlayers { .. }
            | Self::AdminRequired(_)
            | Self::NotPermitted { .. } => ErrorCategory::Precondition,

            Self::GameBusy(_) => ErrorCategory::Contention,

            Self::EmptyDiscardPile | Self::CorruptState(_) => ErrorCategory::Unrecoverable,

            Self::Io { .. } => ErrorCategory::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, GameError>;
