use std::fmt;
use std::str::FromStr;

use crate::error::GameError;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Suit {
    Hearts, Diamonds, Clubs, Spades,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Rank {
    Two, Three, Four, Five, Six, Seven, Eight, Nine, Ten, Jack, Queen, King, Ace,
}

pub const SUITS: [Suit; 4] = [Suit::Hearts, Suit::Diamonds, Suit::Clubs, Suit::Spades];
pub const RANKS: [Rank; 13] = [
    Rank::Two, Rank::Three, Rank::Four, Rank::Five, Rank::Six, Rank::Seven, Rank::Eight,
    Rank::Nine, Rank::Ten, Rank::Jack, Rank::Queen, Rank::King, Rank::Ace,
];

pub const DECK_SIZE: usize = SUITS.len() * RANKS.len();

impl Suit {
    pub fn letter(self) -> char {
        match self {
            Self::Hearts => 'H',
            Self::Diamonds => 'D',
            Self::Clubs => 'C',
            Self::Spades => 'S',
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Self::Hearts => '♥',
            Self::Diamonds => '♦',
            Self::Clubs => '♣',
            Self::Spades => '♠',
        }
    }

    fn from_letter(letter: char) -> Option<Self> {
        SUITS.into_iter().find(|s| s.letter() == letter)
    }
}

impl Rank {
    pub fn token(self) -> &'static str {
        match self {
            Self::Two => "2",
            Self::Three => "3",
            Self::Four => "4",
            Self::Five => "5",
            Self::Six => "6",
            Self::Seven => "7",
            Self::Eight => "8",
            Self::Nine => "9",
            Self::Ten => "10",
            Self::Jack => "J",
            Self::Queen => "Q",
            Self::King => "K",
            Self::Ace => "A",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        RANKS.into_iter().find(|r| r.token() == token)
    }

    // Penalty points a card left in hand is worth when someone else goes out
    pub fn points(self) -> u32 {
        match self {
            Self::Jack | Self::Queen | Self::King | Self::Ace => 10,
            numeral => numeral.token().parse().unwrap_or(0),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Card {
    pub suit: Suit,
    pub rank: Rank,
}

impl Card {
    pub fn new(suit: Suit, rank: Rank) -> Self {
        Self { suit, rank }
    }

    /// Tell if this card can go on top of `top`. Eights are wild and go on
    /// anything, otherwise suit or rank has to match.
    pub fn is_playable(&self, top: &Card) -> bool {
        self.rank == top.rank || self.suit == top.suit || self.rank == Rank::Eight
    }

    /// Human readable form, e.g. `10♠`.
    pub fn pretty(&self) -> String {
        format!("{}{}", self.rank.token(), self.suit.symbol())
    }
}

/// All 52 cards in suit-major order.
pub fn full_deck() -> Vec<Card> {
    SUITS
        .iter()
        .flat_map(|&suit| RANKS.iter().map(move |&rank| Card::new(suit, rank)))
        .collect()
}

// Canonical record encoding: suit letter followed by rank token
impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.suit.letter(), self.rank.token())
    }
}

impl FromStr for Card {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GameError::InvalidCardToken(s.to_string());

        let mut chars = s.chars();
        let suit = chars.next().and_then(Suit::from_letter);
        let rank = Rank::from_token(chars.as_str());

        match (suit, rank) {
            (Some(suit), Some(rank)) => Ok(Card::new(suit, rank)),
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(token: &str) -> Card {
        token.parse().unwrap()
    }

    #[test]
    fn test_decode_valid_tokens() {
        assert_eq!(card("H2"), Card::new(Suit::Hearts, Rank::Two));
        assert_eq!(card("S10"), Card::new(Suit::Spades, Rank::Ten));
        assert_eq!(card("CA"), Card::new(Suit::Clubs, Rank::Ace));
        assert_eq!(card("DQ"), Card::new(Suit::Diamonds, Rank::Queen));
    }

    #[test]
    fn test_every_card_survives_encoding() {
        for c in full_deck() {
            assert_eq!(card(&c.to_string()), c);
        }
    }

    #[test]
    fn test_decode_rejects_malformed_tokens() {
        for token in ["", "H", "X2", "H1", "H11", "h2", "2H", "S100", "HJQ", " H2", "♥2", "H 2"] {
            assert!(
                matches!(token.parse::<Card>(), Err(GameError::InvalidCardToken(t)) if t == token),
                "{:?} should not decode",
                token
            );
        }
    }

    #[test]
    fn test_playability() {
        let top = card("H5");
        assert!(card("H9").is_playable(&top));
        assert!(card("S5").is_playable(&top));
        assert!(card("C8").is_playable(&top));
        assert!(!card("C9").is_playable(&top));
        assert!(!card("DK").is_playable(&top));
    }

    #[test]
    fn test_eights_are_only_wild_one_way() {
        // Anything goes on an eight only if it matches the eight's suit or rank
        let top = card("S8");
        assert!(card("S2").is_playable(&top));
        assert!(card("D8").is_playable(&top));
        assert!(!card("D2").is_playable(&top));
    }

    #[test]
    fn test_full_deck_is_unique() {
        let mut deck = full_deck();
        assert_eq!(deck.len(), DECK_SIZE);
        deck.sort();
        deck.dedup();
        assert_eq!(deck.len(), 52);
    }

    #[test]
    fn test_points() {
        assert_eq!(Rank::Two.points(), 2);
        assert_eq!(Rank::Eight.points(), 8);
        assert_eq!(Rank::Ten.points(), 10);
        assert_eq!(Rank::Queen.points(), 10);
        assert_eq!(Rank::Ace.points(), 10);
    }
}
