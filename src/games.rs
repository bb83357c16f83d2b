use crate::error::Result;

pub mod cards;
pub mod crazy_eights;

// Check the invariants a game state has to hold between any two transitions
pub trait Validate {
    fn validate(&self) -> Result<()>;
}
