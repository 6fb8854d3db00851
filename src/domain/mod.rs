//! Core domain types and rules for the Dirty Pig client.

pub mod cards;
pub mod effects;
pub mod rules;
pub mod targeting;
pub mod types;

pub use cards::{card_info, CardInfo, HAND_SIZE};
pub use effects::{EffectError, PigPatch};
pub use rules::WinCondition;
pub use types::*;
