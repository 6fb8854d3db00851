//! Game state mirror, reconciliation and turn actions for one room.
//!
//! [`GameStore`] holds the cached rows of the room's game and folds change
//! feed deltas, peer broadcasts and poll results into them through one
//! handler. Card plays mutate the cache first, persist, and roll back the
//! local mutation when the write fails.

mod error;
mod guard;
mod optimistic;
mod poller;
pub mod selection;
mod state;
mod store;


pub use error::GameError;
pub use selection::{Selection, TargetSelector};
pub use state::{GameSnapshot, WinnerInfo};
pub use store::GameStore;
