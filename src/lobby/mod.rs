//! Room list, membership and the pre-game ready gate.

mod error;
mod store;


pub use error::LobbyError;
pub use store::{LobbySnapshot, LobbyStore};
