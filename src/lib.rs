pub mod backend;
pub mod config;
pub mod context;
pub mod domain;
pub mod game;
pub mod lobby;
pub mod logging;
pub mod realtime;
pub mod session;
pub mod tokio_tools;

#[cfg(test)]
pub mod test_utils;

pub use context::AppContext;
