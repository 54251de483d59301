pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod generation;
pub mod hub;
pub mod message;
pub mod messages;
pub mod retry;
pub mod room;
pub mod router;
pub mod server;
pub mod store;
pub mod turn;

pub use error::{ChatError, ConnectionError, Result};
pub use server::Server;
