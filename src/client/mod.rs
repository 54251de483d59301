//! Client side of the room protocol: the real-time transport, the REST
//! fallback, a snapshot cache and the session that ties them together.

pub mod cache;
pub mod connection;
pub mod rest;
pub mod session;

pub use cache::{MessageCache, RoomSource};
pub use connection::{ConnectionManager, ConnectionState, Event};
pub use rest::RestClient;
pub use session::{RoomSession, SendOutcome};
