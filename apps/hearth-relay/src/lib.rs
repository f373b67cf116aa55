//! Live sync relay for Hearth households.
//!
//! Devices hold one WebSocket each. After a `USER_REGISTRATION` handshake the
//! relay answers their requests against a [`store::CareStore`], fans every
//! mutation out to the user's other live devices and hands it to a
//! [`sync::SyncCollaborator`] for linked accounts. A heartbeat evicts devices
//! that stop answering probes.

pub mod agenda;
pub mod audit;
pub mod broadcast;
pub mod config;
pub mod error;
mod handlers;
pub mod heartbeat;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;
pub mod telemetry;
mod websocket;

pub use config::{Cli, RelayConfig};
pub use error::RelayError;
pub use state::AppState;
