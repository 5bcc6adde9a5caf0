//! Real-time core: connections, presence, rooms, typing, unread counts,
//! message relay and notification dispatch.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod i18n;
pub mod notify;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod store;
pub mod typing;
pub mod unread;

pub use config::GatewayConfig;
pub use dispatcher::{ConnectionHandle, Dispatcher};
pub use error::GatewayError;
pub use store::{ChatStore, SqliteStore};
pub use unread::Viewer;
