/// Wire and domain types shared by the tvdesk crates.
///
/// Everything here is plain data: the gateway, the persistence layer and the
/// internal HTTP API all speak in these types so none of them depends on the
/// others' internals.
pub mod api;
pub mod events;
pub mod models;
