//! Unix-socket control surface for a running daemon.

pub mod client;
pub mod protocol;
pub mod server;
