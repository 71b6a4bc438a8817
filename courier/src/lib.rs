//! Realtime session core for a one-to-one chat client.
//!
//! A [`session::Session`] owns the inbox and presence sockets plus at most
//! one open [`room::Room`]. Message receipts, typing and presence are kept in
//! plain state types that the socket drivers update.

pub mod api;
pub mod config;
pub mod connection;
pub mod inbox;
pub mod presence;
pub mod receipts;
pub mod room;
pub mod session;
pub mod typing;
