//! Shared protocol definitions for the `Courier` realtime wire format.

pub mod codec;
pub mod event;
pub mod message;
pub mod presence;
pub mod thread;
