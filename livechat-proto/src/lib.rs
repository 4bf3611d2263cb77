//! Shared protocol definitions for the `LiveChat` realtime channel.

pub mod chat;
pub mod codec;
pub mod events;
pub mod message;
pub mod typing;
