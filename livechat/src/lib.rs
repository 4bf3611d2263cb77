//! `LiveChat`: realtime messaging client core.
//!
//! Connection lifecycle, optimistic message delivery with a bounded retry
//! queue, presence and typing indicators, and zombie-connection recovery,
//! independent of any UI layer.

pub mod api;
pub mod chat;
pub mod client;
pub mod config;
pub mod connection;
pub mod presence;
pub mod recovery;
pub mod transport;
pub mod typing;
