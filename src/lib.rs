//! Real-time student/expert chat for the BridgeIT platform.
//!
//! A [`chat::Session`] ties one conversation pair to a live hub connection, fetches the
//! pair's history over REST, and keeps the merged [`chat::Transcript`].

pub mod chat;
pub mod config;
pub mod credentials;
pub mod error;
pub mod hub;

pub use error::{ChatError, Result};
