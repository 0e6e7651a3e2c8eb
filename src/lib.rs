//! Job search client core
//!
//! Chat message reconciliation, the realtime chat hub, REST access and local
//! credential storage for the job search app.

pub mod api;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod message;
pub mod reconciler;
pub mod send;
pub mod signalr;
pub mod storage;

pub use error::{Error, Result};
