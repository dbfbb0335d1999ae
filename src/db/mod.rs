//! Database module for Peanut Monitor.
//!
//! Provides SQLite storage with embedded migrations and credential sealing.

mod crypto;
mod models;
mod store;

pub use crypto::*;
pub use models::*;
pub use store::*;
