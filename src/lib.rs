//! Device state synchronization library.
//!
//! Keeps a local mirror of a single shared device record (pill dispenser or
//! power clamp) in sync with a realtime document store, and turns user
//! intents into writes against that record.

pub mod auth;
pub mod config;
pub mod device;
pub mod error;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};
