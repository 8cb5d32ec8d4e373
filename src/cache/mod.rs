//! Versioned cache-first request interception.
//!
//! This module provides:
//! - Named content stores, one per version tag ("generation")
//! - Pre-population of a generation from a manifest before it goes live
//! - Cache-first answers with network fallback and best-effort write-back
//! - Retirement of replaced generations after a grace period

mod controller;
mod error;
mod generation;
mod hook;
mod key;
mod network;
mod snapshot;
mod storage;

pub use controller::{CacheController, ControllerSettings};
pub use error::{CacheError, NetworkError};
pub use generation::GenerationState;
pub use hook::{HookDecision, Interceptor};
pub use key::RequestKey;
pub use network::{HttpNetwork, Network};
pub use snapshot::{PendingRequest, Resolution, ResponseSnapshot, Served, ServedFrom};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
