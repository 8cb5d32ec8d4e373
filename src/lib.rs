//! precache: a versioned cache-first request interception layer.
//!
//! A [`cache::CacheController`] owns a set of versioned content stores,
//! pre-populates a new version from a manifest, answers requests from the
//! active version first and falls back to the network on a miss.

pub mod cache;
pub mod config;
pub mod logging;
