//! Shared leaf utilities for the tenant execution supervisor.
//!
//! Nothing in here knows about the wire protocol or the cache; these are the
//! primitives the rest of the workspace builds on.

/// Blocking 8-byte event counter (eventfd on Linux, pipe elsewhere).
pub mod event_counter;

/// Tenant identity and preshared key types.
pub mod id;

/// `tracing` subscriber bootstrap shared by the binaries.
pub mod logging;

/// Generic comparator-driven binary heap with a bounded mode.
pub mod minheap;
