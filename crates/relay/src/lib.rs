//! Tally relay: untrusted store-and-forward for encrypted deltas
//!
//! Devices push and pull [`EncryptedDelta`](common::sync::EncryptedDelta)
//! batches per company; the relay stores them blind, assigns monotone
//! cursors, and filters what it serves using grant windows replayed from
//! the plaintext index fields of access-ledger deltas. It never holds key
//! material and never opens a payload.

pub mod client;
pub mod http;
pub mod state;
pub mod store;

pub use client::{ApiError, HttpRelay};
pub use state::{RelayState, RelayStateError};
pub use store::{DeltaStore, DeltaStoreError, MemoryDeltaStore, RawPage, SqliteDeltaStore};
