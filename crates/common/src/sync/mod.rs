//! # Replication
//!
//! Delta-based sync between replicas through an untrusted relay:
//!
//! - [`delta`]: the wire types (encrypted deltas, cursors, quarantine)
//! - [`relay`]: the transport seam and the in-process relay
//! - [`engine`]: local writes, merge application, and the sync loop

pub mod delta;
pub mod engine;
pub mod relay;

pub use delta::{CorruptDelta, Cursor, EncryptedDelta};
pub use engine::{ApplyReport, SyncEngine, SyncError, MAX_BACKOFF, PULL_PAGE_SIZE};
pub use relay::{
    DeltaPage, GrantWindow, MemoryRelay, MemoryRelayClient, MemoryRelayError, RelayError,
    RelayTransport,
};
