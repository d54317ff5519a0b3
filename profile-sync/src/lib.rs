//! # profile-sync: Live profile documents over relay nodes
//!
//! Keeps small shared JSON records ("profiles") in sync between relay nodes
//! and the clients reading them, using CRDT synchronization for writers and
//! out-of-band pushes for read-only observers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐                      ┌─────────────┐
//! │ SubscriptionManager │                      │ RelayServer │
//! │  ├ Replica (room)   │ ◄── WebSocket ─────► │  ├ ProfileDoc│
//! │  │  ├ RelayLink     │   binary sync +      │  ├ Observer │
//! │  │  └ poll loop     │   text pushes        │  └ Broadcast│
//! │  └ DiskCache        │                      │    Group    │
//! └─────────────────────┘                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Room ids, roles, bincode sync frames, JSON pushes
//! - [`document`]: Opaque JSON documents and the yrs container holding them
//! - [`broadcast`]: Role-aware per-room fan-out
//! - [`server`]: Relay node
//! - [`client`]: Outbound relay link
//! - [`cache`]: Per-room disk cache
//! - [`probe`]: Relay health probe
//! - [`replica`]: Client-side live copy with listeners
//! - [`manager`]: Read resolution, subscriptions, publishing

pub mod protocol;
pub mod document;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod cache;
pub mod probe;
pub mod replica;
pub mod manager;
pub mod error;

// Re-exports for convenience
pub use protocol::{MessageType, ProtocolError, PushMessage, Role, RoomId, SyncMessage};
pub use document::{Document, ProfileDoc};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomChannel, RoomEvent, RoomRegistry};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::RelayLink;
pub use cache::{CacheEntry, DiskCache};
pub use probe::HealthProber;
pub use replica::{Listener, ReadyFuture, Replica, ReplicaState};
pub use manager::{ManagerConfig, ReplicaRegistry, Subscription, SubscriptionManager};
pub use error::{ListenerError, RelayError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
