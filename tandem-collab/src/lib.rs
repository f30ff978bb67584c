//! # tandem-collab: field synchronization between editing windows
//!
//! Keeps every open window of one CMS document in step: who is here, which
//! fields someone else is editing, and what changed where.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  whispers (JSON)  ┌──────────────┐  whispers  ┌─────────────┐
//! │ Workspace A │ ◄───────────────► │ presence hub │ ◄────────► │ Workspace B │
//! │ (per window)│                   │ / WS relay   │            │ (per window)│
//! └──────┬──────┘                   └──────────────┘            └──────┬──────┘
//!        │ persist / fetch                                             │
//!        ▼                                                             ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │ StateCache  (values + meta per reference/site, TTL)                      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Whispers are best effort. The cache is the rendezvous point: large
//! changes are only announced, and every window refetches on join,
//! visibility and reconnect.
//!
//! ## Modules
//!
//! - [`workspace`]: the per-window engine and its handle
//! - [`presence`], [`locks`], [`changes`], [`merge`]: engine state
//! - [`protocol`]: whisper messages and relay frames
//! - [`chunking`], [`transport`]: size-limited delivery
//! - [`hub`], [`relay`], [`client`]: transports
//! - [`cache`]: persisted state (HTTP and in-memory)
//! - [`document`], [`notify`]: host boundaries

pub mod cache;
pub mod changes;
pub mod chunking;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod locks;
pub mod merge;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod timers;
pub mod transport;
pub mod window;
pub mod workspace;

// Re-exports for convenience
pub use cache::{CacheUpdate, CachedState, HttpStateCache, MemoryCacheService, MemoryStateCache, StateCache};
pub use changes::SaveStatus;
pub use client::{ConnectionState, WsTransport};
pub use config::WorkspaceConfig;
pub use document::{DocumentStore, FieldChange, MemoryDocument};
pub use error::{CacheError, ProtocolError, TransportError, WorkspaceError};
pub use hub::{HubStats, HubTransport, LocalHub};
pub use notify::{BlockingModal, LogNotifier, Notifier, RecordingNotifier, StatusSnapshot, Toast};
pub use protocol::{FieldKind, FieldMap, RelayFrame, User, WhisperMessage};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use transport::{Transport, TransportEvent};
pub use window::WindowId;
pub use workspace::{Workspace, WorkspaceHandle, WorkspaceStatus};
