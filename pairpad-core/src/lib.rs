//! # pairpad-core — collaborative document model
//!
//! The CRDT document shared by every participant of a room: a table of text
//! files plus room-level configuration, built on Yrs so that concurrent
//! edits from any number of replicas merge deterministically without
//! coordination.
//!
//! The network layer lives in `pairpad-collab`; this crate is transport-free
//! and usable on its own (the relay server holds one [`Document`] per room
//! as the in-memory authority, the sync client holds one per connection).

pub mod document;

pub use document::{Document, DocumentError, FileHandle, UpdateOrigin};

// Observation handles are plain Yrs subscriptions; re-exported so consumers
// can store them without depending on yrs directly.
pub use yrs::Subscription;
