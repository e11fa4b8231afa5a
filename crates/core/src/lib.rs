//! Quorum Core Library
//!
//! The in-memory session/room engine behind the chat server: rooms and
//! membership with a single-admin invariant, the per-room message log
//! (edit/delete/pin/read-receipts/mentions), the poll lifecycle, and
//! per-room appearance state.
//!
//! The engine is transport-agnostic: operations return [`Effect`] lists
//! describing what to deliver where, and the network layer executes them.

pub mod error;
pub mod events;
pub mod invariants;
pub mod mention;
pub mod models;
pub mod store;

pub use error::{ActionKind, Error, Result};
pub use events::{Effect, ServerEvent};
pub use models::*;
pub use store::{RoomStore, DEFAULT_EDIT_WINDOW_SECS};
