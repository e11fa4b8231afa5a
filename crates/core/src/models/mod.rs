//! Data models for Quorum

mod appearance;
mod member;
mod message;
mod poll;

pub use appearance::*;
pub use member::*;
pub use message::*;
pub use poll::*;
