//! Quorum Network Library
//!
//! TCP transport for the room engine.
//!
//! # Architecture
//!
//! - **Server**: accepts connections and spawns a reader loop plus a
//!   writer task per client
//! - **Dispatch task**: single owner of the engine; consumes one command
//!   channel so events are processed strictly in order
//! - **Protocol**: length-prefixed JSON events, camelCase `type`-tagged
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(addr, Duration::from_secs(300)).await?;
//!
//! // A client joins a room and reads its identity back
//! let stream = TcpStream::connect(server.addr()).await?;
//! let (mut reader, mut writer) = tokio::io::split(stream);
//! write_frame(&mut writer, &ClientEvent::JoinRoom {
//!     username: "alice".into(),
//!     room: "general".into(),
//! }).await?;
//! let event: ServerEvent = read_frame(&mut reader).await?;
//! ```

pub mod error;
pub mod frame;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};
pub use frame::{read_frame, write_frame};
pub use protocol::{ClientEvent, ServerEvent};
pub use server::Server;

/// Default port for Quorum servers
pub const DEFAULT_PORT: u16 = 3001;
