//! # Pollnet TCP
//!
//! Poll-driven TCP connections on top of `pollnet-core`.
//!
//! ## Layers
//!
//! - **[`link`]**: one socket, resumable send/receive state machines and
//!   bounded queues, faults reported through [`link::LinkCallback`]
//! - **[`session`]**: a reusable connection slot of a server
//! - **[`server`]**: listener, slot table, accept loop and multiplexer
//! - **[`client`]**: one outbound connection with a connect/disconnect
//!   state machine
//!
//! Message boundaries come from a [`framing::Framing`]; the default
//! [`framing::RawSegment`] treats every read as one message.
//!
//! All work runs as [`pollnet_core::scheduler::Task`]s on the schedulers
//! named in [`handlers::Handlers`]. Nothing here blocks longer than one poll
//! timeout.

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]

pub mod client;
pub mod config;
pub mod framing;
pub mod handlers;
pub mod link;
pub mod server;
pub mod session;

pub use client::{Client, ClientHandler, ConnectionState};
pub use link::{Link, LinkCallback, LinkStats};
pub use server::Server;
pub use session::{Session, SessionHandler};

pub mod prelude {
    pub use crate::client::{Client, ClientHandler, ConnectionState};
    pub use crate::config::{ClientConfig, LinkConfig, ServerConfig};
    pub use crate::framing::{Framing, RawSegment};
    pub use crate::handlers::Handlers;
    pub use crate::link::{Link, LinkCallback, LinkStats, NoCallback};
    pub use crate::server::Server;
    pub use crate::session::{Session, SessionHandler};
    pub use pollnet_core::message::Message;
}
