//! # Pollnet
//!
//! Non-blocking TCP connection layer driven by `poll(2)` readiness and a
//! worker-pool task scheduler.
//!
//! ## Architecture
//!
//! - **`pollnet-core`**: message buffers, buffer pool, bounded queues,
//!   scheduler, readiness sockets
//! - **`pollnet-tcp`**: link, session, server and client
//! - **`pollnet`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ### Echo server
//!
//! ```rust,no_run
//! use pollnet::prelude::*;
//!
//! struct Echo;
//!
//! impl SessionHandler<RawSegment> for Echo {
//!     fn on_session_message(&self, session: &Session<RawSegment, Self>, msg: &Message) {
//!         if let Some(mut reply) = session.acquire() {
//!             reply.write(msg.as_slice());
//!             session.send_tcp(reply);
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let scheduler = Scheduler::with_default_workers("echo")?;
//! let server = Server::bind(
//!     ServerConfig::new(7000).with_max_sessions(64),
//!     Handlers::single(&scheduler.handle()),
//!     RawSegment,
//!     Echo,
//! )?;
//! # drop(server);
//! # Ok(())
//! # }
//! ```
//!
//! ### Client
//!
//! ```rust,no_run
//! use pollnet::prelude::*;
//!
//! struct Hello;
//!
//! impl ClientHandler<RawSegment> for Hello {
//!     fn on_connected(&self, client: &Client<RawSegment, Self>) {
//!         if let Some(mut msg) = client.acquire() {
//!             msg.write(b"hello");
//!             client.send_tcp(msg);
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let scheduler = Scheduler::with_default_workers("client")?;
//! let client = Client::new(
//!     ClientConfig::default(),
//!     Handlers::single(&scheduler.handle()),
//!     RawSegment,
//!     Hello,
//! )?;
//! client.connect("127.0.0.1", 7000);
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! Handlers run on scheduler workers. Accept and multiplex loops each keep
//! one `workload` worker busy for up to one poll timeout per run, so give
//! that scheduler at least four workers ([`Scheduler::with_default_workers`]
//! does).
//!
//! [`Scheduler::with_default_workers`]: pollnet_core::scheduler::Scheduler::with_default_workers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use bytes::Bytes;

/// Building blocks: buffers, pool, queues, scheduler, sockets.
pub use pollnet_core as primitives;

/// Link, session, server and client.
pub use pollnet_tcp as tcp;

pub mod dev_tracing;

/// Everything needed to write a server or a client.
pub mod prelude {
    pub use pollnet_core::error::{ConnectError, ListenError, NetError, Result};
    pub use pollnet_core::message::Message;
    pub use pollnet_core::monitor::{SocketEvent, SocketMonitor};
    pub use pollnet_core::options::SocketOptions;
    pub use pollnet_core::pool::MessagePool;
    pub use pollnet_core::scheduler::{Scheduler, SchedulerHandle};
    pub use pollnet_tcp::prelude::*;
}
