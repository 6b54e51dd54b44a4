//! Pollnet Core
//!
//! This crate contains the building blocks the connection layer is made of:
//! - Fixed-capacity message buffers (`message`)
//! - Pre-allocated buffer pool (`pool`)
//! - Bounded, non-blocking message queues (`queue`)
//! - Worker-pool task scheduler with repeat and cancel (`scheduler`)
//! - Non-blocking TCP sockets and listeners (`socket`)
//! - `poll(2)` readiness sets (`poll`)
//! - Socket options (`options`)
//! - Lock-free activity timestamps (`clock`)
//! - Lifecycle event monitor (`monitor`)
//! - Error types (`error`)

// The poll module needs raw fd access
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

#[cfg(not(unix))]
compile_error!("pollnet requires a unix target (poll(2) readiness)");

pub mod clock;
pub mod error;
pub mod message;
pub mod monitor;
pub mod options;
pub mod poll;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod socket;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::clock::Timestamp;
    pub use crate::error::{ConnectError, ListenError, NetError, Result};
    pub use crate::message::Message;
    pub use crate::monitor::{SocketEvent, SocketMonitor};
    pub use crate::options::SocketOptions;
    pub use crate::poll::{Interest, Readiness};
    pub use crate::pool::MessagePool;
    pub use crate::queue::MessageQueue;
    pub use crate::scheduler::{Scheduler, SchedulerHandle, Task};
    pub use crate::socket::{TcpListener, TcpSocket, Transport};
}
