//! Which scheduler runs which kind of work.

use pollnet_core::scheduler::SchedulerHandle;

/// Scheduler routing for servers and clients.
///
/// - `connection`: lifecycle notifications (accepted, connected,
///   disconnected, connection failed)
/// - `workload`: I/O loops, write tasks and watchdogs
/// - `message`: delivery of received messages to the application
///
/// Accept and multiplex loops each occupy a `workload` worker for up to one
/// poll timeout per run, so give that scheduler a few workers.
#[derive(Debug, Clone)]
pub struct Handlers {
    pub connection: SchedulerHandle,
    pub workload: SchedulerHandle,
    pub message: SchedulerHandle,
}

impl Handlers {
    #[must_use]
    pub const fn new(
        connection: SchedulerHandle,
        workload: SchedulerHandle,
        message: SchedulerHandle,
    ) -> Self {
        Self {
            connection,
            workload,
            message,
        }
    }

    /// Route everything to one scheduler.
    #[must_use]
    pub fn single(handle: &SchedulerHandle) -> Self {
        Self {
            connection: handle.clone(),
            workload: handle.clone(),
            message: handle.clone(),
        }
    }
}
