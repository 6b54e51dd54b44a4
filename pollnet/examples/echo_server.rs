//! Echo server.
//!
//! ```text
//! RUST_LOG=debug cargo run --example echo_server -- 7000
//! ```

use pollnet::prelude::*;
use std::time::Duration;
use tracing::info;

struct Echo;

impl SessionHandler<RawSegment> for Echo {
    fn on_session_accepted(&self, session: &Session<RawSegment, Self>) {
        info!("[Session {}] Connected: {:?}", session.id(), session.peer_addr());
    }

    fn on_session_disconnected(&self, session: &Session<RawSegment, Self>) {
        let stats = session.stats();
        info!(
            "[Session {}] Gone after {} bytes in, {} bytes out",
            session.id(),
            stats.bytes_received,
            stats.bytes_sent
        );
    }

    fn on_session_message(&self, session: &Session<RawSegment, Self>, msg: &Message) {
        let Some(mut reply) = session.acquire() else {
            return;
        };
        reply.write(msg.as_slice());
        session.send_tcp(reply);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7000);

    let scheduler = Scheduler::with_default_workers("echo")?;
    let server = Server::bind(
        ServerConfig::new(port)
            .with_max_sessions(64)
            .with_receive_timeout(Duration::from_secs(60)),
        Handlers::single(&scheduler.handle()),
        RawSegment,
        Echo,
    )?;

    let events = server.monitor();
    info!(
        "Echo server on {} with {} workers, Ctrl-C to stop",
        server.local_addr(),
        scheduler.worker_count()
    );
    for event in events.iter() {
        info!("{}", event);
    }
    Ok(())
}
