//! Sends a few messages to an echo server and prints the replies.
//!
//! ```text
//! cargo run --example echo_client -- 127.0.0.1 7000
//! ```

use pollnet::prelude::*;
use std::time::Duration;
use tracing::{info, warn};

const ROUNDS: usize = 5;

enum Event {
    Connected,
    Failed(ConnectError),
    Reply(Vec<u8>),
    Disconnected,
}

struct Ping {
    events: flume::Sender<Event>,
}

impl ClientHandler<RawSegment> for Ping {
    fn on_connected(&self, _client: &Client<RawSegment, Self>) {
        let _ = self.events.send(Event::Connected);
    }

    fn on_connection_failed(&self, _client: &Client<RawSegment, Self>, reason: &ConnectError) {
        let _ = self.events.send(Event::Failed(reason.clone()));
    }

    fn on_disconnected(&self, _client: &Client<RawSegment, Self>) {
        let _ = self.events.send(Event::Disconnected);
    }

    fn on_message(&self, _client: &Client<RawSegment, Self>, msg: Message) -> Option<Message> {
        let _ = self.events.send(Event::Reply(msg.as_slice().to_vec()));
        Some(msg)
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_owned());
    let port = args.next().and_then(|p| p.parse().ok()).unwrap_or(7000);

    let (tx, events) = flume::unbounded();
    let scheduler = Scheduler::with_default_workers("echo-client")?;
    let client = Client::new(
        ClientConfig::default().with_connect_timeout(Duration::from_secs(2)),
        Handlers::single(&scheduler.handle()),
        RawSegment,
        Ping { events: tx },
    )?;

    client.connect(&host, port);
    match events.recv_timeout(Duration::from_secs(5))? {
        Event::Connected => info!("Connected to {}:{}", host, port),
        Event::Failed(reason) => return Err(reason.into()),
        _ => return Err("unexpected event".into()),
    }

    for round in 0..ROUNDS {
        let Some(mut msg) = client.acquire() else {
            warn!("Pool exhausted");
            break;
        };
        msg.write(format!("ping {round}").as_bytes());
        client.send_tcp(msg);

        if let Event::Reply(bytes) = events.recv_timeout(Duration::from_secs(2))? {
            info!("Reply: {}", String::from_utf8_lossy(&bytes));
        }
    }

    let stats = client.stats();
    info!(
        "Sent {} bytes, received {} bytes",
        stats.bytes_sent, stats.bytes_received
    );

    client.disconnect();
    while let Ok(event) = events.recv_timeout(Duration::from_secs(2)) {
        if matches!(event, Event::Disconnected) {
            info!("Disconnected");
            break;
        }
    }
    Ok(())
}
