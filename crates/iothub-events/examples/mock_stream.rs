//! Stream synthetic device telemetry through the full client stack against
//! the in-memory broker.
//!
//! ```text
//! cargo run --example mock_stream -- --partitions 4 --count 20
//! ```

use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use iothub_events::testing::MockBroker;
use iothub_events::{ClientConfig, Event, EventHubClient, Message, SubscribeOptions, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        write!(w, "[{:02}:{:03}]", d.as_secs(), d.subsec_millis())
    }
}

#[derive(Parser)]
#[command(name = "mock_stream", version)]
struct Cli {
    /// Hub name served by the mock broker
    #[arg(long, default_value = "demo-hub")]
    hub: String,
    /// Number of partitions
    #[arg(long, default_value_t = 4)]
    partitions: usize,
    /// Stop after this many events
    #[arg(long, default_value_t = 20)]
    count: usize,
    /// Delay between published messages, in milliseconds
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,
    /// Consumer group to read from
    #[arg(long)]
    consumer_group: Option<String>,
}

fn telemetry(device: &str, seq: usize) -> Message {
    let body = format!(r#"{{"device":"{device}","seq":{seq},"temperature":{}}}"#, 20 + seq % 7);
    let mut msg = Message::with_data(body.into_bytes()).application_property("kind", "telemetry");
    msg.annotations
        .insert("iothub-connection-device-id".into(), Value::from(device));
    msg.annotations
        .insert("iothub-message-source".into(), Value::from("Telemetry"));
    msg.annotations
        .insert("iothub-enqueuedtime".into(), Value::Timestamp(chrono::Utc::now()));
    msg
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();
    let ids: Vec<String> = (0..cli.partitions).map(|p| p.to_string()).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let broker = MockBroker::new(&cli.hub, &id_refs);

    let config = match ClientConfig::from_connection_string(&format!(
        "HostName={};SharedAccessKeyName=service;SharedAccessKey=ZGVtby1rZXk=",
        broker.entry_host()
    )) {
        Ok(mut config) => {
            config.consumer_group = cli.consumer_group.clone();
            config
        }
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let publisher = tokio::spawn({
        let broker = broker.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_millis(cli.interval_ms);
        async move {
            for seq in 0.. {
                let partition = seq % ids.len().max(1);
                let device = format!("device-{partition}");
                broker.publish(&partition.to_string(), telemetry(&device, seq));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    });

    let client = match EventHubClient::new(Arc::new(broker.clone()), config).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut seen = 0;
    let result = client
        .run(&SubscribeOptions::default(), &cancel, |msg| {
            let event = Event::from(msg);
            println!("{}", serde_json::to_string(&event)?);
            seen += 1;
            if seen >= cli.count {
                cancel.cancel();
            }
            Ok(())
        })
        .await;

    cancel.cancel();
    if let Err(e) = publisher.await {
        tracing::warn!("publisher task failed: {e}");
    }

    match result {
        Ok(()) | Err(iothub_events::Error::Cancelled) => {
            tracing::info!(events = seen, token_puts = broker.token_puts().len(), "done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
