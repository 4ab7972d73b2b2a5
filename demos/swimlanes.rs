//! Self-contained demo of swimlane dispatch over the in-memory broker.
//!
//! Five events are published to two swimlanes of the `Account` entity type,
//! interleaved A, B, A, B, A. Lane A handlers take 500ms and lane B
//! handlers take 700ms. Lanes run side by side, so everything finishes in
//! about 1.5s, and acknowledgments still reach the broker in arrival order.
//!
//! Run with: `RUST_LOG=eventuate_client=trace cargo run --example swimlanes`

use std::time::{Duration, Instant};

use eventuate_client::{
    Client, Credentials, DispatchStrategy, EventId, HandlerRegistry, InMemoryTransport,
    Settlement, SubscriberOptions, WireEvent,
};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Payload of an `AccountDebited` event.
#[derive(Debug, Deserialize)]
struct AccountDebited {
    amount: u64,
    delay_ms: u64,
}

fn debit(id: &str, swimlane: u32, amount: u64, delay_ms: u64) -> WireEvent {
    WireEvent {
        id: EventId::from(id),
        event_type: "AccountDebited".to_string(),
        event_data: serde_json::json!({ "amount": amount, "delay_ms": delay_ms }).to_string(),
        entity_id: format!("account-{swimlane}"),
        entity_type: "net.example.banking/Account".to_string(),
        event_token: format!("token-{id}"),
        swimlane,
        offset: 0,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("eventuate_client=info".parse()?))
        .init();

    let transport = InMemoryTransport::new();
    let client = Client::builder()
        .transport(transport.clone())
        .credentials(Credentials::new("demo-key", "demo-secret", "")?)
        .build()?;

    let started = Instant::now();
    let mut registry = HandlerRegistry::new();
    registry.register_typed("Account", "AccountDebited", move |event: AccountDebited, meta| {
        println!(
            "{:>5}ms start {} (lane {}, amount {})",
            started.elapsed().as_millis(),
            meta.id,
            meta.swimlane,
            event.amount
        );
        Settlement::timed(
            Duration::from_millis(event.delay_ms),
            Ok(Value::from(meta.id.to_string())),
        )
    });

    let events = [
        debit("a1", 0, 10, 500),
        debit("b1", 1, 20, 700),
        debit("a2", 0, 30, 500),
        debit("b2", 1, 40, 700),
        debit("a3", 0, 50, 500),
    ];
    for event in &events {
        transport.publish(event)?;
    }

    let subscription = client
        .subscribe(
            "swimlane-demo",
            registry,
            SubscriberOptions::default(),
            DispatchStrategy::Swimlane,
        )
        .await?;

    let acked = transport.wait_for_acks(events.len()).await;
    println!("{:>5}ms acked {}", started.elapsed().as_millis(), acked.join(", "));

    subscription.unsubscribe().await?;
    Ok(())
}
