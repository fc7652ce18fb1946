use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use commit_event_store::config::{AppConfig, Backend};
use commit_event_store::event_sourcing::{
    DocumentStore, DomainEventMessage, DomainSnapshot, EventStorageEngine, MemoryDocumentStore, ReadMode,
    RevisionUpcaster, ScyllaDocumentStore, TrackingToken, UpcasterChain,
};
use commit_event_store::metrics::{start_metrics_server, EventStoreMetrics};
use commit_event_store::utils::{retry_on_transient, RetryConfig};

const ACCOUNT: &str = "Account";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,commit_event_store=debug")),
        )
        .init();

    tracing::info!("🚀 Starting Commit Event Store demo");

    let config = AppConfig::from_env()?;
    tracing::info!(backend = ?config.backend, engine = ?config.engine, "Loaded configuration");

    // === 1. Metrics ===
    let metrics = Arc::new(EventStoreMetrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(start_metrics_server(metrics_registry, metrics_port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 2. Document store ===
    let store: Arc<dyn DocumentStore> = match config.backend {
        Backend::Memory => {
            tracing::info!("Using in-memory document store");
            Arc::new(MemoryDocumentStore::new())
        }
        Backend::Scylla => {
            let store = retry_on_transient(RetryConfig::connection(), |_attempt| {
                ScyllaDocumentStore::connect(&config.scylla)
            })
            .await
            .into_result()?;
            Arc::new(store)
        }
    };

    // === 3. Engine ===
    // Deposits were first recorded in whole units; revision 2 stores cents
    let upcasters = UpcasterChain::new().with(RevisionUpcaster::new(
        "FundsDeposited",
        None,
        Some("2"),
        |payload| {
            let amount = payload["amount"]
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("legacy deposit without amount"))?;
            Ok(json!({ "amount_cents": amount * 100 }))
        },
    ));

    let engine = EventStorageEngine::builder(store)
        .config(config.engine.clone())
        .upcaster_chain(upcasters)
        .metrics(metrics.clone())
        .build();

    // === 4. Follow the global stream from the current head ===
    let head = engine.create_head_token().await?;
    let mut stream = engine.read_events(head, ReadMode::Follow);
    let subscription = stream.subscription();

    let consumer = tokio::spawn(async move {
        let mut last_token: Option<TrackingToken> = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(tracked) => {
                    tracing::info!(
                        aggregate_id = %tracked.event.aggregate_id,
                        sequence_number = tracked.event.sequence_number,
                        payload_type = %tracked.event.payload_type,
                        payload = %tracked.event.payload,
                        "📨 Received event"
                    );
                    last_token = Some(tracked.token);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Event stream failed");
                    break;
                }
            }
        }
        last_token
    });

    // === 5. Append a small account history ===
    let account_id = format!("account-{}", Uuid::new_v4());
    tracing::info!(account_id = %account_id, "📝 Demonstrating account lifecycle");

    engine
        .append_events(vec![
            DomainEventMessage::new(ACCOUNT, &account_id, 0, "AccountOpened", json!({ "owner": "Ada" })),
            // Legacy shape, upcast on read
            DomainEventMessage::new(ACCOUNT, &account_id, 1, "FundsDeposited", json!({ "amount": 120 })),
        ])
        .await?;

    engine
        .append_events(vec![
            DomainEventMessage::new(ACCOUNT, &account_id, 2, "FundsDeposited", json!({ "amount_cents": 5_000 }))
                .with_revision("2"),
            DomainEventMessage::new(ACCOUNT, &account_id, 3, "FundsWithdrawn", json!({ "amount_cents": 2_500 }))
                .with_metadata("correlation_id", json!(Uuid::new_v4().to_string())),
        ])
        .await?;

    // A second writer that has not seen sequence 2 yet
    let stale = DomainEventMessage::new(ACCOUNT, &account_id, 2, "FundsWithdrawn", json!({ "amount_cents": 1 }));
    match engine.append_events(vec![stale]).await {
        Err(e) if e.is_conflict() => tracing::info!(error = %e, "⚔️  Conflicting append rejected as expected"),
        Err(e) => return Err(e.into()),
        Ok(()) => tracing::warn!("Conflicting append was accepted"),
    }

    // === 6. Snapshot and replay ===
    let state = json!({ "owner": "Ada", "balance_cents": 14_500 });
    engine
        .store_snapshot(&DomainSnapshot::from_state(ACCOUNT, &account_id, 3, "AccountState", &state)?)
        .await?;

    engine
        .append_events(vec![DomainEventMessage::new(
            ACCOUNT,
            &account_id,
            4,
            "FundsDeposited",
            json!({ "amount_cents": 500 }),
        )
        .with_revision("2")])
        .await?;

    let history = engine.read_aggregate(&account_id).await?;
    tracing::info!(
        snapshot_sequence = ?history.snapshot.as_ref().map(|s| s.sequence_number),
        replayed_events = history.events.len(),
        last_sequence = ?history.last_sequence_number(),
        "📚 Aggregate replayed from snapshot"
    );

    // === 7. Let the subscriber catch up, then cancel it ===
    tokio::time::sleep(config.engine.poll_interval * 4).await;
    subscription.cancel();

    let last_token = consumer.await?;
    tracing::info!(
        resume_token = ?last_token.map(|token| token.encode()),
        "🛑 Subscription cancelled, resume token recorded"
    );

    tracing::info!("🎉 Demo complete!");

    Ok(())
}
