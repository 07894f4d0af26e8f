use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use streamsmith::prelude::*;

#[tokio::main]
async fn main() -> SmithResult<()> {
    init_tracing(&LoggingConfig::default());

    let broker = MemoryBroker::new();
    let producer = Producer::new("emails", &broker, &QueueOptions::default()).await?;

    let tasks: Vec<_> = (0..10)
        .map(|i| NewTask::new(json!({ "to": format!("user{i}@example.com") })))
        .collect();
    producer.bulk_add_tasks(&tasks, 4).await?;

    // Rejected while the first one is in flight
    let first = producer.add_task(&json!({ "to": "ops" }), Some("daily-report")).await?;
    let second = producer.add_task(&json!({ "to": "ops" }), Some("daily-report")).await?;
    println!("🔨 dedup: first={first:?} second={second:?}");

    let handler = handler_fn(|data, meta| async move {
        if meta.retry_count == 0 && data["to"] == "user3@example.com" {
            return Err::<serde_json::Value, BoxError>("mailbox full".into());
        }
        Ok(json!({ "sent": data["to"], "by": meta.consumer_name }))
    });

    let config = ConsumerConfig::with_consumer(
        ConsumerOptions::default()
            .with_concurrency(2)
            .with_max_retry(1)
            .with_timeout_ms(5_000)
            .with_block_timeout_ms(100),
    );
    let consumer = Consumer::new("emails", Arc::new(handler), config, &broker).await?;
    consumer.start();

    let inspector = QueueInspector::new(&broker, &QueueOptions::default()).await?;
    while inspector.pending_len("emails").await? > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    consumer.disconnect().await?;

    let stats = inspector.stats(Scope::queue("emails")).await?;
    println!("🔨 stats: {stats:?}");
    for record in inspector.failed(Scope::Global).await? {
        println!("🔨 failed attempt {} of {}: {:?}", record.retry_count, record.id, record.error());
    }

    producer.disconnect().await?;
    inspector.disconnect().await?;
    Ok(())
}
