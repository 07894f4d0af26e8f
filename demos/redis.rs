use serde_json::json;
use std::sync::Arc;
use streamsmith::prelude::*;
use tokio::signal;

#[tokio::main]
async fn main() -> SmithResult<()> {
    init_tracing(&LoggingConfig::default());

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let connector = RedisConnector::new(RedisConfig::new(url))?;

    let producer = Producer::new("reports", &connector, &QueueOptions::default()).await?;
    for day in 1..=5 {
        let key = format!("report-{day}");
        let id = producer.add_task(&json!({ "day": day }), Some(&key)).await?;
        println!("🔨 queued report {day}: {id:?}");
    }

    let handler = handler_fn(|data, meta| async move {
        Ok::<_, BoxError>(json!({ "day": data["day"], "consumer": meta.consumer_name }))
    });
    let mut config = ConsumerConfig::development();
    config.consumer = config.consumer.with_concurrency(3).with_max_retry(2);
    let consumer = Consumer::new("reports", Arc::new(handler), config, &connector).await?;
    consumer.start();

    println!("🔨 Consuming {:?}. Press Ctrl+C to stop...", consumer.names());
    signal::ctrl_c().await.expect("Failed to listen for ctrl+c");

    consumer.disconnect().await?;
    producer.disconnect().await?;

    let inspector = QueueInspector::new(&connector, &QueueOptions::default()).await?;
    println!("🔨 stats: {:?}", inspector.stats(Scope::Global).await?);
    inspector.disconnect().await?;
    Ok(())
}
