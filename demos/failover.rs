//! Failover walkthrough over an in-process three-node store.

use session_failover::{InMemoryStore, SessionManager, SessionManagerConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("session_failover=debug,info")
        .init();

    // n3 only receives relocated sessions
    let config = SessionManagerConfig::from_node_spec(
        "n1:127.0.0.1:11211 n2:127.0.0.1:11212 n3:127.0.0.1:11213",
        "n3",
    )?
    .with_jvm_route("tc1")
    .with_housekeeping_interval(Duration::from_secs(1));

    let store = Arc::new(InMemoryStore::new(["n1", "n2", "n3"]));
    let manager = Arc::new(SessionManager::new(config.clone(), store.clone())?);
    let shutdown = manager.spawn_housekeeping();

    println!("--- Create and back up ---");
    let session = manager.create_session(None).await?;
    session.set_attribute("user", "alice");
    if let Some(result) = manager.backup_session(&session.id(), false).await {
        println!("  {} -> {}", result.status, result.session_id);
    }

    println!("\n--- Node n1 goes down ---");
    store.set_node_up("n1", false);
    session.set_attribute("cart", "3 items");
    for attempt in 1..=2 {
        if let Some(result) = manager.backup_session(&session.id(), false).await {
            println!(
                "  attempt {attempt}: {} -> {} (error: {:?})",
                result.status, result.session_id, result.error
            );
        }
    }

    println!("\n--- Another process takes over ---");
    let other = SessionManager::new(config, store.clone())?;
    match other.find_session(&session.id()).await {
        Some(found) => println!(
            "  found {} with user = {:?}",
            found.id(),
            found.attribute("user")
        ),
        None => println!("  session not found"),
    }

    println!("\n--- Unknown ids ---");
    let gets = store.get_count();
    for _ in 0..5 {
        other.find_session("DOESNOTEXIST-n2").await;
    }
    println!("  store reads for 5 lookups: {}", store.get_count() - gets);

    println!("\n--- Node status ---");
    for status in manager.node_statuses() {
        println!(
            "  {}: available={} stale={}",
            status.node_id, status.available, status.stale
        );
    }

    if let Some(metrics) = manager.metrics() {
        println!("\n--- Metrics ---");
        print!("{}", metrics.to_prometheus());
    }

    let _ = shutdown.send(()).await;
    Ok(())
}
