use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_connector::{
    Connector, ConnectorConfig, Event, EventHandler, HandlerResult,
};

/// Simple event handler that prints events to the console
struct ConsoleEventHandler;

#[async_trait]
impl EventHandler for ConsoleEventHandler {
    async fn handle(&self, event: Event) -> HandlerResult<()> {
        println!(
            "[{}] {} ({:?}): {}",
            event.received_at, event.event_type, event.source, event.payload
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing (for logging)
    tracing_subscriber::fmt::init();

    let config = ConnectorConfig::from_env();
    let connector = Connector::new(config);

    let console_handler = Arc::new(ConsoleEventHandler);
    if let Err(err) = connector.subscribe("connector.ping", console_handler.clone()) {
        eprintln!("Failed to subscribe: {}", err);
        return;
    }
    connector.set_default_handler(console_handler);

    if let Err(err) = connector.connect().await {
        eprintln!("Failed to start connector: {}", err);
        return;
    }

    println!("Connector running. Press Ctrl-C to stop.");
    if let Err(err) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to listen for shutdown signal: {}", err);
    }

    connector.shutdown(Some(Duration::from_secs(5))).await;
    println!("Connector stopped.");
}
