use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use plaza_realtime::config::{generate_config_template, Config};
use plaza_realtime::dispatcher::RetryPolicy;
use plaza_realtime::{bridge, directory, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "plaza_realtime=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "plaza_realtime=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("plaza-realtime v{} starting", env!("CARGO_PKG_VERSION"));

    let delivery = config.delivery.clone().unwrap_or_default();
    let retry_policy = RetryPolicy {
        ack_timeout: Duration::from_millis(delivery.ack_timeout_ms),
        max_attempts: delivery.max_attempts,
    };

    // Read-only store collaborator for participant lookups
    let store = Arc::new(directory::HttpDirectory::new(config.api_base_url.clone()));

    let (app_state, registry_events) = state::AppState::build(
        store,
        retry_policy,
        Duration::from_millis(delivery.presence_grace_ms),
        delivery.outbound_buffer,
    );

    // Registry events drive the presence tracker and retry cancellation
    state::spawn_event_router(app_state.clone(), registry_events);

    // Publish bridge: broker channel in, dispatcher loop out
    let (publish_tx, publish_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(app_state.dispatcher.clone().run(publish_rx));
    tokio::spawn(bridge::run_subscriber(config.redis_url.clone(), publish_tx));

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
