//! Gateway service entry point.
//!
//! Realtime WebSocket gateway fanning entity events out to section,
//! notification and analytics clients.

use anyhow::Result;
use common::TokenValidator;
use external_services::{AnalyticsHttpClient, JwtValidator, SectionSnapshotHttpClient};
use gateway::{
    create_router, AnalyticsService, AppState, BroadcastHandler, CircuitBreaker, ConnectionSettings,
    EntityStreamHandler, GatewayConfig, HandlerRegistry, Hub, SectionService, StreamConsumer,
    ANALYTICS_FETCH_TIMEOUT, USER_CREATED_TOPIC,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::NatsClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting realtime gateway");
    info!(
        http_port = config.http_port,
        metrics_port = config.metrics_port,
        nats_url = %config.nats_url,
        nats_durable = %config.nats_durable,
        rest_base_url = %config.rest_base_url,
        default_entity = %config.default_entity,
        allowed_actions = ?config.allowed_actions,
        "configuration"
    );
    if config.jwt_secret.is_empty() && config.jwt_public_key.is_empty() {
        warn!("JWT_SECRET and JWT_PUBLIC_KEY are empty, every token will be rejected");
    }

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let hub = Hub::new();
    let validator: Arc<dyn TokenValidator> =
        Arc::new(JwtValidator::new(&config.jwt_secret, &config.jwt_public_key)?);
    let sections = Arc::new(SectionService::new(
        validator.clone(),
        Arc::new(SectionSnapshotHttpClient::new(&config.rest_base_url, config.rest_timeout)?),
        hub.clone(),
        config.rest_timeout,
    ));
    let analytics = Arc::new(AnalyticsService::new(
        validator.clone(),
        Arc::new(AnalyticsHttpClient::new(&config.rest_base_url, ANALYTICS_FETCH_TIMEOUT)?),
        hub.clone(),
        ANALYTICS_FETCH_TIMEOUT,
    ));

    // Topic handlers
    let mut registry = HandlerRegistry::new();
    let mut bindings: Vec<(String, String)> = config
        .all_topics()
        .map(|(entity, topic)| (entity.to_string(), topic.to_string()))
        .collect();
    for (entity, topic) in &bindings {
        registry.register(Arc::new(EntityStreamHandler::new(
            entity,
            topic,
            &config.allowed_actions,
            hub.clone(),
            sections.clone(),
            Some(analytics.clone()),
        )));
    }
    if !bindings.iter().any(|(_, topic)| topic == USER_CREATED_TOPIC) {
        registry.register(Arc::new(BroadcastHandler::new(USER_CREATED_TOPIC, hub.clone())));
        bindings.push(("user".to_string(), USER_CREATED_TOPIC.to_string()));
    }
    let registry = Arc::new(registry);
    info!(topics = ?registry.topics(), "topic handlers registered");

    // Connect to NATS and start one consumer per topic
    let nats_client = NatsClient::connect(&config.nats_url).await?;
    info!("Connected to NATS");

    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumer_handles = Vec::with_capacity(bindings.len());
    for (entity, topic) in &bindings {
        let source = nats_client
            .topic_consumer(entity, topic, &config.nats_durable)
            .await?;
        let consumer = StreamConsumer::new(source, breaker.clone());
        consumer_handles.push(tokio::spawn(
            consumer.consume(registry.clone(), shutdown_rx.clone()),
        ));
    }

    // Create HTTP router
    let state = Arc::new(AppState::new(
        hub,
        validator,
        sections,
        analytics,
        ConnectionSettings::from(&config),
    ));
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop consumers
    info!("Shutting down stream consumers...");
    let _ = shutdown_tx.send(true);
    for handle in consumer_handles {
        let _ = handle.await;
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
