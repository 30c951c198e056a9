// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox Relay Service
//!
//! Consumes outbox inserts from the CDC stream and publishes them as
//! integration events:
//! - CDC connector → JetStream (`cdc.outbox.>`) → Relay → JetStream (`integration.>`)
//!
//! Run with: cargo run --bin outbox-relay
//!
//! Prerequisites:
//! 1. NATS server with JetStream running (default: localhost:4222)
//! 2. A CDC connector writing outbox row changes to `OUTBOX_CDC_SUBJECT`
//!
//! Every relay instance of one deployment must share `OUTBOX_RELAY_GROUP`.

use anyhow::{Context, Result};
use async_nats::jetstream;
use cim_outbox_relay::{
    ChangeLogConfig, JetStreamChangeLogSource, NatsIntegrationPublisher, PublisherConfig,
    RelayConfig, RelayEngine, RelayGroup,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let relay_config = RelayConfig::from_env().context("Invalid relay configuration")?;
    if !relay_config.enabled {
        info!("Outbox relay disabled (OUTBOX_RELAY_ENABLED=false), exiting");
        return Ok(());
    }

    let group = RelayGroup::from_env().context("Invalid relay group")?;
    let change_log_config = ChangeLogConfig::from_env().context("Invalid change log configuration")?;
    let publisher_config = PublisherConfig::from_env().context("Invalid publisher configuration")?;

    info!(
        nats_url = %change_log_config.nats_url,
        stream = %change_log_config.stream_name,
        subject = %change_log_config.subject,
        group = %group,
        prefix = %publisher_config.subject_prefix,
        "Starting outbox relay"
    );

    let client = async_nats::connect(&change_log_config.nats_url)
        .await
        .context("Failed to connect to NATS")?;
    let context = jetstream::new(client);

    let publish_stream = publisher_config.stream_name.clone();
    let publisher = NatsIntegrationPublisher::new(context.clone(), publisher_config);
    if let Some(stream_name) = publish_stream {
        publisher
            .ensure_stream(&stream_name)
            .await
            .context("Failed to set up integration stream")?;
        info!(stream = %stream_name, "Integration stream ready");
    }

    let source = JetStreamChangeLogSource::new(context, change_log_config, group)
        .await
        .context("Failed to set up change log consumer")?;

    let engine = RelayEngine::new(Arc::new(source), Arc::new(publisher), relay_config);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
        }
        shutdown.cancel();
    });

    let stats = engine.run(cancel).await.context("Outbox relay failed")?;
    info!(
        published = stats.published,
        failed = stats.failed,
        retries = stats.retries,
        "Outbox relay finished"
    );
    Ok(())
}
