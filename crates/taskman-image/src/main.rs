// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskman Image - Image Lifecycle Service
//!
//! Runs the image task engine and the pending-delete reaper:
//! - Resumes tasks left unfinished by a previous run
//! - Purges images whose soft delete has expired

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use taskman_image::config::Config;
use taskman_image::migrations;
use taskman_image::runtime::ImageRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskman_image=info,taskman_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database_url = %config.database_url,
        data_dir = %config.data_dir.display(),
        pending_delete = config.pending_delete,
        "Starting Taskman Image"
    );

    std::fs::create_dir_all(&config.data_dir)?;

    let connect_options = config
        .database_url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(connect_options)
        .await?;

    info!("Connected to database");

    migrations::run_sqlite(&pool).await?;

    info!("Database schema verified");

    let runtime = ImageRuntime::builder()
        .pool(pool)
        .config(config)
        .build()?
        .start()
        .await?;

    info!("Image service ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Taskman Image shut down");

    Ok(())
}
