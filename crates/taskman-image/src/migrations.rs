// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database schema for taskman-image.
//!
//! The image tables live next to taskman-core's task, audit and quota tables
//! in one database. [`run_sqlite`] applies both schemas.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use taskman_image::migrations;
//!
//! let pool = SqlitePool::connect(&database_url).await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

/// Image, subformat and property tables.
pub const SQLITE_SCHEMA: &str = include_str!("../migrations/sqlite/schema.sql");

/// Apply the core schema, then the image schema. Safe to call multiple times.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), sqlx::Error> {
    taskman_core::migrations::run_sqlite(pool).await?;
    sqlx::raw_sql(SQLITE_SCHEMA).execute(pool).await?;
    Ok(())
}
