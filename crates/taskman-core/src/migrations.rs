// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database schema for taskman-core.
//!
//! The schema is embedded and idempotent, so crates sharing one database can
//! each apply their own schema on startup without coordinating versions.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use taskman_core::migrations;
//!
//! let pool = SqlitePool::connect(&database_url).await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

/// Task, audit and quota tables.
pub const SQLITE_SCHEMA: &str = include_str!("../migrations/sqlite/schema.sql");

/// Apply the SQLite schema. Safe to call multiple times.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SQLITE_SCHEMA).execute(pool).await?;
    Ok(())
}
