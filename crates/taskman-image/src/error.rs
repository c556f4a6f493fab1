// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for taskman-image.

use taskman_core::TaskError;
use thiserror::Error;

/// Image service errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImageError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Task engine operation failed.
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Probing or converting an image payload failed.
    #[error("Codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// Fetching a remote payload failed.
    #[error("Fetch error: {0}")]
    Fetch(#[from] crate::fetch::FetchError),

    /// Image was not found (or is not visible to the caller).
    #[error("Image not found: {0}")]
    NotFound(String),

    /// The image's status does not allow the operation.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// The image is protected against deletion.
    #[error("Protected: {0}")]
    Protected(String),

    /// The caller may not perform the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The project has no quota left.
    #[error("Out of quota: {0}")]
    OutOfQuota(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ImageError {
    /// Stable code for the dispatch layer.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Task(e) => e.error_code(),
            Self::Database(_) => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Codec(_) => "CODEC_ERROR",
            Self::Fetch(_) => "FETCH_ERROR",
            Self::NotFound(_) => "IMAGE_NOT_FOUND",
            Self::InvalidStatus(_) => "INVALID_STATUS",
            Self::Protected(_) => "IMAGE_PROTECTED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::OutOfQuota(_) => "OUT_OF_QUOTA",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    /// Whether the request conflicts with the image's current state (HTTP 409
    /// territory) rather than being malformed or failing internally.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::InvalidStatus(_) | Self::Protected(_))
            || matches!(
                self,
                Self::Task(TaskError::TaskTerminal { .. } | TaskError::ConcurrentAdvance { .. })
            )
    }
}

/// Result type using [`ImageError`].
pub type Result<T> = std::result::Result<T, ImageError>;
