// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload storage and remote sources.
//!
//! [`save_stream`] writes a payload into the data dir while computing its
//! MD5. [`ImageFetcher`] opens a `copy_from` URL as a blocking reader.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use md5::{Digest, Md5};
use thiserror::Error;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

/// Errors from fetching a remote payload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The URL scheme is not supported.
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    /// The HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP status {status} from {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// The requested URL.
        url: String,
    },

    /// Reading the source or writing the payload failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A payload written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPayload {
    pub size: i64,
    /// MD5 of the payload, hex encoded.
    pub checksum: String,
}

/// Copy `reader` into `dest`, returning its size and MD5.
///
/// A partially written file is removed on error.
pub fn save_stream<R: Read>(mut reader: R, dest: &Path) -> io::Result<SavedPayload> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let result = write_payload(&mut reader, dest);
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

/// Size and MD5 of an existing file.
pub fn digest_file(path: &Path) -> io::Result<SavedPayload> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok(SavedPayload {
        size: size as i64,
        checksum: hex::encode(hasher.finalize()),
    })
}

fn write_payload<R: Read>(reader: &mut R, dest: &Path) -> io::Result<SavedPayload> {
    let mut writer = BufWriter::new(File::create(dest)?);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size: i64 = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        size += n as i64;
    }
    writer.flush()?;
    Ok(SavedPayload {
        size,
        checksum: hex::encode(hasher.finalize()),
    })
}

/// Source of `copy_from` payloads.
pub trait ImageFetcher: Send + Sync {
    /// Open `url` for reading. Blocks.
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError>;

    /// Download `url` into `dest`.
    fn fetch_to(&self, url: &str, dest: &Path) -> Result<SavedPayload, FetchError> {
        let reader = self.open(url)?;
        let saved = save_stream(reader, dest)?;
        debug!(url = %url, size = saved.size, "Fetched payload");
        Ok(saved)
    }
}

/// Fetches `file://`, `http://` and `https://` URLs.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    timeout: Duration,
}

impl Default for UrlFetcher {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
        }
    }
}

impl UrlFetcher {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ImageFetcher for UrlFetcher {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Box::new(File::open(path)?));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            // Built per call; a blocking client must not be dropped on an
            // async thread.
            let client = reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()?;
            let response = client.get(url).send()?;
            if !response.status().is_success() {
                return Err(FetchError::Status {
                    status: response.status().as_u16(),
                    url: url.to_string(),
                });
            }
            return Ok(Box::new(response));
        }
        Err(FetchError::UnsupportedUrl(url.to_string()))
    }
}
