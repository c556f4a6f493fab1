// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Disk image codec.
//!
//! Probing and converting payloads is delegated to an [`ImageCodec`]. Both
//! operations block and are only called from background work.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fetch::SavedPayload;
use crate::image::PayloadInfo;

/// Errors from codec operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The codec binary could not be run.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The codec exited with a non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The codec's output could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is not a disk image the codec understands.
    #[error("Unsupported image: {0}")]
    Unsupported(String),
}

/// What inspection found out about a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: i64,
}

/// Disk image codec.
pub trait ImageCodec: Send + Sync {
    /// Detect the format and virtual size of the payload at `path`.
    fn inspect(&self, path: &Path) -> Result<ImageInfo, CodecError>;

    /// Convert `src` (in `src_format`) into `dst` (in `dst_format`).
    fn convert(
        &self,
        src: &Path,
        src_format: &str,
        dst: &Path,
        dst_format: &str,
    ) -> Result<(), CodecError>;
}

/// Codec backed by the `qemu-img` tool.
#[derive(Debug, Clone)]
pub struct QemuImgCodec {
    binary: PathBuf,
}

impl Default for QemuImgCodec {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl QemuImgCodec {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&OsStr]) -> Result<Vec<u8>, CodecError> {
        debug!(binary = %self.binary.display(), ?args, "Running codec");
        let output = Command::new(&self.binary).args(args).output()?;
        if !output.status.success() {
            return Err(CodecError::ExitCode {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl ImageCodec for QemuImgCodec {
    fn inspect(&self, path: &Path) -> Result<ImageInfo, CodecError> {
        let stdout = self.run(&[
            OsStr::new("info"),
            OsStr::new("--output=json"),
            path.as_os_str(),
        ])?;
        parse_info(&stdout)
    }

    fn convert(
        &self,
        src: &Path,
        src_format: &str,
        dst: &Path,
        dst_format: &str,
    ) -> Result<(), CodecError> {
        self.run(&[
            OsStr::new("convert"),
            OsStr::new("-f"),
            OsStr::new(src_format),
            OsStr::new("-O"),
            OsStr::new(dst_format),
            src.as_os_str(),
            dst.as_os_str(),
        ])?;
        Ok(())
    }
}

/// Inspect a stored payload and combine the result with its size and checksum.
pub fn describe_payload(
    codec: &dyn ImageCodec,
    path: &Path,
    saved: &SavedPayload,
) -> Result<PayloadInfo, CodecError> {
    let info = codec.inspect(path)?;
    Ok(PayloadInfo {
        size: saved.size,
        checksum: saved.checksum.clone(),
        location: path.to_string_lossy().into_owned(),
        disk_format: info.format,
        virtual_size: info.virtual_size,
    })
}

fn parse_info(stdout: &[u8]) -> Result<ImageInfo, CodecError> {
    let info: ImageInfo = serde_json::from_slice(stdout)?;
    if info.format.is_empty() {
        return Err(CodecError::Unsupported("no format detected".to_string()));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qemu_info() {
        let out = br#"{
            "virtual-size": 2147483648,
            "filename": "/data/img-1",
            "format": "qcow2",
            "actual-size": 1234
        }"#;
        assert_eq!(
            parse_info(out).unwrap(),
            ImageInfo {
                format: "qcow2".to_string(),
                virtual_size: 2_147_483_648,
            }
        );
        assert!(matches!(
            parse_info(br#"{"format": "", "virtual-size": 0}"#),
            Err(CodecError::Unsupported(_))
        ));
        assert!(matches!(parse_info(b"not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_missing_binary_is_io_error() {
        let codec = QemuImgCodec::new("/nonexistent/qemu-img");
        let err = codec.inspect(Path::new("/tmp/whatever")).unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }
}
