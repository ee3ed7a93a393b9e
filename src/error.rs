// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error kinds surfaced by the artifact authoring and resolution engine.

use thiserror::Error;

/// All errors this crate can return across authoring, dispatch, and
/// resolution.
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// Non-URI reference, duplicate manifest path, mutation after finalize,
    /// manifest version mismatch, missing storage policy, passthrough
    /// reference with no `name`.
    #[error("validation error: {0}")]
    Validation(String),

    /// `add_file` target is not a regular file, `add_dir` target is not a
    /// directory, or a referenced local file does not exist on load.
    #[error("not found: {0}")]
    NotFound(String),

    /// Computed MD5 does not equal the stored digest.
    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// A prefix or directory enumeration reached `max_objects`.
    #[error("object limit exceeded: {count} objects found at or beyond the limit of {max}")]
    ObjectLimitExceeded { count: usize, max: usize },

    /// HTTP non-success after retries, or a cloud-SDK error other than the
    /// S3 404 probe that `store_path` deliberately consumes.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// Missing required SDK/credentials at handler init, or missing
    /// required config (e.g. `bucket`) for a handler.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

impl ArtifactError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }
}
