// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The managed-store policy: `wandb-storage-policy-v1`.
//!
//! Composes the [`MultiHandler`] dispatcher with a retrying HTTP client
//! used only for managed-store transfers, never for handler-backed clouds.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use camino::{Utf8Path, Utf8PathBuf};
use futures_util::StreamExt;
use reqwest::StatusCode;
use slog::Logger;
use tokio::io::AsyncWriteExt;

use crate::client::{ApiClient, PrepareUploadRequest, UploadPreparer};
use crate::dispatch::MultiHandler;
use crate::entry::ManifestEntry;
use crate::error::{ArtifactError, Result};
use crate::handler::{gcs::GcsHandler, local_file::LocalFileHandler, passthrough::TrackingHandler, s3::S3Handler};
use crate::handler::{Loaded, StoreOptions};
use crate::hash::{base64_md5_to_hex, md5_of_file};

pub const POLICY_NAME: &str = "wandb-storage-policy-v1";

/// Status codes the managed-store HTTP client retries on (spec §4.5).
const RETRYABLE_STATUS_CODES: &[u16] = &[308, 409, 429, 500, 502, 503, 504];
const MAX_ATTEMPTS: u32 = 16;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const CONNECTION_POOL_SIZE: usize = 64;
const DOWNLOAD_CHUNK_SIZE: usize = 16 * 1024;

pub struct StoragePolicy {
    dispatcher: MultiHandler,
    http: reqwest::Client,
    log: Logger,
}

impl StoragePolicy {
    /// Name under which this policy is serialized into a manifest.
    pub fn name() -> &'static str {
        POLICY_NAME
    }

    pub fn new(log: Logger) -> Self {
        let mut dispatcher = MultiHandler::new();
        dispatcher.register(Box::new(S3Handler::new(log.clone())));
        dispatcher.register(Box::new(GcsHandler::new(log.clone())));
        dispatcher.register(Box::new(LocalFileHandler::new()));
        dispatcher.register(Box::new(TrackingHandler::new(log.clone())));

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(CONNECTION_POOL_SIZE)
            .build()
            .expect("building the managed-store HTTP client");

        Self { dispatcher, http, log }
    }

    pub async fn store_reference(&self, uri: &str, opts: &StoreOptions) -> Result<Vec<ManifestEntry>> {
        self.dispatcher.store_path(uri, opts).await
    }

    pub async fn load_reference(
        &self,
        artifact_dir: &Utf8Path,
        entry: &ManifestEntry,
        local: bool,
    ) -> Result<Loaded> {
        self.dispatcher.load_path(artifact_dir, entry, local).await
    }

    /// Downloads a managed, content-addressed payload.
    ///
    /// If `<artifact_dir>/<name>` already exists with a matching base64
    /// MD5, returns it without a network request. Otherwise fetches
    /// `{base_url}/artifacts/{entity}/{md5_hex}` with HTTP basic auth.
    pub async fn load_file(
        &self,
        artifact_dir: &Utf8Path,
        name: &str,
        entry: &ManifestEntry,
        api: &dyn ApiClient,
    ) -> Result<Utf8PathBuf> {
        let dest = artifact_dir.join(name);
        if dest.exists() {
            let existing = md5_of_file(&dest).await?;
            if existing.to_base64() == entry.digest {
                slog::debug!(self.log, "managed file already present with matching digest"; "path" => dest.as_str());
                return Ok(dest);
            }
        }

        let base_url = api
            .setting("base_url")
            .ok_or_else(|| ArtifactError::configuration("missing base_url setting"))?;
        let entity = api
            .setting("entity")
            .ok_or_else(|| ArtifactError::configuration("missing entity setting"))?;
        let api_key = api
            .api_key()
            .ok_or_else(|| ArtifactError::configuration("missing API key"))?;
        let md5_hex = base64_md5_to_hex(&entry.digest)?;
        let url = format!("{base_url}/artifacts/{entity}/{md5_hex}");

        let response = self
            .retrying_request(|| {
                self.http
                    .get(&url)
                    .basic_auth("api", Some(&api_key))
                    .send()
            })
            .await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream
            .next()
            .await
            .transpose()
            .map_err(|e| ArtifactError::transport(anyhow::anyhow!(e)))?
        {
            for piece in chunk.chunks(DOWNLOAD_CHUNK_SIZE) {
                file.write_all(piece).await?;
            }
        }
        file.sync_all().await?;
        Ok(dest)
    }

    /// Uploads a managed, content-addressed payload via the injected
    /// `preparer` RPC shim. Returns `true` if the server already had the
    /// bytes (`exists = true`).
    pub async fn store_file(
        &self,
        artifact_id: &str,
        name: &str,
        local_path: &Utf8Path,
        entry: &ManifestEntry,
        preparer: &dyn UploadPreparer,
    ) -> Result<bool> {
        let response = preparer
            .prepare(PrepareUploadRequest {
                artifact_id: artifact_id.to_string(),
                name: name.to_string(),
                md5: entry.digest.clone(),
            })
            .await?;

        let Some(upload_url) = response.upload_url else {
            return Ok(true);
        };

        let mut request = self.http.put(&upload_url);
        for header in &response.upload_headers {
            if let Some((key, value)) = header.split_once(':') {
                request = request.header(key.trim(), value.trim());
            }
        }

        let body = tokio::fs::read(local_path).await?;
        self.retrying_request(|| {
            let request = request
                .try_clone()
                .expect("PUT request without a streaming body is clonable")
                .body(body.clone());
            request.send()
        })
        .await?;

        Ok(false)
    }

    /// Issues `make_request` with exponential backoff (factor 1s) up to
    /// [`MAX_ATTEMPTS`] attempts, retrying on [`RETRYABLE_STATUS_CODES`].
    async fn retrying_request<F, Fut>(&self, make_request: F) -> Result<reqwest::Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: INITIAL_BACKOFF,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        for attempt in 1..=MAX_ATTEMPTS {
            let result = make_request().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if attempt < MAX_ATTEMPTS && is_retryable(status) {
                        slog::warn!(self.log, "retrying managed-store request"; "status" => status.as_u16(), "attempt" => attempt);
                        let wait = backoff.next_backoff().unwrap_or(INITIAL_BACKOFF);
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(ArtifactError::transport(anyhow::anyhow!(
                        "managed-store request failed with status {status}"
                    )));
                }
                Err(err) => {
                    if attempt < MAX_ATTEMPTS {
                        let wait = backoff.next_backoff().unwrap_or(INITIAL_BACKOFF);
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(ArtifactError::transport(anyhow::anyhow!(err)));
                }
            }
        }
        unreachable!("loop always returns on its last iteration")
    }
}

fn is_retryable(status: StatusCode) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status.as_u16())
}
