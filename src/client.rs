// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Narrow interfaces onto the external collaborators this engine is
//! injected with (spec §6): the tracking API's settings/credentials, and
//! the upload-preparation RPC.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Exposes just enough of the experiment-tracking API client for this
/// engine to authenticate managed-store transfers (spec §6).
pub trait ApiClient: Send + Sync {
    fn setting(&self, key: &str) -> Option<String>;
    fn api_key(&self) -> Option<String>;
}

/// Request body for the upload preparation RPC.
#[derive(Clone, Debug, Serialize)]
pub struct PrepareUploadRequest {
    #[serde(rename = "artifactID")]
    pub artifact_id: String,
    pub name: String,
    pub md5: String,
}

/// Response from the upload preparation RPC. A `None` `upload_url` means
/// the server already has the bytes.
#[derive(Clone, Debug, Deserialize)]
pub struct PrepareUploadResponse {
    #[serde(default)]
    pub upload_url: Option<String>,
    /// `"Key:Value"` strings to attach to the upload PUT.
    #[serde(default)]
    pub upload_headers: Vec<String>,
}

/// The injected shim around the experiment-tracking server's
/// `prepare_upload` RPC.
#[async_trait]
pub trait UploadPreparer: Send + Sync {
    async fn prepare(&self, request: PrepareUploadRequest) -> Result<PrepareUploadResponse>;
}
