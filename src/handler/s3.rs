// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `s3://` scheme handler.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::types::BucketVersioningStatus;
use camino::Utf8Path;
use slog::Logger;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;

use crate::entry::ManifestEntry;
use crate::error::{ArtifactError, Result};
use crate::hash::md5_of_file;

use super::{Loaded, ObjectInfo, ReferenceHandler, StoreOptions};

const MD5_METADATA_KEY: &str = "md5";

pub struct S3Handler {
    client: OnceCell<aws_sdk_s3::Client>,
    log: Logger,
}

impl S3Handler {
    pub fn new(log: Logger) -> Self {
        Self {
            client: OnceCell::new(),
            log,
        }
    }

    async fn client(&self) -> Result<&aws_sdk_s3::Client> {
        self.client
            .get_or_try_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Ok(region) = std::env::var("AWS_REGION") {
                    loader = loader.region(Region::new(region));
                }
                if let Ok(endpoint) = std::env::var("AWS_S3_ENDPOINT_URL") {
                    loader = loader.endpoint_url(endpoint);
                }
                let sdk_config = loader.load().await;
                Ok::<_, ArtifactError>(aws_sdk_s3::Client::new(&sdk_config))
            })
            .await
    }

    async fn bucket_versioning_enabled(&self, bucket: &str) -> Result<bool> {
        let client = self.client().await?;
        let output = client
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| ArtifactError::transport(anyhow::anyhow!(e)))?;
        Ok(matches!(output.status(), Some(BucketVersioningStatus::Enabled)))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        let client = self.client().await?;
        match client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().map(|n| n as u64),
                etag: output.e_tag().map(|s| strip_quotes(s)),
                provider_md5: output
                    .metadata()
                    .and_then(|m| m.get(MD5_METADATA_KEY))
                    .cloned(),
                version_id: output.version_id().map(|s| s.to_string()),
            })),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(ArtifactError::transport(anyhow::anyhow!(err)))
                }
            }
        }
    }
}

fn strip_quotes(s: &str) -> String {
    s.trim_matches('"').to_string()
}

pub fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| ArtifactError::validation(format!("not an s3:// URI: {uri}")))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| ArtifactError::validation(format!("s3 URI missing key: {uri}")))?;
    if bucket.is_empty() {
        return Err(ArtifactError::validation(format!("s3 URI missing bucket: {uri}")));
    }
    Ok((bucket.to_string(), key.to_string()))
}

fn basename(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

fn info_to_entry(info: &ObjectInfo, name: Option<&str>, version_id: Option<&str>, uri: &str) -> ManifestEntry {
    let path = name.map(str::to_string).unwrap_or_else(|| basename(&info.key));
    let digest = info
        .provider_md5
        .clone()
        .or_else(|| info.etag.clone())
        .unwrap_or_else(|| info.key.clone());
    let mut entry = ManifestEntry::new(path, digest).unwrap().with_ref(uri);
    if let Some(size) = info.size {
        entry = entry.with_size(size);
    }
    if let Some(etag) = &info.etag {
        entry = entry.with_extra(crate::entry::EXTRA_ETAG, etag.clone());
    }
    if let Some(vid) = version_id {
        entry = entry.with_extra(crate::entry::EXTRA_VERSION_ID, vid.to_string());
    }
    entry
}

#[async_trait]
impl ReferenceHandler for S3Handler {
    fn scheme(&self) -> Option<&str> {
        Some("s3")
    }

    async fn load_path(
        &self,
        artifact_dir: &Utf8Path,
        entry: &ManifestEntry,
        local: bool,
    ) -> Result<Loaded> {
        let uri = entry
            .ref_uri
            .as_deref()
            .ok_or_else(|| ArtifactError::validation(format!("entry {} has no reference", entry.path)))?;

        if !local {
            return Ok(Loaded::Uri(uri.to_string()));
        }

        let (bucket, key) = parse_s3_uri(uri)?;
        let client = self.client().await?;

        if let Some(version_id) = entry.version_id() {
            let output = client
                .get_object()
                .bucket(&bucket)
                .key(&key)
                .version_id(version_id)
                .send()
                .await
                .map_err(|e| {
                    ArtifactError::transport(anyhow::anyhow!(
                        "fetching s3://{bucket}/{key} version {version_id}: {e}"
                    ))
                })?;
            return write_body(artifact_dir, entry, output.body).await;
        }

        // No pinned version: verify the digest before downloading.
        let head = self
            .head_object(&bucket, &key)
            .await?
            .ok_or_else(|| ArtifactError::not_found(format!("s3://{bucket}/{key} no longer exists")))?;
        let observed_digest = head.provider_md5.clone().or_else(|| head.etag.clone());
        if observed_digest.as_deref() != Some(entry.digest.as_str()) {
            return Err(ArtifactError::DigestMismatch {
                path: entry.path.clone(),
                expected: entry.digest.clone(),
                actual: observed_digest.unwrap_or_default(),
            });
        }

        let output = client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| ArtifactError::transport(anyhow::anyhow!("fetching s3://{bucket}/{key}: {e}")))?;
        write_body(artifact_dir, entry, output.body).await
    }

    async fn store_path(&self, uri: &str, opts: &StoreOptions) -> Result<Vec<ManifestEntry>> {
        let (bucket, key) = parse_s3_uri(uri)?;

        if !opts.checksum {
            let name = opts.name.clone().unwrap_or_else(|| basename(&key));
            let entry = ManifestEntry::new(name, uri)?.with_ref(uri);
            return Ok(vec![entry]);
        }

        if let Some(info) = self.head_object(&bucket, &key).await? {
            let versioning = self.bucket_versioning_enabled(&bucket).await.unwrap_or(false);
            let version_id = info.version_id.as_deref().filter(|v| versioning && *v != "null");
            let entry = info_to_entry(&info, opts.name.as_deref(), version_id, uri);
            return Ok(vec![entry]);
        }

        // HEAD 404: treat the key as a prefix and list matching objects.
        let client = self.client().await?;
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = client
                .list_objects_v2()
                .bucket(&bucket)
                .prefix(&key)
                .max_keys((opts.max_objects + 1) as i32);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| ArtifactError::transport(anyhow::anyhow!(e)))?;

            for obj in output.contents() {
                if entries.len() + 1 >= opts.max_objects {
                    return Err(ArtifactError::ObjectLimitExceeded {
                        count: entries.len() + 1,
                        max: opts.max_objects,
                    });
                }
                let obj_key = obj.key().unwrap_or_default().to_string();
                let suffix = obj_key.strip_prefix(&key).unwrap_or(&obj_key).trim_start_matches('/');
                let path = match &opts.name {
                    Some(name) => format!("{name}/{suffix}"),
                    None => suffix.to_string(),
                };
                let entry_uri = format!("s3://{bucket}/{obj_key}");
                let info = ObjectInfo {
                    key: obj_key,
                    size: obj.size().map(|n| n as u64),
                    etag: obj.e_tag().map(|s| strip_quotes(s)),
                    provider_md5: None,
                    version_id: None,
                };
                entries.push(info_to_entry(&info, Some(&path), None, &entry_uri));
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        slog::debug!(self.log, "expanded s3 prefix"; "bucket" => bucket, "prefix" => key, "count" => entries.len());
        Ok(entries)
    }
}

async fn write_body(
    artifact_dir: &Utf8Path,
    entry: &ManifestEntry,
    body: aws_sdk_s3::primitives::ByteStream,
) -> Result<Loaded> {
    let dest = artifact_dir.join(&entry.path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let aggregated = body
        .collect()
        .await
        .map_err(|e| ArtifactError::transport(anyhow::anyhow!(e)))?;
    let mut file = tokio::fs::File::create(&dest).await?;
    file.write_all(&aggregated.into_bytes()).await?;
    file.sync_all().await?;
    Ok(Loaded::Path(dest))
}
