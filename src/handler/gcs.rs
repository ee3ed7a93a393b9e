// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `gs://` scheme handler.
//!
//! Structurally parallel to [`super::s3`], but GCS always hands back an
//! object's MD5 directly (`md5_hash`), so unlike S3 there's no
//! metadata-vs-ETag fallback to reason about: the digest is canonical.

use async_trait::async_trait;
use camino::Utf8Path;
use google_cloud_gax::paginator::ItemPaginator;
use google_cloud_storage::client::{Storage, StorageControl};
use slog::Logger;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;

use crate::entry::ManifestEntry;
use crate::error::{ArtifactError, Result};

use super::{Loaded, ObjectInfo, ReferenceHandler, StoreOptions};

pub struct GcsHandler {
    storage: OnceCell<Storage>,
    control: OnceCell<StorageControl>,
    log: Logger,
}

impl GcsHandler {
    pub fn new(log: Logger) -> Self {
        Self {
            storage: OnceCell::new(),
            control: OnceCell::new(),
            log,
        }
    }

    async fn storage(&self) -> Result<&Storage> {
        self.storage
            .get_or_try_init(|| async {
                Storage::builder()
                    .build()
                    .await
                    .map_err(|e| ArtifactError::configuration(format!("gcs client init: {e}")))
            })
            .await
    }

    async fn control(&self) -> Result<&StorageControl> {
        self.control
            .get_or_try_init(|| async {
                StorageControl::builder()
                    .build()
                    .await
                    .map_err(|e| ArtifactError::configuration(format!("gcs client init: {e}")))
            })
            .await
    }

    async fn get_blob(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        let control = self.control().await?;
        let bucket_resource = format!("projects/_/buckets/{bucket}");
        match control
            .get_object()
            .set_bucket(&bucket_resource)
            .set_object(key)
            .send()
            .await
        {
            Ok(obj) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: Some(obj.size as u64),
                etag: Some(obj.etag.clone()),
                provider_md5: Some(obj.md5_hash.clone()),
                version_id: Some(obj.generation.to_string()),
            })),
            Err(err) => {
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(ArtifactError::transport(anyhow::anyhow!(err)))
                }
            }
        }
    }
}

pub fn parse_gs_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("gs://")
        .ok_or_else(|| ArtifactError::validation(format!("not a gs:// URI: {uri}")))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| ArtifactError::validation(format!("gs URI missing key: {uri}")))?;
    if bucket.is_empty() {
        return Err(ArtifactError::validation(format!("gs URI missing bucket: {uri}")));
    }
    Ok((bucket.to_string(), key.to_string()))
}

fn basename(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

fn info_to_entry(info: &ObjectInfo, name: Option<&str>, uri: &str) -> ManifestEntry {
    let path = name.map(str::to_string).unwrap_or_else(|| basename(&info.key));
    // GCS always hands back an MD5 for the object: it's the canonical digest.
    let digest = info
        .provider_md5
        .clone()
        .unwrap_or_else(|| info.etag.clone().unwrap_or_else(|| info.key.clone()));
    let mut entry = ManifestEntry::new(path, digest).unwrap().with_ref(uri);
    if let Some(size) = info.size {
        entry = entry.with_size(size);
    }
    if let Some(etag) = &info.etag {
        entry = entry.with_extra(crate::entry::EXTRA_ETAG, etag.clone());
    }
    if let Some(generation) = &info.version_id {
        entry = entry.with_extra(crate::entry::EXTRA_VERSION_ID, generation.clone());
    }
    entry
}

#[async_trait]
impl ReferenceHandler for GcsHandler {
    fn scheme(&self) -> Option<&str> {
        Some("gs")
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

        let (bucket, key) = parse_gs_uri(uri)?;
        let bucket_resource = format!("projects/_/buckets/{bucket}");
        let storage = self.storage().await?;

        let mut read_request = storage.read_object(&bucket_resource, &key);
        if let Some(generation) = entry.version_id() {
            if let Ok(generation) = generation.parse::<i64>() {
                read_request = read_request.set_generation(generation);
            }
        } else {
            // No pinned generation: verify the digest before downloading.
            let head = self
                .get_blob(&bucket, &key)
                .await?
                .ok_or_else(|| ArtifactError::not_found(format!("gs://{bucket}/{key} no longer exists")))?;
            if head.provider_md5.as_deref() != Some(entry.digest.as_str()) {
                return Err(ArtifactError::DigestMismatch {
                    path: entry.path.clone(),
                    expected: entry.digest.clone(),
                    actual: head.provider_md5.unwrap_or_default(),
                });
            }
        }

        let mut response = read_request
            .send()
            .await
            .map_err(|e| ArtifactError::transport(anyhow::anyhow!("fetching gs://{bucket}/{key}: {e}")))?;

        let dest = artifact_dir.join(&entry.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&dest).await?;
        while let Some(chunk) = response
            .next()
            .await
            .transpose()
            .map_err(|e| ArtifactError::transport(anyhow::anyhow!(e)))?
        {
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        Ok(Loaded::Path(dest))
    }

    async fn store_path(&self, uri: &str, opts: &StoreOptions) -> Result<Vec<ManifestEntry>> {
        let (bucket, key) = parse_gs_uri(uri)?;

        if !opts.checksum {
            let name = opts.name.clone().unwrap_or_else(|| basename(&key));
            let entry = ManifestEntry::new(name, uri)?.with_ref(uri);
            return Ok(vec![entry]);
        }

        if let Some(info) = self.get_blob(&bucket, &key).await? {
            let entry = info_to_entry(&info, opts.name.as_deref(), uri);
            return Ok(vec![entry]);
        }

        // `get_blob` returned nothing: treat the key as a prefix.
        let control = self.control().await?;
        let bucket_resource = format!("projects/_/buckets/{bucket}");
        let mut stream = control
            .list_objects()
            .set_parent(&bucket_resource)
            .set_prefix(&key)
            .by_item();

        let mut entries = Vec::new();
        while let Some(obj) = stream
            .next()
            .await
            .transpose()
            .map_err(|e| ArtifactError::transport(anyhow::anyhow!(e)))?
        {
            if entries.len() + 1 >= opts.max_objects {
                return Err(ArtifactError::ObjectLimitExceeded {
                    count: entries.len() + 1,
                    max: opts.max_objects,
                });
            }
            let suffix = obj.name.strip_prefix(&key).unwrap_or(&obj.name).trim_start_matches('/');
            let path = match &opts.name {
                Some(name) => format!("{name}/{suffix}"),
                None => suffix.to_string(),
            };
            let entry_uri = format!("gs://{bucket}/{}", obj.name);
            let info = ObjectInfo {
                key: obj.name.clone(),
                size: Some(obj.size as u64),
                etag: Some(obj.etag.clone()),
                provider_md5: Some(obj.md5_hash.clone()),
                version_id: Some(obj.generation.to_string()),
            };
            entries.push(info_to_entry(&info, Some(&path), &entry_uri));
        }

        slog::debug!(self.log, "expanded gs prefix"; "bucket" => bucket, "prefix" => key, "count" => entries.len());
        Ok(entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        let (bucket, key) = parse_gs_uri("gs://bkt/obj").unwrap();
        assert_eq!(bucket, "bkt");
        assert_eq!(key, "obj");
    }

    #[test]
    fn entry_digest_is_always_md5_hash() {
        let info = ObjectInfo {
            key: "obj".to_string(),
            size: Some(42),
            etag: Some("CJetag==".to_string()),
            provider_md5: Some("md5hashvalue".to_string()),
            version_id: Some("12345".to_string()),
        };
        let entry = info_to_entry(&info, Some("data"), "gs://bkt/obj");
        assert_eq!(entry.digest, "md5hashvalue");
        assert_eq!(entry.version_id().unwrap(), "12345");
    }
}
