// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The authoring state machine: `Open -> Finalized`, a staging directory,
//! parallel ingestion, and cache adoption.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};
use slog::Logger;
use tokio::fs::File;

use crate::cache::ArtifactsCache;
use crate::entry::ManifestEntry;
use crate::error::{ArtifactError, Result};
use crate::handler::StoreOptions;
use crate::hash::md5_of_file;
use crate::manifest::ArtifactManifest;
use crate::policy::StoragePolicy;
use crate::progress::discard_logger;
use crate::server_manifest::ServerManifest;

/// The parallel-hashing fan-out width (spec §5/§9: "the magic number is 8
/// workers... expose this as configuration, fall back to
/// `min(8, available_parallelism)`").
pub const DEFAULT_HASH_WORKERS: usize = 8;

fn default_hash_workers() -> usize {
    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    DEFAULT_HASH_WORKERS.min(available)
}

/// What `finalize` returns: the entries folded in from files staged
/// through [`Artifact::new_file`]. Repeated calls return the same set
/// without touching the manifest or staging tree again.
pub type FileEntries = Vec<ManifestEntry>;

/// Authoring container for one artifact. See spec §3/§4.7.
pub struct Artifact {
    artifact_type: String,
    name: String,
    description: Option<String>,
    metadata: Map<String, Value>,
    manifest: ArtifactManifest,

    staging_dir: Option<Utf8TempDir>,
    staging_root: Utf8PathBuf,
    /// `(upload_path, local_path)` recorded at `new_file` time, before the
    /// staging tree is folded into the manifest at finalize.
    staged_new_files: Vec<(String, Utf8PathBuf)>,
    hash_workers: usize,

    cache: Arc<dyn ArtifactsCache>,
    policy: Arc<StoragePolicy>,
    log: Logger,

    finalized: bool,
    digest: Option<String>,
    server_manifest: Option<ServerManifest>,
    finalized_file_entries: Option<FileEntries>,
    cache_dir: Option<Utf8PathBuf>,
}

impl Artifact {
    pub fn new(
        artifact_type: impl Into<String>,
        name: impl Into<String>,
        cache: Arc<dyn ArtifactsCache>,
        policy: Arc<StoragePolicy>,
    ) -> Result<Self> {
        Self::with_logger(artifact_type, name, cache, policy, discard_logger())
    }

    pub fn with_logger(
        artifact_type: impl Into<String>,
        name: impl Into<String>,
        cache: Arc<dyn ArtifactsCache>,
        policy: Arc<StoragePolicy>,
        log: Logger,
    ) -> Result<Self> {
        let staging_dir = camino_tempfile::tempdir()?;
        let staging_root = staging_dir.path().to_path_buf();
        Ok(Self {
            artifact_type: artifact_type.into(),
            name: name.into(),
            description: None,
            metadata: Map::new(),
            manifest: ArtifactManifest::new(StoragePolicy::name(), Map::new()),
            staging_dir: Some(staging_dir),
            staging_root,
            staged_new_files: Vec::new(),
            hash_workers: default_hash_workers(),
            cache,
            policy,
            log,
            finalized: false,
            digest: None,
            server_manifest: None,
            finalized_file_entries: None,
            cache_dir: None,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Overrides the hashing fan-out width, capped by
    /// `available_parallelism` the same way the default is.
    pub fn with_hash_workers(mut self, workers: usize) -> Self {
        self.hash_workers = workers.max(1);
        self
    }

    pub fn artifact_type(&self) -> &str {
        &self.artifact_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn manifest(&self) -> &ArtifactManifest {
        &self.manifest
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The artifact's content address. `None` until finalized.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn server_manifest(&self) -> Option<&ServerManifest> {
        self.server_manifest.as_ref()
    }

    /// Sum of `size` over owned, non-reference entries staged so far.
    /// A read-only progress accessor; it does not itself trigger hashing
    /// or touch entries still pending in `new_file`/`add_dir`.
    pub fn staged_size(&self) -> u64 {
        self.manifest
            .entries()
            .filter(|entry| !entry.is_reference())
            .filter_map(|entry| entry.size)
            .sum()
    }

    /// The directory the finalized artifact's owned files live under, once
    /// cache adoption has run. `None` if nothing was ever staged through
    /// `new_file` (nothing to adopt) or before finalization.
    pub fn cache_dir(&self) -> Option<&Utf8Path> {
        self.cache_dir.as_deref()
    }

    fn ensure_can_add(&self) -> Result<()> {
        if self.finalized {
            return Err(ArtifactError::validation("can't add to finalized artifact"));
        }
        Ok(())
    }

    /// Reserves a file handle inside the staging directory at `name`,
    /// creating parent directories. Fails if that path already exists.
    /// The artifact remembers that new files exist so `finalize` folds
    /// them into the manifest.
    pub async fn new_file(&mut self, name: &str) -> Result<File> {
        self.ensure_can_add()?;
        let dest = self.staging_root.join(name);
        if dest.exists() {
            return Err(ArtifactError::validation(format!(
                "staged file already exists: {name}"
            )));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await?;
        self.staged_new_files.push((name.to_string(), dest));
        Ok(file)
    }

    /// Adds a single regular file as an owned, non-reference entry.
    pub async fn add_file(&mut self, local_path: &Utf8Path, name: Option<&str>) -> Result<()> {
        self.ensure_can_add()?;
        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| ArtifactError::not_found(format!("{local_path}: {e}")))?;
        if !metadata.is_file() {
            return Err(ArtifactError::not_found(format!("{local_path} is not a regular file")));
        }

        let logical_path = match name {
            Some(n) => n.to_string(),
            None => local_path
                .file_name()
                .ok_or_else(|| ArtifactError::validation(format!("path has no basename: {local_path}")))?
                .to_string(),
        };

        let digest = md5_of_file(local_path).await?;
        let entry = ManifestEntry::new(logical_path, digest.to_base64())?
            .with_size(metadata.len())
            .with_local_path(local_path.to_path_buf());
        self.manifest.insert(entry)
    }

    /// Walks `local_path` (following symlinks), hashing every regular file
    /// found with a bounded worker pool, and inserts one owned entry per
    /// file, relative to the root and optionally nested under `name`.
    pub async fn add_dir(&mut self, local_path: &Utf8Path, name: Option<&str>) -> Result<usize> {
        self.ensure_can_add()?;
        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| ArtifactError::not_found(format!("{local_path}: {e}")))?;
        if !metadata.is_dir() {
            return Err(ArtifactError::not_found(format!("{local_path} is not a directory")));
        }

        let root = local_path.to_path_buf();
        let mut files = Vec::new();
        for dir_entry in walkdir::WalkDir::new(local_path.as_std_path()).follow_links(true) {
            let dir_entry = dir_entry.map_err(|e| ArtifactError::Other(e.into()))?;
            if !dir_entry.file_type().is_file() {
                continue;
            }
            let path = Utf8Path::from_path(dir_entry.path())
                .ok_or_else(|| ArtifactError::validation("non-UTF8 path encountered"))?
                .to_path_buf();
            files.push(path);
        }

        let workers = self.hash_workers;
        let hashed: Vec<Result<(String, Utf8PathBuf, u64, String)>> = stream::iter(files)
            .map(|path| {
                let root = root.clone();
                let name = name.map(str::to_string);
                async move {
                    let size = tokio::fs::metadata(&path).await?.len();
                    let digest = md5_of_file(&path).await?;
                    let rel = path
                        .strip_prefix(&root)
                        .map_err(|e| ArtifactError::Other(e.into()))?
                        .to_string();
                    let logical_path = match name {
                        Some(n) => format!("{n}/{rel}"),
                        None => rel,
                    };
                    Ok((logical_path, path, size, digest.to_base64()))
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut inserted = 0;
        for result in hashed {
            let (logical_path, local_path, size, digest) = result?;
            let entry = ManifestEntry::new(logical_path, digest)?
                .with_size(size)
                .with_local_path(local_path);
            self.manifest.insert(entry)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Resolves `uri` through the storage policy's dispatcher and inserts
    /// every returned entry.
    pub async fn add_reference(
        &mut self,
        uri: &str,
        name: Option<&str>,
        checksum: bool,
        max_objects: Option<usize>,
    ) -> Result<usize> {
        self.ensure_can_add()?;
        let scheme = url::Url::parse(uri)
            .map_err(|e| ArtifactError::validation(format!("invalid reference URI {uri:?}: {e}")))?
            .scheme()
            .to_string();
        if scheme.is_empty() {
            return Err(ArtifactError::validation(format!("reference URI has no scheme: {uri}")));
        }

        let mut opts = StoreOptions {
            name: name.map(str::to_string),
            checksum,
            ..StoreOptions::default()
        };
        if let Some(max) = max_objects {
            opts.max_objects = max;
        }

        let entries = self.policy.store_reference(uri, &opts).await?;
        let count = entries.len();
        for entry in entries {
            self.manifest.insert(entry)?;
        }
        Ok(count)
    }

    /// Transitions `Open -> Finalized` (spec §4.7). Safe to call more than
    /// once: subsequent calls are a no-op and return the same entry set.
    pub async fn finalize(&mut self) -> Result<FileEntries> {
        if self.finalized {
            return Ok(self.finalized_file_entries.clone().unwrap_or_default());
        }

        // Fold files staged through `new_file` into the manifest before
        // flipping the `finalized` flag -- `add_dir` itself enforces
        // `ensure_can_add`, so doing this after finalizing would trip over
        // our own guard (spec §9 open question).
        let had_staged_files = !self.staged_new_files.is_empty();
        if had_staged_files {
            self.add_dir(&self.staging_root.clone(), None).await?;
        }
        // Every staged file's logical path is the relative `name` it was
        // reserved under in `new_file`, which is exactly what `add_dir`
        // recomputes relative to `staging_root` -- look each one up by
        // that known path rather than relying on manifest iteration order
        // (sorted by path, not insertion order).
        let file_entries: FileEntries = self
            .staged_new_files
            .iter()
            .filter_map(|(upload_path, _)| self.manifest.get(upload_path).cloned())
            .collect();

        self.finalized = true;

        let manifest_json = self.manifest.to_json_string()?;
        let manifest_scratch = camino_tempfile::tempdir()?;
        let manifest_tmp_path = manifest_scratch.path().join("wandb_manifest.json");
        tokio::fs::write(&manifest_tmp_path, manifest_json.as_bytes()).await?;

        let server_manifest = ServerManifest::build(&manifest_tmp_path, &self.staged_new_files).await?;
        let digest = self.manifest.digest();

        if had_staged_files {
            if let Some(staging_dir) = self.staging_dir.take() {
                let staging_path = staging_dir.into_path();
                let adopted_dir = self
                    .cache
                    .adopt(&self.artifact_type, &digest, &staging_path)
                    .await?;

                for entry in self.manifest.entries_mut() {
                    if let Some(local) = &entry.local_path {
                        if let Ok(rel) = local.strip_prefix(&staging_path) {
                            entry.remap_local_path(adopted_dir.join(rel));
                        }
                    }
                }
                self.cache_dir = Some(adopted_dir);
            }
        }

        slog::debug!(self.log, "finalized artifact";
            "type" => &self.artifact_type, "name" => &self.name, "digest" => &digest,
            "entries" => self.manifest.len());

        self.digest = Some(digest);
        self.server_manifest = Some(server_manifest);
        self.finalized_file_entries = Some(file_entries.clone());
        Ok(file_entries)
    }
}
