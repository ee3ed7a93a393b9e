// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-URI-scheme store/load handlers: the pluggable core of the engine.

pub mod gcs;
pub mod local_file;
pub mod passthrough;
pub mod s3;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::entry::ManifestEntry;
use crate::error::Result;

/// Default cap on the number of objects a single `store_path` prefix/
/// directory enumeration may produce before failing (spec §4.3.2 / §8).
pub const DEFAULT_MAX_OBJECTS: usize = 10000;

/// Options controlling a `store_path` call.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Logical name/path prefix to register entries under. Required for
    /// opaque (passthrough) schemes; optional elsewhere (basename/relative
    /// path inference applies).
    pub name: Option<String>,
    /// Whether to attempt to checksum the referenced bytes at all.
    pub checksum: bool,
    /// Enumeration cap for prefix/directory expansion.
    pub max_objects: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            name: None,
            checksum: true,
            max_objects: DEFAULT_MAX_OBJECTS,
        }
    }
}

/// The result of `load_path`: either the original URI (metadata mode) or a
/// local filesystem path the bytes were downloaded/verified to
/// (download mode).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Loaded {
    Uri(String),
    Path(Utf8PathBuf),
}

impl Loaded {
    pub fn as_str_or_path(&self) -> &str {
        match self {
            Loaded::Uri(u) => u.as_str(),
            Loaded::Path(p) => p.as_str(),
        }
    }
}

/// A normalized view over an object store's per-object metadata, merging
/// the two shapes a cloud SDK returns (a HEAD/get-single-object response
/// vs. a listing entry) rather than dynamically probing which fields are
/// present (spec §9 "dynamic attribute probing" redesign flag).
#[derive(Clone, Debug, Default)]
pub struct ObjectInfo {
    pub key: String,
    pub size: Option<u64>,
    pub etag: Option<String>,
    /// Provider-supplied content MD5, when available directly (GCS) or via
    /// user metadata (S3).
    pub provider_md5: Option<String>,
    pub version_id: Option<String>,
}

/// Implemented by every per-scheme store/load provider.
#[async_trait]
pub trait ReferenceHandler: Send + Sync {
    /// The URI scheme this handler owns (e.g. `"s3"`), or `None` for the
    /// default fallback handler.
    fn scheme(&self) -> Option<&str>;

    /// Loads the bytes an entry refers to.
    ///
    /// If `local` is `false`, returns the original `ref` (metadata mode).
    /// If `true`, downloads to `<artifact_dir>/<entry.path>`, verifying the
    /// digest when feasible, and returns the filesystem path.
    async fn load_path(
        &self,
        artifact_dir: &Utf8Path,
        entry: &ManifestEntry,
        local: bool,
    ) -> Result<Loaded>;

    /// Resolves a URI into one or more manifest entries.
    async fn store_path(&self, uri: &str, opts: &StoreOptions) -> Result<Vec<ManifestEntry>>;
}
