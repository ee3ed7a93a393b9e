// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The canonical record for one logical path inside an artifact.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{ArtifactError, Result};

/// Well-known keys used in [`ManifestEntry::extra`].
pub const EXTRA_ETAG: &str = "etag";
pub const EXTRA_VERSION_ID: &str = "versionID";

/// One logical path inside an artifact: either owned by the artifact's
/// managed store, or a reference into external storage.
///
/// `local_path` is transient and never serialized (spec §3 invariant 4);
/// it is populated while the entry still awaits upload and points into the
/// staging tree or the local cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ref_uri: Option<String>,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, String>,
    #[serde(skip)]
    pub local_path: Option<Utf8PathBuf>,
}

impl ManifestEntry {
    /// Constructs a new entry, enforcing the invariants from spec §4.2:
    /// `path` and `digest` must be non-empty.
    pub fn new(path: impl Into<String>, digest: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let digest = digest.into();
        if path.is_empty() {
            return Err(ArtifactError::validation("entry path must not be empty"));
        }
        if digest.is_empty() {
            return Err(ArtifactError::validation("entry digest must not be empty"));
        }
        Ok(Self {
            path,
            ref_uri: None,
            digest,
            size: None,
            extra: BTreeMap::new(),
            local_path: None,
        })
    }

    pub fn with_ref(mut self, uri: impl Into<String>) -> Self {
        self.ref_uri = Some(uri.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_local_path(mut self, path: Utf8PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    pub fn is_reference(&self) -> bool {
        self.ref_uri.is_some()
    }

    pub fn etag(&self) -> Option<&str> {
        self.extra.get(EXTRA_ETAG).map(String::as_str)
    }

    pub fn version_id(&self) -> Option<&str> {
        self.extra.get(EXTRA_VERSION_ID).map(String::as_str)
    }

    /// Remaps `local_path` during cache adoption (spec §4.7 step 6). This is
    /// the only mutation permitted on an entry belonging to a finalized
    /// artifact.
    pub fn remap_local_path(&mut self, new_path: Utf8PathBuf) {
        self.local_path = Some(new_path);
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ref_uri {
            Some(uri) => write!(f, "ref:{uri}"),
            None => write!(f, "digest:{}", self.digest),
        }
    }
}
