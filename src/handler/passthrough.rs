// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The default handler for any scheme with no specific provider.

use async_trait::async_trait;
use camino::Utf8Path;
use slog::Logger;

use crate::entry::ManifestEntry;
use crate::error::{ArtifactError, Result};

use super::{Loaded, ReferenceHandler, StoreOptions};

/// Never downloads anything; tracks a reference by URI alone. This is the
/// handler used for any scheme the [`crate::dispatch::MultiHandler`] has no
/// specific provider for.
pub struct TrackingHandler {
    log: Logger,
}

impl TrackingHandler {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ReferenceHandler for TrackingHandler {
    fn scheme(&self) -> Option<&str> {
        None
    }

    async fn load_path(
        &self,
        _artifact_dir: &Utf8Path,
        entry: &ManifestEntry,
        local: bool,
    ) -> Result<Loaded> {
        if !local {
            let uri = entry.ref_uri.clone().ok_or_else(|| {
                ArtifactError::validation(format!("entry {} has no reference", entry.path))
            })?;
            return Ok(Loaded::Uri(uri));
        }
        Err(ArtifactError::validation(format!(
            "cannot download {}: no handler recognizes its URI scheme",
            entry.ref_uri.as_deref().unwrap_or(&entry.path)
        )))
    }

    async fn store_path(&self, uri: &str, opts: &StoreOptions) -> Result<Vec<ManifestEntry>> {
        let name = opts.name.clone().ok_or_else(|| {
            ArtifactError::validation(
                "a name is required when referencing an unrecognized URI scheme",
            )
        })?;
        slog::warn!(
            self.log,
            "reference cannot be checksummed, digest will be the literal URI";
            "uri" => uri,
        );
        let entry = ManifestEntry::new(name, uri)?.with_ref(uri);
        Ok(vec![entry])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn requires_name() {
        let handler = TrackingHandler::new(log());
        let opts = StoreOptions {
            name: None,
            ..Default::default()
        };
        let res = handler.store_path("foo://host/thing", &opts).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn produces_single_entry_with_digest_equal_to_uri() {
        let handler = TrackingHandler::new(log());
        let opts = StoreOptions {
            name: Some("t".to_string()),
            ..Default::default()
        };
        let entries = handler.store_path("foo://host/thing", &opts).await.unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.path, "t");
        assert_eq!(e.digest, "foo://host/thing");
        assert_eq!(e.ref_uri.as_deref(), Some("foo://host/thing"));
    }

    #[tokio::test]
    async fn local_load_fails_explicitly() {
        let handler = TrackingHandler::new(log());
        let entry = ManifestEntry::new("t", "foo://host/thing")
            .unwrap()
            .with_ref("foo://host/thing");
        let res = handler
            .load_path(Utf8Path::new("/tmp/out"), &entry, true)
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn metadata_load_returns_ref() {
        let handler = TrackingHandler::new(log());
        let entry = ManifestEntry::new("t", "foo://host/thing")
            .unwrap()
            .with_ref("foo://host/thing");
        let res = handler
            .load_path(Utf8Path::new("/tmp/out"), &entry, false)
            .await
            .unwrap();
        assert_eq!(res, Loaded::Uri("foo://host/thing".to_string()));
    }
}
