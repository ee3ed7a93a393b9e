// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `file://` scheme handler.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::entry::ManifestEntry;
use crate::error::{ArtifactError, Result};
use crate::hash::md5_of_file;

use super::{Loaded, ReferenceHandler, StoreOptions};

pub struct LocalFileHandler;

impl LocalFileHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalFileHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps `file://<netloc><path>` to a filesystem path. The netloc is kept
/// as-is, concatenated directly with the path component, so a UNC-style
/// reference like `file://myserver/share/x` resolves to `myserver/share/x`
/// rather than requiring a leading slash.
pub fn parse_file_uri(uri: &str) -> Result<Utf8PathBuf> {
    let rest = uri
        .strip_prefix("file://")
        .ok_or_else(|| ArtifactError::validation(format!("not a file:// URI: {uri}")))?;
    Ok(Utf8PathBuf::from(rest))
}

pub fn file_uri(path: &Utf8Path) -> String {
    format!("file://{path}")
}

fn basename(path: &Utf8Path) -> Result<String> {
    path.file_name()
        .map(|s| s.to_string())
        .ok_or_else(|| ArtifactError::validation(format!("path has no basename: {path}")))
}

#[async_trait]
impl ReferenceHandler for LocalFileHandler {
    fn scheme(&self) -> Option<&str> {
        Some("file")
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

        let source = parse_file_uri(uri)?;
        let dest = artifact_dir.join(&entry.path);

        if dest.exists() {
            let existing = md5_of_file(&dest).await?;
            if existing.to_base64() == entry.digest {
                return Ok(Loaded::Path(dest));
            }
        }

        if !source.exists() {
            return Err(ArtifactError::not_found(format!(
                "referenced local file does not exist: {source}"
            )));
        }

        let actual = md5_of_file(&source).await?;
        if actual.to_base64() != entry.digest {
            return Err(ArtifactError::DigestMismatch {
                path: entry.path.clone(),
                expected: entry.digest.clone(),
                actual: actual.to_base64(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &dest).await?;
        Ok(Loaded::Path(dest))
    }

    async fn store_path(&self, uri: &str, opts: &StoreOptions) -> Result<Vec<ManifestEntry>> {
        let source = parse_file_uri(uri)?;

        if !opts.checksum {
            let name = match &opts.name {
                Some(n) => n.clone(),
                None => basename(&source)?,
            };
            let entry = ManifestEntry::new(name, uri)?.with_ref(uri);
            return Ok(vec![entry]);
        }

        let metadata = tokio::fs::metadata(&source)
            .await
            .map_err(|e| ArtifactError::not_found(format!("{source}: {e}")))?;

        if metadata.is_file() {
            let name = match &opts.name {
                Some(n) => n.clone(),
                None => basename(&source)?,
            };
            let digest = md5_of_file(&source).await?;
            let entry = ManifestEntry::new(name, digest.to_base64())
                .unwrap()
                .with_ref(uri)
                .with_size(metadata.len());
            return Ok(vec![entry]);
        }

        if !metadata.is_dir() {
            return Err(ArtifactError::not_found(format!(
                "{source} is neither a file nor a directory"
            )));
        }

        let mut entries = Vec::new();
        for dir_entry in walkdir::WalkDir::new(source.as_std_path()).follow_links(true) {
            let dir_entry = dir_entry.map_err(|e| ArtifactError::Other(e.into()))?;
            if !dir_entry.file_type().is_file() {
                continue;
            }
            if entries.len() + 1 >= opts.max_objects {
                return Err(ArtifactError::ObjectLimitExceeded {
                    count: entries.len() + 1,
                    max: opts.max_objects,
                });
            }

            let entry_path = Utf8Path::from_path(dir_entry.path())
                .ok_or_else(|| ArtifactError::validation("non-UTF8 path encountered"))?;
            let rel = entry_path
                .strip_prefix(&source)
                .map_err(|e| ArtifactError::Other(e.into()))?;
            let logical_path = match &opts.name {
                Some(name) => format!("{name}/{rel}"),
                None => rel.to_string(),
            };
            let file_uri_for_entry = file_uri(entry_path);
            let digest = md5_of_file(entry_path).await?;
            let size = dir_entry
                .metadata()
                .map_err(|e| ArtifactError::Other(e.into()))?
                .len();
            entries.push(
                ManifestEntry::new(logical_path, digest.to_base64())
                    .unwrap()
                    .with_ref(file_uri_for_entry)
                    .with_size(size),
            );
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_simple_uri() {
        assert_eq!(parse_file_uri("file:///tmp/x").unwrap().as_str(), "/tmp/x");
    }

    #[test]
    fn preserves_netloc_as_prefix() {
        assert_eq!(
            parse_file_uri("file://myserver/share/x").unwrap().as_str(),
            "myserver/share/x"
        );
    }

    #[tokio::test]
    async fn store_single_file_produces_base64_md5() {
        let dir = camino_tempfile::tempdir().unwrap();
        let file_path = dir.path().join("data.bin");
        tokio::fs::write(&file_path, b"hello").await.unwrap();

        let handler = LocalFileHandler::new();
        let uri = file_uri(&file_path);
        let opts = StoreOptions {
            name: Some("data.bin".to_string()),
            ..Default::default()
        };
        let entries = handler.store_path(&uri, &opts).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].digest, crate::hash::md5_of_str("hello").to_base64());
        assert_eq!(entries[0].size, Some(5));
    }

    #[tokio::test]
    async fn store_directory_walks_recursively() {
        let dir = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"a").await.unwrap();
        tokio::fs::write(dir.path().join("sub/b.txt"), b"b").await.unwrap();

        let handler = LocalFileHandler::new();
        let uri = file_uri(dir.path());
        let opts = StoreOptions {
            name: Some("data".to_string()),
            ..Default::default()
        };
        let mut entries = handler.store_path(&uri, &opts).await.unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "data/a.txt");
        assert_eq!(entries[1].path, "data/sub/b.txt");
    }

    #[tokio::test]
    async fn empty_directory_yields_zero_entries() {
        let dir = camino_tempfile::tempdir().unwrap();
        let handler = LocalFileHandler::new();
        let uri = file_uri(dir.path());
        let entries = handler.store_path(&uri, &StoreOptions::default()).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn directory_enumeration_fails_at_max_objects() {
        let dir = camino_tempfile::tempdir().unwrap();
        for i in 0..3 {
            tokio::fs::write(dir.path().join(format!("f{i}")), b"x").await.unwrap();
        }
        let handler = LocalFileHandler::new();
        let uri = file_uri(dir.path());
        let opts = StoreOptions {
            max_objects: 2,
            ..Default::default()
        };
        let res = handler.store_path(&uri, &opts).await;
        assert!(matches!(res, Err(ArtifactError::ObjectLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn directory_enumeration_fails_with_exactly_max_objects_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        for i in 0..2 {
            tokio::fs::write(dir.path().join(format!("f{i}")), b"x").await.unwrap();
        }
        let handler = LocalFileHandler::new();
        let uri = file_uri(dir.path());
        let opts = StoreOptions {
            max_objects: 2,
            ..Default::default()
        };
        let res = handler.store_path(&uri, &opts).await;
        assert!(matches!(res, Err(ArtifactError::ObjectLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn load_verifies_digest_and_copies() {
        let src_dir = camino_tempfile::tempdir().unwrap();
        let artifact_dir = camino_tempfile::tempdir().unwrap();
        let source_path = src_dir.path().join("x.txt");
        tokio::fs::write(&source_path, b"payload").await.unwrap();

        let digest = crate::hash::md5_of_str("payload").to_base64();
        let entry = ManifestEntry::new("x.txt", digest)
            .unwrap()
            .with_ref(file_uri(&source_path));

        let handler = LocalFileHandler::new();
        let loaded = handler
            .load_path(artifact_dir.path(), &entry, true)
            .await
            .unwrap();
        match loaded {
            Loaded::Path(p) => {
                assert_eq!(tokio::fs::read(&p).await.unwrap(), b"payload");
            }
            Loaded::Uri(_) => panic!("expected a local path"),
        }
    }

    #[tokio::test]
    async fn load_fails_on_digest_mismatch() {
        let src_dir = camino_tempfile::tempdir().unwrap();
        let artifact_dir = camino_tempfile::tempdir().unwrap();
        let source_path = src_dir.path().join("x.txt");
        tokio::fs::write(&source_path, b"payload").await.unwrap();

        let entry = ManifestEntry::new("x.txt", "not-the-real-digest")
            .unwrap()
            .with_ref(file_uri(&source_path));

        let handler = LocalFileHandler::new();
        let res = handler.load_path(artifact_dir.path(), &entry, true).await;
        assert!(matches!(res, Err(ArtifactError::DigestMismatch { .. })));
    }
}
