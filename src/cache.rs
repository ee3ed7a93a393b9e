// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The content-addressed local cache finalized staging trees are adopted
//! into, indexed by `(artifact_type, digest)`.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Result;

/// Two calls with the same `(type, digest)` must return the same path. The
/// directory need not exist until the caller writes into it. The cache is
/// also the rename target during artifact finalization.
#[async_trait]
pub trait ArtifactsCache: Send + Sync {
    fn get_artifact_dir(&self, artifact_type: &str, digest: &str) -> Result<Utf8PathBuf>;

    /// Atomically adopts `staging_dir` as the tree for `(type, digest)`.
    /// Returns the path the tree now lives at, which may be `staging_dir`
    /// itself renamed in place, or (if another adoption already published
    /// this digest) the tree that adoption produced, with `staging_dir`
    /// left for the caller to discard.
    async fn adopt(&self, artifact_type: &str, digest: &str, staging_dir: &Utf8Path) -> Result<Utf8PathBuf>;
}

/// A filesystem-backed cache rooted at a single directory, laid out as
/// `<root>/<type>/<digest>`.
///
/// Adoption (spec §9 "cache race at finalization") is made atomic by
/// renaming to a sibling temp path and then swapping it into place only if
/// the destination doesn't already exist — the cache is treated as
/// write-once by digest, so a second finalize racing to the same
/// `(type, digest)` simply discards its redundant temp tree instead of
/// clobbering a tree another thread already published.
pub struct FsArtifactsCache {
    root: Utf8PathBuf,
}

impl FsArtifactsCache {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ArtifactsCache for FsArtifactsCache {
    fn get_artifact_dir(&self, artifact_type: &str, digest: &str) -> Result<Utf8PathBuf> {
        Ok(self.root.join(artifact_type).join(digest))
    }

    async fn adopt(&self, artifact_type: &str, digest: &str, staging_dir: &Utf8Path) -> Result<Utf8PathBuf> {
        let dest = self.get_artifact_dir(artifact_type, digest)?;
        if dest.exists() {
            return Ok(dest);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Rename to a sibling temp path first, then swap it into the final
        // digest-addressed slot, so a reader never observes a partially
        // renamed tree. If another adoption won the race between our
        // existence check and the rename, fall back to the tree it
        // published instead of erroring.
        let sibling_tmp = dest.with_extension(format!("tmp-{}", std::process::id()));
        tokio::fs::rename(staging_dir, &sibling_tmp).await?;
        match tokio::fs::rename(&sibling_tmp, &dest).await {
            Ok(()) => Ok(dest),
            Err(_) if dest.exists() => {
                let _ = tokio::fs::remove_dir_all(&sibling_tmp).await;
                Ok(dest)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_key_yields_same_path() {
        let cache = FsArtifactsCache::new("/var/cache/artifacts".into());
        let a = cache.get_artifact_dir("dataset", "abc123").unwrap();
        let b = cache.get_artifact_dir("dataset", "abc123").unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn adopt_moves_staging_dir_into_place() {
        let root = camino_tempfile::tempdir().unwrap();
        let cache = FsArtifactsCache::new(root.path().to_path_buf());

        let staging = camino_tempfile::tempdir().unwrap();
        tokio::fs::write(staging.path().join("f.txt"), b"hi").await.unwrap();
        let staging_path = staging.into_path();

        let dest = cache.adopt("dataset", "digest1", &staging_path).await.unwrap();
        assert!(dest.join("f.txt").exists());
    }

    #[tokio::test]
    async fn adopt_is_a_noop_when_already_present() {
        let root = camino_tempfile::tempdir().unwrap();
        let cache = FsArtifactsCache::new(root.path().to_path_buf());

        let first_staging = camino_tempfile::tempdir().unwrap();
        tokio::fs::write(first_staging.path().join("f.txt"), b"first")
            .await
            .unwrap();
        let dest = cache
            .adopt("dataset", "digest1", &first_staging.into_path())
            .await
            .unwrap();

        let second_staging = camino_tempfile::tempdir().unwrap();
        tokio::fs::write(second_staging.path().join("g.txt"), b"second")
            .await
            .unwrap();
        let dest2 = cache
            .adopt("dataset", "digest1", &second_staging.into_path())
            .await
            .unwrap();

        assert_eq!(dest, dest2);
        assert!(dest.join("f.txt").exists());
        assert!(!dest.join("g.txt").exists());
    }
}
