// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use artifact_engine::artifact::Artifact;
    use artifact_engine::cache::{ArtifactsCache, FsArtifactsCache};
    use artifact_engine::hash::md5_of_str;
    use artifact_engine::manifest::ArtifactManifest;
    use artifact_engine::policy::StoragePolicy;
    use artifact_engine::progress::discard_logger;

    fn policy() -> Arc<StoragePolicy> {
        Arc::new(StoragePolicy::new(discard_logger()))
    }

    fn cache() -> (camino_tempfile::Utf8TempDir, Arc<dyn ArtifactsCache>) {
        let root = camino_tempfile::tempdir().unwrap();
        let cache: Arc<dyn ArtifactsCache> = Arc::new(FsArtifactsCache::new(root.path().to_path_buf()));
        (root, cache)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_file_artifact_digest_matches_the_reference_formula() {
        let (_root, cache) = cache();
        let src = camino_tempfile::tempdir().unwrap();
        let a_path = src.path().join("a.bin");
        let b_path = src.path().join("b.bin");
        tokio::fs::write(&a_path, b"a").await.unwrap();
        tokio::fs::write(&b_path, b"b").await.unwrap();

        let mut artifact = Artifact::new("dataset", "my-artifact", cache, policy()).unwrap();
        artifact.add_file(&a_path, Some("y.txt")).await.unwrap();
        artifact.add_file(&b_path, Some("x.txt")).await.unwrap();
        artifact.finalize().await.unwrap();

        let manifest_json = artifact.manifest().to_manifest_json();
        let keys: Vec<&String> = manifest_json["contents"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["x.txt", "y.txt"]);

        let b64_a = md5_of_str("a").to_base64();
        let b64_b = md5_of_str("b").to_base64();
        let preimage = format!("wandb-artifact-manifest-v1\nx.txt:{b64_b}\ny.txt:{b64_a}\n");
        let expected = {
            use md5::{Digest as _, Md5};
            let mut hasher = Md5::new();
            hasher.update(preimage.as_bytes());
            let out: [u8; 16] = hasher.finalize().into();
            hex::encode(out)
        };
        assert_eq!(artifact.digest().unwrap(), expected);

        // The persisted manifest round-trips to an equal digest.
        let json_str = artifact.manifest().to_json_string().unwrap();
        let restored = ArtifactManifest::from_json_str(&json_str, &[StoragePolicy::name()]).unwrap();
        assert_eq!(restored.digest(), expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finalize_is_idempotent_across_calls() {
        use tokio::io::AsyncWriteExt;

        let (_root, cache) = cache();
        let mut artifact = Artifact::new("dataset", "staged-artifact", cache, policy()).unwrap();

        let mut handle = artifact.new_file("payload.bin").await.unwrap();
        handle.write_all(b"bytes-from-new-file").await.unwrap();
        handle.flush().await.unwrap();
        drop(handle);

        let first = artifact.finalize().await.unwrap();
        let first_digest = artifact.digest().unwrap().to_string();
        let second = artifact.finalize().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(artifact.digest().unwrap(), first_digest);

        let cache_dir = artifact.cache_dir().expect("staged files adopt into the cache");
        assert!(cache_dir.join("payload.bin").exists());
        assert_eq!(
            tokio::fs::read(cache_dir.join("payload.bin")).await.unwrap(),
            b"bytes-from-new-file"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_scheme_reference_becomes_an_opaque_passthrough_entry() {
        let (_root, cache) = cache();
        let mut artifact = Artifact::new("dataset", "refs-artifact", cache, policy()).unwrap();

        artifact
            .add_reference("foo://host/thing", Some("t"), true, None)
            .await
            .unwrap();
        artifact.finalize().await.unwrap();

        let entry = artifact.manifest().get("t").unwrap();
        assert_eq!(entry.ref_uri.as_deref(), Some("foo://host/thing"));
        assert_eq!(entry.digest, "foo://host/thing");
    }
}
