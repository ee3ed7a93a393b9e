// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The auxiliary digest over the manifest-file-plus-payload pair, used to
//! reproduce the server's upload-set digest.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::md5_of_file;

/// The fixed logical path the serialized manifest JSON is registered under
/// within a server manifest (spec §3, §4.7 step 3).
pub const MANIFEST_JSON_PATH: &str = "wandb_manifest.json";

/// One `(path, base64_md5)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerManifestEntry {
    pub path: String,
    pub digest: String,
}

/// Ordered sequence of `(path, base64_md5)` pairs covering the serialized
/// manifest JSON (under [`MANIFEST_JSON_PATH`]) and any files staged
/// through `new_file`, sorted lexicographically by path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerManifest {
    entries: Vec<ServerManifestEntry>,
}

impl ServerManifest {
    /// Builds a server manifest from the manifest JSON file and every
    /// physical file previously staged through `new_file`.
    ///
    /// `staged_files` are `(upload_path, local_path)` pairs: the logical
    /// path the file should land under, and where to read its bytes from.
    pub async fn build(
        manifest_json_path: &Utf8Path,
        staged_files: &[(String, camino::Utf8PathBuf)],
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(staged_files.len() + 1);

        let manifest_digest = md5_of_file(manifest_json_path).await?;
        entries.push(ServerManifestEntry {
            path: MANIFEST_JSON_PATH.to_string(),
            digest: manifest_digest.to_base64(),
        });

        for (upload_path, local_path) in staged_files {
            let digest = md5_of_file(local_path).await?;
            entries.push(ServerManifestEntry {
                path: upload_path.clone(),
                digest: digest.to_base64(),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ServerManifestEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash::md5_of_str;

    #[tokio::test]
    async fn sorts_lexicographically_and_includes_manifest_json() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.json");
        tokio::fs::write(&manifest_path, b"{}").await.unwrap();

        let y_path = dir.path().join("y.bin");
        tokio::fs::write(&y_path, b"y-contents").await.unwrap();
        let x_path = dir.path().join("x.bin");
        tokio::fs::write(&x_path, b"x-contents").await.unwrap();

        let staged = vec![
            ("y.bin".to_string(), y_path.clone()),
            ("x.bin".to_string(), x_path.clone()),
        ];

        let server_manifest = ServerManifest::build(&manifest_path, &staged).await.unwrap();
        let paths: Vec<&str> = server_manifest
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, vec!["wandb_manifest.json", "x.bin", "y.bin"]);

        let manifest_entry = &server_manifest.entries()[0];
        assert_eq!(manifest_entry.digest, md5_of_str("{}").to_base64());
    }
}
