// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The artifact manifest (v1): an ordered entry set, its JSON form, and the
//! stable content-address digest computed over it.

use std::collections::BTreeMap;

use md5::{Digest as _, Md5};
use serde_json::{Map, Value};

use crate::entry::ManifestEntry;
use crate::error::{ArtifactError, Result};

pub const MANIFEST_VERSION: u64 = 1;
const DIGEST_PREAMBLE: &str = "wandb-artifact-manifest-v1\n";

/// The canonical record of all entries in an artifact.
///
/// Internally a [`BTreeMap`] keyed by path, which gives both O(log n)
/// duplicate detection and the lexicographic ordering spec §3/§4.6 require
/// at serialization and digest time for free.
#[derive(Clone, Debug)]
pub struct ArtifactManifest {
    storage_policy: String,
    storage_policy_config: Map<String, Value>,
    entries: BTreeMap<String, ManifestEntry>,
}

impl ArtifactManifest {
    pub fn new(storage_policy: impl Into<String>, storage_policy_config: Map<String, Value>) -> Self {
        Self {
            storage_policy: storage_policy.into(),
            storage_policy_config,
            entries: BTreeMap::new(),
        }
    }

    pub fn storage_policy(&self) -> &str {
        &self.storage_policy
    }

    pub fn storage_policy_config(&self) -> &Map<String, Value> {
        &self.storage_policy_config
    }

    /// Inserts a new entry. Fails if `entry.path` is already present (spec
    /// §3 invariant 1).
    pub fn insert(&mut self, entry: ManifestEntry) -> Result<()> {
        if self.entries.contains_key(&entry.path) {
            return Err(ArtifactError::validation(format!(
                "duplicate manifest path: {}",
                entry.path
            )));
        }
        self.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ManifestEntry> {
        self.entries.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Returns a prefix scan: all entries whose path starts with `prefix`.
    pub fn scan_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a ManifestEntry> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(p, _)| p.starts_with(prefix))
            .map(|(_, e)| e)
    }

    /// Entries in lexicographic path order — already guaranteed by the
    /// underlying `BTreeMap`.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    /// Mutable iteration, used only for the `local_path` remap cache
    /// adoption performs on finalize (spec §3 invariant 2).
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut ManifestEntry> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the persisted JSON form: sorted `contents` keys, empty/absent
    /// fields omitted, `local_path` never emitted.
    pub fn to_manifest_json(&self) -> Value {
        self.render_json(false)
    }

    /// Renders JSON including `local_path`, for in-process consumers only
    /// (e.g. debugging). Never used for the persisted manifest.
    pub fn to_manifest_json_with_local(&self) -> Value {
        self.render_json(true)
    }

    fn render_json(&self, include_local: bool) -> Value {
        let mut contents = Map::new();
        for (path, entry) in &self.entries {
            let mut obj = Map::new();
            obj.insert("digest".to_string(), Value::String(entry.digest.clone()));
            if let Some(r) = &entry.ref_uri {
                obj.insert("ref".to_string(), Value::String(r.clone()));
            }
            if let Some(size) = entry.size {
                obj.insert("size".to_string(), Value::Number(size.into()));
            }
            if !entry.extra.is_empty() {
                let extra: Map<String, Value> = entry
                    .extra
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                obj.insert("extra".to_string(), Value::Object(extra));
            }
            if include_local {
                if let Some(local) = &entry.local_path {
                    obj.insert("local_path".to_string(), Value::String(local.to_string()));
                }
            }
            contents.insert(path.clone(), Value::Object(obj));
        }

        let mut top = Map::new();
        top.insert("version".to_string(), Value::Number(MANIFEST_VERSION.into()));
        top.insert(
            "storagePolicy".to_string(),
            Value::String(self.storage_policy.clone()),
        );
        top.insert(
            "storagePolicyConfig".to_string(),
            Value::Object(self.storage_policy_config.clone()),
        );
        top.insert("contents".to_string(), Value::Object(contents));
        Value::Object(top)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_manifest_json())?)
    }

    /// Rebuilds a manifest from its persisted JSON form. Rejects any
    /// `version != 1`. `known_policies` is consulted to confirm the named
    /// storage policy exists (spec §4.6 "missing ⇒ error"); pass an
    /// empty slice to skip that check.
    pub fn from_manifest_json(value: &Value, known_policies: &[&str]) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ArtifactError::validation("manifest JSON is not an object"))?;

        let version = obj
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| ArtifactError::validation("manifest missing integer 'version'"))?;
        if version != MANIFEST_VERSION {
            return Err(ArtifactError::validation(format!(
                "unsupported manifest version: {version}"
            )));
        }

        let storage_policy = obj
            .get("storagePolicy")
            .and_then(Value::as_str)
            .ok_or_else(|| ArtifactError::validation("manifest missing 'storagePolicy'"))?
            .to_string();
        if !known_policies.is_empty() && !known_policies.contains(&storage_policy.as_str()) {
            return Err(ArtifactError::validation(format!(
                "unknown storage policy: {storage_policy}"
            )));
        }

        let storage_policy_config = obj
            .get("storagePolicyConfig")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut manifest = ArtifactManifest::new(storage_policy, storage_policy_config);

        let contents = obj
            .get("contents")
            .and_then(Value::as_object)
            .ok_or_else(|| ArtifactError::validation("manifest missing 'contents'"))?;

        for (path, entry_value) in contents {
            let entry_obj = entry_value
                .as_object()
                .ok_or_else(|| ArtifactError::validation(format!("entry {path} is not an object")))?;
            let digest = entry_obj
                .get("digest")
                .and_then(Value::as_str)
                .ok_or_else(|| ArtifactError::validation(format!("entry {path} missing digest")))?;
            let mut entry = ManifestEntry::new(path.clone(), digest)?;
            if let Some(r) = entry_obj.get("ref").and_then(Value::as_str) {
                entry = entry.with_ref(r);
            }
            if let Some(size) = entry_obj.get("size").and_then(Value::as_u64) {
                entry = entry.with_size(size);
            }
            if let Some(extra) = entry_obj.get("extra").and_then(Value::as_object) {
                for (k, v) in extra {
                    if let Some(v) = v.as_str() {
                        entry = entry.with_extra(k.clone(), v);
                    }
                }
            }
            manifest.insert(entry)?;
        }

        Ok(manifest)
    }

    pub fn from_json_str(s: &str, known_policies: &[&str]) -> Result<Self> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_manifest_json(&value, known_policies)
    }

    /// Computes the artifact's content address (spec §4.6): an MD5 over a
    /// versioned preamble and `"path:digest\n"` for every entry sorted by
    /// path ascending, byte-wise.
    pub fn digest(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(DIGEST_PREAMBLE.as_bytes());
        // `self.entries` is a BTreeMap<String, _>, whose default `Ord` for
        // `String` is already byte-wise ascending.
        for (path, entry) in &self.entries {
            hasher.update(path.as_bytes());
            hasher.update(b":");
            hasher.update(entry.digest.as_bytes());
            hasher.update(b"\n");
        }
        let out: [u8; 16] = hasher.finalize().into();
        hex::encode(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash::md5_of_str;

    fn manifest() -> ArtifactManifest {
        ArtifactManifest::new("wandb-storage-policy-v1", Map::new())
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut m = manifest();
        m.insert(ManifestEntry::new("x.txt", "d1").unwrap()).unwrap();
        let err = m.insert(ManifestEntry::new("x.txt", "d2").unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn contents_serialize_in_sorted_order() {
        let mut m = manifest();
        m.insert(ManifestEntry::new("y.txt", md5_of_str("a").to_base64()).unwrap())
            .unwrap();
        m.insert(ManifestEntry::new("x.txt", md5_of_str("b").to_base64()).unwrap())
            .unwrap();
        let json = m.to_manifest_json();
        let keys: Vec<&String> = json["contents"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["x.txt", "y.txt"]);
    }

    #[test]
    fn digest_matches_reference_formula() {
        let mut m = manifest();
        let b64_a = md5_of_str("a").to_base64();
        let b64_b = md5_of_str("b").to_base64();
        m.insert(ManifestEntry::new("y.txt", b64_a.clone()).unwrap())
            .unwrap();
        m.insert(ManifestEntry::new("x.txt", b64_b.clone()).unwrap())
            .unwrap();

        let mut hasher = Md5::new();
        hasher.update(DIGEST_PREAMBLE.as_bytes());
        hasher.update(format!("x.txt:{b64_b}\n").as_bytes());
        hasher.update(format!("y.txt:{b64_a}\n").as_bytes());
        let out: [u8; 16] = hasher.finalize().into();
        let expected = hex::encode(out);

        assert_eq!(m.digest(), expected);
    }

    #[test]
    fn digest_independent_of_insertion_order() {
        let mut m1 = manifest();
        m1.insert(ManifestEntry::new("a", "d1").unwrap()).unwrap();
        m1.insert(ManifestEntry::new("b", "d2").unwrap()).unwrap();

        let mut m2 = manifest();
        m2.insert(ManifestEntry::new("b", "d2").unwrap()).unwrap();
        m2.insert(ManifestEntry::new("a", "d1").unwrap()).unwrap();

        assert_eq!(m1.digest(), m2.digest());
    }

    #[test]
    fn round_trip_preserves_digest() {
        let mut m = manifest();
        m.insert(ManifestEntry::new("a", "d1").unwrap().with_size(3))
            .unwrap();
        m.insert(
            ManifestEntry::new("b", "etagvalue")
                .unwrap()
                .with_ref("s3://bucket/key")
                .with_extra("etag", "etagvalue"),
        )
        .unwrap();

        let json_str = m.to_json_string().unwrap();
        let restored = ArtifactManifest::from_json_str(&json_str, &[]).unwrap();
        assert_eq!(m.digest(), restored.digest());
    }

    #[test]
    fn rejects_wrong_version() {
        let value = serde_json::json!({
            "version": 2,
            "storagePolicy": "wandb-storage-policy-v1",
            "storagePolicyConfig": {},
            "contents": {},
        });
        assert!(ArtifactManifest::from_manifest_json(&value, &[]).is_err());
    }

    #[test]
    fn local_path_never_persisted() {
        let mut m = manifest();
        m.insert(
            ManifestEntry::new("a", "d1")
                .unwrap()
                .with_local_path("/tmp/staging/a".into()),
        )
        .unwrap();
        let json = m.to_manifest_json();
        assert!(json["contents"]["a"].get("local_path").is_none());
        let with_local = m.to_manifest_json_with_local();
        assert_eq!(with_local["contents"]["a"]["local_path"], "/tmp/staging/a");
    }
}
