// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming MD5 over files and strings.
//!
//! Base64 of the raw digest bytes is the canonical on-the-wire digest used
//! everywhere a content digest appears in a manifest.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use camino::Utf8Path;
use md5::{Digest as _, Md5};
use tokio::io::{AsyncReadExt, BufReader};

use crate::error::{ArtifactError, Result};

/// The chunk size used when streaming a file through the hasher.
const HASH_BUFFER_SIZE: usize = 65536;

/// The output of hashing a file or string: the raw 16 MD5 bytes, along with
/// the two textual encodings callers need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    pub fn raw(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

/// Hashes a UTF-8 string's bytes as MD5. Always treats input as UTF-8.
pub fn md5_of_str(s: &str) -> Md5Digest {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    let out: [u8; 16] = hasher.finalize().into();
    Md5Digest(out)
}

/// Streams a file's contents through MD5 in fixed `HASH_BUFFER_SIZE` chunks.
/// Empty files yield the MD5 of the empty string.
pub async fn md5_of_file(path: &Utf8Path) -> Result<Md5Digest> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ArtifactError::not_found(format!("{path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let count = reader.read(&mut buf).await?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }
    let out: [u8; 16] = hasher.finalize().into();
    Ok(Md5Digest(out))
}

/// Decodes a base64 MD5 digest to its lowercase hex form, the form the
/// managed-store download URL is keyed by (spec §4.5 `load_file`).
pub fn base64_md5_to_hex(b64: &str) -> Result<String> {
    let raw = BASE64
        .decode(b64)
        .map_err(|e| ArtifactError::validation(format!("invalid base64 digest {b64:?}: {e}")))?;
    Ok(hex::encode(raw))
}
