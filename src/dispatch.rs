// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routes store/load calls to the handler registered for a URI's scheme.

use std::collections::HashMap;

use camino::Utf8Path;

use crate::entry::ManifestEntry;
use crate::error::{ArtifactError, Result};
use crate::handler::{Loaded, ReferenceHandler, StoreOptions};

/// Maps `scheme -> handler`, with an optional default used on a scheme
/// miss.
///
/// The dispatcher itself owns no scheme. Spec §9 notes the original
/// implementation's fallback check was inverted (it tested whether
/// *handlers* existed rather than whether a *default* was registered);
/// this implementation always falls back to the default handler, when one
/// is registered, on a scheme miss.
pub struct MultiHandler {
    handlers: HashMap<String, Box<dyn ReferenceHandler>>,
    default_handler: Option<Box<dyn ReferenceHandler>>,
}

impl MultiHandler {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default_handler: None,
        }
    }

    pub fn register(&mut self, handler: Box<dyn ReferenceHandler>) {
        match handler.scheme() {
            Some(scheme) => {
                self.handlers.insert(scheme.to_string(), handler);
            }
            None => {
                self.default_handler = Some(handler);
            }
        }
    }

    fn lookup(&self, scheme: &str) -> Result<&dyn ReferenceHandler> {
        if let Some(handler) = self.handlers.get(scheme) {
            return Ok(handler.as_ref());
        }
        if let Some(default) = &self.default_handler {
            return Ok(default.as_ref());
        }
        Err(ArtifactError::validation(format!(
            "no handler for scheme {scheme}"
        )))
    }

    fn scheme_of(uri: &str) -> Result<String> {
        let url = url::Url::parse(uri)
            .map_err(|e| ArtifactError::validation(format!("invalid reference URI {uri:?}: {e}")))?;
        Ok(url.scheme().to_string())
    }

    pub async fn store_path(&self, uri: &str, opts: &StoreOptions) -> Result<Vec<ManifestEntry>> {
        let scheme = Self::scheme_of(uri)?;
        self.lookup(&scheme)?.store_path(uri, opts).await
    }

    pub async fn load_path(
        &self,
        artifact_dir: &Utf8Path,
        entry: &ManifestEntry,
        local: bool,
    ) -> Result<Loaded> {
        let uri = entry
            .ref_uri
            .as_deref()
            .ok_or_else(|| ArtifactError::validation(format!("entry {} has no reference", entry.path)))?;
        let scheme = Self::scheme_of(uri)?;
        self.lookup(&scheme)?.load_path(artifact_dir, entry, local).await
    }
}

impl Default for MultiHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handler::passthrough::TrackingHandler;

    fn log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn falls_back_to_default_on_unknown_scheme() {
        let mut dispatcher = MultiHandler::new();
        dispatcher.register(Box::new(TrackingHandler::new(log())));

        let opts = StoreOptions {
            name: Some("t".to_string()),
            ..Default::default()
        };
        let entries = dispatcher.store_path("foo://host/thing", &opts).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].digest, "foo://host/thing");
    }

    #[tokio::test]
    async fn fails_with_no_default_and_no_match() {
        let dispatcher = MultiHandler::new();
        let opts = StoreOptions::default();
        let res = dispatcher.store_path("foo://host/thing", &opts).await;
        assert!(res.is_err());
    }
}
