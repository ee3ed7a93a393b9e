// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The discarding logger handed to `StoragePolicy`/`Artifact` when a
//! caller doesn't supply their own `slog::Logger`.

use once_cell::sync::OnceCell;
use slog::Logger;

static DISCARD_LOGGER: OnceCell<Logger> = OnceCell::new();

/// A `slog::Logger` that discards everything, used as the default when no
/// logger is supplied to a constructor.
pub fn discard_logger() -> Logger {
    DISCARD_LOGGER
        .get_or_init(|| Logger::root(slog::Discard, slog::o!()))
        .clone()
}
