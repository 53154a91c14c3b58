// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The coordinator's error taxonomy.
//!
//! Handlers classify every failure into one of three kinds, and the event
//! loop dispatches on the kind alone: `Validation` and `Recoverable`
//! errors are reported (to the command's reply promise, or the log) and
//! leave detector state alone, while `Reconnect` additionally tears down
//! and rebuilds the USB device table.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A malformed or out-of-range command; nothing was changed.
    #[error("{0}")]
    Validation(String),

    /// The operation failed but the detectors are presumed healthy.
    #[error("{0}")]
    Recoverable(String),

    /// USB transport trouble; the device table must be rebuilt.
    #[error("reconnect required: {0}")]
    Reconnect(String),
}

// SiPM transfers ride directly on USB bulk endpoints, so any driver
// failure (including a transfer timeout) means the link is suspect.
impl From<drv_sipm3k::Error> for Error {
    fn from(e: drv_sipm3k::Error) -> Self {
        Self::Reconnect(format!("sipm3k: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
