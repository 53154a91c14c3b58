// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-detector settings persistence.
//!
//! A settings file is the raw byte image of one packed settings blob,
//! nothing more; reads are size-checked against the blob type so a stale
//! or truncated file is rejected instead of misinterpreted.

use std::fs;
use std::path::{Path, PathBuf};

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{Error, Result};

pub struct SettingsStore {
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(dir: &Path, file_name: &str) -> Self {
        Self {
            file_path: dir.join(file_name),
        }
    }

    pub fn read<T: FromBytes>(&self) -> Result<T> {
        let raw = fs::read(&self.file_path).map_err(|e| {
            Error::Recoverable(format!(
                "can't open settings file {} for reading: {e}",
                self.file_path.display()
            ))
        })?;
        T::read_from_bytes(&raw).map_err(|_| {
            Error::Recoverable(format!(
                "file size did not match struct size for settings file {}",
                self.file_path.display()
            ))
        })
    }

    pub fn write<T: IntoBytes + Immutable>(&self, settings: &T) -> Result<()> {
        if let Some(dir) = self.file_path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                Error::Recoverable(format!(
                    "can't create settings directory {}: {e}",
                    dir.display()
                ))
            })?;
        }
        fs::write(&self.file_path, settings.as_bytes()).map_err(|e| {
            Error::Recoverable(format!(
                "can't open settings file {} for writing: {e}",
                self.file_path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::HafxSettings;
    use zerocopy::byteorder::little_endian::U16;

    #[test]
    fn roundtrip_preserves_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path(), "test.bin");

        let mut blob = HafxSettings::default();
        blob.adc_rebin_edges_len = U16::new(3);
        blob.adc_rebin_edges[0] = U16::new(0);
        blob.adc_rebin_edges[1] = U16::new(10);
        blob.adc_rebin_edges[2] = U16::new(123);
        blob.fpga_ctrl_present = 1;
        blob.fpga_ctrl[15] = U16::new(0xBEEF);
        store.write(&blob).unwrap();

        let back: HafxSettings = store.read().unwrap();
        assert_eq!(back.adc_rebin_edges_len.get(), 3);
        assert_eq!(back.adc_rebin_edges[2].get(), 123);
        assert_eq!(back.fpga_ctrl[15].get(), 0xBEEF);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path(), "nope.bin");
        assert!(store.read::<HafxSettings>().is_err());
    }

    #[test]
    fn wrong_size_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("short.bin"), [0u8; 16]).unwrap();
        let store = SettingsStore::new(dir.path(), "short.bin");
        assert!(store.read::<HafxSettings>().is_err());
    }

    #[test]
    fn write_creates_the_config_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("detector-config");
        let store = SettingsStore::new(&nested, "x123-settings.bin");
        store.write(&crate::messages::X123Settings::default()).unwrap();
        assert!(nested.join("x123-settings.bin").exists());
    }
}
