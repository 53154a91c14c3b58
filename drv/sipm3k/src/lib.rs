// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for Bridgeport SiPM-3000 scintillation detectors.
//!
//! The device speaks a command-buffer protocol over USB bulk endpoints:
//! every operation starts with a fixed 64-byte command buffer whose first
//! word describes the transfer, and register data follows on the data
//! endpoints (or rides inside the command buffer itself when it fits, a
//! "short write"). Registers live in two memory spaces, RAM and NVRAM,
//! selected per transfer.
//!
//! Container types and their decoding helpers are in [`registers`]; this
//! module owns device discovery and the transfers themselves.

pub mod registers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rusb::UsbContext;
use zerocopy::{FromZeros, IntoBytes};

use crate::registers::{ArmVersion, Registers};

/// Which memory space a transfer touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Ram = 0,
    Nvram = 1,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("usb transfer failed: {0}")]
    Usb(#[from] rusb::Error),
}

pub const BRIDGEPORT_VID: u16 = 0x1fa4;
const DETECTOR_INTERFACE: u8 = 1;

const CMD_OUT_EP: u8 = 0x01;
const DATA_OUT_EP: u8 = 0x02;
const DATA_IN_EP: u8 = 0x82;

const TIMEOUT: Duration = Duration::from_millis(1000);

// The ARM processor inside the detector only has a 256-byte buffer, so
// every transfer is chunked to that size.
const CHUNK_SIZE: usize = 256;

const COMMAND_BUFFER_SIZE: usize = 64;
const HEADER_SIZE: usize = 4;

// Data rides inside the command buffer when this flag is set, instead of
// on the data endpoint.
const SHORT_WRITE_FLAG: u32 = 0x800;

/// First word of the command buffer:
/// bits 31..16 byte count, 15..12 memory space, 11..4 command id,
/// 3..0 transfer flags (plus the short-write flag above).
fn command_header(
    nbytes: u32,
    memory_type: u32,
    command_id: u32,
    transfer_flags: u32,
) -> u32 {
    (nbytes << 16) + (memory_type << 12) + (command_id << 4) + transfer_flags
}

/// One detector on the bus, addressed by its ARM serial number.
pub struct UsbManager {
    handle: rusb::DeviceHandle<rusb::Context>,
    arm_serial: String,
}

impl UsbManager {
    fn new(handle: rusb::DeviceHandle<rusb::Context>) -> Result<Self, Error> {
        let mut manager = Self {
            handle,
            arm_serial: String::new(),
        };
        let version: ArmVersion = manager.read(MemoryType::Ram)?;
        manager.arm_serial = version.serial_number();
        Ok(manager)
    }

    pub fn arm_serial(&self) -> &str {
        &self.arm_serial
    }

    /// Reads a register container out of the selected memory space.
    pub fn read<C: Registers>(&self, memory_type: MemoryType) -> Result<C, Error> {
        let mut con = C::new_zeroed();
        let header = command_header(
            core::mem::size_of::<C>() as u32,
            memory_type as u32,
            C::FLAGS.command_id.into(),
            C::FLAGS.read_type.into(),
        );
        let mut command_buffer = [0u8; COMMAND_BUFFER_SIZE];
        command_buffer[..HEADER_SIZE].copy_from_slice(&header.to_le_bytes());

        self.write_chunks(CMD_OUT_EP, &command_buffer)?;
        self.read_chunks(DATA_IN_EP, con.as_mut_bytes())?;
        Ok(con)
    }

    /// Writes a register container into the selected memory space.
    pub fn write<C: Registers>(
        &self,
        con: &C,
        memory_type: MemoryType,
    ) -> Result<(), Error> {
        let data = con.as_bytes();
        let short_write = HEADER_SIZE + data.len() <= COMMAND_BUFFER_SIZE;

        let nbytes = if short_write {
            COMMAND_BUFFER_SIZE
        } else {
            data.len()
        };
        let mut transfer_flags = u32::from(C::FLAGS.write_type);
        if short_write {
            transfer_flags += SHORT_WRITE_FLAG;
        }
        let header = command_header(
            nbytes as u32,
            memory_type as u32,
            C::FLAGS.command_id.into(),
            transfer_flags,
        );

        let mut command_buffer = [0u8; COMMAND_BUFFER_SIZE];
        command_buffer[..HEADER_SIZE].copy_from_slice(&header.to_le_bytes());
        if short_write {
            command_buffer[HEADER_SIZE..HEADER_SIZE + data.len()]
                .copy_from_slice(data);
        }

        self.write_chunks(CMD_OUT_EP, &command_buffer)?;
        if !short_write {
            self.write_chunks(DATA_OUT_EP, data)?;
        }
        Ok(())
    }

    fn write_chunks(&self, endpoint: u8, data: &[u8]) -> Result<(), Error> {
        for chunk in data.chunks(CHUNK_SIZE) {
            let sent = self.handle.write_bulk(endpoint, chunk, TIMEOUT)?;
            if sent != chunk.len() {
                warn!(
                    "{}: short bulk write: {} of {} bytes",
                    self.arm_serial,
                    sent,
                    chunk.len()
                );
            }
        }
        Ok(())
    }

    fn read_chunks(&self, endpoint: u8, data: &mut [u8]) -> Result<(), Error> {
        for chunk in data.chunks_mut(CHUNK_SIZE) {
            let want = chunk.len();
            let got = self.handle.read_bulk(endpoint, chunk, TIMEOUT)?;
            if got != want {
                warn!(
                    "{}: short bulk read: {got} of {want} bytes",
                    self.arm_serial
                );
            }
        }
        Ok(())
    }
}

/// All Bridgeport detectors found on the bus, keyed by ARM serial number.
///
/// Built fresh on every detector reconnect; holding onto a stale manager
/// holds onto stale USB handles.
pub struct DeviceManager {
    devices: BTreeMap<String, Arc<UsbManager>>,
}

impl DeviceManager {
    pub fn scan() -> Result<Self, Error> {
        let context = rusb::Context::new()?;
        let mut devices = BTreeMap::new();

        for device in context.devices()?.iter() {
            let descriptor = device.device_descriptor()?;
            if descriptor.vendor_id() != BRIDGEPORT_VID {
                continue;
            }

            let mut handle = match device.open() {
                Ok(h) => h,
                Err(e) => {
                    warn!("cannot open Bridgeport device: {e}");
                    continue;
                }
            };
            // Unsupported on some platforms; claiming will still work.
            let _ = handle.set_auto_detach_kernel_driver(true);
            match handle.claim_interface(DETECTOR_INTERFACE) {
                Ok(()) => (),
                Err(rusb::Error::Busy) => {
                    debug!("Bridgeport device busy; claimed elsewhere");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let manager = UsbManager::new(handle)?;
            debug!("found SiPM-3000 {}", manager.arm_serial());
            devices.insert(manager.arm_serial().to_owned(), Arc::new(manager));
        }

        Ok(Self { devices })
    }

    pub fn get(&self, arm_serial: &str) -> Option<Arc<UsbManager>> {
        self.devices.get(arm_serial).cloned()
    }

    pub fn serials(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{ArmCal, FpgaAction, FpgaCtrl, FpgaHistogram, McaFlags};

    #[test]
    fn header_packs_documented_fields() {
        // 256-byte FPGA read of command 8, RAM space.
        let h = command_header(256, 0, 8, 2);
        assert_eq!(h >> 16, 256);
        assert_eq!((h >> 12) & 0xf, 0);
        assert_eq!((h >> 4) & 0xff, 8);
        assert_eq!(h & 0xf, 2);
    }

    #[test]
    fn header_short_write_sets_bit_11() {
        let h = command_header(64, 1, 7, 1 + SHORT_WRITE_FLAG);
        assert_eq!(h >> 16, 64);
        assert_eq!((h >> 12) & 0xf, 1);
        assert_ne!(h & 0x800, 0);
        assert_eq!(h & 0xf, 1);
    }

    #[test]
    fn short_write_eligibility_tracks_container_size() {
        // An 8-byte action block and a 32-byte control block fit in the
        // command buffer; a histogram clearly does not.
        assert!(HEADER_SIZE + core::mem::size_of::<FpgaAction>() <= COMMAND_BUFFER_SIZE);
        assert!(HEADER_SIZE + core::mem::size_of::<FpgaCtrl>() <= COMMAND_BUFFER_SIZE);
        assert!(HEADER_SIZE + core::mem::size_of::<ArmCal>() > COMMAND_BUFFER_SIZE);
        assert!(HEADER_SIZE + core::mem::size_of::<FpgaHistogram>() > COMMAND_BUFFER_SIZE);
    }

    #[test]
    fn flags_distinguish_arm_and_fpga_spaces() {
        assert_eq!(
            ArmCal::FLAGS,
            McaFlags {
                read_type: 4,
                write_type: 3,
                command_id: 3
            }
        );
        assert_eq!(
            FpgaCtrl::FLAGS,
            McaFlags {
                read_type: 2,
                write_type: 1,
                command_id: 0
            }
        );
    }
}
