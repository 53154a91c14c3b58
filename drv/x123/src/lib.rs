// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the Amptek X-123 X-ray spectrometer.
//!
//! The device is strictly request/response over two bulk endpoints. Packet
//! construction and verification live in [`packets`]; [`UsbConnection`]
//! moves the frames. Retry policy on acknowledge errors belongs to the
//! caller; this crate reports exactly what the device said.

pub mod packets;

use std::time::Duration;

use rusb::UsbContext;

use crate::packets::{AckCode, Pid, Request, ResponseKind};

pub const AMPTEK_VID: u16 = 0x10c4;
pub const AMPTEK_PID: u16 = 0x842a;
const DETECTOR_INTERFACE: u8 = 0;

const BULK_OUT_ENDPOINT: u8 = 0x02;
const BULK_IN_ENDPOINT: u8 = 0x81;

// Long enough for a diagnostic packet.
const TIMEOUT: Duration = Duration::from_millis(5000);

// Largest reply we ever expect (4096-bin spectrum + status, framed).
const RECEIVE_BUFFER_SIZE: usize = 32800;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ack error: {}", .0.issue())]
    Ack(AckCode),
    #[error("usb transfer failed: {0}")]
    Usb(#[from] rusb::Error),
    #[error("x-123 not present on the bus")]
    NotPresent,
    #[error("sync error in received packet")]
    BadSync,
    #[error("checksum error in received packet")]
    BadChecksum,
    #[error("unexpected pid: got {got:02x?}, expected {expected:02x?}")]
    WrongPid { got: Pid, expected: Pid },
    #[error("packet size incorrect: {got} vs {expected}")]
    WrongSize { got: usize, expected: usize },
    #[error("received packet truncated at {0} bytes")]
    Truncated(usize),
    #[error("settings string of {0} bytes exceeds the device limit")]
    SettingsTooLong(usize),
}

impl Error {
    /// True for failures of the USB transport itself, as opposed to the
    /// device rejecting or garbling a packet.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Usb(_) | Self::NotPresent)
    }
}

/// An open, claimed connection to the spectrometer.
pub struct UsbConnection {
    handle: rusb::DeviceHandle<rusb::Context>,
}

impl UsbConnection {
    pub fn open() -> Result<Self, Error> {
        let context = rusb::Context::new()?;
        let mut handle = context
            .open_device_with_vid_pid(AMPTEK_VID, AMPTEK_PID)
            .ok_or(Error::NotPresent)?;
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(DETECTOR_INTERFACE)?;
        Ok(Self { handle })
    }

    /// Sends `request` and verifies the reply against `expected`,
    /// returning the reply payload.
    pub fn send_recv(
        &self,
        request: &Request,
        expected: ResponseKind,
    ) -> Result<Vec<u8>, Error> {
        self.send(request)?;
        self.receive(expected)
    }

    fn send(&self, request: &Request) -> Result<(), Error> {
        let raw = request.encode();
        self.handle.write_bulk(BULK_OUT_ENDPOINT, &raw, TIMEOUT)?;
        Ok(())
    }

    fn receive(&self, expected: ResponseKind) -> Result<Vec<u8>, Error> {
        let mut raw = vec![0u8; RECEIVE_BUFFER_SIZE];
        let got = self.handle.read_bulk(BULK_IN_ENDPOINT, &mut raw, TIMEOUT)?;
        raw.truncate(got);
        packets::decode(&raw, expected)
    }
}
