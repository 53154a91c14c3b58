// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Amptek packet framing.
//!
//! Every packet on the wire is
//! `F5 FA | PID1 | PID2 | LEN_HI | LEN_LO | payload[LEN] | CKSUM_HI | CKSUM_LO`
//! where the checksum is `(0xFFFF ^ sum_of_all_preceding_bytes) + 1`.
//! Replies whose PID1 is `0xFF` are acknowledge packets; their PID2 indexes
//! a fixed table of outcomes, index 0 being plain success.
//!
//! [`Request`] builds outgoing frames, [`ResponseKind`] describes what a
//! reply must look like, and [`decode`] verifies a received frame against
//! that expectation before handing back its payload.

use crate::Error;

pub const SYNC_1: u8 = 0xF5;
pub const SYNC_2: u8 = 0xFA;

pub const HEADER_SIZE: usize = 6;
pub const CHECKSUM_SIZE: usize = 2;

/// PID1 of every acknowledge reply.
const ACK_PID1: u8 = 0xFF;

/// Longest accepted settings/readback query string.
pub const MAX_SETTINGS_LEN: usize = 512;
/// Longest text-configuration readback reply we accept.
pub const MAX_READBACK_SIZE: usize = 32767;

/// Trailing status block size, both standalone and after a spectrum.
pub const STATUS_SIZE: usize = 64;
pub const BYTES_PER_BIN: usize = 3;
pub const DIAGNOSTIC_SIZE: usize = 256;

pub type Pid = (u8, u8);

/// PID2 of an acknowledge reply, mapped to the device's complaint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckCode(pub u8);

impl AckCode {
    // Index of entry = PID2 value.
    const DECODE_PID2: [&'static str; 18] = [
        "OK",
        "Sync error",
        "PID error",
        "LEN error",
        "Checksum error",
        "Bad parameter",
        "Bad hex record (structure/chksum)",
        "Unrecognized command",
        "FPGA error (not initialized)",
        "CP2201 not found",
        "Scope data not available (not triggered)",
        "PC5 not present",
        "OK + Interface sharing request",
        "Busy - another interface is in use",
        "I2C error",
        "DO NOT USE OK + FPGA upload address",
        "Feature not supported by this FPGA version",
        "Calibration data not present",
    ];

    pub fn issue(self) -> &'static str {
        Self::DECODE_PID2
            .get(usize::from(self.0))
            .copied()
            .unwrap_or("unknown ack code")
    }
}

/// An outgoing packet: PID pair plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pid: Pid,
    payload: Vec<u8>,
}

macro_rules! zero_length_requests {
    ($($(#[$attr:meta])* $name:ident => ($pid1:expr, $pid2:expr);)*) => {
        $(
            $(#[$attr])*
            pub fn $name() -> Self {
                Self { pid: ($pid1, $pid2), payload: Vec::new() }
            }
        )*
    };
}

impl Request {
    zero_length_requests! {
        status => (0x01, 0x01);
        /// Current spectrum with the 64-byte status block appended.
        spectrum_plus_status => (0x02, 0x03);
        clear_spectrum => (0xF0, 0x01);
        mca_enable => (0xF0, 0x02);
        mca_disable => (0xF0, 0x03);
        diagnostic_data => (0x03, 0x05);
        clear_general_purpose_counter => (0xF0, 0x10);
        restart_sequential_buffering => (0xF0, 0x1E);
        cancel_sequential_buffering => (0xF0, 0x1F);
    }

    /// Read back sequential buffer `n` (spectrum + status at buffering
    /// time).
    pub fn request_buffer(n: u16) -> Self {
        Self {
            pid: (0x02, 0x07),
            payload: n.to_be_bytes().to_vec(),
        }
    }

    /// Apply an ASCII configuration string without touching flash.
    pub fn text_configuration_to_ram(settings: &str) -> Result<Self, Error> {
        Self::text_configuration((0x20, 0x04), settings)
    }

    /// Persist an ASCII configuration string to NVRAM.
    pub fn text_configuration_to_nvram(settings: &str) -> Result<Self, Error> {
        Self::text_configuration((0x20, 0x02), settings)
    }

    /// Query current values for the named settings (e.g. `"MCAC=;"`).
    pub fn text_configuration_readback(query: &str) -> Result<Self, Error> {
        Self::text_configuration((0x20, 0x03), query)
    }

    fn text_configuration(pid: Pid, settings: &str) -> Result<Self, Error> {
        if settings.len() > MAX_SETTINGS_LEN {
            return Err(Error::SettingsTooLong(settings.len()));
        }
        Ok(Self {
            pid,
            payload: settings.as_bytes().to_vec(),
        })
    }

    /// Frames the request for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(HEADER_SIZE + len + CHECKSUM_SIZE);
        out.extend_from_slice(&[
            SYNC_1,
            SYNC_2,
            self.pid.0,
            self.pid.1,
            ((len >> 8) & 0xff) as u8,
            (len & 0xff) as u8,
        ]);
        out.extend_from_slice(&self.payload);
        let ck = checksum(&out);
        out.push((ck >> 8) as u8);
        out.push((ck & 0xff) as u8);
        out
    }
}

/// What a reply to some request must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// 64-byte status block.
    Status,
    /// Spectrum plus trailing status; size depends on the MCA bin count.
    Spectrum { bins: u16 },
    /// 256-byte diagnostic dump.
    DiagnosticData,
    /// Variable-length ASCII settings readback.
    TextConfigurationReadback,
    /// Plain acknowledge; PID2 0 on success.
    Ack,
}

impl ResponseKind {
    fn pid(self) -> Pid {
        match self {
            Self::Status => (0x81, 0x01),
            Self::Spectrum { bins } => (0x81, spectrum_pid2(bins)),
            Self::DiagnosticData => (0x82, 0x05),
            Self::TextConfigurationReadback => (0x82, 0x07),
            Self::Ack => (ACK_PID1, 0x00),
        }
    }

    /// Expected payload length, or `None` when the length field decides.
    fn payload_size(self) -> Option<usize> {
        match self {
            Self::Status => Some(STATUS_SIZE),
            Self::Spectrum { bins } => {
                Some(usize::from(bins) * BYTES_PER_BIN + STATUS_SIZE)
            }
            Self::DiagnosticData => Some(DIAGNOSTIC_SIZE),
            Self::TextConfigurationReadback => None,
            Self::Ack => None,
        }
    }
}

/// The device answers spectrum requests with a PID2 that encodes the
/// configured bin count.
fn spectrum_pid2(bins: u16) -> u8 {
    match bins {
        256 => 0x02,
        512 => 0x04,
        1024 => 0x06,
        2048 => 0x08,
        4096 => 0x0A,
        // Callers validate the bin count against the supported set first.
        _ => 0x00,
    }
}

/// Whether a given MCA bin count has a matching spectrum response variant.
pub fn supported_bin_count(bins: u16) -> bool {
    matches!(bins, 256 | 512 | 1024 | 2048 | 4096)
}

fn checksum(preceding: &[u8]) -> u16 {
    let sum: u32 = preceding.iter().map(|&b| u32::from(b)).sum();
    ((0xffff ^ sum).wrapping_add(1) & 0xffff) as u16
}

/// Verifies a received frame against `expected` and returns its payload.
///
/// Acknowledge detection runs first so that an errored command surfaces as
/// [`Error::Ack`] rather than a PID mismatch.
pub fn decode(raw: &[u8], expected: ResponseKind) -> Result<Vec<u8>, Error> {
    if raw.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(Error::Truncated(raw.len()));
    }

    let pid = (raw[2], raw[3]);
    if pid != expected.pid() {
        if pid.0 == ACK_PID1 {
            return Err(Error::Ack(AckCode(pid.1)));
        }
        return Err(Error::WrongPid {
            got: pid,
            expected: expected.pid(),
        });
    }

    if raw[0] != SYNC_1 || raw[1] != SYNC_2 {
        return Err(Error::BadSync);
    }

    // Summing everything including the stored checksum must cancel to zero.
    let body_sum: u32 = raw[..raw.len() - CHECKSUM_SIZE]
        .iter()
        .map(|&b| u32::from(b))
        .sum();
    let stored =
        u32::from(raw[raw.len() - 1]) + 256 * u32::from(raw[raw.len() - 2]);
    if (body_sum + stored) & 0xffff != 0 {
        return Err(Error::BadChecksum);
    }

    let claimed = usize::from(raw[4]) << 8 | usize::from(raw[5]);
    let actual = raw.len() - HEADER_SIZE - CHECKSUM_SIZE;
    if claimed != actual {
        return Err(Error::WrongSize {
            got: actual,
            expected: claimed,
        });
    }
    match expected.payload_size() {
        Some(want) if want != actual => {
            return Err(Error::WrongSize {
                got: actual,
                expected: want,
            })
        }
        _ => (),
    }
    if expected == ResponseKind::TextConfigurationReadback
        && actual > MAX_READBACK_SIZE
    {
        return Err(Error::WrongSize {
            got: actual,
            expected: MAX_READBACK_SIZE,
        });
    }

    Ok(raw[HEADER_SIZE..HEADER_SIZE + actual].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(pid: Pid, payload: &[u8]) -> Vec<u8> {
        Request {
            pid,
            payload: payload.to_vec(),
        }
        .encode()
    }

    #[test]
    fn encode_lays_out_header_and_checksum() {
        let raw = Request::status().encode();
        assert_eq!(raw.len(), HEADER_SIZE + CHECKSUM_SIZE);
        assert_eq!(&raw[..6], &[0xF5, 0xFA, 0x01, 0x01, 0x00, 0x00]);
        // 0xffff ^ (0xF5 + 0xFA + 1 + 1) + 1 == 0xfe0f
        assert_eq!(&raw[6..], &[0xFE, 0x0F]);
    }

    #[test]
    fn request_buffer_number_is_big_endian() {
        let raw = Request::request_buffer(0x0123).encode();
        assert_eq!(&raw[..6], &[0xF5, 0xFA, 0x02, 0x07, 0x00, 0x02]);
        assert_eq!(&raw[6..8], &[0x01, 0x23]);
    }

    #[test]
    fn status_roundtrip() {
        let payload: Vec<u8> = (0..STATUS_SIZE as u8).collect();
        let raw = frame((0x81, 0x01), &payload);
        let got = decode(&raw, ResponseKind::Status).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn ack_error_is_detected_before_pid_mismatch() {
        let raw = frame((0xFF, 0x07), &[]);
        match decode(&raw, ResponseKind::Status) {
            Err(Error::Ack(code)) => {
                assert_eq!(code.issue(), "Unrecognized command")
            }
            other => panic!("expected ack error, got {other:?}"),
        }
    }

    #[test]
    fn ok_ack_passes_when_expected() {
        let raw = frame((0xFF, 0x00), &[]);
        assert!(decode(&raw, ResponseKind::Ack).unwrap().is_empty());
    }

    #[test]
    fn wrong_pid_is_rejected() {
        let raw = frame((0x81, 0x03), &[0; STATUS_SIZE]);
        assert!(matches!(
            decode(&raw, ResponseKind::Status),
            Err(Error::WrongPid { .. })
        ));
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let raw = frame((0x81, 0x01), &[0; STATUS_SIZE - 1]);
        assert!(matches!(
            decode(&raw, ResponseKind::Status),
            Err(Error::WrongSize { .. })
        ));
    }

    #[test]
    fn overlong_settings_string_is_refused() {
        let s = "x".repeat(MAX_SETTINGS_LEN + 1);
        assert!(matches!(
            Request::text_configuration_to_ram(&s),
            Err(Error::SettingsTooLong(_))
        ));
    }

    #[test]
    fn spectrum_sizes_follow_bin_count() {
        for bins in [256u16, 512, 1024, 2048, 4096] {
            let payload =
                vec![0u8; usize::from(bins) * BYTES_PER_BIN + STATUS_SIZE];
            let raw = frame((0x81, spectrum_pid2(bins)), &payload);
            let got = decode(&raw, ResponseKind::Spectrum { bins }).unwrap();
            assert_eq!(got.len(), payload.len());
        }
    }

    proptest! {
        #[test]
        fn roundtrip_preserves_payload(payload in proptest::collection::vec(any::<u8>(), 0..600)) {
            let raw = frame((0x82, 0x07), &payload);
            let got = decode(&raw, ResponseKind::TextConfigurationReadback).unwrap();
            prop_assert_eq!(got, payload);
        }

        #[test]
        fn any_single_byte_flip_is_rejected(
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            flip_bit in 0usize..8,
            pos_frac in 0.0f64..1.0,
        ) {
            let mut raw = frame((0x82, 0x07), &payload);
            let pos = ((raw.len() - 1) as f64 * pos_frac) as usize;
            raw[pos] ^= 1 << flip_bit;
            prop_assert!(decode(&raw, ResponseKind::TextConfigurationReadback).is_err());
        }
    }
}
