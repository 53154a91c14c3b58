// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Commands, wire records, and settings blobs.
//!
//! Everything that crosses a process boundary (science/debug/health
//! datagrams, on-disk settings) is a packed little-endian struct whose
//! size is pinned by a static assertion. The coordinator's command set is
//! the [`Command`] enum; the listener wraps each parsed command in
//! [`Command::PromiseWrap`] so it can await the outcome.

use std::net::SocketAddrV4;
use std::sync::mpsc::SyncSender;
use std::time::{SystemTime, UNIX_EPOCH};

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{F32, I16, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use drv_sipm3k::registers::NrlListDataPoint;

/// Scintillator channel identifier; doubles as the 1-byte tag in science
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, enum_map::Enum)]
pub enum Channel {
    C1,
    M1,
    M5,
    X1,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Self::C1, Self::M1, Self::M5, Self::X1];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::C1 => "c1",
            Self::M1 => "m1",
            Self::M5 => "m5",
            Self::X1 => "x1",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "c1" => Some(Self::C1),
            "m1" => Some(Self::M1),
            "m5" => Some(Self::M5),
            "x1" => Some(Self::X1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Seconds since the Unix epoch, truncated to the 32-bit stamps used in
/// the wire records.
pub fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// What a `debug hafx …` command reads; the discriminant is the 1-byte
/// type tag prepended to the emitted debug record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HafxDebugKind {
    ArmCtrl = 0,
    ArmCal = 1,
    ArmStatus = 2,
    FpgaCtrl = 3,
    FpgaOscilloscopeTrace = 4,
    FpgaStatistics = 5,
    FpgaWeights = 6,
    Histogram = 7,
    ListMode = 8,
}

/// What a `debug x123 …` command reads; discriminant as above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum X123DebugTag {
    Histogram = 0,
    Diagnostic = 1,
    AsciiSettings = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X123DebugKind {
    Histogram { wait: u32 },
    Diagnostic,
    AsciiSettings { query: String },
}

/// Reply to a promise-wrapped command: the success payload or a
/// formatted error message.
pub type CommandOutcome = std::result::Result<String, String>;

#[derive(Debug)]
pub struct HafxSettingsUpdate {
    pub ch: Channel,
    pub settings: HafxSettings,
}

#[derive(Debug)]
pub struct HafxDebugRequest {
    pub ch: Channel,
    pub kind: HafxDebugKind,
    pub wait: u32,
}

/// Everything the coordinator knows how to do. One variant per handler.
#[derive(Debug)]
pub enum Command {
    Initialize,
    Shutdown,
    HafxSettings(HafxSettingsUpdate),
    X123Settings(X123Settings),
    HafxDebug(HafxDebugRequest),
    X123Debug(X123DebugKind),
    QueryTraceAcquisition { ch: Channel },
    QueryLegacyHistogram { ch: Channel },
    QueryListMode { ch: Channel },
    QueryX123DebugHistogram,
    CollectNominal { started: bool },
    StopNominal,
    StartNrlList { started: bool, full_size: bool },
    StopNrlList,
    StartPeriodicHealth { started: bool, seconds: u32, destinations: Vec<SocketAddrV4> },
    StopPeriodicHealth,
    PromiseWrap { reply: SyncSender<CommandOutcome>, inner: Box<Command> },
}

// ---------------------------------------------------------------------
// Health records

/// Per-scintillator health block inside [`HealthPacket`].
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct HafxHealth {
    /// 0.01 K / tick.
    pub arm_temp: U16,
    /// 0.01 K / tick.
    pub sipm_temp: U16,
    /// 0.01 V / tick.
    pub sipm_operating_voltage: U16,
    pub sipm_target_voltage: U16,
    pub counts: U32,
    /// Clock cycles.
    pub dead_time: U32,
    /// Clock cycles.
    pub real_time: U32,
}
const_assert_eq!(core::mem::size_of::<HafxHealth>(), 20);

/// X-123 health block inside [`HealthPacket`].
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct X123Health {
    /// 1 °C / tick.
    pub board_temp: i8,
    /// 0.5 V / tick.
    pub det_high_voltage: I16,
    /// 0.1 K / tick.
    pub det_temp: U16,
    pub fast_counts: U32,
    pub slow_counts: U32,
    /// 1 ms / tick.
    pub accumulation_time: U32,
    /// 1 ms / tick.
    pub real_time: U32,
}
const_assert_eq!(core::mem::size_of::<X123Health>(), 21);

/// One health datagram. Channels without a connected detector are
/// zero-filled.
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct HealthPacket {
    pub timestamp: U32,
    pub c1: HafxHealth,
    pub m1: HafxHealth,
    pub m5: HafxHealth,
    pub x1: HafxHealth,
    pub x123: X123Health,
}
const_assert_eq!(core::mem::size_of::<HealthPacket>(), 105);

// ---------------------------------------------------------------------
// Nominal science records

/// One 32 Hz time-slice record. Fixed-size so downstream timing analysis
/// can index into capture files directly.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct HafxNominalSpectrumStatus {
    pub ch: u8,
    pub buffer_number: U16,
    pub num_evts: U32,
    pub num_triggers: U32,
    /// 800 ns ticks.
    pub dead_time: U32,
    /// 25 nA ticks.
    pub anode_current: U32,
    pub histogram: [U32; 123],
    /// Unix seconds; non-zero only on the first slice of each second.
    pub time_anchor: U32,
    /// Non-zero when the buffer number ran past 31, i.e. a PPS was missed.
    pub missed_pps: u8,
}
const_assert_eq!(core::mem::size_of::<HafxNominalSpectrumStatus>(), 516);

/// NRL list-mode event stripped to four bytes:
/// bits 0..25 wall clock (200 ns ticks), 25..29 energy (top nibble of the
/// 16-bit value), then was_pps, piled_up, out_of_range.
///
/// The 25-bit clock wraps after ~6.7 s, comfortably past the few-second
/// acquisitions this mode is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(transparent)]
pub struct StrippedNrlDataPoint(pub U32);

const WALL_CLOCK_BITS: u32 = 25;
const WALL_CLOCK_MASK: u32 = (1 << WALL_CLOCK_BITS) - 1;

impl StrippedNrlDataPoint {
    pub fn from_raw(p: &NrlListDataPoint) -> Self {
        // 25 ns ticks scale down to 200 ns ticks (8 divisions).
        let wall_clock = (p.wall_clock() >> 3) as u32 & WALL_CLOCK_MASK;
        let energy = u32::from(p.energy >> 12) & 0xf;
        let mut bits = wall_clock | energy << 25;
        if p.was_pps() {
            bits |= 1 << 29;
        }
        if p.piled_up() {
            bits |= 1 << 30;
        }
        if p.out_of_range() {
            bits |= 1 << 31;
        }
        Self(U32::new(bits))
    }

    pub fn wall_clock(self) -> u32 {
        self.0.get() & WALL_CLOCK_MASK
    }

    pub fn energy(self) -> u8 {
        (self.0.get() >> 25) as u8 & 0xf
    }

    pub fn was_pps(self) -> bool {
        self.0.get() & 1 << 29 != 0
    }

    pub fn piled_up(self) -> bool {
        self.0.get() & 1 << 30 != 0
    }

    pub fn out_of_range(self) -> bool {
        self.0.get() & 1 << 31 != 0
    }
}
const_assert_eq!(core::mem::size_of::<StrippedNrlDataPoint>(), 4);

// ---------------------------------------------------------------------
// Settings blobs
//
// Persisted whole: a partial update reads the blob, overwrites the fields
// tagged present, and writes the whole blob back.

/// Per-scintillator settings, one file per ARM serial number.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct HafxSettings {
    pub adc_rebin_edges_len: U16,
    pub adc_rebin_edges: [U16; 2048],
    pub fpga_ctrl_present: u8,
    pub fpga_ctrl: [U16; 16],
    pub arm_ctrl_present: u8,
    pub arm_ctrl: [F32; 64],
    pub arm_cal_present: u8,
    pub arm_cal: [F32; 64],
    pub fpga_weights_present: u8,
    pub fpga_weights: [U16; 16],
}

impl Default for HafxSettings {
    fn default() -> Self {
        zerocopy::FromZeros::new_zeroed()
    }
}

/// X-123 settings, one file for the single spectrometer.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct X123Settings {
    pub ack_err_retries_present: u8,
    pub ack_err_retries: U32,
    pub ascii_settings_len: U16,
    pub ascii_settings: [u8; 512],
    pub adc_rebin_edges_len: U16,
    pub adc_rebin_edges: [U32; 128],
}

impl Default for X123Settings {
    fn default() -> Self {
        zerocopy::FromZeros::new_zeroed()
    }
}

impl X123Settings {
    pub fn ascii_settings_str(&self) -> &str {
        let len = usize::from(self.ascii_settings_len.get())
            .min(self.ascii_settings.len());
        std::str::from_utf8(&self.ascii_settings[..len]).unwrap_or("")
    }
}
