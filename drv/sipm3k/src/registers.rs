// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register containers for the SiPM-3000 ARM and FPGA memory spaces.
//!
//! Each container is a fixed-size register array paired with the constant
//! command flags the USB protocol needs to move it: a command id, plus
//! distinct read/write transfer types for the ARM and FPGA spaces. The
//! [`Registers`] trait ties the two together so the transport layer can
//! shuttle any container without knowing what is inside it.
//!
//! Decoding helpers live on the containers whose contents have structure
//! beyond a flat register file (results words, time slices, NRL events).

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const FPGA_WRITE_TYPE: u8 = 1;
const FPGA_READ_TYPE: u8 = 2;
const ARM_WRITE_TYPE: u8 = 3;
const ARM_READ_TYPE: u8 = 4;

/// Transfer constants for one register container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McaFlags {
    pub read_type: u8,
    pub write_type: u8,
    pub command_id: u8,
}

/// A register container that can be moved over the command-buffer
/// protocol. The byte image of the container is exactly what crosses the
/// bus, in device (little-endian) order.
pub trait Registers: IntoBytes + FromBytes + Immutable + KnownLayout + Sized {
    const FLAGS: McaFlags;
}

macro_rules! arm_container {
    ($(#[$attr:meta])* $name:ident, $word:ty, $count:expr, $id:expr) => {
        $(#[$attr])*
        #[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
        #[repr(transparent)]
        pub struct $name(pub [$word; $count]);

        impl Registers for $name {
            const FLAGS: McaFlags = McaFlags {
                read_type: ARM_READ_TYPE,
                write_type: ARM_WRITE_TYPE,
                command_id: $id,
            };
        }
    };
}

macro_rules! fpga_container {
    ($(#[$attr:meta])* $name:ident, $word:ty, $count:expr, $id:expr) => {
        $(#[$attr])*
        #[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
        #[repr(transparent)]
        pub struct $name(pub [$word; $count]);

        impl Registers for $name {
            const FLAGS: McaFlags = McaFlags {
                read_type: FPGA_READ_TYPE,
                write_type: FPGA_WRITE_TYPE,
                command_id: $id,
            };
        }
    };
}

arm_container!(
    /// Firmware version block; bytes 8..24 hold the ARM serial number.
    ArmVersion, u8, 64, 0
);
arm_container!(
    /// Live ARM readings: voltages, temperatures, and friends.
    ArmStatus, f32, 7, 1
);
arm_container!(ArmCtrl, f32, 64, 2);
arm_container!(ArmCal, f32, 64, 3);

fpga_container!(FpgaCtrl, u16, 16, 0);
fpga_container!(FpgaStatistics, u32, 16, 1);
fpga_container!(
    /// Acquisition status words; see the accessor methods for the
    /// documented bits of word 2.
    FpgaResults, u16, 16, 2
);
fpga_container!(FpgaHistogram, u32, 4096, 3);
fpga_container!(FpgaOscilloscopeTrace, i16, 1024, 4);
fpga_container!(FpgaListMode, u16, 1024, 5);
fpga_container!(FpgaWeights, u16, 16, 6);
fpga_container!(
    /// Write-only acquisition control block: {clear mask, 0, enable mask, 0}.
    FpgaAction, u16, 4, 7
);
fpga_container!(
    /// One 1/32 s histogram plus counters; decode with [`FpgaTimeSlice::decode`].
    FpgaTimeSlice, u16, 128, 8
);
fpga_container!(
    /// ADC bin map (rebin edge table) as stored on the device.
    FpgaMap, u16, 2048, 8
);
fpga_container!(
    /// One NRL list-mode buffer: 2048 six-word event slots.
    FpgaLmNrl1, u16, 12288, 9
);

/// Clear every accumulator and begin a fresh histogram acquisition.
pub const START_NEW_HISTOGRAM_ACQUISITION: FpgaAction =
    FpgaAction([0b1111, 0, 0b0001, 0]);
/// Clear every accumulator and begin a fresh list-mode acquisition.
pub const START_NEW_LIST_ACQUISITION: FpgaAction =
    FpgaAction([0b1111, 0, 0b0100, 0]);
/// Clear only the trace buffer and arm the oscilloscope.
pub const START_NEW_TRACE_ACQUISITION: FpgaAction =
    FpgaAction([0b0100, 0, 0b0010, 0]);

impl ArmVersion {
    /// The detector's ARM serial number, as upper-case hex. This is the
    /// stable identity used to pick devices off the bus and to name
    /// settings files.
    pub fn serial_number(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in &self.0[8..24] {
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }
}

impl FpgaResults {
    pub fn trace_done(&self) -> bool {
        self.0[2] & 0x4 != 0
    }

    /// How many unread time slices the FPGA has buffered.
    pub fn num_avail_time_slices(&self) -> u16 {
        (self.0[2] >> 9) & 0x7f
    }

    /// Whether NRL list buffer 0 or 1 has filled and awaits a drain.
    pub fn nrl_buffer_full(&self, buffer: u8) -> bool {
        // Bit 1 flags buffer 0, bit 3 flags buffer 1.
        let mask = if buffer == 0 { 0x2 } else { 0x8 };
        self.0[2] & mask != 0
    }
}

/// A decoded time-slice buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTimeSlice {
    pub buffer_number: u16,
    pub num_evts: u16,
    pub num_triggers: u16,
    /// 800 ns ticks.
    pub dead_time: u16,
    /// 25 nA ticks.
    pub anode_current: u16,
    pub histogram: [u16; 123],
}

impl FpgaTimeSlice {
    pub fn decode(&self) -> DecodedTimeSlice {
        let mut histogram = [0u16; 123];
        histogram.copy_from_slice(&self.0[5..128]);
        DecodedTimeSlice {
            buffer_number: self.0[0],
            num_evts: self.0[1],
            num_triggers: self.0[2],
            dead_time: self.0[3],
            anode_current: self.0[4],
            histogram,
        }
    }
}

/// One raw NRL list-mode event: six 16-bit words.
///
/// Words 2..5 carry a 51-bit wall clock in 25 ns ticks; the low three bits
/// of the final word extend the clock, and the next three bits are the
/// event flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NrlListDataPoint {
    pub psd: u16,
    pub energy: u16,
    pub wc0: u16,
    pub wc1: u16,
    pub wc2: u16,
    pub wc3af: u16,
}

// One event slot exactly; the decode below relies on it.
static_assertions::const_assert_eq!(
    core::mem::size_of::<NrlListDataPoint>(),
    2 * FpgaLmNrl1::EVT_SIZE
);

impl NrlListDataPoint {
    /// Wall clock in 25 ns ticks (51 bits).
    pub fn wall_clock(&self) -> u64 {
        u64::from(self.wc0)
            | u64::from(self.wc1) << 16
            | u64::from(self.wc2) << 32
            | u64::from(self.wc3af & 0x7) << 48
    }

    /// Set on the event generated by the PPS edge itself.
    pub fn was_pps(&self) -> bool {
        self.wc3af & 0x8 != 0
    }

    pub fn piled_up(&self) -> bool {
        self.wc3af & 0x10 != 0
    }

    pub fn out_of_range(&self) -> bool {
        self.wc3af & 0x20 != 0
    }
}

impl FpgaLmNrl1 {
    /// Number of 16-bit words per event slot.
    pub const EVT_SIZE: usize = 6;

    /// Unpacks the buffer into events. The first slot holds the event
    /// count (low 12 bits of word 0) rather than a real event, so it is
    /// skipped.
    pub fn decode(&self) -> Vec<NrlListDataPoint> {
        // The count field can express more events than the buffer has
        // slots; never read past the end.
        let num_evts =
            usize::from(self.0[0] & 0xfff).min(self.0.len() / Self::EVT_SIZE);
        let mut out = Vec::with_capacity(num_evts.saturating_sub(1));
        for i in 1..num_evts {
            let w = &self.0[i * Self::EVT_SIZE..(i + 1) * Self::EVT_SIZE];
            out.push(NrlListDataPoint {
                psd: w[0],
                energy: w[1],
                wc0: w[2],
                wc1: w[3],
                wc2: w[4],
                wc3af: w[5],
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn container_sizes_match_device_buffers() {
        use core::mem::size_of;
        assert_eq!(size_of::<ArmVersion>(), 64);
        assert_eq!(size_of::<ArmStatus>(), 28);
        assert_eq!(size_of::<ArmCtrl>(), 256);
        assert_eq!(size_of::<ArmCal>(), 256);
        assert_eq!(size_of::<FpgaCtrl>(), 32);
        assert_eq!(size_of::<FpgaStatistics>(), 64);
        assert_eq!(size_of::<FpgaResults>(), 32);
        assert_eq!(size_of::<FpgaHistogram>(), 16384);
        assert_eq!(size_of::<FpgaOscilloscopeTrace>(), 2048);
        assert_eq!(size_of::<FpgaListMode>(), 2048);
        assert_eq!(size_of::<FpgaWeights>(), 32);
        assert_eq!(size_of::<FpgaAction>(), 8);
        assert_eq!(size_of::<FpgaTimeSlice>(), 256);
        assert_eq!(size_of::<FpgaMap>(), 4096);
        assert_eq!(size_of::<FpgaLmNrl1>(), 24576);
    }

    #[test]
    fn serial_number_is_upper_hex_of_bytes_8_to_24() {
        let mut ver = ArmVersion([0; 64]);
        ver.0[8..24].copy_from_slice(&[
            0xab, 0x28, 0xcb, 0x7f, 0x4a, 0x34, 0x4e, 0x51, 0x20, 0x20, 0x20,
            0x38, 0x2e, 0x2b, 0x0b, 0xff,
        ]);
        assert_eq!(ver.serial_number(), "AB28CB7F4A344E51202020382E2B0BFF");
    }

    #[test]
    fn results_word_two_accessors() {
        let mut res = FpgaResults([0; 16]);
        assert!(!res.trace_done());
        assert_eq!(res.num_avail_time_slices(), 0);

        res.0[2] = 0x4;
        assert!(res.trace_done());

        // 7-bit slice count lives at bits 9..16.
        res.0[2] = 5 << 9;
        assert_eq!(res.num_avail_time_slices(), 5);
        res.0[2] = 0x7f << 9;
        assert_eq!(res.num_avail_time_slices(), 0x7f);

        res.0[2] = 0x2;
        assert!(res.nrl_buffer_full(0));
        assert!(!res.nrl_buffer_full(1));
        res.0[2] = 0x8;
        assert!(!res.nrl_buffer_full(0));
        assert!(res.nrl_buffer_full(1));
    }

    #[test]
    fn time_slice_decode_splits_header_and_histogram() {
        let mut slice = FpgaTimeSlice([0; 128]);
        slice.0[0] = 33; // buffer number
        slice.0[1] = 400; // events
        slice.0[2] = 450; // triggers
        slice.0[3] = 12; // dead time
        slice.0[4] = 7; // anode current
        for (i, reg) in slice.0[5..].iter_mut().enumerate() {
            *reg = i as u16;
        }

        let d = slice.decode();
        assert_eq!(d.buffer_number, 33);
        assert_eq!(d.num_evts, 400);
        assert_eq!(d.num_triggers, 450);
        assert_eq!(d.dead_time, 12);
        assert_eq!(d.anode_current, 7);
        assert_eq!(d.histogram[0], 0);
        assert_eq!(d.histogram[122], 122);
    }

    #[test]
    fn nrl_decode_skips_header_slot() {
        let mut buf = FpgaLmNrl1([0; 12288]);
        buf.0[0] = 3; // three slots: header + two events
        buf.0[6..12].copy_from_slice(&[1, 2, 3, 4, 5, 0x8]);
        buf.0[12..18].copy_from_slice(&[10, 20, 30, 40, 50, 0x30]);

        let pts = buf.decode();
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[0].psd, 1);
        assert_eq!(pts[0].energy, 2);
        assert!(pts[0].was_pps());
        assert!(!pts[0].piled_up());
        assert!(pts[1].piled_up());
        assert!(pts[1].out_of_range());
        assert!(!pts[1].was_pps());
    }

    #[test]
    fn nrl_wall_clock_is_51_bits() {
        let pt = NrlListDataPoint {
            psd: 0,
            energy: 0,
            wc0: 0xffff,
            wc1: 0xffff,
            wc2: 0xffff,
            wc3af: 0x7 | 0x38, // clock bits all set, all flags set
        };
        assert_eq!(pt.wall_clock(), (1 << 51) - 1);
    }

    #[test]
    fn empty_nrl_buffer_decodes_empty() {
        let buf = FpgaLmNrl1([0; 12288]);
        assert!(buf.decode().is_empty());
    }

    #[test]
    fn action_constants_encode_documented_masks() {
        assert_eq!(
            START_NEW_HISTOGRAM_ACQUISITION.0.as_bytes(),
            [0x0f, 0, 0, 0, 0x01, 0, 0, 0]
        );
        assert_eq!(
            START_NEW_LIST_ACQUISITION.0.as_bytes(),
            [0x0f, 0, 0, 0, 0x04, 0, 0, 0]
        );
        assert_eq!(
            START_NEW_TRACE_ACQUISITION.0.as_bytes(),
            [0x04, 0, 0, 0, 0x02, 0, 0, 0]
        );
    }
}
