// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller for one HaFX scintillator channel.
//!
//! Owns the channel's USB handle, its settings file (keyed by the
//! detector's ARM serial number), the science time anchor, and the three
//! emitters. The coordinator drives all state transitions; between calls
//! the controller keeps nothing but the anchor and the emitters' buffers.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use zerocopy::IntoBytes;

use drv_sipm3k::registers::{
    ArmCal, ArmCtrl, ArmStatus, FpgaCtrl, FpgaLmNrl1, FpgaMap, FpgaResults,
    FpgaStatistics, FpgaTimeSlice, FpgaWeights, NrlListDataPoint, Registers,
    START_NEW_HISTOGRAM_ACQUISITION, START_NEW_LIST_ACQUISITION,
    START_NEW_TRACE_ACQUISITION,
};
use drv_sipm3k::{MemoryType, UsbManager};

use crate::error::{Error, Result};
use crate::messages::{
    unix_seconds, Channel, HafxDebugKind, HafxHealth, HafxNominalSpectrumStatus,
    HafxSettings, StrippedNrlDataPoint,
};
use crate::saver::{DataSaver, HafxPorts, QueuedDataSaver};
use crate::settings::SettingsStore;

/// Science records per emitted datagram; one second of 32 Hz slices.
const SLICES_PER_SECOND: usize = 32;

const CELSIUS_TO_KELVIN: f32 = 273.15;

pub struct HafxControl {
    channel: Channel,
    driver: Arc<UsbManager>,
    settings_store: SettingsStore,
    /// Unix seconds of the next anchored slice; `None` while the initial
    /// synchronising reads are being discarded.
    science_time_anchor: Option<u32>,
    full_size_nrl: bool,
    science_saver: QueuedDataSaver,
    nrl_saver: DataSaver,
    debug_saver: DataSaver,
}

impl HafxControl {
    pub fn new(
        driver: Arc<UsbManager>,
        channel: Channel,
        ports: HafxPorts,
        settings_dir: &Path,
    ) -> Result<Self> {
        let settings_store = SettingsStore::new(
            settings_dir,
            &format!("{}.bin", driver.arm_serial()),
        );
        Ok(Self {
            channel,
            driver,
            settings_store,
            science_time_anchor: None,
            full_size_nrl: false,
            science_saver: QueuedDataSaver::new(ports.science, SLICES_PER_SECOND)?,
            nrl_saver: DataSaver::new(ports.list)?,
            debug_saver: DataSaver::new(ports.debug)?,
        })
    }

    pub fn arm_serial(&self) -> &str {
        self.driver.arm_serial()
    }

    pub fn generate_health(&self) -> Result<HafxHealth> {
        let status: ArmStatus = self.driver.read(MemoryType::Ram)?;
        let stats: FpgaStatistics = self.driver.read(MemoryType::Ram)?;

        let to_centi = |x: f32| (x * 100.0) as u16;
        Ok(HafxHealth {
            arm_temp: to_centi(status.0[3] + CELSIUS_TO_KELVIN).into(),
            sipm_temp: to_centi(status.0[4] + CELSIUS_TO_KELVIN).into(),
            sipm_operating_voltage: to_centi(status.0[0]).into(),
            sipm_target_voltage: to_centi(status.0[1]).into(),
            counts: stats.0[1].into(),
            dead_time: stats.0[3].into(),
            real_time: stats.0[0].into(),
        })
    }

    pub fn restart_histogram(&self) -> Result<()> {
        self.driver
            .write(&START_NEW_HISTOGRAM_ACQUISITION, MemoryType::Ram)?;
        Ok(())
    }

    pub fn restart_list_mode(&self) -> Result<()> {
        self.driver
            .write(&START_NEW_LIST_ACQUISITION, MemoryType::Ram)?;
        Ok(())
    }

    pub fn restart_trace(&self) -> Result<()> {
        self.driver
            .write(&START_NEW_TRACE_ACQUISITION, MemoryType::Ram)?;
        Ok(())
    }

    pub fn check_trace_done(&self) -> Result<bool> {
        let results: FpgaResults = self.driver.read(MemoryType::Ram)?;
        Ok(results.trace_done())
    }

    pub fn set_time_anchor(&mut self, anchor: Option<u32>) {
        self.science_time_anchor = anchor;
    }

    /// Select "full-size" (raw 12-byte events) or stripped (4-byte)
    /// NRL emission.
    pub fn set_full_size_nrl(&mut self, full_size: bool) {
        self.full_size_nrl = full_size;
    }

    /// Reads out every time slice the FPGA has buffered and hands the
    /// decoded records to the queued science emitter.
    pub fn poll_save_time_slice(&mut self) -> Result<()> {
        let results: FpgaResults = self.driver.read(MemoryType::Ram)?;
        let avail = results.num_avail_time_slices();

        for _ in 0..avail {
            // Don't save the initial bad reads while the anchor is unset.
            let Some(anchor) = self.science_time_anchor else {
                warn!("anchor invalid for {}", self.arm_serial());
                continue;
            };
            let (record, next_anchor) = self.read_time_slice(anchor)?;
            self.science_time_anchor = Some(next_anchor);
            self.science_saver.add(&record)?;
        }
        Ok(())
    }

    fn read_time_slice(
        &self,
        anchor: u32,
    ) -> Result<(HafxNominalSpectrumStatus, u32)> {
        let slice: FpgaTimeSlice = self.driver.read(MemoryType::Ram)?;
        let decoded = slice.decode();

        let mut record: HafxNominalSpectrumStatus =
            zerocopy::FromZeros::new_zeroed();
        record.ch = self.channel.tag();

        // The first slice of each 32-slice second carries the timestamp;
        // the rest leave it zero.
        let mut next_anchor = anchor;
        if decoded.buffer_number % 32 == 0 {
            record.time_anchor = anchor.into();
            next_anchor += 1;
        }
        // A buffer number past 31 means a PPS never arrived to reset it.
        record.missed_pps = u8::from(decoded.buffer_number > 31);

        record.buffer_number = decoded.buffer_number.into();
        record.num_evts = u32::from(decoded.num_evts).into();
        record.num_triggers = u32::from(decoded.num_triggers).into();
        record.dead_time = u32::from(decoded.dead_time).into();
        record.anode_current = u32::from(decoded.anode_current).into();
        for (out, &count) in record.histogram.iter_mut().zip(&decoded.histogram) {
            *out = u32::from(count).into();
        }

        Ok((record, next_anchor))
    }

    /// Points the FPGA list-mode machinery at NRL buffer `n` by flipping
    /// bit 2 of control register 15 in non-volatile memory.
    pub fn swap_nrl_buffer(&self, n: u8) -> Result<()> {
        let mut ctrl: FpgaCtrl = self.driver.read(MemoryType::Nvram)?;
        let selected = ctrl.0[15] & 0x4 != 0;
        if n == 0 {
            if !selected {
                debug!("tried to swap to buffer 0 but was already in buffer 0");
                return Ok(());
            }
            ctrl.0[15] &= !0x4;
        } else {
            if selected {
                debug!("tried to swap to buffer 1 but was already in buffer 1");
                return Ok(());
            }
            ctrl.0[15] |= 0x4;
        }
        self.driver.write(&ctrl, MemoryType::Nvram)?;
        Ok(())
    }

    /// Drains whichever NRL buffers have filled since the last poll.
    ///
    /// A batch with no PPS-tagged event cannot be placed in time, so it
    /// is discarded (and logged) rather than emitted.
    pub fn poll_save_nrl_list(&mut self) -> Result<()> {
        let results: FpgaResults = self.driver.read(MemoryType::Ram)?;

        for buffer in [0u8, 1] {
            if !results.nrl_buffer_full(buffer) {
                continue;
            }
            self.swap_nrl_buffer(buffer)?;
            let list: FpgaLmNrl1 = self.driver.read(MemoryType::Ram)?;
            let points = list.decode();

            if !points.iter().any(NrlListDataPoint::was_pps) {
                warn!(
                    "{}: discarding NRL buffer {buffer} batch with no PPS tag ({} points)",
                    self.arm_serial(),
                    points.len()
                );
                continue;
            }
            let blob = frame_nrl_points(&points, self.full_size_nrl);
            self.nrl_saver.add(&blob)?;
        }
        Ok(())
    }

    /// Read-modify-write the settings file, then push every bank the
    /// update marked present out to the detector's non-volatile memory.
    pub fn update_settings(&self, new: &HafxSettings) -> Result<()> {
        self.save_settings(new)?;
        self.send_off_settings()
    }

    /// The settings blob from disk. When the file is missing or
    /// malformed, a "factory" blob synthesised from the detector's
    /// current non-volatile banks stands in.
    pub fn fetch_settings(&self) -> Result<HafxSettings> {
        match self.settings_store.read() {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("{e}; using NVRAM ones");
                self.construct_default_settings()
            }
        }
    }

    fn save_settings(&self, new: &HafxSettings) -> Result<()> {
        let mut to_save = self.fetch_settings()?;

        if new.adc_rebin_edges_len.get() != 0 {
            to_save.adc_rebin_edges_len = new.adc_rebin_edges_len;
            to_save.adc_rebin_edges = new.adc_rebin_edges;
        }
        if new.fpga_ctrl_present != 0 {
            to_save.fpga_ctrl_present = new.fpga_ctrl_present;
            to_save.fpga_ctrl = new.fpga_ctrl;
        }
        if new.arm_ctrl_present != 0 {
            to_save.arm_ctrl_present = new.arm_ctrl_present;
            to_save.arm_ctrl = new.arm_ctrl;
        }
        if new.arm_cal_present != 0 {
            to_save.arm_cal_present = new.arm_cal_present;
            to_save.arm_cal = new.arm_cal;
        }
        if new.fpga_weights_present != 0 {
            to_save.fpga_weights_present = new.fpga_weights_present;
            to_save.fpga_weights = new.fpga_weights;
        }

        self.settings_store.write(&to_save)
    }

    fn construct_default_settings(&self) -> Result<HafxSettings> {
        let mut settings = HafxSettings::default();

        let map: FpgaMap = self.driver.read(MemoryType::Nvram)?;
        for (out, reg) in settings.adc_rebin_edges.iter_mut().zip(map.0) {
            *out = reg.into();
        }
        let ctrl: FpgaCtrl = self.driver.read(MemoryType::Nvram)?;
        for (out, reg) in settings.fpga_ctrl.iter_mut().zip(ctrl.0) {
            *out = reg.into();
        }
        let arm_ctrl: ArmCtrl = self.driver.read(MemoryType::Nvram)?;
        for (out, reg) in settings.arm_ctrl.iter_mut().zip(arm_ctrl.0) {
            *out = reg.into();
        }
        let arm_cal: ArmCal = self.driver.read(MemoryType::Nvram)?;
        for (out, reg) in settings.arm_cal.iter_mut().zip(arm_cal.0) {
            *out = reg.into();
        }
        let weights: FpgaWeights = self.driver.read(MemoryType::Nvram)?;
        for (out, reg) in settings.fpga_weights.iter_mut().zip(weights.0) {
            *out = reg.into();
        }

        Ok(settings)
    }

    fn send_off_settings(&self) -> Result<()> {
        let settings: HafxSettings = self.settings_store.read()?;

        if settings.adc_rebin_edges_len.get() != 0 {
            let mut map = FpgaMap([0; 2048]);
            for (reg, edge) in map.0.iter_mut().zip(settings.adc_rebin_edges) {
                *reg = edge.get();
            }
            self.driver.write(&map, MemoryType::Nvram)?;
        }
        if settings.fpga_ctrl_present != 0 {
            let mut ctrl = FpgaCtrl([0; 16]);
            for (reg, v) in ctrl.0.iter_mut().zip(settings.fpga_ctrl) {
                *reg = v.get();
            }
            self.driver.write(&ctrl, MemoryType::Nvram)?;
        }
        if settings.arm_ctrl_present != 0 {
            let mut arm_ctrl = ArmCtrl([0.0; 64]);
            for (reg, v) in arm_ctrl.0.iter_mut().zip(settings.arm_ctrl) {
                *reg = v.get();
            }
            self.driver.write(&arm_ctrl, MemoryType::Nvram)?;
        }
        if settings.arm_cal_present != 0 {
            let mut arm_cal = ArmCal([0.0; 64]);
            for (reg, v) in arm_cal.0.iter_mut().zip(settings.arm_cal) {
                *reg = v.get();
            }
            self.driver.write(&arm_cal, MemoryType::Nvram)?;
        }
        if settings.fpga_weights_present != 0 {
            let mut weights = FpgaWeights([0; 16]);
            for (reg, v) in weights.0.iter_mut().zip(settings.fpga_weights) {
                *reg = v.get();
            }
            self.driver.write(&weights, MemoryType::Nvram)?;
        }
        Ok(())
    }

    /// Reads the requested register bank out of RAM and emits it to the
    /// debug stream behind a 1-byte type tag.
    pub fn read_save_debug<C: Registers>(&self, tag: HafxDebugKind) -> Result<()> {
        let bank: C = self.driver.read(MemoryType::Ram)?;
        info!("{}: debug read {tag:?}", self.arm_serial());

        let mut blob = Vec::with_capacity(1 + core::mem::size_of::<C>());
        blob.push(tag as u8);
        blob.extend_from_slice(bank.as_bytes());
        self.debug_saver.add(&blob)
    }
}

/// `<u16 count> <points…> <u32 timestamp after read>`, with the point
/// encoding picked by the full-size flag.
fn frame_nrl_points(points: &[NrlListDataPoint], full_size: bool) -> Vec<u8> {
    let point_size = if full_size {
        core::mem::size_of::<NrlListDataPoint>()
    } else {
        core::mem::size_of::<StrippedNrlDataPoint>()
    };
    let mut blob = Vec::with_capacity(2 + points.len() * point_size + 4);
    blob.extend_from_slice(&(points.len() as u16).to_le_bytes());
    if full_size {
        for point in points {
            blob.extend_from_slice(point.as_bytes());
        }
    } else {
        for point in points {
            blob.extend_from_slice(StrippedNrlDataPoint::from_raw(point).as_bytes());
        }
    }
    blob.extend_from_slice(&unix_seconds().to_le_bytes());
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(wc: u64, flags: u16) -> NrlListDataPoint {
        NrlListDataPoint {
            psd: 0,
            energy: 0x3000,
            wc0: wc as u16,
            wc1: (wc >> 16) as u16,
            wc2: (wc >> 32) as u16,
            wc3af: ((wc >> 48) & 0x7) as u16 | flags,
        }
    }

    #[test]
    fn stripped_nrl_frame_layout() {
        let points = [point(800, 0x8), point(1600, 0)];
        let blob = frame_nrl_points(&points, false);
        // count + 2 stripped points + timestamp
        assert_eq!(blob.len(), 2 + 2 * 4 + 4);
        assert_eq!(&blob[..2], &[2, 0]);
        // First point: 800 ticks of 25 ns -> 100 ticks of 200 ns.
        let first = u32::from_le_bytes(blob[2..6].try_into().unwrap());
        assert_eq!(first & 0x01ff_ffff, 100);
        assert_ne!(first & 1 << 29, 0); // was_pps
    }

    #[test]
    fn full_size_nrl_frame_keeps_raw_events() {
        let points = [point(800, 0x8)];
        let blob = frame_nrl_points(&points, true);
        assert_eq!(blob.len(), 2 + 12 + 4);
        // Raw event bytes start right after the count.
        assert_eq!(&blob[2..4], &[0, 0]); // psd
        assert_eq!(&blob[4..6], &[0x00, 0x30]); // energy
    }
}
