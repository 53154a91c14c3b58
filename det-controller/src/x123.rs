// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller for the Amptek X-123 spectrometer.
//!
//! The driver wrapper absorbs acknowledge errors up to a configurable
//! retry count and turns USB transport failures into reconnect signals.
//! On top of it the controller implements health readout, the
//! hardware-controlled sequential buffering (HCSBO) cycle for nominal
//! science, settings persistence, and the debug reads.

use std::path::Path;

use log::{debug, warn};

use drv_x123::packets::{Request, ResponseKind, STATUS_SIZE};
use drv_x123::UsbConnection;

use crate::error::{Error, Result};
use crate::messages::{X123DebugTag, X123Health, X123Settings};
use crate::saver::{DataSaver, X123Ports};
use crate::settings::SettingsStore;

const SETTINGS_FILE: &str = "x123-settings.bin";
const DEFAULT_HISTOGRAM_BINS: u16 = 1024;

/// Counter configuration for HCSBO: count rising edges on AUX2,
/// independent of the MCA gate/enable/clear machinery. Written to RAM to
/// spare the flash.
const BUF_SETTINGS: &str = "GPED=RISING;GPGA=OFF;GPIN=AUX2;GPMC=OFF;GPME=OFF";

/// Synchronous request/response channel with ack-error retries.
pub struct X123DriverWrap {
    connection: Option<UsbConnection>,
    num_retries: usize,
}

impl X123DriverWrap {
    pub fn new(num_retries: usize) -> Self {
        let connection = match UsbConnection::open() {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("USB issue: {e}");
                None
            }
        };
        Self {
            connection,
            num_retries: num_retries.max(1),
        }
    }

    pub fn valid(&self) -> bool {
        self.connection.is_some()
    }

    pub fn set_num_retries(&mut self, n: usize) {
        self.num_retries = n.max(1);
    }

    pub fn send_recv(
        &self,
        request: &Request,
        expected: ResponseKind,
    ) -> Result<Vec<u8>> {
        let Some(connection) = &self.connection else {
            return Err(Error::Recoverable("X123 driver is null".into()));
        };

        let mut last_issue = "";
        for _ in 0..self.num_retries {
            match connection.send_recv(request, expected) {
                Ok(payload) => return Ok(payload),
                Err(drv_x123::Error::Ack(code)) => {
                    last_issue = code.issue();
                    debug!("ack error: {last_issue}");
                }
                Err(e) if e.is_transport() => {
                    return Err(Error::Reconnect(format!("X123 USB issue: {e}")))
                }
                Err(e) => {
                    return Err(Error::Recoverable(format!("x123 packet: {e}")))
                }
            }
        }
        Err(Error::Recoverable(format!(
            "x123 timed out or failed too many times: {last_issue}"
        )))
    }
}

/// Outcome of one buffer-counter reconciliation against device status.
enum CatchUp {
    /// Local counter matches or leads the device; nothing more to read.
    Done,
    /// The device has pulled ahead; read the next buffer too.
    Behind,
}

pub struct X123Control {
    driver: X123DriverWrap,
    /// Next sequential buffer number we expect the device to finish.
    /// Monotonic during a run; reset on each HCSBO restart.
    local_next_buffer_num: u16,
    time_anchor: u32,
    num_histogram_bins: u16,
    settings: X123Settings,
    settings_store: SettingsStore,
    science_saver: DataSaver,
    debug_saver: DataSaver,
}

impl X123Control {
    pub fn new(ports: X123Ports, settings_dir: &Path) -> Result<Self> {
        let settings_store = SettingsStore::new(settings_dir, SETTINGS_FILE);
        let settings = match settings_store.read() {
            Ok(s) => s,
            Err(_) => X123Settings::default(),
        };

        let mut ctrl = Self {
            driver: X123DriverWrap::new(1),
            local_next_buffer_num: 0,
            time_anchor: 0,
            num_histogram_bins: DEFAULT_HISTOGRAM_BINS,
            settings,
            settings_store,
            science_saver: DataSaver::new(ports.science)?,
            debug_saver: DataSaver::new(ports.debug)?,
        };
        if let Err(e) = ctrl.refresh_histogram_bins() {
            warn!("X-123 disconnected; using {DEFAULT_HISTOGRAM_BINS} bins as default ({e})");
            ctrl.num_histogram_bins = DEFAULT_HISTOGRAM_BINS;
        }
        Ok(ctrl)
    }

    pub fn driver_valid(&self) -> bool {
        self.driver.valid()
    }

    pub fn set_time_anchor(&mut self, anchor: u32) {
        self.time_anchor = anchor;
    }

    pub fn generate_health(&self) -> Result<X123Health> {
        let buf = self
            .driver
            .send_recv(&Request::status(), ResponseKind::Status)?;

        // Field offsets and units are from the Amptek programmer's guide.
        let le_u32 = |i: usize| {
            u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
        };

        // The top three bytes count 100 ms ticks, the low byte 1 ms.
        let acc_big = le_u32(12) >> 8;
        let acc_small = u32::from(buf[12]);

        Ok(X123Health {
            board_temp: buf[34] as i8,
            det_high_voltage: i16::from_be_bytes([buf[30], buf[31]]).into(),
            det_temp: (u16::from(buf[32] & 0xf) << 8 | u16::from(buf[33])).into(),
            fast_counts: le_u32(0).into(),
            slow_counts: le_u32(4).into(),
            accumulation_time: (acc_small + acc_big * 100).into(),
            real_time: le_u32(20).into(),
        })
    }

    /// Configures the general-purpose counter for AUX2 edges, clears it,
    /// and (re)starts sequential buffering. The local buffer counter
    /// starts over from zero.
    pub fn restart_hardware_controlled_sequential_buffering(&mut self) -> Result<()> {
        self.local_next_buffer_num = 0;
        self.driver.send_recv(
            &Request::text_configuration_to_ram(BUF_SETTINGS)
                .map_err(|e| Error::Recoverable(e.to_string()))?,
            ResponseKind::Ack,
        )?;
        self.driver.send_recv(
            &Request::clear_general_purpose_counter(),
            ResponseKind::Ack,
        )?;
        self.driver.send_recv(
            &Request::restart_sequential_buffering(),
            ResponseKind::Ack,
        )?;
        Ok(())
    }

    pub fn stop_sequential_buffering(&self) -> Result<()> {
        self.driver.send_recv(
            &Request::cancel_sequential_buffering(),
            ResponseKind::Ack,
        )?;
        Ok(())
    }

    /// Reads out every sequential buffer the device has completed since
    /// the last call, emitting one framed science record per buffer.
    ///
    /// The very first call after an HCSBO restart only advances the local
    /// counter: buffer #0 is still filling at that point.
    pub fn read_save_sequential_buffer(&mut self) -> Result<()> {
        if self.local_next_buffer_num == 0 {
            self.local_next_buffer_num += 1;
            return Ok(());
        }

        // The device may have completed several buffers (e.g. after a
        // stall on our side); keep reading until the counters agree.
        loop {
            match self.read_save_one_buffer()? {
                CatchUp::Behind => continue,
                CatchUp::Done => return Ok(()),
            }
        }
    }

    fn read_save_one_buffer(&mut self) -> Result<CatchUp> {
        let pre_read_time = self.time_anchor;
        let bins = self.num_histogram_bins;
        if !drv_x123::packets::supported_bin_count(bins) {
            return Err(Error::Recoverable(format!(
                "cannot read number of bins requested (X123 nominal read): {bins}"
            )));
        }

        let reply = self.driver.send_recv(
            &Request::request_buffer(self.local_next_buffer_num - 1),
            ResponseKind::Spectrum { bins },
        )?;
        let (spectrum_bytes, status_at_buffer) =
            reply.split_at(reply.len() - STATUS_SIZE);
        let rebinned = rebin_spectrum(
            &assemble_spectrum(spectrum_bytes),
            rebin_edges(&self.settings),
        )?;

        // The trailing status in the buffer reply is frozen at buffering
        // time; reconciliation needs a fresh one.
        let status = self
            .driver
            .send_recv(&Request::status(), ResponseKind::Status)?;
        let outcome = self.increment_reset_buffering(&status)?;

        let mut record = Vec::with_capacity(4 + STATUS_SIZE + 2 + 4 * rebinned.len());
        record.extend_from_slice(&pre_read_time.to_le_bytes());
        record.extend_from_slice(status_at_buffer);
        record.extend_from_slice(&(rebinned.len() as u16).to_le_bytes());
        for bin in &rebinned {
            record.extend_from_slice(&bin.to_le_bytes());
        }
        self.science_saver.add(&record)?;

        Ok(outcome)
    }

    /// Reconciles the local buffer counter with the device's (status
    /// bytes 46..48, a 9-bit big-endian value) and restarts buffering if
    /// the device reports it stopped.
    fn increment_reset_buffering(&mut self, status: &[u8]) -> Result<CatchUp> {
        let remote_next_buffer_num =
            u16::from(status[46] & 0x1) << 8 | u16::from(status[47]);

        // We are ahead, so do nothing.
        if remote_next_buffer_num < self.local_next_buffer_num {
            return Ok(CatchUp::Done);
        }

        self.local_next_buffer_num += 1;
        self.time_anchor += 1;

        if remote_next_buffer_num > self.local_next_buffer_num {
            return Ok(CatchUp::Behind);
        }

        let buffering_stopped = status[46] & 0x2 == 0;
        if buffering_stopped {
            self.restart_hardware_controlled_sequential_buffering()?;
        }
        Ok(CatchUp::Done)
    }

    /// Read-modify-write of the settings blob, then upload the ASCII
    /// configuration to NVRAM and re-probe the MCA bin count.
    pub fn update_settings(&mut self, new: &X123Settings) -> Result<()> {
        if new.adc_rebin_edges_len.get() != 0 {
            debug!(
                "new settings rebin edges (service): {} entries",
                new.adc_rebin_edges_len.get()
            );
            self.settings.adc_rebin_edges_len = new.adc_rebin_edges_len;
            self.settings.adc_rebin_edges = new.adc_rebin_edges;
        }

        if new.ack_err_retries_present != 0 {
            debug!(
                "new ack err retries (service): {}",
                new.ack_err_retries.get()
            );
            self.settings.ack_err_retries_present = new.ack_err_retries_present;
            self.settings.ack_err_retries = new.ack_err_retries;
            self.driver
                .set_num_retries(new.ack_err_retries.get() as usize);
        }

        if new.ascii_settings_len.get() != 0 {
            debug!(
                "new ascii settings (service): {}",
                new.ascii_settings_str()
            );
            self.settings.ascii_settings_len = new.ascii_settings_len;
            self.settings.ascii_settings = new.ascii_settings;
        }

        self.settings_store.write(&self.settings)?;

        // Push the settings to the X-123 only after everything has been
        // persisted.
        self.upload_ascii_settings()?;
        self.refresh_histogram_bins()
    }

    pub fn fetch_settings(&self) -> X123Settings {
        match self.settings_store.read() {
            Ok(s) => s,
            Err(_) => X123Settings::default(),
        }
    }

    fn upload_ascii_settings(&self) -> Result<()> {
        let request =
            Request::text_configuration_to_nvram(self.settings.ascii_settings_str())
                .map_err(|e| Error::Recoverable(format!("X123 exception: {e}")))?;
        self.driver.send_recv(&request, ResponseKind::Ack)?;
        debug!("settings uploaded successfully");
        Ok(())
    }

    /// Asks the device how many MCA bins it is configured for (`MCAC=;`)
    /// and caches the answer for spectrum reads.
    fn refresh_histogram_bins(&mut self) -> Result<()> {
        let request = Request::text_configuration_readback("MCAC=;")
            .map_err(|e| Error::Recoverable(e.to_string()))?;
        let reply = self
            .driver
            .send_recv(&request, ResponseKind::TextConfigurationReadback)?;
        let text = String::from_utf8_lossy(&reply);
        self.num_histogram_bins = parse_mcac(&text).ok_or_else(|| {
            Error::Recoverable(format!("cannot parse MCAC readback: {text}"))
        })?;
        Ok(())
    }

    pub fn read_save_debug_diagnostic(&self) -> Result<()> {
        let payload = self.driver.send_recv(
            &Request::diagnostic_data(),
            ResponseKind::DiagnosticData,
        )?;
        self.save_debug(X123DebugTag::Diagnostic, &payload)
    }

    /// Stops sequential buffering and starts a clean MCA accumulation for
    /// a debug histogram read later.
    pub fn init_debug_histogram(&self) -> Result<()> {
        self.driver.send_recv(
            &Request::cancel_sequential_buffering(),
            ResponseKind::Ack,
        )?;
        self.driver
            .send_recv(&Request::mca_disable(), ResponseKind::Ack)?;
        self.driver
            .send_recv(&Request::clear_spectrum(), ResponseKind::Ack)?;
        self.driver
            .send_recv(&Request::mca_enable(), ResponseKind::Ack)?;
        Ok(())
    }

    pub fn read_save_debug_histogram(&self) -> Result<()> {
        let bins = self.num_histogram_bins;
        if !drv_x123::packets::supported_bin_count(bins) {
            return Err(Error::Recoverable(format!(
                "cannot read number of bins requested (X123 debug read): {bins}"
            )));
        }
        let payload = self.driver.send_recv(
            &Request::spectrum_plus_status(),
            ResponseKind::Spectrum { bins },
        )?;
        self.save_debug(X123DebugTag::Histogram, &payload)
    }

    pub fn read_save_debug_ascii(&self, query: &str) -> Result<()> {
        debug!("ascii query in ctrl is: {query}");
        let request = Request::text_configuration_readback(query)
            .map_err(|e| Error::Recoverable(e.to_string()))?;
        let payload = self
            .driver
            .send_recv(&request, ResponseKind::TextConfigurationReadback)?;
        debug!("reply is: {}", String::from_utf8_lossy(&payload));
        self.save_debug(X123DebugTag::AsciiSettings, &payload)
    }

    /// `<u8 type> <u32 size> <bytes>`; some replies (ASCII readback) are
    /// variable-length, so the size rides along.
    fn save_debug(&self, tag: X123DebugTag, payload: &[u8]) -> Result<()> {
        let mut blob = Vec::with_capacity(1 + 4 + payload.len());
        blob.push(tag as u8);
        blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        blob.extend_from_slice(payload);
        self.debug_saver.add(&blob)
    }
}

fn rebin_edges(settings: &X123Settings) -> &[zerocopy::byteorder::little_endian::U32] {
    let len = usize::from(settings.adc_rebin_edges_len.get())
        .min(settings.adc_rebin_edges.len());
    &settings.adc_rebin_edges[..len]
}

/// Reassembles little-endian u24 bins into counts.
fn assemble_spectrum(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(3)
        .map(|b| u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16)
        .collect()
}

/// Sums the original bins between consecutive edge pairs:
/// `out[i] = sum(orig[edges[i] .. edges[i+1]])`. An empty edge table
/// passes the spectrum through untouched.
fn rebin_spectrum(
    original: &[u32],
    edges: &[zerocopy::byteorder::little_endian::U32],
) -> Result<Vec<u32>> {
    if edges.is_empty() {
        return Ok(original.to_vec());
    }

    for edge in edges {
        if edge.get() as usize > original.len() {
            return Err(Error::Recoverable(
                "X123 rebin edges out of bounds".into(),
            ));
        }
    }

    let mut out = Vec::with_capacity(edges.len().saturating_sub(1));
    for pair in edges.windows(2) {
        let (start, stop) = (pair[0].get() as usize, pair[1].get() as usize);
        let sum = original[start..stop.max(start)]
            .iter()
            .fold(0u32, |acc, &c| acc.wrapping_add(c));
        out.push(sum);
    }
    Ok(out)
}

/// Pulls the bin count out of an `MCAC=<n>;` readback string.
fn parse_mcac(text: &str) -> Option<u16> {
    let start = text.find("MCAC=")? + "MCAC=".len();
    let rest = &text[start..];
    let end = rest.find(';').unwrap_or(rest.len());
    rest[..end].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::byteorder::little_endian::U32;

    fn edges(vals: &[u32]) -> Vec<U32> {
        vals.iter().copied().map(U32::new).collect()
    }

    #[test]
    fn assemble_packs_u24_little_endian() {
        let buf = [0x01, 0x00, 0x00, 0xff, 0xff, 0xff, 0x34, 0x12, 0x00];
        assert_eq!(assemble_spectrum(&buf), [1, 0xff_ffff, 0x1234]);
    }

    #[test]
    fn rebin_sums_between_edge_pairs() {
        let orig = [1u32, 2, 3, 4, 5, 6, 7, 8];
        let out = rebin_spectrum(&orig, &edges(&[0, 2, 5, 8])).unwrap();
        assert_eq!(out, [3, 12, 21]);
    }

    #[test]
    fn rebin_without_edges_is_identity() {
        let orig = [9u32, 8, 7];
        assert_eq!(rebin_spectrum(&orig, &[]).unwrap(), orig);
    }

    #[test]
    fn rebin_rejects_out_of_bounds_edges() {
        let orig = [1u32, 2, 3];
        assert!(rebin_spectrum(&orig, &edges(&[0, 7])).is_err());
    }

    #[test]
    fn mcac_readback_parses() {
        assert_eq!(parse_mcac("MCAC=1024;"), Some(1024));
        assert_eq!(parse_mcac("TPEA=2.4;MCAC=256;GAIN=1;"), Some(256));
        assert_eq!(parse_mcac("MCAC=;"), None);
        assert_eq!(parse_mcac("nothing here"), None);
    }

    #[test]
    fn remote_buffer_number_is_nine_bits_big_endian() {
        let mut status = [0u8; STATUS_SIZE];
        status[46] = 0x1 | 0x2; // high bit set, buffering running
        status[47] = 0x34;
        let remote =
            u16::from(status[46] & 0x1) << 8 | u16::from(status[47]);
        assert_eq!(remote, 0x134);
    }
}
