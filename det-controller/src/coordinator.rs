// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command/acquisition coordinator.
//!
//! A single thread owns every detector handle, settings file, and
//! emitter, and drains the work queue forever: pop a command, dispatch
//! it, maybe re-arm a timer. Periodic activities (nominal science,
//! health, NRL list draining) each hold exactly one [`TimerHandle`] slot;
//! clearing the slot cancels the cycle, and a tick that fires after its
//! slot was cleared is a no-op.
//!
//! Error dispatch follows the taxonomy in [`crate::error`]: reconnect
//! errors rebuild the USB device table (and restart nominal collection if
//! it was running), anything else is answered/logged, and a panicking
//! handler is treated like the fatal case: log, shut the detectors
//! down, keep serving commands.

use std::net::{SocketAddrV4, UdpSocket};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use enum_map::EnumMap;
use log::{debug, error, warn};
use zerocopy::IntoBytes;

use drv_sipm3k::registers::{
    ArmCal, ArmCtrl, ArmStatus, FpgaCtrl, FpgaHistogram, FpgaListMode,
    FpgaOscilloscopeTrace, FpgaStatistics, FpgaWeights,
};
use drv_sipm3k::DeviceManager;
use workq::{TimerHandle, WorkQueue};

use crate::error::{Error, Result};
use crate::hafx::HafxControl;
use crate::messages::{
    unix_seconds, Channel, Command, HafxDebugKind, HafxDebugRequest,
    HafxSettingsUpdate, HealthPacket, X123DebugKind,
};
use crate::pps;
use crate::saver::{HafxPorts, X123Ports};
use crate::x123::X123Control;

/// Cadence of the nominal science tick.
const TIME_SLICE_DELAY: Duration = Duration::from_secs(2);
/// Cadence of the NRL buffer-full poll.
const CHECK_BUFFER_FULL_DELAY: Duration = Duration::from_millis(250);
/// How long each detector needs to have at least one time slice buffered.
const NOMINAL_SETTLE: Duration = Duration::from_millis(256);
/// PPS is a 1 Hz signal; two seconds of waiting is already one missed edge.
const PPS_TIMEOUT: Duration = Duration::from_secs(2);

const TRACE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TRACE_POLL_LIMIT: Duration = Duration::from_secs(5);

/// Static per-deployment configuration handed to the coordinator.
pub struct CoordinatorConfig {
    pub hafx_serials: EnumMap<Channel, Option<String>>,
    pub hafx_ports: EnumMap<Channel, HafxPorts>,
    pub x123_ports: X123Ports,
    pub pps_line: u32,
    pub settings_dir: PathBuf,
}

pub struct Coordinator {
    queue: WorkQueue<Command>,
    /// Shares the control socket with the listener; health packets go out
    /// from here.
    socket: UdpSocket,
    alive: Arc<AtomicBool>,
    config: CoordinatorConfig,

    hafx_ctrl: EnumMap<Channel, Option<HafxControl>>,
    x123_ctrl: Option<X123Control>,

    nominal_timer: Option<TimerHandle>,
    health_timer: Option<TimerHandle>,
    nrl_timer: Option<TimerHandle>,
    debug_trace_timer: Option<TimerHandle>,
    debug_hist_timer: Option<TimerHandle>,
    debug_list_timer: Option<TimerHandle>,
    x123_debug_hist_timer: Option<TimerHandle>,
}

impl Coordinator {
    pub fn new(
        queue: WorkQueue<Command>,
        socket: UdpSocket,
        alive: Arc<AtomicBool>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            queue,
            socket,
            alive,
            config,
            hafx_ctrl: EnumMap::default(),
            x123_ctrl: None,
            nominal_timer: None,
            health_timer: None,
            nrl_timer: None,
            debug_trace_timer: None,
            debug_hist_timer: None,
            debug_list_timer: None,
            x123_debug_hist_timer: None,
        }
    }

    pub fn run(&mut self) -> ! {
        loop {
            let command = self.queue.pop();
            self.step(command);
        }
    }

    /// Dispatches one command, applying the loop-level error policy.
    pub fn step(&mut self, command: Command) {
        let outcome =
            catch_unwind(AssertUnwindSafe(|| self.handle(command)));
        match outcome {
            Ok(Ok(())) => (),
            Ok(Err(Error::Reconnect(msg))) => {
                error!("reconnecting detectors: {msg}");
                let was_nominal = self.taking_nominal_data();
                if let Err(e) = self.reconnect_detectors() {
                    error!("reconnect failed: {e}");
                }
                if was_nominal {
                    // Redo the whole PPS-anchored start sequence.
                    self.nominal_timer = None;
                    self.queue.push(Command::StopNominal);
                    self.queue.push(Command::CollectNominal { started: false });
                }
            }
            Ok(Err(e)) => {
                // Already surfaced to the sender if one was waiting.
                warn!("command failed: {e}");
            }
            Err(_) => {
                error!("uncaught panic in command handler; shutting down detectors");
                self.handle_shutdown();
            }
        }
    }

    pub fn taking_nominal_data(&self) -> bool {
        self.nominal_timer.is_some()
    }

    pub fn taking_nrl_data(&self) -> bool {
        self.nrl_timer.is_some()
    }

    fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Initialize => self.handle_initialize(),
            Command::Shutdown => {
                self.handle_shutdown();
                Ok(())
            }
            Command::HafxSettings(update) => self.handle_hafx_settings(update),
            Command::X123Settings(settings) => {
                self.x123_mut()?.update_settings(&settings)
            }
            Command::HafxDebug(request) => self.handle_hafx_debug(request),
            Command::X123Debug(kind) => self.handle_x123_debug(kind),
            Command::QueryTraceAcquisition { ch } => {
                self.handle_query_trace(ch)
            }
            Command::QueryLegacyHistogram { ch } => {
                if self.debug_hist_timer.take().is_none() {
                    return Ok(());
                }
                self.hafx(ch)?
                    .read_save_debug::<FpgaHistogram>(HafxDebugKind::Histogram)
            }
            Command::QueryListMode { ch } => {
                if self.debug_list_timer.take().is_none() {
                    return Ok(());
                }
                self.hafx(ch)?
                    .read_save_debug::<FpgaListMode>(HafxDebugKind::ListMode)
            }
            Command::QueryX123DebugHistogram => {
                if self.x123_debug_hist_timer.take().is_none() {
                    return Ok(());
                }
                self.x123()?.read_save_debug_histogram()
            }
            Command::CollectNominal { started } => {
                self.handle_collect_nominal(started)
            }
            Command::StopNominal => self.handle_stop_nominal(),
            Command::StartNrlList { started, full_size } => {
                self.handle_start_nrl_list(started, full_size)
            }
            Command::StopNrlList => {
                self.nrl_timer = None;
                Ok(())
            }
            Command::StartPeriodicHealth {
                started,
                seconds,
                destinations,
            } => self.handle_periodic_health(started, seconds, destinations),
            Command::StopPeriodicHealth => {
                self.health_timer = None;
                Ok(())
            }
            Command::PromiseWrap { reply, inner } => {
                let result = self.handle(*inner);
                let outcome = match &result {
                    Ok(()) => Ok("promise-fulfilled".to_owned()),
                    Err(e) => Err(e.to_string()),
                };
                // The listener may already have timed out; that's its
                // problem, not ours.
                let _ = reply.try_send(outcome);
                match result {
                    // Reconnect handling still belongs to the loop.
                    Err(e @ Error::Reconnect(_)) => Err(e),
                    _ => Ok(()),
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle

    fn handle_initialize(&mut self) -> Result<()> {
        // Shut off everything before re-init, so we start from a clean
        // state.
        self.handle_shutdown();
        self.reconnect_detectors()?;

        // Push settings from disk out to each device.
        for (_, ctrl) in &self.hafx_ctrl {
            if let Some(ctrl) = ctrl {
                let result = ctrl
                    .fetch_settings()
                    .and_then(|settings| ctrl.update_settings(&settings));
                if let Err(e) = result {
                    warn!("settings load: {e}");
                }
            }
        }
        if let Some(x123) = self.x123_ctrl.as_mut() {
            let settings = x123.fetch_settings();
            if let Err(e) = x123.update_settings(&settings) {
                warn!("{e}");
            }
        }

        self.alive.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn handle_shutdown(&mut self) {
        self.nominal_timer = None;
        self.health_timer = None;
        self.nrl_timer = None;
        self.debug_trace_timer = None;
        self.debug_hist_timer = None;
        self.debug_list_timer = None;
        self.x123_debug_hist_timer = None;

        // Dropping the controllers releases their USB handles.
        self.hafx_ctrl = EnumMap::default();
        self.x123_ctrl = None;

        self.alive.store(false, Ordering::Relaxed);
        debug!("detector sleep");
    }

    /// Rebuilds the USB device table from scratch and recreates every
    /// controller whose detector is present.
    fn reconnect_detectors(&mut self) -> Result<()> {
        self.hafx_ctrl = EnumMap::default();

        let manager = DeviceManager::scan()
            .map_err(|e| Error::Recoverable(format!("usb scan: {e}")))?;

        for ch in Channel::ALL {
            let Some(serial) = &self.config.hafx_serials[ch] else {
                continue;
            };
            let Some(driver) = manager.get(serial) else {
                continue;
            };
            match HafxControl::new(
                driver,
                ch,
                self.config.hafx_ports[ch],
                &self.config.settings_dir,
            ) {
                Ok(ctrl) => self.hafx_ctrl[ch] = Some(ctrl),
                Err(e) => {
                    self.queue.push(Command::Shutdown);
                    return Err(Error::Recoverable(format!(
                        "making hafx control: {e}"
                    )));
                }
            }
        }

        // Release the old X-123 resources before re-making them.
        self.x123_ctrl = None;
        self.x123_ctrl = Some(X123Control::new(
            self.config.x123_ports,
            &self.config.settings_dir,
        )?);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Settings and debug

    fn handle_hafx_settings(&mut self, update: HafxSettingsUpdate) -> Result<()> {
        self.hafx(update.ch)?.update_settings(&update.settings)
    }

    fn handle_hafx_debug(&mut self, request: HafxDebugRequest) -> Result<()> {
        self.reject_during_acquisition()?;
        let wait = Duration::from_secs(u64::from(request.wait));
        let ctrl = self.hafx(request.ch)?;

        match request.kind {
            HafxDebugKind::ArmCtrl => {
                ctrl.read_save_debug::<ArmCtrl>(request.kind)
            }
            HafxDebugKind::ArmCal => {
                ctrl.read_save_debug::<ArmCal>(request.kind)
            }
            HafxDebugKind::ArmStatus => {
                ctrl.read_save_debug::<ArmStatus>(request.kind)
            }
            HafxDebugKind::FpgaCtrl => {
                ctrl.read_save_debug::<FpgaCtrl>(request.kind)
            }
            HafxDebugKind::FpgaStatistics => {
                ctrl.read_save_debug::<FpgaStatistics>(request.kind)
            }
            HafxDebugKind::FpgaWeights => {
                ctrl.read_save_debug::<FpgaWeights>(request.kind)
            }
            HafxDebugKind::FpgaOscilloscopeTrace => {
                ctrl.restart_trace()?;
                self.debug_trace_timer = Some(self.queue.push_after(
                    Command::QueryTraceAcquisition { ch: request.ch },
                    wait,
                ));
                Ok(())
            }
            HafxDebugKind::Histogram => {
                ctrl.restart_histogram()?;
                self.debug_hist_timer = Some(self.queue.push_after(
                    Command::QueryLegacyHistogram { ch: request.ch },
                    wait,
                ));
                Ok(())
            }
            HafxDebugKind::ListMode => {
                ctrl.restart_list_mode()?;
                self.debug_list_timer = Some(self.queue.push_after(
                    Command::QueryListMode { ch: request.ch },
                    wait,
                ));
                Ok(())
            }
        }
    }

    fn handle_x123_debug(&mut self, kind: X123DebugKind) -> Result<()> {
        self.reject_during_acquisition()?;
        if !self.x123()?.driver_valid() {
            return Err(Error::Validation("X123 not connected".into()));
        }

        match kind {
            X123DebugKind::Diagnostic => {
                self.x123()?.read_save_debug_diagnostic()
            }
            X123DebugKind::Histogram { wait } => {
                self.x123()?.init_debug_histogram()?;
                self.x123_debug_hist_timer = Some(self.queue.push_after(
                    Command::QueryX123DebugHistogram,
                    Duration::from_secs(u64::from(wait)),
                ));
                Ok(())
            }
            X123DebugKind::AsciiSettings { query } => {
                self.x123()?.read_save_debug_ascii(&query)
            }
        }
    }

    fn handle_query_trace(&mut self, ch: Channel) -> Result<()> {
        if self.debug_trace_timer.take().is_none() {
            return Ok(());
        }

        // Poll until the trace triggers, or give up.
        let limit = Instant::now() + TRACE_POLL_LIMIT;
        while Instant::now() < limit {
            if self.hafx(ch)?.check_trace_done()? {
                return self.hafx(ch)?.read_save_debug::<FpgaOscilloscopeTrace>(
                    HafxDebugKind::FpgaOscilloscopeTrace,
                );
            }
            thread::sleep(TRACE_POLL_INTERVAL);
        }
        Err(Error::Recoverable(
            "can't get trace after the time limit (5s)".into(),
        ))
    }

    // -----------------------------------------------------------------
    // Nominal science

    fn handle_collect_nominal(&mut self, started: bool) -> Result<()> {
        if !started {
            if self.taking_nrl_data() {
                return Err(Error::Validation(
                    "cannot start nominal data collection during NRL list collection".into(),
                ));
            }
            // Nominal supersedes any pending debug acquisition.
            self.debug_trace_timer = None;
            self.debug_hist_timer = None;
            self.debug_list_timer = None;
            self.x123_debug_hist_timer = None;

            self.start_nominal()?;
            self.arm_nominal_timer();
            return Ok(());
        }

        // A tick that outlived stop-nominal.
        if self.nominal_timer.is_none() {
            return Ok(());
        }

        if let Some(x123) = self.x123_ctrl.as_mut() {
            match x123.read_save_sequential_buffer() {
                Ok(()) => (),
                Err(e @ Error::Reconnect(_)) => return Err(e),
                Err(e) => debug!("x123 disconnected: {e}"),
            }
        }
        self.read_all_time_slices()?;
        self.arm_nominal_timer();
        Ok(())
    }

    fn arm_nominal_timer(&mut self) {
        self.nominal_timer = Some(self.queue.push_after(
            Command::CollectNominal { started: true },
            TIME_SLICE_DELAY,
        ));
    }

    /// The PPS-anchored start sequence. Atomic with respect to the
    /// command queue: nothing else is serviced until it completes.
    fn start_nominal(&mut self) -> Result<()> {
        // Wait for a PPS edge so that everything below is anchored to a
        // known second boundary. The whole rest of the sequence has to
        // finish inside the following second.
        self.await_pps_edge()?;
        let after_pps = Instant::now();

        // "Nothing" anchor while the initial synchronising reads happen.
        for (_, ctrl) in self.hafx_ctrl.iter_mut() {
            if let Some(ctrl) = ctrl {
                ctrl.set_time_anchor(None);
            }
        }

        // The next PPS is the one that starts measurements.
        let restore_anchor = unix_seconds() + 1;

        if let Some(x123) = self.x123_ctrl.as_mut() {
            x123.set_time_anchor(restore_anchor);
            match x123.restart_hardware_controlled_sequential_buffering() {
                Ok(()) => (),
                Err(e @ Error::Reconnect(_)) => return Err(e),
                Err(e) => warn!("X123 issue: {e}"),
            }
        }

        for (_, ctrl) in &self.hafx_ctrl {
            if let Some(ctrl) = ctrl {
                ctrl.restart_histogram()?;
            }
        }

        // Give every detector time to fill at least one slice buffer.
        let settle_until = after_pps + NOMINAL_SETTLE;
        let now = Instant::now();
        if settle_until > now {
            thread::sleep(settle_until - now);
        }

        // Drain the initial garbage buffers; anchors are still unset, so
        // nothing is emitted.
        self.read_all_time_slices()?;

        // Now the slice collection is synchronised; anchor it.
        for (_, ctrl) in self.hafx_ctrl.iter_mut() {
            if let Some(ctrl) = ctrl {
                ctrl.set_time_anchor(Some(restore_anchor));
            }
        }
        Ok(())
    }

    fn handle_stop_nominal(&mut self) -> Result<()> {
        if let Some(x123) = self.x123_ctrl.as_ref() {
            if let Err(e) = x123.stop_sequential_buffering() {
                warn!("X123 issue: {e}");
            }
        }
        self.nominal_timer = None;
        Ok(())
    }

    fn read_all_time_slices(&mut self) -> Result<()> {
        for (_, ctrl) in self.hafx_ctrl.iter_mut() {
            if let Some(ctrl) = ctrl {
                ctrl.poll_save_time_slice()
                    .map_err(|e| Error::Reconnect(format!("hafx issue: {e}")))?;
            }
        }
        Ok(())
    }

    fn await_pps_edge(&self) -> Result<()> {
        let detected =
            pps::await_rising_edge(self.config.pps_line, PPS_TIMEOUT)?;
        if !detected {
            warn!(
                "cannot obtain PPS detect after {} seconds",
                PPS_TIMEOUT.as_secs()
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // NRL list mode

    fn handle_start_nrl_list(&mut self, started: bool, full_size: bool) -> Result<()> {
        if !started {
            if self.taking_nominal_data() {
                return Err(Error::Validation(
                    "cannot start NRL list collection during nominal data collection".into(),
                ));
            }
            self.start_nrl_list_mode(full_size)?;
            self.arm_nrl_timer(full_size);
            return Ok(());
        }

        if self.nrl_timer.is_none() {
            return Ok(());
        }
        for (_, ctrl) in self.hafx_ctrl.iter_mut() {
            if let Some(ctrl) = ctrl {
                ctrl.poll_save_nrl_list()
                    .map_err(|e| Error::Reconnect(format!("hafx issue: {e}")))?;
            }
        }
        self.arm_nrl_timer(full_size);
        Ok(())
    }

    fn arm_nrl_timer(&mut self, full_size: bool) {
        self.nrl_timer = Some(self.queue.push_after(
            Command::StartNrlList {
                started: true,
                full_size,
            },
            CHECK_BUFFER_FULL_DELAY,
        ));
    }

    fn start_nrl_list_mode(&mut self, full_size: bool) -> Result<()> {
        // Align the start with a PPS edge; also required for the batches
        // to carry PPS-tagged events at all.
        self.await_pps_edge()?;
        for (_, ctrl) in self.hafx_ctrl.iter_mut() {
            if let Some(ctrl) = ctrl {
                ctrl.set_full_size_nrl(full_size);

                // Clear both NRL buffers.
                ctrl.swap_nrl_buffer(0)?;
                ctrl.restart_list_mode()?;
                ctrl.swap_nrl_buffer(1)?;
                ctrl.restart_list_mode()?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Health

    fn handle_periodic_health(
        &mut self,
        started: bool,
        seconds: u32,
        destinations: Vec<SocketAddrV4>,
    ) -> Result<()> {
        if started && self.health_timer.is_none() {
            return Ok(());
        }

        let packet = self.generate_health();
        for dest in &destinations {
            match self.socket.send_to(packet.as_bytes(), dest) {
                Ok(_) => (),
                // A tick failure must not kill the cycle; only the
                // initial command reports back to its sender.
                Err(e) if started => {
                    warn!("problem sending health packet to {dest}: {e}")
                }
                Err(e) => {
                    return Err(Error::Recoverable(format!(
                        "problem sending health packet: {e}"
                    )))
                }
            }
        }

        self.health_timer = Some(self.queue.push_after(
            Command::StartPeriodicHealth {
                started: true,
                seconds,
                destinations,
            },
            Duration::from_secs(u64::from(seconds)),
        ));
        Ok(())
    }

    /// One health packet; channels without a connected (and responsive)
    /// detector stay zero-filled.
    pub fn generate_health(&self) -> HealthPacket {
        let mut packet = HealthPacket {
            timestamp: unix_seconds().into(),
            ..Default::default()
        };

        for ch in Channel::ALL {
            let Some(ctrl) = &self.hafx_ctrl[ch] else {
                continue;
            };
            match ctrl.generate_health() {
                Ok(health) => match ch {
                    Channel::C1 => packet.c1 = health,
                    Channel::M1 => packet.m1 = health,
                    Channel::M5 => packet.m5 = health,
                    Channel::X1 => packet.x1 = health,
                },
                Err(e) => warn!("health read failed for {ch}: {e}"),
            }
        }

        if let Some(x123) = &self.x123_ctrl {
            if x123.driver_valid() {
                match x123.generate_health() {
                    Ok(health) => packet.x123 = health,
                    Err(e) => warn!("x123 health read failed: {e}"),
                }
            }
        }
        packet
    }

    // -----------------------------------------------------------------
    // Lookup helpers

    fn hafx(&mut self, ch: Channel) -> Result<&mut HafxControl> {
        self.hafx_ctrl[ch].as_mut().ok_or_else(|| {
            Error::Validation(
                "channel not valid (detector not connected)".into(),
            )
        })
    }

    fn x123(&self) -> Result<&X123Control> {
        self.x123_ctrl.as_ref().ok_or_else(|| {
            Error::Validation("X123 not connected".into())
        })
    }

    fn x123_mut(&mut self) -> Result<&mut X123Control> {
        self.x123_ctrl.as_mut().ok_or_else(|| {
            Error::Validation("X123 not connected".into())
        })
    }

    fn reject_during_acquisition(&self) -> Result<()> {
        if self.taking_nominal_data() {
            return Err(Error::Validation(
                "cannot take debug data during nominal data collection".into(),
            ));
        }
        if self.taking_nrl_data() {
            return Err(Error::Validation(
                "cannot take debug data during NRL list collection".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::mpsc;

    /// A coordinator with no hardware attached; everything that needs a
    /// detector reports "not connected".
    fn bare_coordinator() -> (Coordinator, WorkQueue<Command>) {
        let queue = WorkQueue::new();
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let alive = Arc::new(AtomicBool::new(false));
        let dir = std::env::temp_dir();
        let config = CoordinatorConfig {
            hafx_serials: EnumMap::default(),
            hafx_ports: enum_map::enum_map! {
                ch => HafxPorts::from_base(42000, ch),
            },
            x123_ports: X123Ports::from_base(41000),
            pps_line: 31,
            settings_dir: dir,
        };
        let c = Coordinator::new(queue.clone(), socket, alive, config);
        (c, queue)
    }

    #[test]
    fn stale_nominal_tick_is_a_noop() {
        let (mut c, _q) = bare_coordinator();
        assert!(!c.taking_nominal_data());
        // No timer slot is armed, so a leftover tick must do nothing.
        c.step(Command::CollectNominal { started: true });
        assert!(!c.taking_nominal_data());
    }

    #[test]
    fn stale_health_tick_does_not_rearm() {
        let (mut c, _q) = bare_coordinator();
        let sink = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let dest = SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            sink.local_addr().unwrap().port(),
        );
        c.step(Command::StartPeriodicHealth {
            started: true,
            seconds: 1,
            destinations: vec![dest],
        });
        assert!(c.health_timer.is_none());

        // A fresh start does arm the cycle and sends one packet.
        sink.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        c.step(Command::StartPeriodicHealth {
            started: false,
            seconds: 1,
            destinations: vec![dest],
        });
        assert!(c.health_timer.is_some());
        let mut buf = [0u8; 256];
        let n = sink.recv(&mut buf).unwrap();
        assert_eq!(n, core::mem::size_of::<HealthPacket>());
    }

    #[test]
    fn stop_periodic_health_clears_the_slot() {
        let (mut c, _q) = bare_coordinator();
        let sink = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let dest = SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            sink.local_addr().unwrap().port(),
        );
        c.step(Command::StartPeriodicHealth {
            started: false,
            seconds: 5,
            destinations: vec![dest],
        });
        assert!(c.health_timer.is_some());
        c.step(Command::StopPeriodicHealth);
        assert!(c.health_timer.is_none());
    }

    #[test]
    fn debug_rejected_without_detector() {
        let (mut c, _q) = bare_coordinator();
        let (tx, rx) = mpsc::sync_channel(1);
        c.step(Command::PromiseWrap {
            reply: tx,
            inner: Box::new(Command::HafxDebug(HafxDebugRequest {
                ch: Channel::C1,
                kind: HafxDebugKind::ArmStatus,
                wait: 0,
            })),
        });
        let outcome = rx.try_recv().unwrap();
        assert!(outcome.is_err());
    }

    #[test]
    fn debug_rejected_while_nominal_runs() {
        let (mut c, q) = bare_coordinator();
        // Pretend a nominal cycle is in flight.
        c.nominal_timer = Some(q.push_after(
            Command::CollectNominal { started: true },
            Duration::from_secs(600),
        ));

        let (tx, rx) = mpsc::sync_channel(1);
        c.step(Command::PromiseWrap {
            reply: tx,
            inner: Box::new(Command::HafxDebug(HafxDebugRequest {
                ch: Channel::C1,
                kind: HafxDebugKind::Histogram,
                wait: 10,
            })),
        });
        let msg = rx.try_recv().unwrap().unwrap_err();
        assert!(msg.contains("nominal data collection"));
        // The rejection must not have armed a debug timer.
        assert!(c.debug_hist_timer.is_none());

        let (tx, rx) = mpsc::sync_channel(1);
        c.step(Command::PromiseWrap {
            reply: tx,
            inner: Box::new(Command::X123Debug(X123DebugKind::Diagnostic)),
        });
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn nrl_and_nominal_exclude_each_other() {
        let (mut c, q) = bare_coordinator();
        c.nrl_timer = Some(q.push_after(
            Command::StartNrlList {
                started: true,
                full_size: false,
            },
            Duration::from_secs(600),
        ));

        let (tx, rx) = mpsc::sync_channel(1);
        c.step(Command::PromiseWrap {
            reply: tx,
            inner: Box::new(Command::CollectNominal { started: false }),
        });
        assert!(rx.try_recv().unwrap().is_err());
        assert!(!c.taking_nominal_data());
    }

    #[test]
    fn promise_wrap_reports_success_payload() {
        let (mut c, _q) = bare_coordinator();
        let (tx, rx) = mpsc::sync_channel(1);
        c.step(Command::PromiseWrap {
            reply: tx,
            inner: Box::new(Command::StopPeriodicHealth),
        });
        assert_eq!(rx.try_recv().unwrap().unwrap(), "promise-fulfilled");
    }

    #[test]
    fn health_packet_from_bare_coordinator_is_zero_filled() {
        let (c, _q) = bare_coordinator();
        let packet = c.generate_health();
        assert!(packet.timestamp.get() > 0);
        assert_eq!(packet.c1.counts.get(), 0);
        assert_eq!(packet.x123.fast_counts.get(), 0);
    }

    #[test]
    fn stale_debug_queries_are_noops() {
        let (mut c, _q) = bare_coordinator();
        // None of these have an armed timer slot, and none should touch
        // hardware or error out.
        c.step(Command::QueryLegacyHistogram { ch: Channel::M1 });
        c.step(Command::QueryListMode { ch: Channel::M5 });
        c.step(Command::QueryTraceAcquisition { ch: Channel::X1 });
        c.step(Command::QueryX123DebugHistogram);
    }
}
