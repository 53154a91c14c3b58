// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control-socket listener.
//!
//! One datagram is one whitespace-separated text command. Each parsed
//! command is wrapped in a one-shot reply promise, pushed onto the
//! coordinator's queue, and awaited for up to 30 seconds; the sender gets
//! back a single datagram starting with `ack-ok\n` or `error\n`.
//!
//! While the detectors are asleep only `terminate`, `wake`, and the
//! `stop-*`/`sleep*` family (as no-ops) are accepted; anything else is
//! answered with an error without touching the queue.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use workq::WorkQueue;

use crate::messages::{
    Channel, Command, HafxDebugKind, HafxDebugRequest, HafxSettings,
    HafxSettingsUpdate, X123DebugKind, X123Settings,
};

/// How long a command may take before the sender gets an error.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds for histogram/list-mode collection durations.
const MAX_WAIT_TIME_SEC: u32 = 3600;

const RECV_BUFFER_SIZE: usize = 65535;

/// What one received datagram asks for.
#[derive(Debug)]
enum Parsed {
    /// Reply and exit the process.
    Terminate,
    /// Reply without disturbing the coordinator.
    NoOp,
    Command(Command),
}

pub struct Listener {
    socket: UdpSocket,
    queue: WorkQueue<Command>,
    alive: Arc<AtomicBool>,
}

impl Listener {
    pub fn new(
        socket: UdpSocket,
        queue: WorkQueue<Command>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            socket,
            queue,
            alive,
        }
    }

    pub fn listen_loop(&self) -> ! {
        info!("listening for commands");
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("error reading control socket: {e}");
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&buf[..len]).into_owned();
            self.serve_one(text.trim(), from);
        }
    }

    fn serve_one(&self, text: &str, from: SocketAddr) {
        match parse_command(text, self.alive.load(Ordering::Relaxed)) {
            Err(msg) => self.error_reply(from, &msg),
            Ok(Parsed::NoOp) => {
                self.reply(from, "given command is a no-op; no change.")
            }
            Ok(Parsed::Terminate) => {
                self.reply(from, "ack-ok\nterminated");
                info!("terminate received; exiting");
                std::process::exit(0);
            }
            Ok(Parsed::Command(command)) => {
                let (tx, rx) = mpsc::sync_channel(1);
                self.queue.push(Command::PromiseWrap {
                    reply: tx,
                    inner: Box::new(command),
                });
                match rx.recv_timeout(REPLY_TIMEOUT) {
                    Ok(Ok(payload)) => {
                        self.reply(from, &format!("ack-ok\n{payload}"))
                    }
                    Ok(Err(msg)) => self.error_reply(from, &msg),
                    Err(_) => {
                        self.error_reply(from, "command execution timed out")
                    }
                }
            }
        }
    }

    fn reply(&self, to: SocketAddr, msg: &str) {
        if let Err(e) = self.socket.send_to(msg.as_bytes(), to) {
            warn!("failed to send reply '{msg}': {e}");
        }
    }

    fn error_reply(&self, to: SocketAddr, msg: &str) {
        debug!("replying with error: {msg}");
        self.reply(to, &format!("error\n{msg}"));
    }
}

/// Parses one command line. `Err` carries the message for the error
/// reply.
fn parse_command(text: &str, alive: bool) -> Result<Parsed, String> {
    let mut tokens = text.split_whitespace();
    let name = tokens.next().unwrap_or("");

    // These two are allowed regardless of detector state.
    if name == "terminate" {
        return Ok(Parsed::Terminate);
    }
    if name == "wake" {
        return Ok(Parsed::Command(Command::Initialize));
    }

    if !alive {
        // A stop given to a sleeping detector is effectively a no-op, so
        // it shouldn't error.
        if name.starts_with("stop-") || name.starts_with("sleep") {
            return Ok(Parsed::NoOp);
        }
        return Err(format!("Bad command given to sleeping detector: {name}"));
    }

    let command = match name {
        "sleep" => Command::Shutdown,
        "start-nominal" => Command::CollectNominal { started: false },
        "stop-nominal" => Command::StopNominal,
        "start-nrl-list" => Command::StartNrlList {
            started: false,
            full_size: false,
        },
        "start-nrl-full-size-list" => Command::StartNrlList {
            started: false,
            full_size: true,
        },
        "stop-nrl-list" => Command::StopNrlList,
        "settings-update" => parse_settings_update(&mut tokens)?,
        "debug" => parse_debug(&mut tokens)?,
        "start-periodic-health" => parse_periodic_health(&mut tokens)?,
        "stop-periodic-health" => Command::StopPeriodicHealth,
        _ => return Err(format!("Cannot process given command: {name}")),
    };
    Ok(Parsed::Command(command))
}

fn parse_settings_update<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<Command, String> {
    match tokens.next() {
        Some("x123") => Ok(Command::X123Settings(parse_x123_settings(tokens)?)),
        Some("hafx") => {
            Ok(Command::HafxSettings(parse_hafx_settings(tokens)?))
        }
        other => Err(format!(
            "Malformed settings detector identifier: '{}'",
            other.unwrap_or("")
        )),
    }
}

fn parse_x123_settings<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<X123Settings, String> {
    let mut settings = X123Settings::default();
    match tokens.next() {
        Some("adc_rebin_edges") => {
            let edges = parse_numbers::<u32>(tokens, "x123 rebin edge")?;
            let len = edges.len().min(settings.adc_rebin_edges.len());
            debug!("got {len} x123 edges");
            for (out, edge) in settings.adc_rebin_edges.iter_mut().zip(&edges[..len]) {
                *out = (*edge).into();
            }
            settings.adc_rebin_edges_len = (len as u16).into();
        }
        Some("ack_err_retries") => {
            let retries: u32 = parse_one(tokens, "ack error retry count")?;
            settings.ack_err_retries = retries.into();
            settings.ack_err_retries_present = 1;
        }
        Some("ascii_settings") => {
            let text = tokens
                .next()
                .ok_or("no x123 ascii settings given")?;
            let len = text.len().min(settings.ascii_settings.len());
            debug!("got {len}-character x123 ascii settings string");
            settings.ascii_settings[..len]
                .copy_from_slice(&text.as_bytes()[..len]);
            settings.ascii_settings_len = (len as u16).into();
        }
        other => {
            return Err(format!(
                "Invalid x123 settings modifier '{}'",
                other.unwrap_or("")
            ))
        }
    }
    Ok(settings)
}

fn parse_hafx_settings<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<HafxSettingsUpdate, String> {
    let ch = parse_channel(tokens, "settings update")?;
    let mut settings = HafxSettings::default();

    match tokens.next() {
        Some("fpga_ctrl") => {
            let regs = parse_numbers::<u16>(tokens, "fpga_ctrl register")?;
            copy_registers_u16(&mut settings.fpga_ctrl, &regs);
            settings.fpga_ctrl_present = 1;
        }
        Some("fpga_weights") => {
            let regs = parse_numbers::<u16>(tokens, "fpga_weights register")?;
            copy_registers_u16(&mut settings.fpga_weights, &regs);
            settings.fpga_weights_present = 1;
        }
        Some("arm_ctrl") => {
            let regs = parse_numbers::<f32>(tokens, "arm_ctrl register")?;
            copy_registers_f32(&mut settings.arm_ctrl, &regs);
            settings.arm_ctrl_present = 1;
        }
        Some("arm_cal") => {
            let regs = parse_numbers::<f32>(tokens, "arm_cal register")?;
            copy_registers_f32(&mut settings.arm_cal, &regs);
            settings.arm_cal_present = 1;
        }
        Some("adc_rebin_edges") => {
            let edges = parse_numbers::<u16>(tokens, "rebin edge")?;
            let len = edges.len().min(settings.adc_rebin_edges.len());
            debug!("number of elements: {len}");
            for (out, edge) in settings.adc_rebin_edges.iter_mut().zip(&edges[..len]) {
                *out = (*edge).into();
            }
            settings.adc_rebin_edges_len = (len as u16).into();
        }
        other => {
            return Err(format!(
                "Invalid settings modifier '{}'",
                other.unwrap_or("")
            ))
        }
    }

    Ok(HafxSettingsUpdate { ch, settings })
}

fn parse_debug<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<Command, String> {
    match tokens.next() {
        Some("x123") => parse_x123_debug(tokens),
        Some("hafx") => parse_hafx_debug(tokens),
        other => Err(format!(
            "Detector choice '{}' not valid for debug",
            other.unwrap_or("")
        )),
    }
}

fn parse_x123_debug<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<Command, String> {
    let kind = match tokens.next() {
        Some("diagnostic") => X123DebugKind::Diagnostic,
        Some("histogram") => {
            let wait: u32 =
                parse_one(tokens, "x123 histogram wait time (required)")?;
            check_wait(wait)?;
            X123DebugKind::Histogram { wait }
        }
        Some("ascii_settings") => {
            let query = tokens
                .next()
                .ok_or("no x123 ascii settings given")?
                .to_owned();
            X123DebugKind::AsciiSettings { query }
        }
        other => {
            return Err(format!(
                "Invalid x123 debug type '{}'",
                other.unwrap_or("")
            ))
        }
    };
    Ok(Command::X123Debug(kind))
}

fn parse_hafx_debug<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<Command, String> {
    let ch = parse_channel(tokens, "debug")?;

    let type_name = tokens.next().unwrap_or("");
    let kind = match type_name {
        "arm_ctrl" => HafxDebugKind::ArmCtrl,
        "arm_cal" => HafxDebugKind::ArmCal,
        "arm_status" => HafxDebugKind::ArmStatus,
        "fpga_ctrl" => HafxDebugKind::FpgaCtrl,
        "fpga_oscilloscope_trace" => HafxDebugKind::FpgaOscilloscopeTrace,
        "fpga_statistics" => HafxDebugKind::FpgaStatistics,
        "fpga_weights" => HafxDebugKind::FpgaWeights,
        "histogram" => HafxDebugKind::Histogram,
        "list_mode" => HafxDebugKind::ListMode,
        other => {
            return Err(format!("Ill-formed debug request type '{other}'"))
        }
    };

    let mut wait = 0;
    if matches!(kind, HafxDebugKind::Histogram | HafxDebugKind::ListMode) {
        wait = parse_one(tokens, "collection duration")?;
        check_wait(wait)?;
    }

    Ok(Command::HafxDebug(HafxDebugRequest { ch, kind, wait }))
}

fn parse_periodic_health<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<Command, String> {
    let seconds: u32 = parse_one(
        tokens,
        "valid wait time between health packet acquisitions (>1 s)",
    )?;
    if seconds == 0 {
        return Err(
            "Need to provide valid wait time between health packet acquisitions. (>1 s)"
                .into(),
        );
    }

    let mut destinations = Vec::new();
    for token in tokens {
        destinations.push(parse_ip_port(token)?);
    }
    if destinations.is_empty() {
        return Err("Need at least one address to send health data to.".into());
    }

    Ok(Command::StartPeriodicHealth {
        started: false,
        seconds,
        destinations,
    })
}

// ---------------------------------------------------------------------
// Token helpers

fn parse_channel<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<Channel, String> {
    let token = tokens.next().unwrap_or("");
    Channel::from_name(token).ok_or(format!(
        "Ill-formed detector choice for {what} '{token}' given"
    ))
}

fn parse_one<'a, T: std::str::FromStr>(
    tokens: &mut impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<T, String> {
    tokens
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(format!("Need to provide {what}"))
}

fn parse_numbers<'a, T: std::str::FromStr>(
    tokens: &mut impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<Vec<T>, String> {
    tokens
        .map(|t| t.parse().map_err(|_| format!("Bad {what}: '{t}'")))
        .collect()
}

fn copy_registers_u16(
    dest: &mut [zerocopy::byteorder::little_endian::U16],
    src: &[u16],
) {
    for (out, v) in dest.iter_mut().zip(src) {
        *out = (*v).into();
    }
}

fn copy_registers_f32(
    dest: &mut [zerocopy::byteorder::little_endian::F32],
    src: &[f32],
) {
    for (out, v) in dest.iter_mut().zip(src) {
        *out = (*v).into();
    }
}

fn check_wait(wait: u32) -> Result<(), String> {
    if wait == 0 || wait > MAX_WAIT_TIME_SEC {
        return Err(
            "Debug histogram/list_mode must be given in-bounds collection duration"
                .into(),
        );
    }
    Ok(())
}

fn parse_ip_port(token: &str) -> Result<SocketAddrV4, String> {
    let (ip, port) = token
        .split_once(':')
        .ok_or("can't find port from ip string")?;
    let ip: Ipv4Addr = if ip == "localhost" {
        Ipv4Addr::LOCALHOST
    } else {
        ip.parse().map_err(|_| format!("bad forward ip '{ip}'"))?
    };
    let port: u16 = port
        .parse()
        .map_err(|_| format!("bad forward port '{port}'"))?;
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(text: &str) -> Command {
        match parse_command(text, true).unwrap() {
            Parsed::Command(c) => c,
            _ => panic!("expected a command for '{text}'"),
        }
    }

    #[test]
    fn lifecycle_commands_parse() {
        assert!(matches!(
            parse_command("terminate", false).unwrap(),
            Parsed::Terminate
        ));
        assert!(matches!(cmd("sleep"), Command::Shutdown));
        assert!(matches!(
            parse_command("wake", false).unwrap(),
            Parsed::Command(Command::Initialize)
        ));
        assert!(matches!(
            cmd("start-nominal"),
            Command::CollectNominal { started: false }
        ));
        assert!(matches!(cmd("stop-nominal"), Command::StopNominal));
        assert!(matches!(
            cmd("start-nrl-full-size-list"),
            Command::StartNrlList {
                started: false,
                full_size: true
            }
        ));
    }

    #[test]
    fn sleeping_detector_gates_commands() {
        // stop-* and sleep* are no-ops while asleep.
        assert!(matches!(
            parse_command("stop-nominal", false).unwrap(),
            Parsed::NoOp
        ));
        assert!(matches!(
            parse_command("sleep", false).unwrap(),
            Parsed::NoOp
        ));
        // Everything else errors without touching the queue.
        let err = parse_command("start-nominal", false).unwrap_err();
        assert!(err.starts_with("Bad command given to sleeping detector"));
        assert!(parse_command("debug hafx c1 arm_ctrl", false).is_err());
    }

    #[test]
    fn unknown_command_errors() {
        assert!(parse_command("frobnicate", true).is_err());
        assert!(parse_command("", true).is_err());
    }

    #[test]
    fn hafx_debug_parses_with_wait_bounds() {
        let Command::HafxDebug(req) = cmd("debug hafx m5 histogram 120") else {
            panic!()
        };
        assert_eq!(req.ch, Channel::M5);
        assert_eq!(req.kind, HafxDebugKind::Histogram);
        assert_eq!(req.wait, 120);

        // Basic reads take no wait.
        let Command::HafxDebug(req) = cmd("debug hafx c1 arm_status") else {
            panic!()
        };
        assert_eq!(req.kind, HafxDebugKind::ArmStatus);
        assert_eq!(req.wait, 0);

        assert!(parse_command("debug hafx c1 histogram 0", true).is_err());
        assert!(parse_command("debug hafx c1 list_mode 3601", true).is_err());
        assert!(parse_command("debug hafx q9 histogram 10", true).is_err());
        assert!(parse_command("debug hafx c1 bogus", true).is_err());
    }

    #[test]
    fn x123_debug_parses() {
        assert!(matches!(
            cmd("debug x123 diagnostic"),
            Command::X123Debug(X123DebugKind::Diagnostic)
        ));
        assert!(matches!(
            cmd("debug x123 histogram 60"),
            Command::X123Debug(X123DebugKind::Histogram { wait: 60 })
        ));
        let Command::X123Debug(X123DebugKind::AsciiSettings { query }) =
            cmd("debug x123 ascii_settings MCAC=;")
        else {
            panic!()
        };
        assert_eq!(query, "MCAC=;");

        assert!(parse_command("debug x123 histogram", true).is_err());
        assert!(parse_command("debug x123 ascii_settings", true).is_err());
    }

    #[test]
    fn hafx_settings_update_parses() {
        let Command::HafxSettings(update) =
            cmd("settings-update hafx c1 adc_rebin_edges 0 10 20 30 123")
        else {
            panic!()
        };
        assert_eq!(update.ch, Channel::C1);
        assert_eq!(update.settings.adc_rebin_edges_len.get(), 5);
        assert_eq!(update.settings.adc_rebin_edges[4].get(), 123);
        assert_eq!(update.settings.fpga_ctrl_present, 0);

        let Command::HafxSettings(update) =
            cmd("settings-update hafx x1 arm_cal 1.5 2.5")
        else {
            panic!()
        };
        assert_eq!(update.settings.arm_cal_present, 1);
        assert_eq!(update.settings.arm_cal[1].get(), 2.5);

        assert!(parse_command("settings-update hafx c1 bogus 1", true).is_err());
        assert!(
            parse_command("settings-update hafx c9 fpga_ctrl 1", true).is_err()
        );
        assert!(parse_command(
            "settings-update hafx c1 fpga_ctrl 1 2 notanumber",
            true
        )
        .is_err());
    }

    #[test]
    fn x123_settings_update_parses() {
        let Command::X123Settings(s) = cmd("settings-update x123 ack_err_retries 5")
        else {
            panic!()
        };
        assert_eq!(s.ack_err_retries_present, 1);
        assert_eq!(s.ack_err_retries.get(), 5);

        let Command::X123Settings(s) =
            cmd("settings-update x123 adc_rebin_edges 0 100 200")
        else {
            panic!()
        };
        assert_eq!(s.adc_rebin_edges_len.get(), 3);
        assert_eq!(s.adc_rebin_edges[2].get(), 200);

        let Command::X123Settings(s) =
            cmd("settings-update x123 ascii_settings MCAC=1024;TPEA=2.4;")
        else {
            panic!()
        };
        assert_eq!(s.ascii_settings_str(), "MCAC=1024;TPEA=2.4;");

        assert!(parse_command("settings-update x123 bogus", true).is_err());
        assert!(parse_command("settings-update pixie", true).is_err());
    }

    #[test]
    fn periodic_health_parses_destinations() {
        let Command::StartPeriodicHealth {
            started,
            seconds,
            destinations,
        } = cmd("start-periodic-health 10 localhost:40000 10.0.0.7:1234")
        else {
            panic!()
        };
        assert!(!started);
        assert_eq!(seconds, 10);
        assert_eq!(
            destinations,
            vec![
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 1234),
            ]
        );

        assert!(parse_command("start-periodic-health 0 localhost:1", true).is_err());
        assert!(parse_command("start-periodic-health 10", true).is_err());
        assert!(parse_command("start-periodic-health 10 nocolon", true).is_err());
    }
}
