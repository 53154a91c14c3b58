// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flight controller for the radiation detector cluster.
//!
//! Two threads: the coordinator owns the detectors and drains the command
//! queue; this (main) thread reads the UDP control socket and forwards
//! commands. See [`coordinator`] and [`listener`] for the details.

mod coordinator;
mod error;
mod hafx;
mod listener;
mod messages;
mod pps;
mod saver;
mod settings;
mod x123;

use std::net::{Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;

use workq::WorkQueue;

use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::listener::Listener;
use crate::messages::Channel;
use crate::saver::{HafxPorts, X123Ports};

/// Command/acquisition coordinator for four HaFX scintillator channels
/// and one Amptek X-123 spectrometer.
#[derive(Parser)]
struct Args {
    /// UDP port for the text control socket.
    #[clap(long, env = "DET_LISTEN_PORT")]
    listen_port: u16,

    /// ARM serial number of the C1-optimized detector.
    #[clap(long, env = "HAFX_C1_SERIAL")]
    c1_serial: Option<String>,

    /// ARM serial number of the M1-optimized detector.
    #[clap(long, env = "HAFX_M1_SERIAL")]
    m1_serial: Option<String>,

    /// ARM serial number of the M5-optimized detector.
    #[clap(long, env = "HAFX_M5_SERIAL")]
    m5_serial: Option<String>,

    /// ARM serial number of the X1-optimized detector.
    #[clap(long, env = "HAFX_X1_SERIAL")]
    x1_serial: Option<String>,

    /// Base port for X-123 data emission (science = base, debug = base+1).
    #[clap(long, env = "X123_BASE_PORT")]
    x123_base_port: u16,

    /// Base port for HaFX data emission (three ports per channel).
    #[clap(long, env = "HAFX_BASE_PORT")]
    hafx_base_port: u16,

    /// GPIO line (Broadcom numbering) carrying the PPS signal.
    #[clap(long, env = "PPS_GPIO_PIN", default_value_t = 31)]
    pps_pin: u32,

    /// Where settings blobs live; defaults to $HOME/detector-config.
    #[clap(long, env = "DETECTOR_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let settings_dir = match args.config_dir {
        Some(dir) => dir,
        None => {
            let home =
                std::env::var("HOME").context("HOME is not set and --config-dir not given")?;
            PathBuf::from(home).join("detector-config")
        }
    };

    // Per the startup contract: no control socket or no GPIO chip means
    // the process cannot run at all.
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, args.listen_port))
        .with_context(|| {
            format!("cannot open control socket on port {}", args.listen_port)
        })?;
    pps::probe(args.pps_pin)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("PPS GPIO is unusable")?;

    let config = CoordinatorConfig {
        hafx_serials: enum_map::enum_map! {
            Channel::C1 => args.c1_serial.clone(),
            Channel::M1 => args.m1_serial.clone(),
            Channel::M5 => args.m5_serial.clone(),
            Channel::X1 => args.x1_serial.clone(),
        },
        hafx_ports: enum_map::enum_map! {
            ch => HafxPorts::from_base(args.hafx_base_port, ch),
        },
        x123_ports: X123Ports::from_base(args.x123_base_port),
        pps_line: args.pps_pin,
        settings_dir,
    };

    let queue = WorkQueue::new();
    let alive = Arc::new(AtomicBool::new(false));

    let mut coordinator = Coordinator::new(
        queue.clone(),
        socket.try_clone().context("cannot clone control socket")?,
        Arc::clone(&alive),
        config,
    );
    thread::Builder::new()
        .name("coordinator".into())
        .spawn(move || coordinator.run())
        .context("cannot spawn coordinator thread")?;

    Listener::new(socket, queue, alive).listen_loop()
}
