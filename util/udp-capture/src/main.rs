// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Captures one detector data stream from UDP into rotating binary
//! files, and/or forwards it to further UDP sinks.
//!
//! The flight controller emits science and debug records as loopback
//! datagrams; one instance of this tool per stream turns them into
//! timestamped files downstream tooling can sweep up. A file is closed
//! (and the optional post-process hook run) when the stream pauses, the
//! file gets too big, or it has been open too long, so each file is a
//! contiguous chunk of one acquisition.

use std::fs::File;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

const TIME_FMT: &str = "%Y-%j-%H-%M-%S";
const RECV_BUFFER_SIZE: usize = 65535;

#[derive(Parser)]
struct Args {
    /// Port to listen on for data.
    #[clap(short, long)]
    listen_port: u16,

    /// Seconds without data before the open file is closed.
    #[clap(short = 't', long)]
    listen_timeout: Option<u64>,

    /// Seconds a file may stay open regardless of traffic. Required when
    /// logging to files.
    #[clap(short = 'T', long)]
    absolute_timeout: Option<u64>,

    /// Base filename; no files are written when absent.
    #[clap(short, long)]
    base_fn: Option<String>,

    /// Max binary file size in bytes before rotation.
    #[clap(short, long, default_value_t = u64::MAX)]
    max_fsz: u64,

    /// Program to run on each closed file (sees $out_file).
    #[clap(short, long)]
    post_process: Option<String>,

    /// UDP ip:port destinations to forward every datagram to.
    #[clap(short, long)]
    forward: Vec<String>,
}

struct Output {
    name: String,
    file: Option<File>,
    opened_at: Instant,
    written: u64,
}

impl Output {
    fn new() -> Self {
        Self {
            name: String::new(),
            file: None,
            opened_at: Instant::now(),
            written: 0,
        }
    }

    fn open(&mut self, base: &str) -> anyhow::Result<()> {
        let stamp = chrono::Utc::now().format(TIME_FMT);
        // Suffix with a repeat counter in the (unlikely) case two files
        // land in the same second.
        let mut repeat = 0u32;
        let name = loop {
            let candidate = format!("{base}_{stamp}_{repeat}.bin");
            if !Path::new(&candidate).exists() {
                break candidate;
            }
            repeat += 1;
        };

        self.file = Some(
            File::create(&name)
                .with_context(|| format!("cannot open binary file at {name}"))?,
        );
        self.name = name;
        self.opened_at = Instant::now();
        self.written = 0;
        info!("opened {}", self.name);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if let Some(file) = &mut self.file {
            file.write_all(data).context("write failed")?;
            self.written += data.len() as u64;
        }
        Ok(())
    }

    fn close(&mut self) -> Option<String> {
        self.file.take().map(|f| {
            drop(f);
            info!("closed {}", self.name);
            std::mem::take(&mut self.name)
        })
    }
}

fn parse_ip_port(token: &str) -> anyhow::Result<SocketAddrV4> {
    let (ip, port) = token
        .split_once(':')
        .context("can't find port from ip string")?;
    let ip: Ipv4Addr = if ip == "localhost" {
        Ipv4Addr::LOCALHOST
    } else {
        ip.parse().with_context(|| format!("bad ip '{ip}'"))?
    };
    Ok(SocketAddrV4::new(ip, port.parse()?))
}

fn post_process(program: &Option<String>, file_name: &str) {
    let Some(program) = program else { return };
    if file_name.is_empty() {
        return;
    }
    let status = Command::new("sh")
        .arg("-c")
        .arg(program)
        .env("out_file", file_name)
        .status();
    match status {
        Ok(s) if s.success() => (),
        Ok(s) => warn!("post-process exited with {s}"),
        Err(e) => warn!("failed to execute given process: {e}"),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.base_fn.is_some() && args.absolute_timeout.is_none() {
        anyhow::bail!("absolute timeout (-T) is required if logging to files");
    }
    if args.base_fn.is_none() && args.forward.is_empty() {
        anyhow::bail!("need either file name (-b) or forward addresses (-f)");
    }
    let listen_timeout = args.listen_timeout.or(args.absolute_timeout);

    let forward_to = args
        .forward
        .iter()
        .map(|t| parse_ip_port(t))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, args.listen_port))
        .context("cannot bind listen socket")?;
    if let Some(secs) = listen_timeout {
        socket
            .set_read_timeout(Some(Duration::from_secs(secs)))
            .context("cannot set socket timeout")?;
    }

    // Close (and post-process) whatever is open if we're signalled away.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .context("cannot install signal handler")?;
    }

    let mut out = Output::new();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        if stop.load(Ordering::Relaxed) {
            if let Some(name) = out.close() {
                post_process(&args.post_process, &name);
            }
            info!("caught shutdown signal; exiting");
            return Ok(());
        }

        let received = match socket.recv(&mut buf) {
            Ok(n) => Some(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("socket recv died"),
        };

        if let Some(base) = &args.base_fn {
            // On a stream pause, close any open file.
            let mut close_file = received.is_none() && out.file.is_some();

            if out.file.is_some() {
                let too_old = args
                    .absolute_timeout
                    .is_some_and(|t| out.opened_at.elapsed().as_secs() > t);
                close_file = close_file || too_old || out.written > args.max_fsz;
            }

            if close_file {
                if let Some(name) = out.close() {
                    post_process(&args.post_process, &name);
                }
            }

            if let Some(n) = received {
                if out.file.is_none() {
                    out.open(base)?;
                }
                out.write(&buf[..n])?;
            }
        }

        if let Some(n) = received {
            for dest in &forward_to {
                if let Err(e) = socket.send_to(&buf[..n], dest) {
                    warn!("forward to {dest} failed: {e}");
                }
            }
        }
    }
}
