// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emission of science/debug records to the downstream capture processes.
//!
//! Each record stream is one UDP socket pointed at a loopback port where a
//! `udp-capture` instance listens. Ports are computed from the two base
//! ports given at startup: the X-123 gets {base, base+1} for science and
//! debug, and HaFX channel k gets {base+3k, base+3k+1, base+3k+2} for
//! science, NRL list, and debug.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use zerocopy::IntoBytes;

use crate::error::{Error, Result};
use crate::messages::{Channel, HafxNominalSpectrumStatus};

/// Science + debug ports for the X-123.
#[derive(Debug, Clone, Copy)]
pub struct X123Ports {
    pub science: u16,
    pub debug: u16,
}

impl X123Ports {
    pub fn from_base(base: u16) -> Self {
        Self {
            science: base,
            debug: base + 1,
        }
    }
}

/// Science + list + debug ports for one HaFX channel.
#[derive(Debug, Clone, Copy)]
pub struct HafxPorts {
    pub science: u16,
    pub list: u16,
    pub debug: u16,
}

impl HafxPorts {
    pub fn from_base(base: u16, ch: Channel) -> Self {
        let science = base + 3 * u16::from(ch.tag());
        Self {
            science,
            list: science + 1,
            debug: science + 2,
        }
    }
}

/// One UDP datagram per `add` call, aimed at a loopback capture port.
pub struct DataSaver {
    socket: UdpSocket,
    destination: SocketAddrV4,
}

impl DataSaver {
    pub fn new(udp_port: u16) -> Result<Self> {
        // A separate socket per stream; the control socket may be busy.
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(|e| {
            Error::Recoverable(format!("cannot bind sender socket: {e}"))
        })?;
        Ok(Self {
            socket,
            destination: SocketAddrV4::new(Ipv4Addr::LOCALHOST, udp_port),
        })
    }

    pub fn add(&self, data: &[u8]) -> Result<()> {
        // One datagram per blob; UDP tops out at 64 KiB.
        if data.len() > usize::from(u16::MAX) {
            return Err(Error::Recoverable(format!(
                "cannot save blob larger than 64 KiB (dest port {})",
                self.destination.port()
            )));
        }
        self.socket.send_to(data, self.destination).map_err(|e| {
            Error::Recoverable(format!(
                "sendto {} failed: {e}",
                self.destination
            ))
        })?;
        Ok(())
    }
}

/// Batches nominal science records so each flushed datagram, and hence
/// each file the capture tool starts, begins on a second boundary.
///
/// Records are dropped until the first one carrying a time anchor shows
/// up; after that, every `num_before_save` records go out as one
/// datagram, with any overflow retained at the head of the next batch.
pub struct QueuedDataSaver {
    saver: DataSaver,
    pending: Vec<HafxNominalSpectrumStatus>,
    num_before_save: usize,
}

impl QueuedDataSaver {
    pub fn new(udp_port: u16, num_before_save: usize) -> Result<Self> {
        Ok(Self {
            saver: DataSaver::new(udp_port)?,
            pending: Vec::with_capacity(num_before_save),
            num_before_save,
        })
    }

    /// Returns `false` when the record was dropped pre-anchor.
    pub fn add(&mut self, record: &HafxNominalSpectrumStatus) -> Result<bool> {
        if self.pending.is_empty() && record.time_anchor.get() < 1 {
            return Ok(false);
        }

        self.pending.push(*record);
        if self.pending.len() >= self.num_before_save {
            self.flush()?;
        }
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        let mut blob =
            Vec::with_capacity(self.num_before_save * core::mem::size_of::<HafxNominalSpectrumStatus>());
        for record in &self.pending[..self.num_before_save] {
            blob.extend_from_slice(record.as_bytes());
        }
        self.saver.add(&blob)?;
        self.pending.drain(..self.num_before_save);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::byteorder::little_endian::U32;
    use zerocopy::FromZeros;

    fn record(anchor: u32, buffer_number: u16) -> HafxNominalSpectrumStatus {
        let mut r = HafxNominalSpectrumStatus::new_zeroed();
        r.time_anchor = U32::new(anchor);
        r.buffer_number = buffer_number.into();
        r
    }

    fn bound_receiver() -> (UdpSocket, u16) {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sock.set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();
        let port = sock.local_addr().unwrap().port();
        (sock, port)
    }

    #[test]
    fn port_maps_follow_channel_stride() {
        let p = HafxPorts::from_base(20000, Channel::C1);
        assert_eq!((p.science, p.list, p.debug), (20000, 20001, 20002));
        let p = HafxPorts::from_base(20000, Channel::X1);
        assert_eq!((p.science, p.list, p.debug), (20009, 20010, 20011));
        let x = X123Ports::from_base(19000);
        assert_eq!((x.science, x.debug), (19000, 19001));
    }

    #[test]
    fn oversized_blob_is_refused() {
        let (_recv, port) = bound_receiver();
        let saver = DataSaver::new(port).unwrap();
        let blob = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(saver.add(&blob).is_err());
    }

    #[test]
    fn records_before_first_anchor_are_dropped() {
        let (_recv, port) = bound_receiver();
        let mut q = QueuedDataSaver::new(port, 4).unwrap();
        assert!(!q.add(&record(0, 0)).unwrap());
        assert!(!q.add(&record(0, 1)).unwrap());
        // First anchored record starts the batch.
        assert!(q.add(&record(1000, 0)).unwrap());
        // Unanchored records are fine once the batch has begun.
        assert!(q.add(&record(0, 1)).unwrap());
    }

    #[test]
    fn flush_emits_one_datagram_of_batch_size() {
        let (recv, port) = bound_receiver();
        let mut q = QueuedDataSaver::new(port, 3).unwrap();
        q.add(&record(1000, 0)).unwrap();
        q.add(&record(0, 1)).unwrap();
        q.add(&record(0, 2)).unwrap();

        let mut buf = [0u8; 4096];
        let n = recv.recv(&mut buf).unwrap();
        assert_eq!(n, 3 * core::mem::size_of::<HafxNominalSpectrumStatus>());
        // First record in the datagram carries the anchor.
        assert_eq!(&buf[511..515], &[0xe8, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn each_batch_realigns_on_an_anchor() {
        let (recv, port) = bound_receiver();
        let mut q = QueuedDataSaver::new(port, 2).unwrap();
        q.add(&record(1000, 0)).unwrap();
        q.add(&record(0, 1)).unwrap(); // flush of {0, 1}

        // The queue is empty again, so an unanchored record is dropped
        // until the next second boundary comes along.
        assert!(!q.add(&record(0, 17)).unwrap());
        assert!(q.add(&record(1001, 2)).unwrap());
        q.add(&record(0, 3)).unwrap(); // flush of {2, 3}

        let mut buf = [0u8; 4096];
        let n = recv.recv(&mut buf).unwrap();
        assert_eq!(n, 2 * 516);
        let n = recv.recv(&mut buf).unwrap();
        assert_eq!(n, 2 * 516);
        // Second datagram starts with buffer number 2, not the dropped 17.
        assert_eq!(&buf[1..3], &[2, 0]);
    }
}
