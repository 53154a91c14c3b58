// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PPS edge detection on a GPIO line.
//!
//! Science collection is anchored to the pulse-per-second signal wired to
//! one pin of `gpiochip0` (Broadcom numbering, passed in at startup). A
//! wait claims the line as a rising-edge listener, polls its event fd
//! with a timeout, and releases the line again; nothing holds GPIO
//! resources between waits.

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use gpio_cdev::{Chip, EventRequestFlags, LineRequestFlags};
use nix::poll::{poll, PollFd, PollFlags};

use crate::error::{Error, Result};

const CHIP_PATH: &str = "/dev/gpiochip0";
const CONSUMER: &str = "pps-detect";

/// Confirms the GPIO chip and line are usable. Run once at startup;
/// failure here means the process cannot do its job at all.
pub fn probe(line_offset: u32) -> Result<()> {
    let mut chip = open_chip()?;
    chip.get_line(line_offset).map_err(|e| {
        Error::Recoverable(format!("cannot open GPIO pin {line_offset}: {e}"))
    })?;
    Ok(())
}

/// Blocks until a rising edge arrives on the PPS line, or `timeout`
/// passes. Returns whether an edge was seen.
pub fn await_rising_edge(line_offset: u32, timeout: Duration) -> Result<bool> {
    let mut chip = open_chip()?;
    let line = chip.get_line(line_offset).map_err(|e| {
        Error::Recoverable(format!("cannot open GPIO pin {line_offset}: {e}"))
    })?;
    let events = line
        .events(
            LineRequestFlags::INPUT,
            EventRequestFlags::RISING_EDGE,
            CONSUMER,
        )
        .map_err(|e| {
            Error::Recoverable(format!(
                "cannot request pin {line_offset} as rising edge listen: {e}"
            ))
        })?;

    let mut fds = [PollFd::new(events.as_raw_fd(), PollFlags::POLLIN)];
    let n = poll(&mut fds, timeout.as_millis() as i32).map_err(|e| {
        Error::Recoverable(format!(
            "error reading edge event on pin {line_offset}: {e}"
        ))
    })?;
    Ok(n > 0)
}

fn open_chip() -> Result<Chip> {
    Chip::new(CHIP_PATH).map_err(|e| {
        Error::Recoverable(format!("cannot open gpio chip {CHIP_PATH}: {e}"))
    })
}
