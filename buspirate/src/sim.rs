//! An in-memory Bus Pirate.
//!
//! `SimBusPirate` emulates enough of the v3.x firmware to run the whole
//! stack without hardware: the terminal with echo, `#` and `i`, bit-bang
//! root mode, and binary SPI mode with its MISO line wired back to MOSI. It
//! is a `Connector`, so it plugs into a `Transport` in place of a serial
//! port. The emulated device keeps its state when the link is reopened,
//! the same way a real Bus Pirate does.
//!
//! Clones share the same device, which lets a test keep a handle for
//! inspection and fault injection after handing one to a transport.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::transport::{Connector, Link};
use crate::{Error, Result};

const SIM_NAME: &str = "sim://buspirate";

/// How long an idle read waits for output before reporting a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

const INIT_ZEROS: usize = 20;
const MAX_WRITE_THEN_READ: usize = 4096;

/// Identity printed by `i`.
pub const DEFAULT_BANNER: &str = "Bus Pirate v3.5\r\n\
Firmware v5.10 (r559)  Bootloader v4.4\r\n\
DEVID:0x0447 REVID:0x3046 (24FJ64GA002 B8)\r\n\
http://dangerousprototypes.com";

/// What the emulated firmware prints for `i` while it is told to misbehave.
const CORRUPT_BANNER: &str = "Bus Pir\u{FFFD}\u{FFFD}e v3.5\r\nFirmw";

/// `SimMode` is the firmware mode the emulated Bus Pirate is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    Terminal,
    BitBang,
    Spi,
    /// Not a firmware mode: every byte written comes straight back.
    Loopback,
}

/// Emulated register state, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSnapshot {
    pub mode: SimMode,
    /// Low nibble of the last accepted peripheral command.
    pub peripherals: u8,
    /// Low nibble of the last accepted SPI configuration command.
    pub spi_config: u8,
    pub cs_high: bool,
    pub speed: u8,
    /// Number of accepted bulk transfer frames.
    pub bulk_frames: usize,
    /// Number of accepted chip-select commands.
    pub cs_writes: usize,
    /// Number of times the link was opened.
    pub opens: usize,
}

enum Pending {
    Idle,
    Bulk(usize),
    WriteThenReadHeader(Vec<u8>),
    WriteThenReadData { remaining: usize, read_len: usize },
}

struct Firmware {
    mode: SimMode,
    banner: String,
    output: VecDeque<u8>,
    line: Vec<u8>,
    zeros: usize,
    pending: Pending,
    peripherals: u8,
    spi_config: u8,
    cs_high: bool,
    speed: u8,
    bulk_frames: usize,
    cs_writes: usize,
    opens: usize,
    naks: Vec<(u8, u8)>,
    corrupt_info: usize,
    silent: bool,
    refuse_open: bool,
}

impl Firmware {
    fn new() -> Self {
        Self {
            mode: SimMode::Terminal,
            banner: DEFAULT_BANNER.to_string(),
            output: VecDeque::new(),
            line: Vec::new(),
            zeros: 0,
            pending: Pending::Idle,
            peripherals: 0,
            spi_config: 0b0010,
            cs_high: true,
            speed: 0,
            bulk_frames: 0,
            cs_writes: 0,
            opens: 0,
            naks: Vec::new(),
            corrupt_info: 0,
            silent: false,
            refuse_open: false,
        }
    }

    fn enter(&mut self, mode: SimMode) {
        self.mode = mode;
        self.pending = Pending::Idle;
        self.line.clear();
        self.zeros = 0;
        if mode != SimMode::Spi {
            return;
        }
        self.peripherals = 0;
        self.spi_config = 0b0010;
        self.cs_high = true;
        self.speed = 0;
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
    }

    fn ack(&mut self, ok: bool) {
        self.output.push_back(if ok { 0x01 } else { 0x00 });
    }

    fn is_nak(&self, byte: u8) -> bool {
        self.naks.iter().any(|&(mask, value)| byte & mask == value)
    }

    fn receive(&mut self, byte: u8) {
        if self.silent {
            return;
        }
        match self.mode {
            SimMode::Terminal => self.terminal(byte),
            SimMode::BitBang => self.bitbang(byte),
            SimMode::Spi => self.spi(byte),
            SimMode::Loopback => self.output.push_back(byte),
        }
    }

    fn terminal(&mut self, byte: u8) {
        if byte == 0x00 {
            self.zeros += 1;
            if self.zeros >= INIT_ZEROS {
                self.enter(SimMode::BitBang);
                self.emit(b"BBIO1");
            }
            return;
        }
        self.zeros = 0;

        match byte {
            b'\r' => {}
            b'\n' => {
                let line = mem::take(&mut self.line);
                let command = String::from_utf8_lossy(&line).trim().to_string();
                let reply = self.terminal_command(&command);
                self.emit(b"\r\n");
                for line in reply {
                    self.emit(line.as_bytes());
                    self.emit(b"\r\n");
                }
                self.emit(b"HiZ>");
            }
            _ => {
                self.line.push(byte);
                self.output.push_back(byte);
            }
        }
    }

    fn terminal_command(&mut self, command: &str) -> Vec<String> {
        match command {
            "" => Vec::new(),
            "#" => {
                let mut lines = vec!["RESET".to_string(), String::new()];
                lines.extend(self.banner.split("\r\n").map(String::from));
                lines
            }
            "i" if self.corrupt_info > 0 => {
                self.corrupt_info -= 1;
                CORRUPT_BANNER.split("\r\n").map(String::from).collect()
            }
            "i" => self.banner.split("\r\n").map(String::from).collect(),
            _ => vec!["Syntax error, type ? for help".to_string()],
        }
    }

    fn bitbang(&mut self, byte: u8) {
        if self.is_nak(byte) {
            self.ack(false);
            return;
        }
        match byte {
            0x00 => self.emit(b"BBIO1"),
            0x01 => {
                self.enter(SimMode::Spi);
                self.emit(b"SPI1");
            }
            0x0F => {
                self.enter(SimMode::Terminal);
                self.ack(true);
            }
            // Other binary modes are not emulated.
            _ => {}
        }
    }

    fn spi(&mut self, byte: u8) {
        match mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => {}
            Pending::Bulk(remaining) => {
                self.output.push_back(byte);
                if remaining > 1 {
                    self.pending = Pending::Bulk(remaining - 1);
                }
                return;
            }
            Pending::WriteThenReadHeader(mut header) => {
                header.push(byte);
                if header.len() < 4 {
                    self.pending = Pending::WriteThenReadHeader(header);
                    return;
                }
                let write_len = u16::from_be_bytes([header[0], header[1]]) as usize;
                let read_len = u16::from_be_bytes([header[2], header[3]]) as usize;
                if write_len > MAX_WRITE_THEN_READ
                    || read_len > MAX_WRITE_THEN_READ
                    || write_len + read_len == 0
                {
                    self.ack(false);
                } else if write_len == 0 {
                    self.finish_write_then_read(read_len);
                } else {
                    self.pending = Pending::WriteThenReadData {
                        remaining: write_len,
                        read_len,
                    };
                }
                return;
            }
            Pending::WriteThenReadData {
                remaining,
                read_len,
            } => {
                if remaining > 1 {
                    self.pending = Pending::WriteThenReadData {
                        remaining: remaining - 1,
                        read_len,
                    };
                } else {
                    self.finish_write_then_read(read_len);
                }
                return;
            }
        }

        if self.is_nak(byte) {
            self.ack(false);
            return;
        }
        match byte {
            0x00 => {
                self.enter(SimMode::BitBang);
                self.emit(b"BBIO1");
            }
            0x01 => self.emit(b"SPI1"),
            0x02 | 0x03 => {
                self.cs_high = byte & 1 == 1;
                self.cs_writes += 1;
                self.ack(true);
            }
            0x04 => self.pending = Pending::WriteThenReadHeader(Vec::with_capacity(4)),
            0x10..=0x1F => {
                self.bulk_frames += 1;
                self.ack(true);
                self.pending = Pending::Bulk((byte & 0x0F) as usize + 1);
            }
            0x40..=0x4F => {
                self.peripherals = byte & 0x0F;
                self.ack(true);
            }
            0x60..=0x67 => {
                self.speed = byte & 0x07;
                self.ack(true);
            }
            0x80..=0x8F => {
                self.spi_config = byte & 0x0F;
                self.ack(true);
            }
            _ => self.ack(false),
        }
    }

    /// Nothing drives MISO during the read phase, so it reads back high.
    fn finish_write_then_read(&mut self, read_len: usize) {
        self.ack(true);
        self.output.extend(std::iter::repeat(0xFF).take(read_len));
    }
}

struct Shared {
    firmware: Mutex<Firmware>,
    readable: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Firmware> {
        self.firmware.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `SimBusPirate` is a handle to one emulated Bus Pirate.
#[derive(Clone)]
pub struct SimBusPirate {
    shared: Arc<Shared>,
}

impl Default for SimBusPirate {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBusPirate {
    /// A Bus Pirate sitting at its terminal prompt.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                firmware: Mutex::new(Firmware::new()),
                readable: Condvar::new(),
            }),
        }
    }

    /// Starts the device in `mode` instead, as if left there by an earlier
    /// session.
    pub fn in_mode(self, mode: SimMode) -> Self {
        self.shared.lock().enter(mode);
        self
    }

    /// Replaces the identity banner printed by `i` and `#`.
    pub fn with_banner(self, banner: &str) -> Self {
        self.shared.lock().banner = banner.to_string();
        self
    }

    /// Makes the device answer every binary command byte with
    /// `byte & mask == value` with a failure byte instead of acting on it.
    pub fn nak(&self, mask: u8, value: u8) {
        self.shared.lock().naks.push((mask, value));
    }

    pub fn clear_naks(&self) {
        self.shared.lock().naks.clear();
    }

    /// Garbles the next `count` replies to `i`.
    pub fn corrupt_info_replies(&self, count: usize) {
        self.shared.lock().corrupt_info = count;
    }

    /// A silent device swallows all input.
    pub fn set_silent(&self, silent: bool) {
        self.shared.lock().silent = silent;
    }

    pub fn refuse_open(&self, refuse: bool) {
        self.shared.lock().refuse_open = refuse;
    }

    /// Queues stray bytes as if the device had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        self.shared.lock().emit(bytes);
        self.shared.readable.notify_all();
    }

    pub fn snapshot(&self) -> SimSnapshot {
        let fw = self.shared.lock();
        SimSnapshot {
            mode: fw.mode,
            peripherals: fw.peripherals,
            spi_config: fw.spi_config,
            cs_high: fw.cs_high,
            speed: fw.speed,
            bulk_frames: fw.bulk_frames,
            cs_writes: fw.cs_writes,
            opens: fw.opens,
        }
    }
}

impl Connector for SimBusPirate {
    fn connect(&mut self) -> Result<Box<dyn Link>> {
        let mut fw = self.shared.lock();
        if fw.refuse_open {
            return Err(Error::Open {
                port: SIM_NAME.to_string(),
                source: serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    "simulated Bus Pirate is unplugged",
                ),
            });
        }
        fw.opens += 1;
        fw.output.clear();
        Ok(Box::new(SimLink {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn name(&self) -> &str {
        SIM_NAME
    }
}

struct SimLink {
    shared: Arc<Shared>,
}

impl Link for SimLink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut fw = self.shared.lock();
        for &byte in bytes {
            fw.receive(byte);
        }
        if !fw.output.is_empty() {
            self.shared.readable.notify_all();
        }
        Ok(())
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.shared.lock().output.clear();
        Ok(())
    }

    fn split_reader(&mut self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(SimReader {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct SimReader {
    shared: Arc<Shared>,
}

impl Read for SimReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fw = self.shared.lock();
        let (mut fw, _) = self
            .shared
            .readable
            .wait_timeout_while(fw, POLL_INTERVAL, |p| p.output.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        if fw.output.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data from simulated Bus Pirate"));
        }

        let n = buf.len().min(fw.output.len());
        for (slot, byte) in buf.iter_mut().zip(fw.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
