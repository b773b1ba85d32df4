//! Bus Pirate client library
//!
//! This library drives a [Bus Pirate](http://dangerousprototypes.com/docs/Bus_Pirate)
//! over its USB serial port, allowing Rust programs on a general-purpose
//! computer to act as an SPI master through the Bus Pirate. The implemented
//! protocol is that of the Bus Pirate v3.x firmware.
//!
//! The library is layered:
//!
//! - [`transport::Transport`] turns a serial port into timeout-bounded
//!   request/response exchanges.
//! - [`BusPirate`] tracks which operating [`Mode`] the Bus Pirate is in, recovers
//!   it from an unknown state with a cascading reset, parses its identity
//!   banner and moves it between terminal and binary modes.
//! - [`spi::Spi`] maps SPI transactions onto the Bus Pirate's binary SPI protocol,
//!   keeping host-side shadow copies of the Bus Pirate's configuration registers.
//!
//! ```no_run
//! use buspirate::spi::{Setup, Spi};
//! use buspirate::transport::serial::SerialSettings;
//! use buspirate::{BusPirate, Config};
//!
//! let mut bp = BusPirate::serial("/dev/ttyUSB0", SerialSettings::default(), Config::default());
//! bp.open()?;
//! println!("firmware {}", bp.device_info().map_or("?", |i| i.firmware_version.as_str()));
//!
//! let mut spi = Spi::new(bp);
//! spi.init(&Setup::default())?;
//! let mut id = [0u8; 4];
//! spi.read_write_bytes(&[0x9F, 0, 0, 0], &mut id)?;
//! spi.deinit()?;
//! # Ok::<(), buspirate::Error>(())
//! ```
//!
//! None of the types here are safe to share between threads. Callers must
//! serialize every call into a `BusPirate` or `Spi`; only one command is ever
//! in flight.

pub mod bitbang;
pub mod hiz;
pub mod info;
pub mod peripherals;
pub mod reset;
pub mod sim;
pub mod spi;
pub mod transport;

use std::thread;
use std::time::Duration;

pub use info::DeviceInfo;
pub use transport::Transport;

const PROTO_VERSION_MSG: &[u8; 5] = b"BBIO1";
const PROTO_SPI_VERSION_MSG: &[u8; 4] = b"SPI1";

/// Single-byte acknowledgement for an accepted bit-bang command.
pub const SUCCESS: u8 = 0x01;

/// Terminal command that prints the identity banner.
const INFO_COMMAND: &str = "i";

/// `Mode` is the operating mode the Bus Pirate is known to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normal terminal mode, high-impedance outputs.
    HiZ,
    /// Binary bit-bang root mode, the gateway to the binary protocol modes.
    BitBang,
    BitBangSpi,
    BitBangI2c,
    BitBangUart,
    BitBang1Wire,
    BitBangRawWire,
    BitBangJtag,
    /// Not known: closed, never connected, or a reset failed.
    Invalid,
}

/// Protocol timing and retry knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bound on every terminal or bit-bang response.
    pub command_timeout: Duration,
    /// Identity queries tried by `connect` before giving up.
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    /// Bare newlines sent to reach a fresh prompt before a terminal reset.
    pub ping_count: usize,
    /// Repetitions of the bit-bang init byte needed to leave the terminal.
    pub bitbang_init_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(500),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(500),
            ping_count: 3,
            bitbang_init_count: 20,
        }
    }
}

/// `Error` represents communication errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The serial port could not be opened.
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// The underlying serial link rejected a write.
    #[error("serial write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The underlying serial link failed while reading.
    #[error("serial read failed: {0}")]
    Read(#[source] std::io::Error),

    /// The operation needs an open transport.
    #[error("transport is not open")]
    Closed,

    /// No complete response arrived before the deadline.
    #[error("timed out waiting for the Bus Pirate")]
    Timeout,

    /// The Bus Pirate sent something other than the expected banner or reply.
    #[error("protocol mismatch: {0}")]
    Protocol(String),

    /// A bit-bang command was answered with something other than `SUCCESS`.
    #[error("command 0x{command:02X} was not acknowledged")]
    Nak { command: u8 },

    /// The caller provided invalid arguments that could not be checked at
    /// compile time.
    #[error("invalid request: {0}")]
    Request(String),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The SPI engine has not been initialized.
    #[error("SPI mode is not initialized")]
    NotInitialized,

    /// The nearest supported SPI clock is faster than requested.
    #[error("nearest supported clock {selected} Hz exceeds requested {requested} Hz")]
    ClockTooFast { requested: u32, selected: u32 },
}

impl Error {
    /// Whether this error means the connection itself failed.
    ///
    /// Recovery loops give up immediately on these and treat everything else
    /// as a failed step.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Open { .. } | Error::Write(_) | Error::Read(_) | Error::Closed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// `BusPirate` represents one Bus Pirate device and the mode it is in.
///
/// Every mode transition is only recorded after the Bus Pirate confirmed it, so
/// `mode()` never reports a mode that was merely attempted.
pub struct BusPirate {
    transport: Transport,
    config: Config,
    mode: Mode,
    info: Option<DeviceInfo>,
}

impl BusPirate {
    /// `BusPirate::new` associates a (usually still closed) transport with a
    /// new `BusPirate` object.
    pub fn new(transport: Transport, config: Config) -> Self {
        Self {
            transport,
            config,
            mode: Mode::Invalid,
            info: None,
        }
    }

    /// Convenience constructor for a Bus Pirate on a local serial port.
    pub fn serial(path: &str, settings: transport::serial::SerialSettings, config: Config) -> Self {
        Self::new(Transport::serial(path, settings), config)
    }

    /// Opens the transport and brings the Bus Pirate into terminal mode.
    ///
    /// On failure the transport is closed again.
    pub fn open(&mut self) -> Result<()> {
        self.transport.open()?;
        if let Err(e) = self.connect() {
            self.close();
            return Err(e);
        }
        self.mode = Mode::HiZ;
        Ok(())
    }

    /// Closes the transport. The mode becomes `Invalid`.
    pub fn close(&mut self) {
        self.transport.close();
        self.invalidate();
    }

    /// Resets the Bus Pirate and waits for a trustworthy identity banner.
    ///
    /// The identity query is retried because the host receive buffer may
    /// still hold bytes from an earlier session; the Bus Pirate's own reply is the
    /// only reliable synchronization point.
    pub fn connect(&mut self) -> Result<()> {
        self.reset()?;

        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.get_info() {
                Ok(info) if info.valid => {
                    log::info!(
                        "buspirate: connected to hardware {} firmware {} bootloader {} ({})",
                        info.hardware_version,
                        info.firmware_version,
                        info.bootloader_version,
                        info.mcu
                    );
                    self.info = Some(info);
                    self.mode = Mode::HiZ;
                    return Ok(());
                }
                Ok(_) => log::warn!(
                    "buspirate: identity query {}/{} returned an unrecognised banner",
                    attempt,
                    attempts
                ),
                Err(e) if e.is_connection_error() => {
                    self.invalidate();
                    return Err(e);
                }
                Err(e) => log::warn!(
                    "buspirate: identity query {}/{} failed: {}",
                    attempt,
                    attempts,
                    e
                ),
            }
            if attempt < attempts {
                thread::sleep(self.config.connect_retry_delay);
            }
        }

        self.info = None;
        Err(Error::Protocol(format!(
            "no valid identity banner after {} attempts",
            attempts
        )))
    }

    /// Queries and parses the identity banner.
    ///
    /// Always produces a fresh snapshot; check `DeviceInfo::valid` before
    /// trusting any of it.
    pub fn get_info(&mut self) -> Result<DeviceInfo> {
        let banner = self.send_responsive_command(INFO_COMMAND)?;
        Ok(DeviceInfo::parse(&banner))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Identity from the most recent successful `connect`.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn invalidate(&mut self) {
        self.mode = Mode::Invalid;
        self.info = None;
    }
}
