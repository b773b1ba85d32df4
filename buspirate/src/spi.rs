//! Binary SPI mode.
//!
//! `Spi` takes ownership of a `BusPirate` and drives it as an SPI master.
//! The Bus Pirate's configuration registers cannot be read back, so `Spi` keeps
//! host-side shadow copies of them. A shadow register only changes after
//! the Bus Pirate has acknowledged the command that writes it, which means a
//! failed command leaves the shadow exactly as it was.
//!
//! ```no_run
//! # use buspirate::{BusPirate, Config};
//! # use buspirate::transport::serial::SerialSettings;
//! use buspirate::spi::{ClockMode, Setup, Spi};
//!
//! # let bp = BusPirate::serial("/dev/ttyUSB0", SerialSettings::default(), Config::default());
//! let mut spi = Spi::new(bp);
//! spi.init(&Setup {
//!     mode: ClockMode::Mode3,
//!     clock_frequency: 250_000,
//!     ..Setup::default()
//! })?;
//! let status = spi.write_then_read(&[0x05], 1)?;
//! # Ok::<(), buspirate::Error>(())
//! ```

use std::borrow::Cow;

use crate::peripherals;
use crate::{BusPirate, Error, Result, SUCCESS};

pub const CMD_CS: u8 = 0b0000_0010;
pub const CMD_WRITE_THEN_READ: u8 = 0b0000_0100;
pub const CMD_BULK_TRANSFER: u8 = 0b0001_0000;
pub const CMD_SET_SPEED: u8 = 0b0110_0000;
pub const CMD_CONFIG_SPI: u8 = 0b1000_0000;

/// Largest payload of one bulk transfer frame; the length travels in the
/// low nibble of the command byte.
pub const MAX_BULK_CHUNK: usize = 16;
/// Limit on both lengths of a write-then-read command.
pub const MAX_WRITE_THEN_READ: usize = 4096;

/// `Speed` is one of the Bus Pirate's fixed SPI clock rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Speed {
    KHz30,
    KHz125,
    KHz250,
    MHz1,
    MHz2,
    MHz2_6,
    MHz4,
    MHz8,
}

impl Speed {
    /// Every rate, slowest first. The index of each entry is its speed code.
    pub const ALL: [Speed; 8] = [
        Speed::KHz30,
        Speed::KHz125,
        Speed::KHz250,
        Speed::MHz1,
        Speed::MHz2,
        Speed::MHz2_6,
        Speed::MHz4,
        Speed::MHz8,
    ];

    pub fn hz(self) -> u32 {
        match self {
            Speed::KHz30 => 30_000,
            Speed::KHz125 => 125_000,
            Speed::KHz250 => 250_000,
            Speed::MHz1 => 1_000_000,
            Speed::MHz2 => 2_000_000,
            Speed::MHz2_6 => 2_600_000,
            Speed::MHz4 => 4_000_000,
            Speed::MHz8 => 8_000_000,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Speed> {
        Self::ALL.get(code as usize).copied()
    }

    /// The rate closest to `hz`. When two rates are equally close the lower
    /// one wins.
    pub fn nearest(hz: u32) -> Speed {
        let mut best = Speed::KHz30;
        for speed in Self::ALL {
            if speed.hz().abs_diff(hz) < best.hz().abs_diff(hz) {
                best = speed;
            }
        }
        best
    }

    pub(crate) fn command_byte(self) -> u8 {
        CMD_SET_SPEED | self.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutput {
    HiZ,
    V3_3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockPolarity {
    IdleLow,
    IdleHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEdge {
    IdleToActive,
    ActiveToIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTime {
    Middle,
    End,
}

/// `Config` is the Bus Pirate's SPI configuration register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub pin_output: PinOutput,
    pub clock_polarity: ClockPolarity,
    pub clock_edge: ClockEdge,
    pub sample_time: SampleTime,
}

/// The SPI configuration the Bus Pirate starts with when it enters SPI mode.
pub const DEFAULT_CONFIG: Config = Config {
    pin_output: PinOutput::HiZ,
    clock_polarity: ClockPolarity::IdleLow,
    clock_edge: ClockEdge::ActiveToIdle,
    sample_time: SampleTime::Middle,
};

impl Config {
    pub(crate) fn command_byte(&self) -> u8 {
        let mut cmd = CMD_CONFIG_SPI;
        cmd |= (match self.pin_output {
            PinOutput::HiZ => 0,
            PinOutput::V3_3 => 1,
        }) << 3;
        cmd |= (match self.clock_polarity {
            ClockPolarity::IdleLow => 0,
            ClockPolarity::IdleHigh => 1,
        }) << 2;
        cmd |= (match self.clock_edge {
            ClockEdge::IdleToActive => 0,
            ClockEdge::ActiveToIdle => 1,
        }) << 1;
        cmd |= match self.sample_time {
            SampleTime::Middle => 0,
            SampleTime::End => 1,
        };
        cmd
    }
}

/// `ClockMode` is the conventional SPI mode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    #[default]
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

impl ClockMode {
    pub fn polarity(self) -> ClockPolarity {
        match self {
            ClockMode::Mode0 | ClockMode::Mode1 => ClockPolarity::IdleLow,
            ClockMode::Mode2 | ClockMode::Mode3 => ClockPolarity::IdleHigh,
        }
    }

    pub fn edge(self) -> ClockEdge {
        match self {
            ClockMode::Mode0 | ClockMode::Mode2 => ClockEdge::ActiveToIdle,
            ClockMode::Mode1 | ClockMode::Mode3 => ClockEdge::IdleToActive,
        }
    }
}

/// `ChipSelectMode` controls what bulk transfers do with chip select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChipSelectMode {
    /// Chip select is only moved by `set_chip_select`.
    Manual,
    /// Asserted for the whole transfer.
    #[default]
    AutoAfterTransfer,
    /// Asserted for the whole transfer and pulsed high between frames.
    AutoBetweenTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitOrder {
    #[default]
    MsbFirst,
    LsbFirst,
}

/// `ClockMatch` compares the clock the Bus Pirate runs at with the one requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMatch {
    Equal,
    Less,
    Greater,
}

impl ClockMatch {
    fn classify(requested: u32, achieved: u32, tolerance: u32) -> Self {
        if achieved.abs_diff(requested) <= tolerance {
            ClockMatch::Equal
        } else if achieved < requested {
            ClockMatch::Less
        } else {
            ClockMatch::Greater
        }
    }
}

/// `Setup` is what `Spi::init` programs into the Bus Pirate.
///
/// The Bus Pirate's SPI pins are fixed, so there is nothing to choose there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    pub mode: ClockMode,
    pub clock_frequency: u32,
    /// Only MSB-first is supported by the Bus Pirate.
    pub bit_order: BitOrder,
    pub chip_select_mode: ChipSelectMode,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            mode: ClockMode::Mode0,
            clock_frequency: 1_000_000,
            bit_order: BitOrder::MsbFirst,
            chip_select_mode: ChipSelectMode::AutoAfterTransfer,
        }
    }
}

/// Host-side copies of the Bus Pirate's write-only registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowRegisters {
    pub peripherals: peripherals::Config,
    pub spi: Config,
    pub chip_select: Level,
    pub speed: Speed,
}

impl Default for ShadowRegisters {
    /// The state the Bus Pirate is in right after entering SPI mode.
    fn default() -> Self {
        Self {
            peripherals: peripherals::Config::default(),
            spi: DEFAULT_CONFIG,
            chip_select: Level::High,
            speed: Speed::KHz30,
        }
    }
}

/// `Packet` is one bulk transaction: the bytes to shift out and the bytes
/// shifted in so far.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    pub command: u8,
    pub tx: Cow<'a, [u8]>,
    pub rx: Vec<u8>,
}

impl<'a> Packet<'a> {
    pub fn bulk(tx: impl Into<Cow<'a, [u8]>>) -> Self {
        let tx = tx.into();
        Self {
            command: CMD_BULK_TRANSFER,
            rx: Vec::with_capacity(tx.len()),
            tx,
        }
    }
}

/// `Spi` is a Bus Pirate used as an SPI master.
///
/// Nothing except `init`, `deinit` and the local accessors works until
/// `init` has succeeded.
pub struct Spi {
    bp: BusPirate,
    shadow: ShadowRegisters,
    cs_mode: ChipSelectMode,
    initialized: bool,
}

impl Spi {
    pub fn new(bp: BusPirate) -> Self {
        Self {
            bp,
            shadow: ShadowRegisters::default(),
            cs_mode: ChipSelectMode::default(),
            initialized: false,
        }
    }

    /// `init` enters binary SPI mode and programs the whole configuration.
    ///
    /// The supplies are switched on and the pins are driven at 3.3V. The
    /// pull-ups are always switched off: with no external pull voltage they
    /// couple MOSI into MISO. Fails with `ClockTooFast` if the nearest
    /// supported clock is above `setup.clock_frequency`.
    pub fn init(&mut self, setup: &Setup) -> Result<()> {
        self.initialized = false;
        self.bp.bb_enter_spi()?;
        self.shadow = ShadowRegisters::default();

        if setup.bit_order == BitOrder::LsbFirst {
            log::warn!("buspirate: LSB-first bit order is not supported, using MSB-first");
        }
        self.cs_mode = setup.chip_select_mode;

        self.write_peripherals(|p| p.power_supply = true)?;
        self.write_spi_config(|c| c.pin_output = PinOutput::V3_3)?;
        self.write_peripherals(|p| p.pull_ups = false)?;
        self.write_peripherals(|p| p.cs = true)?;
        self.write_chip_select(Level::High)?;
        self.write_spi_config(|c| c.clock_polarity = setup.mode.polarity())?;
        self.write_spi_config(|c| c.clock_edge = setup.mode.edge())?;

        if self.write_clock(setup.clock_frequency, 0)? == ClockMatch::Greater {
            return Err(Error::ClockTooFast {
                requested: setup.clock_frequency,
                selected: self.shadow.speed.hz(),
            });
        }

        log::debug!(
            "buspirate: SPI ready, {:?} at {} Hz",
            setup.mode,
            self.shadow.speed.hz()
        );
        self.initialized = true;
        Ok(())
    }

    /// Returns the Bus Pirate to its terminal.
    pub fn deinit(&mut self) -> Result<()> {
        self.initialized = false;
        self.bp.reset()
    }

    pub fn cfg_power_supplies(&mut self, on: bool) -> Result<()> {
        self.ensure_initialized()?;
        self.write_peripherals(|p| p.power_supply = on)
    }

    pub fn cfg_pullups(&mut self, on: bool) -> Result<()> {
        self.ensure_initialized()?;
        self.write_peripherals(|p| p.pull_ups = on)
    }

    pub fn cfg_aux_pin(&mut self, high: bool) -> Result<()> {
        self.ensure_initialized()?;
        self.write_peripherals(|p| p.aux = high)
    }

    pub fn cfg_chip_select(&mut self, enabled: bool) -> Result<()> {
        self.ensure_initialized()?;
        self.write_peripherals(|p| p.cs = enabled)
    }

    pub fn cfg_spi_pin_out(&mut self, output: PinOutput) -> Result<()> {
        self.ensure_initialized()?;
        self.write_spi_config(|c| c.pin_output = output)
    }

    pub fn cfg_spi_clk_idle(&mut self, polarity: ClockPolarity) -> Result<()> {
        self.ensure_initialized()?;
        self.write_spi_config(|c| c.clock_polarity = polarity)
    }

    pub fn cfg_spi_clk_edge(&mut self, edge: ClockEdge) -> Result<()> {
        self.ensure_initialized()?;
        self.write_spi_config(|c| c.clock_edge = edge)
    }

    pub fn cfg_spi_sample_time(&mut self, sample_time: SampleTime) -> Result<()> {
        self.ensure_initialized()?;
        self.write_spi_config(|c| c.sample_time = sample_time)
    }

    pub fn set_chip_select(&mut self, level: Level) -> Result<()> {
        self.ensure_initialized()?;
        self.write_chip_select(level)
    }

    /// Changes how later bulk transfers drive chip select. Local only.
    pub fn set_chip_select_control_mode(&mut self, mode: ChipSelectMode) {
        self.cs_mode = mode;
    }

    pub fn chip_select_control_mode(&self) -> ChipSelectMode {
        self.cs_mode
    }

    /// Selects the supported clock nearest to `hz`.
    ///
    /// The result is `Equal` when the selected clock is within `tolerance`
    /// of `hz`.
    pub fn set_clock_frequency(&mut self, hz: u32, tolerance: u32) -> Result<ClockMatch> {
        if hz == 0 {
            return Err(Error::Request("clock frequency must be non-zero".into()));
        }
        self.ensure_initialized()?;
        self.write_clock(hz, tolerance)
    }

    /// Clock rate recorded in the shadow speed register.
    pub fn get_clock_frequency(&self) -> u32 {
        self.shadow.speed.hz()
    }

    /// Shifts `data` out and ignores what comes back.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        check_len(data.len())?;
        self.ensure_initialized()?;
        let mut packet = Packet::bulk(data);
        self.bulk_transfer(&mut packet)
    }

    /// Fills `buf` with bytes clocked in while shifting out zeros.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;
        self.ensure_initialized()?;
        let mut packet = Packet::bulk(vec![0u8; buf.len()]);
        self.bulk_transfer(&mut packet)?;
        buf.copy_from_slice(&packet.rx);
        Ok(())
    }

    /// Full-duplex transfer of `tx` into `rx`. Both must be the same length.
    pub fn read_write_bytes(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        check_len(tx.len())?;
        if rx.len() != tx.len() {
            return Err(Error::Request(format!(
                "read buffer holds {} bytes but {} are written",
                rx.len(),
                tx.len()
            )));
        }
        self.ensure_initialized()?;
        let mut packet = Packet::bulk(tx);
        self.bulk_transfer(&mut packet)?;
        rx.copy_from_slice(&packet.rx);
        Ok(())
    }

    /// Full-duplex transfer that replaces `words` with the bytes read.
    pub fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<()> {
        check_len(words.len())?;
        self.ensure_initialized()?;
        let rx = {
            let mut packet = Packet::bulk(&words[..]);
            self.bulk_transfer(&mut packet)?;
            packet.rx
        };
        words.copy_from_slice(&rx);
        Ok(())
    }

    /// Writes `tx` then reads `read_len` bytes in a single Bus Pirate command.
    ///
    /// The Bus Pirate drives chip select itself for this command, regardless of
    /// the chip select control mode.
    pub fn write_then_read(&mut self, tx: &[u8], read_len: usize) -> Result<Vec<u8>> {
        if tx.len() > MAX_WRITE_THEN_READ || read_len > MAX_WRITE_THEN_READ {
            return Err(Error::Request(format!(
                "write-then-read is limited to {} bytes each way",
                MAX_WRITE_THEN_READ
            )));
        }
        if tx.is_empty() && read_len == 0 {
            return Err(Error::Request("nothing to write or read".into()));
        }
        self.ensure_initialized()?;

        let mut frame = Vec::with_capacity(5 + tx.len());
        frame.push(CMD_WRITE_THEN_READ);
        frame.extend_from_slice(&(tx.len() as u16).to_be_bytes());
        frame.extend_from_slice(&(read_len as u16).to_be_bytes());
        frame.extend_from_slice(tx);

        let ack = self.bp.send_responsive_bytes(&frame, 1)?;
        if ack.first() != Some(&SUCCESS) {
            return Err(Error::Nak {
                command: CMD_WRITE_THEN_READ,
            });
        }
        let timeout = self.bp.config().command_timeout;
        self.bp.transport_mut().read_exact(read_len, timeout)
    }

    /// Runs `packet` as a series of bulk frames, appending what the Bus Pirate
    /// clocks in to `packet.rx`.
    ///
    /// Unless chip select is manual it is asserted for the duration. If a
    /// frame fails the transfer stops and chip select is released; the bytes
    /// of the frames that did complete stay in `packet.rx`.
    pub fn bulk_transfer(&mut self, packet: &mut Packet<'_>) -> Result<()> {
        check_len(packet.tx.len())?;
        self.ensure_initialized()?;

        if self.cs_mode == ChipSelectMode::Manual {
            return self.transfer_chunks(packet);
        }

        self.write_chip_select(Level::Low)?;
        match self.transfer_chunks(packet) {
            Ok(()) => self.write_chip_select(Level::High),
            Err(e) => {
                if let Err(release) = self.write_chip_select(Level::High) {
                    log::warn!(
                        "buspirate: failed to release chip select after aborted transfer: {}",
                        release
                    );
                }
                Err(e)
            }
        }
    }

    fn transfer_chunks(&mut self, packet: &mut Packet<'_>) -> Result<()> {
        let timeout = self.bp.config().command_timeout;
        for (i, chunk) in packet.tx.chunks(MAX_BULK_CHUNK).enumerate() {
            if i > 0 && self.cs_mode == ChipSelectMode::AutoBetweenTransfer {
                self.write_chip_select(Level::High)?;
                self.write_chip_select(Level::Low)?;
            }

            self.bp.simple_command(packet.command | (chunk.len() - 1) as u8)?;
            let transport = self.bp.transport_mut();
            transport.write(chunk)?;
            let rx = transport.read_exact(chunk.len(), timeout)?;
            packet.rx.extend_from_slice(&rx);
        }
        log::debug!(
            "buspirate: transferred {} bytes in {} frames",
            packet.tx.len(),
            packet.tx.len().div_ceil(MAX_BULK_CHUNK)
        );
        Ok(())
    }

    /// Copy of the shadow registers.
    pub fn shadow(&self) -> ShadowRegisters {
        self.shadow
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn device(&self) -> &BusPirate {
        &self.bp
    }

    pub fn device_mut(&mut self) -> &mut BusPirate {
        &mut self.bp
    }

    /// Gives the `BusPirate` back, in whatever mode it is in.
    pub fn into_inner(self) -> BusPirate {
        self.bp
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn write_peripherals(&mut self, update: impl FnOnce(&mut peripherals::Config)) -> Result<()> {
        let mut next = self.shadow.peripherals;
        update(&mut next);
        self.bp.simple_command(next.command_byte())?;
        self.shadow.peripherals = next;
        Ok(())
    }

    fn write_spi_config(&mut self, update: impl FnOnce(&mut Config)) -> Result<()> {
        let mut next = self.shadow.spi;
        update(&mut next);
        self.bp.simple_command(next.command_byte())?;
        self.shadow.spi = next;
        Ok(())
    }

    fn write_chip_select(&mut self, level: Level) -> Result<()> {
        let cmd = match level {
            Level::Low => CMD_CS,
            Level::High => CMD_CS | 1,
        };
        self.bp.simple_command(cmd)?;
        self.shadow.chip_select = level;
        Ok(())
    }

    fn write_clock(&mut self, hz: u32, tolerance: u32) -> Result<ClockMatch> {
        let speed = Speed::nearest(hz);
        self.bp.simple_command(speed.command_byte())?;
        self.shadow.speed = speed;

        let matched = ClockMatch::classify(hz, speed.hz(), tolerance);
        log::debug!(
            "buspirate: requested {} Hz, running at {} Hz ({:?})",
            hz,
            speed.hz(),
            matched
        );
        Ok(matched)
    }
}

fn check_len(len: usize) -> Result<()> {
    if len == 0 {
        Err(Error::Request("transfer length must be non-zero".into()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBusPirate, SimMode};
    use crate::test_support::opened;
    use crate::Mode;

    fn spi(sim: &SimBusPirate) -> Spi {
        let mut spi = Spi::new(opened(sim));
        spi.init(&Setup::default()).unwrap();
        spi
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(DEFAULT_CONFIG.command_byte(), 0b1000_0010);
        let config = Config {
            pin_output: PinOutput::V3_3,
            clock_polarity: ClockPolarity::IdleHigh,
            clock_edge: ClockEdge::IdleToActive,
            sample_time: SampleTime::End,
        };
        assert_eq!(config.command_byte(), 0b1000_1101);
        assert_eq!(Speed::MHz8.command_byte(), 0x67);
        assert_eq!(Speed::from_code(5), Some(Speed::MHz2_6));
        assert_eq!(Speed::from_code(8), None);
    }

    #[test]
    fn test_nearest_speed() {
        assert_eq!(Speed::nearest(0), Speed::KHz30);
        assert_eq!(Speed::nearest(u32::MAX), Speed::MHz8);
        // Equidistant requests resolve to the lower rate.
        assert_eq!(Speed::nearest(2_300_000), Speed::MHz2);
        assert_eq!(Speed::nearest(77_500), Speed::KHz30);
    }

    #[test]
    fn test_init_and_deinit() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);
        assert!(spi.is_initialized());
        assert_eq!(spi.device().mode(), Mode::BitBangSpi);

        let snapshot = sim.snapshot();
        assert_eq!(snapshot.mode, SimMode::Spi);
        assert_eq!(snapshot.peripherals, 0b1001);
        assert_eq!(snapshot.spi_config, 0b1010);
        assert!(snapshot.cs_high);
        assert_eq!(snapshot.speed, Speed::MHz1.code());

        let shadow = spi.shadow();
        assert!(shadow.peripherals.power_supply);
        assert!(!shadow.peripherals.pull_ups);
        assert_eq!(shadow.spi.pin_output, PinOutput::V3_3);
        assert_eq!(shadow.chip_select, Level::High);
        assert_eq!(spi.get_clock_frequency(), 1_000_000);

        spi.deinit().unwrap();
        assert!(!spi.is_initialized());
        assert_eq!(spi.device().mode(), Mode::HiZ);
        assert_eq!(sim.snapshot().mode, SimMode::Terminal);
        assert!(matches!(spi.write_bytes(&[1]), Err(Error::NotInitialized)));

        // A second session on the same Bus Pirate.
        spi.init(&Setup::default()).unwrap();
        assert!(spi.is_initialized());
    }

    #[test]
    fn test_clock_modes() {
        for (mode, config) in [
            (ClockMode::Mode0, 0b1010),
            (ClockMode::Mode1, 0b1000),
            (ClockMode::Mode2, 0b1110),
            (ClockMode::Mode3, 0b1100),
        ] {
            let sim = SimBusPirate::new();
            let mut spi = Spi::new(opened(&sim));
            spi.init(&Setup {
                mode,
                ..Setup::default()
            })
            .unwrap();
            assert_eq!(sim.snapshot().spi_config, config, "{:?}", mode);
        }
    }

    #[test]
    fn test_init_refuses_faster_clock() {
        let sim = SimBusPirate::new();
        let mut spi = Spi::new(opened(&sim));
        let setup = Setup {
            clock_frequency: 100_000,
            ..Setup::default()
        };
        match spi.init(&setup) {
            Err(Error::ClockTooFast {
                requested,
                selected,
            }) => {
                assert_eq!(requested, 100_000);
                assert_eq!(selected, 125_000);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!spi.is_initialized());

        let setup = Setup {
            clock_frequency: 127_000,
            bit_order: BitOrder::LsbFirst,
            ..Setup::default()
        };
        spi.init(&setup).unwrap();
        assert_eq!(spi.get_clock_frequency(), 125_000);
    }

    #[test]
    fn test_exact_clocks() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);
        for speed in Speed::ALL {
            assert_eq!(spi.set_clock_frequency(speed.hz(), 0).unwrap(), ClockMatch::Equal);
            assert_eq!(spi.get_clock_frequency(), speed.hz());
            assert_eq!(sim.snapshot().speed, speed.code());
        }
    }

    #[test]
    fn test_imprecise_clocks() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);
        for (requested, selected, matched) in [
            (10_000, 30_000, ClockMatch::Greater),
            (35_000, 30_000, ClockMatch::Less),
            (100_000, 125_000, ClockMatch::Greater),
            (127_000, 125_000, ClockMatch::Less),
            (900_000, 1_000_000, ClockMatch::Greater),
            (1_100_000, 1_000_000, ClockMatch::Less),
            (7_500_000, 8_000_000, ClockMatch::Greater),
            (8_100_000, 8_000_000, ClockMatch::Less),
            (2_300_000, 2_000_000, ClockMatch::Greater),
        ] {
            assert_eq!(spi.set_clock_frequency(requested, 0).unwrap(), matched, "{}", requested);
            assert_eq!(spi.get_clock_frequency(), selected, "{}", requested);
        }
    }

    #[test]
    fn test_clock_tolerance() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);
        assert_eq!(spi.set_clock_frequency(127_000, 2_000).unwrap(), ClockMatch::Equal);
        assert_eq!(spi.set_clock_frequency(127_000, 1_999).unwrap(), ClockMatch::Less);
        assert!(matches!(spi.set_clock_frequency(0, 0), Err(Error::Request(_))));
    }

    #[test]
    fn test_nak_leaves_shadow_unchanged() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);
        let before = spi.shadow();

        sim.nak(0xF8, CMD_SET_SPEED);
        assert!(matches!(
            spi.set_clock_frequency(8_000_000, 0),
            Err(Error::Nak { command: 0x67 })
        ));
        assert_eq!(spi.get_clock_frequency(), 1_000_000);

        sim.nak(0xFE, CMD_CS);
        assert!(spi.set_chip_select(Level::Low).is_err());

        sim.nak(0xF0, peripherals::CMD_CONFIG_PERIPHERALS);
        assert!(spi.cfg_pullups(true).is_err());
        assert!(spi.cfg_aux_pin(true).is_err());

        sim.nak(0xF0, CMD_CONFIG_SPI);
        assert!(spi.cfg_spi_sample_time(SampleTime::End).is_err());

        assert_eq!(spi.shadow(), before);
        assert!(sim.snapshot().cs_high);
    }

    #[test]
    fn test_config_operations() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);

        spi.cfg_aux_pin(true).unwrap();
        assert_eq!(sim.snapshot().peripherals, 0b1011);
        spi.cfg_pullups(true).unwrap();
        spi.cfg_power_supplies(false).unwrap();
        spi.cfg_chip_select(false).unwrap();
        assert_eq!(sim.snapshot().peripherals, 0b0110);

        spi.cfg_spi_sample_time(SampleTime::End).unwrap();
        spi.cfg_spi_clk_idle(ClockPolarity::IdleHigh).unwrap();
        spi.cfg_spi_clk_edge(ClockEdge::IdleToActive).unwrap();
        spi.cfg_spi_pin_out(PinOutput::HiZ).unwrap();
        assert_eq!(sim.snapshot().spi_config, 0b0101);
        assert_eq!(spi.shadow().spi.sample_time, SampleTime::End);

        spi.set_chip_select(Level::Low).unwrap();
        assert!(!sim.snapshot().cs_high);
        assert_eq!(spi.shadow().chip_select, Level::Low);
    }

    #[test]
    fn test_loopback_chunking() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);

        for (len, frames) in [(1, 1), (16, 1), (17, 2), (50, 4), (500, 32)] {
            let tx = pattern(len);
            let mut rx = vec![0u8; len];
            let before = sim.snapshot().bulk_frames;
            spi.read_write_bytes(&tx, &mut rx).unwrap();
            assert_eq!(rx, tx, "len {}", len);
            assert_eq!(sim.snapshot().bulk_frames - before, frames, "len {}", len);
        }
    }

    #[test]
    fn test_read_and_write_helpers() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);

        let mut buf = [0xAAu8; 20];
        spi.read_bytes(&mut buf).unwrap();
        assert_eq!(buf, [0u8; 20]);

        spi.write_bytes(&pattern(40)).unwrap();

        let mut words = pattern(33);
        spi.transfer_in_place(&mut words).unwrap();
        assert_eq!(words, pattern(33));

        let mut packet = Packet::bulk(vec![1, 2, 3]);
        spi.bulk_transfer(&mut packet).unwrap();
        assert_eq!(packet.rx, [1, 2, 3]);
    }

    #[test]
    fn test_chip_select_modes() {
        let data = pattern(50);
        for (mode, writes) in [
            (ChipSelectMode::Manual, 0),
            (ChipSelectMode::AutoAfterTransfer, 2),
            (ChipSelectMode::AutoBetweenTransfer, 8),
        ] {
            let sim = SimBusPirate::new();
            let mut spi = spi(&sim);
            spi.set_chip_select_control_mode(mode);
            let before = sim.snapshot().cs_writes;
            spi.write_bytes(&data).unwrap();
            let snapshot = sim.snapshot();
            assert_eq!(snapshot.cs_writes - before, writes, "{:?}", mode);
            assert!(snapshot.cs_high);
        }
    }

    #[test]
    fn test_bulk_nak_releases_chip_select() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);
        sim.nak(0xF0, CMD_BULK_TRANSFER);

        let mut packet = Packet::bulk(pattern(20));
        assert!(matches!(
            spi.bulk_transfer(&mut packet),
            Err(Error::Nak { command: 0x1F })
        ));
        assert!(packet.rx.is_empty());
        assert!(sim.snapshot().cs_high);
        assert_eq!(spi.shadow().chip_select, Level::High);
    }

    #[test]
    fn test_aborted_transfer_keeps_completed_frames() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);
        // 20 bytes go out as a 16-byte frame and then a 4-byte frame (0x13).
        sim.nak(0xFF, CMD_BULK_TRANSFER | 3);

        let tx = pattern(20);
        let mut packet = Packet::bulk(&tx[..]);
        assert!(matches!(
            spi.bulk_transfer(&mut packet),
            Err(Error::Nak { command: 0x13 })
        ));
        assert_eq!(packet.rx, tx[..16]);
        assert!(sim.snapshot().cs_high);
        assert_eq!(spi.shadow().chip_select, Level::High);
    }

    #[test]
    fn test_write_then_read() {
        let sim = SimBusPirate::new();
        let mut spi = spi(&sim);
        assert_eq!(spi.write_then_read(&[0x9F], 3).unwrap(), [0xFF; 3]);
        assert_eq!(spi.write_then_read(&[], 2).unwrap(), [0xFF; 2]);
        assert!(spi.write_then_read(&[0x06], 0).unwrap().is_empty());

        assert!(matches!(
            spi.write_then_read(&[0; MAX_WRITE_THEN_READ + 1], 0),
            Err(Error::Request(_))
        ));
        assert!(matches!(spi.write_then_read(&[], 0), Err(Error::Request(_))));
    }

    #[test]
    fn test_invalid_requests() {
        let sim = SimBusPirate::new();
        let mut spi = Spi::new(opened(&sim));

        // Arguments are checked before the initialization state.
        assert!(matches!(spi.write_bytes(&[]), Err(Error::Request(_))));
        assert!(matches!(spi.read_bytes(&mut []), Err(Error::Request(_))));
        assert!(matches!(spi.set_chip_select(Level::Low), Err(Error::NotInitialized)));
        assert!(matches!(spi.cfg_pullups(false), Err(Error::NotInitialized)));
        assert!(matches!(
            spi.read_write_bytes(&[1, 2], &mut [0; 2]),
            Err(Error::NotInitialized)
        ));

        spi.init(&Setup::default()).unwrap();
        assert!(matches!(
            spi.read_write_bytes(&[1, 2], &mut [0; 3]),
            Err(Error::Request(_))
        ));
        assert!(matches!(spi.transfer_in_place(&mut []), Err(Error::Request(_))));
    }
}
