//! Module `bitbang` contains the API for "binary bit-bang" mode.
//!
//! Bit-bang root mode cannot be entered directly from an arbitrary state.
//! `BusPirate::bb_init` first resets the Bus Pirate to its terminal and then
//! sends the init byte repeatedly until the Bus Pirate answers with its root-mode
//! banner. The binary protocol modes (of which only SPI is implemented) are
//! entered from the root mode.

use crate::transport::Delimiter;
use crate::{BusPirate, Error, Mode, Result, PROTO_SPI_VERSION_MSG, PROTO_VERSION_MSG, SUCCESS};

/// Enters bit-bang root mode (from the terminal) or re-announces it.
pub const BB_INIT: u8 = 0x00;
/// Enters binary SPI mode from bit-bang root mode.
pub const BB_ENTER_SPI: u8 = 0x01;

impl BusPirate {
    /// `bb_init` moves the Bus Pirate into binary bit-bang root mode.
    pub fn bb_init(&mut self) -> Result<()> {
        self.reset()?;

        let init = vec![BB_INIT; self.config.bitbang_init_count];
        let timeout = self.config.command_timeout;
        self.transport.flush()?;
        self.transport.write(&init)?;
        self.transport.read_until(PROTO_VERSION_MSG, timeout)?;

        log::debug!("buspirate: entered bit-bang root mode");
        self.mode = Mode::BitBang;
        Ok(())
    }

    /// `bb_enter_spi` switches to binary SPI mode, passing through bit-bang
    /// root mode first if necessary.
    pub fn bb_enter_spi(&mut self) -> Result<()> {
        if self.mode != Mode::BitBang {
            self.bb_init()?;
        }

        let response = self.send_responsive_bytes(&[BB_ENTER_SPI], PROTO_SPI_VERSION_MSG.len())?;
        if !b"SPI"[..].matches(&response) {
            return Err(Error::Protocol(format!(
                "expected SPI mode banner, got {:02X?}",
                response
            )));
        }

        log::debug!("buspirate: entered binary SPI mode");
        self.mode = Mode::BitBangSpi;
        Ok(())
    }

    pub fn bb_i2c(&mut self) -> Result<()> {
        Err(Error::NotSupported("binary I2C mode"))
    }

    pub fn bb_uart(&mut self) -> Result<()> {
        Err(Error::NotSupported("binary UART mode"))
    }

    pub fn bb_1wire(&mut self) -> Result<()> {
        Err(Error::NotSupported("binary 1-Wire mode"))
    }

    pub fn bb_raw_wire(&mut self) -> Result<()> {
        Err(Error::NotSupported("binary raw-wire mode"))
    }

    pub fn bb_jtag(&mut self) -> Result<()> {
        Err(Error::NotSupported("binary JTAG mode"))
    }

    /// Sends a one-byte command and expects the success byte in return.
    pub fn simple_command(&mut self, command: u8) -> Result<()> {
        let response = self.send_responsive_bytes(&[command], 1)?;
        if response.first() == Some(&SUCCESS) {
            log::debug!("buspirate: command 0x{:02X} acknowledged", command);
            Ok(())
        } else {
            log::debug!("buspirate: command 0x{:02X} rejected with {:02X?}", command, response);
            Err(Error::Nak { command })
        }
    }

    /// Sends raw bytes without waiting for any response.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.flush()?;
        self.transport.write(bytes)?;
        Ok(())
    }

    /// Sends raw bytes and waits for exactly `response_len` bytes back.
    pub fn send_responsive_bytes(&mut self, bytes: &[u8], response_len: usize) -> Result<Vec<u8>> {
        let timeout = self.config.command_timeout;
        self.transport.flush()?;
        self.transport.write(bytes)?;
        self.transport.read_exact(response_len, timeout)
    }

    /// Sends raw bytes and collects the response up to `delimiter`.
    pub fn send_until<D: Delimiter + ?Sized>(&mut self, bytes: &[u8], delimiter: &D) -> Result<Vec<u8>> {
        let timeout = self.config.command_timeout;
        self.transport.flush()?;
        self.transport.write(bytes)?;
        self.transport.read_until(delimiter, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBusPirate, SimMode};
    use crate::test_support::{opened, pirate};

    #[test]
    fn test_bb_init() {
        let sim = SimBusPirate::new();
        let mut bp = opened(&sim);
        bp.bb_init().unwrap();
        assert_eq!(bp.mode(), Mode::BitBang);
        assert_eq!(sim.snapshot().mode, SimMode::BitBang);

        // Root mode answers a single init byte with its banner again.
        let banner = bp.send_until(&[BB_INIT], PROTO_VERSION_MSG).unwrap();
        assert_eq!(banner, b"BBIO1");
    }

    #[test]
    fn test_enter_spi() {
        let sim = SimBusPirate::new();
        let mut bp = opened(&sim);
        bp.bb_enter_spi().unwrap();
        assert_eq!(bp.mode(), Mode::BitBangSpi);
        assert_eq!(sim.snapshot().mode, SimMode::Spi);
    }

    #[test]
    fn test_enter_spi_on_closed_transport() {
        let sim = SimBusPirate::new();
        let mut bp = pirate(&sim);
        assert!(matches!(bp.bb_enter_spi(), Err(Error::Closed)));
        assert_eq!(bp.mode(), Mode::Invalid);
    }

    #[test]
    fn test_enter_spi_rejected() {
        let sim = SimBusPirate::new();
        let mut bp = opened(&sim);
        bp.bb_init().unwrap();
        sim.nak(0xFF, BB_ENTER_SPI);
        assert!(bp.bb_enter_spi().is_err());
        // The mode only moves once the Bus Pirate has confirmed the switch.
        assert_eq!(bp.mode(), Mode::BitBang);
    }

    #[test]
    fn test_simple_command_nak() {
        let sim = SimBusPirate::new();
        let mut bp = opened(&sim);
        bp.bb_init().unwrap();
        // 0x0F from root mode is a reset, which the Bus Pirate acknowledges.
        bp.simple_command(crate::reset::BB_RESET).unwrap();
        assert_eq!(sim.snapshot().mode, SimMode::Terminal);
        // In the terminal the byte is only echoed back.
        assert!(matches!(
            bp.simple_command(crate::reset::BB_RESET),
            Err(Error::Nak { command: 0x0F })
        ));
    }

    #[test]
    fn test_unimplemented_modes() {
        let sim = SimBusPirate::new();
        let mut bp = opened(&sim);
        assert!(matches!(bp.bb_i2c(), Err(Error::NotSupported(_))));
        assert!(matches!(bp.bb_uart(), Err(Error::NotSupported(_))));
        assert!(matches!(bp.bb_1wire(), Err(Error::NotSupported(_))));
        assert!(matches!(bp.bb_raw_wire(), Err(Error::NotSupported(_))));
        assert!(matches!(bp.bb_jtag(), Err(Error::NotSupported(_))));
        assert_eq!(bp.mode(), Mode::HiZ);
    }
}
